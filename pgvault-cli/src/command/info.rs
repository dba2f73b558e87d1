//! The `info` command: summarize the stanza's backups.

use serde_json::json;

use super::ExitResult;
use crate::{args, runner};

#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for info"))]
pub struct Info {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    /// Output format: text or json.
    #[clap(long = "output", default_value = "text", value_name = "FORMAT", display_order = 100)]
    pub output: String,
}

impl Info {
    pub fn invoke(self) -> ExitResult {
        let repo = runner::repo(&self.stanza, &self.repo);
        let archive = repo.load_archive_info()?;
        let backup = repo.load_backup_info()?;
        let current = backup.history.current();

        if self.output == "json" {
            let value = json!({
                "stanza": self.stanza.stanza,
                "archive-id": archive.archive_id(),
                "db": {
                    "version": current.version.to_string(),
                    "system-id": current.system_id,
                },
                "backups": backup
                    .backups()
                    .iter()
                    .map(|record| {
                        json!({
                            "label": record.label,
                            "type": record.backup_type.as_str(),
                            "prior": record.prior,
                            "timestamp-start": record.timestamp_start,
                            "timestamp-stop": record.timestamp_stop,
                            "archive-start": record.archive_start,
                            "archive-stop": record.archive_stop,
                            "size": record.size,
                            "repo-size": record.size_repo,
                        })
                    })
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&value).expect("valid json"));
            return runner::success();
        }

        let term = console::Term::stdout();
        let _ = term.write_line(&format!("stanza: {}", self.stanza.stanza));
        let _ = term.write_line(&format!(
            "    db: PostgreSQL {} (system-id {})",
            current.version, current.system_id
        ));
        let _ = term.write_line(&format!("    archive: {}", archive.archive_id()));
        if backup.backups().is_empty() {
            let _ = term.write_line("    no backups");
        }
        for record in backup.backups() {
            let _ = term.write_line(&format!(
                "    {} backup: {}",
                record.backup_type, record.label
            ));
            let _ = term.write_line(&format!(
                "        wal start/stop: {} / {}",
                record.archive_start, record.archive_stop
            ));
            let _ = term.write_line(&format!(
                "        size: {} bytes, repo {} bytes",
                record.size, record.size_repo
            ));
            if !record.reference.is_empty() {
                let _ = term.write_line(&format!(
                    "        references: {}",
                    record.reference.join(", ")
                ));
            }
        }
        runner::success()
    }
}
