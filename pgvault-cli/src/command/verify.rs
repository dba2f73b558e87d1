//! The `verify` and `expire` commands.

use std::process::ExitCode;

use pgvault::expire::{cmd_expire, ExpireConfig};
use pgvault::verify::{cmd_verify, VerifyConfig};

use super::ExitResult;
use crate::{args, runner};

/// Audit the repository: WAL ranges, backup manifests, and checksums.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for verify"))]
pub struct Verify {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub process: args::ProcessArgs,

    #[clap(flatten)]
    pub timeouts: args::TimeoutArgs,

    /// Verify with a single worker.
    #[clap(long = "fast", display_order = 100)]
    pub fast: bool,

    /// Verify only this backup set.
    #[clap(long = "set", value_name = "LABEL", display_order = 101)]
    pub set: Option<String>,

    /// Output format: text or json.
    #[clap(long = "output", default_value = "text", value_name = "FORMAT", display_order = 102)]
    pub output: String,

    /// WAL segment size assumed when reconstructing ranges.
    #[clap(
        long = "wal-segment-size",
        default_value = "16777216",
        value_name = "BYTES",
        display_order = 103
    )]
    pub wal_segment_size: u32,
}

impl Verify {
    pub fn invoke(self) -> ExitResult {
        let cfg = VerifyConfig {
            repo: runner::repo(&self.stanza, &self.repo),
            process_max: if self.fast { 1 } else { self.process.process_max },
            set: self.set.clone(),
            wal_segment_size: self.wal_segment_size,
            protocol_timeout: std::time::Duration::from_secs(
                self.timeouts.effective_protocol_timeout(),
            ),
        };
        let result = cmd_verify(&cfg)?;

        if self.output == "json" {
            println!("{}", serde_json::to_string_pretty(&result.to_json()).expect("valid json"));
        } else {
            let term = console::Term::stdout();
            for archive in &result.archive {
                let _ = term.write_line(&format!(
                    "archive {}: {} checked, {} valid, {} missing, {} checksum-invalid, {} \
                     size-invalid, {} other",
                    archive.archive_id,
                    archive.total,
                    archive.valid,
                    archive.missing,
                    archive.checksum_invalid,
                    archive.size_invalid,
                    archive.other
                ));
                for range in &archive.ranges {
                    let _ = term.write_line(&format!(
                        "  range {} .. {}{}",
                        range.start,
                        range.stop,
                        if range.invalid.is_empty() {
                            String::new()
                        } else {
                            format!(" ({} invalid)", range.invalid.len())
                        }
                    ));
                }
            }
            for backup in &result.backups {
                let _ = term.write_line(&format!(
                    "backup {}: {:?}, {} files checked, {} invalid",
                    backup.label, backup.status, backup.files_checked, backup.files_invalid
                ));
            }
            let _ = term.write_line(&format!("total errors: {}", result.errors));
        }

        if result.errors > 0 {
            Ok(ExitCode::FAILURE)
        } else {
            runner::success()
        }
    }
}

/// Expire backups and archive past the retention settings.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for expire"))]
pub struct Expire {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub lock: args::LockPathArgs,

    /// Number of full backups to retain.
    #[clap(long = "repo1-retention-full", env = "PGVAULT_REPO1_RETENTION_FULL", display_order = 100)]
    pub retention_full: Option<usize>,

    /// Number of differential backups to retain.
    #[clap(long = "repo1-retention-diff", env = "PGVAULT_REPO1_RETENTION_DIFF", display_order = 101)]
    pub retention_diff: Option<usize>,

    /// Number of backups to retain WAL for.
    #[clap(
        long = "repo1-retention-archive",
        env = "PGVAULT_REPO1_RETENTION_ARCHIVE",
        display_order = 102
    )]
    pub retention_archive: Option<usize>,
}

impl Expire {
    pub fn invoke(self) -> ExitResult {
        runner::stop_gate(&self.lock, Some(&self.stanza.stanza))?;
        let _lock = pgvault::lock::acquire(
            &self.lock.lock_path,
            &self.stanza.stanza,
            pgvault::lock::LockType::Backup,
        )?;
        let cfg = ExpireConfig {
            repo: runner::repo(&self.stanza, &self.repo),
            retention_full: self.retention_full,
            retention_diff: self.retention_diff,
            retention_archive: self.retention_archive,
        };
        let expired = cmd_expire(&cfg)?;
        log::info!("expire completed: {} backup(s) removed", expired.len());
        runner::success()
    }
}
