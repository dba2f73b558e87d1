//! The `check` command: verify the stanza's configuration end to end,
//! info files against the live cluster and then archiving reachability.

use std::time::Duration;

use pgvault::error::Error;
use pgvault::pg::{DbClient, PgControl};
use pgvault::storage::Storage;
use pgvault::wait::Wait;

use super::ExitResult;
use crate::{args, runner};

#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for check"))]
pub struct Check {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub pg: args::PgPathArgs,

    #[clap(flatten)]
    pub connect: args::PgConnectArgs,

    #[clap(flatten)]
    pub timeouts: args::TimeoutArgs,

    /// Print a report of the checks performed.
    #[clap(long = "report", display_order = 100)]
    pub report: bool,
}

impl Check {
    pub fn invoke(self) -> ExitResult {
        let repo = runner::repo(&self.stanza, &self.repo);
        let control = PgControl::read(&Storage::posix(&self.pg.pg_path))?;

        let archive = repo.load_archive_info()?;
        archive.check_pg(control.version, control.system_id)?;
        let backup = repo.load_backup_info()?;
        backup.check_pg(
            control.version,
            control.system_id,
            control.catalog_version,
            control.control_version,
        )?;
        if self.report {
            log::info!("info files for stanza '{}' are valid", self.stanza.stanza);
        }

        // Force a segment switch and wait for it to arrive in the
        // archive; proves archive_command round-trips.
        let mut db = runner::db_client(&self.pg, &self.connect)?;
        db.session_init("pgvault [check]")?;
        if db.is_in_recovery()? {
            log::info!("cluster is a standby; skipping the archive write check");
            return runner::success();
        }
        db.create_restore_point("pgvault check")?;
        let segment = db.wal_segment_current()?;
        db.switch_wal()?;

        let archive_id = archive.archive_id();
        let mut wait = Wait::new(Duration::from_secs(self.timeouts.archive_timeout));
        loop {
            if !pgvault::archive::segment_find(&repo, &archive_id, &segment)?.is_empty() {
                log::info!(
                    "WAL segment '{segment}' successfully archived to repo{}",
                    repo.index
                );
                return runner::success();
            }
            if !wait.more() {
                return Err(Error::ArchiveTimeout(format!(
                    "WAL segment '{segment}' was not archived before the {}s timeout\nHINT: \
                     is archive_command configured?\nHINT: is the PostgreSQL server running?",
                    self.timeouts.archive_timeout
                )));
            }
        }
    }
}
