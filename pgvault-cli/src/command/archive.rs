//! The `archive-push` and `archive-get` commands, invoked by the server
//! through `archive_command` and `restore_command`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use pgvault::archive::{cmd_archive_get, cmd_archive_push, ArchiveConfig, ArchiveGetResult};

use super::ExitResult;
use crate::{args, runner};

#[derive(clap::Args, Debug, Clone)]
pub struct ArchiveArgs {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub pg: args::PgPathArgs,

    #[clap(flatten)]
    pub lock: args::LockPathArgs,

    #[clap(flatten)]
    pub compress: args::CompressArgs,

    #[clap(flatten)]
    pub process: args::ProcessArgs,

    #[clap(flatten)]
    pub timeouts: args::TimeoutArgs,

    /// Push/get WAL asynchronously through the spool queue.
    #[clap(long = "archive-async", env = "PGVAULT_ARCHIVE_ASYNC", display_order = 80)]
    pub archive_async: bool,

    /// Local staging directory for asynchronous archiving.
    #[clap(
        long = "spool-path",
        env = "PGVAULT_SPOOL_PATH",
        value_name = "PATH",
        default_value = "/var/spool/pgvault",
        display_order = 81
    )]
    pub spool_path: PathBuf,

    /// Ceiling (bytes) on the spool queue.
    #[clap(
        long = "archive-queue-max",
        env = "PGVAULT_ARCHIVE_QUEUE_MAX",
        default_value = "134217728",
        value_name = "BYTES",
        display_order = 82
    )]
    pub archive_queue_max: u64,
}

impl ArchiveArgs {
    fn config(&self) -> Result<ArchiveConfig, pgvault::error::Error> {
        Ok(ArchiveConfig {
            stanza: self.stanza.stanza.clone(),
            pg_path: self.pg.pg_path.clone(),
            spool_path: self.spool_path.clone(),
            lock_path: self.lock.lock_path.clone(),
            repos: vec![runner::repo(&self.stanza, &self.repo)],
            compress_type: runner::parse_compress(&self.compress)?,
            compress_level: self.compress.compress_level,
            archive_async: self.archive_async,
            archive_timeout: Duration::from_secs(self.timeouts.archive_timeout),
            protocol_timeout: Duration::from_secs(self.timeouts.effective_protocol_timeout()),
            queue_max: self.archive_queue_max,
            process_max: self.process.process_max,
        })
    }
}

/// Push a WAL file to the archive (PostgreSQL `archive_command`).
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for archive-push"))]
pub struct ArchivePush {
    #[clap(flatten)]
    pub archive: ArchiveArgs,

    /// The WAL file to push, as passed by the server (`%p`).
    #[clap(value_name = "WAL_PATH")]
    pub wal_path: String,
}

impl ArchivePush {
    pub fn invoke(self) -> ExitResult {
        runner::stop_gate(&self.archive.lock, Some(&self.archive.stanza.stanza))?;
        let message = cmd_archive_push(&self.archive.config()?, &self.wal_path)?;
        log::info!("{message}");
        runner::success()
    }
}

/// Fetch a WAL file from the archive (PostgreSQL `restore_command`).
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for archive-get"))]
pub struct ArchiveGet {
    #[clap(flatten)]
    pub archive: ArchiveArgs,

    /// The WAL file to fetch (`%f`).
    #[clap(value_name = "WAL_FILE")]
    pub wal_file: String,

    /// Destination path (`%p`).
    #[clap(value_name = "DESTINATION")]
    pub destination: String,
}

impl ArchiveGet {
    pub fn invoke(self) -> ExitResult {
        runner::stop_gate(&self.archive.lock, Some(&self.archive.stanza.stanza))?;
        match cmd_archive_get(&self.archive.config()?, &self.wal_file, &self.destination)? {
            ArchiveGetResult::Found(file) => {
                log::info!("found {file} in the archive");
                runner::success()
            }
            ArchiveGetResult::NotFound => {
                // Recovery probes past the end of archived WAL; a
                // nonzero-but-benign exit tells the server to stop asking.
                log::info!("unable to find {} in the archive", self.wal_file);
                Ok(ExitCode::from(1))
            }
        }
    }
}
