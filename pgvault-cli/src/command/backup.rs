//! The `backup` command.

use std::time::Duration;

use pgvault::backup::{cmd_backup, BackupConfig, BUNDLE_LIMIT_DEFAULT, BUNDLE_SIZE_DEFAULT};
use pgvault::info::BackupType;
use pgvault::pg::DbClient;

use super::ExitResult;
use crate::{args, runner};

/// Back up the cluster to the repository.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for backup"))]
pub struct Backup {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub pg: args::PgPathArgs,

    #[clap(flatten)]
    pub connect: args::PgConnectArgs,

    #[clap(flatten)]
    pub lock: args::LockPathArgs,

    #[clap(flatten)]
    pub compress: args::CompressArgs,

    #[clap(flatten)]
    pub process: args::ProcessArgs,

    #[clap(flatten)]
    pub timeouts: args::TimeoutArgs,

    /// Backup type: full, diff, or incr.
    #[clap(long = "type", default_value = "incr", value_name = "TYPE", display_order = 100)]
    pub backup_type: String,

    /// Request an immediate checkpoint at backup start.
    #[clap(long = "start-fast", env = "PGVAULT_START_FAST", display_order = 101)]
    pub start_fast: bool,

    /// Stop a prior stuck backup before starting (pre-9.6 clusters).
    #[clap(long = "stop-auto", env = "PGVAULT_STOP_AUTO", display_order = 102)]
    pub stop_auto: bool,

    /// Verify WAL reaches the archive before declaring the backup
    /// consistent.
    #[clap(
        long = "archive-check",
        env = "PGVAULT_ARCHIVE_CHECK",
        default_value = "true",
        action = clap::ArgAction::Set,
        value_name = "BOOL",
        display_order = 103
    )]
    pub archive_check: bool,

    /// Copy files from a standby, coordinating start/stop on the primary.
    #[clap(long = "backup-standby", env = "PGVAULT_BACKUP_STANDBY", display_order = 104)]
    pub backup_standby: bool,

    /// Host of the standby used with --backup-standby.
    #[clap(long = "standby-host", env = "PGVAULT_STANDBY_HOST", display_order = 105)]
    pub standby_host: Option<String>,

    /// Port of the standby used with --backup-standby.
    #[clap(
        long = "standby-port",
        env = "PGVAULT_STANDBY_PORT",
        default_value = "5432",
        display_order = 106
    )]
    pub standby_port: u16,

    /// Bundle small files into larger repository objects.
    #[clap(long = "bundle", env = "PGVAULT_BUNDLE", display_order = 107)]
    pub bundle: bool,

    /// Record block-incremental references against the prior backup.
    #[clap(long = "block", env = "PGVAULT_BLOCK", display_order = 108)]
    pub block: bool,

    /// Skip the automatic expire after a successful backup.
    #[clap(long = "no-expire-auto", display_order = 109)]
    pub no_expire_auto: bool,

    /// Number of full backups to retain.
    #[clap(long = "repo1-retention-full", env = "PGVAULT_REPO1_RETENTION_FULL", display_order = 110)]
    pub retention_full: Option<usize>,

    /// Number of differential backups to retain.
    #[clap(long = "repo1-retention-diff", env = "PGVAULT_REPO1_RETENTION_DIFF", display_order = 111)]
    pub retention_diff: Option<usize>,

    /// Number of backups to retain WAL for.
    #[clap(
        long = "repo1-retention-archive",
        env = "PGVAULT_REPO1_RETENTION_ARCHIVE",
        display_order = 112
    )]
    pub retention_archive: Option<usize>,
}

impl Backup {
    pub fn invoke(self) -> ExitResult {
        runner::stop_gate(&self.lock, Some(&self.stanza.stanza))?;
        let backup_type: BackupType = self.backup_type.parse()?;
        let cfg = BackupConfig {
            stanza: self.stanza.stanza.clone(),
            pg_path: self.pg.pg_path.clone(),
            lock_path: self.lock.lock_path.clone(),
            repo: runner::repo(&self.stanza, &self.repo),
            backup_type,
            compress_type: runner::parse_compress(&self.compress)?,
            compress_level: self.compress.compress_level,
            process_max: self.process.process_max,
            start_fast: self.start_fast,
            stop_auto: self.stop_auto,
            archive_check: self.archive_check,
            archive_timeout: Duration::from_secs(self.timeouts.archive_timeout),
            db_timeout: Duration::from_secs(self.timeouts.db_timeout),
            protocol_timeout: Duration::from_secs(self.timeouts.effective_protocol_timeout()),
            backup_standby: self.backup_standby,
            bundle: self.bundle,
            bundle_limit: BUNDLE_LIMIT_DEFAULT,
            bundle_size: BUNDLE_SIZE_DEFAULT,
            block_incr: self.block,
            expire_auto: !self.no_expire_auto,
            retention_full: self.retention_full,
            retention_diff: self.retention_diff,
            retention_archive: self.retention_archive,
        };

        let mut primary = runner::db_client(&self.pg, &self.connect)?;
        let mut standby = match (&self.standby_host, self.backup_standby) {
            (Some(host), true) => {
                let connect = args::PgConnectArgs {
                    pg_host: host.clone(),
                    pg_port: self.standby_port,
                    pg_user: self.connect.pg_user.clone(),
                    pg_database: self.connect.pg_database.clone(),
                };
                Some(runner::db_client(&self.pg, &connect)?)
            }
            _ => None,
        };

        let summary = cmd_backup(
            &cfg,
            &mut primary,
            standby.as_mut().map(|s| s as &mut dyn DbClient),
        )?;
        log::info!(
            "{} backup '{}' completed: {} files, {} bytes ({} in repo)",
            summary.backup_type,
            summary.label,
            summary.files_total,
            summary.size,
            summary.size_repo
        );
        runner::success()
    }
}
