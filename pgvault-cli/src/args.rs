//! Shared argument groups. Every option can also come from a
//! `PGVAULT_*` environment variable; command-line values win.

use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct StanzaArgs {
    /// The stanza (named cluster configuration) to operate on.
    #[clap(
        long = "stanza",
        env = "PGVAULT_STANZA",
        value_name = "NAME",
        display_order = 1
    )]
    pub stanza: String,
}

#[derive(Args, Debug, Clone)]
pub struct RepoArgs {
    /// Path of the backup repository.
    #[clap(
        long = "repo-path",
        env = "PGVAULT_REPO_PATH",
        value_name = "PATH",
        display_order = 10
    )]
    pub repo_path: PathBuf,

    /// Repository passphrase; enables encryption of everything stored.
    #[clap(
        long = "repo-cipher-pass",
        env = "PGVAULT_REPO_CIPHER_PASS",
        value_name = "PASS",
        hide_env_values = true,
        display_order = 11
    )]
    pub repo_cipher_pass: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PgPathArgs {
    /// The PostgreSQL data directory.
    #[clap(
        long = "pg-path",
        env = "PGVAULT_PG_PATH",
        value_name = "PATH",
        display_order = 20
    )]
    pub pg_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct PgConnectArgs {
    /// Host (or socket directory) of the cluster.
    #[clap(long = "pg-host", env = "PGVAULT_PG_HOST", default_value = "/var/run/postgresql", display_order = 30)]
    pub pg_host: String,

    /// Port of the cluster.
    #[clap(long = "pg-port", env = "PGVAULT_PG_PORT", default_value = "5432", display_order = 31)]
    pub pg_port: u16,

    /// User to connect as.
    #[clap(long = "pg-user", env = "PGVAULT_PG_USER", default_value = "postgres", display_order = 32)]
    pub pg_user: String,

    /// Database to connect to.
    #[clap(
        long = "pg-database",
        env = "PGVAULT_PG_DATABASE",
        default_value = "postgres",
        display_order = 33
    )]
    pub pg_database: String,
}

impl PgConnectArgs {
    pub fn conninfo(&self) -> String {
        format!(
            "host={} port={} user={} dbname={} application_name=pgvault",
            self.pg_host, self.pg_port, self.pg_user, self.pg_database
        )
    }
}

#[derive(Args, Debug, Clone)]
pub struct LockPathArgs {
    /// Directory holding lock and stop files.
    #[clap(
        long = "lock-path",
        env = "PGVAULT_LOCK_PATH",
        value_name = "PATH",
        default_value = "/tmp/pgvault",
        display_order = 40
    )]
    pub lock_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Worker processes for parallel transfer.
    #[clap(
        long = "process-max",
        env = "PGVAULT_PROCESS_MAX",
        default_value = "1",
        value_name = "N",
        display_order = 50
    )]
    pub process_max: usize,
}

#[derive(Args, Debug, Clone)]
pub struct CompressArgs {
    /// Compression type for repository files (gz or zst); omit for none.
    #[clap(
        long = "compress-type",
        env = "PGVAULT_COMPRESS_TYPE",
        value_name = "TYPE",
        display_order = 60
    )]
    pub compress_type: Option<String>,

    /// Compression level; defaults per type.
    #[clap(
        long = "compress-level",
        env = "PGVAULT_COMPRESS_LEVEL",
        value_name = "LEVEL",
        display_order = 61
    )]
    pub compress_level: Option<i32>,
}

#[derive(Args, Debug, Clone)]
pub struct TimeoutArgs {
    /// Seconds to wait for WAL archiving operations.
    #[clap(
        long = "archive-timeout",
        env = "PGVAULT_ARCHIVE_TIMEOUT",
        default_value = "60",
        value_name = "SECONDS",
        display_order = 70
    )]
    pub archive_timeout: u64,

    /// Seconds to wait for database statements.
    #[clap(
        long = "db-timeout",
        env = "PGVAULT_DB_TIMEOUT",
        default_value = "1800",
        value_name = "SECONDS",
        display_order = 71
    )]
    pub db_timeout: u64,

    /// Seconds to wait for protocol operations; must exceed db-timeout.
    #[clap(
        long = "protocol-timeout",
        env = "PGVAULT_PROTOCOL_TIMEOUT",
        default_value = "1830",
        value_name = "SECONDS",
        display_order = 72
    )]
    pub protocol_timeout: u64,
}

impl TimeoutArgs {
    /// `protocol-timeout` must be strictly greater than `db-timeout`;
    /// auto-fix by adding 30 seconds, with a warning.
    pub fn effective_protocol_timeout(&self) -> u64 {
        if self.protocol_timeout > self.db_timeout {
            self.protocol_timeout
        } else {
            let fixed = self.db_timeout + 30;
            log::warn!(
                "protocol-timeout ({}) must be greater than db-timeout ({}); using {fixed}",
                self.protocol_timeout,
                self.db_timeout
            );
            fixed
        }
    }
}
