//! Shared command plumbing: repository construction, database clients,
//! stop-file gates, and exit-code mapping.

use std::process::ExitCode;

use pgvault::error::{Error, Result};
use pgvault::pg::{PgControl, PgPostgresClient};
use pgvault::repo::Repo;
use pgvault::storage::Storage;

use crate::args;

/// Commands resolve to an exit code; errors map to their kind's code in
/// `main`.
pub(crate) type ExitResult = Result<ExitCode, Error>;

pub(crate) fn success() -> ExitResult {
    Ok(ExitCode::SUCCESS)
}

/// Build the repository handle for a command.
pub(crate) fn repo(stanza: &args::StanzaArgs, repo: &args::RepoArgs) -> Repo {
    Repo::new(1, &repo.repo_path, &stanza.stanza, repo.repo_cipher_pass.clone())
}

/// Refuse to run when a stop file blocks the stanza.
pub(crate) fn stop_gate(lock: &args::LockPathArgs, stanza: Option<&str>) -> Result<()> {
    pgvault::lock::stop_check(&lock.lock_path, stanza)
}

/// Connect to the cluster, reading `pg_control` first for the version.
pub(crate) fn db_client(
    pg_path: &args::PgPathArgs,
    connect: &args::PgConnectArgs,
) -> Result<PgPostgresClient> {
    let control = PgControl::read(&Storage::posix(&pg_path.pg_path))?;
    PgPostgresClient::connect(&connect.conninfo(), control.version)
}

pub(crate) fn parse_compress(
    compress: &args::CompressArgs,
) -> Result<Option<pgvault::filter::CompressType>> {
    compress
        .compress_type
        .as_deref()
        .map(str::parse)
        .transpose()
}
