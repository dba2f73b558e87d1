//! The `stanza-create`, `stanza-upgrade`, and `stanza-delete` commands.

use pgvault::stanza::{cmd_stanza_create, cmd_stanza_delete, cmd_stanza_upgrade, StanzaConfig};

use super::ExitResult;
use crate::{args, runner};

#[derive(clap::Args, Debug, Clone)]
pub struct StanzaShared {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub pg: args::PgPathArgs,

    #[clap(flatten)]
    pub lock: args::LockPathArgs,
}

impl StanzaShared {
    fn config(&self) -> StanzaConfig {
        StanzaConfig {
            stanza: self.stanza.stanza.clone(),
            pg_path: self.pg.pg_path.clone(),
            lock_path: self.lock.lock_path.clone(),
            repos: vec![runner::repo(&self.stanza, &self.repo)],
        }
    }
}

/// Create the stanza in the repository.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for stanza-create"))]
pub struct StanzaCreate {
    #[clap(flatten)]
    pub shared: StanzaShared,
}

impl StanzaCreate {
    pub fn invoke(self) -> ExitResult {
        runner::stop_gate(&self.shared.lock, Some(&self.shared.stanza.stanza))?;
        log::info!("{}", cmd_stanza_create(&self.shared.config())?);
        runner::success()
    }
}

/// Record a new cluster version/system-id after an upgrade.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for stanza-upgrade"))]
pub struct StanzaUpgrade {
    #[clap(flatten)]
    pub shared: StanzaShared,
}

impl StanzaUpgrade {
    pub fn invoke(self) -> ExitResult {
        runner::stop_gate(&self.shared.lock, Some(&self.shared.stanza.stanza))?;
        log::info!("{}", cmd_stanza_upgrade(&self.shared.config())?);
        runner::success()
    }
}

/// Remove the stanza from the repository.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for stanza-delete"))]
pub struct StanzaDelete {
    #[clap(flatten)]
    pub shared: StanzaShared,

    /// Delete without a stop file and even while the cluster runs.
    #[clap(long = "force", display_order = 100)]
    pub force: bool,
}

impl StanzaDelete {
    pub fn invoke(self) -> ExitResult {
        log::info!("{}", cmd_stanza_delete(&self.shared.config(), self.force)?);
        runner::success()
    }
}
