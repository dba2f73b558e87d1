//! The `start` and `stop` commands: stop files gate every other command
//! for a stanza, or for all stanzas when none is named.

use pgvault::lock;

use super::ExitResult;
use crate::{args, runner};

#[derive(clap::Args, Debug, Clone)]
pub struct ControlArgs {
    /// Stanza to control; all stanzas when omitted.
    #[clap(long = "stanza", env = "PGVAULT_STANZA", value_name = "NAME", display_order = 1)]
    pub stanza: Option<String>,

    #[clap(flatten)]
    pub lock: args::LockPathArgs,
}

/// Allow pgvault commands to run again.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for start"))]
pub struct Start {
    #[clap(flatten)]
    pub control: ControlArgs,
}

impl Start {
    pub fn invoke(self) -> ExitResult {
        let stanza = self.control.stanza.as_deref();
        if lock::stop_remove(&self.control.lock.lock_path, stanza)? {
            log::info!("start for {} completed", describe(stanza));
        } else {
            log::warn!("stop file does not exist for {}", describe(stanza));
        }
        runner::success()
    }
}

/// Block pgvault commands from running.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for stop"))]
pub struct Stop {
    #[clap(flatten)]
    pub control: ControlArgs,

    /// Also terminate processes currently holding stanza locks.
    #[clap(long = "force", display_order = 100)]
    pub force: bool,
}

impl Stop {
    pub fn invoke(self) -> ExitResult {
        let stanza = self.control.stanza.as_deref();
        if lock::stop_create(&self.control.lock.lock_path, stanza)? {
            log::info!("stop for {} completed", describe(stanza));
        } else {
            log::warn!("stop file already exists for {}", describe(stanza));
        }
        if self.force {
            let killed = lock::stop_kill(&self.control.lock.lock_path, stanza)?;
            if killed > 0 {
                log::info!("terminated {killed} lock-holding process(es)");
            }
        }
        runner::success()
    }
}

fn describe(stanza: Option<&str>) -> String {
    match stanza {
        Some(stanza) => format!("stanza '{stanza}'"),
        None => "all stanzas".to_owned(),
    }
}
