//! The `restore` command.

use std::collections::HashMap;

use pgvault::restore::{cmd_restore, RestoreConfig, RestoreType};

use super::ExitResult;
use crate::{args, runner};

/// Restore the cluster from a backup set.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for restore"))]
pub struct Restore {
    #[clap(flatten)]
    pub stanza: args::StanzaArgs,

    #[clap(flatten)]
    pub repo: args::RepoArgs,

    #[clap(flatten)]
    pub pg: args::PgPathArgs,

    #[clap(flatten)]
    pub process: args::ProcessArgs,

    #[clap(flatten)]
    pub timeouts: args::TimeoutArgs,

    /// Backup set to restore; latest when omitted.
    #[clap(long = "set", value_name = "LABEL", display_order = 100)]
    pub set: Option<String>,

    /// Reconcile an existing data directory instead of requiring empty.
    #[clap(long = "delta", display_order = 101)]
    pub delta: bool,

    /// Proceed even when guards would refuse (implies --delta).
    #[clap(long = "force", display_order = 102)]
    pub force: bool,

    /// Recovery type: default, immediate, time, xid, name, preserve,
    /// standby, or none.
    #[clap(long = "type", default_value = "default", value_name = "TYPE", display_order = 103)]
    pub restore_type: String,

    /// Recovery target (time, xid, or name, per --type).
    #[clap(long = "target", value_name = "TARGET", display_order = 104)]
    pub target: Option<String>,

    /// Timeline to recover along.
    #[clap(long = "target-timeline", value_name = "TIMELINE", display_order = 105)]
    pub target_timeline: Option<String>,

    /// Action once the target is reached (pause, promote, shutdown).
    #[clap(long = "target-action", value_name = "ACTION", display_order = 106)]
    pub target_action: Option<String>,

    /// Stop just after (true) or just before (false) the target.
    #[clap(long = "target-inclusive", value_name = "BOOL", display_order = 107)]
    pub target_inclusive: Option<bool>,

    /// Remap a tablespace: NAME-or-OID=PATH. May repeat.
    #[clap(long = "tablespace-map", value_name = "MAP", display_order = 108)]
    pub tablespace_map: Vec<String>,

    /// Remap every (unmapped) tablespace under this base path.
    #[clap(long = "tablespace-map-all", value_name = "PATH", display_order = 109)]
    pub tablespace_map_all: Option<String>,

    /// Remap a link: NAME=DESTINATION. May repeat.
    #[clap(long = "link-map", value_name = "MAP", display_order = 110)]
    pub link_map: Vec<String>,

    /// Restore links as plain paths/files inside the data directory.
    #[clap(
        long = "link-all",
        default_value = "true",
        action = clap::ArgAction::Set,
        value_name = "BOOL",
        display_order = 111
    )]
    pub link_all: bool,

    /// Restore only these databases; others are zeroed. May repeat.
    #[clap(long = "db-include", value_name = "NAME", display_order = 112)]
    pub db_include: Vec<String>,

    /// Zero these databases. May repeat.
    #[clap(long = "db-exclude", value_name = "NAME", display_order = 113)]
    pub db_exclude: Vec<String>,
}

fn parse_map(pairs: &[String], what: &str) -> Result<HashMap<String, String>, pgvault::error::Error> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| {
                    pgvault::error::Error::OptionInvalidValue(format!(
                        "'{pair}' is not a valid {what} mapping (expected KEY=PATH)"
                    ))
                })
        })
        .collect()
}

impl Restore {
    pub fn invoke(self) -> ExitResult {
        let restore_type: RestoreType = self.restore_type.parse()?;
        let cfg = RestoreConfig {
            stanza: self.stanza.stanza.clone(),
            pg_path: self.pg.pg_path.clone(),
            repo: runner::repo(&self.stanza, &self.repo),
            set: self.set.clone(),
            delta: self.delta,
            force: self.force,
            restore_type,
            target: self.target.clone(),
            target_timeline: self.target_timeline.clone(),
            target_action: self.target_action.clone(),
            target_inclusive: self.target_inclusive,
            tablespace_map: parse_map(&self.tablespace_map, "tablespace")?,
            tablespace_map_all: self.tablespace_map_all.clone(),
            link_map: parse_map(&self.link_map, "link")?,
            // The CLI flag enables link restoration; the engine's flag
            // requests conversion to plain paths, i.e. the inverse.
            link_all: !self.link_all,
            db_include: self.db_include.clone(),
            db_exclude: self.db_exclude.clone(),
            process_max: self.process.process_max,
            protocol_timeout: std::time::Duration::from_secs(
                self.timeouts.effective_protocol_timeout(),
            ),
            cmd: std::env::current_exe()
                .map(|exe| exe.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "pgvault".to_owned()),
            repo_path_opt: self.repo.repo_path.to_string_lossy().into_owned(),
        };
        let summary = cmd_restore(&cfg)?;
        log::info!(
            "restored backup set '{}': {} restored, {} preserved, {} zeroed",
            summary.label,
            summary.files_restored,
            summary.files_preserved,
            summary.files_zeroed
        );
        runner::success()
    }
}
