use clap::Parser;

use crate::command;

/// WAL archiving and point-in-time backup/restore for PostgreSQL.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: command::Command,

    /// Console log level: off, error, warn, info, debug, or trace.
    #[clap(
        long = "log-level-console",
        env = "PGVAULT_LOG_LEVEL_CONSOLE",
        default_value = "info",
        global = true,
        value_name = "LEVEL"
    )]
    pub log_level_console: String,
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::CommandFactory;

    #[test]
    fn command_definitions_are_consistent() {
        Cli::command().debug_assert();
    }
}
