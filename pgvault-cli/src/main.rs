#![doc = include_str!("../README.md")]

mod args;
mod cli;
mod command;
mod runner;

use std::process::ExitCode;

use clap::Parser;

use pgvault::error::Error;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let level = cli
        .log_level_console
        .parse()
        .unwrap_or(log::LevelFilter::Info);
    if simple_logger::SimpleLogger::new().with_level(level).init().is_err() {
        eprintln!("WARN: unable to initialize logging");
    }

    // Locks are advisory flocks released by the OS at exit, so the signal
    // path only needs to log and map the signal to the exit code.
    if let Err(err) = ctrlc::set_handler(|| {
        log::info!("terminated on signal");
        std::process::exit(term_exit_code());
    }) {
        log::warn!("unable to set signal handler: {err}");
    }

    match cli.command.invoke() {
        Ok(code) => code,
        Err(err) => {
            let code = err.code();
            let report = miette::Report::new(err);
            eprintln!("ERROR: [{code:03}]: {report:?}");
            exit_code_from(code)
        }
    }
}

fn term_exit_code() -> i32 {
    Error::Term(String::new()).code()
}

fn exit_code_from(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}
