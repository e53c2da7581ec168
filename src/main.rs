//! `spito` command-line entry point.
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use spito::cli::{Cli, Command};
use spito::commands;
use spito::logging::{self, Logger};

fn main() -> Result<()> {
    let _ = enable_ansi_support::enable_ansi_support();
    let args = Cli::parse();
    if matches!(args.command, Command::Version) {
        commands::version::run();
        return Ok(());
    }

    let name = args.command.name();
    logging::init_subscriber(args.verbose, name);
    let log = Arc::new(Logger::new(name));

    let result = match &args.command {
        Command::Resolve(opts) => commands::resolve::run(&args.global, opts, &log),
        Command::Revert(opts) => commands::revert::run(&args.global, opts, &log),
        Command::Batches => commands::batches::run(&args.global, &log),
        Command::Environments => commands::environments::run(&args.global, &log),
        Command::Version => Ok(()),
    };
    log.print_summary();
    result
}
