//! Command-line argument definitions.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI entry point for spito.
#[derive(Parser, Debug)]
#[command(
    name = "spito",
    about = "Resolve rule collections and manage applied changes",
    version
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory overrides shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalOpts,
}

/// Options shared across all subcommands.
#[derive(Parser, Debug, Clone, Default)]
pub struct GlobalOpts {
    /// Override the state directory (revert batches, environments)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Override the directory rule collections are cloned into
    #[arg(long, global = true)]
    pub rulesets_dir: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch a rule collection and lock its dependencies
    Resolve(ResolveOpts),
    /// Undo an applied change by replaying its revert batch
    Revert(RevertOpts),
    /// List persisted revert batches
    Batches,
    /// List applied environments
    Environments,
    /// Print version information
    Version,
}

impl Command {
    /// Subcommand name, used for the log file.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Resolve(_) => "resolve",
            Self::Revert(_) => "revert",
            Self::Batches => "batches",
            Self::Environments => "environments",
            Self::Version => "version",
        }
    }
}

/// Options for the `resolve` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct ResolveOpts {
    /// Collection identifier, e.g. `owner/name` or `host/owner/name@version`
    pub identifier: String,
}

/// Options for the `revert` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RevertOpts {
    /// Revert batch id
    pub id: u64,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_resolve() {
        let cli = Cli::parse_from(["spito", "resolve", "avorty/spito-ruleset"]);
        assert!(
            matches!(&cli.command, Command::Resolve(opts) if opts.identifier == "avorty/spito-ruleset")
        );
    }

    #[test]
    fn parse_revert_id() {
        let cli = Cli::parse_from(["spito", "revert", "7"]);
        assert!(matches!(cli.command, Command::Revert(RevertOpts { id: 7 })));
    }

    #[test]
    fn revert_requires_numeric_id() {
        assert!(Cli::try_parse_from(["spito", "revert", "latest"]).is_err());
    }

    #[test]
    fn parse_global_dirs_after_subcommand() {
        let cli = Cli::parse_from([
            "spito",
            "batches",
            "--state-dir",
            "/tmp/state",
            "--rulesets-dir",
            "/tmp/rules",
        ]);
        assert_eq!(cli.global.state_dir, Some(PathBuf::from("/tmp/state")));
        assert_eq!(cli.global.rulesets_dir, Some(PathBuf::from("/tmp/rules")));
        assert!(matches!(cli.command, Command::Batches));
    }

    #[test]
    fn parse_verbose_short() {
        let cli = Cli::parse_from(["spito", "-v", "environments"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Environments));
    }

    #[test]
    fn parse_version() {
        let cli = Cli::parse_from(["spito", "version"]);
        assert!(matches!(cli.command, Command::Version));
        assert!(cli.global.state_dir.is_none());
    }
}
