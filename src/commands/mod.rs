//! Subcommand implementations.
pub mod batches;
pub mod environments;
pub mod resolve;
pub mod revert;
pub mod version;

use anyhow::{Context as _, Result};

use crate::cli::GlobalOpts;
use crate::config::SpitoConfig;
use crate::logging::Logger;

/// Shared state produced by the common command setup sequence.
#[derive(Debug)]
pub struct CommandSetup {
    /// Configuration with command-line overrides applied.
    pub config: SpitoConfig,
}

impl CommandSetup {
    /// Load the configuration and apply directory overrides from the command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be parsed.
    pub fn init(global: &GlobalOpts, log: &Logger) -> Result<Self> {
        log.stage("Loading configuration");
        let config = SpitoConfig::load().context("failed to load configuration")?;
        Ok(Self {
            config: Self::with_overrides(config, global),
        })
    }

    fn with_overrides(mut config: SpitoConfig, global: &GlobalOpts) -> SpitoConfig {
        if let Some(dir) = &global.state_dir {
            config.state_dir.clone_from(dir);
        }
        if let Some(dir) = &global.rulesets_dir {
            config.rulesets_dir.clone_from(dir);
        }
        config
    }
}
