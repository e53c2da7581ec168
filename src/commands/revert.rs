//! Command: replay a revert batch.
use anyhow::{Context as _, Result};

use super::CommandSetup;
use crate::apply::{EnvironmentLedger, RevertStore};
use crate::cli::{GlobalOpts, RevertOpts};
use crate::logging::Logger;

/// Run the revert command.
///
/// # Errors
///
/// Returns an error if the batch does not exist or a step fails; steps
/// before the failing one stay undone.
pub fn run(global: &GlobalOpts, opts: &RevertOpts, log: &Logger) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let state_dir = &setup.config.state_dir;

    log.stage(&format!("Reverting batch {}", opts.id));
    let store = RevertStore::in_state_dir(state_dir);
    let steps = store
        .revert(opts.id)
        .with_context(|| format!("failed to revert batch {}", opts.id))?;
    log.info(&format!("replayed {steps} steps"));

    let mut ledger = EnvironmentLedger::load(state_dir)?;
    if ledger.mark_reverted(opts.id) {
        ledger.save()?;
        log.info("environment marked as reverted");
    }
    Ok(())
}
