//! Command: list revert batches.
use anyhow::Result;

use super::CommandSetup;
use crate::apply::RevertStore;
use crate::cli::GlobalOpts;
use crate::logging::Logger;

/// Run the batches command.
///
/// # Errors
///
/// Returns an error if the revert directory or a batch cannot be read.
#[allow(clippy::print_stdout)]
pub fn run(global: &GlobalOpts, log: &Logger) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let store = RevertStore::in_state_dir(&setup.config.state_dir);

    let ids = store.list()?;
    if ids.is_empty() {
        log.info("no revert batches");
        return Ok(());
    }
    log.stage("Revert batches");
    for id in ids {
        let batch = store.load(id)?;
        println!("{id}\t{}\t{} steps", batch.created, batch.steps.len());
    }
    Ok(())
}
