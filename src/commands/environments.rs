//! Command: list environment applications.
use anyhow::Result;

use super::CommandSetup;
use crate::apply::EnvironmentLedger;
use crate::cli::GlobalOpts;
use crate::logging::Logger;

/// Run the environments command.
///
/// # Errors
///
/// Returns an error if the environment ledger cannot be read.
#[allow(clippy::print_stdout)]
pub fn run(global: &GlobalOpts, log: &Logger) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let ledger = EnvironmentLedger::load(&setup.config.state_dir)?;

    if ledger.records().is_empty() {
        log.info("no environments applied");
        return Ok(());
    }
    log.stage("Environments");
    for record in ledger.records() {
        let state = if record.applied { "applied" } else { "reverted" };
        println!("{}\t{}\t{state}", record.revert_id, record.identifier);
    }
    Ok(())
}
