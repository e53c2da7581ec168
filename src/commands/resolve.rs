//! Command: fetch a rule collection and lock its dependencies.
use std::sync::Arc;

use anyhow::{Context as _, Result};

use super::CommandSetup;
use crate::cli::{GlobalOpts, ResolveOpts};
use crate::logging::{Log, Logger};
use crate::rules::{GitFetcher, Resolver};

/// Run the resolve command.
///
/// # Errors
///
/// Returns an error if the identifier is invalid or fetching fails.
pub fn run(global: &GlobalOpts, opts: &ResolveOpts, log: &Arc<Logger>) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;

    log.stage(&format!("Resolving {}", opts.identifier));
    let resolver = Resolver::new(
        Arc::new(GitFetcher),
        &setup.config.rulesets_dir,
        setup.config.default_host.clone(),
        Arc::clone(log) as Arc<dyn Log>,
    );
    let collection = resolver
        .resolve(&opts.identifier)
        .with_context(|| format!("failed to resolve {}", opts.identifier))?;
    log.info(&format!("{} at {}", collection.id, collection.dir.display()));

    log.stage("Rules");
    for (name, rule) in &collection.manifest.rules {
        let mut flags = Vec::new();
        if rule.is_unsafe {
            flags.push("unsafe");
        }
        if rule.environment {
            flags.push("environment");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        let description = rule
            .description
            .as_deref()
            .map_or_else(String::new, |d| format!(": {d}"));
        log.info(&format!("{name}{flags}{description}"));
    }

    if !collection.lock.dependencies.is_empty() {
        log.stage("Dependencies");
        for dep in &collection.lock.dependencies {
            match &dep.version {
                Some(version) => log.info(&format!("{}@{version}", dep.collection)),
                None => log.info(&dep.collection),
            }
        }
    }
    Ok(())
}
