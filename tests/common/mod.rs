// Shared helpers for integration tests.
//
// Provides an in-memory collection fetcher that notices overlapping fetches,
// a closure-backed script runtime, a scripted executor and a temporary
// directory-backed session so each integration test runs in isolation.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use spito::config::SpitoConfig;
use spito::error::RuleError;
use spito::exec::{ExecResult, Executor};
use spito::logging::Logger;
use spito::rules::{Engine, Fetcher, RuleApi, RuleScript, ScriptRuntime};
use spito::session::Session;

/// Serves collections from memory, keyed by clone URL.
///
/// Every fetch of a URL holds it "in flight" for a short while; a second
/// fetch of the same URL during that window is counted as an overlap.
#[derive(Default)]
pub struct FixtureFetcher {
    collections: HashMap<String, Vec<(String, String)>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    clones: Mutex<HashMap<String, usize>>,
    pulls: AtomicUsize,
    checkouts: Mutex<Vec<String>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `owner/name` on github.com with the given manifest and no scripts.
    pub fn with_manifest(self, name: &str, manifest: &str) -> Self {
        self.with_files(name, &[("spito-rules.yml", manifest)])
    }

    /// Serve `owner/name` on github.com with the given files.
    pub fn with_files(mut self, name: &str, files: &[(&str, &str)]) -> Self {
        self.collections.insert(
            format!("https://github.com/{name}"),
            files
                .iter()
                .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
                .collect(),
        );
        self
    }

    /// Number of overlapping fetches of the same collection.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Number of times `owner/name` was cloned.
    pub fn clones_of(&self, name: &str) -> usize {
        self.clones
            .lock()
            .expect("clones lock")
            .get(&format!("https://github.com/{name}"))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of clones.
    pub fn total_clones(&self) -> usize {
        self.clones.lock().expect("clones lock").values().sum()
    }

    /// Number of force-pulls.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Versions checked out, in order.
    pub fn checkouts(&self) -> Vec<String> {
        self.checkouts.lock().expect("checkouts lock").clone()
    }
}

impl Fetcher for FixtureFetcher {
    fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), RuleError> {
        if !self.in_flight.lock().expect("in-flight lock").insert(url.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(20));

        let result = match self.collections.get(url) {
            Some(files) => {
                for (path, contents) in files {
                    let target = dir.join(path);
                    std::fs::create_dir_all(target.parent().expect("parent")).expect("create dir");
                    std::fs::write(target, contents).expect("write fixture file");
                }
                *self
                    .clones
                    .lock()
                    .expect("clones lock")
                    .entry(url.to_string())
                    .or_default() += 1;
                Ok(())
            }
            None => Err(RuleError::FetchFailure {
                url: url.to_string(),
                message: "repository not found".to_string(),
            }),
        };
        self.in_flight.lock().expect("in-flight lock").remove(url);
        result
    }

    fn force_pull(&self, _: &Path) -> Result<(), RuleError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn checkout(&self, _: &Path, version: &str) -> Result<(), RuleError> {
        self.checkouts
            .lock()
            .expect("checkouts lock")
            .push(version.to_string());
        Ok(())
    }
}

type ScriptFn = Box<dyn Fn(&RuleApi<'_>) -> Result<bool, RuleError> + Send + Sync>;

/// Runs scripts by rule name and counts executions.
#[derive(Default)]
pub struct ClosureRuntime {
    scripts: HashMap<String, ScriptFn>,
    runs: Mutex<HashMap<String, usize>>,
}

impl ClosureRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body of rule `name`.
    pub fn rule(
        mut self,
        name: &str,
        script: impl Fn(&RuleApi<'_>) -> Result<bool, RuleError> + Send + Sync + 'static,
    ) -> Self {
        self.scripts.insert(name.to_string(), Box::new(script));
        self
    }

    /// Number of times rule `name` ran.
    pub fn runs(&self, name: &str) -> usize {
        self.runs
            .lock()
            .expect("runs lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl ScriptRuntime for ClosureRuntime {
    fn execute(&self, script: &RuleScript, api: &RuleApi<'_>) -> Result<bool, RuleError> {
        *self
            .runs
            .lock()
            .expect("runs lock")
            .entry(script.key.rule.clone())
            .or_default() += 1;
        let body = self
            .scripts
            .get(&script.key.rule)
            .ok_or_else(|| RuleError::ScriptFault {
                rule: script.key.to_string(),
                message: "no script registered".to_string(),
            })?;
        body(api)
    }
}

/// Executor answering by program name with fixed output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outputs: HashMap<String, (bool, String, String)>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program` with a successful run printing `stdout`.
    pub fn ok(mut self, program: &str, stdout: &str) -> Self {
        self.outputs.insert(
            program.to_string(),
            (true, stdout.to_string(), String::new()),
        );
        self
    }

    /// Answer `program` with a failed run printing `stderr`.
    pub fn fail(mut self, program: &str, stderr: &str) -> Self {
        self.outputs.insert(
            program.to_string(),
            (false, String::new(), stderr.to_string()),
        );
        self
    }

    fn answer(&self, program: &str) -> anyhow::Result<ExecResult> {
        let (success, stdout, stderr) = self
            .outputs
            .get(program)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unexpected program: {program}"))?;
        Ok(ExecResult {
            stdout,
            stderr,
            success,
            code: Some(i32::from(!success)),
        })
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, program: &str, _: &[&str]) -> anyhow::Result<ExecResult> {
        let result = self.answer(program)?;
        anyhow::ensure!(result.success, "{program} failed");
        Ok(result)
    }

    fn run_unchecked(&self, program: &str, _: &[&str]) -> anyhow::Result<ExecResult> {
        self.answer(program)
    }

    fn run_with_timeout(
        &self,
        program: &str,
        _: &[&str],
        _: Duration,
    ) -> anyhow::Result<Option<ExecResult>> {
        self.answer(program).map(Some)
    }

    fn which(&self, program: &str) -> bool {
        self.outputs.contains_key(program)
    }
}

/// An isolated spito environment backed by a [`tempfile::TempDir`].
pub struct TestEnv {
    pub root: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(root.path().join("target")).expect("create target dir");
        Self { root }
    }

    /// Configuration with every directory under the temporary root.
    pub fn config(&self) -> SpitoConfig {
        SpitoConfig::rooted_at(self.root.path())
    }

    /// A directory standing in for the real filesystem.
    pub fn target(&self, name: &str) -> PathBuf {
        self.root.path().join("target").join(name)
    }

    /// A fresh session using `executor`.
    pub fn session_with(&self, executor: impl Executor + 'static) -> Arc<Session> {
        Arc::new(Session::new(
            self.config(),
            Arc::new(Logger::detached()),
            Arc::new(executor),
        ))
    }

    /// A fresh session with an executor that knows no programs.
    pub fn session(&self) -> Arc<Session> {
        self.session_with(ScriptedExecutor::new())
    }

    /// An engine over a fresh session.
    pub fn engine(
        &self,
        executor: impl Executor + 'static,
        fetcher: Arc<FixtureFetcher>,
        runtime: Arc<ClosureRuntime>,
    ) -> Engine {
        Engine::new(self.session_with(executor), fetcher, runtime)
    }
}
