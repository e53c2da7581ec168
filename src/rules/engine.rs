//! Rule evaluation.
//!
//! A top-level [`Engine::check`] runs on its own thread and owns a fresh
//! [`Request`]: the history used for memoization and cycle detection, and
//! the collections fetched so far. Nested rules requested through
//! [`RuleApi::require`] share that request.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use super::fetch::Fetcher;
use super::history::{Begin, RuleHistory, RuleKey};
use super::identifier::DependencySpec;
use super::resolver::{Collection, Resolver};
use super::runtime::{RuleApi, RuleScript, ScriptRuntime};
use crate::apply::{EnvironmentLedger, apply};
use crate::error::RuleError;
use crate::logging::RuleStatus;
use crate::session::Session;

/// Result of [`Engine::apply_rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The rule evaluated to `false`; nothing was written.
    NotPassed,
    /// The overlay was committed.
    Applied {
        /// Batch that undoes the change.
        revert_id: u64,
    },
}

/// State shared by every evaluation under one top-level check.
#[derive(Debug, Default)]
pub struct Request {
    history: RuleHistory,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
    locked: Mutex<HashSet<String>>,
    fatal: Mutex<Option<String>>,
}

impl Request {
    /// Remember `collection` and the dependencies it locked as fetched.
    fn adopt(&self, collection: Collection) -> Arc<Collection> {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(collection.lock.dependencies.iter().map(|d| d.collection.clone()));
        let collection = Arc::new(collection);
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.id.to_string(), Arc::clone(&collection));
        collection
    }

    fn cached(&self, id: &str) -> Option<Arc<Collection>> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn is_locked(&self, id: &str) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Record a cycle; the first one wins.
    fn set_fatal(&self, chain: &str) {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| chain.to_string());
    }

    fn fatal(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Evaluates rules against a session overlay.
pub struct Engine {
    session: Arc<Session>,
    resolver: Resolver,
    runtime: Arc<dyn ScriptRuntime>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session", &self.session)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "script panicked".to_string())
}

impl Engine {
    /// Create an engine fetching through `fetcher` and running scripts with
    /// `runtime`.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        fetcher: Arc<dyn Fetcher>,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> Self {
        let resolver = Resolver::new(
            fetcher,
            session.rulesets_dir(),
            session.config.default_host.clone(),
            Arc::clone(&session.log),
        );
        Self {
            session,
            resolver,
            runtime,
        }
    }

    /// The session rules write into.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The collection resolver.
    #[must_use]
    pub const fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Evaluate `rule` of collection `identifier`.
    ///
    /// Evaluation runs on a dedicated thread. A panic anywhere in it is
    /// reported as [`RuleError::ScriptFault`]; a `false` result is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::CyclicDependency`] if any nested rule closed a
    /// cycle, even if the script ignored it, and otherwise the first
    /// resolution or script error.
    pub fn check(&self, identifier: &str, rule: &str) -> Result<bool, RuleError> {
        let spec = DependencySpec::parse(identifier, &self.session.config.default_host)?;
        let request = Request::default();
        let (tx, rx) = mpsc::sync_channel(1);
        let fault = |message: String| RuleError::ScriptFault {
            rule: RuleKey::new(spec.collection.to_string(), rule).to_string(),
            message,
        };

        thread::scope(|s| {
            let (request, spec) = (&request, &spec);
            s.spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.evaluate_top(request, spec, rule)
                }))
                .unwrap_or_else(|payload| Err(fault(panic_message(payload.as_ref()))));
                tx.try_send(outcome).ok();
            });
            rx.recv()
                .unwrap_or_else(|_| Err(fault("evaluation ended without a result".to_string())))
        })
    }

    /// Check `rule` and, if it passes, commit the overlay.
    ///
    /// Rules declared `environment` replace the environment currently
    /// applied. A rule that does not pass leaves the filesystem untouched.
    ///
    /// # Errors
    ///
    /// Returns evaluation errors from [`check`](Self::check) and commit or
    /// revert errors.
    pub fn apply_rule(&self, identifier: &str, rule: &str) -> Result<ApplyOutcome, RuleError> {
        let overlay = self.session.overlay();
        let passed = match self.check(identifier, rule) {
            Ok(passed) => passed,
            Err(e) => {
                overlay.clear().ok();
                return Err(e);
            }
        };
        let spec = DependencySpec::parse(identifier, &self.session.config.default_host)?;
        let key = RuleKey::new(spec.collection.to_string(), rule);
        if !passed {
            overlay.clear()?;
            self.session.log.info(&format!("{key} did not pass; nothing applied"));
            return Ok(ApplyOutcome::NotPassed);
        }

        let collection = self.resolver.open(&spec.collection)?;
        let (config, _) = collection.rule(rule)?;
        let revert_id = if config.environment {
            let store = self.session.revert_store();
            let mut ledger = EnvironmentLedger::load(self.session.state_dir())?;
            ledger.activate(&key.to_string(), &store, || {
                apply(&self.session).map_err(RuleError::from)
            })?
        } else {
            apply(&self.session)?
        };
        Ok(ApplyOutcome::Applied { revert_id })
    }

    fn evaluate_top(
        &self,
        request: &Request,
        spec: &DependencySpec,
        rule: &str,
    ) -> Result<bool, RuleError> {
        let collection = self.resolver.resolve(&spec.to_string())?;
        request.adopt(collection);
        let result = self.evaluate(request, spec, rule);
        if let Some(chain) = request.fatal() {
            return Err(RuleError::CyclicDependency { chain });
        }
        result
    }

    /// Evaluate a dependency on behalf of a running script; a fault in the
    /// dependency evaluates to `false`.
    pub(crate) fn evaluate_nested(
        &self,
        request: &Request,
        identifier: &str,
        rule: &str,
    ) -> Result<bool, RuleError> {
        let spec = DependencySpec::parse(identifier, &self.session.config.default_host)?;
        match self.evaluate(request, &spec, rule) {
            Err(RuleError::ScriptFault { rule, message }) => {
                self.session
                    .log
                    .warn(&format!("dependency {rule} faulted: {message}"));
                Ok(false)
            }
            other => other,
        }
    }

    fn evaluate(
        &self,
        request: &Request,
        spec: &DependencySpec,
        rule: &str,
    ) -> Result<bool, RuleError> {
        let key = RuleKey::new(spec.collection.to_string(), rule);
        match request.history.begin(&key) {
            Ok(Begin::Memoized(passed)) => return Ok(passed),
            Ok(Begin::Started) => {}
            Err(e) => {
                if let RuleError::CyclicDependency { chain } = &e {
                    request.set_fatal(chain);
                }
                return Err(e);
            }
        }

        let result = self.run(request, spec, &key);
        let name = key.to_string();
        match &result {
            Ok(passed) => {
                request.history.finish(&key, *passed);
                let status = if *passed {
                    RuleStatus::Passed
                } else {
                    RuleStatus::NotPassed
                };
                self.session.log.record_rule(&name, status, None);
            }
            Err(e) => {
                // A fault is a completed evaluation; anything else never ran.
                if matches!(e, RuleError::ScriptFault { .. }) {
                    request.history.finish(&key, false);
                } else {
                    request.history.abandon(&key);
                }
                self.session
                    .log
                    .record_rule(&name, RuleStatus::Errored, Some(&e.to_string()));
            }
        }
        result
    }

    fn collection(
        &self,
        request: &Request,
        spec: &DependencySpec,
    ) -> Result<Arc<Collection>, RuleError> {
        let id = spec.collection.as_str();
        if let Some(collection) = request.cached(id) {
            return Ok(collection);
        }
        let collection = if request.is_locked(id) {
            self.resolver.open(&spec.collection)?
        } else {
            self.resolver.resolve(&spec.to_string())?
        };
        Ok(request.adopt(collection))
    }

    fn run(&self, request: &Request, spec: &DependencySpec, key: &RuleKey) -> Result<bool, RuleError> {
        let collection = self.collection(request, spec)?;
        let (config, path) = collection.rule(&key.rule)?;
        let source = fs::read_to_string(&path).map_err(|e| RuleError::NotFound {
            what: format!("{}: {e}", path.display()),
        })?;
        let script = RuleScript {
            key: key.clone(),
            path,
            source,
            config: config.clone(),
        };
        let api = RuleApi::new(self, request, &script);

        self.session.log.debug(&format!("evaluating {key}"));
        panic::catch_unwind(AssertUnwindSafe(|| self.runtime.execute(&script, &api)))
            .unwrap_or_else(|payload| {
                Err(RuleError::ScriptFault {
                    rule: key.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            })
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::SpitoConfig;
    use crate::logging::Logger;
    use crate::system::test_helpers::MockExecutor;

    type Script = Box<dyn Fn(&RuleApi<'_>) -> Result<bool, RuleError> + Send + Sync>;

    /// Runtime dispatching on rule name, counting executions.
    #[derive(Default)]
    struct MapRuntime {
        scripts: HashMap<String, Script>,
        runs: Mutex<HashMap<String, usize>>,
    }

    impl MapRuntime {
        fn with(
            mut self,
            rule: &str,
            script: impl Fn(&RuleApi<'_>) -> Result<bool, RuleError> + Send + Sync + 'static,
        ) -> Self {
            self.scripts.insert(rule.to_string(), Box::new(script));
            self
        }

        fn runs(&self, rule: &str) -> usize {
            self.runs.lock().unwrap().get(rule).copied().unwrap_or(0)
        }
    }

    impl ScriptRuntime for MapRuntime {
        fn execute(&self, script: &RuleScript, api: &RuleApi<'_>) -> Result<bool, RuleError> {
            *self
                .runs
                .lock()
                .unwrap()
                .entry(script.key.rule.clone())
                .or_default() += 1;
            let run = self
                .scripts
                .get(&script.key.rule)
                .unwrap_or_else(|| panic!("no script for {}", script.key));
            run(api)
        }
    }

    /// Fetcher that materializes one fixed collection on clone.
    struct OneCollection {
        clones: AtomicUsize,
    }

    const MANIFEST: &str = "\
rules:
  pass: pass.lua
  fail: fail.lua
  a: a.lua
  b: b.lua
  shared: shared.lua
  top: top.lua
  boom: boom.lua
  calls-boom: calls-boom.lua
  write: write.lua
  shell:
    path: shell.lua
    unsafe: true
  env-one:
    path: env-one.lua
    environment: true
  env-two:
    path: env-two.lua
    environment: true
";

    impl Fetcher for OneCollection {
        fn clone_repo(&self, _: &str, dir: &Path) -> Result<(), RuleError> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(dir).unwrap();
            fs::write(dir.join("spito-rules.yml"), MANIFEST).unwrap();
            for line in MANIFEST.lines() {
                if let Some(file) = line.trim().rsplit(' ').next()
                    && file.ends_with(".lua")
                {
                    fs::write(dir.join(file), "-- script").unwrap();
                }
            }
            Ok(())
        }

        fn force_pull(&self, _: &Path) -> Result<(), RuleError> {
            Ok(())
        }

        fn checkout(&self, _: &Path, _: &str) -> Result<(), RuleError> {
            Ok(())
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        runtime: Arc<MapRuntime>,
        engine: Engine,
    }

    impl Fixture {
        fn new(runtime: MapRuntime) -> Self {
            Self::with_executor(runtime, MockExecutor::ok(""))
        }

        fn with_executor(runtime: MapRuntime, executor: MockExecutor) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let session = Arc::new(Session::new(
                SpitoConfig::rooted_at(tmp.path()),
                Arc::new(Logger::detached()),
                Arc::new(executor),
            ));
            let runtime = Arc::new(runtime);
            let engine = Engine::new(
                session,
                Arc::new(OneCollection {
                    clones: AtomicUsize::new(0),
                }),
                Arc::clone(&runtime) as Arc<dyn ScriptRuntime>,
            );
            Self {
                tmp,
                runtime,
                engine,
            }
        }

        fn target_dir(&self) -> PathBuf {
            self.tmp.path().join("target")
        }

        fn target(&self, name: &str) -> PathBuf {
            self.target_dir().join(name)
        }
    }

    #[test]
    fn pass_and_fail_are_not_errors() {
        let fx = Fixture::new(
            MapRuntime::default()
                .with("pass", |_| Ok(true))
                .with("fail", |_| Ok(false)),
        );
        assert!(fx.engine.check("o/rules", "pass").unwrap());
        assert!(!fx.engine.check("o/rules", "fail").unwrap());
    }

    #[test]
    fn unknown_rule_is_not_found() {
        let fx = Fixture::new(MapRuntime::default());
        assert!(matches!(
            fx.engine.check("o/rules", "missing"),
            Err(RuleError::NotFound { .. })
        ));
    }

    #[test]
    fn swallowed_cycle_still_fails_the_request() {
        let fx = Fixture::new(
            MapRuntime::default()
                .with("a", |api| api.require_local("b"))
                .with("b", |api| Ok(api.require_local("a").unwrap_or(false))),
        );
        match fx.engine.check("o/rules", "a") {
            Err(RuleError::CyclicDependency { chain }) => assert_eq!(
                chain,
                "github.com/o/rules#a -> github.com/o/rules#b -> github.com/o/rules#a"
            ),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn shared_dependency_runs_once() {
        let fx = Fixture::new(
            MapRuntime::default()
                .with("shared", |_| Ok(true))
                .with("a", |api| api.require_local("shared"))
                .with("b", |api| api.require_local("shared"))
                .with("top", |api| Ok(api.require_local("a")? && api.require_local("b")?)),
        );
        assert!(fx.engine.check("o/rules", "top").unwrap());
        assert_eq!(fx.runtime.runs("shared"), 1);
    }

    #[test]
    fn top_level_panic_is_a_fault() {
        let fx = Fixture::new(MapRuntime::default().with("boom", |_| panic!("kaboom")));
        match fx.engine.check("o/rules", "boom") {
            Err(RuleError::ScriptFault { message, .. }) => assert_eq!(message, "kaboom"),
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn faulting_dependency_is_false() {
        let fx = Fixture::new(
            MapRuntime::default()
                .with("boom", |_| panic!("kaboom"))
                .with("calls-boom", |api| Ok(!api.require_local("boom")?)),
        );
        assert!(fx.engine.check("o/rules", "calls-boom").unwrap());
    }

    #[test]
    fn faulted_dependency_is_memoized_as_false() {
        let fx = Fixture::new(
            MapRuntime::default()
                .with("boom", |_| panic!("kaboom"))
                .with("calls-boom", |api| {
                    let first = api.require_local("boom")?;
                    let second = api.require_local("boom")?;
                    Ok(!first && !second)
                }),
        );
        assert!(fx.engine.check("o/rules", "calls-boom").unwrap());
        assert_eq!(fx.runtime.runs("boom"), 1);
    }

    #[test]
    fn shell_requires_unsafe() {
        let fx = Fixture::with_executor(
            MapRuntime::default()
                .with("pass", |api| match api.shell("true") {
                    Err(RuleError::UnsafeNotAllowed { .. }) => Ok(true),
                    _ => Ok(false),
                })
                .with("shell", |api| Ok(api.shell("echo hi")?.success)),
            MockExecutor::ok("hi\n"),
        );
        assert!(fx.engine.check("o/rules", "pass").unwrap());
        assert!(fx.engine.check("o/rules", "shell").unwrap());
    }

    fn writing_fixture() -> Fixture {
        let tmp_target = Arc::new(Mutex::new(PathBuf::new()));
        let (w, f) = (Arc::clone(&tmp_target), Arc::clone(&tmp_target));
        let fx = Fixture::new(
            MapRuntime::default()
                .with("write", move |api| {
                    let path = w.lock().unwrap().join("written.txt");
                    api.fs().write(&path, "hello", false)?;
                    Ok(true)
                })
                .with("fail", move |api| {
                    let path = f.lock().unwrap().join("never.txt");
                    api.fs().write(&path, "nope", false)?;
                    Ok(false)
                }),
        );
        fs::create_dir_all(fx.target_dir()).unwrap();
        *tmp_target.lock().unwrap() = fx.target_dir();
        fx
    }

    #[test]
    fn passing_rule_is_applied_and_revertable() {
        let fx = writing_fixture();
        let outcome = fx.engine.apply_rule("o/rules", "write").unwrap();
        let ApplyOutcome::Applied { revert_id } = outcome else {
            panic!("expected the rule to apply");
        };
        let written = fx.target("written.txt");
        assert_eq!(fs::read_to_string(&written).unwrap(), "hello");

        fx.engine.session().revert_store().revert(revert_id).unwrap();
        assert!(!written.exists());
    }

    #[test]
    fn failing_rule_writes_nothing() {
        let fx = writing_fixture();
        assert_eq!(
            fx.engine.apply_rule("o/rules", "fail").unwrap(),
            ApplyOutcome::NotPassed
        );
        assert!(!fx.target("never.txt").exists());
        assert!(fx.engine.session().overlay().prototypes().unwrap().is_empty());
    }

    #[test]
    fn environments_replace_each_other() {
        let target = Arc::new(Mutex::new(PathBuf::new()));
        let (one, two) = (Arc::clone(&target), Arc::clone(&target));
        let fx = Fixture::new(
            MapRuntime::default()
                .with("env-one", move |api| {
                    api.fs()
                        .write(&one.lock().unwrap().join("one"), "1", false)?;
                    Ok(true)
                })
                .with("env-two", move |api| {
                    api.fs()
                        .write(&two.lock().unwrap().join("two"), "2", false)?;
                    Ok(true)
                }),
        );
        fs::create_dir_all(fx.target_dir()).unwrap();
        *target.lock().unwrap() = fx.target_dir();

        fx.engine.apply_rule("o/rules", "env-one").unwrap();
        assert!(fx.target("one").exists());
        fx.engine.apply_rule("o/rules", "env-two").unwrap();
        assert!(!fx.target("one").exists());
        assert!(fx.target("two").exists());

        let ledger = EnvironmentLedger::load(fx.engine.session().state_dir()).unwrap();
        assert_eq!(
            ledger.current().unwrap().identifier,
            "github.com/o/rules#env-two"
        );
    }
}
