#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing
)]
//! Integration tests for fetching collections and locking their dependencies.

mod common;

use std::fs;
use std::sync::Arc;

use common::{FixtureFetcher, TestEnv};
use spito::error::RuleError;
use spito::logging::Logger;
use spito::rules::{CollectionId, DependencyLock, Fetcher, Resolver};

fn resolver(env: &TestEnv, fetcher: &Arc<FixtureFetcher>) -> Resolver {
    let fetcher: Arc<dyn Fetcher> = fetcher.clone();
    Resolver::new(
        fetcher,
        env.config().rulesets_dir,
        "github.com",
        Arc::new(Logger::detached()),
    )
}

/// `app` depends on `a` and `b`, which both depend on `c`.
fn diamond() -> FixtureFetcher {
    FixtureFetcher::new()
        .with_manifest(
            "o/app",
            "rules:\n  main: main.lua\ndependencies:\n  - o/a\n  - o/b\n",
        )
        .with_manifest("o/a", "dependencies:\n  - o/c\n")
        .with_manifest("o/b", "dependencies:\n  - github.com/o/c\n")
        .with_manifest("o/c", "")
}

#[test]
fn diamond_fetches_each_collection_once() {
    let env = TestEnv::new();
    let fetcher = Arc::new(diamond());
    let collection = resolver(&env, &fetcher).resolve("o/app").expect("resolve");

    for name in ["o/app", "o/a", "o/b", "o/c"] {
        assert_eq!(fetcher.clones_of(name), 1, "{name}");
    }
    assert_eq!(fetcher.overlaps(), 0);

    let locked: Vec<&str> = collection
        .lock
        .dependencies
        .iter()
        .map(|d| d.collection.as_str())
        .collect();
    assert_eq!(locked, ["github.com/o/a", "github.com/o/b", "github.com/o/c"]);
}

#[test]
fn lockfile_is_written_next_to_manifest() {
    let env = TestEnv::new();
    let fetcher = Arc::new(
        FixtureFetcher::new()
            .with_manifest("o/app", "dependencies:\n  - o/lib@v1.4.0\n")
            .with_manifest("o/lib", ""),
    );
    let collection = resolver(&env, &fetcher).resolve("o/app").expect("resolve");

    assert_eq!(fetcher.checkouts(), ["v1.4.0"]);
    let text =
        fs::read_to_string(DependencyLock::path_in(&collection.dir)).expect("read lockfile");
    assert_eq!(
        text,
        "dependencies:\n- collection: github.com/o/lib\n  version: v1.4.0\n"
    );
    assert_eq!(
        DependencyLock::load(&collection.dir).expect("load"),
        Some(collection.lock)
    );
}

#[test]
fn covering_lock_skips_dependency_fetches() {
    let env = TestEnv::new();
    let fetcher = Arc::new(diamond());
    let resolver = resolver(&env, &fetcher);
    resolver.resolve("o/app").expect("first resolve");
    assert_eq!(fetcher.total_clones(), 4);

    resolver.resolve("o/app").expect("second resolve");
    assert_eq!(fetcher.total_clones(), 4);
    assert_eq!(fetcher.pulls(), 1, "only the root is refreshed");
}

#[test]
fn missing_locked_collection_triggers_resolution() {
    let env = TestEnv::new();
    let fetcher = Arc::new(diamond());
    let resolver = resolver(&env, &fetcher);
    resolver.resolve("o/app").expect("first resolve");

    let c = CollectionId::normalize("o/c", "github.com").expect("id");
    fs::remove_dir_all(resolver.local_dir(&c)).expect("remove checkout");

    resolver.resolve("o/app").expect("second resolve");
    assert_eq!(fetcher.clones_of("o/c"), 2);
}

#[test]
fn present_dependencies_are_not_pulled() {
    let env = TestEnv::new();
    let fetcher = Arc::new(diamond());
    let resolver = resolver(&env, &fetcher);
    let first = resolver.resolve("o/app").expect("first resolve");
    fs::remove_file(DependencyLock::path_in(&first.dir)).expect("drop lockfile");

    let second = resolver.resolve("o/app").expect("second resolve");
    assert_eq!(fetcher.total_clones(), 4);
    assert_eq!(fetcher.pulls(), 1, "only the root is refreshed");
    assert_eq!(second.lock, first.lock);
}

#[test]
fn changed_pin_invalidates_lock() {
    let env = TestEnv::new();
    let fetcher = Arc::new(
        FixtureFetcher::new()
            .with_manifest("o/app", "dependencies:\n  - o/lib@v2\n")
            .with_manifest("o/lib", ""),
    );
    let resolver = resolver(&env, &fetcher);
    let first = resolver.resolve("o/app").expect("first resolve");
    fs::write(
        first.dir.join("spito-rules.yml"),
        "dependencies:\n  - o/lib@v3\n",
    )
    .expect("bump pin");

    let second = resolver.resolve("o/app").expect("second resolve");
    assert_eq!(fetcher.checkouts(), ["v2", "v3"]);
    assert_eq!(second.lock.dependencies[0].version.as_deref(), Some("v3"));
    assert_eq!(fetcher.clones_of("o/lib"), 1);
}

#[test]
fn pinned_root_is_checked_out() {
    let env = TestEnv::new();
    let fetcher = Arc::new(FixtureFetcher::new().with_manifest("o/app", ""));
    let collection = resolver(&env, &fetcher)
        .resolve("github.com/o/app@main")
        .expect("resolve");
    assert_eq!(fetcher.checkouts(), ["main"]);
    assert!(collection.lock.dependencies.is_empty());
}

#[test]
fn unreachable_dependency_fails_resolution() {
    let env = TestEnv::new();
    let fetcher = Arc::new(
        FixtureFetcher::new().with_manifest("o/app", "dependencies:\n  - o/gone\n"),
    );
    let err = resolver(&env, &fetcher)
        .resolve("o/app")
        .expect_err("missing dependency");
    assert!(
        matches!(&err, RuleError::FetchFailure { url, .. } if url == "https://github.com/o/gone"),
        "unexpected error: {err}"
    );
}

#[test]
fn malformed_identifier_is_rejected() {
    let env = TestEnv::new();
    let fetcher = Arc::new(FixtureFetcher::new());
    assert!(matches!(
        resolver(&env, &fetcher).resolve("not-a-collection"),
        Err(RuleError::InvalidIdentifier(_))
    ));
    assert_eq!(fetcher.total_clones(), 0);
}
