mod support;

use futures_util::future::join_all;
use mcpd_common::types::Partition;
use mcpd_daemon::registry::{ModuleRegistry, ResolutionError};
use support::{catalog, configuration, Harness};

#[tokio::test]
async fn concurrent_resolves_share_one_materialization() {
    let harness = Harness::start(|_| {}).await;
    harness.seed("t1").await;
    let registry = harness.runtime.registry();
    let partition = Partition::new("t1");

    let resolves = (0..16).map(|_| registry.resolve(&partition, "add_numbers"));
    let resolved: Vec<_> = join_all(resolves).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(registry.materializations(), 1);
    assert_eq!(harness.blobs.fetch_count(), 1);
    assert_eq!(registry.unit_count(), 1);
    let first = resolved[0].handle.id();
    assert!(resolved.iter().all(|r| r.handle.id() == first));

    // Every function of the class shares the handle.
    let other = registry.resolve(&partition, "fail").await.unwrap();
    assert_eq!(other.handle.id(), first);
    assert_eq!(registry.materializations(), 1);
}

#[tokio::test]
async fn extracted_bundles_survive_a_registry_restart() {
    let harness = Harness::start(|_| {}).await;
    harness.seed("t1").await;
    let partition = Partition::new("t1");

    harness.runtime.registry().resolve(&partition, "add_numbers").await.unwrap();
    assert_eq!(harness.blobs.fetch_count(), 1);

    let restarted = ModuleRegistry::new(
        harness.runtime.entities().clone(),
        harness.blobs.clone(),
        catalog(),
        harness.runtime.registry().bundle_root().to_path_buf(),
    );
    let resolved = restarted.resolve(&partition, "add_numbers").await.unwrap();
    assert_eq!(resolved.handle.module_name(), "math");
    assert_eq!(restarted.materializations(), 1);
    assert_eq!(harness.blobs.fetch_count(), 1, "bundle on disk is reused without a fetch");
}

#[tokio::test]
async fn concurrent_failures_fetch_once() {
    let harness = Harness::start(|_| {}).await;
    // No bundle upload: every fetch misses.
    let partition = Partition::new("t1");
    harness.runtime.entities().import_configuration(&partition, configuration(), "tests").await.unwrap();
    let registry = harness.runtime.registry();

    let outcomes = join_all((0..8).map(|_| registry.resolve(&partition, "add_numbers"))).await;
    for outcome in outcomes {
        assert!(matches!(outcome, Err(ResolutionError::BundleUnavailable { .. })), "{outcome:?}");
    }
    assert_eq!(harness.blobs.fetch_count(), 1);
    assert_eq!(registry.unit_count(), 0);

    // The failed flight is not cached.
    harness.seed("t1").await;
    registry.resolve(&partition, "add_numbers").await.unwrap();
    assert_eq!(registry.materializations(), 2);
}

#[tokio::test]
async fn unbound_and_unknown_functions_do_not_resolve() {
    let harness = Harness::start(|_| {}).await;
    harness.seed("t1").await;
    let registry = harness.runtime.registry();

    let missing = registry.resolve(&Partition::new("t1"), "nope").await.unwrap_err();
    assert_eq!(missing, ResolutionError::FunctionNotFound { name: "nope".into() });
    assert_eq!(registry.materializations(), 0);
}
