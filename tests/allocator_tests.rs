//! Integration tests for the unique-value allocator against the in-memory
//! coordination service.

use std::collections::BTreeSet;
use std::sync::Arc;

use cfgtxn::coordinator::mock::InMemoryCoordination;
use cfgtxn::coordinator::{AllocValue, FreeOutcome, NamespaceSpec, UniqueValueAllocator};
use cfgtxn::error::TxnError;
use futures::future::join_all;

fn allocator(coordination: &InMemoryCoordination) -> UniqueValueAllocator {
    let allocator = UniqueValueAllocator::new(Arc::new(coordination.clone()), "/id", 5);
    allocator.register("sg-id", NamespaceSpec::indexed(512..1024).one_per_owner());
    allocator.register("vxlan-id", NamespaceSpec::indexed(1..4096).one_per_owner());
    allocator.register("shared", NamespaceSpec::indexed(0..64));
    allocator
}

// ============================================================================
// Allocation Scenarios
// ============================================================================

#[tokio::test]
async fn test_same_owner_gets_same_value() {
    let coordination = InMemoryCoordination::new();
    let allocator = allocator(&coordination);

    let first = allocator.allocate("sg-id", "proj:sg1", None).await.unwrap();
    assert_eq!(first.value, AllocValue::Index(512));
    assert!(first.newly_claimed);

    let again = allocator.allocate("sg-id", "proj:sg1", None).await.unwrap();
    assert_eq!(again.value, AllocValue::Index(512));
    assert!(!again.newly_claimed);

    let other = allocator.allocate("sg-id", "proj:sg2", None).await.unwrap();
    assert_eq!(other.value, AllocValue::Index(513));
}

#[tokio::test]
async fn test_preferred_value_conflict_names_owner() {
    let coordination = InMemoryCoordination::new();
    let allocator = allocator(&coordination);

    allocator
        .allocate("vxlan-id", "fab:dci1", Some(100.into()))
        .await
        .unwrap();
    let err = allocator
        .allocate("vxlan-id", "fab:dci2", Some(100.into()))
        .await
        .unwrap_err();
    match err {
        TxnError::AllocationConflict { owner, value, .. } => {
            assert_eq!(owner, "fab:dci1");
            assert_eq!(value, "100");
        }
        other => panic!("expected AllocationConflict, got {:?}", other),
    }
    assert_eq!(
        allocator
            .lookup_owner("vxlan-id", &100.into())
            .await
            .unwrap()
            .as_deref(),
        Some("fab:dci1")
    );
}

#[tokio::test]
async fn test_out_of_range_preferred_value() {
    let coordination = InMemoryCoordination::new();
    let allocator = allocator(&coordination);
    let err = allocator
        .allocate("vxlan-id", "fab:dci1", Some(5000.into()))
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::OutOfRange { .. }));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_free_then_reuse_lowest() {
    let coordination = InMemoryCoordination::new();
    let allocator = allocator(&coordination);
    for owner in ["a", "b", "c"] {
        allocator.allocate("shared", owner, None).await.unwrap();
    }
    let outcome = allocator
        .free("shared", &1.into(), "b", false)
        .await
        .unwrap();
    assert_eq!(outcome, FreeOutcome::Released);
    assert!(allocator.is_free("shared", &1.into()).await.unwrap());

    let reused = allocator.allocate("shared", "d", None).await.unwrap();
    assert_eq!(reused.value, AllocValue::Index(1));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_next_free_values_are_unique() {
    let coordination = InMemoryCoordination::new();
    let allocator = Arc::new(allocator(&coordination));

    let mut handles = Vec::new();
    for i in 0..32 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            allocator.allocate("shared", &format!("owner-{}", i), None).await
        }));
    }

    let mut values = BTreeSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(allocation) => assert!(values.insert(allocation.value)),
            Err(TxnError::ResourceExhausted { .. }) => exhausted += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    // Every winner holds its own record.
    assert_eq!(coordination.dump("/id/shared/").await.len(), values.len());
    assert_eq!(values.len() + exhausted, 32);
}

#[tokio::test]
async fn test_concurrent_preferred_value_has_one_winner() {
    let coordination = InMemoryCoordination::new();
    let first = Arc::new(allocator(&coordination));
    // A second allocator instance sharing the same coordination service.
    let second = Arc::new(allocator(&coordination));

    let attempts = (0..16).map(|i| {
        let allocator = if i % 2 == 0 { first.clone() } else { second.clone() };
        async move {
            allocator
                .allocate("vxlan-id", &format!("fab:dci{}", i), Some(100.into()))
                .await
        }
    });

    let mut winners = 0;
    for result in join_all(attempts).await {
        match result {
            Ok(_) => winners += 1,
            Err(TxnError::AllocationConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_transient_coordination_failures_are_retried() {
    let coordination = InMemoryCoordination::new();
    let allocator = allocator(&coordination);
    coordination.faults.fail_next("read", 2);

    assert!(allocator.is_free("shared", &7.into()).await.unwrap());
}
