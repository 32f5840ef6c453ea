//! End-to-end pipeline tests: compensation completeness, deadlines,
//! re-numbering, notifications and degraded mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfgtxn::constants::{
    ATTR_VIRTUAL_NETWORK_ID, ATTR_VXLAN_ID, KIND_PROJECT, KIND_VIRTUAL_NETWORK, NS_VIRTUAL_NETWORK_ID,
    NS_VXLAN_ID,
};
use cfgtxn::coordinator::mock::{InMemoryConfigStore, InMemoryCoordination, RecordingNotifier};
use cfgtxn::coordinator::{
    CoordinatorConfig, HookContext, HookPipeline, KindRegistry, PipelineState, ResourceHooks,
    Services,
};
use cfgtxn::error::{TxnError, TxnResult};
use cfgtxn::types::{FqName, ObjectPatch, ObjectRef, Operation, ResourceObject};
use serde_json::json;
use tokio::time::Instant;

struct Harness {
    store: InMemoryConfigStore,
    coordination: InMemoryCoordination,
    notifier: RecordingNotifier,
    pipeline: HookPipeline,
    project: ResourceObject,
}

impl Harness {
    async fn new() -> Self {
        Self::with_registry(KindRegistry::with_reference_kinds()).await
    }

    async fn with_registry(registry: KindRegistry) -> Self {
        let store = InMemoryConfigStore::new();
        let coordination = InMemoryCoordination::new();
        let notifier = RecordingNotifier::new();
        let project = ResourceObject::new(KIND_PROJECT, FqName::parse("default-domain:demo"));
        store.insert(project.clone()).await;

        let services = Services::new(
            CoordinatorConfig::default(),
            Arc::new(store.clone()),
            Arc::new(coordination.clone()),
            Arc::new(notifier.clone()),
        )
        .unwrap();
        let pipeline = HookPipeline::new(Arc::new(services), Arc::new(registry));
        Self {
            store,
            coordination,
            notifier,
            pipeline,
            project,
        }
    }

    fn network(&self, name: &str) -> ResourceObject {
        ResourceObject::new(KIND_VIRTUAL_NETWORK, self.project.fq_name.child(name))
            .parented(&self.project)
    }

    async fn is_free(&self, namespace: &str, value: u64) -> bool {
        self.pipeline
            .services()
            .allocator
            .is_free(namespace, &value.into())
            .await
            .unwrap()
    }

    async fn networks_in_quota(&self) -> i64 {
        self.pipeline
            .services()
            .quota
            .current(self.project.uuid, KIND_VIRTUAL_NETWORK)
            .await
            .unwrap()
    }
}

/// Creates a nested network in `post_create`, then fails.
struct FailingWidgetHooks;

#[async_trait]
impl ResourceHooks for FailingWidgetHooks {
    fn kind(&self) -> &str {
        "widget"
    }

    async fn post_create(
        &self,
        cx: &mut HookContext<'_>,
        tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        let Some(project) = tenant else {
            return Ok(());
        };
        let network = ResourceObject::new(
            KIND_VIRTUAL_NETWORK,
            project.fq_name.child(format!("{}-net", obj.fq_name.last().unwrap_or("w"))),
        )
        .parented(project)
        .attr(ATTR_VXLAN_ID, json!(300));
        cx.create_nested(network).await?;
        Err(TxnError::Internal("widget post-processing failed".to_string()))
    }
}

// ============================================================================
// Compensation Completeness
// ============================================================================

#[tokio::test]
async fn test_persist_failure_frees_allocations() {
    let h = Harness::new().await;
    let allocations_before = h.coordination.dump("/id").await;
    let store_before = h.store.snapshot().await;

    h.store.faults.fail_next("create", 1);
    let err = h
        .pipeline
        .create(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::StoreUnavailable(_)));
    assert_eq!(err.status_code(), 503);

    assert!(h.is_free(NS_VIRTUAL_NETWORK_ID, 1).await);
    assert!(h.is_free(NS_VXLAN_ID, 100).await);
    assert_eq!(h.coordination.dump("/id").await, allocations_before);
    assert!(h.coordination.dump("/fq-name-to-uuid").await.is_empty());
    assert_eq!(h.networks_in_quota().await, 0);
    assert_eq!(h.store.snapshot().await, store_before);
    assert!(h.notifier.events().await.is_empty());

    // The same request succeeds once the store recovers.
    let created = h
        .pipeline
        .create(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)))
        .await
        .unwrap();
    assert_eq!(created.object.get_u64(ATTR_VIRTUAL_NETWORK_ID), Some(1));
    assert_eq!(h.networks_in_quota().await, 1);
}

#[tokio::test]
async fn test_post_processing_failure_unwinds_nested_create() {
    let mut registry = KindRegistry::with_reference_kinds();
    registry.register(Arc::new(FailingWidgetHooks));
    let h = Harness::with_registry(registry).await;
    let store_before = h.store.snapshot().await;

    let widget = ResourceObject::new("widget", h.project.fq_name.child("w1")).parented(&h.project);
    let err = h.pipeline.create(widget).await.unwrap_err();
    assert_eq!(err.status_code(), 500);

    assert_eq!(h.store.snapshot().await, store_before);
    assert!(h.coordination.dump("/id").await.is_empty());
    assert!(h.coordination.dump("/fq-name-to-uuid").await.is_empty());
    assert_eq!(h.networks_in_quota().await, 0);
    assert!(h.notifier.events().await.is_empty());
}

#[tokio::test]
async fn test_failed_delete_restores_object_and_values() {
    let h = Harness::new().await;
    let created = h
        .pipeline
        .create(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)))
        .await
        .unwrap();

    h.store.faults.fail_next("delete", 1);
    let err = h
        .pipeline
        .delete(KIND_VIRTUAL_NETWORK, created.uuid)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 503);

    assert_eq!(h.store.read_object(created.uuid).await, Some(created.object.clone()));
    let allocator = &h.pipeline.services().allocator;
    let owner = created.object.owner();
    assert_eq!(
        allocator
            .lookup_owner(NS_VIRTUAL_NETWORK_ID, &1.into())
            .await
            .unwrap()
            .as_deref(),
        Some(owner.as_str())
    );
    assert!(!h.is_free(NS_VXLAN_ID, 100).await);
    assert_eq!(h.networks_in_quota().await, 1);

    h.pipeline
        .delete(KIND_VIRTUAL_NETWORK, created.uuid)
        .await
        .unwrap();
    assert!(h.is_free(NS_VIRTUAL_NETWORK_ID, 1).await);
    assert_eq!(h.networks_in_quota().await, 0);
}

// ============================================================================
// Re-numbering
// ============================================================================

#[tokio::test]
async fn test_failed_renumber_keeps_old_value() {
    let h = Harness::new().await;
    let created = h
        .pipeline
        .create(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)))
        .await
        .unwrap();

    h.store.faults.fail_next("update", 1);
    h.pipeline
        .update(
            KIND_VIRTUAL_NETWORK,
            created.uuid,
            ObjectPatch::new().set(ATTR_VXLAN_ID, json!(200)),
        )
        .await
        .unwrap_err();

    assert!(!h.is_free(NS_VXLAN_ID, 100).await);
    assert!(h.is_free(NS_VXLAN_ID, 200).await);
    let stored = h.store.read_object(created.uuid).await.unwrap();
    assert_eq!(stored.get_u64(ATTR_VXLAN_ID), Some(100));
}

#[tokio::test]
async fn test_renumber_to_taken_value_rejected() {
    let h = Harness::new().await;
    let blue = h
        .pipeline
        .create(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)))
        .await
        .unwrap();
    h.pipeline
        .create(h.network("red").attr(ATTR_VXLAN_ID, json!(200)))
        .await
        .unwrap();

    let err = h
        .pipeline
        .update(
            KIND_VIRTUAL_NETWORK,
            blue.uuid,
            ObjectPatch::new().set(ATTR_VXLAN_ID, json!(200)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(!h.is_free(NS_VXLAN_ID, 100).await);
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test]
async fn test_deadline_expiry_unwinds() {
    let h = Harness::new().await;
    h.store.faults.hang("create");

    let deadline = Instant::now() + Duration::from_millis(100);
    let err = h
        .pipeline
        .create_with_deadline(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)), deadline)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TxnError::DeadlineExceeded {
            state: "persisting"
        }
    ));
    assert_eq!(err.status_code(), 504);

    assert!(h.is_free(NS_VIRTUAL_NETWORK_ID, 1).await);
    assert!(h.is_free(NS_VXLAN_ID, 100).await);
    assert!(h.coordination.dump("/fq-name-to-uuid").await.is_empty());
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn test_deadline_after_write_landed_removes_object() {
    let h = Harness::new().await;
    h.store.faults.hang_after("create");

    let deadline = Instant::now() + Duration::from_millis(100);
    let err = h
        .pipeline
        .create_with_deadline(h.network("blue").attr(ATTR_VXLAN_ID, json!(100)), deadline)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TxnError::DeadlineExceeded {
            state: "persisting"
        }
    ));

    // The write reached the store before the deadline dropped the call.
    h.store.faults.clear();
    assert_eq!(h.store.len().await, 1);
    assert!(h.is_free(NS_VIRTUAL_NETWORK_ID, 1).await);
    assert!(h.is_free(NS_VXLAN_ID, 100).await);
    assert!(h.coordination.dump("/fq-name-to-uuid").await.is_empty());
    assert_eq!(h.networks_in_quota().await, 0);
}

#[tokio::test]
async fn test_deadline_after_claim_landed_releases_it() {
    let h = Harness::new().await;
    h.coordination.faults.hang_after("create_if_absent");

    let deadline = Instant::now() + Duration::from_millis(100);
    let err = h
        .pipeline
        .create_with_deadline(h.network("blue"), deadline)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TxnError::DeadlineExceeded {
            state: "allocating"
        }
    ));

    h.coordination.faults.clear();
    assert!(h.coordination.dump("/fq-name-to-uuid").await.is_empty());
    assert_eq!(h.networks_in_quota().await, 0);
    assert_eq!(h.store.len().await, 1);
}

// ============================================================================
// Structure and References
// ============================================================================

#[tokio::test]
async fn test_transitions_and_notifications() {
    let h = Harness::new().await;
    let created = h.pipeline.create(h.network("blue")).await.unwrap();
    assert_eq!(
        created.transitions,
        vec![
            PipelineState::Validating,
            PipelineState::Allocating,
            PipelineState::Persisting,
            PipelineState::PostProcessing,
            PipelineState::Notifying,
            PipelineState::Done,
        ]
    );

    let events = h.notifier.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Operation::Create);
    assert_eq!(events[0].uuid, created.uuid);
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_request() {
    let h = Harness::new().await;
    h.notifier.faults.fail_next("publish", 1);
    let created = h.pipeline.create(h.network("blue")).await.unwrap();
    assert!(h.store.read_object(created.uuid).await.is_some());
    assert!(h.notifier.events().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_fq_name_rejected() {
    let h = Harness::new().await;
    h.pipeline.create(h.network("blue")).await.unwrap();
    let err = h.pipeline.create(h.network("blue")).await.unwrap_err();
    assert_eq!(err.status_code(), 409);
    // The loser's network id was never claimed.
    assert!(h.is_free(NS_VIRTUAL_NETWORK_ID, 2).await);
    assert_eq!(h.networks_in_quota().await, 1);
}

#[tokio::test]
async fn test_delete_refused_while_referenced() {
    let h = Harness::new().await;
    let network = h.pipeline.create(h.network("blue")).await.unwrap();
    let port = ResourceObject::new(
        "virtual_machine_interface",
        h.project.fq_name.child("port"),
    )
    .parented(&h.project)
    .reference(ObjectRef::new(KIND_VIRTUAL_NETWORK, network.uuid));
    h.pipeline.create(port).await.unwrap();

    let err = h
        .pipeline
        .delete(KIND_VIRTUAL_NETWORK, network.uuid)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert!(err.to_string().starts_with("Delete when resource still referred"));
    assert!(h.store.read_object(network.uuid).await.is_some());
}

#[tokio::test]
async fn test_missing_parent_rejected() {
    let h = Harness::new().await;
    let orphan = ResourceObject::new(KIND_VIRTUAL_NETWORK, FqName::parse("default-domain:gone:vn"))
        .parented(&ResourceObject::new(KIND_PROJECT, FqName::parse("default-domain:gone")));
    let err = h.pipeline.create(orphan).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_update_of_unknown_object_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .pipeline
        .update(KIND_VIRTUAL_NETWORK, uuid::Uuid::new_v4(), ObjectPatch::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

// ============================================================================
// Session Loss
// ============================================================================

#[tokio::test]
async fn test_session_loss_enters_degraded_mode() {
    let h = Harness::new().await;
    h.coordination.expire_session();

    let err = h.pipeline.create(h.network("blue")).await.unwrap_err();
    assert!(err.is_session_lost());
    assert!(h.pipeline.session().is_degraded());

    // Fails fast even though the service is back.
    h.coordination.restore_session();
    let err = h.pipeline.create(h.network("blue")).await.unwrap_err();
    assert!(err.is_session_lost());
    assert_eq!(h.store.len().await, 1);

    assert!(
        h.pipeline
            .session()
            .try_recover(&h.coordination)
            .await
    );
    h.pipeline.create(h.network("blue")).await.unwrap();
}
