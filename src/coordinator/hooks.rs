//! Per-kind lifecycle hooks.
//!
//! Each resource kind implements [`ResourceHooks`]; the pipeline looks the
//! implementation up once per request in a [`KindRegistry`] built at startup.
//! Every method has a no-op default, so a kind only overrides the stages it
//! cares about.
//!
//! Hooks never write the resource itself to the store. They act through a
//! [`HookContext`], whose helpers record the matching compensation for every
//! side effect they perform.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::allocator::{AllocValue, Allocation, FreeOutcome};
use super::compensation::{Compensation, CompensationContext};
use super::kinds;
use super::metrics;
use super::pipeline::{self, StateTracker};
use super::services::Services;
use crate::error::TxnResult;
use crate::types::{
    FqName, NotificationEvent, ObjectPatch, Operation, ResourceObject, Sideband,
};

/// A committed change waiting for its notification hook.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub operation: Operation,
    pub object: ResourceObject,
    pub sideband: Sideband,
}

/// Handle given to hooks for the duration of one request.
pub struct HookContext<'a> {
    pub services: &'a Services,
    pub(crate) registry: &'a KindRegistry,
    pub(crate) compensations: &'a mut CompensationContext,
    pub(crate) pending: &'a mut Vec<PendingNotification>,
    pub(crate) deadline: Instant,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        services: &'a Services,
        registry: &'a KindRegistry,
        compensations: &'a mut CompensationContext,
        pending: &'a mut Vec<PendingNotification>,
        deadline: Instant,
    ) -> Self {
        Self {
            services,
            registry,
            compensations,
            pending,
            deadline,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn push(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// Compensations recorded so far, in push order.
    pub fn compensations(&self) -> &[Compensation] {
        self.compensations.records()
    }

    /// Issue a side effect with `provisional` already on the stack.
    ///
    /// A deadline can cancel `call` after the remote side applied it but
    /// before it returned. The provisional record covers that window and
    /// must be safe to apply whether or not the effect landed. Once `call`
    /// completes, the record is replaced by whatever `settle` derives from
    /// the result.
    pub async fn effect<T, F>(
        &mut self,
        provisional: Compensation,
        call: F,
        settle: impl FnOnce(&T) -> Option<Compensation>,
    ) -> TxnResult<T>
    where
        F: Future<Output = TxnResult<T>>,
    {
        let mark = self.compensations.len();
        self.push(provisional);
        let result = call.await;
        self.compensations.truncate(mark);
        let value = result?;
        if let Some(compensation) = settle(&value) {
            self.push(compensation);
        }
        Ok(value)
    }

    /// Claim a value; a new claim is compensated by a free.
    pub async fn allocate(
        &mut self,
        namespace: &str,
        owner: &str,
        preferred: Option<AllocValue>,
    ) -> TxnResult<Allocation> {
        let services = self.services;
        let held = services.allocator.owned_values(namespace, owner).await?;
        self.effect(
            Compensation::FreeNewClaims {
                namespace: namespace.to_string(),
                owner: owner.to_string(),
                held,
            },
            services.allocator.allocate(namespace, owner, preferred),
            |allocation: &Allocation| {
                allocation.newly_claimed.then(|| Compensation::FreeValue {
                    namespace: namespace.to_string(),
                    value: allocation.value.clone(),
                    owner: owner.to_string(),
                })
            },
        )
        .await
    }

    /// Free a value; an actual release is compensated by a re-claim.
    pub async fn free(
        &mut self,
        namespace: &str,
        value: &AllocValue,
        owner: &str,
    ) -> TxnResult<FreeOutcome> {
        let services = self.services;
        let reclaim = Compensation::ReclaimValue {
            namespace: namespace.to_string(),
            value: value.clone(),
            owner: owner.to_string(),
        };
        let holder = services.allocator.lookup_owner(namespace, value).await?;
        if holder.as_deref() != Some(owner) {
            // Nothing of ours to release.
            return services.allocator.free(namespace, value, owner, false).await;
        }
        self.effect(
            reclaim.clone(),
            services.allocator.free(namespace, value, owner, false),
            |outcome: &FreeOutcome| (*outcome == FreeOutcome::Released).then_some(reclaim),
        )
        .await
    }

    /// Move `owner` from `old` to `new`: the new value is claimed before the
    /// old one is freed.
    ///
    /// A crash between the two steps leaves both values held by `owner`
    /// until the update is retried.
    pub async fn renumber(
        &mut self,
        namespace: &str,
        owner: &str,
        old: Option<&AllocValue>,
        new: Option<AllocValue>,
    ) -> TxnResult<()> {
        if old == new.as_ref() {
            return Ok(());
        }
        if let Some(new) = new {
            self.allocate(namespace, owner, Some(new)).await?;
        }
        if let Some(old) = old {
            self.free(namespace, old, owner).await?;
        }
        Ok(())
    }

    /// Reserve quota; compensated by a release of the delta actually applied.
    pub async fn reserve_quota(
        &mut self,
        scope: Uuid,
        kind: &str,
        delta: i64,
        limit: i64,
    ) -> TxnResult<()> {
        self.adjust_quota(scope, kind, delta, limit).await
    }

    /// Give quota back; compensated by restoring what the counter let go.
    pub async fn release_quota(&mut self, scope: Uuid, kind: &str, delta: i64) -> TxnResult<()> {
        self.adjust_quota(scope, kind, -delta, -1).await
    }

    async fn adjust_quota(
        &mut self,
        scope: Uuid,
        kind: &str,
        delta: i64,
        limit: i64,
    ) -> TxnResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let services = self.services;
        let mut slot = services.quota.slot(scope, kind).await?;
        let change = slot.plan(delta, limit)?;
        if change.applied == 0 {
            return Ok(());
        }
        let undo = if change.applied > 0 {
            Compensation::ReleaseQuota {
                scope,
                kind: kind.to_string(),
                delta: change.applied,
            }
        } else {
            Compensation::RestoreQuota {
                scope,
                kind: kind.to_string(),
                delta: -change.applied,
            }
        };
        // The cache moves before the mirror write, so the record is exact
        // even if the commit is cancelled.
        self.effect(undo.clone(), slot.commit(change), |_| Some(undo))
            .await
    }

    /// Run a full create for a secondary object inside this request.
    ///
    /// The nested run shares this request's compensations and deadline: if
    /// the outer request fails later, the secondary object is unwound too.
    pub fn create_nested(&mut self, obj: ResourceObject) -> BoxFuture<'_, TxnResult<ResourceObject>> {
        Box::pin(async move {
            debug!(kind = %obj.kind, uuid = %obj.uuid, "Nested create");
            pipeline::create_steps(self, obj, &mut StateTracker::new()).await
        })
    }

    pub fn update_nested<'s>(
        &'s mut self,
        kind: &'s str,
        uuid: Uuid,
        patch: ObjectPatch,
    ) -> BoxFuture<'s, TxnResult<ResourceObject>> {
        Box::pin(async move {
            debug!(kind, %uuid, "Nested update");
            pipeline::update_steps(self, kind, uuid, patch, &mut StateTracker::new()).await
        })
    }

    pub fn delete_nested<'s>(
        &'s mut self,
        kind: &'s str,
        uuid: Uuid,
    ) -> BoxFuture<'s, TxnResult<ResourceObject>> {
        Box::pin(async move {
            debug!(kind, %uuid, "Nested delete");
            pipeline::delete_steps(self, kind, uuid, &mut StateTracker::new()).await
        })
    }
}

/// Publish the standard event for a committed change.
pub async fn publish(services: &Services, operation: Operation, obj: &ResourceObject) -> TxnResult<()> {
    services
        .notifier
        .publish(&NotificationEvent::for_object(operation, obj))
        .await
}

/// Lifecycle callbacks of one resource kind.
///
/// `validate_*` run in `Validating` and must not have side effects.
/// `pre_*` run in `Allocating`, `post_*` in `PostProcessing`, and the
/// notification hooks in `Notifying` after the request has committed.
#[async_trait]
pub trait ResourceHooks: Send + Sync {
    fn kind(&self) -> &str;

    async fn validate_create(
        &self,
        _cx: &HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        _obj: &ResourceObject,
    ) -> TxnResult<()> {
        Ok(())
    }

    async fn pre_create(
        &self,
        _cx: &mut HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        _obj: &mut ResourceObject,
    ) -> TxnResult<()> {
        Ok(())
    }

    async fn post_create(
        &self,
        _cx: &mut HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        _obj: &ResourceObject,
    ) -> TxnResult<()> {
        Ok(())
    }

    async fn validate_update(
        &self,
        _cx: &HookContext<'_>,
        _obj: &ResourceObject,
        _old: &ResourceObject,
    ) -> TxnResult<()> {
        Ok(())
    }

    async fn pre_update(
        &self,
        _cx: &mut HookContext<'_>,
        _id: Uuid,
        _fq_name: &FqName,
        _obj: &mut ResourceObject,
        _old: &ResourceObject,
    ) -> TxnResult<Sideband> {
        Ok(Sideband::new())
    }

    async fn post_update(
        &self,
        _cx: &mut HookContext<'_>,
        _id: Uuid,
        _fq_name: &FqName,
        _obj: &ResourceObject,
        _sideband: &Sideband,
    ) -> TxnResult<()> {
        Ok(())
    }

    async fn validate_delete(&self, _cx: &HookContext<'_>, _obj: &ResourceObject) -> TxnResult<()> {
        Ok(())
    }

    async fn pre_delete(
        &self,
        _cx: &mut HookContext<'_>,
        _id: Uuid,
        _obj: &ResourceObject,
    ) -> TxnResult<Sideband> {
        Ok(Sideband::new())
    }

    async fn post_delete(
        &self,
        _cx: &mut HookContext<'_>,
        _id: Uuid,
        _obj: &ResourceObject,
        _sideband: &Sideband,
    ) -> TxnResult<()> {
        Ok(())
    }

    async fn create_notification(&self, services: &Services, obj: &ResourceObject) -> TxnResult<()> {
        publish(services, Operation::Create, obj).await
    }

    async fn update_notification(
        &self,
        services: &Services,
        obj: &ResourceObject,
        _sideband: &Sideband,
    ) -> TxnResult<()> {
        publish(services, Operation::Update, obj).await
    }

    async fn delete_notification(
        &self,
        services: &Services,
        obj: &ResourceObject,
        _sideband: &Sideband,
    ) -> TxnResult<()> {
        publish(services, Operation::Delete, obj).await
    }
}

/// Hooks for kinds without kind-specific behaviour.
#[derive(Debug, Default)]
pub struct GenericHooks;

#[async_trait]
impl ResourceHooks for GenericHooks {
    fn kind(&self) -> &str {
        "generic"
    }
}

/// Kind name → hooks, resolved once at startup.
pub struct KindRegistry {
    kinds: HashMap<String, Arc<dyn ResourceHooks>>,
    fallback: Arc<dyn ResourceHooks>,
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("KindRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KindRegistry {
    /// Registry where every kind uses [`GenericHooks`].
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
            fallback: Arc::new(GenericHooks),
        }
    }

    /// Registry with the built-in reference kinds.
    pub fn with_reference_kinds() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(kinds::VirtualNetworkHooks));
        registry.register(Arc::new(kinds::SecurityGroupHooks));
        registry.register(Arc::new(kinds::LogicalRouterHooks));
        registry.register(Arc::new(kinds::NetworkIpamHooks));
        registry.register(Arc::new(kinds::PhysicalInterfaceHooks));
        registry
    }

    pub fn register(&mut self, hooks: Arc<dyn ResourceHooks>) {
        self.kinds.insert(hooks.kind().to_string(), hooks);
    }

    pub fn get(&self, kind: &str) -> Arc<dyn ResourceHooks> {
        self.kinds
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }
}

/// Run the notification hook of every committed change. Failures are
/// logged and counted, never returned.
pub(crate) async fn run_notifications(
    services: &Services,
    registry: &KindRegistry,
    pending: Vec<PendingNotification>,
) -> usize {
    let mut failed = 0;
    for notification in pending {
        let hooks = registry.get(&notification.object.kind);
        let result = match notification.operation {
            Operation::Create => hooks.create_notification(services, &notification.object).await,
            Operation::Update => {
                hooks
                    .update_notification(services, &notification.object, &notification.sideband)
                    .await
            }
            Operation::Delete => {
                hooks
                    .delete_notification(services, &notification.object, &notification.sideband)
                    .await
            }
        };
        metrics::record_notification(result.is_ok());
        if let Err(e) = result {
            failed += 1;
            tracing::warn!(
                kind = %notification.object.kind,
                uuid = %notification.object.uuid,
                operation = %notification.operation,
                error = %e,
                "Notification failed"
            );
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::constants::{KIND_LOGICAL_ROUTER, KIND_SECURITY_GROUP, NS_VXLAN_ID};
    use crate::coordinator::compensation;
    use crate::coordinator::config::CoordinatorConfig;
    use crate::coordinator::mock::{InMemoryConfigStore, InMemoryCoordination, RecordingNotifier};
    use crate::coordinator::session::SessionGuard;

    #[test]
    fn test_registry_falls_back_to_generic() {
        let registry = KindRegistry::with_reference_kinds();
        assert!(registry.contains(KIND_SECURITY_GROUP));
        assert_eq!(registry.get(KIND_LOGICAL_ROUTER).kind(), KIND_LOGICAL_ROUTER);
        assert_eq!(registry.get("access_control_list").kind(), "generic");
    }

    #[tokio::test]
    async fn test_allocation_cut_short_is_compensated() {
        let coordination = InMemoryCoordination::new();
        let services = Services::new(
            CoordinatorConfig::default(),
            Arc::new(InMemoryConfigStore::new()),
            Arc::new(coordination.clone()),
            Arc::new(RecordingNotifier::new()),
        )
        .unwrap();
        let registry = KindRegistry::with_reference_kinds();
        let mut compensations = CompensationContext::new();
        let mut pending = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(50);

        coordination.faults.hang_after("create_if_absent");
        {
            let mut cx =
                HookContext::new(&services, &registry, &mut compensations, &mut pending, deadline);
            let cut = tokio::time::timeout_at(
                deadline,
                cx.allocate(NS_VXLAN_ID, "a", Some(AllocValue::Index(7))),
            )
            .await;
            assert!(cut.is_err());
        }
        coordination.faults.clear();

        // The claim landed even though the call never returned.
        let seven = AllocValue::Index(7);
        assert!(!services.allocator.is_free(NS_VXLAN_ID, &seven).await.unwrap());
        assert_eq!(compensations.len(), 1);

        let report = compensation::unwind(&services, &SessionGuard::new(), compensations).await;
        assert_eq!(report.failed, 0);
        assert!(services.allocator.is_free(NS_VXLAN_ID, &seven).await.unwrap());
    }
}
