//! Per-tenant quota counters.
//!
//! A counter is soft state. It is seeded on first use (from the mirrored
//! coordination path when another coordinator already maintains it,
//! otherwise from the config store's object count) and then maintained
//! incrementally. Every change is written back to
//! `{quota_root}/{tenant}/{kind}` so coordinator processes converge on the
//! same value.
//!
//! The read-check-write sequence of one `(tenant, kind)` pair runs under its
//! own async mutex. Different pairs never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use super::keys::quota_path;
use super::metrics;
use super::retry::with_coordination_policy;
use super::traits::{ConfigStore, CoordinationService};
use crate::constants::{
    ATTR_QUOTA, ATTR_SECURITY_GROUP_ENTRIES, KIND_SECURITY_GROUP, QUOTA_SECURITY_GROUP_RULE,
};
use crate::error::{TxnError, TxnResult};
use crate::types::ResourceObject;

type Entry = Arc<Mutex<Option<i64>>>;

/// Result of a counter adjustment.
///
/// `applied` can be smaller in magnitude than the requested delta when the
/// count saturates at zero. Compensations must undo `applied`, never the
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaChange {
    pub count: i64,
    pub applied: i64,
}

const UNLIMITED: i64 = -1;

/// Exclusive handle on one counter.
///
/// Planning is pure. [`commit`](Self::commit) updates the cache before the
/// mirror write goes out, so a commit cancelled mid-write leaves the cache
/// at the planned count and a compensation for the planned delta is exact.
pub struct QuotaSlot<'a> {
    counter: &'a QuotaCounter,
    path: String,
    kind: String,
    count: i64,
    guard: OwnedMutexGuard<Option<i64>>,
}

impl QuotaSlot<'_> {
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Change that `delta` would make, or `QuotaExceeded`.
    pub fn plan(&self, delta: i64, limit: i64) -> TxnResult<QuotaChange> {
        if delta > 0 && limit >= 0 && self.count + delta > limit {
            metrics::record_quota_rejection(&self.kind);
            debug!(kind = %self.kind, count = self.count, delta, limit, "Quota exceeded");
            return Err(TxnError::QuotaExceeded {
                kind: self.kind.clone(),
                limit,
            });
        }
        let next = (self.count + delta).max(0);
        Ok(QuotaChange {
            count: next,
            applied: next - self.count,
        })
    }

    /// Apply a planned change. A failed mirror write restores the cache.
    pub async fn commit(&mut self, change: QuotaChange) -> TxnResult<()> {
        if change.applied == 0 {
            return Ok(());
        }
        let previous = self.count;
        *self.guard = Some(change.count);
        self.count = change.count;
        if let Err(e) = self
            .counter
            .coordination
            .put(&self.path, &change.count.to_string())
            .await
        {
            *self.guard = Some(previous);
            self.count = previous;
            return Err(e);
        }
        Ok(())
    }
}

pub struct QuotaCounter {
    store: Arc<dyn ConfigStore>,
    coordination: Arc<dyn CoordinationService>,
    root: String,
    entries: DashMap<String, Entry>,
}

impl std::fmt::Debug for QuotaCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaCounter")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl QuotaCounter {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        coordination: Arc<dyn CoordinationService>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            store,
            coordination,
            root: root.into(),
            entries: DashMap::new(),
        }
    }

    fn entry(&self, path: &str) -> Entry {
        self.entries
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Lock the counter of `(scope, kind)`, seeding it if needed.
    ///
    /// The slot holds the pair's mutex until dropped, so a plan made on it
    /// stays valid until it is committed.
    pub async fn slot(&self, scope: Uuid, kind: &str) -> TxnResult<QuotaSlot<'_>> {
        let path = quota_path(&self.root, scope, kind);
        let mut guard = self.entry(&path).lock_owned().await;
        let count = match *guard {
            Some(count) => count,
            None => {
                let seeded = self.seed(scope, kind, &path).await?;
                *guard = Some(seeded);
                seeded
            }
        };
        Ok(QuotaSlot {
            counter: self,
            path,
            kind: kind.to_string(),
            count,
            guard,
        })
    }

    /// Apply `delta` if the result stays within `limit`.
    ///
    /// A negative `limit` is unlimited. Non-positive deltas only reduce usage
    /// and are always applied. On rejection the counter is left unchanged.
    pub async fn check_and_reserve(
        &self,
        scope: Uuid,
        kind: &str,
        delta: i64,
        limit: i64,
    ) -> TxnResult<QuotaChange> {
        let mut slot = self.slot(scope, kind).await?;
        let change = slot.plan(delta, limit)?;
        slot.commit(change).await?;
        Ok(change)
    }

    /// Unconditionally give back `delta`.
    pub async fn release(&self, scope: Uuid, kind: &str, delta: i64) -> TxnResult<QuotaChange> {
        self.check_and_reserve(scope, kind, -delta, UNLIMITED).await
    }

    /// Current count, seeding the counter if needed.
    pub async fn current(&self, scope: Uuid, kind: &str) -> TxnResult<i64> {
        Ok(self.slot(scope, kind).await?.count())
    }

    async fn seed(&self, scope: Uuid, kind: &str, path: &str) -> TxnResult<i64> {
        if let Some(body) = with_coordination_policy(|| self.coordination.read(path)).await? {
            match body.trim().parse::<i64>() {
                Ok(count) => {
                    debug!(%scope, kind, count, "Seeded quota counter from coordination service");
                    return Ok(count.max(0));
                }
                Err(_) => warn!(path, body, "Ignoring malformed quota counter"),
            }
        }

        let count = if kind == QUOTA_SECURITY_GROUP_RULE {
            self.store
                .list(KIND_SECURITY_GROUP, Some(scope))
                .await?
                .iter()
                .map(rule_count)
                .sum()
        } else {
            self.store.count(kind, Some(scope)).await? as i64
        };
        debug!(%scope, kind, count, "Seeded quota counter from store");
        Ok(count)
    }
}

/// Quota limit for `kind` from a project's `quota` attribute.
pub fn limit_for(project: &ResourceObject, kind: &str, default: i64) -> i64 {
    project
        .get(ATTR_QUOTA)
        .and_then(|q| q.get(kind))
        .and_then(|v| v.as_i64())
        .unwrap_or(default)
}

/// Number of policy rules carried by a security group.
pub fn rule_count(security_group: &ResourceObject) -> i64 {
    security_group
        .get(ATTR_SECURITY_GROUP_ENTRIES)
        .and_then(|entries| entries.get("policy_rule"))
        .and_then(|rules| rules.as_array())
        .map_or(0, |rules| rules.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::mock::{InMemoryConfigStore, InMemoryCoordination};
    use crate::types::FqName;
    use serde_json::json;

    fn counter(
        store: &InMemoryConfigStore,
        coordination: &InMemoryCoordination,
    ) -> QuotaCounter {
        QuotaCounter::new(
            Arc::new(store.clone()),
            Arc::new(coordination.clone()),
            "/quota-counter",
        )
    }

    #[tokio::test]
    async fn test_seed_from_store_count() {
        let store = InMemoryConfigStore::new();
        let coordination = InMemoryCoordination::new();
        let project = ResourceObject::new("project", FqName::parse("d:p"));
        store.insert(project.clone()).await;
        for name in ["a", "b"] {
            store
                .insert(
                    ResourceObject::new("logical_router", FqName::parse("d:p").child(name))
                        .parented(&project),
                )
                .await;
        }

        let quota = counter(&store, &coordination);
        assert_eq!(quota.current(project.uuid, "logical_router").await.unwrap(), 2);
        assert!(matches!(
            quota.check_and_reserve(project.uuid, "logical_router", 1, 2).await,
            Err(TxnError::QuotaExceeded { limit: 2, .. })
        ));
        assert_eq!(quota.current(project.uuid, "logical_router").await.unwrap(), 2);
        assert_eq!(
            quota
                .check_and_reserve(project.uuid, "logical_router", 1, 3)
                .await
                .unwrap()
                .count,
            3
        );
        let mirrored = coordination
            .read(&quota_path("/quota-counter", project.uuid, "logical_router"))
            .await
            .unwrap();
        assert_eq!(mirrored.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_seed_rule_count_from_security_groups() {
        let store = InMemoryConfigStore::new();
        let coordination = InMemoryCoordination::new();
        let project = ResourceObject::new("project", FqName::parse("d:p"));
        let sg = ResourceObject::new("security_group", FqName::parse("d:p:sg"))
            .parented(&project)
            .attr(
                ATTR_SECURITY_GROUP_ENTRIES,
                json!({"policy_rule": [{"rule_uuid": "a"}, {"rule_uuid": "b"}]}),
            );
        store.insert(sg).await;

        let quota = counter(&store, &coordination);
        assert_eq!(
            quota.current(project.uuid, QUOTA_SECURITY_GROUP_RULE).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_seed_prefers_mirrored_counter() {
        let store = InMemoryConfigStore::new();
        let coordination = InMemoryCoordination::new();
        let scope = Uuid::new_v4();
        coordination
            .put(&quota_path("/quota-counter", scope, "network_ipam"), "7")
            .await
            .unwrap();
        let quota = counter(&store, &coordination);
        assert_eq!(quota.current(scope, "network_ipam").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_negative_delta_and_release_saturate() {
        let quota = counter(&InMemoryConfigStore::new(), &InMemoryCoordination::new());
        let scope = Uuid::new_v4();
        quota.check_and_reserve(scope, "k", 2, 2).await.unwrap();
        // Over the limit already, but shrinking is always allowed.
        assert_eq!(
            quota.check_and_reserve(scope, "k", -1, 0).await.unwrap(),
            QuotaChange { count: 1, applied: -1 }
        );
        // Only what was actually counted comes off.
        assert_eq!(
            quota.release(scope, "k", 5).await.unwrap(),
            QuotaChange { count: 0, applied: -1 }
        );
        assert_eq!(quota.check_and_reserve(scope, "k", 100, -1).await.unwrap().count, 100);
    }

    #[tokio::test]
    async fn test_failed_mirror_leaves_counter_unchanged() {
        let coordination = InMemoryCoordination::new();
        let quota = counter(&InMemoryConfigStore::new(), &coordination);
        let scope = Uuid::new_v4();
        quota.check_and_reserve(scope, "k", 1, -1).await.unwrap();
        coordination.faults.fail_next("put", 1);
        assert!(quota.check_and_reserve(scope, "k", 1, -1).await.is_err());
        assert_eq!(quota.current(scope, "k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_respect_limit() {
        let quota = Arc::new(counter(
            &InMemoryConfigStore::new(),
            &InMemoryCoordination::new(),
        ));
        let scope = Uuid::new_v4();
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move { quota.check_and_reserve(scope, "k", 1, 10).await })
            })
            .collect();
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(quota.current(scope, "k").await.unwrap(), 10);
    }

    #[test]
    fn test_limit_for() {
        let project = ResourceObject::new("project", FqName::parse("d:p"))
            .attr(ATTR_QUOTA, json!({"security_group": 3, "virtual_network": null}));
        assert_eq!(limit_for(&project, "security_group", -1), 3);
        assert_eq!(limit_for(&project, "virtual_network", -1), -1);
        assert_eq!(limit_for(&project, "logical_router", 5), 5);
    }
}
