//! In-memory collaborators for testing.
//!
//! Provides a config store, a coordination service and a notification sink
//! that behave like their distributed counterparts (atomic create-if-absent,
//! uniqueness on create, no multi-key transactions) plus fault injection.
//!
//! State lives behind `Arc`, so cloning a collaborator yields a second handle
//! onto the same "cluster". Two pipelines built from clones race against each
//! other exactly like two coordinator processes would.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! cfgtxn = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{ConfigStore, CoordinationService, NotificationSink, missing_object};
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, NotificationEvent, ObjectRef, ResourceObject};

/// Per-operation fault plan shared by the in-memory collaborators.
#[derive(Debug, Default)]
pub struct FaultInjector {
    failures: DashMap<String, u32>,
    hangs: DashSet<String>,
    hangs_after: DashSet<String>,
}

impl FaultInjector {
    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: &str, times: u32) {
        self.failures.insert(op.to_string(), times);
    }

    /// Make every call of `op` hang until the caller gives up.
    pub fn hang(&self, op: &str) {
        self.hangs.insert(op.to_string());
    }

    /// Let every call of `op` take effect, then hang before it returns.
    pub fn hang_after(&self, op: &str) {
        self.hangs_after.insert(op.to_string());
    }

    /// Remove every planned fault.
    pub fn clear(&self) {
        self.failures.clear();
        self.hangs.clear();
        self.hangs_after.clear();
    }

    async fn check(&self, op: &str, make_err: impl FnOnce() -> TxnError) -> TxnResult<()> {
        if self.hangs.contains(op) {
            std::future::pending::<()>().await;
        }
        if let Some(mut remaining) = self.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(make_err());
            }
        }
        Ok(())
    }

    async fn applied(&self, op: &str) {
        if self.hangs_after.contains(op) {
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Config store
// =============================================================================

/// In-memory [`ConfigStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    pub objects: Arc<RwLock<HashMap<Uuid, ResourceObject>>>,
    pub faults: Arc<FaultInjector>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without any checks. Used to seed fixtures.
    pub async fn insert(&self, obj: ResourceObject) {
        self.objects.write().await.insert(obj.uuid, obj);
    }

    /// Read without fault injection.
    pub async fn read_object(&self, uuid: Uuid) -> Option<ResourceObject> {
        self.objects.read().await.get(&uuid).cloned()
    }

    /// Snapshot of every object, ordered by uuid.
    pub async fn snapshot(&self) -> BTreeMap<Uuid, ResourceObject> {
        self.objects
            .read()
            .await
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    async fn fault(&self, op: &str) -> TxnResult<()> {
        self.faults
            .check(op, || {
                TxnError::StoreUnavailable(format!("injected {} failure", op))
            })
            .await
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn read(&self, uuid: Uuid) -> TxnResult<ResourceObject> {
        self.fault("read").await?;
        self.objects
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or_else(|| missing_object(uuid))
    }

    async fn resolve_fq_name(&self, kind: &str, fq_name: &FqName) -> TxnResult<Uuid> {
        self.fault("resolve").await?;
        self.objects
            .read()
            .await
            .values()
            .find(|o| o.kind == kind && &o.fq_name == fq_name)
            .map(|o| o.uuid)
            .ok_or_else(|| TxnError::not_found(kind, fq_name))
    }

    async fn create(&self, obj: &ResourceObject) -> TxnResult<()> {
        self.fault("create").await?;
        {
            let mut objects = self.objects.write().await;
            if objects.contains_key(&obj.uuid) {
                return Err(TxnError::Conflict(format!("uuid {} already exists", obj.uuid)));
            }
            if objects
                .values()
                .any(|o| o.kind == obj.kind && o.fq_name == obj.fq_name)
            {
                return Err(TxnError::Conflict(format!(
                    "{} {} already exists",
                    obj.kind, obj.fq_name
                )));
            }
            objects.insert(obj.uuid, obj.clone());
        }
        self.faults.applied("create").await;
        Ok(())
    }

    async fn update(&self, obj: &ResourceObject) -> TxnResult<()> {
        self.fault("update").await?;
        {
            let mut objects = self.objects.write().await;
            let existing = objects
                .get_mut(&obj.uuid)
                .ok_or_else(|| missing_object(obj.uuid))?;
            *existing = obj.clone();
        }
        self.faults.applied("update").await;
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> TxnResult<()> {
        self.fault("delete").await?;
        let removed = self.objects.write().await.remove(&uuid);
        removed.ok_or_else(|| missing_object(uuid))?;
        self.faults.applied("delete").await;
        Ok(())
    }

    async fn list(&self, kind: &str, parent: Option<Uuid>) -> TxnResult<Vec<ResourceObject>> {
        self.fault("list").await?;
        let mut found: Vec<ResourceObject> = self
            .objects
            .read()
            .await
            .values()
            .filter(|o| o.kind == kind && (parent.is_none() || o.parent_uuid == parent))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.fq_name.cmp(&b.fq_name));
        Ok(found)
    }

    async fn back_refs(&self, uuid: Uuid) -> TxnResult<Vec<ObjectRef>> {
        self.fault("back_refs").await?;
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter_map(|o| {
                o.refs
                    .iter()
                    .find(|r| r.uuid == uuid)
                    .map(|r| ObjectRef {
                        kind: o.kind.clone(),
                        uuid: o.uuid,
                        attr: r.attr.clone(),
                    })
            })
            .collect())
    }

    async fn children(&self, uuid: Uuid) -> TxnResult<Vec<ObjectRef>> {
        self.fault("children").await?;
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|o| o.parent_uuid == Some(uuid))
            .map(|o| ObjectRef::new(o.kind.clone(), o.uuid))
            .collect())
    }
}

// =============================================================================
// Coordination service
// =============================================================================

/// In-memory [`CoordinationService`] backed by an ordered path map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordination {
    pub nodes: Arc<RwLock<BTreeMap<String, String>>>,
    pub faults: Arc<FaultInjector>,
    session_expired: Arc<AtomicBool>,
    lost_races: Arc<AtomicU32>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `SessionLost` until [`restore_session`](Self::restore_session).
    pub fn expire_session(&self) {
        self.session_expired.store(true, Ordering::SeqCst);
    }

    pub fn restore_session(&self) {
        self.session_expired.store(false, Ordering::SeqCst);
    }

    /// Make the next `times` create-if-absent calls report a lost race
    /// without creating anything, as if another writer got there first and
    /// released again.
    pub fn lose_next_races(&self, times: u32) {
        self.lost_races.store(times, Ordering::SeqCst);
    }

    /// Every path under `prefix` with its body.
    pub async fn dump(&self, prefix: &str) -> BTreeMap<String, String> {
        self.nodes
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn fault(&self, op: &str) -> TxnResult<()> {
        if self.session_expired.load(Ordering::SeqCst) {
            return Err(TxnError::SessionLost);
        }
        self.faults
            .check(op, || {
                TxnError::CoordinationUnavailable(format!("injected {} failure", op))
            })
            .await
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordination {
    async fn create_if_absent(&self, path: &str, body: &str) -> TxnResult<bool> {
        self.fault("create_if_absent").await?;
        if self
            .lost_races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }
        {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(path) {
                return Ok(false);
            }
            nodes.insert(path.to_string(), body.to_string());
        }
        self.faults.applied("create_if_absent").await;
        Ok(true)
    }

    async fn read(&self, path: &str) -> TxnResult<Option<String>> {
        self.fault("read").await?;
        Ok(self.nodes.read().await.get(path).cloned())
    }

    async fn put(&self, path: &str, body: &str) -> TxnResult<()> {
        self.fault("put").await?;
        self.nodes
            .write()
            .await
            .insert(path.to_string(), body.to_string());
        self.faults.applied("put").await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> TxnResult<bool> {
        self.fault("delete").await?;
        let removed = self.nodes.write().await.remove(path).is_some();
        self.faults.applied("delete").await;
        Ok(removed)
    }

    async fn children(&self, path: &str) -> TxnResult<Vec<(String, String)>> {
        self.fault("children").await?;
        let prefix = format!("{}/", path);
        Ok(self
            .nodes
            .read()
            .await
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let name = &k[prefix.len()..];
                (!name.contains('/')).then(|| (name.to_string(), v.clone()))
            })
            .collect())
    }
}

// =============================================================================
// Notification sink
// =============================================================================

/// [`NotificationSink`] that records every published event.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    pub events: Arc<RwLock<Vec<NotificationEvent>>>,
    pub faults: Arc<FaultInjector>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn publish(&self, event: &NotificationEvent) -> TxnResult<()> {
        self.faults
            .check("publish", || {
                TxnError::Internal("injected publish failure".to_string())
            })
            .await?;
        self.events.write().await.push(event.clone());
        Ok(())
    }
}
