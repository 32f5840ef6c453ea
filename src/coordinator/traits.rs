//! Trait definitions for the coordinator's external collaborators.
//!
//! These traits abstract the two distributed backends and the notification
//! bus, allowing the pipeline to run against real clients in production and
//! in-memory implementations in tests.
//!
//! # Trait Hierarchy
//!
//! - [`ConfigStore`]: typed resource storage (no transactions)
//! - [`CoordinationService`]: strongly consistent named paths with atomic
//!   create-if-absent (no multi-key transactions)
//! - [`NotificationSink`]: at-least-once change fan-out
//!
//! Implementations surface infrastructure failures as
//! `StoreUnavailable` / `CoordinationUnavailable` / `SessionLost`, never as
//! panics, so the pipeline can convert them before unwinding.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, NotificationEvent, ObjectRef, ResourceObject};

/// Point reads and writes of typed resources.
///
/// A write that returns `Ok` is assumed durable before the caller observes
/// success. There is no multi-object atomicity.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a resource by uuid.
    async fn read(&self, uuid: Uuid) -> TxnResult<ResourceObject>;

    /// Resolve a fully-qualified name to the uuid of the resource of `kind`.
    async fn resolve_fq_name(&self, kind: &str, fq_name: &FqName) -> TxnResult<Uuid>;

    /// Read a resource by kind and fully-qualified name.
    async fn read_by_fq_name(&self, kind: &str, fq_name: &FqName) -> TxnResult<ResourceObject> {
        let uuid = self.resolve_fq_name(kind, fq_name).await?;
        self.read(uuid).await
    }

    /// Create a resource. Fails with `Conflict` if the uuid or
    /// `(kind, fq_name)` already exists.
    async fn create(&self, obj: &ResourceObject) -> TxnResult<()>;

    /// Replace an existing resource.
    async fn update(&self, obj: &ResourceObject) -> TxnResult<()>;

    /// Delete a resource by uuid.
    async fn delete(&self, uuid: Uuid) -> TxnResult<()>;

    /// List resources of `kind`, optionally restricted to one parent.
    async fn list(&self, kind: &str, parent: Option<Uuid>) -> TxnResult<Vec<ResourceObject>>;

    /// Count resources of `kind` under an optional parent.
    async fn count(&self, kind: &str, parent: Option<Uuid>) -> TxnResult<u64> {
        Ok(self.list(kind, parent).await?.len() as u64)
    }

    /// References pointing at `uuid`, one entry per referring resource.
    async fn back_refs(&self, uuid: Uuid) -> TxnResult<Vec<ObjectRef>>;

    /// Resources whose parent is `uuid`.
    async fn children(&self, uuid: Uuid) -> TxnResult<Vec<ObjectRef>>;
}

/// A strongly consistent path registry (Zookeeper/etcd class).
///
/// Paths are `/`-separated. Existence of a path is a claim; the body is an
/// opaque string.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Atomically create `path` with `body` if it does not exist.
    ///
    /// Returns `true` if this call created the path.
    async fn create_if_absent(&self, path: &str, body: &str) -> TxnResult<bool>;

    /// Read the body at `path`, if present.
    async fn read(&self, path: &str) -> TxnResult<Option<String>>;

    /// Create or overwrite `path` unconditionally.
    async fn put(&self, path: &str, body: &str) -> TxnResult<()>;

    /// Delete `path`. Returns `true` if it existed.
    async fn delete(&self, path: &str) -> TxnResult<bool>;

    /// Immediate children of `path` as `(name, body)` pairs.
    async fn children(&self, path: &str) -> TxnResult<Vec<(String, String)>>;

    /// Cheap liveness check used to leave degraded mode.
    async fn ping(&self) -> TxnResult<()> {
        self.read("/").await.map(|_| ())
    }
}

/// Fan-out of committed changes to downstream consumers.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &NotificationEvent) -> TxnResult<()>;
}

/// Convenience for store implementations: the standard not-found error.
pub fn missing_object(uuid: Uuid) -> TxnError {
    TxnError::not_found("object", uuid)
}
