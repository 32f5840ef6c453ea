//! Compensation records and their executor.
//!
//! Hooks never push closures. Each side effect that must be undone on failure
//! is described by a self-contained [`Compensation`] record, so an unwind can
//! be logged and tested record by record.
//!
//! Records are applied in reverse push order. Application is best-effort: a
//! failing record is logged and counted, and the unwind moves on to the next
//! one. The caller already holds the error that triggered the unwind.

use std::fmt;

use tracing::{debug, warn};
use uuid::Uuid;

use super::allocator::AllocValue;
use super::metrics;
use super::services::Services;
use super::session::SessionGuard;
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ResourceObject};

/// One reversible side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    /// Undo a claim.
    FreeValue {
        namespace: String,
        value: AllocValue,
        owner: String,
    },
    /// Undo an allocation that never reported its value back: free every
    /// value `owner` holds in `namespace` apart from `held`.
    FreeNewClaims {
        namespace: String,
        owner: String,
        held: Vec<AllocValue>,
    },
    /// Undo a free.
    ReclaimValue {
        namespace: String,
        value: AllocValue,
        owner: String,
    },
    /// Undo a reservation of `delta`.
    ReleaseQuota {
        scope: Uuid,
        kind: String,
        delta: i64,
    },
    /// Undo a release of `delta`.
    RestoreQuota {
        scope: Uuid,
        kind: String,
        delta: i64,
    },
    ReleaseFqName {
        kind: String,
        fq_name: FqName,
        uuid: Uuid,
    },
    ReclaimFqName {
        kind: String,
        fq_name: FqName,
        uuid: Uuid,
    },
    /// Undo a store create.
    DeleteObject { kind: String, uuid: Uuid },
    /// Undo a store update by writing the previous version back.
    RestoreObject { object: ResourceObject },
    /// Undo a store delete.
    RecreateObject { object: ResourceObject },
}

impl Compensation {
    /// Label for metrics.
    pub fn action(&self) -> &'static str {
        match self {
            Compensation::FreeValue { .. } => "free_value",
            Compensation::FreeNewClaims { .. } => "free_new_claims",
            Compensation::ReclaimValue { .. } => "reclaim_value",
            Compensation::ReleaseQuota { .. } => "release_quota",
            Compensation::RestoreQuota { .. } => "restore_quota",
            Compensation::ReleaseFqName { .. } => "release_fq_name",
            Compensation::ReclaimFqName { .. } => "reclaim_fq_name",
            Compensation::DeleteObject { .. } => "delete_object",
            Compensation::RestoreObject { .. } => "restore_object",
            Compensation::RecreateObject { .. } => "recreate_object",
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::FreeValue {
                namespace,
                value,
                owner,
            } => write!(f, "free {}/{} held by {}", namespace, value, owner),
            Compensation::FreeNewClaims {
                namespace, owner, ..
            } => write!(f, "free new {} claims of {}", namespace, owner),
            Compensation::ReclaimValue {
                namespace,
                value,
                owner,
            } => write!(f, "reclaim {}/{} for {}", namespace, value, owner),
            Compensation::ReleaseQuota { scope, kind, delta } => {
                write!(f, "release {} {} quota of {}", delta, kind, scope)
            }
            Compensation::RestoreQuota { scope, kind, delta } => {
                write!(f, "restore {} {} quota of {}", delta, kind, scope)
            }
            Compensation::ReleaseFqName { kind, fq_name, .. } => {
                write!(f, "release {} name {}", kind, fq_name)
            }
            Compensation::ReclaimFqName { kind, fq_name, .. } => {
                write!(f, "reclaim {} name {}", kind, fq_name)
            }
            Compensation::DeleteObject { kind, uuid } => write!(f, "delete {} {}", kind, uuid),
            Compensation::RestoreObject { object } => {
                write!(f, "restore {} {}", object.kind, object.uuid)
            }
            Compensation::RecreateObject { object } => {
                write!(f, "recreate {} {}", object.kind, object.uuid)
            }
        }
    }
}

/// Request-scoped stack of compensations.
#[derive(Debug, Default)]
pub struct CompensationContext {
    records: Vec<Compensation>,
}

impl CompensationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, compensation: Compensation) {
        debug!(action = compensation.action(), %compensation, "Pushed compensation");
        self.records.push(compensation);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in push order.
    pub fn records(&self) -> &[Compensation] {
        &self.records
    }

    /// Drop every record pushed after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }
}

/// What an unwind managed to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnwindReport {
    pub applied: usize,
    pub failed: usize,
}

/// Apply a single record.
pub async fn apply(services: &Services, compensation: &Compensation) -> TxnResult<()> {
    match compensation {
        Compensation::FreeValue {
            namespace,
            value,
            owner,
        } => {
            services
                .allocator
                .free(namespace, value, owner, false)
                .await?;
        }
        Compensation::FreeNewClaims {
            namespace,
            owner,
            held,
        } => {
            for value in services.allocator.owned_values(namespace, owner).await? {
                if !held.contains(&value) {
                    services
                        .allocator
                        .free(namespace, &value, owner, false)
                        .await?;
                }
            }
        }
        Compensation::ReclaimValue {
            namespace,
            value,
            owner,
        } => {
            services
                .allocator
                .allocate(namespace, owner, Some(value.clone()))
                .await?;
        }
        Compensation::ReleaseQuota { scope, kind, delta } => {
            services.quota.release(*scope, kind, *delta).await?;
        }
        Compensation::RestoreQuota { scope, kind, delta } => {
            services.quota.release(*scope, kind, -*delta).await?;
        }
        Compensation::ReleaseFqName {
            kind,
            fq_name,
            uuid,
        } => {
            services.fq_names.release(kind, fq_name, *uuid).await?;
        }
        Compensation::ReclaimFqName {
            kind,
            fq_name,
            uuid,
        } => {
            services.fq_names.reserve(kind, fq_name, *uuid).await?;
        }
        Compensation::DeleteObject { uuid, .. } => match services.store.delete(*uuid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        },
        Compensation::RestoreObject { object } => {
            services.store.update(object).await?;
        }
        Compensation::RecreateObject { object } => {
            if let Err(e) = services.store.create(object).await {
                // Already back, e.g. a nested delete unwound first.
                let already_back = matches!(e, TxnError::Conflict(_))
                    && services.store.read(object.uuid).await.is_ok();
                if !already_back {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

/// Drain `context` in reverse order, continuing past failures.
///
/// A lost coordination session seen by any record puts `session` into
/// degraded mode.
pub async fn unwind(
    services: &Services,
    session: &SessionGuard,
    context: CompensationContext,
) -> UnwindReport {
    let mut report = UnwindReport::default();
    for compensation in context.records.into_iter().rev() {
        let result = apply(services, &compensation).await;
        session.observe(&result);
        match result {
            Ok(()) => {
                report.applied += 1;
                metrics::record_compensation(compensation.action(), true);
                debug!(action = compensation.action(), %compensation, "Applied compensation");
            }
            Err(e) => {
                report.failed += 1;
                metrics::record_compensation(compensation.action(), false);
                warn!(
                    action = compensation.action(),
                    %compensation,
                    error = %e,
                    "Compensation failed, continuing unwind"
                );
            }
        }
    }
    report
}
