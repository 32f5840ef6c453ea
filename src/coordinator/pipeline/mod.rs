//! The resource hook pipeline.
//!
//! One [`HookPipeline`] run turns a create, update or delete request into
//! the ordered stages of [`PipelineState`]:
//!
//! | Stage | Create | Update | Delete |
//! |-------|--------|--------|--------|
//! | Validating | structure, parent, `validate_create` | read old, merge patch, `validate_update` | no back refs or children, `validate_delete` |
//! | Allocating | object quota, fq_name, `pre_create` | `pre_update` | object quota, `pre_delete` |
//! | Persisting | store create | store update | store delete, fq_name release |
//! | PostProcessing | `post_create` | `post_update` | `post_delete` |
//! | Notifying | notification hooks of every committed change | | |
//!
//! Every side effect pushes a compensation. A failure in any of the first
//! four stages (including an expired deadline) unwinds the compensations in
//! reverse order before the error is returned. Notification failures are
//! logged only.

mod state;

pub use state::{PipelineState, StateTracker};

use std::future::Future;
use std::sync::Arc;

use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::compensation::{self, Compensation, CompensationContext};
use super::hooks::{HookContext, KindRegistry, PendingNotification, run_notifications};
use super::metrics;
use super::quota::limit_for;
use super::services::Services;
use super::session::SessionGuard;
use crate::constants::KIND_PROJECT;
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ObjectPatch, Operation, ResourceObject, Sideband};

/// Result of a committed request.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub uuid: Uuid,
    pub fq_name: FqName,
    /// The object as created or updated, or as it was before deletion.
    pub object: ResourceObject,
    /// States visited, in order.
    pub transitions: Vec<PipelineState>,
}

enum Request {
    Create(ResourceObject),
    Update {
        kind: String,
        uuid: Uuid,
        patch: ObjectPatch,
    },
    Delete {
        kind: String,
        uuid: Uuid,
    },
}

impl Request {
    fn operation(&self) -> Operation {
        match self {
            Request::Create(_) => Operation::Create,
            Request::Update { .. } => Operation::Update,
            Request::Delete { .. } => Operation::Delete,
        }
    }

    fn kind(&self) -> &str {
        match self {
            Request::Create(obj) => &obj.kind,
            Request::Update { kind, .. } | Request::Delete { kind, .. } => kind,
        }
    }

    fn uuid(&self) -> Uuid {
        match self {
            Request::Create(obj) => obj.uuid,
            Request::Update { uuid, .. } | Request::Delete { uuid, .. } => *uuid,
        }
    }
}

/// Entry point for lifecycle requests.
#[derive(Debug, Clone)]
pub struct HookPipeline {
    services: Arc<Services>,
    registry: Arc<KindRegistry>,
    session: Arc<SessionGuard>,
}

impl HookPipeline {
    pub fn new(services: Arc<Services>, registry: Arc<KindRegistry>) -> Self {
        Self {
            services,
            registry,
            session: Arc::new(SessionGuard::new()),
        }
    }

    /// Share a session guard with other pipelines of the same process.
    pub fn with_session(mut self, session: Arc<SessionGuard>) -> Self {
        self.session = session;
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.session
    }

    pub async fn create(&self, obj: ResourceObject) -> TxnResult<PipelineOutcome> {
        self.execute(Request::Create(obj), None).await
    }

    pub async fn create_with_deadline(
        &self,
        obj: ResourceObject,
        deadline: Instant,
    ) -> TxnResult<PipelineOutcome> {
        self.execute(Request::Create(obj), Some(deadline)).await
    }

    pub async fn update(
        &self,
        kind: &str,
        uuid: Uuid,
        patch: ObjectPatch,
    ) -> TxnResult<PipelineOutcome> {
        let request = Request::Update {
            kind: kind.to_string(),
            uuid,
            patch,
        };
        self.execute(request, None).await
    }

    pub async fn update_with_deadline(
        &self,
        kind: &str,
        uuid: Uuid,
        patch: ObjectPatch,
        deadline: Instant,
    ) -> TxnResult<PipelineOutcome> {
        let request = Request::Update {
            kind: kind.to_string(),
            uuid,
            patch,
        };
        self.execute(request, Some(deadline)).await
    }

    pub async fn delete(&self, kind: &str, uuid: Uuid) -> TxnResult<PipelineOutcome> {
        let request = Request::Delete {
            kind: kind.to_string(),
            uuid,
        };
        self.execute(request, None).await
    }

    pub async fn delete_with_deadline(
        &self,
        kind: &str,
        uuid: Uuid,
        deadline: Instant,
    ) -> TxnResult<PipelineOutcome> {
        let request = Request::Delete {
            kind: kind.to_string(),
            uuid,
        };
        self.execute(request, Some(deadline)).await
    }

    async fn execute(
        &self,
        request: Request,
        deadline: Option<Instant>,
    ) -> TxnResult<PipelineOutcome> {
        let op = request.operation();
        let kind = request.kind().to_string();
        let uuid = request.uuid();
        let started = std::time::Instant::now();

        if let Err(e) = self.session.check() {
            metrics::record_request(&kind, op.as_metric_label(), e.as_metric_label(), 0.0);
            return Err(e);
        }

        let deadline =
            deadline.unwrap_or_else(|| Instant::now() + self.services.config.request_timeout);
        let span = info_span!("pipeline", kind = %kind, op = op.as_metric_label(), uuid = %uuid);

        let result = self
            .run(request, deadline)
            .instrument(span)
            .await;

        self.session.observe(&result);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_metric_label(),
        };
        metrics::record_request(
            &kind,
            op.as_metric_label(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn run(&self, request: Request, deadline: Instant) -> TxnResult<PipelineOutcome> {
        let op = request.operation();
        let mut compensations = CompensationContext::new();
        let mut pending = Vec::new();
        let mut tracker = StateTracker::new();

        let result = {
            let mut cx = HookContext::new(
                &self.services,
                &self.registry,
                &mut compensations,
                &mut pending,
                deadline,
            );
            match request {
                Request::Create(obj) => create_steps(&mut cx, obj, &mut tracker).await,
                Request::Update { kind, uuid, patch } => {
                    update_steps(&mut cx, &kind, uuid, patch, &mut tracker).await
                }
                Request::Delete { kind, uuid } => {
                    delete_steps(&mut cx, &kind, uuid, &mut tracker).await
                }
            }
        };

        match result {
            Ok(object) => {
                tracker.advance(PipelineState::Notifying)?;
                let failed = run_notifications(&self.services, &self.registry, pending).await;
                tracker.advance(PipelineState::Done)?;
                info!(
                    operation = %op,
                    fq_name = %object.fq_name,
                    compensations = compensations.len(),
                    failed_notifications = failed,
                    "Request committed"
                );
                Ok(PipelineOutcome {
                    uuid: object.uuid,
                    fq_name: object.fq_name.clone(),
                    object,
                    transitions: tracker.into_transitions(),
                })
            }
            Err(e) => {
                let failed_in = tracker.current();
                // Rolling back from any stage before Notifying is always valid.
                let _ = tracker.advance(PipelineState::RollingBack);
                let report =
                    compensation::unwind(&self.services, &self.session, compensations).await;
                warn!(
                    operation = %op,
                    state = failed_in.as_str(),
                    error = %e,
                    applied = report.applied,
                    failed = report.failed,
                    "Request failed, compensations unwound"
                );
                Err(e)
            }
        }
    }
}

/// Enter `state` and run `fut` under the request deadline.
///
/// Side effects in `fut` record their compensation before they start, so a
/// stage cut short at the deadline still unwinds calls that were in flight.
async fn stage<T, F>(
    tracker: &mut StateTracker,
    state: PipelineState,
    deadline: Instant,
    fut: F,
) -> TxnResult<T>
where
    F: Future<Output = TxnResult<T>>,
{
    tracker.advance(state)?;
    match timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TxnError::DeadlineExceeded {
            state: state.as_str(),
        }),
    }
}

/// Read an object and check it is of the expected kind.
async fn read_kind(services: &Services, kind: &str, uuid: Uuid) -> TxnResult<ResourceObject> {
    let obj = services.store.read(uuid).await.map_err(|e| {
        if e.is_not_found() {
            TxnError::not_found(kind, uuid)
        } else {
            e
        }
    })?;
    if obj.kind != kind {
        return Err(TxnError::not_found(kind, uuid));
    }
    Ok(obj)
}

/// Structural checks shared by every create. Returns the parent.
async fn check_structure(
    services: &Services,
    obj: &ResourceObject,
) -> TxnResult<Option<ResourceObject>> {
    if obj.fq_name.is_empty() || obj.fq_name.parts().iter().any(String::is_empty) {
        return Err(TxnError::Validation(format!(
            "invalid fq_name '{}' for {}",
            obj.fq_name, obj.kind
        )));
    }
    let Some(parent_uuid) = obj.parent_uuid else {
        return Ok(None);
    };
    let parent = services.store.read(parent_uuid).await.map_err(|e| {
        if e.is_not_found() {
            TxnError::Validation(format!("parent {} of {} does not exist", parent_uuid, obj.fq_name))
        } else {
            e
        }
    })?;
    if let Some(parent_kind) = &obj.parent_kind {
        if &parent.kind != parent_kind {
            return Err(TxnError::Validation(format!(
                "parent {} is a {}, not a {}",
                parent_uuid, parent.kind, parent_kind
            )));
        }
    }
    if obj.fq_name.parent().as_ref() != Some(&parent.fq_name) {
        return Err(TxnError::Validation(format!(
            "fq_name {} is not under parent {}",
            obj.fq_name, parent.fq_name
        )));
    }
    Ok(Some(parent))
}

/// The owning project, if the object's parent is one.
async fn tenant_of(services: &Services, obj: &ResourceObject) -> TxnResult<Option<ResourceObject>> {
    match (obj.parent_uuid, obj.parent_kind.as_deref()) {
        (Some(parent), Some(KIND_PROJECT)) => services.store.read(parent).await.map(Some),
        _ => Ok(None),
    }
}

pub(crate) async fn create_steps(
    cx: &mut HookContext<'_>,
    mut obj: ResourceObject,
    tracker: &mut StateTracker,
) -> TxnResult<ResourceObject> {
    let hooks = cx.registry.get(&obj.kind);
    let deadline = cx.deadline;

    let tenant = stage(tracker, PipelineState::Validating, deadline, async {
        let parent = check_structure(cx.services, &obj).await?;
        let tenant = parent.filter(|p| p.kind == KIND_PROJECT);
        hooks.validate_create(cx, tenant.as_ref(), &obj).await?;
        Ok::<_, TxnError>(tenant)
    })
    .await?;

    stage(tracker, PipelineState::Allocating, deadline, async {
        if let Some(project) = &tenant {
            if obj.is_user_visible() {
                let limit = limit_for(project, &obj.kind, cx.services.config.default_quota_limit);
                cx.reserve_quota(project.uuid, &obj.kind, 1, limit).await?;
            }
        }
        let services = cx.services;
        let release_name = Compensation::ReleaseFqName {
            kind: obj.kind.clone(),
            fq_name: obj.fq_name.clone(),
            uuid: obj.uuid,
        };
        cx.effect(
            release_name.clone(),
            services.fq_names.reserve(&obj.kind, &obj.fq_name, obj.uuid),
            |reserved: &bool| reserved.then_some(release_name),
        )
        .await?;
        hooks.pre_create(cx, tenant.as_ref(), &mut obj).await
    })
    .await?;

    stage(tracker, PipelineState::Persisting, deadline, async {
        let services = cx.services;
        let delete = Compensation::DeleteObject {
            kind: obj.kind.clone(),
            uuid: obj.uuid,
        };
        cx.effect(delete.clone(), services.store.create(&obj), |_| Some(delete))
            .await
    })
    .await?;

    stage(
        tracker,
        PipelineState::PostProcessing,
        deadline,
        hooks.post_create(cx, tenant.as_ref(), &obj),
    )
    .await?;

    cx.pending.push(PendingNotification {
        operation: Operation::Create,
        object: obj.clone(),
        sideband: Sideband::new(),
    });
    Ok(obj)
}

pub(crate) async fn update_steps(
    cx: &mut HookContext<'_>,
    kind: &str,
    uuid: Uuid,
    patch: ObjectPatch,
    tracker: &mut StateTracker,
) -> TxnResult<ResourceObject> {
    let hooks = cx.registry.get(kind);
    let deadline = cx.deadline;

    let (old, mut obj) = stage(tracker, PipelineState::Validating, deadline, async {
        let old = read_kind(cx.services, kind, uuid).await?;
        let obj = patch.apply_to(&old);
        hooks.validate_update(cx, &obj, &old).await?;
        Ok::<_, TxnError>((old, obj))
    })
    .await?;
    let fq_name = old.fq_name.clone();

    let sideband = stage(
        tracker,
        PipelineState::Allocating,
        deadline,
        hooks.pre_update(cx, uuid, &fq_name, &mut obj, &old),
    )
    .await?;

    stage(tracker, PipelineState::Persisting, deadline, async {
        let services = cx.services;
        let restore = Compensation::RestoreObject {
            object: old.clone(),
        };
        cx.effect(restore.clone(), services.store.update(&obj), |_| Some(restore))
            .await
    })
    .await?;

    stage(
        tracker,
        PipelineState::PostProcessing,
        deadline,
        hooks.post_update(cx, uuid, &fq_name, &obj, &sideband),
    )
    .await?;

    cx.pending.push(PendingNotification {
        operation: Operation::Update,
        object: obj.clone(),
        sideband,
    });
    Ok(obj)
}

pub(crate) async fn delete_steps(
    cx: &mut HookContext<'_>,
    kind: &str,
    uuid: Uuid,
    tracker: &mut StateTracker,
) -> TxnResult<ResourceObject> {
    let hooks = cx.registry.get(kind);
    let deadline = cx.deadline;

    let (obj, tenant) = stage(tracker, PipelineState::Validating, deadline, async {
        let obj = read_kind(cx.services, kind, uuid).await?;
        let back_refs = cx.services.store.back_refs(uuid).await?;
        if !back_refs.is_empty() {
            let referrers: Vec<String> = back_refs
                .iter()
                .map(|r| format!("{}:{}", r.kind, r.uuid))
                .collect();
            return Err(TxnError::Conflict(format!(
                "Delete when resource still referred: [{}]",
                referrers.join(", ")
            )));
        }
        let children = cx.services.store.children(uuid).await?;
        if !children.is_empty() {
            return Err(TxnError::Conflict(format!(
                "Delete when children still present: {} children of {}",
                children.len(),
                obj.fq_name
            )));
        }
        hooks.validate_delete(cx, &obj).await?;
        let tenant = tenant_of(cx.services, &obj).await?;
        Ok::<_, TxnError>((obj, tenant))
    })
    .await?;

    let sideband = stage(tracker, PipelineState::Allocating, deadline, async {
        if let Some(project) = &tenant {
            if obj.is_user_visible() {
                cx.release_quota(project.uuid, kind, 1).await?;
            }
        }
        hooks.pre_delete(cx, uuid, &obj).await
    })
    .await?;

    stage(tracker, PipelineState::Persisting, deadline, async {
        let services = cx.services;
        let recreate = Compensation::RecreateObject {
            object: obj.clone(),
        };
        cx.effect(recreate.clone(), services.store.delete(uuid), |_| Some(recreate))
            .await?;
        let reclaim_name = Compensation::ReclaimFqName {
            kind: kind.to_string(),
            fq_name: obj.fq_name.clone(),
            uuid,
        };
        cx.effect(
            reclaim_name.clone(),
            services.fq_names.release(kind, &obj.fq_name, uuid),
            |released: &bool| released.then_some(reclaim_name),
        )
        .await?;
        Ok::<_, TxnError>(())
    })
    .await?;

    stage(
        tracker,
        PipelineState::PostProcessing,
        deadline,
        hooks.post_delete(cx, uuid, &obj, &sideband),
    )
    .await?;

    cx.pending.push(PendingNotification {
        operation: Operation::Delete,
        object: obj.clone(),
        sideband,
    });
    Ok(obj)
}
