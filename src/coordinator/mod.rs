//! Resource lifecycle transaction coordinator.
//!
//! Every create, update or delete of a configuration resource runs through a
//! [`HookPipeline`]. The pipeline drives the resource kind's hooks through a
//! fixed sequence of stages, and every side effect a hook performs against
//! shared state records a compensation:
//!
//! - **Allocator**: unique values (ids, VXLAN ids, names, subnets) claimed by
//!   create-if-absent on the coordination service
//! - **Quota**: per-tenant counters mirrored on the coordination service
//! - **FQ names**: one uuid per `(kind, fq_name)`
//!
//! If any stage fails, or the request deadline expires, the compensations
//! are applied in reverse order before the error reaches the caller.
//!
//! # Architecture
//!
//! ```text
//!        create / update / delete
//!                   │
//!            ┌──────▼──────┐      ┌──────────────┐
//!            │ HookPipeline│─────►│ KindRegistry │ per-kind ResourceHooks
//!            └──────┬──────┘      └──────────────┘
//!                   │ HookContext (compensations, deadline)
//!     ┌─────────────┼──────────────┬───────────────┐
//!     ▼             ▼              ▼               ▼
//! ┌─────────┐ ┌───────────┐ ┌─────────────┐ ┌──────────────┐
//! │Allocator│ │QuotaCounter│ │FqNameReserv.│ │ ConfigStore  │
//! └────┬────┘ └─────┬─────┘ └──────┬──────┘ └──────────────┘
//!      └────────────┼──────────────┘
//!                   ▼
//!         ┌──────────────────────┐
//!         │ CoordinationService  │
//!         └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cfgtxn::coordinator::{CoordinatorConfig, HookPipeline, KindRegistry, Services};
//! use cfgtxn::coordinator::mock::{InMemoryConfigStore, InMemoryCoordination, RecordingNotifier};
//!
//! # async fn run() -> cfgtxn::error::TxnResult<()> {
//! let services = Services::new(
//!     CoordinatorConfig::from_env()?,
//!     Arc::new(InMemoryConfigStore::new()),
//!     Arc::new(InMemoryCoordination::new()),
//!     Arc::new(RecordingNotifier::new()),
//! )?;
//! let pipeline = HookPipeline::new(
//!     Arc::new(services),
//!     Arc::new(KindRegistry::with_reference_kinds()),
//! );
//! # let _ = pipeline;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod compensation;
pub mod config;
pub mod fq_name;
pub mod hooks;
pub mod keys;
pub mod kinds;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod quota;
pub mod retry;
pub mod services;
pub mod session;
mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use allocator::{AllocValue, Allocation, FreeOutcome, NamespaceSpec, UniqueValueAllocator};
pub use compensation::{Compensation, CompensationContext, UnwindReport};
pub use config::CoordinatorConfig;
pub use fq_name::FqNameReservations;
pub use hooks::{GenericHooks, HookContext, KindRegistry, ResourceHooks};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock::{FaultInjector, InMemoryConfigStore, InMemoryCoordination, RecordingNotifier};
pub use notify::BroadcastNotifier;
pub use pipeline::{HookPipeline, PipelineOutcome, PipelineState};
pub use quota::{QuotaChange, QuotaCounter};
pub use services::Services;
pub use session::SessionGuard;
pub use traits::{ConfigStore, CoordinationService, NotificationSink, missing_object};
