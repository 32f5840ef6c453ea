//! # cfgtxn
//! Resource lifecycle transaction coordinator for a multi-tenant network
//! configuration control plane.
//!
//! Resources (virtual networks, security groups, logical routers, IPAMs,
//! physical interfaces, ...) are created, updated and deleted through a staged
//! hook pipeline. Globally unique values are claimed on a coordination
//! service, tenant quotas are enforced with counters mirrored there, and any
//! failure part-way through a request rolls every side effect back.
//!
//! # Goals
//! - No leaked allocations: a failed request leaves the allocator and quota
//!   state exactly as it found it
//! - Pluggable collaborators: the config store, coordination service and
//!   notification sink are traits
//! - Per-kind behaviour lives in small [`ResourceHooks`](coordinator::ResourceHooks)
//!   implementations
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cfgtxn::prelude::*;
//! use cfgtxn::coordinator::mock::{InMemoryConfigStore, InMemoryCoordination, RecordingNotifier};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryConfigStore::new();
//!     let project = ResourceObject::new("project", FqName::parse("default-domain:demo"));
//!     store.insert(project.clone()).await;
//!
//!     let services = Services::new(
//!         CoordinatorConfig::default(),
//!         Arc::new(store),
//!         Arc::new(InMemoryCoordination::new()),
//!         Arc::new(RecordingNotifier::new()),
//!     )?;
//!     let pipeline = HookPipeline::new(
//!         Arc::new(services),
//!         Arc::new(KindRegistry::with_reference_kinds()),
//!     );
//!
//!     let network = ResourceObject::new("virtual_network", project.fq_name.child("blue"))
//!         .parented(&project)
//!         .attr("vxlan_network_identifier", json!(100));
//!     let outcome = pipeline.create(network).await?;
//!     println!("created {} ({})", outcome.fq_name, outcome.uuid);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod coordinator;
pub mod error;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for driving the pipeline.
    pub use crate::coordinator::{
        AllocValue, ConfigStore, CoordinationService, CoordinatorConfig, HookContext,
        HookPipeline, KindRegistry, NotificationSink, PipelineOutcome, PipelineState,
        ResourceHooks, Services,
    };
    pub use crate::error::{TxnError, TxnResult};
    pub use crate::types::{
        FqName, NotificationEvent, ObjectPatch, ObjectRef, Operation, ResourceObject, Sideband,
    };
}
