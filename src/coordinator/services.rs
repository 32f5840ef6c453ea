//! Process-wide handles shared by every pipeline run.

use std::sync::Arc;

use super::allocator::UniqueValueAllocator;
use super::config::CoordinatorConfig;
use super::fq_name::FqNameReservations;
use super::quota::QuotaCounter;
use super::traits::{ConfigStore, CoordinationService, NotificationSink};
use crate::error::TxnResult;

/// Collaborators plus the primitives built on them.
///
/// Created once at startup and shared behind an `Arc`; the quota cache lives
/// exactly as long as this value.
pub struct Services {
    pub config: CoordinatorConfig,
    pub store: Arc<dyn ConfigStore>,
    pub coordination: Arc<dyn CoordinationService>,
    pub notifier: Arc<dyn NotificationSink>,
    pub allocator: UniqueValueAllocator,
    pub quota: QuotaCounter,
    pub fq_names: FqNameReservations,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .field("quota", &self.quota)
            .field("fq_names", &self.fq_names)
            .finish_non_exhaustive()
    }
}

impl Services {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn ConfigStore>,
        coordination: Arc<dyn CoordinationService>,
        notifier: Arc<dyn NotificationSink>,
    ) -> TxnResult<Self> {
        config.validate_or_err()?;
        let allocator = UniqueValueAllocator::with_default_namespaces(coordination.clone(), &config);
        let quota = QuotaCounter::new(store.clone(), coordination.clone(), config.quota_root.clone());
        let fq_names = FqNameReservations::new(coordination.clone(), config.fq_name_root.clone());
        Ok(Self {
            config,
            store,
            coordination,
            notifier,
            allocator,
            quota,
            fq_names,
        })
    }
}
