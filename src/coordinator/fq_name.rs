//! Per-kind fq_name reservations.
//!
//! The config store rejects duplicate fq_names on create, but only at the
//! very end of a create. Claiming `{root}/{kind}/{fq_name}` first makes two
//! racing creates of the same name fail before either allocates anything.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::keys::fq_name_path;
use super::traits::CoordinationService;
use crate::error::{TxnError, TxnResult};
use crate::types::FqName;

pub struct FqNameReservations {
    coordination: Arc<dyn CoordinationService>,
    root: String,
}

impl std::fmt::Debug for FqNameReservations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FqNameReservations")
            .field("root", &self.root)
            .finish()
    }
}

impl FqNameReservations {
    pub fn new(coordination: Arc<dyn CoordinationService>, root: impl Into<String>) -> Self {
        Self {
            coordination,
            root: root.into(),
        }
    }

    /// Reserve `fq_name` for `uuid`. Returns `true` if this call created the
    /// reservation, `false` if `uuid` already held it.
    pub async fn reserve(&self, kind: &str, fq_name: &FqName, uuid: Uuid) -> TxnResult<bool> {
        let path = fq_name_path(&self.root, kind, fq_name);
        let body = uuid.to_string();
        if self.coordination.create_if_absent(&path, &body).await? {
            debug!(kind, fq_name = %fq_name, %uuid, "Reserved fq_name");
            return Ok(true);
        }
        match self.coordination.read(&path).await? {
            Some(holder) if holder == body => Ok(false),
            Some(holder) => Err(TxnError::Conflict(format!(
                "{} {} already exists with uuid {}",
                kind, fq_name, holder
            ))),
            // Released between our create and read; the caller may retry.
            None => Err(TxnError::Conflict(format!(
                "{} {} is being modified concurrently",
                kind, fq_name
            ))),
        }
    }

    /// Release the reservation if `uuid` holds it.
    pub async fn release(&self, kind: &str, fq_name: &FqName, uuid: Uuid) -> TxnResult<bool> {
        let path = fq_name_path(&self.root, kind, fq_name);
        match self.coordination.read(&path).await? {
            Some(holder) if holder == uuid.to_string() => {
                self.coordination.delete(&path).await?;
                debug!(kind, fq_name = %fq_name, %uuid, "Released fq_name");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Uuid holding `fq_name`, if reserved.
    pub async fn holder(&self, kind: &str, fq_name: &FqName) -> TxnResult<Option<Uuid>> {
        let path = fq_name_path(&self.root, kind, fq_name);
        Ok(self
            .coordination
            .read(&path)
            .await?
            .and_then(|body| body.parse().ok()))
    }
}
