//! Coordination session health tracking.
//!
//! Losing the coordination-service session means allocation records and
//! quota counters can no longer be trusted from this process. When any
//! collaborator call surfaces [`TxnError::SessionLost`], the guard enters
//! degraded mode and every new request is refused with `SessionLost` before
//! it reaches `Validating`. Requests already in flight finish (and unwind)
//! normally.
//!
//! Recovery is explicit: [`SessionGuard::try_recover`] pings the
//! coordination service and leaves degraded mode only if the ping succeeds
//! and no new loss was recorded while probing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use super::metrics;
use super::traits::CoordinationService;
use crate::error::{TxnError, TxnResult};

/// Degraded-mode flag plus entry timestamp.
#[derive(Debug, Default)]
pub struct SessionGuard {
    degraded: AtomicBool,
    /// Epoch millis of the most recent entry, 0 when healthy.
    entered_at_millis: AtomicU64,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn entered_at(&self) -> u64 {
        self.entered_at_millis.load(Ordering::SeqCst)
    }

    /// Enter degraded mode. Returns `true` on the first entry.
    pub fn enter(&self) -> bool {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);
        // Refresh the timestamp on every loss so a ping started earlier
        // cannot clear a newer entry.
        self.entered_at_millis.store(now_millis, Ordering::SeqCst);
        if !self.degraded.swap(true, Ordering::SeqCst) {
            error!("Coordination session lost, refusing new requests");
            metrics::enter_degraded_mode();
            true
        } else {
            false
        }
    }

    /// Fail fast while degraded.
    pub fn check(&self) -> TxnResult<()> {
        if self.is_degraded() {
            Err(TxnError::SessionLost)
        } else {
            Ok(())
        }
    }

    /// Inspect a result and enter degraded mode on session loss.
    pub fn observe<T>(&self, result: &TxnResult<T>) {
        if let Err(TxnError::SessionLost) = result {
            self.enter();
        }
    }

    /// Ping the coordination service and leave degraded mode on success.
    ///
    /// Returns `true` if the guard is healthy afterwards.
    pub async fn try_recover(&self, coordination: &dyn CoordinationService) -> bool {
        if !self.is_degraded() {
            return true;
        }
        let entered_at = self.entered_at();
        if coordination.ping().await.is_err() {
            return false;
        }
        // A loss recorded while probing wins over this recovery.
        if self
            .entered_at_millis
            .compare_exchange(entered_at, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.degraded.store(false, Ordering::SeqCst);
        let duration_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(entered_at)
            .saturating_sub(entered_at);
        info!(duration_ms, "Coordination session re-established");
        metrics::exit_degraded_mode();
        true
    }
}
