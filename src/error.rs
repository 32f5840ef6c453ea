//! Error taxonomy for the lifecycle transaction coordinator.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on where an error is observed:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Everything on the request path up to and including `PostProcessing`:
//! validation, allocation, quota reservation, the config store write and
//! secondary-object creation. The first error stops the pipeline and the
//! compensation context is unwound.
//!
//! ## Best-Effort (Log and Continue)
//!
//! - Compensation actions during an unwind
//! - Notification fan-out after the resource is committed
//! - Mirroring a quota counter to the coordination service on release
//!
//! These failures are logged with `warn!` and counted in metrics; they never
//! replace the error the caller already has.
//!
//! # Status codes
//!
//! Every variant maps to an HTTP-like status via [`TxnError::status_code`],
//! so a transport layer can render the result without inspecting messages.

use thiserror::Error;

/// Result type for coordinator operations.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors produced by the coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Client input is malformed or violates a business rule.
    #[error("{0}")]
    Validation(String),

    /// The request touches a field or name the client is not allowed to set.
    ///
    /// This is the permission-style subclass of a conflict: allocator-owned
    /// identifiers set by the client, or a display name already taken.
    #[error("{0}")]
    Forbidden(String),

    /// The addressed resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    /// A uniqueness or referential invariant would be violated.
    #[error("{0}")]
    Conflict(String),

    /// The tenant's quota for this kind would be exceeded.
    #[error("{kind}: {limit}")]
    QuotaExceeded { kind: String, limit: i64 },

    /// The requested value is already claimed by another owner.
    #[error("Value {value} in namespace {namespace} is already owned by {owner}")]
    AllocationConflict {
        namespace: String,
        value: String,
        owner: String,
    },

    /// No free value could be claimed within the bounded number of attempts.
    #[error("Namespace {namespace} exhausted after {attempts} attempts")]
    ResourceExhausted { namespace: String, attempts: u32 },

    /// The requested value lies outside the namespace's domain.
    #[error("Value {value} is out of range for namespace {namespace}")]
    OutOfRange { namespace: String, value: String },

    /// The caller-supplied deadline expired; compensation has already run.
    #[error("Deadline exceeded while {state}")]
    DeadlineExceeded { state: &'static str },

    /// Transient failure talking to the coordination service.
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    /// The coordination-service session expired.
    ///
    /// New requests are refused until the session is re-established.
    #[error("Coordination service session lost")]
    SessionLost,

    /// Transient failure talking to the config store.
    #[error("Config store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid coordinator configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that indicates a bug rather than bad input or bad infrastructure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxnError {
    /// Build a `NotFound` for a resource addressed by anything displayable.
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        TxnError::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// HTTP-like status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            TxnError::Validation(_) | TxnError::OutOfRange { .. } => 400,
            TxnError::Forbidden(_) => 403,
            TxnError::NotFound { .. } => 404,
            TxnError::Conflict(_) | TxnError::AllocationConflict { .. } => 409,
            TxnError::QuotaExceeded { .. } => 412,
            TxnError::CoordinationUnavailable(_)
            | TxnError::SessionLost
            | TxnError::StoreUnavailable(_) => 503,
            TxnError::DeadlineExceeded { .. } => 504,
            TxnError::ResourceExhausted { .. }
            | TxnError::Config(_)
            | TxnError::Serialization(_)
            | TxnError::Internal(_) => 500,
        }
    }

    /// Returns true for transient infrastructure failures.
    ///
    /// Only bounded sub-operations are retried; the pipeline never replays a
    /// whole request on its own.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TxnError::CoordinationUnavailable(_) | TxnError::StoreUnavailable(_)
        )
    }

    /// Returns true if the caller is at fault (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TxnError::NotFound { .. })
    }

    /// Returns true if the coordination session is gone.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, TxnError::SessionLost)
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            TxnError::Validation(_) => "validation",
            TxnError::Forbidden(_) => "forbidden",
            TxnError::NotFound { .. } => "not_found",
            TxnError::Conflict(_) => "conflict",
            TxnError::QuotaExceeded { .. } => "quota_exceeded",
            TxnError::AllocationConflict { .. } => "allocation_conflict",
            TxnError::ResourceExhausted { .. } => "resource_exhausted",
            TxnError::OutOfRange { .. } => "out_of_range",
            TxnError::DeadlineExceeded { .. } => "deadline_exceeded",
            TxnError::CoordinationUnavailable(_) => "coordination_unavailable",
            TxnError::SessionLost => "session_lost",
            TxnError::StoreUnavailable(_) => "store_unavailable",
            TxnError::Config(_) => "config",
            TxnError::Serialization(_) => "serialization",
            TxnError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TxnError::Validation("bad".into()).status_code(), 400);
        assert_eq!(TxnError::Forbidden("no".into()).status_code(), 403);
        assert_eq!(TxnError::not_found("security_group", "abc").status_code(), 404);
        assert_eq!(TxnError::Conflict("refs".into()).status_code(), 409);
        assert_eq!(
            TxnError::QuotaExceeded {
                kind: "security_group".into(),
                limit: 3
            }
            .status_code(),
            412
        );
        assert_eq!(TxnError::SessionLost.status_code(), 503);
        assert_eq!(
            TxnError::DeadlineExceeded {
                state: "Persisting"
            }
            .status_code(),
            504
        );
    }

    #[test]
    fn test_allocation_errors() {
        let conflict = TxnError::AllocationConflict {
            namespace: "vxlan-id".into(),
            value: "100".into(),
            owner: "fab:dci1".into(),
        };
        assert_eq!(conflict.status_code(), 409);
        assert!(conflict.to_string().contains("fab:dci1"));
        assert!(!conflict.is_retriable());

        let exhausted = TxnError::ResourceExhausted {
            namespace: "ae-id".into(),
            attempts: 5,
        };
        assert_eq!(exhausted.status_code(), 500);
        assert!(exhausted.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_quota_message_format() {
        let err = TxnError::QuotaExceeded {
            kind: "security_group_entries".into(),
            limit: 3,
        };
        assert_eq!(err.to_string(), "security_group_entries: 3");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(TxnError::CoordinationUnavailable("timeout".into()).is_retriable());
        assert!(TxnError::StoreUnavailable("down".into()).is_retriable());
        assert!(!TxnError::SessionLost.is_retriable());
        assert!(!TxnError::Validation("x".into()).is_retriable());
    }

    #[test]
    fn test_client_error_classification() {
        assert!(TxnError::Validation("x".into()).is_client_error());
        assert!(TxnError::Conflict("x".into()).is_client_error());
        assert!(!TxnError::StoreUnavailable("x".into()).is_client_error());
        assert!(!TxnError::Internal("x".into()).is_client_error());
    }

    #[test]
    fn test_from_serde_error() {
        let err: TxnError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, TxnError::Serialization(_)));
        assert_eq!(err.as_metric_label(), "serialization");
    }
}
