//! Coordinator configuration.
//!
//! Defaults suit a single-region deployment; every field can be overridden
//! from the environment via [`CoordinatorConfig::from_env`].

use std::time::Duration;

use crate::constants::{
    DEFAULT_ALLOCATOR_ROOT, DEFAULT_FQ_NAME_ROOT, DEFAULT_MAX_ALLOCATION_ATTEMPTS,
    DEFAULT_QUOTA_LIMIT, DEFAULT_QUOTA_ROOT, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SG_ID_MIN_ALLOC,
    SG_ID_MAX,
};
use crate::error::{TxnError, TxnResult};

/// Configuration for the lifecycle transaction coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Coordination-service root for allocation records.
    pub allocator_root: String,

    /// Coordination-service root for mirrored quota counters.
    pub quota_root: String,

    /// Coordination-service root for fq-name reservations.
    pub fq_name_root: String,

    /// Bounded create-if-absent attempts when claiming the next free value.
    pub max_allocation_attempts: u32,

    /// Deadline applied to requests that do not carry their own.
    pub request_timeout: Duration,

    /// First security-group id handed out by the allocator.
    ///
    /// Lower ids are reserved for `configured_security_group_id`.
    pub security_group_id_min: u64,

    /// Quota limit used when a project has no entry for a kind.
    /// Negative means unlimited.
    pub default_quota_limit: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            allocator_root: DEFAULT_ALLOCATOR_ROOT.to_string(),
            quota_root: DEFAULT_QUOTA_ROOT.to_string(),
            fq_name_root: DEFAULT_FQ_NAME_ROOT.to_string(),
            max_allocation_attempts: DEFAULT_MAX_ALLOCATION_ATTEMPTS,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            security_group_id_min: DEFAULT_SG_ID_MIN_ALLOC,
            default_quota_limit: DEFAULT_QUOTA_LIMIT,
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, root) in [
            ("allocator_root", &self.allocator_root),
            ("quota_root", &self.quota_root),
            ("fq_name_root", &self.fq_name_root),
        ] {
            if !root.starts_with('/') || root.len() < 2 {
                errors.push(format!("{} ({:?}) must be a non-root absolute path", name, root));
            }
            if root.ends_with('/') {
                errors.push(format!("{} ({:?}) must not end with '/'", name, root));
            }
        }

        let roots = [&self.allocator_root, &self.quota_root, &self.fq_name_root];
        for (i, a) in roots.iter().enumerate() {
            for b in roots.iter().skip(i + 1) {
                if a == b || a.starts_with(&format!("{}/", b)) || b.starts_with(&format!("{}/", a))
                {
                    errors.push(format!("coordination roots {:?} and {:?} overlap", a, b));
                }
            }
        }

        if self.max_allocation_attempts == 0 {
            errors.push("max_allocation_attempts must be at least 1".to_string());
        }

        if self.request_timeout.is_zero() {
            errors.push("request_timeout must be non-zero".to_string());
        }

        if self.security_group_id_min == 0 || self.security_group_id_min >= SG_ID_MAX {
            errors.push(format!(
                "security_group_id_min ({}) must be between 1 and {}",
                self.security_group_id_min,
                SG_ID_MAX - 1
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every problem into a single `Config` error.
    pub fn validate_or_err(&self) -> TxnResult<()> {
        self.validate()
            .map_err(|errors| TxnError::Config(errors.join("; ")))
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ALLOCATOR_ROOT` (default: `/id`)
    /// - `QUOTA_ROOT` (default: `/quota-counter`)
    /// - `FQ_NAME_ROOT` (default: `/fq-name-to-uuid`)
    /// - `MAX_ALLOCATION_ATTEMPTS` (default: 5)
    /// - `REQUEST_TIMEOUT_MS` (default: 30000)
    /// - `SG_ID_MIN_ALLOC` (default: 8000000)
    /// - `DEFAULT_QUOTA_LIMIT` (default: -1)
    ///
    /// The result is validated before it is returned.
    pub fn from_env() -> TxnResult<Self> {
        let defaults = Self::default();

        let config = Self {
            allocator_root: std::env::var("ALLOCATOR_ROOT").unwrap_or(defaults.allocator_root),
            quota_root: std::env::var("QUOTA_ROOT").unwrap_or(defaults.quota_root),
            fq_name_root: std::env::var("FQ_NAME_ROOT").unwrap_or(defaults.fq_name_root),
            max_allocation_attempts: parse_env(
                "MAX_ALLOCATION_ATTEMPTS",
                defaults.max_allocation_attempts,
            )?,
            request_timeout: Duration::from_millis(parse_env(
                "REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            security_group_id_min: parse_env("SG_ID_MIN_ALLOC", defaults.security_group_id_min)?,
            default_quota_limit: parse_env("DEFAULT_QUOTA_LIMIT", defaults.default_quota_limit)?,
        };

        config.validate_or_err()?;
        Ok(config)
    }
}

fn parse_env<T>(name: &str, default: T) -> TxnResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| TxnError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
