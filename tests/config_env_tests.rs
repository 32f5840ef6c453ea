//! Integration tests for CoordinatorConfig::from_env()

use std::env;
use std::time::Duration;

use cfgtxn::coordinator::CoordinatorConfig;
use cfgtxn::error::TxnError;
use serial_test::serial;

/// All environment variables read by CoordinatorConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "ALLOCATOR_ROOT",
    "QUOTA_ROOT",
    "FQ_NAME_ROOT",
    "MAX_ALLOCATION_ATTEMPTS",
    "REQUEST_TIMEOUT_MS",
    "SG_ID_MIN_ALLOC",
    "DEFAULT_QUOTA_LIMIT",
];

/// Run `f` with exactly `vars` set among the config variables, restoring the
/// previous values afterwards.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }
    result
}

// ============================================================================
// Defaults and Overrides
// ============================================================================

#[test]
#[serial]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = CoordinatorConfig::from_env().expect("defaults should be valid");
        assert_eq!(config.allocator_root, "/id");
        assert_eq!(config.quota_root, "/quota-counter");
        assert_eq!(config.fq_name_root, "/fq-name-to-uuid");
        assert_eq!(config.max_allocation_attempts, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.security_group_id_min, 8_000_000);
        assert_eq!(config.default_quota_limit, -1);
    });
}

#[test]
#[serial]
fn test_from_env_overrides() {
    with_env_vars(
        &[
            ("ALLOCATOR_ROOT", "/region-a/id"),
            ("MAX_ALLOCATION_ATTEMPTS", "9"),
            ("REQUEST_TIMEOUT_MS", "2500"),
            ("SG_ID_MIN_ALLOC", "1000"),
            ("DEFAULT_QUOTA_LIMIT", "50"),
        ],
        || {
            let config = CoordinatorConfig::from_env().expect("should parse config");
            assert_eq!(config.allocator_root, "/region-a/id");
            assert_eq!(config.max_allocation_attempts, 9);
            assert_eq!(config.request_timeout, Duration::from_millis(2500));
            assert_eq!(config.security_group_id_min, 1000);
            assert_eq!(config.default_quota_limit, 50);
        },
    );
}

#[test]
#[serial]
fn test_from_env_trims_whitespace() {
    with_env_vars(&[("MAX_ALLOCATION_ATTEMPTS", " 3 ")], || {
        let config = CoordinatorConfig::from_env().expect("should parse config");
        assert_eq!(config.max_allocation_attempts, 3);
    });
}

// ============================================================================
// Invalid Values
// ============================================================================

#[test]
#[serial]
fn test_from_env_rejects_unparseable_number() {
    with_env_vars(&[("REQUEST_TIMEOUT_MS", "soon")], || {
        let err = CoordinatorConfig::from_env().unwrap_err();
        assert!(matches!(err, TxnError::Config(_)));
        assert!(err.to_string().contains("REQUEST_TIMEOUT_MS"));
    });
}

#[test]
#[serial]
fn test_from_env_validates_result() {
    with_env_vars(&[("MAX_ALLOCATION_ATTEMPTS", "0")], || {
        let err = CoordinatorConfig::from_env().unwrap_err();
        assert!(matches!(err, TxnError::Config(_)));
        assert!(err.to_string().contains("max_allocation_attempts"));
    });
}

#[test]
#[serial]
fn test_from_env_rejects_relative_root() {
    with_env_vars(&[("QUOTA_ROOT", "quota")], || {
        assert!(CoordinatorConfig::from_env().is_err());
    });
}
