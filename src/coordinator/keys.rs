//! Coordination-service path layout.
//!
//! | Record | Path | Body |
//! |--------|------|------|
//! | Allocation | `{allocator_root}/{namespace}/{value}` | owner fq_name |
//! | Tombstone | `{allocator_root}/.tombstones/{namespace}/{value}` | last owner |
//! | Quota counter | `{quota_root}/{tenant_uuid}/{kind}` | decimal count |
//! | FQ-name reservation | `{fq_name_root}/{kind}/{fq_name}` | uuid |
//!
//! Every segment goes through [`escape_segment`] so names containing `/`
//! (interface names such as `xe-0/0/1`, CIDR keys) stay a single segment.

use uuid::Uuid;

use crate::constants::TOMBSTONE_DIR;
use crate::types::FqName;

/// Escape a single path segment: `%` → `%25`, `/` → `%2F`.
pub fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_segment`]. Unknown escapes are kept verbatim.
pub fn unescape_segment(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%2F") {
            out.push('/');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Directory holding every claim of a namespace.
pub fn namespace_path(root: &str, namespace: &str) -> String {
    format!("{}/{}", root, escape_segment(namespace))
}

/// Path of a single claim. `value` is the unescaped value text.
pub fn allocation_path(root: &str, namespace: &str, value: &str) -> String {
    format!(
        "{}/{}",
        namespace_path(root, namespace),
        escape_segment(value)
    )
}

/// Path of the tombstone written by a notifying free.
pub fn tombstone_path(root: &str, namespace: &str, value: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        root,
        TOMBSTONE_DIR,
        escape_segment(namespace),
        escape_segment(value)
    )
}

/// Path of a mirrored quota counter.
pub fn quota_path(root: &str, tenant: Uuid, kind: &str) -> String {
    format!("{}/{}/{}", root, tenant, escape_segment(kind))
}

/// Path of an fq-name reservation.
pub fn fq_name_path(root: &str, kind: &str, fq_name: &FqName) -> String {
    format!(
        "{}/{}/{}",
        root,
        escape_segment(kind),
        escape_segment(&fq_name.to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        for raw in ["plain", "xe-0/0/1", "10.0.0.0/24", "100%", "%2F", ""] {
            assert_eq!(unescape_segment(&escape_segment(raw)), raw);
        }
        assert_eq!(escape_segment("a/b"), "a%2Fb");
        assert!(!escape_segment("10.0.0.0/24").contains('/'));
    }

    #[test]
    fn test_unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_segment("50%off"), "50%off");
        assert_eq!(unescape_segment("trailing%"), "trailing%");
    }

    #[test]
    fn test_allocation_layout() {
        assert_eq!(
            allocation_path("/id", "security-group-id", "512"),
            "/id/security-group-id/512"
        );
        assert_eq!(
            allocation_path("/id", "interface-name@gsc:qfx1", "xe-0/0/1"),
            "/id/interface-name@gsc:qfx1/xe-0%2F0%2F1"
        );
        assert_eq!(
            tombstone_path("/id", "security-group-id", "512"),
            "/id/.tombstones/security-group-id/512"
        );
    }

    #[test]
    fn test_quota_and_fq_name_layout() {
        let tenant = Uuid::nil();
        assert_eq!(
            quota_path("/quota-counter", tenant, "security_group"),
            format!("/quota-counter/{}/security_group", tenant)
        );
        let fq = FqName::new(["default-domain", "proj", "sg1"]);
        assert_eq!(
            fq_name_path("/fq-name-to-uuid", "security_group", &fq),
            "/fq-name-to-uuid/security_group/default-domain:proj:sg1"
        );
    }
}
