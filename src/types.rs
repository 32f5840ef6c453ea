//! Resource model shared by the pipeline, the hooks and the collaborators.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque key/value data a pre-hook hands to its matching post-hook.
pub type Sideband = BTreeMap<String, Value>;

/// Fully-qualified name: an ordered sequence of name segments.
///
/// Rendered as the segments joined with `:`, which is also the form used as
/// an allocation owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FqName(Vec<String>);

impl FqName {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Parse the colon-joined form.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self(Vec::new());
        }
        Self(s.split(':').map(str::to_string).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// The first `n` segments.
    pub fn prefix(&self, n: usize) -> FqName {
        Self(self.0.iter().take(n).cloned().collect())
    }

    /// Everything but the last segment.
    pub fn parent(&self) -> Option<FqName> {
        if self.0.len() < 2 {
            return None;
        }
        Some(self.prefix(self.0.len() - 1))
    }

    pub fn child(&self, name: impl Into<String>) -> FqName {
        let mut parts = self.0.clone();
        parts.push(name.into());
        Self(parts)
    }
}

impl fmt::Display for FqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// A typed reference from one resource to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<Value>,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            kind: kind.into(),
            uuid,
            attr: None,
        }
    }

    pub fn with_attr(mut self, attr: Value) -> Self {
        self.attr = Some(attr);
        self
    }
}

/// A typed configuration resource.
///
/// Identity is the uuid; `fq_name` is unique per kind. Attributes are kept as
/// JSON values since the coordinator only interprets the handful of fields
/// the per-kind hooks care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub uuid: Uuid,
    pub kind: String,
    pub fq_name: FqName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_kind: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub refs: Vec<ObjectRef>,
}

impl ResourceObject {
    /// New object with a random uuid.
    pub fn new(kind: impl Into<String>, fq_name: FqName) -> Self {
        Self::with_uuid(Uuid::new_v4(), kind, fq_name)
    }

    pub fn with_uuid(uuid: Uuid, kind: impl Into<String>, fq_name: FqName) -> Self {
        Self {
            uuid,
            kind: kind.into(),
            fq_name,
            parent_uuid: None,
            parent_kind: None,
            attributes: Map::new(),
            refs: Vec::new(),
        }
    }

    /// Builder: set the parent.
    pub fn parented(mut self, parent: &ResourceObject) -> Self {
        self.parent_uuid = Some(parent.uuid);
        self.parent_kind = Some(parent.kind.clone());
        self
    }

    /// Builder: set an attribute.
    pub fn attr(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Builder: add a reference.
    pub fn reference(mut self, r: ObjectRef) -> Self {
        self.refs.push(r);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// References to objects of the given kind.
    pub fn refs_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ObjectRef> + 'a {
        self.refs.iter().filter(move |r| r.kind == kind)
    }

    /// Whether the object counts against user quotas. Defaults to true.
    pub fn is_user_visible(&self) -> bool {
        self.get_bool(crate::constants::ATTR_USER_VISIBLE)
            .unwrap_or(true)
    }

    /// The fq_name rendered as an allocation owner.
    pub fn owner(&self) -> String {
        self.fq_name.to_string()
    }
}

/// Partial update: attributes to set (a `null` removes the key) and,
/// optionally, a full replacement of the reference list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<ObjectRef>>,
}

impl ObjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn unset(mut self, key: &str) -> Self {
        self.attributes.insert(key.to_string(), Value::Null);
        self
    }

    pub fn refs(mut self, refs: Vec<ObjectRef>) -> Self {
        self.refs = Some(refs);
        self
    }

    /// Apply the patch to a copy of `base`.
    pub fn apply_to(&self, base: &ResourceObject) -> ResourceObject {
        let mut merged = base.clone();
        for (key, value) in &self.attributes {
            if value.is_null() {
                merged.attributes.remove(key);
            } else {
                merged.attributes.insert(key.clone(), value.clone());
            }
        }
        if let Some(refs) = &self.refs {
            merged.refs = refs.clone();
        }
        merged
    }
}

/// Lifecycle operation carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    /// Lower-case label for metrics and spans.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change event fanned out after a resource is committed.
///
/// Delivery is at-least-once; consumers must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: String,
    pub operation: Operation,
    pub uuid: Uuid,
    pub fq_name: String,
}

impl NotificationEvent {
    pub fn for_object(operation: Operation, obj: &ResourceObject) -> Self {
        Self {
            kind: obj.kind.clone(),
            operation,
            uuid: obj.uuid,
            fq_name: obj.fq_name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fq_name_display_and_parse() {
        let fq = FqName::new(["default-domain", "proj", "sg1"]);
        assert_eq!(fq.to_string(), "default-domain:proj:sg1");
        assert_eq!(FqName::parse("default-domain:proj:sg1"), fq);
        assert!(FqName::parse("").is_empty());
    }

    #[test]
    fn test_fq_name_navigation() {
        let fq = FqName::new(["gsc", "qfx1", "xe-0/0/1"]);
        assert_eq!(fq.prefix(2).to_string(), "gsc:qfx1");
        assert_eq!(fq.parent(), Some(FqName::new(["gsc", "qfx1"])));
        assert_eq!(fq.last(), Some("xe-0/0/1"));
        assert_eq!(FqName::new(["only"]).parent(), None);
        assert_eq!(fq.prefix(2).child("ae0").len(), 3);
    }

    #[test]
    fn test_patch_sets_and_removes() {
        let base = ResourceObject::new("virtual_network", FqName::parse("d:p:vn"))
            .attr("a", json!(1))
            .attr("b", json!("keep"));
        let patched = ObjectPatch::new()
            .set("a", json!(2))
            .unset("b")
            .set("c", json!(true))
            .apply_to(&base);

        assert_eq!(patched.get_i64("a"), Some(2));
        assert!(patched.get("b").is_none());
        assert_eq!(patched.get_bool("c"), Some(true));
        assert_eq!(patched.uuid, base.uuid);
    }

    #[test]
    fn test_null_attribute_reads_as_absent() {
        let obj = ResourceObject::new("x", FqName::parse("a:b")).attr("k", Value::Null);
        assert!(obj.get("k").is_none());
        assert!(obj.is_user_visible());
    }

    #[test]
    fn test_notification_event_serializes_upper_case_operation() {
        let obj = ResourceObject::new("security_group", FqName::parse("d:p:sg"));
        let event = NotificationEvent::for_object(Operation::Create, &obj);
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["operation"], "CREATE");
        assert_eq!(encoded["fq_name"], "d:p:sg");
    }
}
