//! Security groups: allocator-owned numeric id plus policy rules counted
//! against the project's `security_group_rule` quota.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{Cidr, index_attr, project_of};
use crate::constants::{
    ATTR_CONFIGURED_SECURITY_GROUP_ID, ATTR_SECURITY_GROUP_ENTRIES, ATTR_SECURITY_GROUP_ID,
    KIND_SECURITY_GROUP, NS_SECURITY_GROUP_ID, QUOTA_SECURITY_GROUP_RULE,
};
use crate::coordinator::allocator::AllocValue;
use crate::coordinator::hooks::{HookContext, ResourceHooks, publish};
use crate::coordinator::quota::{limit_for, rule_count};
use crate::coordinator::services::Services;
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, Operation, ResourceObject, Sideband};

const SIDEBAND_DEALLOCATED_ID: &str = "deallocated_security_group_id";
const SIDEBAND_ALLOCATED_ID: &str = "security_group_id";
const VALID_PROTOCOLS: [&str; 5] = ["any", "icmp", "tcp", "udp", "icmp6"];
/// Keys ignored when looking for duplicate rules.
const RULE_IDENTITY_IGNORED: [&str; 3] = ["rule_uuid", "created", "last_modified"];

#[derive(Debug, Deserialize)]
struct PolicyRule {
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    ethertype: Option<String>,
    #[serde(default)]
    src_addresses: Vec<Address>,
    #[serde(default)]
    dst_addresses: Vec<Address>,
    #[serde(default)]
    src_ports: Vec<PortRange>,
    #[serde(default)]
    dst_ports: Vec<PortRange>,
}

#[derive(Debug, Deserialize)]
struct Address {
    #[serde(default)]
    security_group: Option<String>,
    #[serde(default)]
    subnet: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PortRange {
    start_port: i64,
    end_port: i64,
}

fn rules_of(obj: &ResourceObject) -> &[Value] {
    obj.get(ATTR_SECURITY_GROUP_ENTRIES)
        .and_then(|e| e.get("policy_rule"))
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn rule_identity(rule: &Value) -> Value {
    match rule.as_object() {
        Some(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !RULE_IDENTITY_IGNORED.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => rule.clone(),
    }
}

fn check_protocol(protocol: &str) -> TxnResult<()> {
    let valid = if protocol.chars().all(|c| c.is_ascii_digit()) && !protocol.is_empty() {
        protocol.parse::<u16>().is_ok_and(|p| p <= 255)
    } else {
        VALID_PROTOCOLS.contains(&protocol)
    };
    if valid {
        Ok(())
    } else {
        Err(TxnError::Validation(format!(
            "Rule with invalid protocol : {}",
            protocol
        )))
    }
}

/// Business rules for `security_group_entries`.
fn check_policy_rules(obj: &ResourceObject) -> TxnResult<()> {
    let rules = rules_of(obj);

    let identities: Vec<Value> = rules.iter().map(rule_identity).collect();
    for (index, identity) in identities.iter().enumerate() {
        if identities[index + 1..].contains(identity) {
            let rule_uuid = rules[index]
                .get("rule_uuid")
                .and_then(Value::as_str)
                .unwrap_or("None");
            return Err(TxnError::Conflict(format!(
                "Rule already exists : {}",
                rule_uuid
            )));
        }
    }

    for raw in rules {
        let rule: PolicyRule = serde_json::from_value(raw.clone())
            .map_err(|e| TxnError::Validation(format!("malformed policy rule: {}", e)))?;
        check_protocol(&rule.protocol)?;

        if let Some(ethertype) = &rule.ethertype {
            for subnet in rule
                .src_addresses
                .iter()
                .chain(&rule.dst_addresses)
                .filter_map(|a| a.subnet.as_ref())
            {
                let network = Cidr::from_subnet_value(subnet)?;
                let expected = if network.is_ipv4() { "IPv4" } else { "IPv6" };
                if ethertype != expected {
                    return Err(TxnError::Validation(format!(
                        "Rule subnet {} doesn't match ethertype {}",
                        network, ethertype
                    )));
                }
            }
        }

        let is_local = |a: &Address| a.security_group.as_deref() == Some("local");
        if !rule.src_addresses.iter().any(is_local) && !rule.dst_addresses.iter().any(is_local)
        {
            return Err(TxnError::Validation(
                "At least one of source or destination addresses must be 'local'".to_string(),
            ));
        }

        for ports in rule.src_ports.iter().chain(&rule.dst_ports) {
            if ports.start_port > ports.end_port {
                return Err(TxnError::Validation(format!(
                    "Rule with invalid port range : {}-{}",
                    ports.start_port, ports.end_port
                )));
            }
        }
    }
    Ok(())
}

/// Give every rule without one a fresh `rule_uuid`.
fn assign_rule_uuids(obj: &mut ResourceObject) {
    let Some(rules) = obj
        .attributes
        .get_mut(ATTR_SECURITY_GROUP_ENTRIES)
        .and_then(|e| e.get_mut("policy_rule"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for rule in rules.iter_mut().filter_map(Value::as_object_mut) {
        let missing = rule
            .get("rule_uuid")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty);
        if missing {
            rule.insert("rule_uuid".to_string(), json!(Uuid::new_v4().to_string()));
        }
    }
}

/// A configured id of 0 means "not configured".
fn configured_id(obj: &ResourceObject) -> TxnResult<Option<u64>> {
    Ok(index_attr(obj, ATTR_CONFIGURED_SECURITY_GROUP_ID)?.filter(|id| *id > 0))
}

fn rule_quota_error(err: TxnError) -> TxnError {
    match err {
        TxnError::QuotaExceeded { limit, .. } => TxnError::QuotaExceeded {
            kind: ATTR_SECURITY_GROUP_ENTRIES.to_string(),
            limit,
        },
        other => other,
    }
}

#[derive(Debug, Default)]
pub struct SecurityGroupHooks;

impl SecurityGroupHooks {
    fn check_configured_id(services: &Services, obj: &ResourceObject) -> TxnResult<()> {
        if let Some(id) = configured_id(obj)? {
            if id >= services.config.security_group_id_min {
                return Err(TxnError::Validation(format!(
                    "configured_security_group_id {} must be below {}",
                    id, services.config.security_group_id_min
                )));
            }
        }
        Ok(())
    }

    async fn reserve_rules(
        cx: &mut HookContext<'_>,
        obj: &ResourceObject,
        delta: i64,
    ) -> TxnResult<()> {
        if delta == 0 || !obj.is_user_visible() {
            return Ok(());
        }
        let Some(project) = project_of(cx, obj).await? else {
            return Ok(());
        };
        if delta < 0 {
            return cx
                .release_quota(project.uuid, QUOTA_SECURITY_GROUP_RULE, -delta)
                .await;
        }
        let limit = limit_for(
            &project,
            QUOTA_SECURITY_GROUP_RULE,
            cx.services.config.default_quota_limit,
        );
        cx.reserve_quota(project.uuid, QUOTA_SECURITY_GROUP_RULE, delta, limit)
            .await
            .map_err(rule_quota_error)
    }

    /// Pick the id for `obj`: a configured id wins and releases any
    /// allocated one, otherwise keep or allocate an allocator id.
    ///
    /// Returns the previous id if it was an allocator id and was given up.
    async fn assign_id(cx: &mut HookContext<'_>, obj: &mut ResourceObject) -> TxnResult<Option<u64>> {
        let owner = obj.owner();
        // Configured ids sit below the allocator range and were never claimed.
        let min = cx.services.config.security_group_id_min;
        let current = obj
            .get_u64(ATTR_SECURITY_GROUP_ID)
            .filter(|id| *id >= min);

        let next = match configured_id(obj)? {
            Some(configured) => {
                if let Some(id) = current.filter(|id| *id != configured) {
                    cx.free(NS_SECURITY_GROUP_ID, &AllocValue::Index(id), &owner)
                        .await?;
                }
                configured
            }
            None => {
                let allocation = cx.allocate(NS_SECURITY_GROUP_ID, &owner, None).await?;
                allocation.value.as_index().ok_or_else(|| {
                    TxnError::Internal("security group id namespace is not numeric".to_string())
                })?
            }
        };
        obj.set(ATTR_SECURITY_GROUP_ID, json!(next));
        Ok(current.filter(|id| *id != next))
    }
}

#[async_trait]
impl ResourceHooks for SecurityGroupHooks {
    fn kind(&self) -> &str {
        KIND_SECURITY_GROUP
    }

    async fn validate_create(
        &self,
        cx: &HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        check_policy_rules(obj)?;
        if obj.get(ATTR_SECURITY_GROUP_ID).is_some() {
            return Err(TxnError::Forbidden(
                "Cannot set the security group ID".to_string(),
            ));
        }
        Self::check_configured_id(cx.services, obj)
    }

    async fn pre_create(
        &self,
        cx: &mut HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &mut ResourceObject,
    ) -> TxnResult<()> {
        assign_rule_uuids(obj);
        Self::reserve_rules(cx, obj, rule_count(obj)).await?;
        Self::assign_id(cx, obj).await?;
        Ok(())
    }

    async fn validate_update(
        &self,
        cx: &HookContext<'_>,
        obj: &ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<()> {
        if obj.get(ATTR_SECURITY_GROUP_ID) != old.get(ATTR_SECURITY_GROUP_ID) {
            return Err(TxnError::Forbidden(
                "Cannot update the security group ID".to_string(),
            ));
        }
        check_policy_rules(obj)?;
        Self::check_configured_id(cx.services, obj)
    }

    async fn pre_update(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        _fq_name: &FqName,
        obj: &mut ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<Sideband> {
        assign_rule_uuids(obj);
        Self::reserve_rules(cx, obj, rule_count(obj) - rule_count(old)).await?;

        let mut sideband = Sideband::new();
        if configured_id(obj)? != configured_id(old)? {
            if let Some(released) = Self::assign_id(cx, obj).await? {
                sideband.insert(SIDEBAND_DEALLOCATED_ID.to_string(), json!(released));
            }
        }
        Ok(sideband)
    }

    async fn pre_delete(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        obj: &ResourceObject,
    ) -> TxnResult<Sideband> {
        Self::reserve_rules(cx, obj, -rule_count(obj)).await?;

        let mut sideband = Sideband::new();
        if configured_id(obj)?.is_none() {
            if let Some(id) = obj.get_u64(ATTR_SECURITY_GROUP_ID) {
                cx.free(NS_SECURITY_GROUP_ID, &AllocValue::Index(id), &obj.owner())
                    .await?;
                sideband.insert(SIDEBAND_ALLOCATED_ID.to_string(), json!(id));
            }
        }
        Ok(sideband)
    }

    async fn update_notification(
        &self,
        services: &Services,
        obj: &ResourceObject,
        sideband: &Sideband,
    ) -> TxnResult<()> {
        let freed = notify_free(services, obj, sideband.get(SIDEBAND_DEALLOCATED_ID)).await;
        publish(services, Operation::Update, obj).await?;
        freed
    }

    async fn delete_notification(
        &self,
        services: &Services,
        obj: &ResourceObject,
        sideband: &Sideband,
    ) -> TxnResult<()> {
        let freed = notify_free(services, obj, sideband.get(SIDEBAND_ALLOCATED_ID)).await;
        publish(services, Operation::Delete, obj).await?;
        freed
    }
}

/// Re-issue a free with `notify` so watchers see the id go away.
async fn notify_free(services: &Services, obj: &ResourceObject, id: Option<&Value>) -> TxnResult<()> {
    let Some(id) = id.and_then(Value::as_u64) else {
        return Ok(());
    };
    let outcome = services
        .allocator
        .free(NS_SECURITY_GROUP_ID, &AllocValue::Index(id), &obj.owner(), true)
        .await?;
    debug!(id, ?outcome, fq_name = %obj.fq_name, "Notified security group id release");
    Ok(())
}
