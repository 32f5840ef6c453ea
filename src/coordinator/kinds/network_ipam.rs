use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::Cidr;
use crate::constants::{
    ATTR_IPAM_SUBNET_METHOD, ATTR_IPAM_SUBNETS, ATTR_IPAM_SUBNETTING, KIND_NETWORK_IPAM,
    NS_IPAM_SUBNET,
};
use crate::coordinator::allocator::AllocValue;
use crate::coordinator::hooks::{HookContext, ResourceHooks};
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ResourceObject, Sideband};

const USER_DEFINED: &str = "user-defined-subnet";
const FLAT: &str = "flat-subnet";
const AUTO: &str = "auto-subnet";

fn subnet_method(obj: &ResourceObject) -> &str {
    obj.get_str(ATTR_IPAM_SUBNET_METHOD).unwrap_or(USER_DEFINED)
}

fn subnetting(obj: &ResourceObject) -> bool {
    obj.get_bool(ATTR_IPAM_SUBNETTING).unwrap_or(false)
}

/// Flat subnets of the ipam, normalized and checked for overlaps.
fn flat_subnets(obj: &ResourceObject) -> TxnResult<Vec<Cidr>> {
    let Some(entries) = obj
        .get(ATTR_IPAM_SUBNETS)
        .and_then(|s| s.get("subnets"))
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };

    let mut subnets: Vec<Cidr> = Vec::with_capacity(entries.len());
    for entry in entries {
        let subnet = entry.get("subnet").ok_or_else(|| {
            TxnError::Validation(format!("ipam subnet entry without subnet: {}", entry))
        })?;
        let cidr = Cidr::from_subnet_value(subnet)?;
        if let Some(existing) = subnets.iter().find(|s| s.overlaps(&cidr)) {
            return Err(TxnError::Validation(format!(
                "Overlapping addresses: {} and {}",
                existing, cidr
            )));
        }
        subnets.push(cidr);
    }
    Ok(subnets)
}

fn check_method(obj: &ResourceObject) -> TxnResult<()> {
    let method = subnet_method(obj);
    if ![USER_DEFINED, FLAT, AUTO].contains(&method) {
        return Err(TxnError::Validation(format!(
            "Invalid ipam_subnet_method '{}'",
            method
        )));
    }
    if method != FLAT {
        if obj.get(ATTR_IPAM_SUBNETS).is_some() {
            return Err(TxnError::Validation(
                "ipam-subnets are allowed only with flat-subnet".to_string(),
            ));
        }
        if subnetting(obj) {
            return Err(TxnError::Validation(
                "subnetting is allowed only with flat-subnet".to_string(),
            ));
        }
    }
    flat_subnets(obj)?;
    Ok(())
}

fn subnet_taken(err: TxnError) -> TxnError {
    match err {
        TxnError::AllocationConflict { value, owner, .. } => TxnError::Conflict(format!(
            "Subnet {} is already used by ipam {}",
            value, owner
        )),
        other => other,
    }
}

/// Network IPAMs register their flat subnets so two IPAMs cannot carry the
/// same prefix.
#[derive(Debug, Default)]
pub struct NetworkIpamHooks;

impl NetworkIpamHooks {
    async fn claim(cx: &mut HookContext<'_>, owner: &str, subnets: &[Cidr]) -> TxnResult<()> {
        for subnet in subnets {
            cx.allocate(NS_IPAM_SUBNET, owner, Some(AllocValue::Key(subnet.to_string())))
                .await
                .map_err(subnet_taken)?;
        }
        Ok(())
    }

    async fn release(cx: &mut HookContext<'_>, owner: &str, subnets: &[Cidr]) -> TxnResult<()> {
        for subnet in subnets {
            cx.free(NS_IPAM_SUBNET, &AllocValue::Key(subnet.to_string()), owner)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHooks for NetworkIpamHooks {
    fn kind(&self) -> &str {
        KIND_NETWORK_IPAM
    }

    async fn validate_create(
        &self,
        _cx: &HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        check_method(obj)
    }

    async fn pre_create(
        &self,
        cx: &mut HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &mut ResourceObject,
    ) -> TxnResult<()> {
        let subnets = flat_subnets(obj)?;
        Self::claim(cx, &obj.owner(), &subnets).await
    }

    async fn validate_update(
        &self,
        _cx: &HookContext<'_>,
        obj: &ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<()> {
        if subnet_method(obj) != subnet_method(old) {
            return Err(TxnError::Validation(
                "ipam_subnet_method can not be changed".to_string(),
            ));
        }
        if subnetting(obj) != subnetting(old) {
            return Err(TxnError::Validation(
                "ipam_subnetting can not be changed".to_string(),
            ));
        }
        check_method(obj)
    }

    async fn pre_update(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        fq_name: &FqName,
        obj: &mut ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<Sideband> {
        let new: BTreeSet<Cidr> = flat_subnets(obj)?.into_iter().collect();
        let old: BTreeSet<Cidr> = flat_subnets(old)?.into_iter().collect();
        let owner = fq_name.to_string();

        let added: Vec<Cidr> = new.difference(&old).copied().collect();
        let removed: Vec<Cidr> = old.difference(&new).copied().collect();
        Self::claim(cx, &owner, &added).await?;
        Self::release(cx, &owner, &removed).await?;
        Ok(Sideband::new())
    }

    async fn pre_delete(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        obj: &ResourceObject,
    ) -> TxnResult<Sideband> {
        Self::release(cx, &obj.owner(), &flat_subnets(obj)?).await?;
        Ok(Sideband::new())
    }
}
