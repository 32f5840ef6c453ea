//! Physical interfaces.
//!
//! Display names are unique per physical router, enforced by a keyed claim in
//! `interface-name@<router>`. Aggregated interfaces also hold an ae-id from
//! the router-scoped `ae-id@<router>` namespace.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::index_attr;
use crate::constants::{
    ATTR_AE_ID, ATTR_AE_INTERFACE_NAME, ATTR_AGGREGATED, ATTR_DISPLAY_NAME, ATTR_ESI,
    KIND_PHYSICAL_INTERFACE, KIND_PHYSICAL_ROUTER, NAMESPACE_SCOPE_SEPARATOR, NS_AE_ID,
    NS_INTERFACE_NAME,
};
use crate::coordinator::allocator::AllocValue;
use crate::coordinator::hooks::{HookContext, ResourceHooks};
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ResourceObject, Sideband};

/// Octet pairs in an ESI.
const ESI_OCTETS: usize = 10;

/// `XX:XX:...:XX`, ten hex octets. Trailing text is ignored.
fn check_esi(esi: &str) -> TxnResult<()> {
    let invalid = || TxnError::Validation("Invalid ESI string format".to_string());
    let bytes = esi.as_bytes();
    if bytes.len() < ESI_OCTETS * 3 - 1 {
        return Err(invalid());
    }
    for octet in 0..ESI_OCTETS {
        let at = octet * 3;
        if !bytes[at].is_ascii_hexdigit() || !bytes[at + 1].is_ascii_hexdigit() {
            return Err(invalid());
        }
        if octet + 1 < ESI_OCTETS && bytes[at + 2] != b':' {
            return Err(invalid());
        }
    }
    Ok(())
}

fn router_scope(fq_name: &FqName) -> String {
    fq_name.prefix(2).to_string()
}

fn scoped(family: &str, fq_name: &FqName) -> String {
    format!("{}{}{}", family, NAMESPACE_SCOPE_SEPARATOR, router_scope(fq_name))
}

fn display_name(obj: &ResourceObject) -> Option<&str> {
    obj.get_str(ATTR_DISPLAY_NAME).or_else(|| obj.fq_name.last())
}

fn aggregated(obj: &ResourceObject) -> bool {
    obj.get_bool(ATTR_AGGREGATED).unwrap_or(false)
}

fn ae_id(obj: &ResourceObject) -> TxnResult<Option<AllocValue>> {
    Ok(index_attr(obj, ATTR_AE_ID)?.map(AllocValue::Index))
}

fn name_taken(err: TxnError) -> TxnError {
    match err {
        TxnError::AllocationConflict { owner, .. } => TxnError::Forbidden(format!(
            "Display name already used in another interface : {}",
            owner
        )),
        other => other,
    }
}

fn ae_taken(err: TxnError) -> TxnError {
    match err {
        TxnError::AllocationConflict { value, owner, .. } => TxnError::Forbidden(format!(
            "ae-id {} already used by interface {}",
            value, owner
        )),
        other => other,
    }
}

#[derive(Debug, Default)]
pub struct PhysicalInterfaceHooks;

impl PhysicalInterfaceHooks {
    /// Claim an ae-id and mirror it into the object.
    async fn assign_ae_id(
        cx: &mut HookContext<'_>,
        obj: &mut ResourceObject,
        preferred: Option<AllocValue>,
    ) -> TxnResult<()> {
        let allocation = cx
            .allocate(&scoped(NS_AE_ID, &obj.fq_name), &obj.owner(), preferred)
            .await
            .map_err(ae_taken)?;
        if let Some(id) = allocation.value.as_index() {
            obj.set(ATTR_AE_ID, json!(id));
            obj.set(ATTR_AE_INTERFACE_NAME, json!(format!("ae{}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHooks for PhysicalInterfaceHooks {
    fn kind(&self) -> &str {
        KIND_PHYSICAL_INTERFACE
    }

    async fn validate_create(
        &self,
        _cx: &HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        if obj.parent_kind.as_deref() != Some(KIND_PHYSICAL_ROUTER) {
            return Err(TxnError::Validation(format!(
                "Physical interface {} must be created under a physical router",
                obj.fq_name
            )));
        }
        if let Some(esi) = obj.get_str(ATTR_ESI) {
            check_esi(esi)?;
        }
        ae_id(obj)?;
        Ok(())
    }

    async fn pre_create(
        &self,
        cx: &mut HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &mut ResourceObject,
    ) -> TxnResult<()> {
        let name = display_name(obj).unwrap_or_default().to_string();
        obj.set(ATTR_DISPLAY_NAME, json!(name));
        cx.allocate(
            &scoped(NS_INTERFACE_NAME, &obj.fq_name),
            &obj.owner(),
            Some(AllocValue::Key(name)),
        )
        .await
        .map_err(name_taken)?;

        if aggregated(obj) {
            let preferred = ae_id(obj)?;
            Self::assign_ae_id(cx, obj, preferred).await?;
        }
        Ok(())
    }

    async fn validate_update(
        &self,
        _cx: &HookContext<'_>,
        obj: &ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<()> {
        if display_name(obj) != display_name(old) {
            return Err(TxnError::Forbidden(
                "Cannot change display name !".to_string(),
            ));
        }
        if let Some(esi) = obj.get_str(ATTR_ESI) {
            check_esi(esi)?;
        }
        ae_id(obj)?;
        Ok(())
    }

    async fn pre_update(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        fq_name: &FqName,
        obj: &mut ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<Sideband> {
        let namespace = scoped(NS_AE_ID, fq_name);
        let owner = fq_name.to_string();
        let old_id = ae_id(old)?;

        match (aggregated(old), aggregated(obj)) {
            (false, true) => {
                let preferred = ae_id(obj)?;
                Self::assign_ae_id(cx, obj, preferred).await?;
            }
            (true, false) => {
                if let Some(old_id) = &old_id {
                    cx.free(&namespace, old_id, &owner).await?;
                }
                obj.remove(ATTR_AE_ID);
                obj.remove(ATTR_AE_INTERFACE_NAME);
            }
            (true, true) => {
                let new_id = ae_id(obj)?;
                if new_id.is_none() {
                    // Still aggregated, so the interface keeps the id it holds.
                    if let Some(id) = old_id.as_ref().and_then(AllocValue::as_index) {
                        obj.set(ATTR_AE_ID, json!(id));
                        obj.set(ATTR_AE_INTERFACE_NAME, json!(format!("ae{}", id)));
                    }
                } else if new_id != old_id {
                    cx.renumber(&namespace, &owner, old_id.as_ref(), new_id.clone())
                        .await
                        .map_err(ae_taken)?;
                    if let Some(id) = new_id.as_ref().and_then(AllocValue::as_index) {
                        obj.set(ATTR_AE_INTERFACE_NAME, json!(format!("ae{}", id)));
                    }
                }
            }
            (false, false) => {}
        }
        Ok(Sideband::new())
    }

    async fn pre_delete(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        obj: &ResourceObject,
    ) -> TxnResult<Sideband> {
        let owner = obj.owner();
        if let Some(name) = display_name(obj) {
            cx.free(
                &scoped(NS_INTERFACE_NAME, &obj.fq_name),
                &AllocValue::Key(name.to_string()),
                &owner,
            )
            .await?;
        }
        if let Some(id) = ae_id(obj)? {
            cx.free(&scoped(NS_AE_ID, &obj.fq_name), &id, &owner).await?;
        }
        Ok(Sideband::new())
    }
}
