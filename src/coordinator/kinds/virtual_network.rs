use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::{renumber_vxlan, vxlan_id};
use crate::constants::{ATTR_VIRTUAL_NETWORK_ID, KIND_VIRTUAL_NETWORK, NS_VIRTUAL_NETWORK_ID, NS_VXLAN_ID};
use crate::coordinator::allocator::AllocValue;
use crate::coordinator::hooks::{HookContext, ResourceHooks};
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ResourceObject, Sideband};

/// Virtual networks own a server-allocated network id and optionally a
/// client-chosen VXLAN id.
#[derive(Debug, Default)]
pub struct VirtualNetworkHooks;

#[async_trait]
impl ResourceHooks for VirtualNetworkHooks {
    fn kind(&self) -> &str {
        KIND_VIRTUAL_NETWORK
    }

    async fn validate_create(
        &self,
        _cx: &HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        if obj.get(ATTR_VIRTUAL_NETWORK_ID).is_some() {
            return Err(TxnError::Forbidden(
                "Cannot set the virtual network ID, it's allocated by the server".to_string(),
            ));
        }
        vxlan_id(obj)?;
        Ok(())
    }

    async fn pre_create(
        &self,
        cx: &mut HookContext<'_>,
        _tenant: Option<&ResourceObject>,
        obj: &mut ResourceObject,
    ) -> TxnResult<()> {
        let network_id = cx
            .allocate(NS_VIRTUAL_NETWORK_ID, &obj.owner(), None)
            .await?
            .value;
        if let Some(id) = network_id.as_index() {
            obj.set(ATTR_VIRTUAL_NETWORK_ID, json!(id));
        }
        renumber_vxlan(cx, &obj.fq_name, None, vxlan_id(obj)?).await
    }

    async fn validate_update(
        &self,
        _cx: &HookContext<'_>,
        obj: &ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<()> {
        if obj.get(ATTR_VIRTUAL_NETWORK_ID) != old.get(ATTR_VIRTUAL_NETWORK_ID) {
            return Err(TxnError::Forbidden(
                "Cannot update the virtual network ID".to_string(),
            ));
        }
        vxlan_id(obj)?;
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
        let old_vxlan = vxlan_id(old)?;
        renumber_vxlan(cx, fq_name, old_vxlan.as_ref(), vxlan_id(obj)?).await?;
        Ok(Sideband::new())
    }

    async fn pre_delete(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        obj: &ResourceObject,
    ) -> TxnResult<Sideband> {
        if let Some(network_id) = obj.get_u64(ATTR_VIRTUAL_NETWORK_ID) {
            cx.free(NS_VIRTUAL_NETWORK_ID, &AllocValue::Index(network_id), &obj.owner())
                .await?;
        }
        if let Some(vxlan) = vxlan_id(obj)? {
            cx.free(NS_VXLAN_ID, &vxlan, &super::vxlan_owner(&obj.fq_name))
                .await?;
        }
        Ok(Sideband::new())
    }
}
