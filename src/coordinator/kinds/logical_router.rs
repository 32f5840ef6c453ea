//! Logical routers.
//!
//! When the owning project has `vxlan_routing` enabled, every router gets an
//! implicit internal virtual network carrying the router's VXLAN id. The
//! network is created, renumbered and deleted through nested pipeline runs,
//! so a failure of the router request unwinds it as well.

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{project_of, renumber_vxlan, vxlan_id};
use crate::constants::{
    ATTR_INTERNAL_NETWORK, ATTR_USER_VISIBLE, ATTR_VXLAN_ID, ATTR_VXLAN_ROUTING,
    KIND_LOGICAL_ROUTER, KIND_PROJECT, KIND_VIRTUAL_NETWORK, LR_INTERNAL_VN_PREFIX,
};
use crate::coordinator::hooks::{HookContext, ResourceHooks};
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ObjectPatch, ObjectRef, ResourceObject, Sideband};

const NETWORK_TYPE_KEY: &str = "logical_router_virtual_network_type";
const INTERNAL_NETWORK_TYPE: &str = "InternalVirtualNetwork";
const EXTERNAL_GATEWAY_TYPE: &str = "ExternalGateway";

/// Name of the internal network of router `router`.
pub(crate) fn internal_network_name(router: Uuid) -> String {
    format!("{}{}__", LR_INTERNAL_VN_PREFIX, router)
}

fn vxlan_routing(project: Option<&ResourceObject>) -> bool {
    project
        .and_then(|p| p.get_bool(ATTR_VXLAN_ROUTING))
        .unwrap_or(false)
}

fn network_type(r: &ObjectRef) -> Option<&str> {
    r.attr.as_ref()?.get(NETWORK_TYPE_KEY)?.as_str()
}

fn internal_network(obj: &ResourceObject) -> Option<Uuid> {
    obj.get_str(ATTR_INTERNAL_NETWORK)?.parse().ok()
}

/// fq_name of the router's internal network, a sibling of the router.
fn internal_fq_name(router: &ResourceObject) -> FqName {
    router
        .fq_name
        .prefix(router.fq_name.len().saturating_sub(1))
        .child(internal_network_name(router.uuid))
}

fn check_gateway(obj: &ResourceObject, routing: bool) -> TxnResult<()> {
    let has_gateway = obj
        .refs_of(KIND_VIRTUAL_NETWORK)
        .any(|r| network_type(r) == Some(EXTERNAL_GATEWAY_TYPE));
    if routing && has_gateway {
        return Err(TxnError::Validation(
            "External Gateway not supported with VxLAN".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct LogicalRouterHooks;

#[async_trait]
impl ResourceHooks for LogicalRouterHooks {
    fn kind(&self) -> &str {
        KIND_LOGICAL_ROUTER
    }

    async fn validate_create(
        &self,
        _cx: &HookContext<'_>,
        tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        if obj.parent_kind.as_deref() != Some(KIND_PROJECT) {
            return Err(TxnError::Validation(format!(
                "Logical router {} must be created under a project",
                obj.fq_name
            )));
        }
        vxlan_id(obj)?;
        check_gateway(obj, vxlan_routing(tenant))
    }

    async fn pre_create(
        &self,
        cx: &mut HookContext<'_>,
        tenant: Option<&ResourceObject>,
        obj: &mut ResourceObject,
    ) -> TxnResult<()> {
        if !vxlan_routing(tenant) {
            return Ok(());
        }
        let network = Uuid::new_v4();
        obj.set(ATTR_INTERNAL_NETWORK, json!(network.to_string()));
        obj.refs.push(
            ObjectRef::new(KIND_VIRTUAL_NETWORK, network)
                .with_attr(json!({ NETWORK_TYPE_KEY: INTERNAL_NETWORK_TYPE })),
        );
        renumber_vxlan(cx, &internal_fq_name(obj), None, vxlan_id(obj)?).await
    }

    async fn post_create(
        &self,
        cx: &mut HookContext<'_>,
        tenant: Option<&ResourceObject>,
        obj: &ResourceObject,
    ) -> TxnResult<()> {
        let (Some(project), Some(network)) = (tenant, internal_network(obj)) else {
            return Ok(());
        };
        let mut internal =
            ResourceObject::with_uuid(network, KIND_VIRTUAL_NETWORK, internal_fq_name(obj))
                .parented(project)
                .attr(ATTR_USER_VISIBLE, Value::Bool(false));
        if let Some(vxlan) = obj.get(ATTR_VXLAN_ID) {
            internal.set(ATTR_VXLAN_ID, vxlan.clone());
        }
        cx.create_nested(internal).await?;
        Ok(())
    }

    async fn validate_update(
        &self,
        cx: &HookContext<'_>,
        obj: &ResourceObject,
        _old: &ResourceObject,
    ) -> TxnResult<()> {
        vxlan_id(obj)?;
        let project = project_of(cx, obj).await?;
        check_gateway(obj, vxlan_routing(project.as_ref()))
    }

    async fn pre_update(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        _fq_name: &FqName,
        obj: &mut ResourceObject,
        old: &ResourceObject,
    ) -> TxnResult<Sideband> {
        if internal_network(old).is_some() {
            let old_vxlan = vxlan_id(old)?;
            renumber_vxlan(cx, &internal_fq_name(old), old_vxlan.as_ref(), vxlan_id(obj)?)
                .await?;
        }
        Ok(Sideband::new())
    }

    async fn post_update(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        _fq_name: &FqName,
        obj: &ResourceObject,
        _sideband: &Sideband,
    ) -> TxnResult<()> {
        let Some(network) = internal_network(obj) else {
            return Ok(());
        };
        let current = cx.services.store.read(network).await?;
        if current.get(ATTR_VXLAN_ID) == obj.get(ATTR_VXLAN_ID) {
            return Ok(());
        }
        let patch = ObjectPatch::new().set(
            ATTR_VXLAN_ID,
            obj.get(ATTR_VXLAN_ID).cloned().unwrap_or(Value::Null),
        );
        cx.update_nested(KIND_VIRTUAL_NETWORK, network, patch).await?;
        Ok(())
    }

    async fn pre_delete(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        obj: &ResourceObject,
    ) -> TxnResult<Sideband> {
        if internal_network(obj).is_some() {
            if let Some(vxlan) = vxlan_id(obj)? {
                renumber_vxlan(cx, &internal_fq_name(obj), Some(&vxlan), None).await?;
            }
        }
        Ok(Sideband::new())
    }

    async fn post_delete(
        &self,
        cx: &mut HookContext<'_>,
        _id: Uuid,
        obj: &ResourceObject,
        _sideband: &Sideband,
    ) -> TxnResult<()> {
        let Some(network) = internal_network(obj) else {
            return Ok(());
        };
        match cx.delete_nested(KIND_VIRTUAL_NETWORK, network).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constants::NS_VXLAN_ID;
    use crate::coordinator::config::CoordinatorConfig;
    use crate::coordinator::hooks::KindRegistry;
    use crate::coordinator::mock::{InMemoryConfigStore, InMemoryCoordination, RecordingNotifier};
    use crate::coordinator::pipeline::HookPipeline;
    use crate::coordinator::services::Services;

    async fn setup(routing: bool) -> (HookPipeline, InMemoryConfigStore, ResourceObject) {
        let store = InMemoryConfigStore::new();
        let project = ResourceObject::new(KIND_PROJECT, FqName::parse("default-domain:p"))
            .attr(ATTR_VXLAN_ROUTING, json!(routing));
        store.insert(project.clone()).await;
        let services = Services::new(
            CoordinatorConfig::default(),
            Arc::new(store.clone()),
            Arc::new(InMemoryCoordination::new()),
            Arc::new(RecordingNotifier::new()),
        )
        .unwrap();
        let pipeline = HookPipeline::new(
            Arc::new(services),
            Arc::new(KindRegistry::with_reference_kinds()),
        );
        (pipeline, store, project)
    }

    fn router(project: &ResourceObject, name: &str) -> ResourceObject {
        ResourceObject::new(KIND_LOGICAL_ROUTER, project.fq_name.child(name)).parented(project)
    }

    #[tokio::test]
    async fn test_internal_network_lifecycle() {
        let (pipeline, store, project) = setup(true).await;
        let allocator = &pipeline.services().allocator;

        let created = pipeline
            .create(router(&project, "lr").attr(ATTR_VXLAN_ID, json!(500)))
            .await
            .unwrap();
        let network_uuid = internal_network(&created.object).unwrap();
        let network = store.read_object(network_uuid).await.unwrap();
        assert_eq!(network.get_bool(ATTR_USER_VISIBLE), Some(false));
        assert_eq!(network.get_u64(ATTR_VXLAN_ID), Some(500));
        assert_eq!(
            network.fq_name.last(),
            Some(internal_network_name(created.uuid).as_str())
        );
        assert!(!allocator.is_free(NS_VXLAN_ID, &500.into()).await.unwrap());

        pipeline
            .update(
                KIND_LOGICAL_ROUTER,
                created.uuid,
                ObjectPatch::new().set(ATTR_VXLAN_ID, json!(501)),
            )
            .await
            .unwrap();
        let network = store.read_object(network_uuid).await.unwrap();
        assert_eq!(network.get_u64(ATTR_VXLAN_ID), Some(501));
        assert!(allocator.is_free(NS_VXLAN_ID, &500.into()).await.unwrap());

        pipeline.delete(KIND_LOGICAL_ROUTER, created.uuid).await.unwrap();
        assert!(store.read_object(network_uuid).await.is_none());
        assert!(allocator.is_free(NS_VXLAN_ID, &501.into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_without_vxlan_routing_no_network() {
        let (pipeline, store, project) = setup(false).await;
        let created = pipeline
            .create(router(&project, "lr").attr(ATTR_VXLAN_ID, json!(500)))
            .await
            .unwrap();
        assert!(internal_network(&created.object).is_none());
        // project + router
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_external_gateway_rejected_with_vxlan_routing() {
        let (pipeline, store, project) = setup(true).await;
        let gateway = ObjectRef::new(KIND_VIRTUAL_NETWORK, Uuid::new_v4())
            .with_attr(json!({ NETWORK_TYPE_KEY: EXTERNAL_GATEWAY_TYPE }));
        let err = pipeline
            .create(router(&project, "lr").reference(gateway))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "External Gateway not supported with VxLAN");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_router_needs_project_parent() {
        let (pipeline, _store, _project) = setup(true).await;
        let orphan = ResourceObject::new(KIND_LOGICAL_ROUTER, FqName::parse("default-domain:p:lr"));
        let err = pipeline.create(orphan).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
