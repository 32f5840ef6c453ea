//! Reference resource kinds.
//!
//! | Kind | Allocations |
//! |------|-------------|
//! | `virtual_network` | network id, optional VXLAN id |
//! | `security_group` | security-group id, rule quota |
//! | `logical_router` | VXLAN id, implicit internal network |
//! | `network_ipam` | flat subnets |
//! | `physical_interface` | display name and ae-id per router |

mod logical_router;
mod network_ipam;
mod physical_interface;
mod security_group;
mod virtual_network;

pub use logical_router::LogicalRouterHooks;
pub use network_ipam::NetworkIpamHooks;
pub use physical_interface::PhysicalInterfaceHooks;
pub use security_group::SecurityGroupHooks;
pub use virtual_network::VirtualNetworkHooks;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde_json::Value;

use super::allocator::AllocValue;
use super::hooks::HookContext;
use crate::constants::{
    ATTR_VXLAN_ID, KIND_PROJECT, NS_VXLAN_ID, VXLAN_OWNER_SUFFIX,
};
use crate::error::{TxnError, TxnResult};
use crate::types::{FqName, ResourceObject};

/// The project owning `obj`, if its parent is one.
pub(crate) async fn project_of(
    cx: &HookContext<'_>,
    obj: &ResourceObject,
) -> TxnResult<Option<ResourceObject>> {
    match (obj.parent_uuid, obj.parent_kind.as_deref()) {
        (Some(parent), Some(KIND_PROJECT)) => cx.services.store.read(parent).await.map(Some),
        _ => Ok(None),
    }
}

/// Numeric attribute given as a number or a numeric string. Empty strings and
/// `"None"` read as absent.
pub(crate) fn index_attr(obj: &ResourceObject, key: &str) -> TxnResult<Option<u64>> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) if s.is_empty() || s == "None" => Ok(None),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| TxnError::Validation(format!("{} must be an integer, got '{}'", key, s))),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| TxnError::Validation(format!("{} must be a non-negative integer", key))),
        Some(other) => Err(TxnError::Validation(format!(
            "{} must be an integer, got {}",
            key, other
        ))),
    }
}

pub(crate) fn vxlan_id(obj: &ResourceObject) -> TxnResult<Option<AllocValue>> {
    Ok(index_attr(obj, ATTR_VXLAN_ID)?.map(AllocValue::Index))
}

/// Owner recorded for the VXLAN id of a network.
pub(crate) fn vxlan_owner(network_fq_name: &FqName) -> String {
    format!("{}{}", network_fq_name, VXLAN_OWNER_SUFFIX)
}

/// Client-facing error for a VXLAN id held by someone else.
pub(crate) fn vxlan_taken(err: TxnError) -> TxnError {
    match err {
        TxnError::AllocationConflict { value, .. } => TxnError::Validation(format!(
            "Cannot set VXLAN_ID: {}, it has already been set",
            value
        )),
        other => other,
    }
}

/// Move a network's VXLAN id from `old` to `new`.
pub(crate) async fn renumber_vxlan(
    cx: &mut HookContext<'_>,
    network_fq_name: &FqName,
    old: Option<&AllocValue>,
    new: Option<AllocValue>,
) -> TxnResult<()> {
    cx.renumber(NS_VXLAN_ID, &vxlan_owner(network_fq_name), old, new)
        .await
        .map_err(vxlan_taken)
}

/// An IP prefix with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> TxnResult<Self> {
        let width = Self::width(&addr);
        if prefix_len > width {
            return Err(TxnError::Validation(format!(
                "invalid prefix length {} for {}",
                prefix_len, addr
            )));
        }
        let addr = match addr {
            IpAddr::V4(v4) => {
                let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX.checked_shl(128 - prefix_len as u32).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Ok(Self { addr, prefix_len })
    }

    /// Parse `a.b.c.d/len` or `v6::/len`.
    pub fn parse(s: &str) -> TxnResult<Self> {
        let invalid = || TxnError::Validation(format!("invalid subnet '{}'", s));
        let (addr, len) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let len: u8 = len.trim().parse().map_err(|_| invalid())?;
        Self::new(addr, len)
    }

    /// Parse the `{"ip_prefix": .., "ip_prefix_len": ..}` form.
    pub fn from_subnet_value(subnet: &Value) -> TxnResult<Self> {
        let prefix = subnet.get("ip_prefix").and_then(Value::as_str);
        let len = subnet.get("ip_prefix_len").and_then(Value::as_u64);
        match (prefix, len) {
            (Some(prefix), Some(len)) if len <= u8::MAX as u64 => {
                let addr: IpAddr = prefix.parse().map_err(|_| {
                    TxnError::Validation(format!("invalid subnet prefix '{}'", prefix))
                })?;
                Self::new(addr, len as u8)
            }
            _ => Err(TxnError::Validation(format!("malformed subnet {}", subnet))),
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        if self.is_ipv4() != other.is_ipv4() {
            return false;
        }
        let len = self.prefix_len.min(other.prefix_len);
        match (Cidr::new(self.addr, len), Cidr::new(other.addr, len)) {
            (Ok(a), Ok(b)) => a.addr == b.addr,
            _ => false,
        }
    }

    fn width(addr: &IpAddr) -> u8 {
        if addr.is_ipv4() { 32 } else { 128 }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
