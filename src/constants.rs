//! Centralized constants for the lifecycle transaction coordinator.
//!
//! # Categories
//!
//! - **Coordination Layout**: default roots for allocator, quota and fq-name paths
//! - **Namespaces**: allocator namespace names and their value domains
//! - **Resource Kinds**: kind names the reference hooks register under
//! - **Attributes**: attribute keys the pipeline and hooks read or write

// =============================================================================
// Coordination Layout
// =============================================================================

/// Default root under which allocation records live.
///
/// One record per claimed value: `{root}/{namespace}/{value}`, body = owner.
pub const DEFAULT_ALLOCATOR_ROOT: &str = "/id";

/// Default root for mirrored quota counters: `{root}/{tenant}/{kind}`.
pub const DEFAULT_QUOTA_ROOT: &str = "/quota-counter";

/// Default root for fq-name reservations: `{root}/{kind}/{fq_name}`, body = uuid.
pub const DEFAULT_FQ_NAME_ROOT: &str = "/fq-name-to-uuid";

/// Directory (under the allocator root) holding free tombstones.
pub const TOMBSTONE_DIR: &str = ".tombstones";

/// Default number of create-if-absent attempts before `ResourceExhausted`.
pub const DEFAULT_MAX_ALLOCATION_ATTEMPTS: u32 = 5;

/// Default per-request deadline in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default quota limit when a project carries no explicit entry (unlimited).
pub const DEFAULT_QUOTA_LIMIT: i64 = -1;

/// Tenant name used when the request carries none.
pub const DEFAULT_TENANT: &str = "default-project";

// =============================================================================
// Namespaces
// =============================================================================

/// Security-group numeric ids.
pub const NS_SECURITY_GROUP_ID: &str = "security-group-id";

/// Virtual-network numeric ids.
pub const NS_VIRTUAL_NETWORK_ID: &str = "virtual-network-id";

/// VXLAN network identifiers, shared by virtual networks and logical routers.
pub const NS_VXLAN_ID: &str = "vxlan-id";

/// String-keyed registry of IPAM subnets.
pub const NS_IPAM_SUBNET: &str = "ipam-subnet";

/// Aggregated-ethernet ids, scoped per physical router as `ae-id@<router>`.
pub const NS_AE_ID: &str = "ae-id";

/// Interface display names, scoped per physical router as `interface-name@<router>`.
pub const NS_INTERFACE_NAME: &str = "interface-name";

/// Separator between a namespace family and its scope.
pub const NAMESPACE_SCOPE_SEPARATOR: char = '@';

/// Lowest security-group id handed out by the allocator.
///
/// Ids below this floor are reserved for `configured_security_group_id`.
pub const DEFAULT_SG_ID_MIN_ALLOC: u64 = 8_000_000;

/// Exclusive upper bound of security-group ids.
pub const SG_ID_MAX: u64 = 1 << 32;

/// Exclusive upper bound of virtual-network ids.
pub const VN_ID_MAX: u64 = 1 << 24;

/// Exclusive upper bound of VXLAN ids.
pub const VXLAN_ID_MAX: u64 = 1 << 24;

/// Highest aggregated-ethernet id (inclusive).
pub const AE_ID_MAX: u64 = (1 << 7) - 1;

// =============================================================================
// Resource Kinds
// =============================================================================

pub const KIND_PROJECT: &str = "project";
pub const KIND_SECURITY_GROUP: &str = "security_group";
pub const KIND_VIRTUAL_NETWORK: &str = "virtual_network";
pub const KIND_LOGICAL_ROUTER: &str = "logical_router";
pub const KIND_NETWORK_IPAM: &str = "network_ipam";
pub const KIND_PHYSICAL_ROUTER: &str = "physical_router";
pub const KIND_PHYSICAL_INTERFACE: &str = "physical_interface";

/// Derived quota kind counting policy rules across a project's security groups.
pub const QUOTA_SECURITY_GROUP_RULE: &str = "security_group_rule";

// =============================================================================
// Attributes
// =============================================================================

pub const ATTR_QUOTA: &str = "quota";
pub const ATTR_USER_VISIBLE: &str = "user_visible";
pub const ATTR_DISPLAY_NAME: &str = "display_name";
pub const ATTR_VXLAN_ROUTING: &str = "vxlan_routing";
pub const ATTR_VXLAN_ID: &str = "vxlan_network_identifier";
pub const ATTR_VIRTUAL_NETWORK_ID: &str = "virtual_network_network_id";
pub const ATTR_SECURITY_GROUP_ID: &str = "security_group_id";
pub const ATTR_CONFIGURED_SECURITY_GROUP_ID: &str = "configured_security_group_id";
pub const ATTR_SECURITY_GROUP_ENTRIES: &str = "security_group_entries";
pub const ATTR_INTERNAL_NETWORK: &str = "internal_network_uuid";
pub const ATTR_IPAM_SUBNET_METHOD: &str = "ipam_subnet_method";
pub const ATTR_IPAM_SUBNETS: &str = "ipam_subnets";
pub const ATTR_IPAM_SUBNETTING: &str = "ipam_subnetting";
pub const ATTR_ESI: &str = "ethernet_segment_identifier";
pub const ATTR_AGGREGATED: &str = "aggregated";
pub const ATTR_AE_ID: &str = "ae_id";
pub const ATTR_AE_INTERFACE_NAME: &str = "ae_interface_name";

/// Prefix of the implicit network created for a VXLAN-routed logical router.
pub const LR_INTERNAL_VN_PREFIX: &str = "__contrail_lr_internal_vn_";

/// Suffix appended to an owner name for its VXLAN allocation.
pub const VXLAN_OWNER_SUFFIX: &str = "_vxlan";
