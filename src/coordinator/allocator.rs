//! Unique-value allocator backed by the coordination service.
//!
//! Every claimed value is a path `{root}/{namespace}/{value}` whose body is
//! the owner's fq_name. Existence of the path is the claim, so atomic
//! create-if-absent is the only synchronization the allocator needs: no
//! lock is ever held across a remote call.
//!
//! # Namespaces
//!
//! A namespace is registered once with a [`NamespaceSpec`]. Numeric
//! namespaces carry a half-open range and hand out the lowest free value when
//! the caller has no preference. String-keyed namespaces (IPAM subnets,
//! interface names) are plain registries and always need an explicit value.
//!
//! Scoped namespaces such as `ae-id@gsc:qfx1` share the spec registered for
//! their family (`ae-id`) but keep separate claims.
//!
//! # Races
//!
//! Two callers asking for the same preferred value are resolved by the
//! coordination service: one wins, the other gets
//! [`TxnError::AllocationConflict`] naming the winner. Two callers asking for
//! the next free value re-read the free set after every lost race, bounded by
//! `max_allocation_attempts`, and fail with [`TxnError::ResourceExhausted`]
//! once the bound is hit.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use backon::Retryable;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::config::CoordinatorConfig;
use super::keys::{allocation_path, namespace_path, tombstone_path, unescape_segment};
use super::metrics;
use super::retry::{allocation_race_policy, record_retry_attempt, with_coordination_policy};
use super::traits::CoordinationService;
use crate::constants::{
    AE_ID_MAX, NAMESPACE_SCOPE_SEPARATOR, NS_AE_ID, NS_INTERFACE_NAME, NS_IPAM_SUBNET,
    NS_SECURITY_GROUP_ID, NS_VIRTUAL_NETWORK_ID, NS_VXLAN_ID, SG_ID_MAX, VN_ID_MAX, VXLAN_ID_MAX,
};
use crate::error::{TxnError, TxnResult};

/// A value handed out by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocValue {
    Index(u64),
    Key(String),
}

impl AllocValue {
    pub fn as_index(&self) -> Option<u64> {
        match self {
            AllocValue::Index(v) => Some(*v),
            AllocValue::Key(_) => None,
        }
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            AllocValue::Key(k) => Some(k),
            AllocValue::Index(_) => None,
        }
    }
}

impl fmt::Display for AllocValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocValue::Index(v) => write!(f, "{}", v),
            AllocValue::Key(k) => f.write_str(k),
        }
    }
}

impl From<u64> for AllocValue {
    fn from(v: u64) -> Self {
        AllocValue::Index(v)
    }
}

impl From<&str> for AllocValue {
    fn from(k: &str) -> Self {
        AllocValue::Key(k.to_string())
    }
}

impl From<String> for AllocValue {
    fn from(k: String) -> Self {
        AllocValue::Key(k)
    }
}

/// Shape of a namespace's value domain.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSpec {
    /// Half-open numeric range. `None` makes the namespace string-keyed.
    pub range: Option<Range<u64>>,
    /// At most one live value per owner; allocating without a preference
    /// returns the owner's existing value.
    pub one_per_owner: bool,
    /// Values inside the range that are never handed out.
    pub reserved: Vec<u64>,
}

impl NamespaceSpec {
    pub fn indexed(range: Range<u64>) -> Self {
        Self {
            range: Some(range),
            ..Self::default()
        }
    }

    pub fn keyed() -> Self {
        Self::default()
    }

    pub fn one_per_owner(mut self) -> Self {
        self.one_per_owner = true;
        self
    }

    pub fn reserve(mut self, value: u64) -> Self {
        self.reserved.push(value);
        self
    }

    /// Whether `value` may be claimed in this namespace.
    pub fn contains(&self, value: &AllocValue) -> bool {
        match (&self.range, value) {
            (Some(range), AllocValue::Index(v)) => range.contains(v) && !self.reserved.contains(v),
            (None, AllocValue::Key(k)) => !k.is_empty(),
            _ => false,
        }
    }

    fn parse(&self, raw: &str) -> Option<AllocValue> {
        let raw = unescape_segment(raw);
        match self.range {
            Some(_) => raw.parse().ok().map(AllocValue::Index),
            None => Some(AllocValue::Key(raw)),
        }
    }
}

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub value: AllocValue,
    /// `false` when the owner already held the value. Only a new claim needs
    /// a compensating free.
    pub newly_claimed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    Released,
    AlreadyFree,
    /// The value is held by someone else and was left untouched.
    OwnedByOther,
}

impl FreeOutcome {
    fn as_metric_label(&self) -> &'static str {
        match self {
            FreeOutcome::Released => "released",
            FreeOutcome::AlreadyFree => "already_free",
            FreeOutcome::OwnedByOther => "owned_by_other",
        }
    }
}

/// Per-namespace allocation of unique scalars.
pub struct UniqueValueAllocator {
    coordination: Arc<dyn CoordinationService>,
    root: String,
    namespaces: DashMap<String, NamespaceSpec>,
    max_attempts: u32,
}

impl fmt::Debug for UniqueValueAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueValueAllocator")
            .field("root", &self.root)
            .field("namespaces", &self.namespaces.len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl UniqueValueAllocator {
    pub fn new(
        coordination: Arc<dyn CoordinationService>,
        root: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            coordination,
            root: root.into(),
            namespaces: DashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Allocator with every namespace the reference kinds use.
    pub fn with_default_namespaces(
        coordination: Arc<dyn CoordinationService>,
        config: &CoordinatorConfig,
    ) -> Self {
        let allocator = Self::new(
            coordination,
            config.allocator_root.clone(),
            config.max_allocation_attempts,
        );
        allocator.register(
            NS_SECURITY_GROUP_ID,
            NamespaceSpec::indexed(config.security_group_id_min..SG_ID_MAX)
                .one_per_owner()
                .reserve(0),
        );
        allocator.register(
            NS_VIRTUAL_NETWORK_ID,
            NamespaceSpec::indexed(1..VN_ID_MAX).one_per_owner(),
        );
        allocator.register(
            NS_VXLAN_ID,
            NamespaceSpec::indexed(1..VXLAN_ID_MAX).one_per_owner(),
        );
        allocator.register(NS_IPAM_SUBNET, NamespaceSpec::keyed());
        allocator.register(
            NS_AE_ID,
            NamespaceSpec::indexed(0..AE_ID_MAX + 1).one_per_owner(),
        );
        allocator.register(NS_INTERFACE_NAME, NamespaceSpec::keyed());
        allocator
    }

    pub fn register(&self, namespace: impl Into<String>, spec: NamespaceSpec) {
        self.namespaces.insert(namespace.into(), spec);
    }

    /// Spec for a namespace, falling back to its family for scoped names.
    pub fn spec_for(&self, namespace: &str) -> TxnResult<NamespaceSpec> {
        if let Some(spec) = self.namespaces.get(namespace) {
            return Ok(spec.clone());
        }
        namespace
            .split_once(NAMESPACE_SCOPE_SEPARATOR)
            .and_then(|(family, _)| self.namespaces.get(family).map(|s| s.clone()))
            .ok_or_else(|| TxnError::Validation(format!("unknown namespace {}", namespace)))
    }

    /// Claim a value for `owner`.
    ///
    /// With a preferred value the exact value is claimed or
    /// `AllocationConflict` is returned; a value the owner already holds is a
    /// no-op. Without one, one-per-owner namespaces return the owner's
    /// existing value, otherwise the lowest free value is claimed.
    pub async fn allocate(
        &self,
        namespace: &str,
        owner: &str,
        preferred: Option<AllocValue>,
    ) -> TxnResult<Allocation> {
        let spec = self.spec_for(namespace)?;
        let result = match preferred {
            Some(value) => self.claim_preferred(namespace, &spec, owner, value).await,
            None => self.claim_next(namespace, &spec, owner).await,
        };

        let outcome = match &result {
            Ok(a) if a.newly_claimed => "claimed",
            Ok(_) => "existing",
            Err(TxnError::AllocationConflict { .. }) => "conflict",
            Err(TxnError::ResourceExhausted { .. }) => "exhausted",
            Err(_) => "error",
        };
        metrics::record_allocation(namespace, outcome);
        if let Ok(a) = &result {
            debug!(namespace, value = %a.value, owner, outcome, "Allocated value");
        }
        result
    }

    async fn claim_preferred(
        &self,
        namespace: &str,
        spec: &NamespaceSpec,
        owner: &str,
        value: AllocValue,
    ) -> TxnResult<Allocation> {
        if !spec.contains(&value) {
            return Err(TxnError::OutOfRange {
                namespace: namespace.to_string(),
                value: value.to_string(),
            });
        }
        let path = allocation_path(&self.root, namespace, &value.to_string());

        // A holder that frees between our create and read makes us loop.
        for _ in 0..self.max_attempts {
            if self.coordination.create_if_absent(&path, owner).await? {
                return Ok(Allocation {
                    value,
                    newly_claimed: true,
                });
            }
            match self.coordination.read(&path).await? {
                Some(holder) if holder == owner => {
                    return Ok(Allocation {
                        value,
                        newly_claimed: false,
                    });
                }
                Some(holder) => {
                    return Err(TxnError::AllocationConflict {
                        namespace: namespace.to_string(),
                        value: value.to_string(),
                        owner: holder,
                    });
                }
                None => continue,
            }
        }
        Err(TxnError::ResourceExhausted {
            namespace: namespace.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn claim_next(
        &self,
        namespace: &str,
        spec: &NamespaceSpec,
        owner: &str,
    ) -> TxnResult<Allocation> {
        if spec.one_per_owner {
            if let Some(value) = self.owned_values(namespace, owner).await?.into_iter().next() {
                return Ok(Allocation {
                    value,
                    newly_claimed: false,
                });
            }
        }
        let Some(range) = spec.range.clone() else {
            return Err(TxnError::Validation(format!(
                "namespace {} needs an explicit value",
                namespace
            )));
        };

        let attempts = AtomicU32::new(0);
        let result = (|| self.try_claim_next(namespace, &range, &spec.reserved, owner, &attempts))
            .retry(allocation_race_policy(self.max_attempts))
            .when(|e| matches!(e, TxnError::AllocationConflict { .. }))
            .notify(|err: &TxnError, delay| record_retry_attempt("allocation_race", err, delay))
            .await;

        match result {
            Ok(v) => Ok(Allocation {
                value: AllocValue::Index(v),
                newly_claimed: true,
            }),
            Err(TxnError::AllocationConflict { .. }) => Err(TxnError::ResourceExhausted {
                namespace: namespace.to_string(),
                attempts: attempts.load(Ordering::SeqCst),
            }),
            Err(e) => Err(e),
        }
    }

    /// One pass: re-read the free set and try the lowest gap.
    async fn try_claim_next(
        &self,
        namespace: &str,
        range: &Range<u64>,
        reserved: &[u64],
        owner: &str,
        attempts: &AtomicU32,
    ) -> TxnResult<u64> {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let claimed = self.claimed_indices(namespace).await?;
        let candidate =
            lowest_gap(range, &claimed, reserved).ok_or_else(|| TxnError::ResourceExhausted {
                namespace: namespace.to_string(),
                attempts: attempt,
            })?;

        let path = allocation_path(&self.root, namespace, &candidate.to_string());
        if self.coordination.create_if_absent(&path, owner).await? {
            return Ok(candidate);
        }
        let holder = self.coordination.read(&path).await?.unwrap_or_default();
        debug!(namespace, value = candidate, holder, attempt, "Lost allocation race");
        Err(TxnError::AllocationConflict {
            namespace: namespace.to_string(),
            value: candidate.to_string(),
            owner: holder,
        })
    }

    /// Release `value` if `owner` holds it.
    ///
    /// Freeing an absent value is a no-op; a value held by another owner is
    /// never touched. With `notify`, a tombstone naming the owner is written
    /// after the release so watchers observe the transition.
    pub async fn free(
        &self,
        namespace: &str,
        value: &AllocValue,
        owner: &str,
        notify: bool,
    ) -> TxnResult<FreeOutcome> {
        let value_str = value.to_string();
        let path = allocation_path(&self.root, namespace, &value_str);

        let outcome = match self.coordination.read(&path).await? {
            None => FreeOutcome::AlreadyFree,
            Some(holder) if holder != owner => {
                warn!(namespace, value = %value, owner, holder, "Refusing to free value held by another owner");
                FreeOutcome::OwnedByOther
            }
            Some(_) => {
                self.coordination.delete(&path).await?;
                FreeOutcome::Released
            }
        };

        if notify && outcome != FreeOutcome::OwnedByOther {
            self.coordination
                .put(&tombstone_path(&self.root, namespace, &value_str), owner)
                .await?;
        }
        metrics::record_free(namespace, outcome.as_metric_label());
        debug!(namespace, value = %value, owner, notify, outcome = outcome.as_metric_label(), "Freed value");
        Ok(outcome)
    }

    /// Current holder of `value`, if claimed.
    pub async fn lookup_owner(&self, namespace: &str, value: &AllocValue) -> TxnResult<Option<String>> {
        let path = allocation_path(&self.root, namespace, &value.to_string());
        with_coordination_policy(|| self.coordination.read(&path)).await
    }

    pub async fn is_free(&self, namespace: &str, value: &AllocValue) -> TxnResult<bool> {
        Ok(self.lookup_owner(namespace, value).await?.is_none())
    }

    /// Owner recorded by the last notifying free of `value`.
    pub async fn released_by(&self, namespace: &str, value: &AllocValue) -> TxnResult<Option<String>> {
        let path = tombstone_path(&self.root, namespace, &value.to_string());
        with_coordination_policy(|| self.coordination.read(&path)).await
    }

    /// Every value `owner` holds in `namespace`, lowest first.
    pub async fn owned_values(&self, namespace: &str, owner: &str) -> TxnResult<Vec<AllocValue>> {
        let spec = self.spec_for(namespace)?;
        let mut values: Vec<AllocValue> = self
            .claims(namespace)
            .await?
            .into_iter()
            .filter(|(_, holder)| holder == owner)
            .filter_map(|(name, _)| spec.parse(&name))
            .collect();
        values.sort();
        Ok(values)
    }

    async fn claims(&self, namespace: &str) -> TxnResult<Vec<(String, String)>> {
        let path = namespace_path(&self.root, namespace);
        with_coordination_policy(|| self.coordination.children(&path)).await
    }

    async fn claimed_indices(&self, namespace: &str) -> TxnResult<BTreeSet<u64>> {
        Ok(self
            .claims(namespace)
            .await?
            .into_iter()
            .filter_map(|(name, _)| unescape_segment(&name).parse().ok())
            .collect())
    }
}

/// Lowest value of `range` that is neither claimed nor reserved.
fn lowest_gap(range: &Range<u64>, claimed: &BTreeSet<u64>, reserved: &[u64]) -> Option<u64> {
    let mut candidate = range.start;
    while candidate < range.end && (claimed.contains(&candidate) || reserved.contains(&candidate)) {
        candidate += 1;
    }
    (candidate < range.end).then_some(candidate)
}
