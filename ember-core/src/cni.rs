// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CNI subnet-range allocation.
//!
//! Instances share one bridge network but each receives a disjoint slice of
//! its host addresses. The bridge plugin's IPAM block keeps the base subnet
//! as its routing domain; only the usable `rangeStart`..`rangeEnd` interval is
//! narrowed to the slice handed out by [`SubnetPool`].

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde_json::{json, Map, Value};

use crate::error::{CniError, EmberError, EmberResult};
use crate::types::ContainerId;

/// Plugin type whose IPAM block is rewritten.
const BRIDGE_PLUGIN: &str = "bridge";

/// Narrowest slice that still leaves two usable hosts.
pub const MAX_SLICE_PREFIX: u8 = 30;

/// Usable host interval of a requested subnet inside a base subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniRange {
    /// Base subnet exactly as written in the source document.
    pub base_subnet: String,
    pub requested_subnet: IpNetwork,
    pub range_start: IpAddr,
    pub range_end: IpAddr,
}

impl CniRange {
    /// Compute the range for `requested` inside `base`.
    ///
    /// `requested` is normalized to its network address, so `10.88.1.7/24`
    /// is treated as `10.88.1.0/24`.
    pub fn compute(base: &str, requested: &str) -> Result<Self, CniError> {
        let base_net = parse_cidr(base)?;
        let requested_net = parse_cidr(requested)?;

        let out_of_range = |reason: &str| CniError::Range {
            requested: requested.to_string(),
            base: base.to_string(),
            reason: reason.to_string(),
        };

        let (requested_subnet, range_start, range_end) = match (base_net, requested_net) {
            (IpNetwork::V4(b), IpNetwork::V4(r)) => {
                if r.prefix() < b.prefix() || !b.contains(r.network()) {
                    return Err(out_of_range("not contained in base block"));
                }
                if r.prefix() > MAX_SLICE_PREFIX {
                    return Err(out_of_range("no usable host addresses"));
                }
                let normalized = Ipv4Network::new(r.network(), r.prefix())
                    .map_err(|e| out_of_range(&e.to_string()))?;
                let start = Ipv4Addr::from(u32::from(normalized.network()) + 1);
                let end = Ipv4Addr::from(u32::from(normalized.broadcast()) - 1);
                (IpNetwork::V4(normalized), IpAddr::V4(start), IpAddr::V4(end))
            }
            (IpNetwork::V6(b), IpNetwork::V6(r)) => {
                if r.prefix() < b.prefix() || !b.contains(r.network()) {
                    return Err(out_of_range("not contained in base block"));
                }
                if r.prefix() > 126 {
                    return Err(out_of_range("no usable host addresses"));
                }
                let normalized = Ipv6Network::new(r.network(), r.prefix())
                    .map_err(|e| out_of_range(&e.to_string()))?;
                let first = u128::from(normalized.network());
                let last = first | (u128::MAX >> normalized.prefix());
                (
                    IpNetwork::V6(normalized),
                    IpAddr::V6(Ipv6Addr::from(first + 1)),
                    IpAddr::V6(Ipv6Addr::from(last - 1)),
                )
            }
            _ => return Err(out_of_range("address family mismatch")),
        };

        Ok(Self {
            base_subnet: base.to_string(),
            requested_subnet,
            range_start,
            range_end,
        })
    }

    /// IPAM range object in the shape host-local expects.
    pub fn to_json(&self) -> Value {
        json!({
            "subnet": self.base_subnet,
            "rangeStart": self.range_start.to_string(),
            "rangeEnd": self.range_end.to_string(),
        })
    }
}

fn parse_cidr(value: &str) -> Result<IpNetwork, CniError> {
    if !value.contains('/') {
        return Err(CniError::InvalidCidr {
            value: value.to_string(),
            reason: "missing prefix length".to_string(),
        });
    }
    IpNetwork::from_str(value).map_err(|e| CniError::InvalidCidr {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn bridge_ipam(config: &Value) -> Result<&Map<String, Value>, CniError> {
    config
        .get("plugins")
        .and_then(Value::as_array)
        .ok_or(CniError::Structure {
            element: "plugins list",
        })?
        .iter()
        .find(|plugin| plugin.get("type").and_then(Value::as_str) == Some(BRIDGE_PLUGIN))
        .ok_or(CniError::Structure {
            element: "bridge plugin",
        })?
        .get("ipam")
        .and_then(Value::as_object)
        .ok_or(CniError::Structure {
            element: "bridge ipam",
        })
}

fn bridge_ipam_mut(config: &mut Value) -> Result<&mut Map<String, Value>, CniError> {
    config
        .get_mut("plugins")
        .and_then(Value::as_array_mut)
        .ok_or(CniError::Structure {
            element: "plugins list",
        })?
        .iter_mut()
        .find(|plugin| plugin.get("type").and_then(Value::as_str) == Some(BRIDGE_PLUGIN))
        .ok_or(CniError::Structure {
            element: "bridge plugin",
        })?
        .get_mut("ipam")
        .and_then(Value::as_object_mut)
        .ok_or(CniError::Structure {
            element: "bridge ipam",
        })
}

/// Read the bridge plugin's base subnet.
pub fn base_subnet(config: &Value) -> Result<&str, CniError> {
    bridge_ipam(config)?
        .get("subnet")
        .and_then(Value::as_str)
        .ok_or(CniError::Structure {
            element: "bridge ipam subnet",
        })
}

/// Rewrite `base` so the bridge IPAM only hands out addresses of `requested`.
///
/// Returns a new document; `base` is never modified. The top-level IPAM
/// `subnet` is replaced by a single `ranges` entry whose `subnet` stays the
/// base subnet. Other plugins and fields pass through unchanged.
pub fn apply_cni_subnet(base: &Value, requested: &str) -> Result<Value, CniError> {
    let range = CniRange::compute(base_subnet(base)?, requested)?;

    let mut updated = base.clone();
    let ipam = bridge_ipam_mut(&mut updated)?;
    ipam.remove("subnet");
    ipam.insert("ranges".to_string(), json!([[range.to_json()]]));

    Ok(updated)
}

/// Byte-level form of [`apply_cni_subnet`] for conflist files.
pub fn apply_cni_subnet_bytes(base: &[u8], requested: &str) -> Result<Vec<u8>, CniError> {
    let document: Value = serde_json::from_slice(base).map_err(|e| CniError::Encoding {
        reason: e.to_string(),
    })?;
    let updated = apply_cni_subnet(&document, requested)?;
    serde_json::to_vec_pretty(&updated).map_err(|e| CniError::Encoding {
        reason: e.to_string(),
    })
}

/// Carves equally sized IPv4 slices out of a base subnet, one per instance.
#[derive(Debug)]
pub struct SubnetPool {
    base: Ipv4Network,
    slice_prefix: u8,
    /// Slice index → owning container.
    leases: Mutex<BTreeMap<u64, ContainerId>>,
}

impl SubnetPool {
    pub fn new(base: Ipv4Network, slice_prefix: u8) -> Result<Self, CniError> {
        if slice_prefix < base.prefix() || slice_prefix > MAX_SLICE_PREFIX {
            return Err(CniError::Range {
                requested: format!("/{}", slice_prefix),
                base: base.to_string(),
                reason: format!(
                    "slice prefix must be between /{} and /{}",
                    base.prefix(),
                    MAX_SLICE_PREFIX
                ),
            });
        }

        let base = Ipv4Network::new(base.network(), base.prefix()).map_err(|e| {
            CniError::InvalidCidr {
                value: base.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            base,
            slice_prefix,
            leases: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn base(&self) -> Ipv4Network {
        self.base
    }

    pub fn slice_prefix(&self) -> u8 {
        self.slice_prefix
    }

    /// Number of slices the base subnet holds.
    pub fn capacity(&self) -> u64 {
        1u64 << (self.slice_prefix - self.base.prefix())
    }

    pub fn leased_count(&self) -> usize {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Lease the lowest free slice to `container_id`.
    pub fn allocate(&self, container_id: &ContainerId) -> Result<Ipv4Network, CniError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);

        // Keys are ordered, so the first gap is the lowest free index
        let mut index = 0u64;
        for &leased in leases.keys() {
            if leased != index {
                break;
            }
            index += 1;
        }

        if index >= self.capacity() {
            return Err(CniError::PoolExhausted {
                base: self.base.to_string(),
                prefix: self.slice_prefix,
            });
        }

        let slice = self.slice_at(index)?;
        leases.insert(index, container_id.clone());

        tracing::debug!(container_id = %container_id, subnet = %slice, "Leased subnet slice");
        Ok(slice)
    }

    /// Return a slice to the pool. Releasing a free slice is a no-op.
    pub fn release(&self, slice: &Ipv4Network) {
        let Some(index) = self.index_of(slice) else {
            return;
        };
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(owner) = leases.remove(&index) {
            tracing::debug!(container_id = %owner, subnet = %slice, "Released subnet slice");
        }
    }

    pub fn owner(&self, slice: &Ipv4Network) -> Option<ContainerId> {
        let index = self.index_of(slice)?;
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.get(&index).cloned()
    }

    fn slice_at(&self, index: u64) -> Result<Ipv4Network, CniError> {
        let host_bits = 32 - u32::from(self.slice_prefix);
        // index < capacity, so the offset stays inside the base block
        let offset = (index << host_bits) as u32;
        let network = Ipv4Addr::from(u32::from(self.base.network()) + offset);
        Ipv4Network::new(network, self.slice_prefix).map_err(|e| CniError::InvalidCidr {
            value: format!("{}/{}", network, self.slice_prefix),
            reason: e.to_string(),
        })
    }

    fn index_of(&self, slice: &Ipv4Network) -> Option<u64> {
        if slice.prefix() != self.slice_prefix || !self.base.contains(slice.network()) {
            return None;
        }
        let host_bits = 32 - u32::from(self.slice_prefix);
        let offset = u32::from(slice.network()) - u32::from(self.base.network());
        Some(u64::from(offset >> host_bits))
    }
}

/// Base CNI document plus the pool its per-instance slices come from.
#[derive(Debug)]
pub struct CniPlan {
    base_config: Value,
    network_name: String,
    pool: SubnetPool,
}

impl CniPlan {
    /// Build a plan from a parsed conflist.
    pub fn new(base_config: Value, slice_prefix: u8) -> Result<Self, CniError> {
        let subnet = base_subnet(&base_config)?;
        let base = match parse_cidr(subnet)? {
            IpNetwork::V4(net) => net,
            IpNetwork::V6(_) => {
                return Err(CniError::Range {
                    requested: format!("/{}", slice_prefix),
                    base: subnet.to_string(),
                    reason: "subnet slicing requires an IPv4 base".to_string(),
                })
            }
        };
        let network_name = base_config
            .get("name")
            .and_then(Value::as_str)
            .ok_or(CniError::Structure {
                element: "network name",
            })?
            .to_string();

        let pool = SubnetPool::new(base, slice_prefix)?;

        Ok(Self {
            base_config,
            network_name,
            pool,
        })
    }

    /// Load the base conflist from disk.
    pub fn load(path: impl AsRef<Path>, slice_prefix: u8) -> EmberResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EmberError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read(path).map_err(|e| EmberError::Io {
            context: "reading CNI config",
            source: e,
        })?;
        let base_config: Value =
            serde_json::from_slice(&content).map_err(|e| EmberError::ConfigParse {
                message: format!("CNI JSON parse error: {}", e),
            })?;

        Ok(Self::new(base_config, slice_prefix)?)
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn pool(&self) -> &SubnetPool {
        &self.pool
    }

    /// Lease a slice for `container_id` and render its CNI document.
    pub fn render(&self, container_id: &ContainerId) -> Result<(Ipv4Network, Value), CniError> {
        let slice = self.pool.allocate(container_id)?;
        match apply_cni_subnet(&self.base_config, &slice.to_string()) {
            Ok(document) => Ok((slice, document)),
            Err(e) => {
                self.pool.release(&slice);
                Err(e)
            }
        }
    }

    pub fn release(&self, slice: &Ipv4Network) {
        self.pool.release(slice);
    }
}
