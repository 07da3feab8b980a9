// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Address spaces and epoch-based snapshot reconciliation.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    str::FromStr,
};

use ipnet::IpNet;

use crate::{
    error::IpamError,
    manager::{OPT_INTERFACE_NAME, OPT_NETWORK_NAME, OPT_OVERLAY_NETWORK, Options},
    pool::AddressPool,
};

/// The default local address space id.
pub const LOCAL_ADDRESS_SPACE: &str = "local";
/// The default global address space id.
pub const GLOBAL_ADDRESS_SPACE: &str = "global";

/// The scope of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    /// Host-local addressing.
    Local,
    /// Cluster-wide addressing, reserved.
    Global,
}

impl fmt::Display for AddressScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressScope::Local => write!(f, "local"),
            AddressScope::Global => write!(f, "global"),
        }
    }
}

impl FromStr for AddressScope {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(AddressScope::Local),
            "global" => Ok(AddressScope::Global),
            _ => Err(IpamError::InvalidScope),
        }
    }
}

/// A named set of non-overlapping address pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    pub(crate) id: String,
    pub(crate) scope: AddressScope,
    pub(crate) pools: BTreeMap<String, AddressPool>,
    /// Monotonically non-decreasing snapshot generation.
    pub(crate) epoch: u64,
}

impl AddressSpace {
    /// Creates a new, empty address space.
    pub fn new(id: &str, scope: AddressScope) -> Self {
        Self {
            id: id.to_string(),
            scope,
            pools: BTreeMap::new(),
            epoch: 0,
        }
    }

    /// The space id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The space scope.
    pub fn scope(&self) -> AddressScope {
        self.scope
    }

    /// The pools of the space.
    pub fn pools(&self) -> impl Iterator<Item = &AddressPool> {
        self.pools.values()
    }

    /// Looks up a pool by id.
    pub fn pool(&self, pool_id: &str) -> Option<&AddressPool> {
        self.pools.get(pool_id)
    }

    pub(crate) fn pool_mut(&mut self, pool_id: &str) -> Option<&mut AddressPool> {
        self.pools.get_mut(pool_id)
    }

    /// Creates a new pool for `subnet` in the space.
    ///
    /// Fails with [IpamError::AddressPoolExists] if a pool with the same key
    /// already exists; snapshot assembly treats that as benign and reuses the
    /// existing pool instead.
    pub fn new_address_pool(
        &mut self,
        if_name: &str,
        network_name: &str,
        priority: i32,
        subnet: IpNet,
    ) -> Result<&mut AddressPool, IpamError> {
        let key = AddressPool::key(&subnet, network_name);
        match self.pools.entry(key) {
            Entry::Occupied(_) => Err(IpamError::AddressPoolExists),
            Entry::Vacant(entry) => Ok(entry.insert(AddressPool::new(
                if_name,
                network_name,
                priority,
                subnet,
                self.epoch,
            ))),
        }
    }

    /// Merges a fresh snapshot of the same space into the live state.
    ///
    /// Pools and records observed by the snapshot are adopted or reconfirmed
    /// at a new epoch. State the snapshot no longer lists is swept: free
    /// records are dropped, held records degrade to unhealthy, and pools
    /// survive while anything keeps them alive.
    pub(crate) fn merge(&mut self, new_space: AddressSpace) {
        let new_epoch = self.epoch + 1;
        let mut used_new_epoch = false;

        for (pool_id, mut new_pool) in new_space.pools {
            match self.pools.entry(pool_id) {
                Entry::Vacant(entry) => {
                    new_pool.epoch = new_epoch;
                    entry.insert(new_pool);
                    used_new_epoch = true;
                }
                Entry::Occupied(mut entry) => {
                    let pool = entry.get_mut();
                    for (addr, mut record) in std::mem::take(&mut new_pool.addresses) {
                        match pool.addresses.entry(addr) {
                            Entry::Vacant(entry) => {
                                record.epoch = new_epoch;
                                entry.insert(record);
                            }
                            Entry::Occupied(mut entry) => {
                                let existing = entry.get_mut();
                                existing.epoch = new_epoch;
                                existing.unhealthy = false;
                            }
                        }
                        used_new_epoch = true;
                    }
                }
            }
        }

        if used_new_epoch {
            self.epoch = new_epoch;
        }

        // Sweep state from older epochs. Anything still in use is kept until
        // its holder releases it.
        let space_epoch = self.epoch;
        self.pools.retain(|pool_id, pool| {
            if pool.epoch >= space_epoch {
                return true;
            }

            let mut observed = false;
            pool.addresses.retain(|addr, record| {
                if record.epoch == space_epoch {
                    observed = true;
                    true
                } else if record.in_use {
                    tracing::info!(pool = %pool_id, address = %addr, "address no longer advertised, marking unhealthy");
                    record.unhealthy = true;
                    observed = true;
                    true
                } else {
                    false
                }
            });
            if observed {
                pool.epoch = space_epoch;
            }

            if pool.epoch < space_epoch && !pool.is_in_use() {
                tracing::info!(pool = %pool_id, "deleting stale address pool");
                false
            } else {
                true
            }
        });

        tracing::debug!(space = %self.id, epoch = self.epoch, pools = self.pools.len(), "merged address space snapshot");
    }

    /// Requests a pool reference from the space.
    ///
    /// With an explicit `pool_id`, the exact pool is returned; an unknown id
    /// may synthesize an overlay pool when the options allow it. Without one,
    /// the best matching free pool wins. Returns the id of the referenced
    /// pool.
    pub(crate) fn request_pool(
        &mut self,
        pool_id: &str,
        _sub_pool_id: &str,
        options: &Options,
        v6: bool,
    ) -> Result<String, IpamError> {
        let selected = if !pool_id.is_empty() {
            self.get_pool(pool_id, options)?
        } else {
            self.select_any_pool(options, v6)?
        };

        let pool = self
            .pools
            .get_mut(&selected)
            .expect("selected pool is in the space");
        pool.ref_count += 1;

        tracing::debug!(space = %self.id, pool = %selected, ref_count = pool.ref_count, "pool reference acquired");

        Ok(selected)
    }

    /// Resolves an explicitly requested pool, synthesizing an overlay pool
    /// when allowed.
    fn get_pool(&mut self, pool_id: &str, options: &Options) -> Result<String, IpamError> {
        if self.pools.contains_key(pool_id) {
            return Ok(pool_id.to_string());
        }

        let network_name = options.get(OPT_NETWORK_NAME).cloned().unwrap_or_default();
        if !network_name.is_empty() {
            let suffixed = format!("{pool_id}{network_name}");
            if self.pools.contains_key(&suffixed) {
                return Ok(suffixed);
            }
        }

        if options.get(OPT_OVERLAY_NETWORK).is_none_or(|v| v.is_empty()) {
            return Err(IpamError::AddressPoolNotFound);
        }

        // Overlay pools are synthesized from the requested CIDR and populated
        // with every address in it.
        let subnet: IpNet = pool_id.parse().map_err(|_| IpamError::InvalidPoolId)?;
        let pool = self.new_address_pool("", &network_name, 0, subnet)?;
        let key = pool.id().to_string();
        if let Err(err) = pool.populate() {
            self.pools.remove(&key);
            return Err(err);
        }

        tracing::info!(space = %self.id, pool = %key, "synthesized overlay address pool");

        Ok(key)
    }

    /// Selects any free pool matching the requested constraints.
    fn select_any_pool(&self, options: &Options, v6: bool) -> Result<String, IpamError> {
        let if_name = options.get(OPT_INTERFACE_NAME).cloned().unwrap_or_default();

        let mut best: Option<&AddressPool> = None;
        for pool in self.pools.values() {
            // Unreferenced pools only; sharing requires an explicit id.
            if pool.is_in_use() {
                continue;
            }
            if pool.is_v6 != v6 {
                continue;
            }
            if !if_name.is_empty() && if_name != pool.if_name() {
                continue;
            }

            let better = match best {
                None => true,
                Some(current) => {
                    (pool.priority, pool.addresses.len())
                        > (current.priority, current.addresses.len())
                }
            };
            if better {
                best = Some(pool);
            }
        }

        best.map(|pool| pool.id().to_string())
            .ok_or(IpamError::NoAvailableAddressPools)
    }

    /// Releases a previously requested pool reference.
    pub(crate) fn release_pool(&mut self, pool_id: &str) -> Result<(), IpamError> {
        let pool = self
            .pools
            .get_mut(pool_id)
            .ok_or(IpamError::AddressPoolNotFound)?;
        if !pool.is_in_use() {
            return Err(IpamError::AddressPoolNotInUse);
        }

        pool.ref_count -= 1;

        // Drop the pool once the last reference to a stale pool goes away.
        if pool.epoch < self.epoch && !pool.is_in_use() {
            tracing::info!(space = %self.id, pool = %pool_id, "deleting released stale pool");
            self.pools.remove(pool_id);
        }

        Ok(())
    }
}
