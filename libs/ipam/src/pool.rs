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
//! Address pools and the records they contain.

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use ipnet::IpNet;

use crate::{
    error::IpamError,
    manager::{ADDRESS_TYPE_GATEWAY, OPT_ADDRESS_ID, OPT_ADDRESS_TYPE, Options},
};

/// Well-known host DNS proxy address advertised with every pool.
const DNS_HOST_PROXY_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(168, 63, 129, 16));

/// The key to an address pool, as exchanged with clients.
///
/// The wire form is pipe-delimited: `<space>|<subnet>` or
/// `<space>|<subnet>|<child-subnet>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPoolId {
    /// Address space id.
    pub space: String,
    /// Subnet string identifying the pool within its space.
    pub subnet: String,
    /// Optional child subnet.
    pub child_subnet: String,
}

impl AddressPoolId {
    /// Creates a new pool id.
    pub fn new(space: &str, subnet: &str, child_subnet: &str) -> Self {
        Self {
            space: space.to_string(),
            subnet: subnet.to_string(),
            child_subnet: child_subnet.to_string(),
        }
    }
}

impl fmt::Display for AddressPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.space, self.subnet)?;
        if !self.child_subnet.is_empty() {
            write!(f, "|{}", self.child_subnet)?;
        }
        Ok(())
    }
}

impl FromStr for AddressPoolId {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() > 3 {
            return Err(IpamError::InvalidPoolId);
        }

        Ok(Self {
            space: parts[0].to_string(),
            subnet: parts.get(1).copied().unwrap_or_default().to_string(),
            child_subnet: parts.get(2).copied().unwrap_or_default().to_string(),
        })
    }
}

/// Information about an address pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPoolInfo {
    /// The pool subnet.
    pub subnet: IpNet,
    /// The pool gateway address.
    pub gateway: IpAddr,
    /// DNS servers to advertise for this pool.
    pub dns_servers: Vec<IpAddr>,
    /// Addresses still held by a client but no longer advertised upstream.
    pub unhealthy_addrs: Vec<IpAddr>,
    /// Whether this is an IPv6 pool.
    pub is_v6: bool,
    /// Number of free addresses.
    pub available: usize,
    /// Total number of addresses known in the pool.
    pub capacity: usize,
}

/// A single IP address known to a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AddressRecord {
    pub(crate) addr: IpAddr,
    /// Client-chosen reservation id, empty when unowned.
    pub(crate) id: String,
    pub(crate) in_use: bool,
    /// Still held by a client, but no longer advertised by the source.
    pub(crate) unhealthy: bool,
    /// Snapshot generation at which this record was last observed valid.
    pub(crate) epoch: u64,
}

/// The result of an address request.
#[derive(Debug)]
pub(crate) struct AssignedAddress {
    /// The assigned address in CIDR notation.
    pub(crate) address: String,
    /// Whether the pool state changed.
    pub(crate) mutated: bool,
}

/// A subnet and the set of addresses known within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    /// Subnet string, with an optional network-name suffix for overlay pools.
    pub(crate) id: String,
    /// Host interface this pool is bound to, empty for overlay pools.
    pub(crate) if_name: String,
    pub(crate) subnet: IpNet,
    pub(crate) gateway: IpAddr,
    pub(crate) addresses: BTreeMap<IpAddr, AddressRecord>,
    /// Reservation id to address key. Rebuilt from the records on restore.
    pub(crate) addrs_by_id: BTreeMap<String, IpAddr>,
    pub(crate) is_v6: bool,
    /// Tiebreaker for "any pool" selection, higher wins.
    pub(crate) priority: i32,
    /// Outstanding pool references.
    pub(crate) ref_count: u32,
    /// Snapshot generation at which this pool was last present.
    pub(crate) epoch: u64,
}

impl AddressPool {
    pub(crate) fn new(
        if_name: &str,
        network_name: &str,
        priority: i32,
        subnet: IpNet,
        epoch: u64,
    ) -> Self {
        Self {
            id: Self::key(&subnet, network_name),
            if_name: if_name.to_string(),
            subnet,
            gateway: first_usable_address(&subnet),
            addresses: BTreeMap::new(),
            addrs_by_id: BTreeMap::new(),
            is_v6: matches!(subnet, IpNet::V6(_)),
            priority,
            ref_count: 0,
            epoch,
        }
    }

    /// The pool key for a subnet with an optional network-name suffix.
    pub(crate) fn key(subnet: &IpNet, network_name: &str) -> String {
        format!("{subnet}{network_name}")
    }

    /// The pool id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The host interface this pool is bound to.
    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    /// The pool subnet.
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    /// The pool gateway, the first usable host address of the subnet.
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Whether the pool has outstanding references.
    pub(crate) fn is_in_use(&self) -> bool {
        self.ref_count > 0
    }

    /// Adds a new record for `addr` to the pool.
    pub fn add_record(&mut self, addr: IpAddr) -> Result<(), IpamError> {
        if !self.subnet.contains(&addr) {
            return Err(IpamError::InvalidAddress);
        }
        if self.addresses.contains_key(&addr) {
            return Err(IpamError::AddressExists);
        }

        self.addresses.insert(
            addr,
            AddressRecord {
                addr,
                id: String::new(),
                in_use: false,
                unhealthy: false,
                epoch: self.epoch,
            },
        );

        Ok(())
    }

    /// Populates the pool with every address of its subnet.
    ///
    /// The network, gateway and broadcast addresses are pre-reserved so they
    /// are never handed out. Subnets too small to carry the three reserved
    /// addresses plus at least one allocatable one are rejected.
    pub(crate) fn populate(&mut self) -> Result<(), IpamError> {
        if self.subnet.prefix_len() + 2 > self.subnet.max_prefix_len() {
            return Err(IpamError::InvalidPoolId);
        }

        let first = self.subnet.network();
        let last = self.subnet.broadcast();
        let second = successor(first);

        let mut addr = first;
        loop {
            self.addresses.insert(
                addr,
                AddressRecord {
                    addr,
                    id: String::new(),
                    in_use: addr == first || addr == second || addr == last,
                    unhealthy: false,
                    epoch: self.epoch,
                },
            );
            if addr == last {
                break;
            }
            addr = successor(addr);
        }

        Ok(())
    }

    /// Requests an address from the pool.
    ///
    /// With a specific `address` the exact record is returned, idempotently
    /// when the reservation id matches the current holder. Without one, the
    /// reservation id is consulted first, then the lowest free address wins.
    pub(crate) fn request_address(
        &mut self,
        address: Option<IpAddr>,
        options: &Options,
    ) -> Result<AssignedAddress, IpamError> {
        let id = options.get(OPT_ADDRESS_ID).cloned().unwrap_or_default();

        let selected = if let Some(addr) = address {
            let record = self.addresses.get(&addr).ok_or(IpamError::AddressNotFound)?;
            if record.in_use && (id.is_empty() || id != record.id) {
                return Err(IpamError::AddressInUse);
            }
            Some(addr)
        } else if options.get(OPT_ADDRESS_TYPE).map(String::as_str) == Some(ADDRESS_TYPE_GATEWAY) {
            // The gateway assignment is synthetic: it is handed out without
            // ever being registered, so it cannot collide with id-based
            // reservations.
            return Ok(AssignedAddress {
                address: self.to_cidr(self.gateway),
                mutated: false,
            });
        } else if !id.is_empty() {
            self.addrs_by_id.get(&id).copied()
        } else {
            None
        };

        let addr = match selected {
            Some(addr) => addr,
            None => self
                .addresses
                .values()
                .find(|record| !record.in_use)
                .map(|record| record.addr)
                .ok_or(IpamError::NoAvailableAddresses)?,
        };

        if !id.is_empty() {
            self.addrs_by_id.insert(id.clone(), addr);
        }

        let record = self
            .addresses
            .get_mut(&addr)
            .expect("selected address is in the pool");
        record.id = id;
        record.in_use = true;

        tracing::debug!(pool = %self.id, address = %addr, "assigned address");

        Ok(AssignedAddress {
            address: self.to_cidr(addr),
            mutated: true,
        })
    }

    /// Releases a previously requested address back to the pool.
    ///
    /// Returns whether the pool state changed. Records that were kept alive
    /// only for the releasing holder are dropped.
    pub(crate) fn release_address(
        &mut self,
        address: Option<IpAddr>,
        options: &Options,
        space_epoch: u64,
    ) -> Result<bool, IpamError> {
        let id = options.get(OPT_ADDRESS_ID).cloned().unwrap_or_default();

        let addr = if let Some(addr) = address {
            if !self.addresses.contains_key(&addr) {
                // The gateway assignment was synthetic, releasing it is a
                // no-op.
                if addr == self.gateway {
                    return Ok(false);
                }
                return Err(IpamError::AddressNotFound);
            }
            addr
        } else if !id.is_empty() {
            *self.addrs_by_id.get(&id).ok_or(IpamError::AddressNotFound)?
        } else {
            return Err(IpamError::AddressNotFound);
        };

        let record = self
            .addresses
            .get_mut(&addr)
            .expect("resolved address is in the pool");
        if !id.is_empty() && id != record.id {
            return Err(IpamError::AddressNotFound);
        }
        if !record.in_use {
            return Err(IpamError::AddressNotInUse);
        }

        if !record.id.is_empty() {
            self.addrs_by_id.remove(&record.id);
        }
        record.id.clear();
        record.in_use = false;
        let stale = record.epoch < space_epoch;

        if stale {
            self.addresses.remove(&addr);
            tracing::debug!(pool = %self.id, address = %addr, "released and dropped stale address");
        } else {
            tracing::debug!(pool = %self.id, address = %addr, "released address");
        }

        Ok(true)
    }

    /// Returns information about the pool.
    pub fn info(&self) -> AddressPoolInfo {
        let mut available = 0;
        let mut unhealthy_addrs = Vec::new();

        for record in self.addresses.values() {
            if !record.in_use {
                available += 1;
            }
            if record.unhealthy {
                unhealthy_addrs.push(record.addr);
            }
        }

        AddressPoolInfo {
            subnet: self.subnet,
            gateway: self.gateway,
            dns_servers: vec![DNS_HOST_PROXY_ADDRESS],
            unhealthy_addrs,
            is_v6: self.is_v6,
            available,
            capacity: self.addresses.len(),
        }
    }

    fn to_cidr(&self, addr: IpAddr) -> String {
        format!("{}/{}", addr, self.subnet.prefix_len())
    }
}

/// Returns the first usable host address of a subnet.
pub(crate) fn first_usable_address(subnet: &IpNet) -> IpAddr {
    successor(subnet.network())
}

fn successor(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(1))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(1))),
    }
}
