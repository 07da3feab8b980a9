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
//! Data transfer objects (DTOs) for the persisted manager state.

use std::{collections::BTreeMap, net::IpAddr};

use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{
    pool::{AddressPool, AddressRecord},
    space::{AddressScope, AddressSpace},
};

/// The persisted manager state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManagerStateDto {
    /// The address spaces owned by the manager.
    pub(crate) address_spaces: Vec<AddressSpaceDto>,
}

impl From<&BTreeMap<String, AddressSpace>> for ManagerStateDto {
    fn from(spaces: &BTreeMap<String, AddressSpace>) -> Self {
        Self {
            address_spaces: spaces.values().map(AddressSpaceDto::from).collect(),
        }
    }
}

impl ManagerStateDto {
    /// Reconstructs the address space tree described by the DTO.
    pub(crate) fn into_spaces(self) -> anyhow::Result<BTreeMap<String, AddressSpace>> {
        self.address_spaces
            .into_iter()
            .map(|space| {
                let space = AddressSpace::try_from(space).context("invalid address space")?;
                Ok((space.id().to_string(), space))
            })
            .collect()
    }
}

/// A persisted address space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AddressSpaceDto {
    pub(crate) id: String,
    pub(crate) scope: String,
    /// The live snapshot generation; persisted so post-restart merges stay
    /// consistent.
    pub(crate) epoch: u64,
    pub(crate) pools: Vec<AddressPoolDto>,
}

impl From<&AddressSpace> for AddressSpaceDto {
    fn from(space: &AddressSpace) -> Self {
        Self {
            id: space.id.clone(),
            scope: space.scope.to_string(),
            epoch: space.epoch,
            pools: space.pools.values().map(AddressPoolDto::from).collect(),
        }
    }
}

impl TryFrom<AddressSpaceDto> for AddressSpace {
    type Error = anyhow::Error;

    fn try_from(dto: AddressSpaceDto) -> Result<Self, Self::Error> {
        let scope: AddressScope = dto
            .scope
            .parse()
            .with_context(|| format!("invalid scope {:?}", dto.scope))?;

        let mut pools = BTreeMap::new();
        for pool in dto.pools {
            let pool = AddressPool::try_from(pool).context("invalid address pool")?;
            if pools.insert(pool.id().to_string(), pool).is_some() {
                anyhow::bail!("duplicate address pool");
            }
        }

        Ok(Self {
            id: dto.id,
            scope,
            pools,
            epoch: dto.epoch,
        })
    }
}

/// A persisted address pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AddressPoolDto {
    pub(crate) id: String,
    pub(crate) if_name: String,
    pub(crate) subnet: String,
    pub(crate) gateway: String,
    pub(crate) is_v6: bool,
    pub(crate) priority: i32,
    pub(crate) ref_count: u32,
    pub(crate) epoch: u64,
    pub(crate) addresses: Vec<AddressRecordDto>,
}

impl From<&AddressPool> for AddressPoolDto {
    fn from(pool: &AddressPool) -> Self {
        Self {
            id: pool.id.clone(),
            if_name: pool.if_name.clone(),
            subnet: pool.subnet.to_string(),
            gateway: pool.gateway.to_string(),
            is_v6: pool.is_v6,
            priority: pool.priority,
            ref_count: pool.ref_count,
            epoch: pool.epoch,
            addresses: pool.addresses.values().map(AddressRecordDto::from).collect(),
        }
    }
}

impl TryFrom<AddressPoolDto> for AddressPool {
    type Error = anyhow::Error;

    fn try_from(dto: AddressPoolDto) -> Result<Self, Self::Error> {
        let subnet: IpNet = dto.subnet.parse().context("invalid subnet")?;
        let gateway: IpAddr = dto.gateway.parse().context("invalid gateway")?;

        let mut addresses = BTreeMap::new();
        // The reservation-id index is derived state, rebuilt from the
        // records.
        let mut addrs_by_id = BTreeMap::new();
        for record in dto.addresses {
            let record = AddressRecord::try_from(record).context("invalid address record")?;
            if !subnet.contains(&record.addr) {
                anyhow::bail!("address {} outside pool subnet {}", record.addr, subnet);
            }
            if record.in_use && !record.id.is_empty() {
                addrs_by_id.insert(record.id.clone(), record.addr);
            }
            if addresses.insert(record.addr, record).is_some() {
                anyhow::bail!("duplicate address record");
            }
        }

        Ok(Self {
            id: dto.id,
            if_name: dto.if_name,
            subnet,
            gateway,
            addresses,
            addrs_by_id,
            is_v6: dto.is_v6,
            priority: dto.priority,
            ref_count: dto.ref_count,
            epoch: dto.epoch,
        })
    }
}

/// A persisted address record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AddressRecordDto {
    pub(crate) address: String,
    pub(crate) id: String,
    pub(crate) in_use: bool,
    pub(crate) unhealthy: bool,
    pub(crate) epoch: u64,
}

impl From<&AddressRecord> for AddressRecordDto {
    fn from(record: &AddressRecord) -> Self {
        Self {
            address: record.addr.to_string(),
            id: record.id.clone(),
            in_use: record.in_use,
            unhealthy: record.unhealthy,
            epoch: record.epoch,
        }
    }
}

impl TryFrom<AddressRecordDto> for AddressRecord {
    type Error = anyhow::Error;

    fn try_from(dto: AddressRecordDto) -> Result<Self, Self::Error> {
        Ok(Self {
            addr: dto.address.parse().context("invalid address")?,
            id: dto.id,
            in_use: dto.in_use,
            unhealthy: dto.unhealthy,
            epoch: dto.epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manager::{OPT_ADDRESS_ID, Options},
        space::LOCAL_ADDRESS_SPACE,
    };

    fn populated_spaces() -> BTreeMap<String, AddressSpace> {
        let mut snapshot = AddressSpace::new(LOCAL_ADDRESS_SPACE, AddressScope::Local);
        {
            let pool = snapshot
                .new_address_pool("eth1", "", 1, "192.168.0.0/24".parse().unwrap())
                .unwrap();
            pool.add_record("192.168.0.2".parse().unwrap()).unwrap();
            pool.add_record("192.168.0.3".parse().unwrap()).unwrap();
        }

        let mut live = AddressSpace::new(LOCAL_ADDRESS_SPACE, AddressScope::Local);
        live.merge(snapshot);
        live.request_pool("192.168.0.0/24", "", &Options::new(), false)
            .unwrap();

        let options: Options = [(OPT_ADDRESS_ID.to_string(), "c1".to_string())]
            .into_iter()
            .collect();
        live.pool_mut("192.168.0.0/24")
            .unwrap()
            .request_address(None, &options)
            .unwrap();

        [(live.id().to_string(), live)].into_iter().collect()
    }

    #[test]
    fn convert() {
        let before = populated_spaces();

        let dto = ManagerStateDto::from(&before);
        let bytes = serde_json::to_vec(&dto).unwrap();
        let decoded: ManagerStateDto = serde_json::from_slice(&bytes).unwrap();
        let after = decoded.into_spaces().unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn rejects_record_outside_subnet() {
        let mut dto = ManagerStateDto::from(&populated_spaces());
        dto.address_spaces[0].pools[0].addresses[0].address = "10.9.9.9".to_string();

        assert!(dto.into_spaces().is_err());
    }

    #[test]
    fn rejects_unknown_scope() {
        let mut dto = ManagerStateDto::from(&populated_spaces());
        dto.address_spaces[0].scope = "galactic".to_string();

        assert!(dto.into_spaces().is_err());
    }
}
