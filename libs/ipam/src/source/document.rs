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
//! The interface document published by the cloud fabric, and its translation
//! into an address space snapshot.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;

use crate::{
    netif::{HostInterface, canonical_mac},
    pool::AddressPool,
    source::{AddressConfigSink, SourceError},
    space::{AddressScope, AddressSpace, LOCAL_ADDRESS_SPACE},
};

/// The fabric's interface document.
#[derive(Debug, Deserialize)]
#[serde(rename = "Interfaces")]
pub(crate) struct InterfaceDocument {
    #[serde(rename = "Interface", default)]
    pub(crate) interfaces: Vec<InterfaceEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InterfaceEntry {
    /// Hardware address of the interface; `*` matches any local interface.
    #[serde(rename = "@MacAddress")]
    pub(crate) mac_address: String,
    #[serde(rename = "@IsPrimary", default)]
    pub(crate) is_primary: bool,
    #[serde(rename = "IPSubnet", default)]
    pub(crate) subnets: Vec<SubnetEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubnetEntry {
    #[serde(rename = "@Prefix")]
    pub(crate) prefix: String,
    #[serde(rename = "IPAddress", default)]
    pub(crate) addresses: Vec<AddressEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddressEntry {
    #[serde(rename = "@Address")]
    pub(crate) address: String,
    /// Primary addresses are the host's own and stay reserved.
    #[serde(rename = "@IsPrimary", default)]
    pub(crate) is_primary: bool,
}

pub(crate) fn parse_document(text: &str) -> Result<InterfaceDocument, quick_xml::DeError> {
    quick_xml::de::from_str(text)
}

/// Assembles the local address space snapshot described by the document.
///
/// Document entries are matched against the host interfaces by canonical
/// hardware address; the `*` wildcard matches the first interface in
/// enumeration order. Entries without a local match are skipped. Secondary
/// interfaces get a higher allocation priority than the primary one.
pub(crate) fn assemble_address_space(
    doc: &InterfaceDocument,
    interfaces: &[HostInterface],
    sink: &dyn AddressConfigSink,
) -> Result<AddressSpace, SourceError> {
    let mut local = sink.new_address_space(LOCAL_ADDRESS_SPACE, AddressScope::Local);

    for entry in &doc.interfaces {
        let doc_mac = canonical_mac(&entry.mac_address);
        let matched = interfaces
            .iter()
            .find(|nic| doc_mac == "*" || canonical_mac(&nic.mac) == doc_mac);
        let Some(nic) = matched else {
            tracing::debug!(mac = %entry.mac_address, "no local interface matches document entry, skipping");
            continue;
        };

        let priority = if entry.is_primary { 0 } else { 1 };

        for subnet_entry in &entry.subnets {
            let subnet: IpNet = subnet_entry
                .prefix
                .parse()
                .map_err(SourceError::InvalidPrefix)?;

            // The same subnet may appear more than once in the document.
            let key = AddressPool::key(&subnet, "");
            if local.pool(&key).is_none() {
                local
                    .new_address_pool(&nic.name, "", priority, subnet)
                    .map_err(|err| SourceError::InvalidRecord(Box::new(err)))?;
            }
            let pool = local.pool_mut(&key).expect("pool was just ensured");

            for address_entry in &subnet_entry.addresses {
                if address_entry.is_primary {
                    continue;
                }
                let addr: IpAddr = address_entry
                    .address
                    .parse()
                    .map_err(SourceError::InvalidAddress)?;
                pool.add_record(addr)
                    .map_err(|err| SourceError::InvalidRecord(Box::new(err)))?;
            }
        }
    }

    Ok(local)
}
