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
//! Address management errors.

use thiserror::Error;

use crate::{source::SourceError, store::StoreError};

/// Errors surfaced by address management operations.
///
/// Every error is propagated to the caller unchanged; nothing is retried
/// internally.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Address space scope outside the known set.
    #[error("invalid address space scope")]
    InvalidScope,
    /// Unknown address space id.
    #[error("invalid address space")]
    InvalidAddressSpace,
    /// Malformed pool id string or malformed overlay CIDR.
    #[error("invalid address pool id")]
    InvalidPoolId,
    /// Pool creation collided with an existing pool.
    #[error("address pool already exists")]
    AddressPoolExists,
    /// Unknown pool id on request, release or info.
    #[error("address pool not found")]
    AddressPoolNotFound,
    /// Pool release without an outstanding reference.
    #[error("address pool not in use")]
    AddressPoolNotInUse,
    /// No pool matched the requested constraints.
    #[error("no available address pools")]
    NoAvailableAddressPools,
    /// Record creation collided with an existing record.
    #[error("address already exists")]
    AddressExists,
    /// Record creation with an address outside the pool subnet.
    #[error("invalid address")]
    InvalidAddress,
    /// Unknown address on request or release.
    #[error("address not found")]
    AddressNotFound,
    /// Specific address requested but held by a different reservation id.
    #[error("address already in use")]
    AddressInUse,
    /// Release of an address that is free.
    #[error("address not in use")]
    AddressNotInUse,
    /// Pool exhausted for an "any address" request.
    #[error("no available addresses")]
    NoAvailableAddresses,
    /// Persistent store failure. The in-memory mutation is kept; callers are
    /// expected to retry or restart.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Address source failure.
    #[error("address source error: {0}")]
    Source(#[from] SourceError),
}
