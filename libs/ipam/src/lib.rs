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
//! # VNET IPAM
//!
//! IP address management for container networking on a cloud host.
//!
//! The [manager::AddressManager] discovers the routable prefixes the cloud
//! fabric has delegated to the host, organizes them into address spaces and
//! pools, and hands out individual addresses to containers. Reservations
//! survive restarts through a [store::KeyValueStore], and the in-memory
//! state is reconciled with the fabric's view by an epoch-based merge that
//! never pulls a held address out from under its owner.
//!
//! Snapshots of the fabric state are supplied by a pluggable
//! [source::AddressSource] and published into the manager through its
//! [source::AddressConfigSink].

pub mod error;
pub mod manager;
pub mod netif;
pub mod pool;
pub mod source;
pub mod space;
pub mod store;

mod dto;
