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
//! Pluggable suppliers of address space snapshots.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    error::IpamError,
    netif::InterfaceLister,
    source::{fabric::FabricSource, file::FileSource, null::NullSource},
    space::{AddressScope, AddressSpace},
};

pub(crate) mod document;
pub mod fabric;
pub mod file;
pub mod null;

/// Errors raised by address sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Querying the fabric failed. Transient failures are expected, the next
    /// refresh retries.
    #[error("error querying the address source: {0}")]
    Query(#[from] reqwest::Error),
    /// The interface document could not be decoded.
    #[error("malformed interface document: {0}")]
    MalformedDocument(#[from] quick_xml::DeError),
    /// Reading local host state or the document file failed.
    #[error("error reading local host state: {0}")]
    Io(#[from] std::io::Error),
    /// The document carried an unparseable subnet prefix.
    #[error("invalid subnet prefix in interface document: {0}")]
    InvalidPrefix(#[source] ipnet::AddrParseError),
    /// The document carried an unparseable address.
    #[error("invalid address in interface document: {0}")]
    InvalidAddress(#[source] std::net::AddrParseError),
    /// A document record was rejected by the address space.
    #[error("interface document record rejected: {0}")]
    InvalidRecord(#[source] Box<IpamError>),
    /// Publishing the assembled snapshot failed.
    #[error("error publishing snapshot: {0}")]
    Publish(#[source] Box<IpamError>),
    /// The file source was configured without a document path.
    #[error("missing interface document path")]
    MissingDocumentPath,
}

/// The deployment environment, which determines the snapshot source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Query the cloud fabric over HTTP.
    #[default]
    Azure,
    /// Read a static interface document from disk.
    File,
    /// No source; snapshots are published by the embedding process.
    Null,
}

/// Address source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// The deployment environment.
    pub environment: Environment,
    /// Fabric query URL override.
    pub query_url: Option<Url>,
    /// Minimum interval between consecutive fabric queries.
    pub query_interval: Option<Duration>,
    /// Path of the static interface document, for the file environment.
    pub document_path: Option<PathBuf>,
}

/// The callbacks a source uses to publish a fresh snapshot.
pub trait AddressConfigSink: Send + Sync {
    /// Creates a new, empty address space for the source to populate.
    fn new_address_space(&self, id: &str, scope: AddressScope) -> AddressSpace;

    /// Publishes a populated snapshot, merging it into the live state.
    fn set_address_space(&self, space: AddressSpace) -> Result<(), IpamError>;
}

/// A supplier of address space snapshots.
///
/// Refresh is driven by explicit calls; sources keep their own minimum
/// refresh interval but carry no timers.
#[async_trait]
pub trait AddressSource: Send {
    /// Hands the source the sink it publishes through.
    fn start(&mut self, sink: Arc<dyn AddressConfigSink>);

    /// Drops the sink; the source stops publishing.
    fn stop(&mut self);

    /// Queries the upstream state and publishes a fresh snapshot through the
    /// sink if due.
    async fn refresh(&mut self) -> Result<(), SourceError>;
}

/// Constructs the source for the configured environment.
pub(crate) fn create_source(
    config: &SourceConfig,
    interfaces: Arc<dyn InterfaceLister>,
) -> Result<Box<dyn AddressSource>, SourceError> {
    match config.environment {
        Environment::Azure => Ok(Box::new(FabricSource::new(config, interfaces)?)),
        Environment::File => Ok(Box::new(FileSource::new(config, interfaces)?)),
        Environment::Null => Ok(Box::new(NullSource)),
    }
}
