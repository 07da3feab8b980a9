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
//! Static-file address source.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    netif::InterfaceLister,
    source::{AddressConfigSink, AddressSource, SourceConfig, SourceError, document},
};

/// An [AddressSource] reading an interface document from disk.
///
/// The document uses the same structure the fabric serves.
pub struct FileSource {
    sink: Option<Arc<dyn AddressConfigSink>>,
    path: PathBuf,
    interfaces: Arc<dyn InterfaceLister>,
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileSource {
    /// Creates a file source from the given configuration.
    pub fn new(
        config: &SourceConfig,
        interfaces: Arc<dyn InterfaceLister>,
    ) -> Result<Self, SourceError> {
        let path = config
            .document_path
            .clone()
            .ok_or(SourceError::MissingDocumentPath)?;

        Ok(Self {
            sink: None,
            path,
            interfaces,
        })
    }
}

#[async_trait]
impl AddressSource for FileSource {
    fn start(&mut self, sink: Arc<dyn AddressConfigSink>) {
        self.sink = Some(sink);
    }

    fn stop(&mut self) {
        self.sink = None;
    }

    async fn refresh(&mut self) -> Result<(), SourceError> {
        let Some(sink) = self.sink.clone() else {
            return Ok(());
        };

        let interfaces = self.interfaces.list()?;
        let body = std::fs::read_to_string(&self.path)?;
        let doc = document::parse_document(&body)?;

        let space = document::assemble_address_space(&doc, &interfaces, sink.as_ref())?;
        sink.set_address_space(space)
            .map_err(|err| SourceError::Publish(Box::new(err)))
    }
}
