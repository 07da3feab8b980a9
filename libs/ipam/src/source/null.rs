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
//! No-op address source.

use std::sync::Arc;

use async_trait::async_trait;

use crate::source::{AddressConfigSink, AddressSource, SourceError};

/// An [AddressSource] that never publishes anything.
///
/// Used when snapshots are pushed by the embedding process instead of being
/// pulled from an upstream.
#[derive(Debug, Default)]
pub struct NullSource;

#[async_trait]
impl AddressSource for NullSource {
    fn start(&mut self, _sink: Arc<dyn AddressConfigSink>) {}

    fn stop(&mut self) {}

    async fn refresh(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
