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
//! Fabric-query address source.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use url::Url;

use crate::{
    netif::InterfaceLister,
    source::{AddressConfigSink, AddressSource, SourceConfig, SourceError, document},
};

/// The fabric endpoint that serves the interface document.
pub const DEFAULT_QUERY_URL: &str =
    "http://169.254.169.254/machine/plugins?comp=nmagent&type=getinterfaceinfov1";

/// Minimum interval between consecutive fabric queries.
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(10);

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// An [AddressSource] that queries the cloud fabric's interface document over
/// HTTP.
///
/// The query runs outside any manager lock; only publishing the assembled
/// snapshot goes through the sink.
pub struct FabricSource {
    sink: Option<Arc<dyn AddressConfigSink>>,
    query_url: Url,
    query_interval: Duration,
    last_refresh: Option<Instant>,
    http_client: reqwest::Client,
    interfaces: Arc<dyn InterfaceLister>,
}

impl FabricSource {
    /// Creates a fabric source from the given configuration.
    pub fn new(
        config: &SourceConfig,
        interfaces: Arc<dyn InterfaceLister>,
    ) -> Result<Self, SourceError> {
        let query_url = match &config.query_url {
            Some(url) => url.clone(),
            None => Url::parse(DEFAULT_QUERY_URL).expect("default query URL is valid"),
        };
        let http_client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            sink: None,
            query_url,
            query_interval: config.query_interval.unwrap_or(DEFAULT_QUERY_INTERVAL),
            last_refresh: None,
            http_client,
            interfaces,
        })
    }
}

#[async_trait]
impl AddressSource for FabricSource {
    fn start(&mut self, sink: Arc<dyn AddressConfigSink>) {
        self.sink = Some(sink);
    }

    fn stop(&mut self) {
        self.sink = None;
    }

    async fn refresh(&mut self) -> Result<(), SourceError> {
        // Refresh only if enough time has passed since the last query.
        if let Some(last) = self.last_refresh {
            if last.elapsed() < self.query_interval {
                return Ok(());
            }
        }
        self.last_refresh = Some(Instant::now());

        let Some(sink) = self.sink.clone() else {
            return Ok(());
        };

        let interfaces = self.interfaces.list()?;

        let response = self
            .http_client
            .get(self.query_url.clone())
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        let doc = document::parse_document(&body)?;

        tracing::debug!(
            url = %self.query_url,
            entries = doc.interfaces.len(),
            "fetched fabric interface document"
        );

        let space = document::assemble_address_space(&doc, &interfaces, sink.as_ref())?;
        sink.set_address_space(space)
            .map_err(|err| SourceError::Publish(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{netif::MockInterfaceLister, source::document::tests::BuilderSink};

    fn unreachable_source(interval: Duration) -> FabricSource {
        let mut lister = MockInterfaceLister::new();
        lister.expect_list().returning(|| Ok(vec![]));

        let config = SourceConfig {
            // Nothing listens on port 9; the query fails fast.
            query_url: Some("http://127.0.0.1:9/doc".parse().unwrap()),
            query_interval: Some(interval),
            ..SourceConfig::default()
        };
        let mut source = FabricSource::new(&config, Arc::new(lister)).unwrap();
        source.start(Arc::new(BuilderSink));
        source
    }

    #[tokio::test]
    async fn refresh_respects_minimum_interval() {
        let mut source = unreachable_source(Duration::from_secs(3600));

        assert_matches!(source.refresh().await, Err(SourceError::Query(_)));
        // Within the minimum interval the refresh is a no-op, even after a
        // failure.
        assert_matches!(source.refresh().await, Ok(()));
    }

    #[tokio::test]
    async fn refresh_without_sink_is_a_no_op() {
        let mut source = unreachable_source(Duration::ZERO);
        source.stop();
        assert_matches!(source.refresh().await, Ok(()));
    }
}
