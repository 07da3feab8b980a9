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
//! End-to-end allocation walk-through.
//!
//! 1. Builds an address manager persisting to a JSON file.
//! 2. Publishes a snapshot the way a source would.
//! 3. Requests a pool, an address and the gateway, then releases everything.

use std::sync::Arc;

use vnet_ipam::{
    manager::{
        ADDRESS_TYPE_GATEWAY, AddressManager, OPT_ADDRESS_ID, OPT_ADDRESS_TYPE,
        OPT_INTERFACE_NAME, Options,
    },
    source::{Environment, SourceConfig},
    space::{AddressScope, LOCAL_ADDRESS_SPACE},
    store::JsonFileStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let state_file = std::env::temp_dir().join("vnet-ipam-example.json");
    let manager = AddressManager::builder()
        .with_store(Arc::new(JsonFileStore::new(&state_file)))
        .with_source_config(SourceConfig {
            environment: Environment::Null,
            ..SourceConfig::default()
        })
        .build()?;

    // Publish a snapshot the way a source would: one pool on eth1 with three
    // usable addresses.
    let sink = manager.config_sink();
    let mut space = sink.new_address_space(LOCAL_ADDRESS_SPACE, AddressScope::Local);
    let pool = space.new_address_pool("eth1", "", 0, "192.168.0.0/24".parse()?)?;
    for addr in ["192.168.0.2", "192.168.0.3", "192.168.0.4"] {
        pool.add_record(addr.parse()?)?;
    }
    sink.set_address_space(space)?;

    let eth1: Options = [(OPT_INTERFACE_NAME.to_string(), "eth1".to_string())]
        .into_iter()
        .collect();
    let (pool_id, subnet) = manager
        .request_pool(LOCAL_ADDRESS_SPACE, "", "", &eth1, false)
        .await?;
    println!("pool {pool_id} with subnet {subnet}");

    let container: Options = [(OPT_ADDRESS_ID.to_string(), "container-1".to_string())]
        .into_iter()
        .collect();
    let address = manager
        .request_address(LOCAL_ADDRESS_SPACE, &pool_id, "", &container)
        .await?;
    println!("container-1 got {address}");

    let gateway_opts: Options = [(OPT_ADDRESS_TYPE.to_string(), ADDRESS_TYPE_GATEWAY.to_string())]
        .into_iter()
        .collect();
    let gateway = manager
        .request_address(LOCAL_ADDRESS_SPACE, &pool_id, "", &gateway_opts)
        .await?;
    println!("gateway is {gateway}");

    manager
        .release_address(LOCAL_ADDRESS_SPACE, &pool_id, "192.168.0.2", &container)
        .await?;
    manager.release_pool(LOCAL_ADDRESS_SPACE, &pool_id).await?;
    println!("released, state persisted at {}", state_file.display());

    Ok(())
}
