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
//! The address manager.
//!
//! [AddressManager] is the process-wide authority for addresses delegated to
//! this host. It owns the address spaces, routes client requests to the
//! right space and pool, drives source refreshes, and persists every
//! mutation.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    net::IpAddr,
    sync::{Arc, Mutex},
};

#[cfg(test)]
use mockall::automock;

use crate::{
    dto::ManagerStateDto,
    error::IpamError,
    netif::{InterfaceLister, SysfsInterfaceLister},
    pool::AddressPoolInfo,
    source::{self, AddressConfigSink, AddressSource, SourceConfig, SourceError},
    space::{AddressScope, AddressSpace, GLOBAL_ADDRESS_SPACE, LOCAL_ADDRESS_SPACE},
    store::{KeyValueStore, StoreError},
};

/// Request option maps, as exchanged with clients.
pub type Options = BTreeMap<String, String>;

/// Restricts pool selection to the given host interface.
pub const OPT_INTERFACE_NAME: &str = "interface-name";
/// Client-supplied reservation id for idempotent request and release.
pub const OPT_ADDRESS_ID: &str = "address-id";
/// Selects a special address kind instead of a pool record.
pub const OPT_ADDRESS_TYPE: &str = "address-type";
/// The [OPT_ADDRESS_TYPE] value requesting the pool gateway.
pub const ADDRESS_TYPE_GATEWAY: &str = "gateway";
/// Allows `request_pool` to synthesize a pool from a CIDR.
pub const OPT_OVERLAY_NETWORK: &str = "overlay-network";
/// Disambiguates overlay pools sharing a subnet string.
pub const OPT_NETWORK_NAME: &str = "network-name";

/// The store namespace the manager persists under.
const MANAGER_STORE_KEY: &str = "IPAM";

/// Callbacks into the networking layer.
#[cfg_attr(test, automock)]
pub trait NetworkApi: Send + Sync {
    /// Notifies the networking layer that an external interface carrying the
    /// given subnet appeared.
    fn add_external_interface(&self, if_name: &str, subnet: &str);
}

/// Builder for an [AddressManager].
#[derive(Default)]
pub struct AddressManagerBuilder {
    store: Option<Arc<dyn KeyValueStore>>,
    net_api: Option<Arc<dyn NetworkApi>>,
    source_config: SourceConfig,
    interface_lister: Option<Arc<dyn InterfaceLister>>,
}

impl AddressManagerBuilder {
    /// Creates a new builder with no store, no networking callbacks and the
    /// default source configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist the manager state to `store`.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Notify `net_api` when snapshots carry external interfaces.
    pub fn with_net_api(mut self, net_api: Arc<dyn NetworkApi>) -> Self {
        self.net_api = Some(net_api);
        self
    }

    /// Use `config` to construct the snapshot source.
    pub fn with_source_config(mut self, config: SourceConfig) -> Self {
        self.source_config = config;
        self
    }

    /// Use `lister` to enumerate host interfaces instead of sysfs.
    pub fn with_interface_lister(mut self, lister: Arc<dyn InterfaceLister>) -> Self {
        self.interface_lister = Some(lister);
        self
    }

    /// Builds the manager: restores persisted state, if any, and constructs
    /// the configured source.
    pub fn build(self) -> Result<AddressManager, IpamError> {
        let spaces = match &self.store {
            Some(store) => ManagerState::restore(store.as_ref())?,
            None => BTreeMap::new(),
        };

        let lister = self
            .interface_lister
            .unwrap_or_else(|| Arc::new(SysfsInterfaceLister::new()));
        let source = source::create_source(&self.source_config, lister)?;

        tracing::info!(
            environment = ?self.source_config.environment,
            spaces = spaces.len(),
            "address manager initialized"
        );

        Ok(AddressManager {
            state: Arc::new(Mutex::new(ManagerState {
                spaces,
                store: self.store,
                net_api: self.net_api,
            })),
            source: Arc::new(tokio::sync::Mutex::new(source)),
        })
    }
}

/// The process-wide address manager.
///
/// Cloning yields another handle onto the same shared state. One mutex
/// guards the whole spaces tree; every public operation holds it for its
/// full duration, including the store write. Sources query the fabric
/// outside that mutex and take it only to publish through the sink.
#[derive(Clone)]
pub struct AddressManager {
    state: Arc<Mutex<ManagerState>>,
    source: Arc<tokio::sync::Mutex<Box<dyn AddressSource>>>,
}

impl std::fmt::Debug for AddressManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressManager").finish_non_exhaustive()
    }
}

impl AddressManager {
    /// Returns a builder.
    pub fn builder() -> AddressManagerBuilder {
        AddressManagerBuilder::new()
    }

    /// Hands the source its sink and starts it.
    pub async fn start_source(&self) {
        let sink = self.config_sink();
        self.source.lock().await.start(sink);
    }

    /// Stops the source; it drops its sink.
    pub async fn stop_source(&self) {
        self.source.lock().await.stop();
    }

    /// The sink through which snapshots are published into this manager.
    pub fn config_sink(&self) -> Arc<dyn AddressConfigSink> {
        Arc::new(SinkHandle {
            state: self.state.clone(),
        })
    }

    async fn refresh_source(&self) -> Result<(), SourceError> {
        self.source.lock().await.refresh().await
    }

    /// Refreshes the source, tolerating failures: the operation proceeds on
    /// the last known state.
    async fn refresh_source_lossy(&self) {
        if let Err(err) = self.refresh_source().await {
            tracing::warn!(%err, "failed to refresh address source");
        }
    }

    /// Returns the canonical default address space ids.
    pub async fn get_default_address_spaces(&self) -> (String, String) {
        self.refresh_source_lossy().await;
        (
            LOCAL_ADDRESS_SPACE.to_string(),
            GLOBAL_ADDRESS_SPACE.to_string(),
        )
    }

    /// Requests a pool reference and returns `(pool_id, subnet)`.
    pub async fn request_pool(
        &self,
        space_id: &str,
        pool_id: &str,
        sub_pool_id: &str,
        options: &Options,
        v6: bool,
    ) -> Result<(String, String), IpamError> {
        self.refresh_source().await?;

        let mut state = self.state.lock().unwrap();
        let space = state.space_mut(space_id)?;
        let selected = space.request_pool(pool_id, sub_pool_id, options, v6)?;
        let subnet = space
            .pool(&selected)
            .expect("requested pool is present")
            .subnet()
            .to_string();
        state.save()?;

        Ok((selected, subnet))
    }

    /// Releases a previously requested pool reference.
    pub async fn release_pool(&self, space_id: &str, pool_id: &str) -> Result<(), IpamError> {
        self.refresh_source_lossy().await;

        let mut state = self.state.lock().unwrap();
        state.space_mut(space_id)?.release_pool(pool_id)?;
        state.save()?;

        Ok(())
    }

    /// Returns information about a pool.
    pub async fn get_pool_info(
        &self,
        space_id: &str,
        pool_id: &str,
    ) -> Result<AddressPoolInfo, IpamError> {
        self.refresh_source_lossy().await;

        let state = self.state.lock().unwrap();
        let space = state
            .spaces
            .get(space_id)
            .ok_or(IpamError::InvalidAddressSpace)?;
        let pool = space.pool(pool_id).ok_or(IpamError::AddressPoolNotFound)?;
        Ok(pool.info())
    }

    /// Requests an address and returns it in CIDR notation. An empty
    /// `address` requests any free address.
    pub async fn request_address(
        &self,
        space_id: &str,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<String, IpamError> {
        self.refresh_source().await?;

        let address = parse_optional_address(address)?;
        let mut state = self.state.lock().unwrap();
        let space = state.space_mut(space_id)?;
        let pool = space
            .pool_mut(pool_id)
            .ok_or(IpamError::AddressPoolNotFound)?;
        let assigned = pool.request_address(address, options)?;
        if assigned.mutated {
            state.save()?;
        }

        Ok(assigned.address)
    }

    /// Releases a previously requested address. An empty `address` releases
    /// by reservation id.
    pub async fn release_address(
        &self,
        space_id: &str,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<(), IpamError> {
        self.refresh_source_lossy().await;

        let address = parse_optional_address(address)?;
        let mut state = self.state.lock().unwrap();
        let space = state.space_mut(space_id)?;
        let space_epoch = space.epoch;
        let pool = space
            .pool_mut(pool_id)
            .ok_or(IpamError::AddressPoolNotFound)?;
        let mutated = pool.release_address(address, options, space_epoch)?;
        if mutated {
            state.save()?;
        }

        Ok(())
    }
}

fn parse_optional_address(address: &str) -> Result<Option<IpAddr>, IpamError> {
    if address.is_empty() {
        return Ok(None);
    }
    address
        .parse()
        .map(Some)
        .map_err(|_| IpamError::AddressNotFound)
}

struct ManagerState {
    spaces: BTreeMap<String, AddressSpace>,
    store: Option<Arc<dyn KeyValueStore>>,
    net_api: Option<Arc<dyn NetworkApi>>,
}

impl ManagerState {
    fn restore(store: &dyn KeyValueStore) -> Result<BTreeMap<String, AddressSpace>, StoreError> {
        match store.read(MANAGER_STORE_KEY)? {
            None => Ok(BTreeMap::new()),
            Some(bytes) => {
                let dto: ManagerStateDto =
                    serde_json::from_slice(&bytes).map_err(StoreError::Malformed)?;
                dto.into_spaces().map_err(StoreError::InvalidState)
            }
        }
    }

    /// Serializes the whole manager state to the store. The in-memory
    /// mutation is never rolled back on failure; callers see the error and
    /// retry or restart.
    fn save(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let dto = ManagerStateDto::from(&self.spaces);
        let bytes = serde_json::to_vec(&dto).map_err(StoreError::Malformed)?;
        store.write(MANAGER_STORE_KEY, &bytes)
    }

    fn space_mut(&mut self, id: &str) -> Result<&mut AddressSpace, IpamError> {
        self.spaces
            .get_mut(id)
            .ok_or(IpamError::InvalidAddressSpace)
    }

    fn set_address_space(&mut self, space: AddressSpace) -> Result<(), IpamError> {
        if let Some(net_api) = &self.net_api {
            for pool in space.pools() {
                if !pool.if_name().is_empty() {
                    net_api.add_external_interface(pool.if_name(), &pool.subnet().to_string());
                }
            }
        }

        match self.spaces.entry(space.id().to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(space);
            }
            Entry::Occupied(mut entry) => entry.get_mut().merge(space),
        }

        self.save()?;
        Ok(())
    }
}

/// The sink handle handed to sources; publishing takes the manager lock.
struct SinkHandle {
    state: Arc<Mutex<ManagerState>>,
}

impl AddressConfigSink for SinkHandle {
    fn new_address_space(&self, id: &str, scope: AddressScope) -> AddressSpace {
        AddressSpace::new(id, scope)
    }

    fn set_address_space(&self, space: AddressSpace) -> Result<(), IpamError> {
        self.state.lock().unwrap().set_address_space(space)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        source::Environment,
        store::{MemoryStore, MockKeyValueStore},
    };

    fn null_manager() -> AddressManager {
        AddressManager::builder()
            .with_source_config(SourceConfig {
                environment: Environment::Null,
                ..SourceConfig::default()
            })
            .build()
            .unwrap()
    }

    fn publish_snapshot(manager: &AddressManager) {
        let sink = manager.config_sink();
        let mut space = sink.new_address_space(LOCAL_ADDRESS_SPACE, AddressScope::Local);
        let pool = space
            .new_address_pool("eth1", "", 0, "192.168.0.0/24".parse().unwrap())
            .unwrap();
        for last in ["192.168.0.2", "192.168.0.3"] {
            pool.add_record(last.parse().unwrap()).unwrap();
        }
        sink.set_address_space(space).unwrap();
    }

    #[tokio::test]
    async fn default_address_spaces_are_canonical() {
        let manager = null_manager();
        let (local, global) = manager.get_default_address_spaces().await;
        assert_eq!(local, "local");
        assert_eq!(global, "global");
    }

    #[tokio::test]
    async fn unknown_space_is_rejected() {
        let manager = null_manager();
        assert_matches!(
            manager
                .request_pool("mars", "", "", &Options::new(), false)
                .await,
            Err(IpamError::InvalidAddressSpace)
        );
    }

    #[tokio::test]
    async fn mutations_are_persisted_and_restored() {
        let store = Arc::new(MemoryStore::new());

        let manager = AddressManager::builder()
            .with_store(store.clone())
            .with_source_config(SourceConfig {
                environment: Environment::Null,
                ..SourceConfig::default()
            })
            .build()
            .unwrap();
        publish_snapshot(&manager);

        let options: Options = [(OPT_ADDRESS_ID.to_string(), "c1".to_string())]
            .into_iter()
            .collect();
        manager
            .request_pool("local", "192.168.0.0/24", "", &Options::new(), false)
            .await
            .unwrap();
        let assigned = manager
            .request_address("local", "192.168.0.0/24", "", &options)
            .await
            .unwrap();

        // A manager built on the same store sees the identical state and
        // honors the reservation idempotently.
        let restored = AddressManager::builder()
            .with_store(store)
            .with_source_config(SourceConfig {
                environment: Environment::Null,
                ..SourceConfig::default()
            })
            .build()
            .unwrap();
        let again = restored
            .request_address("local", "192.168.0.0/24", "", &options)
            .await
            .unwrap();
        assert_eq!(assigned, again);
    }

    #[tokio::test]
    async fn persist_failure_is_surfaced_but_mutation_kept() {
        let mut store = MockKeyValueStore::new();
        store.expect_read().returning(|_| Ok(None));
        // The snapshot publish persists fine, the allocation write fails.
        store.expect_write().times(1).returning(|_, _| Ok(()));
        store
            .expect_write()
            .returning(|_, _| Err(StoreError::Io(std::io::Error::other("disk full"))));

        let manager = AddressManager::builder()
            .with_store(Arc::new(store))
            .with_source_config(SourceConfig {
                environment: Environment::Null,
                ..SourceConfig::default()
            })
            .build()
            .unwrap();
        publish_snapshot(&manager);

        let c1: Options = [(OPT_ADDRESS_ID.to_string(), "c1".to_string())]
            .into_iter()
            .collect();
        assert_matches!(
            manager
                .request_address("local", "192.168.0.0/24", "192.168.0.2", &c1)
                .await,
            Err(IpamError::Store(_))
        );

        // The in-memory assignment stuck, a different id cannot take the
        // address.
        let c2: Options = [(OPT_ADDRESS_ID.to_string(), "c2".to_string())]
            .into_iter()
            .collect();
        assert_matches!(
            manager
                .request_address("local", "192.168.0.0/24", "192.168.0.2", &c2)
                .await,
            Err(IpamError::AddressInUse)
        );
    }

    #[tokio::test]
    async fn corrupt_store_fails_initialization() {
        let store = Arc::new(MemoryStore::new());
        store.write(MANAGER_STORE_KEY, b"} not json {").unwrap();

        let result = AddressManager::builder().with_store(store).build();
        assert_matches!(result, Err(IpamError::Store(StoreError::Malformed(_))));
    }

    #[tokio::test]
    async fn snapshot_publish_notifies_networking_layer() {
        let mut net_api = MockNetworkApi::new();
        net_api
            .expect_add_external_interface()
            .with(eq("eth1"), eq("192.168.0.0/24"))
            .times(1)
            .return_const(());

        let manager = AddressManager::builder()
            .with_net_api(Arc::new(net_api))
            .with_source_config(SourceConfig {
                environment: Environment::Null,
                ..SourceConfig::default()
            })
            .build()
            .unwrap();
        publish_snapshot(&manager);
    }

    #[tokio::test]
    async fn gateway_release_does_not_persist() {
        let store = Arc::new(MemoryStore::new());
        let manager = AddressManager::builder()
            .with_store(store.clone())
            .with_source_config(SourceConfig {
                environment: Environment::Null,
                ..SourceConfig::default()
            })
            .build()
            .unwrap();
        publish_snapshot(&manager);
        let before = store.read(MANAGER_STORE_KEY).unwrap();

        let gateway: Options = [(OPT_ADDRESS_TYPE.to_string(), ADDRESS_TYPE_GATEWAY.to_string())]
            .into_iter()
            .collect();
        let assigned = manager
            .request_address("local", "192.168.0.0/24", "", &gateway)
            .await
            .unwrap();
        assert_eq!(assigned, "192.168.0.1/24");
        manager
            .release_address("local", "192.168.0.0/24", "192.168.0.1", &Options::new())
            .await
            .unwrap();

        let after = store.read(MANAGER_STORE_KEY).unwrap();
        assert_eq!(before, after, "gateway round trip must not change state");
    }
}
