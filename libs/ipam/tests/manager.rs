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
//! Address manager test suite.

use std::{io, net::IpAddr, sync::Arc, time::Duration};

use assert_matches::assert_matches;
use vnet_ipam::{
    error::IpamError,
    manager::{
        ADDRESS_TYPE_GATEWAY, AddressManager, OPT_ADDRESS_ID, OPT_ADDRESS_TYPE,
        OPT_INTERFACE_NAME, Options,
    },
    netif::{HostInterface, InterfaceLister},
    source::{Environment, SourceConfig},
    space::{AddressScope, LOCAL_ADDRESS_SPACE},
    store::JsonFileStore,
};

const INTERFACE_DOCUMENT: &str = r#"
    <Interfaces>
        <Interface MacAddress="00:0D:3A:12:34:56" IsPrimary="true">
            <IPSubnet Prefix="10.0.0.0/24">
                <IPAddress Address="10.0.0.4" IsPrimary="true"/>
                <IPAddress Address="10.0.0.5" IsPrimary="false"/>
            </IPSubnet>
        </Interface>
        <Interface MacAddress="000D3A123457" IsPrimary="false">
            <IPSubnet Prefix="192.168.0.0/24">
                <IPAddress Address="192.168.0.2" IsPrimary="false"/>
                <IPAddress Address="192.168.0.3" IsPrimary="false"/>
            </IPSubnet>
        </Interface>
    </Interfaces>"#;

/// A fixed interface table matching [INTERFACE_DOCUMENT].
struct StaticInterfaces;

impl InterfaceLister for StaticInterfaces {
    fn list(&self) -> io::Result<Vec<HostInterface>> {
        Ok(vec![
            HostInterface {
                name: "eth0".to_string(),
                mac: "00:0d:3a:12:34:56".to_string(),
            },
            HostInterface {
                name: "eth1".to_string(),
                mac: "00:0d:3a:12:34:57".to_string(),
            },
        ])
    }
}

fn options(pairs: &[(&str, &str)]) -> Options {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn null_config() -> SourceConfig {
    SourceConfig {
        environment: Environment::Null,
        ..SourceConfig::default()
    }
}

fn null_manager() -> AddressManager {
    AddressManager::builder()
        .with_source_config(null_config())
        .build()
        .unwrap()
}

/// Publishes a local-space snapshot with one pool on `if_name` carrying the
/// given records.
fn publish(manager: &AddressManager, if_name: &str, subnet: &str, records: &[&str]) {
    let sink = manager.config_sink();
    let mut space = sink.new_address_space(LOCAL_ADDRESS_SPACE, AddressScope::Local);
    let pool = space
        .new_address_pool(if_name, "", 0, subnet.parse().unwrap())
        .unwrap();
    for record in records {
        pool.add_record(record.parse().unwrap()).unwrap();
    }
    sink.set_address_space(space).unwrap();
}

#[test_log::test(tokio::test)]
async fn basic_allocate_and_free() {
    let manager = null_manager();
    publish(
        &manager,
        "eth1",
        "192.168.0.0/24",
        &["192.168.0.2", "192.168.0.3", "192.168.0.4"],
    );

    let (pool_id, subnet) = manager
        .request_pool(
            "local",
            "",
            "",
            &options(&[(OPT_INTERFACE_NAME, "eth1")]),
            false,
        )
        .await
        .unwrap();
    assert_eq!(pool_id, "192.168.0.0/24");
    assert_eq!(subnet, "192.168.0.0/24");

    let c1 = options(&[(OPT_ADDRESS_ID, "c1")]);
    let assigned = manager
        .request_address("local", &pool_id, "", &c1)
        .await
        .unwrap();
    assert_eq!(assigned, "192.168.0.2/24");

    // Retrying with the same reservation id returns the same address.
    let again = manager
        .request_address("local", &pool_id, "", &c1)
        .await
        .unwrap();
    assert_eq!(again, assigned);

    manager
        .release_address("local", &pool_id, "192.168.0.2", &c1)
        .await
        .unwrap();

    let info = manager.get_pool_info("local", &pool_id).await.unwrap();
    assert_eq!(info.available, 3);
}

#[test_log::test(tokio::test)]
async fn gateway_round_trip() {
    let manager = null_manager();
    publish(&manager, "eth1", "192.168.0.0/24", &["192.168.0.2"]);

    let assigned = manager
        .request_address(
            "local",
            "192.168.0.0/24",
            "",
            &options(&[(OPT_ADDRESS_TYPE, ADDRESS_TYPE_GATEWAY)]),
        )
        .await
        .unwrap();
    assert_eq!(assigned, "192.168.0.1/24");

    manager
        .release_address("local", "192.168.0.0/24", "192.168.0.1", &Options::new())
        .await
        .unwrap();

    let info = manager
        .get_pool_info("local", "192.168.0.0/24")
        .await
        .unwrap();
    assert_eq!(info.available, 1, "gateway round trip must not consume records");
}

#[test_log::test(tokio::test)]
async fn conflicting_reservation_is_rejected() {
    let manager = null_manager();
    publish(
        &manager,
        "eth1",
        "192.168.0.0/24",
        &["192.168.0.2", "192.168.0.3"],
    );

    manager
        .request_address(
            "local",
            "192.168.0.0/24",
            "",
            &options(&[(OPT_ADDRESS_ID, "c1")]),
        )
        .await
        .unwrap();

    assert_matches!(
        manager
            .request_address(
                "local",
                "192.168.0.0/24",
                "192.168.0.2",
                &options(&[(OPT_ADDRESS_ID, "c2")]),
            )
            .await,
        Err(IpamError::AddressInUse)
    );
}

#[test_log::test(tokio::test)]
async fn pool_exhaustion() {
    let manager = null_manager();
    publish(
        &manager,
        "eth1",
        "192.168.0.0/24",
        &["192.168.0.2", "192.168.0.3"],
    );

    for id in ["c1", "c2"] {
        manager
            .request_address(
                "local",
                "192.168.0.0/24",
                "",
                &options(&[(OPT_ADDRESS_ID, id)]),
            )
            .await
            .unwrap();
    }

    assert_matches!(
        manager
            .request_address(
                "local",
                "192.168.0.0/24",
                "",
                &options(&[(OPT_ADDRESS_ID, "c3")]),
            )
            .await,
        Err(IpamError::NoAvailableAddresses)
    );
}

#[test_log::test(tokio::test)]
async fn refresh_degrades_held_addresses_to_unhealthy() {
    let manager = null_manager();
    publish(
        &manager,
        "eth1",
        "192.168.0.0/24",
        &["192.168.0.2", "192.168.0.3"],
    );

    let c1 = options(&[(OPT_ADDRESS_ID, "c1")]);
    let assigned = manager
        .request_address("local", "192.168.0.0/24", "", &c1)
        .await
        .unwrap();
    assert_eq!(assigned, "192.168.0.2/24");

    // The next snapshot no longer lists the held address.
    publish(&manager, "eth1", "192.168.0.0/24", &["192.168.0.3"]);

    let info = manager
        .get_pool_info("local", "192.168.0.0/24")
        .await
        .unwrap();
    assert_eq!(info.capacity, 2, "held address survives the merge");
    assert_eq!(
        info.unhealthy_addrs,
        vec!["192.168.0.2".parse::<IpAddr>().unwrap()]
    );

    // Releasing the holder finalizes the cleanup.
    manager
        .release_address("local", "192.168.0.0/24", "192.168.0.2", &c1)
        .await
        .unwrap();
    let info = manager
        .get_pool_info("local", "192.168.0.0/24")
        .await
        .unwrap();
    assert_eq!(info.capacity, 1);
    assert!(info.unhealthy_addrs.is_empty());
    assert_matches!(
        manager
            .request_address("local", "192.168.0.0/24", "192.168.0.2", &c1)
            .await,
        Err(IpamError::AddressNotFound)
    );
}

#[test_log::test(tokio::test)]
async fn referenced_pool_survives_snapshot_removal_until_release() {
    let manager = null_manager();
    publish(&manager, "eth1", "192.168.0.0/24", &["192.168.0.2"]);

    manager
        .request_pool("local", "192.168.0.0/24", "", &Options::new(), false)
        .await
        .unwrap();

    // The pool is dropped from the next snapshot while still referenced.
    publish(&manager, "eth2", "10.0.0.0/24", &["10.0.0.2"]);
    assert!(
        manager
            .get_pool_info("local", "192.168.0.0/24")
            .await
            .is_ok(),
        "externally referenced pool must survive"
    );

    manager
        .release_pool("local", "192.168.0.0/24")
        .await
        .unwrap();
    assert_matches!(
        manager.get_pool_info("local", "192.168.0.0/24").await,
        Err(IpamError::AddressPoolNotFound)
    );
}

#[test_log::test(tokio::test)]
async fn reservations_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ipam.json");

    let c1 = options(&[(OPT_ADDRESS_ID, "c1")]);
    let assigned = {
        let manager = AddressManager::builder()
            .with_store(Arc::new(JsonFileStore::new(&path)))
            .with_source_config(null_config())
            .build()
            .unwrap();
        publish(
            &manager,
            "eth1",
            "192.168.0.0/24",
            &["192.168.0.2", "192.168.0.3"],
        );
        manager
            .request_pool("local", "192.168.0.0/24", "", &Options::new(), false)
            .await
            .unwrap();
        manager
            .request_address("local", "192.168.0.0/24", "", &c1)
            .await
            .unwrap()
    };

    let manager = AddressManager::builder()
        .with_store(Arc::new(JsonFileStore::new(&path)))
        .with_source_config(null_config())
        .build()
        .unwrap();

    // The reservation is honored idempotently after the restart.
    let again = manager
        .request_address("local", "192.168.0.0/24", "", &c1)
        .await
        .unwrap();
    assert_eq!(again, assigned);

    // The pool reference survived too.
    manager
        .release_pool("local", "192.168.0.0/24")
        .await
        .unwrap();
    assert_matches!(
        manager.release_pool("local", "192.168.0.0/24").await,
        Err(IpamError::AddressPoolNotInUse)
    );
}

#[test_log::test(tokio::test)]
async fn fabric_source_end_to_end() {
    let app = axum::Router::new().route(
        "/machine/plugins",
        axum::routing::get(|| async { INTERFACE_DOCUMENT }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let manager = AddressManager::builder()
        .with_source_config(SourceConfig {
            environment: Environment::Azure,
            query_url: Some(
                format!("http://{addr}/machine/plugins?comp=nmagent&type=getinterfaceinfov1")
                    .parse()
                    .unwrap(),
            ),
            query_interval: Some(Duration::ZERO),
            document_path: None,
        })
        .with_interface_lister(Arc::new(StaticInterfaces))
        .build()
        .unwrap();
    manager.start_source().await;

    // The allocation refreshes the source, which publishes the fabric
    // snapshot. The secondary interface pool wins the selection.
    let (pool_id, subnet) = manager
        .request_pool("local", "", "", &Options::new(), false)
        .await
        .unwrap();
    assert_eq!(pool_id, "192.168.0.0/24");
    assert_eq!(subnet, "192.168.0.0/24");

    let assigned = manager
        .request_address("local", &pool_id, "", &options(&[(OPT_ADDRESS_ID, "c1")]))
        .await
        .unwrap();
    assert_eq!(assigned, "192.168.0.2/24");

    // The host's own (primary) address was never offered.
    let info = manager.get_pool_info("local", "10.0.0.0/24").await.unwrap();
    assert_eq!(info.capacity, 1);

    manager.stop_source().await;
}

#[test_log::test(tokio::test)]
async fn file_source_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interfaces.xml");
    std::fs::write(&path, INTERFACE_DOCUMENT).unwrap();

    let manager = AddressManager::builder()
        .with_source_config(SourceConfig {
            environment: Environment::File,
            document_path: Some(path),
            ..SourceConfig::default()
        })
        .with_interface_lister(Arc::new(StaticInterfaces))
        .build()
        .unwrap();
    manager.start_source().await;

    let (pool_id, _) = manager
        .request_pool(
            "local",
            "",
            "",
            &options(&[(OPT_INTERFACE_NAME, "eth0")]),
            false,
        )
        .await
        .unwrap();
    assert_eq!(pool_id, "10.0.0.0/24");
}
