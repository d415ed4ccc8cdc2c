use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rdma_base::types::CmEventKind;
use rdma_base::{CmState, Connection, ConnectionConfig, Error, LiveResources, SimFabric};

mod common;

#[test]
fn partial_record_tears_down() {
    common::init_logging();
    let fabric = SimFabric::new();
    let mut conn = Connection::prepare(fabric.clone(), ConnectionConfig::default()).unwrap();
    assert_eq!(conn.state(), CmState::Init);
    assert_eq!(
        fabric.live_resources().unwrap(),
        LiveResources {
            event_channels: 1,
            ids: 1,
            ..Default::default()
        }
    );

    conn.teardown();
    assert_eq!(conn.state(), CmState::Closed);
    assert!(fabric.live_resources().unwrap().is_empty());

    // Second teardown releases nothing twice.
    conn.teardown();
    assert_eq!(conn.state(), CmState::Closed);
    assert!(fabric.live_resources().unwrap().is_empty());
}

#[test]
fn failed_address_resolution_releases_everything() {
    let fabric = SimFabric::new();
    let unreachable = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), common::PORT);
    let err = Connection::connect(fabric.clone(), unreachable, ConnectionConfig::default())
        .unwrap_err();
    assert!(matches!(err, Error::AddressResolution(_)), "{:?}", err);
    assert!(fabric.live_resources().unwrap().is_empty());
}

#[test]
fn unanswered_resolution_times_out() {
    let fabric = SimFabric::new();
    let silent = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    fabric.blackhole(silent).unwrap();
    let config = ConnectionConfig {
        resolve_timeout_ms: 50,
        ..Default::default()
    };
    let err = Connection::connect(fabric.clone(), SocketAddr::new(silent, common::PORT), config)
        .unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)), "{:?}", err);
    assert!(fabric.live_resources().unwrap().is_empty());
}

#[test]
fn rejected_connect_keeps_partial_resources_until_drop() {
    let fabric = SimFabric::new();
    let mut conn =
        Connection::connect(fabric.clone(), common::server_addr(), ConnectionConfig::default())
            .unwrap();
    let err = conn.setup_qp(16, 16).unwrap_err();
    assert!(
        matches!(
            err,
            Error::Protocol {
                expected: CmEventKind::Established,
                got: CmEventKind::Rejected,
                ..
            }
        ),
        "{:?}",
        err
    );
    // Provisioning succeeded before the connect was rejected.
    let live = fabric.live_resources().unwrap();
    assert_eq!((live.pds, live.cqs, live.qps), (1, 1, 1));

    drop(conn);
    assert!(fabric.live_resources().unwrap().is_empty());
}

#[test]
fn overflowing_capacity_is_refused_before_provisioning() {
    let fabric = SimFabric::new();
    let mut conn =
        Connection::connect(fabric.clone(), common::server_addr(), ConnectionConfig::default())
            .unwrap();
    match conn.setup_qp(u32::MAX, 1) {
        Err(Error::Resource { op, source }) => {
            assert_eq!(op, "completion queue");
            assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
        }
        other => panic!("expected a resource error, got {:?}", other),
    }
    assert_eq!(conn.state(), CmState::RouteResolved);
    let live = fabric.live_resources().unwrap();
    assert_eq!((live.pds, live.comp_channels, live.cqs, live.qps), (0, 0, 0, 0));

    drop(conn);
    assert!(fabric.live_resources().unwrap().is_empty());
}

#[test]
fn connected_pair_double_teardown() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (listener, mut server, mut client) = common::registered_pair(&fabric, &config);
    assert_eq!(fabric.live_resources().unwrap().mrs, 2);

    client.teardown();
    client.teardown();
    assert_eq!(client.state(), CmState::Closed);
    assert!(client.memory_keys().is_none());
    assert!(client.buffer().is_none());

    server.teardown();
    drop(server);
    drop(client);
    drop(listener);
    assert!(fabric.live_resources().unwrap().is_empty(), "{:?}", fabric.live_resources().unwrap());
}

#[test]
fn teardown_from_every_setup_stage() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener = common::listen(&fabric, &config);

    // Connected, nothing registered.
    let (server, client) = common::connect_pair(&fabric, &mut listener, &config);
    drop(server);
    drop(client);

    // Route resolved, never provisioned.
    let client = Connection::connect(fabric.clone(), common::server_addr(), config.clone()).unwrap();
    drop(client);

    drop(listener);
    assert!(fabric.live_resources().unwrap().is_empty(), "{:?}", fabric.live_resources().unwrap());
}
