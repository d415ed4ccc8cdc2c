use std::net::SocketAddr;
use std::time::Duration;

use rdma_base::types::CmEventKind;
use rdma_base::{CmState, Connection, ConnectionConfig, Error, Role, SimFabric};

mod common;

#[test]
fn accepted_identity_is_distinct_and_listener_survives() {
    common::init_logging();
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener = common::listen(&fabric, &config);

    let (server, client) = common::connect_pair(&fabric, &mut listener, &config);
    assert_eq!(server.role(), Role::Server);
    assert_eq!(client.role(), Role::Client);
    assert_ne!(server.id(), listener.id());
    assert!(listener.id().is_some());
    assert_eq!(listener.local_addr(), Some(common::server_addr()));
    assert_eq!(server.local_addr(), Some(common::server_addr()));
    assert_eq!(server.peer_addr(), client.local_addr());
    assert_eq!(client.peer_addr(), Some(common::server_addr()));

    // The same listener serves the next request, with the first connection still alive.
    let (second_server, _second_client) = common::connect_pair(&fabric, &mut listener, &config);
    assert_eq!(second_server.state(), CmState::Connected);
    assert_ne!(second_server.id(), server.id());
    assert_eq!(server.state(), CmState::Connected);
}

#[test]
fn wildcard_listener_accepts() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener =
        rdma_base::Listener::bind(fabric.clone(), None, common::PORT, config.clone()).unwrap();
    assert!(listener
        .local_addr()
        .map_or(false, |addr| addr.ip().is_unspecified()));
    let (server, _client) = common::connect_pair(&fabric, &mut listener, &config);
    assert_eq!(server.local_addr(), Some(common::server_addr()));
}

#[test]
fn backlog_rejects_excess_requests() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig {
        resolve_timeout_ms: 100,
        ..Default::default()
    };
    let _listener = common::listen(&fabric, &config);

    let mut first =
        Connection::connect(fabric.clone(), common::server_addr(), config.clone()).unwrap();
    // Nobody accepts, so the request stays pending and the wait expires.
    assert!(matches!(first.setup_qp(16, 16), Err(Error::TimedOut(_))));

    let mut second =
        Connection::connect(fabric.clone(), common::server_addr(), config.clone()).unwrap();
    let err = second.setup_qp(16, 16).unwrap_err();
    assert!(
        matches!(
            err,
            Error::Protocol {
                got: CmEventKind::Rejected,
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[test]
fn listener_outlives_abandoned_request() {
    common::init_logging();
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener = common::listen(&fabric, &config);

    let impatient = ConnectionConfig {
        resolve_timeout_ms: 50,
        ..config.clone()
    };
    let mut early = Connection::connect(fabric.clone(), common::server_addr(), impatient).unwrap();
    assert!(matches!(early.setup_qp(16, 16), Err(Error::TimedOut(_))));
    drop(early);

    // The request outlived its client; accepting it fails, the listener does not.
    let mut stale = listener.accept().unwrap();
    let err = stale.setup_qp(16, 16).unwrap_err();
    assert!(matches!(err, Error::RdmaCm { op: "accept", .. }), "{:?}", err);
    drop(stale);

    let (server, client) = common::connect_pair(&fabric, &mut listener, &config);
    assert_eq!(server.state(), CmState::Connected);
    assert_eq!(client.state(), CmState::Connected);
}

#[test]
fn accept_times_out_without_requests() {
    let fabric = SimFabric::new();
    let mut listener = common::listen(&fabric, &ConnectionConfig::default());
    let err = listener
        .accept_timeout(Some(Duration::from_millis(20)))
        .unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)), "{:?}", err);
}

#[test]
fn duplicate_bind_fails() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let _listener = common::listen(&fabric, &config);
    let err = rdma_base::Listener::bind(fabric.clone(), None, common::PORT, config).unwrap_err();
    assert!(matches!(err, Error::RdmaCm { op: "bind addr", .. }), "{:?}", err);
    // The failed listener released its channel and identity.
    assert_eq!(fabric.live_resources().unwrap().ids, 1);
    assert_eq!(fabric.live_resources().unwrap().event_channels, 1);
}

#[test]
fn server_without_established_wait() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig {
        accept_waits_established: false,
        ..Default::default()
    };
    let mut listener = common::listen(&fabric, &config);
    let (server, client) = common::connect_pair(&fabric, &mut listener, &config);
    assert_eq!(server.state(), CmState::Connected);
    assert_eq!(client.state(), CmState::Connected);
}

#[test]
fn state_guards() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener = common::listen(&fabric, &config);

    let mut early = Connection::prepare(fabric.clone(), config.clone()).unwrap();
    assert!(matches!(
        early.setup_qp(16, 16),
        Err(Error::InvalidState {
            state: CmState::Init,
            ..
        })
    ));
    assert!(matches!(
        early.register_memory(64),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(early.post_receive(), Err(Error::InvalidState { .. })));
    assert!(matches!(early.post_send(4, true), Err(Error::InvalidState { .. })));
    assert!(matches!(early.poll_completion(), Err(Error::InvalidState { .. })));
    assert!(matches!(early.read_buffer(4), Err(Error::InvalidState { .. })));

    let (mut server, mut client) = common::connect_pair(&fabric, &mut listener, &config);
    assert!(matches!(
        client.setup_qp(16, 16),
        Err(Error::InvalidState {
            state: CmState::Connected,
            ..
        })
    ));
    let addr: SocketAddr = common::server_addr();
    assert!(matches!(server.resolve(addr), Err(Error::InvalidState { .. })));
    assert!(matches!(client.resolve(addr), Err(Error::InvalidState { .. })));

    client.teardown();
    assert!(matches!(
        client.post_send(4, true),
        Err(Error::InvalidState {
            state: CmState::Closed,
            ..
        })
    ));
}
