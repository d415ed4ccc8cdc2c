use std::io;
use std::sync::Arc;

use rdma_base::{
    AccessFlags, ConnectionConfig, Error, Placement, SimDeviceAllocator, SimFabric,
};

mod common;

#[test]
fn host_buffer_is_local_only() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, server, _client) = common::registered_pair(&fabric, &config);

    let keys = server.memory_keys().unwrap();
    assert_eq!(keys.length, config.buffer_size);
    assert_ne!(keys.lkey, keys.rkey);
    assert_eq!(server.buffer().unwrap().placement(), Placement::Host);
    assert!(!Placement::Host.access().contains(AccessFlags::REMOTE_WRITE));

    let err = fabric.remote_write(keys.rkey, 0, b"x").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
}

#[test]
fn device_buffer_accepts_remote_writes() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener = common::listen(&fabric, &config);
    let (mut server, mut client) = common::connect_pair(&fabric, &mut listener, &config);

    let keys = server
        .register_with(Arc::new(SimDeviceAllocator), common::BUF_SIZE)
        .unwrap();
    assert_eq!(server.buffer().unwrap().placement(), Placement::Device);
    assert!(server.buffer().unwrap().as_host_slice().is_none());

    fabric.remote_write(keys.rkey, 8, b"remote").unwrap();
    assert_eq!(&server.read_buffer(14).unwrap()[8..], b"remote");
    let err = fabric
        .remote_write(keys.rkey, common::BUF_SIZE - 2, b"overflow")
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    // Device memory works as a two-sided target too.
    client.register_memory(common::BUF_SIZE).unwrap();
    server.post_receive().unwrap();
    client.write_buffer(b"to device").unwrap();
    client.post_send(9, false).unwrap();
    assert_eq!(server.poll_completion().unwrap().byte_len, 9);
    assert_eq!(server.read_buffer(9).unwrap(), b"to device");
}

#[test]
fn second_registration_is_refused() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, mut server, _client) = common::registered_pair(&fabric, &config);

    let before = server.memory_keys();
    assert!(matches!(
        server.register_memory(64),
        Err(Error::AlreadyRegistered)
    ));
    assert_eq!(server.memory_keys(), before);
    assert_eq!(fabric.live_resources().unwrap().mrs, 2);
}

#[test]
fn registration_may_precede_receive() {
    let fabric = SimFabric::new();
    // Retries granted by the server let the client send before the receive is posted.
    let config = ConnectionConfig {
        rnr_retry_count: 7,
        ..Default::default()
    };
    let mut listener = common::listen(&fabric, &config);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut conn = listener.accept().unwrap();
            conn.setup_qp(config.send_wr, config.recv_wr).unwrap();
            conn.register_memory(common::BUF_SIZE).unwrap();
            conn.post_receive().unwrap();
            assert_eq!(conn.poll_completion().unwrap().byte_len, 5);
            assert_eq!(conn.read_buffer(5).unwrap(), b"early");
        });

        let mut conn =
            rdma_base::Connection::connect(fabric.clone(), common::server_addr(), config.clone())
                .unwrap();
        conn.setup_qp(config.send_wr, config.recv_wr).unwrap();
        conn.register_memory(common::BUF_SIZE).unwrap();
        conn.write_buffer(b"early").unwrap();
        conn.post_send(5, true).unwrap();
        assert_eq!(conn.poll_completion().unwrap().wr_id, 2);
    });
}

#[test]
fn oversized_send_is_rejected_locally() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, _server, mut client) = common::registered_pair(&fabric, &config);

    match client.post_send(config.buffer_size + 1, true) {
        Err(Error::Post { source, .. }) => assert_eq!(source.kind(), io::ErrorKind::InvalidInput),
        other => panic!("expected a post error, got {:?}", other),
    }
    assert!(client.write_buffer(&vec![0u8; config.buffer_size + 1]).is_err());
}
