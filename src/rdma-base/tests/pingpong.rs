use std::sync::Barrier;

use rdma_base::{CmState, Connection, ConnectionConfig, SimFabric, WcOpcode};

mod common;

#[test]
fn ping_pong_round_trip() {
    common::init_logging();
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let mut listener = common::listen(&fabric, &config);
    let receives_posted = Barrier::new(2);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut conn = listener.accept().unwrap();
            conn.setup_qp(16, 16).unwrap();
            assert_eq!(conn.state(), CmState::Connected);
            conn.register_memory(common::BUF_SIZE).unwrap();
            conn.post_receive().unwrap();
            receives_posted.wait();

            let wc = conn.poll_completion().unwrap();
            assert_eq!(wc.opcode, WcOpcode::Recv);
            assert_eq!(wc.byte_len, 4);
            assert_eq!(conn.read_buffer(4).unwrap(), b"ping");

            conn.write_buffer(b"pong").unwrap();
            conn.post_send(4, true).unwrap();
            let wc = conn.poll_completion().unwrap();
            assert_eq!(wc.opcode, WcOpcode::Send);
        });

        let mut conn =
            Connection::connect(fabric.clone(), common::server_addr(), config.clone()).unwrap();
        assert_eq!(conn.state(), CmState::RouteResolved);
        conn.setup_qp(16, 16).unwrap();
        assert_eq!(conn.state(), CmState::Connected);
        conn.register_memory(common::BUF_SIZE).unwrap();
        conn.post_receive().unwrap();
        receives_posted.wait();

        conn.write_buffer(b"ping").unwrap();
        conn.post_send(4, true).unwrap();
        let mut opcodes = vec![
            conn.poll_completion().unwrap().opcode,
            conn.poll_completion().unwrap().opcode,
        ];
        opcodes.sort_by_key(|op| *op == WcOpcode::Recv);
        assert_eq!(opcodes, [WcOpcode::Send, WcOpcode::Recv]);
        assert_eq!(conn.read_buffer(4).unwrap(), b"pong");
    });

    drop(listener);
    assert!(fabric.live_resources().unwrap().is_empty(), "{:?}", fabric.live_resources().unwrap());
}

#[test]
fn immediate_round_trip() {
    common::init_logging();
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, mut server, mut client) = common::registered_pair(&fabric, &config);

    server.post_receive().unwrap();
    client.write_buffer(b"ping").unwrap();
    client.post_send_with_immediate(4, 0x2A, false).unwrap();
    assert_eq!(server.poll_completion_with_immediate().unwrap(), 0x2A);
    assert_eq!(server.read_buffer(4).unwrap(), b"ping");

    client.post_receive().unwrap();
    server.write_buffer(b"pong").unwrap();
    server.post_send(4, false).unwrap();
    assert_eq!(client.poll_completion_with_immediate().unwrap(), 0);
    assert_eq!(client.read_buffer(4).unwrap(), b"pong");
}

#[test]
fn immediate_travels_big_endian() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, mut server, mut client) = common::registered_pair(&fabric, &config);

    server.post_receive().unwrap();
    client.post_send_with_immediate(0, 0x0102_0304, false).unwrap();
    let wc = server.poll_completion().unwrap();
    assert_eq!(wc.imm_data, 0x0102_0304u32.to_be());
    assert_eq!(wc.immediate(), Some(0x0102_0304));
    assert_eq!(wc.byte_len, 0);
}

#[test]
fn signaled_send_completion_is_labeled() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, mut server, mut client) = common::registered_pair(&fabric, &config);

    server.post_receive().unwrap();
    client.post_send_with_immediate(4, 7, true).unwrap();
    let wc = client.poll_completion().unwrap();
    assert_eq!(wc.wr_id, 3);
    assert_eq!(wc.opcode, WcOpcode::Send);

    server.post_receive().unwrap();
    client.post_send(4, true).unwrap();
    assert_eq!(client.poll_completion().unwrap().wr_id, 2);

    assert_eq!(server.poll_completion().unwrap().wr_id, 1);
    assert_eq!(server.poll_completion().unwrap().wr_id, 1);
}

#[test]
fn repeated_exchange_reuses_buffer() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, mut server, mut client) = common::registered_pair(&fabric, &config);

    for i in 0..64u32 {
        let msg = format!("msg-{}", i);
        server.post_receive().unwrap();
        client.write_buffer(msg.as_bytes()).unwrap();
        client.post_send_with_immediate(msg.len(), i, false).unwrap();
        assert_eq!(server.poll_completion_with_immediate().unwrap(), i);
        assert_eq!(server.read_buffer(msg.len()).unwrap(), msg.as_bytes());
    }
}
