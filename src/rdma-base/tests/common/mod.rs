#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rdma_base::{Connection, ConnectionConfig, Listener, SimFabric};

pub const PORT: u16 = 20079;
pub const BUF_SIZE: usize = 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

pub fn server_addr() -> SocketAddr {
    SocketAddr::new(localhost(), PORT)
}

pub fn listen(fabric: &SimFabric, config: &ConnectionConfig) -> Listener<SimFabric> {
    Listener::bind(fabric.clone(), Some(localhost()), PORT, config.clone()).unwrap()
}

/// Runs the full handshake for one client against `listener`.
pub fn connect_pair(
    fabric: &SimFabric,
    listener: &mut Listener<SimFabric>,
    config: &ConnectionConfig,
) -> (Connection<SimFabric>, Connection<SimFabric>) {
    std::thread::scope(|s| {
        let server = s.spawn(|| {
            let mut conn = listener.accept().unwrap();
            conn.setup_qp(config.send_wr, config.recv_wr).unwrap();
            conn
        });
        let mut client = Connection::connect(fabric.clone(), server_addr(), config.clone()).unwrap();
        client.setup_qp(config.send_wr, config.recv_wr).unwrap();
        (server.join().unwrap(), client)
    })
}

/// A connected pair with a registered host buffer on each side.
pub fn registered_pair(
    fabric: &SimFabric,
    config: &ConnectionConfig,
) -> (
    Listener<SimFabric>,
    Connection<SimFabric>,
    Connection<SimFabric>,
) {
    let mut listener = listen(fabric, config);
    let (mut server, mut client) = connect_pair(fabric, &mut listener, config);
    server.register_memory(config.buffer_size).unwrap();
    client.register_memory(config.buffer_size).unwrap();
    (listener, server, client)
}
