//! Shared driver of the ping-pong binaries.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Args;

use rdma_base::{
    BufferAllocator, Connection, ConnectionConfig, Fabric, HostAllocator, Listener,
    SimDeviceAllocator, SimFabric, WcOpcode, WorkCompletion,
};

pub const DEFAULT_PORT: u16 = 20079;

const PING: &[u8] = b"ping";
const PONG: &[u8] = b"pong";

/// Options both binaries take.
#[derive(Args, Debug, Clone)]
pub struct Opts {
    /// The port number to use.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Size of the registered buffer. Overrides the config file.
    #[arg(short, long)]
    pub size: Option<usize>,

    /// Connection settings in TOML.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Register device memory instead of host memory.
    #[arg(long)]
    pub device: bool,

    /// Send with this immediate value.
    #[arg(long)]
    pub imm: Option<u32>,

    /// Run both peers in this process over the simulated fabric.
    #[arg(long)]
    pub sim: bool,
}

impl Opts {
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let mut config = match &self.config {
            Some(path) => ConnectionConfig::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            // 7 retries forever, so the ping may leave before the server posts its receive.
            None => ConnectionConfig {
                rnr_retry_count: 7,
                ..Default::default()
            },
        };
        if let Some(size) = self.size {
            config.buffer_size = size;
        }
        Ok(config)
    }

    fn allocator(&self) -> Result<Arc<dyn BufferAllocator>> {
        if !self.device {
            return Ok(Arc::new(HostAllocator));
        }
        if self.sim {
            return Ok(Arc::new(SimDeviceAllocator));
        }
        #[cfg(feature = "hip")]
        return Ok(Arc::new(rdma_base::HipAllocator::new()));
        #[cfg(not(feature = "hip"))]
        Err(anyhow!("device memory needs the `hip` feature"))
    }
}

fn report<F: Fabric>(who: &str, conn: &Connection<F>, wc: &WorkCompletion) -> Result<()> {
    let data = conn.read_buffer(wc.byte_len as usize)?;
    let text = String::from_utf8_lossy(&data);
    let peer = conn
        .peer_addr()
        .map_or_else(|| "unknown peer".to_owned(), |addr| addr.to_string());
    match wc.immediate() {
        Some(imm) => println!("{} received {:?} with immediate {} from {}", who, text, imm, peer),
        None => println!("{} received {:?} from {}", who, text, peer),
    }
    Ok(())
}

fn send<F: Fabric>(conn: &mut Connection<F>, msg: &[u8], imm: Option<u32>) -> Result<()> {
    conn.write_buffer(msg)?;
    match imm {
        Some(imm) => conn.post_send_with_immediate(msg.len(), imm, true)?,
        None => conn.post_send(msg.len(), true)?,
    }
    Ok(())
}

/// Accepts one client, waits for its ping and answers with a pong.
pub fn serve<F: Fabric>(listener: &mut Listener<F>, opts: &Opts) -> Result<()> {
    let config = listener.config().clone();
    log::info!("waiting for a client on {:?}", listener.local_addr());
    let mut conn = listener.accept()?;
    conn.setup_qp(config.send_wr, config.recv_wr)?;
    conn.register_with(opts.allocator()?, config.buffer_size)?;
    conn.post_receive()?;

    let wc = conn.poll_completion()?;
    report("server", &conn, &wc)?;
    send(&mut conn, PONG, opts.imm)?;
    conn.poll_completion()?;
    Ok(())
}

pub fn run_server<F: Fabric>(fabric: F, ip: Option<IpAddr>, opts: &Opts) -> Result<()> {
    let config = opts.connection_config()?;
    let mut listener = Listener::bind(fabric, ip, opts.port, config)?;
    serve(&mut listener, opts)
}

/// Sends a ping to `addr` and waits for the pong.
pub fn run_client<F: Fabric>(fabric: F, addr: SocketAddr, opts: &Opts) -> Result<()> {
    let config = opts.connection_config()?;
    let mut conn = Connection::connect(fabric, addr, config.clone())?;
    conn.setup_qp(config.send_wr, config.recv_wr)?;
    conn.register_with(opts.allocator()?, config.buffer_size)?;
    conn.post_receive()?;
    send(&mut conn, PING, opts.imm)?;

    // The send and the reply may complete in either order.
    for _ in 0..2 {
        let wc = conn.poll_completion()?;
        if wc.opcode == WcOpcode::Recv {
            report("client", &conn, &wc)?;
        }
    }
    Ok(())
}

/// Runs a server thread and a client against it over one [`SimFabric`].
pub fn run_sim(opts: &Opts) -> Result<()> {
    let fabric = SimFabric::new();
    let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut listener = Listener::bind(fabric.clone(), Some(ip), opts.port, opts.connection_config()?)?;
    let server_opts = opts.clone();
    let server = thread::spawn(move || serve(&mut listener, &server_opts));

    run_client(fabric.clone(), SocketAddr::new(ip, opts.port), opts)?;
    server
        .join()
        .map_err(|_| anyhow!("server thread panicked"))??;
    log::debug!("fabric after the exchange: {:?}", fabric);
    Ok(())
}

pub fn run_hardware_server(ip: Option<IpAddr>, opts: &Opts) -> Result<()> {
    #[cfg(feature = "verbs")]
    return run_server(rdma_base::VerbsFabric::new(), ip, opts);
    #[cfg(not(feature = "verbs"))]
    {
        let _ = (ip, opts);
        Err(anyhow!("built without the `verbs` feature; rerun with --sim"))
    }
}

pub fn run_hardware_client(addr: SocketAddr, opts: &Opts) -> Result<()> {
    #[cfg(feature = "verbs")]
    return run_client(rdma_base::VerbsFabric::new(), addr, opts);
    #[cfg(not(feature = "verbs"))]
    {
        let _ = (addr, opts);
        Err(anyhow!("built without the `verbs` feature; rerun with --sim"))
    }
}
