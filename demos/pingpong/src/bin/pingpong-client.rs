use std::net::{IpAddr, SocketAddr};

use clap::Parser;

use pingpong::Opts;

#[derive(Parser, Debug)]
#[command(about = "RDMA ping-pong client: sends one ping and waits for the pong.")]
pub struct Args {
    /// The server address.
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: IpAddr,

    #[command(flatten)]
    pub opts: Opts,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.opts.sim {
        pingpong::run_sim(&args.opts)
    } else {
        pingpong::run_hardware_client(SocketAddr::new(args.ip, args.opts.port), &args.opts)
    }
}
