use std::net::IpAddr;

use clap::Parser;

use pingpong::Opts;

#[derive(Parser, Debug)]
#[command(about = "RDMA ping-pong server: answers one ping with a pong.")]
pub struct Args {
    /// The address to listen on. Listens on every address when omitted.
    #[arg(long)]
    pub ip: Option<IpAddr>,

    #[command(flatten)]
    pub opts: Opts,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.opts.sim {
        pingpong::run_sim(&args.opts)
    } else {
        pingpong::run_hardware_server(args.ip, &args.opts)
    }
}
