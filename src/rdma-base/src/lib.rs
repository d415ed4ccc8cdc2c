//! Point-to-point reliable-connected RDMA.
//!
//! A [`Connection`] owns every resource of one endpoint. The active side is created with
//! [`Connection::connect`], the passive side comes out of [`Listener::accept`]. Both then go
//! through [`Connection::setup_qp`], register one buffer, and exchange it with blocking
//! post/poll calls:
//!
//! ```no_run
//! use rdma_base::{Connection, ConnectionConfig, SimFabric};
//!
//! # fn main() -> rdma_base::Result<()> {
//! let fabric = SimFabric::new();
//! let config = ConnectionConfig::default();
//! let mut conn = Connection::connect(fabric, "127.0.0.1:20079".parse().unwrap(), config)?;
//! conn.setup_qp(16, 16)?;
//! conn.register_memory(1024)?;
//! conn.post_receive()?;
//! conn.write_buffer(b"ping")?;
//! conn.post_send(4, true)?;
//! conn.poll_completion()?;
//! conn.poll_completion()?;
//! # Ok(())
//! # }
//! ```
//!
//! Everything is generic over a [`Fabric`]. [`SimFabric`] runs in-process; `VerbsFabric`
//! (feature `verbs`) drives real hardware.

pub mod cm;
pub mod config;
pub mod conn;
pub mod datapath;
pub mod error;
pub mod fabric;
pub mod mr;
pub mod sim;
pub mod types;

#[cfg(feature = "hip")]
pub mod hip;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use cm::{CmState, Listener, Role};
pub use config::{Backoff, ConnectionConfig, PollPolicy};
pub use conn::Connection;
pub use error::{Error, Result};
pub use fabric::Fabric;
pub use mr::{Buffer, BufferAllocator, HostAllocator, Placement};
pub use sim::{LiveResources, SimDeviceAllocator, SimFabric};
pub use types::{AccessFlags, MemoryKeys, WcOpcode, WcStatus, WorkCompletion};

#[cfg(feature = "hip")]
pub use hip::HipAllocator;
#[cfg(feature = "verbs")]
pub use verbs::VerbsFabric;
