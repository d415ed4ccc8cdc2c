//! The capability a backend offers to the connection core.
//!
//! Handles are plain owned values. Destruction takes them back by value, so a handle can be
//! released at most once; the core keeps each one in an `Option` slot and `take()`s it on
//! release. Calls that need an existing handle borrow it.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::types::{AccessFlags, CmEvent, ConnParam, MemoryKeys, QpCapability, SendRequest, Sge, WorkCompletion};

pub trait Fabric: Clone {
    type EventChannel;
    type CmId;
    type ProtectionDomain;
    type CompChannel;
    type CompletionQueue;
    type MemoryRegion;

    // Connection management.

    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;

    fn create_id(&self, channel: &Self::EventChannel) -> io::Result<Self::CmId>;

    /// Moves `id` so that its future events are delivered on `channel`.
    fn migrate_id(&self, id: &Self::CmId, channel: &Self::EventChannel) -> io::Result<()>;

    fn bind_addr(&self, id: &Self::CmId, addr: &SocketAddr) -> io::Result<()>;

    fn listen(&self, id: &Self::CmId, backlog: i32) -> io::Result<()>;

    fn resolve_addr(&self, id: &Self::CmId, dst: &SocketAddr, timeout: Duration)
        -> io::Result<()>;

    fn resolve_route(&self, id: &Self::CmId, timeout: Duration) -> io::Result<()>;

    /// Blocks for the next event on `channel`, at most `timeout` if one is given.
    ///
    /// The returned event has already been acknowledged. `Ok(None)` means the wait expired.
    fn get_cm_event(
        &self,
        channel: &Self::EventChannel,
        timeout: Option<Duration>,
    ) -> io::Result<Option<CmEvent<Self::CmId>>>;

    fn connect(&self, id: &Self::CmId, param: &ConnParam) -> io::Result<()>;

    fn accept(&self, id: &Self::CmId, param: &ConnParam) -> io::Result<()>;

    fn local_addr(&self, id: &Self::CmId) -> Option<SocketAddr>;

    fn peer_addr(&self, id: &Self::CmId) -> Option<SocketAddr>;

    // Queue provisioning. Valid once `id` is bound to a device.

    fn alloc_pd(&self, id: &Self::CmId) -> io::Result<Self::ProtectionDomain>;

    fn create_comp_channel(&self, id: &Self::CmId) -> io::Result<Self::CompChannel>;

    fn create_cq(
        &self,
        id: &Self::CmId,
        min_entries: u32,
        channel: &Self::CompChannel,
    ) -> io::Result<Self::CompletionQueue>;

    /// Arms the next completion notification on `cq`.
    fn req_notify_cq(&self, cq: &Self::CompletionQueue) -> io::Result<()>;

    /// Creates an RC queue pair owned by `id`, using `cq` for both directions.
    fn create_qp(
        &self,
        id: &Self::CmId,
        pd: &Self::ProtectionDomain,
        cq: &Self::CompletionQueue,
        cap: &QpCapability,
    ) -> io::Result<()>;

    fn destroy_qp(&self, id: &Self::CmId) -> io::Result<()>;

    // Registration.

    /// Registers `[addr, addr + len)` with `pd`.
    ///
    /// # Safety
    ///
    /// The range must stay valid until the region is deregistered.
    unsafe fn reg_mr(
        &self,
        pd: &Self::ProtectionDomain,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<Self::MemoryRegion>;

    fn mr_keys(&self, mr: &Self::MemoryRegion) -> MemoryKeys;

    fn dereg_mr(&self, mr: Self::MemoryRegion) -> io::Result<()>;

    // Data path.

    /// Posts a receive work request on the queue pair of `id`.
    ///
    /// # Safety
    ///
    /// The memory `sge` describes must stay valid and untouched until the request completes.
    unsafe fn post_recv(&self, id: &Self::CmId, wr_id: u64, sge: Sge) -> io::Result<()>;

    /// Posts a send work request on the queue pair of `id`.
    ///
    /// # Safety
    ///
    /// The memory `wr.sge` describes must stay valid until the request completes.
    unsafe fn post_send(&self, id: &Self::CmId, wr: &SendRequest) -> io::Result<()>;

    /// Pops at most one completion. Never blocks.
    fn poll_cq(&self, cq: &Self::CompletionQueue) -> io::Result<Option<WorkCompletion>>;

    // Destruction.

    fn destroy_cq(&self, cq: Self::CompletionQueue) -> io::Result<()>;

    fn destroy_comp_channel(&self, channel: Self::CompChannel) -> io::Result<()>;

    fn dealloc_pd(&self, pd: Self::ProtectionDomain) -> io::Result<()>;

    fn destroy_id(&self, id: Self::CmId) -> io::Result<()>;

    fn destroy_event_channel(&self, channel: Self::EventChannel) -> io::Result<()>;
}
