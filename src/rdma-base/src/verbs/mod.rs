//! The hardware backend over librdmacm and libibverbs.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::fabric::Fabric;
use crate::types::{
    AccessFlags, CmEvent, ConnParam, MemoryKeys, QpCapability, SendRequest, Sge, WorkCompletion,
};

#[allow(non_upper_case_globals)]
#[allow(non_camel_case_types)]
#[allow(non_snake_case)]
#[allow(deref_nullptr)]
#[allow(dead_code)]
pub mod ffi {
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
}

pub mod ibv;
pub mod rdmacm;

use ibv::{CompChannel, CompletionQueue, MemoryRegion, ProtectionDomain};
use rdmacm::{CmId, EventChannel};

/// Drives a real RDMA device. Handles own their verbs objects and also release them on
/// drop, so a handle the core never gets back is not leaked.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbsFabric;

impl VerbsFabric {
    pub fn new() -> Self {
        VerbsFabric
    }
}

impl Fabric for VerbsFabric {
    type EventChannel = EventChannel;
    type CmId = CmId;
    type ProtectionDomain = ProtectionDomain;
    type CompChannel = CompChannel;
    type CompletionQueue = CompletionQueue;
    type MemoryRegion = MemoryRegion;

    fn create_event_channel(&self) -> io::Result<EventChannel> {
        EventChannel::create_event_channel()
    }

    fn create_id(&self, channel: &EventChannel) -> io::Result<CmId> {
        CmId::create_id(channel)
    }

    fn migrate_id(&self, id: &CmId, channel: &EventChannel) -> io::Result<()> {
        id.migrate_id(channel)
    }

    fn bind_addr(&self, id: &CmId, addr: &SocketAddr) -> io::Result<()> {
        id.bind_addr(addr)
    }

    fn listen(&self, id: &CmId, backlog: i32) -> io::Result<()> {
        id.listen(backlog)
    }

    fn resolve_addr(&self, id: &CmId, dst: &SocketAddr, timeout: Duration) -> io::Result<()> {
        id.resolve_addr(dst, timeout)
    }

    fn resolve_route(&self, id: &CmId, timeout: Duration) -> io::Result<()> {
        id.resolve_route(timeout)
    }

    fn get_cm_event(
        &self,
        channel: &EventChannel,
        timeout: Option<Duration>,
    ) -> io::Result<Option<CmEvent<CmId>>> {
        // The raw event is acked when `event` goes out of scope.
        Ok(channel.get_cm_event(timeout)?.map(|event| CmEvent {
            kind: event.kind(),
            status: event.status(),
            new_id: event.take_request(),
        }))
    }

    fn connect(&self, id: &CmId, param: &ConnParam) -> io::Result<()> {
        id.connect(param)
    }

    fn accept(&self, id: &CmId, param: &ConnParam) -> io::Result<()> {
        id.accept(param)
    }

    fn local_addr(&self, id: &CmId) -> Option<SocketAddr> {
        id.local_addr()
    }

    fn peer_addr(&self, id: &CmId) -> Option<SocketAddr> {
        id.peer_addr()
    }

    fn alloc_pd(&self, id: &CmId) -> io::Result<ProtectionDomain> {
        ProtectionDomain::alloc(id)
    }

    fn create_comp_channel(&self, id: &CmId) -> io::Result<CompChannel> {
        CompChannel::create(id)
    }

    fn create_cq(
        &self,
        id: &CmId,
        min_entries: u32,
        channel: &CompChannel,
    ) -> io::Result<CompletionQueue> {
        CompletionQueue::create(id, min_entries, channel)
    }

    fn req_notify_cq(&self, cq: &CompletionQueue) -> io::Result<()> {
        cq.req_notify(false)
    }

    fn create_qp(
        &self,
        id: &CmId,
        pd: &ProtectionDomain,
        cq: &CompletionQueue,
        cap: &QpCapability,
    ) -> io::Result<()> {
        id.create_qp(pd.pd, cq.cq, cap)
    }

    fn destroy_qp(&self, id: &CmId) -> io::Result<()> {
        id.destroy_qp()
    }

    unsafe fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        MemoryRegion::register(pd, addr, len, access)
    }

    fn mr_keys(&self, mr: &MemoryRegion) -> MemoryKeys {
        mr.keys()
    }

    fn dereg_mr(&self, mr: MemoryRegion) -> io::Result<()> {
        mr.deregister()
    }

    unsafe fn post_recv(&self, id: &CmId, wr_id: u64, sge: Sge) -> io::Result<()> {
        ibv::post_recv(id, wr_id, &sge)
    }

    unsafe fn post_send(&self, id: &CmId, wr: &SendRequest) -> io::Result<()> {
        ibv::post_send(id, wr)
    }

    fn poll_cq(&self, cq: &CompletionQueue) -> io::Result<Option<WorkCompletion>> {
        cq.poll()
    }

    fn destroy_cq(&self, cq: CompletionQueue) -> io::Result<()> {
        cq.destroy()
    }

    fn destroy_comp_channel(&self, channel: CompChannel) -> io::Result<()> {
        channel.destroy()
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> io::Result<()> {
        pd.dealloc()
    }

    fn destroy_id(&self, id: CmId) -> io::Result<()> {
        id.destroy()
    }

    fn destroy_event_channel(&self, channel: EventChannel) -> io::Result<()> {
        channel.destroy();
        Ok(())
    }
}
