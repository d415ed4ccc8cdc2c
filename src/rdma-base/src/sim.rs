//! An in-process reliable-connected fabric.
//!
//! `SimFabric` implements the whole [`Fabric`] surface over shared state, so two endpoints
//! in one process (usually on two threads) can run the real handshake and data path without
//! an RDMA device. It keeps the rules that matter to callers:
//!
//! - CM events are delivered to the channel of the identity they concern, and a connection
//!   request carries a new identity.
//! - Provisioning needs an identity bound to a device (after resolution or a request).
//! - Destroying a handle that another live handle still depends on fails with `EBUSY`.
//! - A send that finds no posted receive faults both queue pairs, unless the receiver's
//!   connection parameters asked for RNR retries, in which case it waits for one.
//! - Memory regions carry lkey/rkey and access flags that are checked on every access.
use std::alloc::{self, Layout};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::fabric::Fabric;
use crate::mr::{BufferAllocator, Placement};
use crate::types::{
    AccessFlags, CmEvent, CmEventKind, ConnParam, MemoryKeys, QpCapability, SendFlags,
    SendRequest, Sge, WcFlags, WcOpcode, WcStatus, WorkCompletion,
};

const EPHEMERAL_PORT_BASE: u16 = 49152;
/// Status of a REJECTED event, as reported for a request no one listens for.
const REJECT_STATUS: i32 = 28;
const RKEY_BIT: u32 = 0x8000_0000;
const DEVICE_ALIGN: usize = 4096;

#[inline]
fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "simulated fabric state poisoned")
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimEventChannel(u32);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimCmId(u32);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimProtectionDomain(u32);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimCompChannel(u32);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimCompletionQueue(u32);

#[derive(Debug, PartialEq, Eq)]
pub struct SimMemoryRegion {
    handle: u32,
    keys: MemoryKeys,
}

/// Count of every live handle, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub event_channels: usize,
    pub ids: usize,
    pub pds: usize,
    pub comp_channels: usize,
    pub cqs: usize,
    pub qps: usize,
    pub mrs: usize,
}

impl LiveResources {
    pub fn is_empty(&self) -> bool {
        *self == LiveResources::default()
    }
}

struct RawEvent {
    kind: CmEventKind,
    status: i32,
    new_id: Option<u32>,
}

struct Parked {
    from: u32,
    wr: SendRequest,
    payload: Vec<u8>,
}

struct QpState {
    num: u32,
    pd: u32,
    cq: u32,
    cap: QpCapability,
    faulted: bool,
    /// RNR retries the peer granted to our sends.
    peer_rnr_retry: u8,
    recvs: VecDeque<(u64, Sge)>,
    /// Peer sends waiting for a receive on this queue pair.
    parked: VecDeque<Parked>,
}

struct IdState {
    channel: u32,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    bound: bool,
    device: bool,
    route: bool,
    backlog: Option<i32>,
    /// Listener holding this request until it is accepted.
    pending_on: Option<u32>,
    remote: Option<u32>,
    param: ConnParam,
    qp: Option<QpState>,
}

impl IdState {
    fn new(channel: u32) -> Self {
        IdState {
            channel,
            local: None,
            peer: None,
            bound: false,
            device: false,
            route: false,
            backlog: None,
            pending_on: None,
            remote: None,
            param: ConnParam::default(),
            qp: None,
        }
    }
}

struct CqState {
    channel: u32,
    depth: u32,
    entries: VecDeque<WorkCompletion>,
}

struct MrState {
    pd: u32,
    addr: u64,
    len: usize,
    access: AccessFlags,
    rkey: u32,
}

struct State {
    next_handle: u32,
    next_port: u16,
    channels: HashMap<u32, VecDeque<RawEvent>>,
    ids: HashMap<u32, IdState>,
    pds: HashSet<u32>,
    comp_channels: HashSet<u32>,
    cqs: HashMap<u32, CqState>,
    mrs: HashMap<u32, MrState>,
    blackholes: HashSet<IpAddr>,
}

fn completion(wr_id: u64, status: WcStatus, opcode: WcOpcode, qp_num: u32) -> WorkCompletion {
    WorkCompletion {
        wr_id,
        status,
        opcode,
        vendor_err: 0,
        byte_len: 0,
        imm_data: 0,
        wc_flags: WcFlags::empty(),
        qp_num,
    }
}

impl State {
    fn new() -> Self {
        State {
            next_handle: 0,
            next_port: EPHEMERAL_PORT_BASE,
            channels: HashMap::new(),
            ids: HashMap::new(),
            pds: HashSet::new(),
            comp_channels: HashSet::new(),
            cqs: HashMap::new(),
            mrs: HashMap::new(),
            blackholes: HashSet::new(),
        }
    }

    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
        port
    }

    fn id(&self, h: u32) -> io::Result<&IdState> {
        self.ids.get(&h).ok_or_else(|| errno(libc::EINVAL))
    }

    fn id_mut(&mut self, h: u32) -> io::Result<&mut IdState> {
        self.ids.get_mut(&h).ok_or_else(|| errno(libc::EINVAL))
    }

    fn qp(&self, h: u32) -> Option<&QpState> {
        self.ids.get(&h).and_then(|s| s.qp.as_ref())
    }

    fn qp_mut(&mut self, h: u32) -> Option<&mut QpState> {
        self.ids.get_mut(&h).and_then(|s| s.qp.as_mut())
    }

    fn push_event(&mut self, channel: u32, kind: CmEventKind, status: i32, new_id: Option<u32>) {
        match self.channels.get_mut(&channel) {
            Some(queue) => queue.push_back(RawEvent {
                kind,
                status,
                new_id,
            }),
            None => log::trace!("dropping {} for destroyed channel {}", kind, channel),
        }
    }

    fn push_wc(&mut self, cq: u32, wc: WorkCompletion) {
        if let Some(cq) = self.cqs.get_mut(&cq) {
            if cq.entries.len() >= cq.depth as usize {
                log::warn!("simulated completion queue overrun, depth {}", cq.depth);
            }
            cq.entries.push_back(wc);
        }
    }

    fn find_listener(&self, dst: SocketAddr) -> Option<u32> {
        self.ids.iter().find_map(|(&h, s)| {
            let local = s.local?;
            s.backlog?;
            let ip_matches = local.ip().is_unspecified() || local.ip() == dst.ip();
            (local.port() == dst.port() && ip_matches).then(|| h)
        })
    }

    fn pending_requests(&self, listener: u32) -> usize {
        self.ids
            .values()
            .filter(|s| s.pending_on == Some(listener))
            .count()
    }

    /// Checks that `sge` lies in a region of `pd` granting `need`.
    fn check_local(&self, pd: u32, sge: &Sge, need: AccessFlags) -> Result<(), WcStatus> {
        let mr = self
            .mrs
            .get(&sge.lkey)
            .ok_or(WcStatus::LocalProtectionError)?;
        let end = sge.addr.checked_add(sge.length as u64);
        let in_range = sge.addr >= mr.addr && end.map_or(false, |e| e <= mr.addr + mr.len as u64);
        if mr.pd != pd || !in_range || !mr.access.contains(need) {
            return Err(WcStatus::LocalProtectionError);
        }
        Ok(())
    }

    /// Error completions are always generated; success only for signaled sends.
    fn complete_send(&mut self, from: u32, wr: &SendRequest, status: WcStatus) {
        let (cq, num) = match self.qp(from) {
            Some(qp) => (qp.cq, qp.num),
            None => return,
        };
        if status.is_success() && !wr.flags.contains(SendFlags::SIGNALED) {
            return;
        }
        let mut wc = completion(wr.wr_id, status, WcOpcode::Send, num);
        if status.is_success() {
            wc.byte_len = wr.sge.length;
        }
        self.push_wc(cq, wc);
    }

    /// Moves the queue pair of `h` to the error state and flushes what it holds.
    fn fault(&mut self, h: u32) {
        let (cq, num, flushed, parked) = match self.qp_mut(h) {
            Some(qp) if !qp.faulted => {
                qp.faulted = true;
                (
                    qp.cq,
                    qp.num,
                    mem::take(&mut qp.recvs),
                    mem::take(&mut qp.parked),
                )
            }
            _ => return,
        };
        log::debug!("simulated queue pair {} moved to error", num);
        for (wr_id, _) in flushed {
            self.push_wc(cq, completion(wr_id, WcStatus::WrFlushError, WcOpcode::Recv, num));
        }
        for p in parked {
            self.complete_send(p.from, &p.wr, WcStatus::RetryExceeded);
            self.fault(p.from);
        }
    }

    fn deliver(&mut self, from: u32, wr: SendRequest, payload: Vec<u8>) {
        let rnr_retry = match self.qp(from) {
            Some(qp) => qp.peer_rnr_retry,
            None => return,
        };
        let to = self.ids.get(&from).and_then(|s| s.remote);
        let to = match to {
            Some(to) if self.qp(to).map_or(false, |qp| !qp.faulted) => to,
            _ => {
                self.complete_send(from, &wr, WcStatus::RetryExceeded);
                self.fault(from);
                return;
            }
        };

        let recv = self.qp_mut(to).and_then(|qp| qp.recvs.pop_front());
        let (recv_wr_id, sge) = match recv {
            Some(recv) => recv,
            None if rnr_retry > 0 => {
                if let Some(qp) = self.qp_mut(to) {
                    qp.parked.push_back(Parked { from, wr, payload });
                }
                return;
            }
            None => {
                log::debug!("receiver not ready, wr_id {}", wr.wr_id);
                self.complete_send(from, &wr, WcStatus::RnrRetryExceeded);
                self.fault(from);
                self.fault(to);
                return;
            }
        };

        let (recv_cq, recv_num, recv_pd) = match self.qp(to) {
            Some(qp) => (qp.cq, qp.num, qp.pd),
            None => return,
        };
        let checked = self
            .check_local(recv_pd, &sge, AccessFlags::LOCAL_WRITE)
            .and_then(|()| {
                if payload.len() > sge.length as usize {
                    Err(WcStatus::LocalLengthError)
                } else {
                    Ok(())
                }
            });
        if let Err(status) = checked {
            self.push_wc(recv_cq, completion(recv_wr_id, status, WcOpcode::Recv, recv_num));
            self.complete_send(from, &wr, WcStatus::RemoteInvalidRequest);
            self.fault(to);
            self.fault(from);
            return;
        }

        // The range was checked against a live registration of the receiver.
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), sge.addr as *mut u8, payload.len());
        }
        let mut wc = completion(recv_wr_id, WcStatus::Success, WcOpcode::Recv, recv_num);
        wc.byte_len = payload.len() as u32;
        if let Some(imm) = wr.imm {
            wc.imm_data = imm.to_be();
            wc.wc_flags = WcFlags::WITH_IMM;
        }
        self.push_wc(recv_cq, wc);
        self.complete_send(from, &wr, WcStatus::Success);
    }

    /// Removes `h`, telling its peer the connection is gone.
    fn remove_id(&mut self, h: u32) {
        let s = match self.ids.remove(&h) {
            Some(s) => s,
            None => return,
        };
        if let Some(remote) = s.remote {
            if let Some(r) = self.ids.get_mut(&remote) {
                r.remote = None;
                let channel = r.channel;
                if s.pending_on.is_some() {
                    self.push_event(channel, CmEventKind::Rejected, REJECT_STATUS, None);
                } else {
                    self.push_event(channel, CmEventKind::Disconnected, 0, None);
                }
            }
        }
    }

    fn live(&self) -> LiveResources {
        LiveResources {
            event_channels: self.channels.len(),
            ids: self.ids.len(),
            pds: self.pds.len(),
            comp_channels: self.comp_channels.len(),
            cqs: self.cqs.len(),
            qps: self.ids.values().filter(|s| s.qp.is_some()).count(),
            mrs: self.mrs.len(),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Handle to a simulated fabric. Clones share the same fabric.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<Shared>,
}

impl fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFabric")
            .field("live", &self.live_resources().ok())
            .finish()
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    pub fn new() -> Self {
        SimFabric {
            inner: Arc::new(Shared {
                state: Mutex::new(State::new()),
                cond: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, State>> {
        self.inner.state.lock().map_err(|_| poisoned())
    }

    fn notify(&self) {
        self.inner.cond.notify_all();
    }

    /// Handles currently alive on this fabric.
    pub fn live_resources(&self) -> io::Result<LiveResources> {
        Ok(self.lock()?.live())
    }

    /// Makes address resolution toward `ip` go unanswered.
    pub fn blackhole(&self, ip: IpAddr) -> io::Result<()> {
        self.lock()?.blackholes.insert(ip);
        Ok(())
    }

    /// Writes `data` at `offset` into the region `rkey` names, as a peer's one-sided write
    /// would. Fails with `PermissionDenied` unless the region grants remote write.
    pub fn remote_write(&self, rkey: u32, offset: usize, data: &[u8]) -> io::Result<()> {
        let state = self.lock()?;
        let mr = state
            .mrs
            .get(&(rkey & !RKEY_BIT))
            .filter(|mr| mr.rkey == rkey)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown rkey"))?;
        if !mr.access.contains(AccessFlags::REMOTE_WRITE) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "region does not grant remote write",
            ));
        }
        match offset.checked_add(data.len()) {
            Some(end) if end <= mr.len => {}
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "write out of bounds")),
        }
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), (mr.addr as *mut u8).add(offset), data.len());
        }
        Ok(())
    }
}

impl Fabric for SimFabric {
    type EventChannel = SimEventChannel;
    type CmId = SimCmId;
    type ProtectionDomain = SimProtectionDomain;
    type CompChannel = SimCompChannel;
    type CompletionQueue = SimCompletionQueue;
    type MemoryRegion = SimMemoryRegion;

    fn create_event_channel(&self) -> io::Result<SimEventChannel> {
        let mut state = self.lock()?;
        let h = state.alloc_handle();
        state.channels.insert(h, VecDeque::new());
        Ok(SimEventChannel(h))
    }

    fn create_id(&self, channel: &SimEventChannel) -> io::Result<SimCmId> {
        let mut state = self.lock()?;
        if !state.channels.contains_key(&channel.0) {
            return Err(errno(libc::EINVAL));
        }
        let h = state.alloc_handle();
        state.ids.insert(h, IdState::new(channel.0));
        Ok(SimCmId(h))
    }

    fn migrate_id(&self, id: &SimCmId, channel: &SimEventChannel) -> io::Result<()> {
        let mut state = self.lock()?;
        if !state.channels.contains_key(&channel.0) {
            return Err(errno(libc::EINVAL));
        }
        state.id_mut(id.0)?.channel = channel.0;
        Ok(())
    }

    fn bind_addr(&self, id: &SimCmId, addr: &SocketAddr) -> io::Result<()> {
        let mut state = self.lock()?;
        if state.id(id.0)?.bound {
            return Err(errno(libc::EINVAL));
        }
        let mut addr = *addr;
        if addr.port() == 0 {
            addr.set_port(state.ephemeral_port());
        }
        let in_use = state.ids.values().any(|s| {
            s.bound
                && s.local.map_or(false, |l| {
                    l.port() == addr.port()
                        && (l.ip() == addr.ip() || l.ip().is_unspecified() || addr.ip().is_unspecified())
                })
        });
        if in_use {
            return Err(errno(libc::EADDRINUSE));
        }
        let s = state.id_mut(id.0)?;
        s.local = Some(addr);
        s.bound = true;
        s.device = !addr.ip().is_unspecified();
        Ok(())
    }

    fn listen(&self, id: &SimCmId, backlog: i32) -> io::Result<()> {
        let mut state = self.lock()?;
        let s = state.id_mut(id.0)?;
        if !s.bound || s.remote.is_some() {
            return Err(errno(libc::EINVAL));
        }
        s.backlog = Some(backlog.max(1));
        Ok(())
    }

    fn resolve_addr(&self, id: &SimCmId, dst: &SocketAddr, _timeout: Duration) -> io::Result<()> {
        let mut state = self.lock()?;
        let blackholed = state.blackholes.contains(&dst.ip());
        let unreachable = dst.ip().is_unspecified() || dst.ip().is_multicast();
        let existing = state.id(id.0)?.local;
        let local = match existing {
            Some(local) => local,
            None => {
                let ip = match dst.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                SocketAddr::new(ip, state.ephemeral_port())
            }
        };
        let s = state.id_mut(id.0)?;
        s.peer = Some(*dst);
        let channel = s.channel;
        if blackholed {
            return Ok(());
        }
        if unreachable {
            state.push_event(channel, CmEventKind::AddrError, -libc::EHOSTUNREACH, None);
        } else {
            let s = state.id_mut(id.0)?;
            s.local = Some(local);
            s.device = true;
            state.push_event(channel, CmEventKind::AddrResolved, 0, None);
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn resolve_route(&self, id: &SimCmId, _timeout: Duration) -> io::Result<()> {
        let mut state = self.lock()?;
        let s = state.id_mut(id.0)?;
        if !s.device || s.peer.is_none() {
            return Err(errno(libc::EINVAL));
        }
        s.route = true;
        let channel = s.channel;
        state.push_event(channel, CmEventKind::RouteResolved, 0, None);
        drop(state);
        self.notify();
        Ok(())
    }

    fn get_cm_event(
        &self,
        channel: &SimEventChannel,
        timeout: Option<Duration>,
    ) -> io::Result<Option<CmEvent<SimCmId>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock()?;
        loop {
            let queue = state
                .channels
                .get_mut(&channel.0)
                .ok_or_else(|| errno(libc::EINVAL))?;
            if let Some(event) = queue.pop_front() {
                return Ok(Some(CmEvent {
                    kind: event.kind,
                    status: event.status,
                    new_id: event.new_id.map(SimCmId),
                }));
            }
            state = match deadline {
                None => self.inner.cond.wait(state).map_err(|_| poisoned())?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| poisoned())?
                        .0
                }
            };
        }
    }

    fn connect(&self, id: &SimCmId, param: &ConnParam) -> io::Result<()> {
        let mut state = self.lock()?;
        let s = state.id_mut(id.0)?;
        if !s.route {
            return Err(errno(libc::EINVAL));
        }
        if s.remote.is_some() {
            return Err(errno(libc::EISCONN));
        }
        s.param = param.clone();
        let (channel, peer, local) = (s.channel, s.peer, s.local);
        let peer = peer.ok_or_else(|| errno(libc::EINVAL))?;

        let listener = state.find_listener(peer).filter(|&l| {
            let backlog = state.ids.get(&l).and_then(|s| s.backlog).unwrap_or(0);
            state.pending_requests(l) < backlog as usize
        });
        match listener {
            None => {
                log::debug!("no listener admits a request to {}", peer);
                state.push_event(channel, CmEventKind::Rejected, REJECT_STATUS, None);
            }
            Some(l) => {
                let (l_channel, l_local) = {
                    let ls = state.id(l)?;
                    (ls.channel, ls.local)
                };
                let server_local = l_local.map(|a| {
                    if a.ip().is_unspecified() {
                        SocketAddr::new(peer.ip(), a.port())
                    } else {
                        a
                    }
                });
                let h = state.alloc_handle();
                let mut req = IdState::new(l_channel);
                req.local = server_local;
                req.peer = local;
                req.device = true;
                req.route = true;
                req.pending_on = Some(l);
                req.remote = Some(id.0);
                state.ids.insert(h, req);
                state.id_mut(id.0)?.remote = Some(h);
                state.push_event(l_channel, CmEventKind::ConnectRequest, 0, Some(h));
            }
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn accept(&self, id: &SimCmId, param: &ConnParam) -> io::Result<()> {
        let mut state = self.lock()?;
        let s = state.id(id.0)?;
        if s.qp.is_none() || s.pending_on.is_none() {
            return Err(errno(libc::EINVAL));
        }
        let client = s.remote.ok_or_else(|| errno(libc::ECONNRESET))?;
        let (client_channel, client_rnr) = {
            let c = state.id(client)?;
            (c.channel, c.param.rnr_retry_count)
        };

        let s = state.id_mut(id.0)?;
        s.param = param.clone();
        s.pending_on = None;
        let channel = s.channel;
        if let Some(qp) = s.qp.as_mut() {
            qp.peer_rnr_retry = client_rnr;
        }
        if let Some(qp) = state.qp_mut(client) {
            qp.peer_rnr_retry = param.rnr_retry_count;
        }
        state.push_event(channel, CmEventKind::Established, 0, None);
        state.push_event(client_channel, CmEventKind::Established, 0, None);
        drop(state);
        self.notify();
        Ok(())
    }

    fn local_addr(&self, id: &SimCmId) -> Option<SocketAddr> {
        self.lock().ok()?.ids.get(&id.0)?.local
    }

    fn peer_addr(&self, id: &SimCmId) -> Option<SocketAddr> {
        self.lock().ok()?.ids.get(&id.0)?.peer
    }

    fn alloc_pd(&self, id: &SimCmId) -> io::Result<SimProtectionDomain> {
        let mut state = self.lock()?;
        if !state.id(id.0)?.device {
            return Err(errno(libc::ENODEV));
        }
        let h = state.alloc_handle();
        state.pds.insert(h);
        Ok(SimProtectionDomain(h))
    }

    fn create_comp_channel(&self, id: &SimCmId) -> io::Result<SimCompChannel> {
        let mut state = self.lock()?;
        if !state.id(id.0)?.device {
            return Err(errno(libc::ENODEV));
        }
        let h = state.alloc_handle();
        state.comp_channels.insert(h);
        Ok(SimCompChannel(h))
    }

    fn create_cq(
        &self,
        id: &SimCmId,
        min_entries: u32,
        channel: &SimCompChannel,
    ) -> io::Result<SimCompletionQueue> {
        let mut state = self.lock()?;
        if !state.id(id.0)?.device {
            return Err(errno(libc::ENODEV));
        }
        if min_entries == 0 || !state.comp_channels.contains(&channel.0) {
            return Err(errno(libc::EINVAL));
        }
        let h = state.alloc_handle();
        state.cqs.insert(
            h,
            CqState {
                channel: channel.0,
                depth: min_entries,
                entries: VecDeque::new(),
            },
        );
        Ok(SimCompletionQueue(h))
    }

    fn req_notify_cq(&self, cq: &SimCompletionQueue) -> io::Result<()> {
        let state = self.lock()?;
        if state.cqs.contains_key(&cq.0) {
            Ok(())
        } else {
            Err(errno(libc::EINVAL))
        }
    }

    fn create_qp(
        &self,
        id: &SimCmId,
        pd: &SimProtectionDomain,
        cq: &SimCompletionQueue,
        cap: &QpCapability,
    ) -> io::Result<()> {
        let mut state = self.lock()?;
        if !state.pds.contains(&pd.0) || !state.cqs.contains_key(&cq.0) {
            return Err(errno(libc::EINVAL));
        }
        if cap.max_send_sge == 0 || cap.max_recv_sge == 0 {
            return Err(errno(libc::EINVAL));
        }
        let num = state.alloc_handle();
        let s = state.id_mut(id.0)?;
        if !s.device {
            return Err(errno(libc::ENODEV));
        }
        if s.qp.is_some() {
            return Err(errno(libc::EEXIST));
        }
        s.qp = Some(QpState {
            num,
            pd: pd.0,
            cq: cq.0,
            cap: *cap,
            faulted: false,
            peer_rnr_retry: 0,
            recvs: VecDeque::new(),
            parked: VecDeque::new(),
        });
        Ok(())
    }

    fn destroy_qp(&self, id: &SimCmId) -> io::Result<()> {
        let mut state = self.lock()?;
        let qp = state
            .id_mut(id.0)?
            .qp
            .take()
            .ok_or_else(|| errno(libc::EINVAL))?;
        for p in qp.parked {
            state.complete_send(p.from, &p.wr, WcStatus::RetryExceeded);
            state.fault(p.from);
        }
        Ok(())
    }

    unsafe fn reg_mr(
        &self,
        pd: &SimProtectionDomain,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<SimMemoryRegion> {
        let mut state = self.lock()?;
        if !state.pds.contains(&pd.0) || addr.is_null() || len == 0 {
            return Err(errno(libc::EINVAL));
        }
        // Remote write needs local write, as in verbs.
        if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(errno(libc::EINVAL));
        }
        let handle = state.alloc_handle();
        let rkey = handle | RKEY_BIT;
        state.mrs.insert(
            handle,
            MrState {
                pd: pd.0,
                addr: addr as u64,
                len,
                access,
                rkey,
            },
        );
        Ok(SimMemoryRegion {
            handle,
            keys: MemoryKeys {
                addr: addr as u64,
                length: len,
                lkey: handle,
                rkey,
            },
        })
    }

    fn mr_keys(&self, mr: &SimMemoryRegion) -> MemoryKeys {
        mr.keys
    }

    fn dereg_mr(&self, mr: SimMemoryRegion) -> io::Result<()> {
        let mut state = self.lock()?;
        state
            .mrs
            .remove(&mr.handle)
            .map(drop)
            .ok_or_else(|| errno(libc::EINVAL))
    }

    unsafe fn post_recv(&self, id: &SimCmId, wr_id: u64, sge: Sge) -> io::Result<()> {
        let mut state = self.lock()?;
        let qp = state.qp_mut(id.0).ok_or_else(|| errno(libc::EINVAL))?;
        if qp.faulted {
            let (cq, num) = (qp.cq, qp.num);
            state.push_wc(cq, completion(wr_id, WcStatus::WrFlushError, WcOpcode::Recv, num));
            return Ok(());
        }
        if qp.recvs.len() >= qp.cap.max_recv_wr as usize {
            return Err(errno(libc::ENOMEM));
        }
        qp.recvs.push_back((wr_id, sge));
        if let Some(p) = qp.parked.pop_front() {
            state.deliver(p.from, p.wr, p.payload);
        }
        Ok(())
    }

    unsafe fn post_send(&self, id: &SimCmId, wr: &SendRequest) -> io::Result<()> {
        let mut state = self.lock()?;
        let (faulted, pd) = match state.qp(id.0) {
            Some(qp) => (qp.faulted, qp.pd),
            None => return Err(errno(libc::EINVAL)),
        };
        if faulted {
            state.complete_send(id.0, wr, WcStatus::WrFlushError);
            return Ok(());
        }
        if let Err(status) = state.check_local(pd, &wr.sge, AccessFlags::empty()) {
            state.complete_send(id.0, wr, status);
            state.fault(id.0);
            return Ok(());
        }
        let payload = slice::from_raw_parts(wr.sge.addr as *const u8, wr.sge.length as usize).to_vec();
        state.deliver(id.0, *wr, payload);
        Ok(())
    }

    fn poll_cq(&self, cq: &SimCompletionQueue) -> io::Result<Option<WorkCompletion>> {
        let mut state = self.lock()?;
        let cq = state.cqs.get_mut(&cq.0).ok_or_else(|| errno(libc::EINVAL))?;
        Ok(cq.entries.pop_front())
    }

    fn destroy_cq(&self, cq: SimCompletionQueue) -> io::Result<()> {
        let mut state = self.lock()?;
        if state.ids.values().any(|s| s.qp.as_ref().map_or(false, |qp| qp.cq == cq.0)) {
            return Err(errno(libc::EBUSY));
        }
        state
            .cqs
            .remove(&cq.0)
            .map(drop)
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn destroy_comp_channel(&self, channel: SimCompChannel) -> io::Result<()> {
        let mut state = self.lock()?;
        if state.cqs.values().any(|cq| cq.channel == channel.0) {
            return Err(errno(libc::EBUSY));
        }
        if state.comp_channels.remove(&channel.0) {
            Ok(())
        } else {
            Err(errno(libc::EINVAL))
        }
    }

    fn dealloc_pd(&self, pd: SimProtectionDomain) -> io::Result<()> {
        let mut state = self.lock()?;
        let qp_uses = state.ids.values().any(|s| s.qp.as_ref().map_or(false, |qp| qp.pd == pd.0));
        let mr_uses = state.mrs.values().any(|mr| mr.pd == pd.0);
        if qp_uses || mr_uses {
            return Err(errno(libc::EBUSY));
        }
        if state.pds.remove(&pd.0) {
            Ok(())
        } else {
            Err(errno(libc::EINVAL))
        }
    }

    fn destroy_id(&self, id: SimCmId) -> io::Result<()> {
        let mut state = self.lock()?;
        if state.id(id.0)?.qp.is_some() {
            return Err(errno(libc::EBUSY));
        }
        state.remove_id(id.0);
        drop(state);
        self.notify();
        Ok(())
    }

    fn destroy_event_channel(&self, channel: SimEventChannel) -> io::Result<()> {
        let mut state = self.lock()?;
        let orphans: Vec<u32> = state
            .channels
            .get(&channel.0)
            .ok_or_else(|| errno(libc::EINVAL))?
            .iter()
            .filter_map(|e| e.new_id)
            .collect();
        let busy = state
            .ids
            .iter()
            .any(|(h, s)| s.channel == channel.0 && !orphans.contains(h));
        if busy {
            return Err(errno(libc::EBUSY));
        }
        // Requests that were never picked up go with their channel.
        for h in orphans {
            state.remove_id(h);
        }
        state.channels.remove(&channel.0);
        drop(state);
        self.notify();
        Ok(())
    }
}

/// Stand-in for device memory: host memory only reachable through the copy calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimDeviceAllocator;

impl BufferAllocator for SimDeviceAllocator {
    fn placement(&self) -> Placement {
        Placement::Device
    }

    fn allocate(&self, len: usize) -> io::Result<NonNull<u8>> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-sized buffer"));
        }
        let layout = Layout::from_size_align(len, DEVICE_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let layout = Layout::from_size_align(len, DEVICE_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        alloc::dealloc(ptr.as_ptr(), layout);
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: &mut [u8], src: *const u8) -> io::Result<()> {
        ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    unsafe fn copy_from_host(&self, dst: *mut u8, src: &[u8]) -> io::Result<()> {
        ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn resolve_emits_events_in_order() {
        let fabric = SimFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&ch).unwrap();
        fabric.resolve_addr(&id, &addr(7000), Duration::from_millis(10)).unwrap();
        fabric.resolve_route(&id, Duration::from_millis(10)).unwrap();

        let ev = fabric.get_cm_event(&ch, Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(ev.kind, CmEventKind::AddrResolved);
        let ev = fabric.get_cm_event(&ch, Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(ev.kind, CmEventKind::RouteResolved);
        assert!(fabric.get_cm_event(&ch, Some(Duration::from_millis(5))).unwrap().is_none());

        fabric.destroy_id(id).unwrap();
        fabric.destroy_event_channel(ch).unwrap();
        assert!(fabric.live_resources().unwrap().is_empty());
    }

    #[test]
    fn pd_requires_device() {
        let fabric = SimFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&ch).unwrap();
        let err = fabric.alloc_pd(&id).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
        fabric.destroy_id(id).unwrap();
        fabric.destroy_event_channel(ch).unwrap();
    }

    #[test]
    fn destroy_out_of_order_is_busy() {
        let fabric = SimFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&ch).unwrap();
        let err = fabric.destroy_event_channel(ch).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        fabric.destroy_id(id).unwrap();
        assert_eq!(fabric.live_resources().unwrap().ids, 0);
        assert_eq!(fabric.live_resources().unwrap().event_channels, 1);
    }

    #[test]
    fn bind_conflict() {
        let fabric = SimFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let a = fabric.create_id(&ch).unwrap();
        let b = fabric.create_id(&ch).unwrap();
        fabric
            .bind_addr(&a, &SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7001))
            .unwrap();
        let err = fabric.bind_addr(&b, &addr(7001)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
        fabric.destroy_id(a).unwrap();
        fabric.destroy_id(b).unwrap();
        fabric.destroy_event_channel(ch).unwrap();
    }

    #[test]
    fn poisoned_state_is_reported() {
        let fabric = SimFabric::new();
        let shared = fabric.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.lock().unwrap();
            panic!("poison the fabric");
        })
        .join();

        assert!(fabric.live_resources().is_err());
        assert!(fabric.blackhole(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
        assert!(fabric.create_event_channel().is_err());
    }

    #[test]
    fn remote_write_unknown_rkey() {
        let fabric = SimFabric::new();
        let err = fabric.remote_write(RKEY_BIT | 42, 0, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn device_allocator_copies() {
        let alloc = SimDeviceAllocator;
        let ptr = alloc.allocate(64).unwrap();
        unsafe {
            alloc.copy_from_host(ptr.as_ptr().add(8), b"pong").unwrap();
            let mut out = [0u8; 4];
            alloc.copy_to_host(&mut out, ptr.as_ptr().add(8)).unwrap();
            assert_eq!(&out, b"pong");
            alloc.free(ptr, 64).unwrap();
        }
    }
}
