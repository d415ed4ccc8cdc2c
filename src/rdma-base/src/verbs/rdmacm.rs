use std::ffi::CStr;
use std::fmt;
use std::io;
use std::mem::{self, ManuallyDrop};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use socket2::SockAddr;

use super::ffi;
use crate::types::{CmEventKind, ConnParam, QpCapability};

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

#[inline]
fn check(rc: i32) -> io::Result<()> {
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub struct CmEvent(*mut ffi::rdma_cm_event);

unsafe impl Send for CmEvent {}
unsafe impl Sync for CmEvent {}

/// All events which are allocated by rdma_get_cm_event must be released, there
/// should be a one-to-one correspondence between successful gets and acks.
impl Drop for CmEvent {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_ack_cm_event(self.0) };
        if rc != 0 {
            log::debug!(
                "An error occurred on ack_cm_event: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { CStr::from_ptr(ffi::rdma_event_str((*self.0).event)) };
        write!(f, "{}", msg.to_string_lossy())
    }
}

impl CmEvent {
    #[inline]
    pub fn status(&self) -> i32 {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.status
    }

    #[inline]
    pub fn event(&self) -> ffi::rdma_cm_event_type::Type {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.event
    }

    pub fn kind(&self) -> CmEventKind {
        use ffi::rdma_cm_event_type::*;
        match self.event() {
            RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
            RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
            RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
            RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
            RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
            RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
            RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
            RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
            RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
            RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
            RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
            RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
            RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
            other => CmEventKind::Other(other as u32),
        }
    }

    /// Takes ownership of the identity a connect request carries.
    #[inline]
    pub fn take_request(&self) -> Option<CmId> {
        assert!(!self.0.is_null());
        let event = unsafe { &*self.0 };
        if event.event == ffi::rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST
            && !event.id.is_null()
        {
            Some(CmId(event.id))
        } else {
            None
        }
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub struct EventChannel(*mut ffi::rdma_event_channel);

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl AsRawFd for EventChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.fd
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_event_channel(self.0) };
    }
}

impl EventChannel {
    pub fn create_event_channel() -> io::Result<Self> {
        let channel = unsafe { ffi::rdma_create_event_channel() };
        if channel.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(EventChannel(channel))
        }
    }

    /// Waits for the next event, at most `timeout` if one is given.
    pub fn get_cm_event(&self, timeout: Option<Duration>) -> io::Result<Option<CmEvent>> {
        if let Some(timeout) = timeout {
            let mut fds = [PollFd::new(self.as_raw_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut fds, timeout_ms(timeout))?;
            if ready == 0 {
                return Ok(None);
            }
        }
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(self.0, &mut event) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Some(CmEvent(event)))
        }
    }

    pub fn destroy(self) {
        let this = ManuallyDrop::new(self);
        unsafe { ffi::rdma_destroy_event_channel(this.0) };
    }
}

#[derive(Debug)]
pub struct CmId(*mut ffi::rdma_cm_id);

unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}

impl Drop for CmId {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_destroy_id(self.0) };
        if rc != 0 {
            log::debug!(
                "error occured when destroying cm_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl PartialEq for CmId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl CmId {
    pub fn create_id(channel: &EventChannel) -> io::Result<CmId> {
        let mut cm_id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            ffi::rdma_create_id(
                channel.0,
                &mut cm_id,
                ptr::null_mut(),
                ffi::rdma_port_space::RDMA_PS_TCP,
            )
        };
        check(rc)?;
        assert!(!cm_id.is_null());
        Ok(CmId(cm_id))
    }

    /// Destroys the identity, reporting failure instead of logging it.
    pub fn destroy(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        check(unsafe { ffi::rdma_destroy_id(this.0) })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut ffi::rdma_cm_id {
        self.0
    }

    /// The device context, set once the identity is bound to a device.
    #[inline]
    pub(crate) fn verbs(&self) -> io::Result<*mut ffi::ibv_context> {
        let ctx = unsafe { &*self.0 }.verbs;
        if ctx.is_null() {
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        } else {
            Ok(ctx)
        }
    }

    #[inline]
    pub(crate) fn qp(&self) -> io::Result<*mut ffi::ibv_qp> {
        let qp = unsafe { &*self.0 }.qp;
        if qp.is_null() {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        } else {
            Ok(qp)
        }
    }

    pub fn migrate_id(&self, channel: &EventChannel) -> io::Result<()> {
        check(unsafe { ffi::rdma_migrate_id(self.0, channel.0) })
    }

    pub fn bind_addr(&self, sockaddr: &SocketAddr) -> io::Result<()> {
        let addr = SockAddr::from(*sockaddr);
        check(unsafe { ffi::rdma_bind_addr(self.0, addr.as_ptr() as *mut ffi::sockaddr) })
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        check(unsafe { ffi::rdma_listen(self.0, backlog) })
    }

    pub fn resolve_addr(&self, sockaddr: &SocketAddr, timeout: Duration) -> io::Result<()> {
        let dst_addr = SockAddr::from(*sockaddr);
        check(unsafe {
            ffi::rdma_resolve_addr(
                self.0,
                ptr::null_mut(),
                dst_addr.as_ptr() as *mut ffi::sockaddr,
                timeout_ms(timeout),
            )
        })
    }

    pub fn resolve_route(&self, timeout: Duration) -> io::Result<()> {
        check(unsafe { ffi::rdma_resolve_route(self.0, timeout_ms(timeout)) })
    }

    pub fn create_qp(
        &self,
        pd: *mut ffi::ibv_pd,
        cq: *mut ffi::ibv_cq,
        cap: &QpCapability,
    ) -> io::Result<()> {
        let mut attr: ffi::ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = cq;
        attr.recv_cq = cq;
        attr.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = cap.max_send_wr;
        attr.cap.max_recv_wr = cap.max_recv_wr;
        attr.cap.max_send_sge = cap.max_send_sge;
        attr.cap.max_recv_sge = cap.max_recv_sge;
        check(unsafe { ffi::rdma_create_qp(self.0, pd, &mut attr) })
    }

    pub fn destroy_qp(&self) -> io::Result<()> {
        self.qp()?;
        unsafe { ffi::rdma_destroy_qp(self.0) };
        Ok(())
    }

    pub fn connect(&self, param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param(param);
        check(unsafe { ffi::rdma_connect(self.0, &mut param) })
    }

    pub fn accept(&self, param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param(param);
        check(unsafe { ffi::rdma_accept(self.0, &mut param) })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        unsafe { sockaddr_from_raw(ffi::rdma_base_get_local_addr(self.0)) }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        unsafe { sockaddr_from_raw(ffi::rdma_base_get_peer_addr(self.0)) }
    }
}

/// Copies out an address the connection manager filled in; `None` for an unset or
/// non-IP address.
///
/// # Safety
///
/// `addr` must be null or point to a `sockaddr_in` or `sockaddr_in6` matching its family.
unsafe fn sockaddr_from_raw(addr: *const ffi::sockaddr) -> Option<SocketAddr> {
    let socklen = match addr.as_ref()?.sa_family as libc::c_int {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        _ => return None,
    } as libc::socklen_t;
    let ((), sockaddr) = SockAddr::init(|storage, len| {
        *len = socklen;
        ptr::copy_nonoverlapping(addr as *const u8, storage as *mut u8, socklen as usize);
        Ok(())
    })
    .ok()?;
    sockaddr.as_socket()
}

fn conn_param(param: &ConnParam) -> ffi::rdma_conn_param {
    let mut raw: ffi::rdma_conn_param = unsafe { mem::zeroed() };
    raw.responder_resources = param.responder_resources;
    raw.initiator_depth = param.initiator_depth;
    raw.retry_count = param.retry_count;
    raw.rnr_retry_count = param.rnr_retry_count;
    raw
}
