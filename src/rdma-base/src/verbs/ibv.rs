use std::io;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

use super::ffi;
use super::rdmacm::CmId;
use crate::types::{
    AccessFlags, MemoryKeys, SendFlags, SendRequest, Sge, WcFlags, WcOpcode, WcStatus,
    WorkCompletion,
};

static_assertions::const_assert_eq!(
    AccessFlags::LOCAL_WRITE.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
);
static_assertions::const_assert_eq!(
    AccessFlags::REMOTE_WRITE.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
);
static_assertions::const_assert_eq!(
    AccessFlags::REMOTE_READ.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
);
static_assertions::const_assert_eq!(
    SendFlags::SIGNALED.bits(),
    ffi::ibv_send_flags::IBV_SEND_SIGNALED.0
);
static_assertions::const_assert_eq!(WcFlags::GRH.bits(), ffi::ibv_wc_flags::IBV_WC_GRH.0);
static_assertions::const_assert_eq!(
    WcFlags::WITH_IMM.bits(),
    ffi::ibv_wc_flags::IBV_WC_WITH_IMM.0
);

#[inline]
fn nonnull<T>(p: *mut T) -> io::Result<*mut T> {
    if p.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(p)
    }
}

/// Verbs calls that return an errno instead of setting it.
#[inline]
fn check_errno(rc: i32) -> io::Result<()> {
    if rc != 0 {
        Err(io::Error::from_raw_os_error(rc))
    } else {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProtectionDomain {
    pub(crate) pd: *mut ffi::ibv_pd,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if errno != 0 {
            log::debug!(
                "failed to dealloc pd: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}

impl ProtectionDomain {
    pub fn alloc(id: &CmId) -> io::Result<Self> {
        let pd = nonnull(unsafe { ffi::ibv_alloc_pd(id.verbs()?) })?;
        Ok(ProtectionDomain { pd })
    }

    pub fn dealloc(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        check_errno(unsafe { ffi::ibv_dealloc_pd(this.pd) })
    }
}

#[derive(Debug)]
pub struct CompChannel {
    pub(crate) channel: *mut ffi::ibv_comp_channel,
}

unsafe impl Send for CompChannel {}
unsafe impl Sync for CompChannel {}

impl Drop for CompChannel {
    fn drop(&mut self) {
        unsafe { ffi::ibv_destroy_comp_channel(self.channel) };
    }
}

impl CompChannel {
    pub fn create(id: &CmId) -> io::Result<Self> {
        let channel = nonnull(unsafe { ffi::ibv_create_comp_channel(id.verbs()?) })?;
        Ok(CompChannel { channel })
    }

    pub fn destroy(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        check_errno(unsafe { ffi::ibv_destroy_comp_channel(this.channel) })
    }
}

#[derive(Debug)]
pub struct CompletionQueue {
    pub(crate) cq: *mut ffi::ibv_cq,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_cq(self.cq) };
        if errno != 0 {
            log::debug!(
                "failed to destroy cq: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}

impl CompletionQueue {
    pub fn create(id: &CmId, min_cq_entries: u32, channel: &CompChannel) -> io::Result<Self> {
        let cqe = i32::try_from(min_cq_entries)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let cq = nonnull(unsafe {
            ffi::ibv_create_cq(id.verbs()?, cqe, ptr::null_mut(), channel.channel, 0)
        })?;
        Ok(CompletionQueue { cq })
    }

    pub fn destroy(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        check_errno(unsafe { ffi::ibv_destroy_cq(this.cq) })
    }

    pub fn req_notify(&self, solicited_only: bool) -> io::Result<()> {
        check_errno(unsafe { ffi::rdma_base_req_notify_cq(self.cq, solicited_only as i32) })
    }

    /// Pops at most one work completion.
    pub fn poll(&self) -> io::Result<Option<WorkCompletion>> {
        let mut wc = MaybeUninit::<ffi::ibv_wc>::uninit();
        let n = unsafe { ffi::rdma_base_poll_cq(self.cq, 1, wc.as_mut_ptr()) };
        match n {
            0 => Ok(None),
            1 => Ok(Some(from_raw_wc(unsafe { &wc.assume_init() }))),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ibv_poll_cq returned {}", n),
            )),
        }
    }
}

fn from_raw_wc(wc: &ffi::ibv_wc) -> WorkCompletion {
    use ffi::ibv_wc_opcode::*;
    use ffi::ibv_wc_status::*;
    let status = match wc.status {
        IBV_WC_SUCCESS => WcStatus::Success,
        IBV_WC_LOC_LEN_ERR => WcStatus::LocalLengthError,
        IBV_WC_LOC_PROT_ERR => WcStatus::LocalProtectionError,
        IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushError,
        IBV_WC_REM_ACCESS_ERR => WcStatus::RemoteAccessError,
        IBV_WC_REM_INV_REQ_ERR => WcStatus::RemoteInvalidRequest,
        IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExceeded,
        IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExceeded,
        other => WcStatus::Other(other as u32),
    };
    let opcode = match wc.opcode {
        IBV_WC_SEND => WcOpcode::Send,
        IBV_WC_RECV => WcOpcode::Recv,
        IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        _ => WcOpcode::Invalid,
    };
    WorkCompletion {
        wr_id: wc.wr_id,
        status,
        opcode,
        vendor_err: wc.vendor_err,
        byte_len: wc.byte_len,
        imm_data: unsafe { wc.__bindgen_anon_1.imm_data },
        wc_flags: WcFlags::from_bits_truncate(wc.wc_flags),
        qp_num: wc.qp_num,
    }
}

#[derive(Debug)]
pub struct MemoryRegion {
    pub(crate) mr: *mut ffi::ibv_mr,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dereg_mr(self.mr) };
        if errno != 0 {
            log::debug!(
                "failed to dereg mr: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}

impl MemoryRegion {
    /// # Safety
    ///
    /// `[addr, addr + len)` must stay valid until the region is deregistered.
    pub unsafe fn register(
        pd: &ProtectionDomain,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<Self> {
        let mr = nonnull(ffi::ibv_reg_mr(pd.pd, addr.cast(), len as _, access.bits() as i32))?;
        Ok(MemoryRegion { mr })
    }

    pub fn keys(&self) -> MemoryKeys {
        assert!(!self.mr.is_null());
        let mr = unsafe { &*self.mr };
        MemoryKeys {
            addr: mr.addr as u64,
            length: mr.length as usize,
            lkey: mr.lkey,
            rkey: mr.rkey,
        }
    }

    pub fn deregister(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        check_errno(unsafe { ffi::ibv_dereg_mr(this.mr) })
    }
}

#[inline]
fn raw_sge(sge: &Sge) -> ffi::ibv_sge {
    ffi::ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

/// # Safety
///
/// The memory `sge` describes must stay valid until the request completes.
pub unsafe fn post_recv(id: &CmId, wr_id: u64, sge: &Sge) -> io::Result<()> {
    let qp = id.qp()?;
    let mut sge = raw_sge(sge);
    let mut wr: ffi::ibv_recv_wr = mem::zeroed();
    wr.wr_id = wr_id;
    wr.next = ptr::null_mut();
    wr.sg_list = &mut sge;
    wr.num_sge = 1;
    let mut bad_wr = ptr::null_mut();
    check_errno(ffi::rdma_base_post_recv(qp, &mut wr, &mut bad_wr))
}

/// # Safety
///
/// The memory `req.sge` describes must stay valid until the request completes.
pub unsafe fn post_send(id: &CmId, req: &SendRequest) -> io::Result<()> {
    let qp = id.qp()?;
    let mut sge = raw_sge(&req.sge);
    let mut wr: ffi::ibv_send_wr = mem::zeroed();
    wr.wr_id = req.wr_id;
    wr.next = ptr::null_mut();
    wr.sg_list = &mut sge;
    wr.num_sge = 1;
    wr.send_flags = req.flags.bits();
    match req.imm {
        Some(imm) => {
            wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
            wr.__bindgen_anon_1.imm_data = imm.to_be();
        }
        None => wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND,
    }
    let mut bad_wr = ptr::null_mut();
    check_errno(ffi::rdma_base_post_send(qp, &mut wr, &mut bad_wr))
}
