//! Verbs-level value types shared by every fabric backend.
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Diagnostic `wr_id` of the receive posted over the whole buffer.
pub const WR_ID_RECV: u64 = 1;
/// Diagnostic `wr_id` of a plain send.
pub const WR_ID_SEND: u64 = 2;
/// Diagnostic `wr_id` of a send carrying immediate data.
pub const WR_ID_SEND_IMM: u64 = 3;

bitflags! {
    /// Memory region access permissions.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        /// Enables local write access. Required for the region to be a receive target.
        const LOCAL_WRITE = 0b00000001;
        /// Enables remote write access.
        const REMOTE_WRITE = 0b00000010;
        /// Enables remote read access.
        const REMOTE_READ = 0b00000100;
    }

    /// Flags of the completed WR.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }

    /// Flags of the WR properties.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the completion notification indicator.
        const SIGNALED = 0b00000010;
    }
}

/// Status of a work completion. Anything but `Success` carries a fault.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WrFlushError,
    RemoteAccessError,
    RemoteInvalidRequest,
    RetryExceeded,
    RnrRetryExceeded,
    /// Any status the backend does not name above, with its raw value.
    Other(u32),
}

impl WcStatus {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    /// Immediate data exactly as carried on the wire, in network byte order.
    pub imm_data: u32,
    pub wc_flags: WcFlags,
    pub qp_num: u32,
}

impl WorkCompletion {
    /// Returns the immediate value in host byte order if this is a receive that carried one.
    #[inline]
    pub fn immediate(&self) -> Option<u32> {
        if self.opcode == WcOpcode::Recv && self.wc_flags.contains(WcFlags::WITH_IMM) {
            Some(u32::from_be(self.imm_data))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl QpCapability {
    /// One scatter-gather element per operation in both directions.
    pub fn new(max_send_wr: u32, max_recv_wr: u32) -> Self {
        QpCapability {
            max_send_wr,
            max_recv_wr,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }

    /// Minimum completion queue depth covering every outstanding request, or `None` when
    /// the two capacities together overflow.
    #[inline]
    pub fn cq_entries(&self) -> Option<u32> {
        self.max_send_wr.checked_add(self.max_recv_wr)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParam {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// A single scatter-gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SendRequest {
    pub wr_id: u64,
    pub sge: Sge,
    /// Immediate value in host byte order; the backend puts it on the wire big-endian.
    pub imm: Option<u32>,
    pub flags: SendFlags,
}

/// Keys and extent of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryKeys {
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

/// Connection manager notifications the handshake cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
    /// Any event the backend does not name above, with its raw value.
    Other(u32),
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmEventKind::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventKind::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventKind::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventKind::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventKind::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventKind::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventKind::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventKind::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventKind::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventKind::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventKind::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventKind::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventKind::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
            CmEventKind::Other(raw) => return write!(f, "RDMA_CM_EVENT({})", raw),
        };
        f.write_str(s)
    }
}

/// An already acknowledged connection manager event.
///
/// `new_id` is only present for `ConnectRequest`, and hands ownership of the freshly created
/// identity to the receiver of the event.
#[derive(Debug)]
pub struct CmEvent<Id> {
    pub kind: CmEventKind,
    pub status: i32,
    pub new_id: Option<Id>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_completion(flags: WcFlags, imm_data: u32) -> WorkCompletion {
        WorkCompletion {
            wr_id: WR_ID_RECV,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            vendor_err: 0,
            byte_len: 4,
            imm_data,
            wc_flags: flags,
            qp_num: 1,
        }
    }

    #[test]
    fn immediate_is_converted_from_network_order() {
        let wc = recv_completion(WcFlags::WITH_IMM, 0x2Au32.to_be());
        assert_eq!(wc.immediate(), Some(0x2A));
    }

    #[test]
    fn immediate_requires_flag_and_recv_opcode() {
        let wc = recv_completion(WcFlags::empty(), 0x2Au32.to_be());
        assert_eq!(wc.immediate(), None);

        let mut send = recv_completion(WcFlags::WITH_IMM, 0x2Au32.to_be());
        send.opcode = WcOpcode::Send;
        assert_eq!(send.immediate(), None);
    }

    #[test]
    fn cq_covers_both_directions() {
        let cap = QpCapability::new(16, 8);
        assert_eq!(cap.cq_entries(), Some(24));
        assert_eq!(cap.max_send_sge, 1);
        assert_eq!(cap.max_recv_sge, 1);
        assert_eq!(QpCapability::new(u32::MAX, 1).cq_entries(), None);
    }
}
