//! Blocking send/receive primitives over the single registered buffer.
use std::io;
use std::time::Instant;

use crate::cm::CmState;
use crate::config::PollPolicy;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::types::{SendFlags, SendRequest, Sge, WorkCompletion};
use crate::types::{WR_ID_RECV, WR_ID_SEND, WR_ID_SEND_IMM};

impl<F: Fabric> Connection<F> {
    /// The identity and a scatter-gather element over the first `len` bytes of the buffer.
    fn sge(&self, op: &'static str, len: usize) -> Result<(&F::CmId, Sge)> {
        let (id, mr) = match (self.id.as_ref(), self.mr.as_ref()) {
            (Some(id), Some(mr)) if self.qp => (id, mr),
            _ => {
                return Err(Error::InvalidState {
                    op,
                    state: self.state,
                })
            }
        };
        let keys = self.fabric.mr_keys(mr);
        if len > keys.length {
            return Err(Error::Post {
                op,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} bytes exceed the {} byte buffer", len, keys.length),
                ),
            });
        }
        let length = u32::try_from(len).map_err(|_| Error::Post {
            op,
            source: io::Error::new(io::ErrorKind::InvalidInput, "length does not fit in 32 bits"),
        })?;
        Ok((
            id,
            Sge {
                addr: keys.addr,
                length,
                lkey: keys.lkey,
            },
        ))
    }

    /// Posts one receive spanning the whole buffer.
    ///
    /// A receive must be outstanding before the peer's send arrives. Allowed as soon as the
    /// queue pair and the buffer exist, so it may precede the end of the handshake.
    pub fn post_receive(&mut self) -> Result<()> {
        let len = self.buffer.as_ref().map_or(0, |b| b.len());
        let (id, sge) = self.sge("receive", len)?;
        log::trace!("post_recv wr_id {} len {}", WR_ID_RECV, sge.length);
        unsafe { self.fabric.post_recv(id, WR_ID_RECV, sge) }.map_err(Error::post("receive"))
    }

    /// Sends the first `len` bytes of the buffer.
    ///
    /// An unsignaled send produces no completion; do not poll for it.
    pub fn post_send(&mut self, len: usize, signaled: bool) -> Result<()> {
        self.send(WR_ID_SEND, len, None, signaled)
    }

    /// Like [`post_send`](Connection::post_send), also carrying `imm` out of band. `imm` is
    /// given in host byte order and travels in network byte order.
    pub fn post_send_with_immediate(&mut self, len: usize, imm: u32, signaled: bool) -> Result<()> {
        self.send(WR_ID_SEND_IMM, len, Some(imm), signaled)
    }

    fn send(&mut self, wr_id: u64, len: usize, imm: Option<u32>, signaled: bool) -> Result<()> {
        if self.state != CmState::Connected {
            return Err(Error::InvalidState {
                op: "send",
                state: self.state,
            });
        }
        let (id, sge) = self.sge("send", len)?;
        let wr = SendRequest {
            wr_id,
            sge,
            imm,
            flags: if signaled {
                SendFlags::SIGNALED
            } else {
                SendFlags::empty()
            },
        };
        log::trace!("post_send {:?}", wr);
        unsafe { self.fabric.post_send(id, &wr) }.map_err(Error::post("send"))
    }

    /// Blocks for exactly one completion under the configured poll policy.
    pub fn poll_completion(&mut self) -> Result<WorkCompletion> {
        let policy = self.config.poll;
        self.poll_completion_with(&policy)
    }

    /// Like [`poll_completion`](Connection::poll_completion), returning the immediate value
    /// of a receive that carried one, or 0 otherwise.
    pub fn poll_completion_with_immediate(&mut self) -> Result<u32> {
        let wc = self.poll_completion()?;
        Ok(wc.immediate().unwrap_or(0))
    }

    pub fn poll_completion_with(&mut self, policy: &PollPolicy) -> Result<WorkCompletion> {
        let cq = self.cq.as_ref().ok_or(Error::InvalidState {
            op: "poll completion",
            state: self.state,
        })?;
        let deadline = policy.timeout().map(|t| Instant::now() + t);
        let mut attempt = 0u64;
        loop {
            if let Some(wc) = self.fabric.poll_cq(cq)? {
                log::trace!("completion {:?} after {} empty polls", wc, attempt);
                if !wc.status.is_success() {
                    return Err(Error::Completion {
                        wr_id: wc.wr_id,
                        status: wc.status,
                        vendor_err: wc.vendor_err,
                    });
                }
                return Ok(wc);
            }
            if policy.max_attempts.map_or(false, |max| attempt + 1 >= max) {
                return Err(Error::TimedOut("completion"));
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(Error::TimedOut("completion"));
            }
            policy.backoff.pause(attempt);
            attempt += 1;
        }
    }
}
