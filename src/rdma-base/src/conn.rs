//! The per-endpoint connection record.
use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::cm::{expect_event, transition, CmState, Role};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::mr::Buffer;
use crate::types::{CmEventKind, QpCapability};

/// Every resource of one endpoint.
///
/// Slots are filled in creation order and emptied in the reverse order by [`teardown`],
/// which also runs on drop. A record may be torn down from any partially built state.
///
/// [`teardown`]: Connection::teardown
pub struct Connection<F: Fabric> {
    pub(crate) fabric: F,
    pub(crate) config: ConnectionConfig,
    pub(crate) role: Role,
    pub(crate) state: CmState,
    pub(crate) channel: Option<F::EventChannel>,
    pub(crate) id: Option<F::CmId>,
    pub(crate) pd: Option<F::ProtectionDomain>,
    pub(crate) comp_channel: Option<F::CompChannel>,
    pub(crate) cq: Option<F::CompletionQueue>,
    /// The queue pair is owned by `id`.
    pub(crate) qp: bool,
    pub(crate) buffer: Option<Buffer>,
    pub(crate) mr: Option<F::MemoryRegion>,
}

impl<F: Fabric> fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("channel", &self.channel.is_some())
            .field("id", &self.id.is_some())
            .field("pd", &self.pd.is_some())
            .field("comp_channel", &self.comp_channel.is_some())
            .field("cq", &self.cq.is_some())
            .field("qp", &self.qp)
            .field("buffer", &self.buffer)
            .field("mr", &self.mr.is_some())
            .finish()
    }
}

impl<F: Fabric> Drop for Connection<F> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<F: Fabric> Connection<F> {
    fn empty(fabric: F, config: ConnectionConfig, role: Role) -> Self {
        Connection {
            fabric,
            config,
            role,
            state: CmState::Init,
            channel: None,
            id: None,
            pd: None,
            comp_channel: None,
            cq: None,
            qp: false,
            buffer: None,
            mr: None,
        }
    }

    /// Creates the event channel and the identity of an active endpoint.
    pub fn prepare(fabric: F, config: ConnectionConfig) -> Result<Self> {
        let mut conn = Self::empty(fabric, config, Role::Client);
        let channel = conn
            .fabric
            .create_event_channel()
            .map_err(Error::cm("create event channel"))?;
        let channel = conn.channel.insert(channel);
        let id = conn
            .fabric
            .create_id(channel)
            .map_err(Error::cm("create id"))?;
        conn.id = Some(id);
        Ok(conn)
    }

    /// Resolves address and route toward `addr`.
    ///
    /// The returned connection is ready for [`setup_qp`](Connection::setup_qp), which issues
    /// the connect request.
    pub fn connect(fabric: F, addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let mut conn = Self::prepare(fabric, config)?;
        conn.resolve(addr)?;
        Ok(conn)
    }

    /// Runs address then route resolution, each bounded by the configured timeout.
    pub fn resolve(&mut self, addr: SocketAddr) -> Result<()> {
        if self.role != Role::Client || self.state != CmState::Init {
            return Err(Error::InvalidState {
                op: "resolve",
                state: self.state,
            });
        }
        let timeout = self.config.resolve_timeout();
        let (channel, id) = match (self.channel.as_ref(), self.id.as_ref()) {
            (Some(channel), Some(id)) => (channel, id),
            _ => {
                return Err(Error::InvalidState {
                    op: "resolve",
                    state: self.state,
                })
            }
        };

        transition(&mut self.state, CmState::AddrResolving);
        self.fabric
            .resolve_addr(id, &addr, timeout)
            .map_err(Error::AddressResolution)?;
        expect_event(
            &self.fabric,
            channel,
            CmEventKind::AddrResolved,
            Some(timeout),
            "address resolution",
        )?;
        transition(&mut self.state, CmState::AddrResolved);

        transition(&mut self.state, CmState::RouteResolving);
        self.fabric
            .resolve_route(id, timeout)
            .map_err(Error::RouteResolution)?;
        expect_event(
            &self.fabric,
            channel,
            CmEventKind::RouteResolved,
            Some(timeout),
            "route resolution",
        )?;
        transition(&mut self.state, CmState::RouteResolved);
        Ok(())
    }

    /// Wraps the identity delivered by a connection request in a record of its own.
    pub(crate) fn from_request(fabric: F, config: ConnectionConfig, id: F::CmId) -> Result<Self> {
        let mut conn = Self::empty(fabric, config, Role::Server);
        conn.id = Some(id);
        let channel = conn
            .fabric
            .create_event_channel()
            .map_err(Error::cm("create event channel"))?;
        let channel = conn.channel.insert(channel);
        if let Some(id) = conn.id.as_ref() {
            conn.fabric
                .migrate_id(id, channel)
                .map_err(Error::cm("migrate id"))?;
        }
        transition(&mut conn.state, CmState::ConnectRequested);
        Ok(conn)
    }

    /// Provisions the protection domain, completion channel and queue, and the queue pair,
    /// then finishes the handshake for this role.
    pub fn setup_qp(&mut self, max_send_wr: u32, max_recv_wr: u32) -> Result<()> {
        let expected = match self.role {
            Role::Client => CmState::RouteResolved,
            Role::Server => CmState::ConnectRequested,
        };
        if self.state != expected || self.pd.is_some() {
            return Err(Error::InvalidState {
                op: "setup qp",
                state: self.state,
            });
        }
        let cap = QpCapability::new(max_send_wr, max_recv_wr);
        self.provision(&cap)?;

        let param = self.config.conn_param();
        let timeout = self.config.resolve_timeout();
        let (channel, id) = match (self.channel.as_ref(), self.id.as_ref()) {
            (Some(channel), Some(id)) => (channel, id),
            _ => {
                return Err(Error::InvalidState {
                    op: "setup qp",
                    state: self.state,
                })
            }
        };

        match self.role {
            Role::Server => {
                transition(&mut self.state, CmState::Accepting);
                self.fabric
                    .accept(id, &param)
                    .map_err(Error::cm("accept"))?;
                if self.config.accept_waits_established {
                    expect_event(
                        &self.fabric,
                        channel,
                        CmEventKind::Established,
                        Some(timeout),
                        "connection establishment",
                    )?;
                }
            }
            Role::Client => {
                self.fabric
                    .connect(id, &param)
                    .map_err(Error::cm("connect"))?;
                expect_event(
                    &self.fabric,
                    channel,
                    CmEventKind::Established,
                    Some(timeout),
                    "connection establishment",
                )?;
            }
        }
        transition(&mut self.state, CmState::Connected);
        Ok(())
    }

    fn provision(&mut self, cap: &QpCapability) -> Result<()> {
        let id = self.id.as_ref().ok_or(Error::InvalidState {
            op: "setup qp",
            state: self.state,
        })?;
        let cq_entries = cap.cq_entries().ok_or_else(|| Error::Resource {
            op: "completion queue",
            source: io::Error::from_raw_os_error(libc::EINVAL),
        })?;

        let pd = self
            .fabric
            .alloc_pd(id)
            .map_err(Error::resource("protection domain"))?;
        let pd = self.pd.insert(pd);

        let comp_channel = self
            .fabric
            .create_comp_channel(id)
            .map_err(Error::resource("completion channel"))?;
        let comp_channel = self.comp_channel.insert(comp_channel);

        let cq = self
            .fabric
            .create_cq(id, cq_entries, comp_channel)
            .map_err(Error::resource("completion queue"))?;
        let cq = self.cq.insert(cq);
        // Armed once; completions are only ever observed by polling.
        self.fabric
            .req_notify_cq(cq)
            .map_err(Error::resource("completion notification"))?;

        self.fabric
            .create_qp(id, pd, cq, cap)
            .map_err(Error::resource("queue pair"))?;
        self.qp = true;
        log::debug!(
            "provisioned RC queue pair, {} send / {} recv, cq depth {}",
            cap.max_send_wr,
            cap.max_recv_wr,
            cq_entries
        );
        Ok(())
    }

    /// Releases every resource in reverse creation order. Calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.state == CmState::Closed {
            return;
        }
        log::debug!("tearing down {:?} connection in state {:?}", self.role, self.state);

        if let Some(mr) = self.mr.take() {
            if let Err(e) = self.fabric.dereg_mr(mr) {
                log::warn!("failed to deregister memory region: {}", e);
            }
        }
        drop(self.buffer.take());
        if std::mem::take(&mut self.qp) {
            if let Some(id) = self.id.as_ref() {
                if let Err(e) = self.fabric.destroy_qp(id) {
                    log::warn!("failed to destroy queue pair: {}", e);
                }
            }
        }
        if let Some(cq) = self.cq.take() {
            if let Err(e) = self.fabric.destroy_cq(cq) {
                log::warn!("failed to destroy completion queue: {}", e);
            }
        }
        if let Some(comp_channel) = self.comp_channel.take() {
            if let Err(e) = self.fabric.destroy_comp_channel(comp_channel) {
                log::warn!("failed to destroy completion channel: {}", e);
            }
        }
        if let Some(pd) = self.pd.take() {
            if let Err(e) = self.fabric.dealloc_pd(pd) {
                log::warn!("failed to deallocate protection domain: {}", e);
            }
        }
        if let Some(id) = self.id.take() {
            if let Err(e) = self.fabric.destroy_id(id) {
                log::warn!("failed to destroy identity: {}", e);
            }
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.fabric.destroy_event_channel(channel) {
                log::warn!("failed to destroy event channel: {}", e);
            }
        }
        transition(&mut self.state, CmState::Closed);
    }

    #[inline]
    pub fn state(&self) -> CmState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[inline]
    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    /// The working identity of this endpoint.
    #[inline]
    pub fn id(&self) -> Option<&F::CmId> {
        self.id.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.id.as_ref().and_then(|id| self.fabric.local_addr(id))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.id.as_ref().and_then(|id| self.fabric.peer_addr(id))
    }
}
