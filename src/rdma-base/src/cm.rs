//! Connection management: handshake states, event waits, and the passive side.
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::types::{CmEvent, CmEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmState {
    Init,
    AddrResolving,
    AddrResolved,
    RouteResolving,
    RouteResolved,
    Listening,
    ConnectRequested,
    Accepting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[inline]
pub(crate) fn transition(state: &mut CmState, to: CmState) {
    log::debug!("connection state {:?} -> {:?}", state, to);
    *state = to;
}

fn status_error(status: i32) -> io::Error {
    if status != 0 {
        io::Error::from_raw_os_error(status.saturating_abs())
    } else {
        io::Error::new(io::ErrorKind::Other, "reported by the connection manager")
    }
}

/// Blocks for the next event on `channel` and checks it is `expected`.
///
/// The event is acknowledged before returning whether it matches or not. An identity carried
/// by an unexpected event is destroyed.
pub(crate) fn expect_event<F: Fabric>(
    fabric: &F,
    channel: &F::EventChannel,
    expected: CmEventKind,
    timeout: Option<Duration>,
    what: &'static str,
) -> Result<CmEvent<F::CmId>> {
    let event = fabric
        .get_cm_event(channel, timeout)
        .map_err(Error::cm("get_cm_event"))?
        .ok_or(Error::TimedOut(what))?;
    log::debug!("cm event: {} (status {})", event.kind, event.status);

    if event.kind == expected && event.status == 0 {
        return Ok(event);
    }

    if let Some(id) = event.new_id {
        if let Err(e) = fabric.destroy_id(id) {
            log::warn!("failed to destroy identity of unexpected {}: {}", event.kind, e);
        }
    }

    Err(match event.kind {
        CmEventKind::AddrError => Error::AddressResolution(status_error(event.status)),
        CmEventKind::RouteError => Error::RouteResolution(status_error(event.status)),
        // A matching event with a failure status.
        CmEventKind::AddrResolved => Error::AddressResolution(status_error(event.status)),
        CmEventKind::RouteResolved => Error::RouteResolution(status_error(event.status)),
        got => Error::Protocol {
            expected,
            got,
            status: event.status,
        },
    })
}

/// A bound and listening passive endpoint.
///
/// Every accepted request becomes its own [`Connection`]; the listener keeps serving
/// further requests until it is dropped.
pub struct Listener<F: Fabric> {
    fabric: F,
    config: ConnectionConfig,
    channel: Option<F::EventChannel>,
    id: Option<F::CmId>,
}

impl<F: Fabric> std::fmt::Debug for Listener<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

impl<F: Fabric> Drop for Listener<F> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.fabric.destroy_id(id) {
                log::warn!("failed to destroy listening identity: {}", e);
            }
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.fabric.destroy_event_channel(channel) {
                log::warn!("failed to destroy listener event channel: {}", e);
            }
        }
    }
}

impl<F: Fabric> Listener<F> {
    /// Binds to `ip:port`, or to the wildcard address when `ip` is `None`, and starts
    /// listening with the configured backlog.
    pub fn bind(
        fabric: F,
        ip: Option<IpAddr>,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let addr = SocketAddr::new(ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
        let mut listener = Listener {
            fabric,
            config,
            channel: None,
            id: None,
        };

        let channel = listener
            .fabric
            .create_event_channel()
            .map_err(Error::cm("create event channel"))?;
        let channel = listener.channel.insert(channel);
        let id = listener
            .fabric
            .create_id(channel)
            .map_err(Error::cm("create id"))?;
        let id = listener.id.insert(id);

        listener
            .fabric
            .bind_addr(id, &addr)
            .map_err(Error::cm("bind addr"))?;
        listener
            .fabric
            .listen(id, listener.config.backlog)
            .map_err(Error::cm("listen"))?;
        log::debug!(
            "listening on {}, backlog {}",
            addr,
            listener.config.backlog
        );
        Ok(listener)
    }

    /// Blocks until a connection request arrives and returns its connection.
    pub fn accept(&mut self) -> Result<Connection<F>> {
        self.accept_timeout(None)
    }

    /// Like [`accept`](Listener::accept), giving up with [`Error::TimedOut`] once `timeout`
    /// passes. Notifications that carry no new request are logged and skipped.
    pub fn accept_timeout(&mut self, timeout: Option<Duration>) -> Result<Connection<F>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let (channel, _) = self.parts()?;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let event = self
                .fabric
                .get_cm_event(channel, remaining)
                .map_err(Error::cm("get_cm_event"))?
                .ok_or(Error::TimedOut("connection request"))?;
            log::debug!("cm event: {} (status {})", event.kind, event.status);

            match event.new_id {
                Some(id) if event.kind == CmEventKind::ConnectRequest && event.status == 0 => {
                    return Connection::from_request(self.fabric.clone(), self.config.clone(), id);
                }
                Some(id) => {
                    log::warn!("dropping unexpected {} on listener", event.kind);
                    if let Err(e) = self.fabric.destroy_id(id) {
                        log::warn!("failed to destroy identity of unexpected {}: {}", event.kind, e);
                    }
                }
                None => log::debug!("listener skipped {}", event.kind),
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.id.as_ref().and_then(|id| self.fabric.local_addr(id))
    }

    /// The listening identity. Accepted connections never share it.
    #[inline]
    pub fn id(&self) -> Option<&F::CmId> {
        self.id.as_ref()
    }

    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn parts(&self) -> Result<(&F::EventChannel, &F::CmId)> {
        match (self.channel.as_ref(), self.id.as_ref()) {
            (Some(channel), Some(id)) => Ok((channel, id)),
            _ => Err(Error::InvalidState {
                op: "accept",
                state: CmState::Closed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_positive_errno() {
        let e = status_error(-libc::ETIMEDOUT);
        assert_eq!(e.raw_os_error(), Some(libc::ETIMEDOUT));
        let e = status_error(libc::EHOSTUNREACH);
        assert_eq!(e.raw_os_error(), Some(libc::EHOSTUNREACH));
        assert_eq!(status_error(0).raw_os_error(), None);
    }
}
