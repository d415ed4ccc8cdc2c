use std::io;

use thiserror::Error;

use crate::cm::CmState;
use crate::types::{CmEventKind, WcStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Address resolution failed: {0}")]
    AddressResolution(#[source] io::Error),
    #[error("Route resolution failed: {0}")]
    RouteResolution(#[source] io::Error),
    #[error("Unexpected CM event: expected {expected}, got {got} (status {status})")]
    Protocol {
        expected: CmEventKind,
        got: CmEventKind,
        status: i32,
    },
    #[error("rdmacm {op} failed: {source}")]
    RdmaCm {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create {op}: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Memory registration failed: {0}")]
    Registration(#[source] io::Error),
    #[error("Failed to post {op}: {source}")]
    Post {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Work request {wr_id} completed with {status:?} (vendor error {vendor_err:#x})")]
    Completion {
        wr_id: u64,
        status: WcStatus,
        vendor_err: u32,
    },
    #[error("Timed out waiting for {0}")]
    TimedOut(&'static str),
    #[error("{op} is not allowed in state {state:?}")]
    InvalidState { op: &'static str, state: CmState },
    #[error("Connection already holds a registered buffer")]
    AlreadyRegistered,
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    #[inline]
    pub(crate) fn cm(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::RdmaCm { op, source }
    }

    #[inline]
    pub(crate) fn resource(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Resource { op, source }
    }

    #[inline]
    pub(crate) fn post(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Post { op, source }
    }

    /// Whether the failure was reported by the transport rather than by the local caller.
    pub fn is_completion_error(&self) -> bool {
        matches!(self, Error::Completion { .. })
    }
}
