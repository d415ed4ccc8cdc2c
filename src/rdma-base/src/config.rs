use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ConnParam;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionConfig {
    /// Maximum outstanding send work requests.
    pub send_wr: u32,
    /// Maximum outstanding receive work requests.
    pub recv_wr: u32,
    /// Size of the single transfer buffer. Both peers must agree on it out of band.
    pub buffer_size: usize,
    /// Bound for address and route resolution, and for waiting on their events.
    pub resolve_timeout_ms: u64,
    /// Pending connection requests a listener admits.
    pub backlog: i32,
    /// Whether the passive side blocks for ESTABLISHED after accepting.
    pub accept_waits_established: bool,
    pub retry_count: u8,
    /// 0 means a send that finds no posted receive faults the connection.
    pub rnr_retry_count: u8,
    pub poll: PollPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            send_wr: 16,
            recv_wr: 16,
            buffer_size: 1024,
            resolve_timeout_ms: 2000,
            backlog: 1,
            accept_waits_established: true,
            retry_count: 0,
            rnr_retry_count: 0,
            poll: PollPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    #[inline]
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn conn_param(&self) -> ConnParam {
        ConnParam {
            retry_count: self.retry_count,
            rnr_retry_count: self.rnr_retry_count,
            ..Default::default()
        }
    }
}

/// How a blocking completion wait spends its time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PollPolicy {
    /// Give up after this many empty polls.
    pub max_attempts: Option<u64>,
    /// Give up after this much wall-clock time.
    pub timeout_ms: Option<u64>,
    pub backoff: Backoff,
}

impl PollPolicy {
    /// Polls forever, yielding between attempts.
    pub const fn unbounded() -> Self {
        PollPolicy {
            max_attempts: None,
            timeout_ms: None,
            backoff: Backoff::Yield,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Spin,
    Yield,
    Exponential { initial_us: u64, max_us: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Yield
    }
}

impl Backoff {
    /// Pauses after the `attempt`-th empty poll (0-based).
    pub(crate) fn pause(&self, attempt: u64) {
        match *self {
            Backoff::Spin => std::hint::spin_loop(),
            Backoff::Yield => std::thread::yield_now(),
            Backoff::Exponential { initial_us, max_us } => {
                let shift = attempt.min(32) as u32;
                let us = initial_us.saturating_mul(1u64 << shift).min(max_us);
                std::thread::sleep(Duration::from_micros(us));
            }
        }
    }
}
