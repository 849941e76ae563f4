//! Name resolution contract and origin up/down tracking.
//!
//! Resolution itself is a collaborator: the server provides a tokio-backed
//! implementation, the harness a scripted fake. The host-status registry
//! lives here because the state machine owns the marking policy: connect
//! failures increment a per-(host, port) counter according to
//! `connect_down_policy`, and crossing the threshold takes the host down
//! for a configured duration.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::warn;

use crate::config::ConnectDownPolicy;

/// Outcome of a name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsResult {
    /// Addresses in preference order (never empty)
    Resolved(Vec<IpAddr>),
    /// The name does not resolve
    NotFound,
    /// Resolution infrastructure failed; retryable
    ServFail,
}

/// Name resolver collaborator.
pub trait Resolver {
    /// Resolve `hostname` for a connection to `port`.
    fn resolve(&self, hostname: &str, port: u16) -> DnsResult;

    /// Reverse-resolve an address (used by filtering rules).
    fn reverse(&self, addr: IpAddr) -> Option<String> {
        let _ = addr;
        None
    }
}

/// Phase of the connect at which a failure happened; drives the marking
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailurePhase {
    /// TCP-level failure before any TLS exchange
    PreTls,
    /// Failure during the TLS handshake
    Tls,
}

#[derive(Debug, Default)]
struct HostRecord {
    failure_count: u32,
    down_until: Option<Instant>,
}

/// Per-(host, port) failure counters and down markings.
#[derive(Debug, Default)]
pub struct HostStatusMap {
    records: HashMap<(String, u16), HostRecord>,
}

impl HostStatusMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True while (host, port) is marked down at `now`.
    #[must_use]
    pub fn is_down(&self, host: &str, port: u16, now: Instant) -> bool {
        self.records
            .get(&(host.to_ascii_lowercase(), port))
            .and_then(|r| r.down_until)
            .is_some_and(|until| now < until)
    }

    /// Consecutive failures recorded for (host, port).
    #[must_use]
    pub fn failure_count(&self, host: &str, port: u16) -> u32 {
        self.records
            .get(&(host.to_ascii_lowercase(), port))
            .map_or(0, |r| r.failure_count)
    }

    /// Record a connect failure under `policy`. Returns true when this
    /// failure transitioned the host to down.
    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        &mut self,
        host: &str,
        addr: SocketAddr,
        phase: ConnectFailurePhase,
        policy: ConnectDownPolicy,
        threshold: u32,
        down_for: Duration,
        now: Instant,
    ) -> bool {
        let countable = match policy {
            ConnectDownPolicy::Never => false,
            ConnectDownPolicy::TcpOnly => phase == ConnectFailurePhase::PreTls,
            ConnectDownPolicy::Any => true,
        };
        if !countable {
            return false;
        }

        let record = self
            .records
            .entry((host.to_ascii_lowercase(), addr.port()))
            .or_default();
        record.failure_count += 1;
        if record.failure_count >= threshold && record.down_until.is_none() {
            record.down_until = Some(now + down_for);
            warn!(host, %addr, failures = record.failure_count, "marking origin down");
            return true;
        }
        false
    }

    /// Record a successful connect: clears the counter and any marking.
    pub fn record_success(&mut self, host: &str, port: u16) {
        if let Some(record) = self.records.get_mut(&(host.to_ascii_lowercase(), port)) {
            record.failure_count = 0;
            record.down_until = None;
        }
    }

    /// Expire a lapsed down marking so the next attempt counts fresh.
    pub fn expire(&mut self, host: &str, port: u16, now: Instant) {
        if let Some(record) = self.records.get_mut(&(host.to_ascii_lowercase(), port))
            && record.down_until.is_some_and(|until| now >= until)
        {
            record.down_until = None;
            record.failure_count = 0;
        }
    }
}
