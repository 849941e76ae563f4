//! Outbound session pool contract and the in-memory implementation.
//!
//! Idle origin connections are pooled in buckets keyed by hostname, address
//! family and port. Acquisition is non-blocking: a contended bucket lock
//! answers `Retry` and the caller simply opens a fresh connection. Sessions
//! marked private (authenticated requests, non-keep-alive POSTs,
//! plugin-tunneled connections) are never pooled; releasing one closes it.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Mutex,
};

use http::{Method, header};
use tracing::debug;

use crate::config::SharingMatch;

/// Unique id the runtime assigns each outbound connection.
pub type SessionId = u64;

/// An outbound origin session as the pool sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSession {
    /// Runtime connection id
    pub id: SessionId,
    /// Origin address the connection is established to
    pub addr: SocketAddr,
    /// Hostname the connection was opened for
    pub hostname: String,
    /// SNI presented on the outbound TLS handshake, if any
    pub sni: Option<String>,
    /// Client certificate fingerprint, if one was offered
    pub cert_hash: Option<String>,
    /// Never pool this session
    pub private: bool,
    /// Transactions served so far on this connection
    pub transact_count: u32,
}

impl ServerSession {
    /// Decide privacy from the request that is about to use the session.
    ///
    /// Authenticated requests and non-keep-alive POSTs must not share a
    /// connection; plugin tunnels set the flag through the overrides.
    #[must_use]
    pub fn is_request_private(
        method: &Method,
        headers: &http::HeaderMap,
        keep_alive: bool,
        plugin_tunnel: bool,
    ) -> bool {
        if plugin_tunnel {
            return true;
        }
        if headers.contains_key(header::AUTHORIZATION)
            || headers.contains_key(header::PROXY_AUTHORIZATION)
        {
            return true;
        }
        *method == Method::POST && !keep_alive
    }
}

/// Key a transaction acquires a session under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireKey {
    /// Resolved origin address
    pub addr: SocketAddr,
    /// Origin hostname
    pub hostname: String,
    /// SNI this transaction would present
    pub sni: Option<String>,
    /// Client certificate this transaction would present
    pub cert_hash: Option<String>,
}

/// Result of an acquisition attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireResult {
    /// An idle matching session was detached from the pool
    Done(ServerSession),
    /// No idle session matched
    NotFound,
    /// Bucket lock contended; open a fresh connection instead
    Retry,
}

/// Session pool interface. The state machine consumes this; the in-memory
/// implementation below and the harness fakes provide it.
pub trait SessionPool {
    /// Try to detach an idle session matching `key` under `policy`.
    fn acquire(&self, key: &AcquireKey, policy: SharingMatch) -> AcquireResult;

    /// Return `session` to the pool. Private sessions are dropped.
    fn release(&self, session: ServerSession, policy: SharingMatch);

    /// Idle sessions currently held.
    fn idle_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    hostname: String,
    family_v6: bool,
    port: u16,
}

impl BucketKey {
    fn for_addr(hostname: &str, addr: SocketAddr) -> Self {
        Self {
            hostname: hostname.to_ascii_lowercase(),
            family_v6: matches!(addr.ip(), IpAddr::V6(_)),
            port: addr.port(),
        }
    }
}

/// Bucketed in-memory pool. Each bucket carries its own mutex so
/// cross-thread contention stays per-destination.
#[derive(Default)]
pub struct InMemorySessionPool {
    buckets: Mutex<HashMap<BucketKey, Mutex<Vec<ServerSession>>>>,
}

impl InMemorySessionPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(key: &AcquireKey, candidate: &ServerSession, policy: SharingMatch) -> bool {
        if policy.contains(SharingMatch::IP) && candidate.addr != key.addr {
            return false;
        }
        if policy.contains(SharingMatch::HOSTONLY)
            && !candidate.hostname.eq_ignore_ascii_case(&key.hostname)
        {
            return false;
        }
        if policy.contains(SharingMatch::HOSTSNISYNC)
            && (!candidate.hostname.eq_ignore_ascii_case(&key.hostname)
                || candidate.sni != key.sni)
        {
            return false;
        }
        if policy.contains(SharingMatch::SNI) && candidate.sni != key.sni {
            return false;
        }
        if policy.contains(SharingMatch::CERT) && candidate.cert_hash != key.cert_hash {
            return false;
        }
        true
    }
}

impl SessionPool for InMemorySessionPool {
    fn acquire(&self, key: &AcquireKey, policy: SharingMatch) -> AcquireResult {
        if policy.is_none() {
            return AcquireResult::NotFound;
        }

        let Ok(buckets) = self.buckets.try_lock() else {
            return AcquireResult::Retry;
        };
        let bucket_key = BucketKey::for_addr(&key.hostname, key.addr);
        let Some(bucket) = buckets.get(&bucket_key) else {
            return AcquireResult::NotFound;
        };
        let Ok(mut sessions) = bucket.try_lock() else {
            return AcquireResult::Retry;
        };

        let position = sessions.iter().position(|s| Self::matches(key, s, policy));
        match position {
            Some(at) => AcquireResult::Done(sessions.swap_remove(at)),
            None => AcquireResult::NotFound,
        }
    }

    fn release(&self, session: ServerSession, policy: SharingMatch) {
        if session.private || policy.is_none() {
            debug!(id = session.id, "closing non-poolable session");
            return;
        }
        let Ok(mut buckets) = self.buckets.lock() else {
            return;
        };
        let bucket_key = BucketKey::for_addr(&session.hostname, session.addr);
        let bucket = buckets.entry(bucket_key).or_default();
        if let Ok(mut sessions) = bucket.lock() {
            sessions.push(session);
        }
    }

    fn idle_count(&self) -> usize {
        let Ok(buckets) = self.buckets.lock() else {
            return 0;
        };
        buckets
            .values()
            .map(|b| b.lock().map(|s| s.len()).unwrap_or(0))
            .sum()
    }
}
