//! Deterministic harness for the midspan protocol cores.
//!
//! [`SimRuntime`] is a scripted stand-in for `midspan-server`: it executes
//! every action the transaction machine returns against in-memory fakes
//! (resolver, cache, origin) and feeds the resulting events straight back,
//! so a whole transaction runs in one synchronous call. Scenario tests in
//! `tests/` drive it end to end.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use midspan_core::{
    ProxyConfig,
    cache::{CacheKey, CacheReadResult, CacheWriteResult, CachedObject},
    hooks::HookRegistry,
    resolver::{ConnectFailurePhase, HostStatusMap},
    session::InMemorySessionPool,
    transaction::{
        HttpTransaction, NullRemap, RemapTable, RequestBodyKind, TimerKind, TxnAction,
        TxnContext, TxnEvent,
    },
    tunnel::TunnelAction,
};
use midspan_core::resolver::DnsResult;
use tracing::debug;

/// Scripted resolver.
#[derive(Debug, Default)]
pub struct FakeResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl FakeResolver {
    /// Empty resolver; unmapped names fail with `NotFound`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `hostname` to `addrs`.
    pub fn insert(&mut self, hostname: &str, addrs: Vec<IpAddr>) {
        self.entries.insert(hostname.to_ascii_lowercase(), addrs);
    }

    fn resolve(&self, hostname: &str) -> DnsResult {
        match self.entries.get(&hostname.to_ascii_lowercase()) {
            Some(addrs) => DnsResult::Resolved(addrs.clone()),
            None => DnsResult::NotFound,
        }
    }
}

/// Scripted cache: a real in-memory store plus error injection.
#[derive(Debug, Default)]
pub struct FakeCache {
    objects: HashMap<CacheKey, CachedObject>,
    locked: std::collections::HashSet<CacheKey>,
    /// Next open-read fails with this error
    pub fail_next_read: Option<String>,
    /// All open-writes report lock contention
    pub contend_writes: bool,
}

impl FakeCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a stored object.
    pub fn seed(&mut self, key: &str, object: CachedObject) {
        self.objects.insert(key.to_string(), object);
    }

    /// Stored object for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CachedObject> {
        self.objects.get(key)
    }

    fn open_read(&mut self, key: &CacheKey) -> CacheReadResult {
        if let Some(reason) = self.fail_next_read.take() {
            return CacheReadResult::Error(reason);
        }
        match self.objects.get(key) {
            Some(object) => CacheReadResult::Hit(object.clone()),
            None => CacheReadResult::Miss,
        }
    }

    fn open_write(&mut self, key: &CacheKey) -> CacheWriteResult {
        if self.contend_writes {
            return CacheWriteResult::LockContended;
        }
        if self.locked.insert(key.clone()) {
            CacheWriteResult::Ready
        } else {
            CacheWriteResult::LockContended
        }
    }

    fn commit(&mut self, key: &CacheKey, object: CachedObject) {
        self.locked.remove(key);
        self.objects.insert(key.clone(), object);
    }
}

/// What the scripted origin does with one request.
#[derive(Debug, Clone)]
pub enum OriginBehavior {
    /// Answer with this response
    Respond {
        /// Status line
        status: StatusCode,
        /// Response headers
        headers: HeaderMap,
        /// Response body
        body: Bytes,
    },
    /// Refuse the TCP connection
    RefuseConnect,
    /// Let the connect attempt time out
    ConnectTimeout,
}

/// A request the scripted origin observed.
#[derive(Debug, Clone)]
pub struct ObservedRequest {
    /// Request method
    pub method: Method,
    /// Request target
    pub uri: Uri,
    /// Outbound headers as sent
    pub headers: HeaderMap,
    /// Buffered body, when one was sent
    pub body: Option<Bytes>,
}

/// Scripted origin server.
#[derive(Debug, Default)]
pub struct ScriptedOrigin {
    script: VecDeque<OriginBehavior>,
    /// Whether the origin advertises chunked support
    pub supports_chunked: bool,
    /// Every request received, in order
    pub requests: Vec<ObservedRequest>,
}

impl ScriptedOrigin {
    /// Origin with an empty script. Unscripted requests answer 200 with an
    /// empty body.
    #[must_use]
    pub fn new() -> Self {
        Self { supports_chunked: true, ..Self::default() }
    }

    /// Append one scripted behavior.
    pub fn push(&mut self, behavior: OriginBehavior) {
        self.script.push_back(behavior);
    }

    /// Script the same behavior `n` times.
    pub fn push_repeated(&mut self, behavior: &OriginBehavior, n: usize) {
        for _ in 0..n {
            self.script.push_back(behavior.clone());
        }
    }

    fn next_connect(&mut self) -> Option<OriginBehavior> {
        match self.script.front() {
            Some(OriginBehavior::RefuseConnect | OriginBehavior::ConnectTimeout) => {
                self.script.pop_front()
            }
            _ => None,
        }
    }

    fn next_response(&mut self) -> (StatusCode, HeaderMap, Bytes) {
        match self.script.pop_front() {
            Some(OriginBehavior::Respond { status, headers, body }) => (status, headers, body),
            _ => (StatusCode::OK, HeaderMap::new(), Bytes::new()),
        }
    }
}

/// A complete response observed by the fake client.
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    /// Status line
    pub status: StatusCode,
    /// Headers as sent
    pub headers: HeaderMap,
    /// Immediate body, when the machine supplied one
    pub body: Option<Bytes>,
}

/// Deterministic runtime driving one transaction against fakes.
pub struct SimRuntime {
    /// Configuration under test
    pub config: ProxyConfig,
    /// Global observer registry
    pub registry: HookRegistry,
    /// Session pool
    pub pool: InMemorySessionPool,
    /// Host up/down records
    pub host_status: HostStatusMap,
    /// Scripted resolver
    pub resolver: FakeResolver,
    /// Scripted cache
    pub cache: FakeCache,
    /// Scripted origin
    pub origin: ScriptedOrigin,

    /// Dechunked request body handed over on `BufferRequestBody`
    pub client_body: Option<Bytes>,
    /// Responses the client received
    pub responses: Vec<ObservedResponse>,
    /// Body bytes tunneled to the client
    pub client_tunnel_bytes: Vec<u8>,
    /// Bytes tunneled to the origin (blind tunnels)
    pub origin_tunnel_bytes: Vec<u8>,
    /// True once the machine asked to be destroyed
    pub destroyed: bool,
    /// Client close requests (reuse flag)
    pub client_closes: Vec<bool>,

    origin_body_pending: Option<Bytes>,
    cache_write_body: Vec<u8>,
    cache_write_head: Option<(StatusCode, HeaderMap)>,
    last_origin_vc: Option<u64>,
    next_vc: u64,
    now: Instant,
}

/// Cache-write consumer key the core uses inside the tunnel.
const CACHE_WRITE_VC: u64 = u64::MAX;

impl SimRuntime {
    /// Runtime over `config`.
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            registry: HookRegistry::new(),
            pool: InMemorySessionPool::new(),
            host_status: HostStatusMap::new(),
            resolver: FakeResolver::new(),
            cache: FakeCache::new(),
            origin: ScriptedOrigin::new(),
            client_body: None,
            responses: Vec::new(),
            client_tunnel_bytes: Vec::new(),
            origin_tunnel_bytes: Vec::new(),
            destroyed: false,
            client_closes: Vec::new(),
            origin_body_pending: None,
            cache_write_body: Vec::new(),
            cache_write_head: None,
            last_origin_vc: None,
            next_vc: 10,
            now: Instant::now(),
        }
    }

    /// Build a transaction bound to this runtime's addresses.
    #[must_use]
    pub fn new_txn(&self, client_addr: &str, local_addr: &str) -> HttpTransaction {
        HttpTransaction::new(
            1,
            client_addr.parse().unwrap_or_else(|_| sockaddr_fallback()),
            local_addr.parse().unwrap_or_else(|_| sockaddr_fallback()),
            None,
            false,
            &self.config,
            self.now,
        )
    }

    /// Deliver a request header and run the transaction to quiescence.
    pub fn run_request(
        &mut self,
        txn: &mut HttpTransaction,
        method: Method,
        uri: &str,
        headers: HeaderMap,
        body: RequestBodyKind,
    ) {
        let event = TxnEvent::RequestHeaderReady {
            method,
            uri: uri.parse().unwrap_or_default(),
            version: Version::HTTP_11,
            headers,
            body,
        };
        self.drive(txn, event);
    }

    /// Deliver one event and execute every resulting action until the
    /// machine goes quiet.
    pub fn drive(&mut self, txn: &mut HttpTransaction, event: TxnEvent) {
        let mut events = VecDeque::new();
        events.push_back(event);

        while let Some(event) = events.pop_front() {
            let actions = {
                let remap: &dyn RemapTable = &NullRemap;
                let mut ctx = TxnContext {
                    config: &self.config,
                    registry: &self.registry,
                    remap,
                    pool: &self.pool,
                    host_status: &mut self.host_status,
                };
                txn.handle_event(&mut ctx, event, self.now)
            };
            for action in actions {
                self.execute(txn, action, &mut events);
            }
        }
    }

    fn execute(
        &mut self,
        txn: &mut HttpTransaction,
        action: TxnAction,
        events: &mut VecDeque<TxnEvent>,
    ) {
        match action {
            TxnAction::ResolveDns { hostname, .. } => {
                let result = self.resolver.resolve(&hostname);
                events.push_back(TxnEvent::DnsResolved { result });
            }
            TxnAction::CacheOpenRead { key } => {
                let result = self.cache.open_read(&key);
                events.push_back(TxnEvent::CacheReadDone { result });
            }
            TxnAction::CacheOpenWrite { key } => {
                let result = self.cache.open_write(&key);
                events.push_back(TxnEvent::CacheWriteDone { result });
            }
            TxnAction::BufferRequestBody => {
                let body = self.client_body.clone().unwrap_or_default();
                events.push_back(TxnEvent::RequestBodyComplete { body });
            }
            TxnAction::ConnectOrigin { .. } => match self.origin.next_connect() {
                Some(OriginBehavior::RefuseConnect) => {
                    events.push_back(TxnEvent::OriginConnectFailed {
                        phase: ConnectFailurePhase::PreTls,
                    });
                }
                Some(OriginBehavior::ConnectTimeout) => {
                    events.push_back(TxnEvent::TimerFired { kind: TimerKind::Connect });
                }
                _ => {
                    self.next_vc += 1;
                    self.last_origin_vc = Some(self.next_vc);
                    events.push_back(TxnEvent::OriginConnected {
                        vc: self.next_vc,
                        supports_chunked: self.origin.supports_chunked,
                    });
                }
            },
            TxnAction::SendRequestToOrigin { method, uri, headers, body, .. } => {
                self.origin.requests.push(ObservedRequest {
                    method,
                    uri,
                    headers,
                    body,
                });
                let (status, headers, body) = self.origin.next_response();
                self.origin_body_pending = (!body.is_empty()).then(|| body.clone());
                self.cache_write_head = Some((status, headers.clone()));
                events.push_back(TxnEvent::OriginResponseHeader { status, headers });
            }
            TxnAction::SendResponseToClient { status, headers, body } => {
                self.responses.push(ObservedResponse { status, headers, body: body.clone() });
                // A streamed origin body (or its EOS) follows through the
                // tunnel; blind tunnels are driven explicitly by the test
                if body.is_none() && !txn.is_blind_tunnel() {
                    let data = self.origin_body_pending.take().unwrap_or_default();
                    events.push_back(TxnEvent::OriginBodyBytes { data, eos: true });
                }
            }
            TxnAction::Tunnel(TunnelAction::WriteTo { consumer, data }) => {
                if consumer == CACHE_WRITE_VC {
                    self.cache_write_body.extend_from_slice(&data);
                } else if Some(consumer) == self.last_origin_vc {
                    self.origin_tunnel_bytes.extend_from_slice(&data);
                } else {
                    self.client_tunnel_bytes.extend_from_slice(&data);
                }
            }
            TxnAction::Tunnel(TunnelAction::CloseConsumer { consumer }) => {
                if consumer == CACHE_WRITE_VC
                    && let Some((status, headers)) = self.cache_write_head.clone()
                    && let Some(key) = txn.cache_key().cloned()
                {
                    self.cache.commit(
                        &key,
                        CachedObject {
                            status,
                            headers,
                            body: Bytes::copy_from_slice(&self.cache_write_body),
                            request_sent_time: 1_000,
                            response_received_time: 1_001,
                        },
                    );
                }
            }
            TxnAction::Tunnel(TunnelAction::AbortProducer { .. }) => {}
            TxnAction::CacheCommit { key, object } => {
                self.cache.commit(&key, object);
            }
            TxnAction::SetTimer { kind: TimerKind::CalloutRetry, .. } => {
                // Deterministic: the backoff elapses immediately
                events.push_back(TxnEvent::TimerFired { kind: TimerKind::CalloutRetry });
            }
            TxnAction::SetTimer { .. } | TxnAction::ClearTimer { .. } => {}
            TxnAction::DrainRequestBody => {}
            TxnAction::ReleaseSession { session } => {
                debug!(id = session.id, "session released");
            }
            TxnAction::CloseOrigin { .. } => {}
            TxnAction::CloseClient { reuse } => self.client_closes.push(reuse),
            TxnAction::Destroy => self.destroyed = true,
        }
    }
}

fn sockaddr_fallback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}
