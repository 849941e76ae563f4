//! HTTP transaction state machine.
//!
//! One instance walks a client request through remap, DNS, cache lookup,
//! origin selection, response, and teardown. The machine is a driver:
//! [`HttpTransaction::handle_event`] consumes one event, advances through
//! as many steps as it can without I/O, and returns the actions the
//! runtime must perform. Callout points yield to observer chains through
//! the [`HookDispatcher`]; a contended observer lock reschedules the step,
//! a deferred observer parks the machine in `IN_CALLOUT`, and server
//! errors or shutdowns that arrive mid-callout are deferred until the
//! observer re-enables the transaction.
//!
//! Lifetime: every entry point increments a re-entrancy counter; the
//! machine only emits [`TxnAction::Destroy`] when the counter is back to
//! zero and termination was requested, so no pending asynchronous action
//! can reference a freed transaction.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version, header};
use tracing::{debug, warn};

use crate::{
    cache::{CacheAction, CacheKey, CacheReadResult, CacheWriteResult, WriteFailPath, on_write_fail},
    config::{ProxyConfig, SchemeProtoMismatchPolicy, SniHostPolicy},
    error::ProxyError,
    headers::{
        transform::{
            add_connection_close, add_server_header, copy_header_fields,
            insert_time_and_age_headers, normalize_accept_encoding, parse_http_date,
            remove_100_continue_header, remove_privacy_headers, status_suppresses_body,
        },
        via::{ViaDirection, insert_via_header},
    },
    hooks::{
        CalloutProgress, CalloutStatus, HookDispatcher, HookId, HookRegistry, ObserverVerdict,
        TxnOverrides,
    },
    milestones::{Milestone, Milestones},
    resolver::{ConnectFailurePhase, DnsResult, HostStatusMap},
    session::{AcquireKey, AcquireResult, ServerSession, SessionPool},
    tunnel::{Tunnel, TunnelAction, TunnelEvent, select_chunking_action},
    vc::{VcKey, VcTable, VcType},
};

/// Remap outcome for one URL.
#[derive(Debug, Clone)]
pub struct RemapResult {
    /// The rewritten URL
    pub uri: Uri,
    /// Rule allows a Host/SNI mismatch despite the global policy
    pub allow_host_sni_mismatch: bool,
}

/// URL rewrite table collaborator.
pub trait RemapTable {
    /// Rewrite `uri`, or `None` to pass it through unchanged.
    fn remap(&self, uri: &Uri) -> Option<RemapResult>;
}

/// Identity remap.
pub struct NullRemap;

impl RemapTable for NullRemap {
    fn remap(&self, _uri: &Uri) -> Option<RemapResult> {
        None
    }
}

/// Collaborators the machine borrows for one event.
pub struct TxnContext<'a> {
    /// Configuration
    pub config: &'a ProxyConfig,
    /// Global hook registry
    pub registry: &'a HookRegistry,
    /// URL rewrite table
    pub remap: &'a dyn RemapTable,
    /// Outbound session pool
    pub pool: &'a dyn SessionPool,
    /// Origin up/down records
    pub host_status: &'a mut HostStatusMap,
}

/// Timers the machine arms through the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Origin connect budget
    Connect,
    /// Client-side inactivity
    InactivityIn,
    /// Origin-side inactivity
    InactivityOut,
    /// Client-side total budget
    ActiveIn,
    /// Origin-side total budget
    ActiveOut,
    /// Callout lock-retry backoff
    CalloutRetry,
}

/// Body framing of the client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestBodyKind {
    /// No body
    #[default]
    None,
    /// Content-Length framed
    Sized(u64),
    /// Chunked transfer encoding
    Chunked,
}

/// Events delivered to the machine.
#[derive(Debug)]
pub enum TxnEvent {
    /// The edge parsed a complete request header
    RequestHeaderReady {
        /// Request method
        method: Method,
        /// Request target
        uri: Uri,
        /// Client HTTP version
        version: Version,
        /// Request headers
        headers: HeaderMap,
        /// Body framing
        body: RequestBodyKind,
    },
    /// The edge finished buffering (and dechunking) the request body
    RequestBodyComplete {
        /// The complete, dechunked body
        body: Bytes,
    },
    /// A deferred observer re-enabled the transaction
    HookReenabled {
        /// The observer's verdict
        verdict: ObserverVerdict,
    },
    /// Name resolution finished
    DnsResolved {
        /// Lookup outcome
        result: DnsResult,
    },
    /// Cache open-read finished
    CacheReadDone {
        /// Lookup outcome
        result: CacheReadResult,
    },
    /// Cache open-write finished
    CacheWriteDone {
        /// Lock outcome
        result: CacheWriteResult,
    },
    /// A fresh origin connection is established
    OriginConnected {
        /// Runtime connection key
        vc: VcKey,
        /// Whether the origin speaks chunked transfer encoding
        supports_chunked: bool,
    },
    /// The origin connect attempt failed
    OriginConnectFailed {
        /// Phase the failure occurred in
        phase: ConnectFailurePhase,
    },
    /// The origin response header was parsed
    OriginResponseHeader {
        /// Response status
        status: StatusCode,
        /// Response headers
        headers: HeaderMap,
    },
    /// Bytes of origin response body arrived
    OriginBodyBytes {
        /// The bytes
        data: Bytes,
        /// End of stream reached
        eos: bool,
    },
    /// Raw client bytes arrived while a blind tunnel is up
    ClientBytes {
        /// The bytes
        data: Bytes,
        /// Client half closed
        eos: bool,
    },
    /// The client connection died
    ClientAborted,
    /// A timer fired
    TimerFired {
        /// Which timer
        kind: TimerKind,
    },
    /// External shutdown request
    Shutdown,
}

/// Side effects the runtime performs for the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum TxnAction {
    /// Resolve a hostname
    ResolveDns {
        /// Hostname to resolve
        hostname: String,
        /// Destination port
        port: u16,
    },
    /// Open the cache for reading
    CacheOpenRead {
        /// Cache key
        key: CacheKey,
    },
    /// Open the cache for writing
    CacheOpenWrite {
        /// Cache key
        key: CacheKey,
    },
    /// Buffer (and dechunk) the whole request body, then deliver
    /// [`TxnEvent::RequestBodyComplete`]
    BufferRequestBody,
    /// Connect to the origin
    ConnectOrigin {
        /// Resolved address
        addr: SocketAddr,
        /// Connect budget
        timeout: Duration,
    },
    /// Write the request head (and optional buffered body) to the origin
    SendRequestToOrigin {
        /// Origin connection key
        vc: VcKey,
        /// Request method
        method: Method,
        /// Request target
        uri: Uri,
        /// Outbound headers
        headers: HeaderMap,
        /// Buffered body, when one was collected
        body: Option<Bytes>,
    },
    /// Write a response head to the client
    SendResponseToClient {
        /// Status line
        status: StatusCode,
        /// Response headers
        headers: HeaderMap,
        /// Body, `None` when suppressed
        body: Option<Bytes>,
    },
    /// Drain and discard the remaining request body
    DrainRequestBody,
    /// Arm a timer
    SetTimer {
        /// Which timer
        kind: TimerKind,
        /// Delay
        duration: Duration,
    },
    /// Disarm a timer
    ClearTimer {
        /// Which timer
        kind: TimerKind,
    },
    /// Perform tunnel I/O
    Tunnel(TunnelAction),
    /// Store a finished object under `key` (push / internal writes)
    CacheCommit {
        /// Cache key
        key: CacheKey,
        /// The object to store
        object: crate::cache::CachedObject,
    },
    /// Return the origin session to the pool
    ReleaseSession {
        /// The session
        session: ServerSession,
    },
    /// Close the origin connection
    CloseOrigin {
        /// Runtime connection key
        vc: VcKey,
    },
    /// Close the client connection
    CloseClient {
        /// Keep-alive reuse is still allowed
        reuse: bool,
    },
    /// The machine is finished; drop it
    Destroy,
}

/// Where the linear step sequence currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    ReadRequestHdrHook,
    PreRemapHook,
    RemapRequest,
    PostRemapHook,
    WaitForFullBody,
    OsDnsHook,
    DnsLookup,
    CacheLookup,
    ReadCacheHdrHook,
    CacheLookupCompleteHook,
    OriginOpen,
    SendRequestHdrHook,
    SendRequest,
    ServerRead,
    ReadResponseHdrHook,
    CacheWriteOpen,
    SendResponseHdrHook,
    SendResponse,
    Tunneling,
    SmShutdownHook,
    TxnCloseHook,
    Dead,
}

/// Client request view the machine keeps.
#[derive(Debug, Default)]
struct RequestInfo {
    method: Option<Method>,
    uri: Option<Uri>,
    headers: HeaderMap,
    body: RequestBodyKind,
    buffered_body: Option<Bytes>,
    client_chunked: bool,
}

/// Origin response view.
#[derive(Debug, Default)]
struct ResponseInfo {
    status: Option<StatusCode>,
    headers: HeaderMap,
    sent_to_client: bool,
}

/// Origin-side connection state.
#[derive(Debug, Default)]
struct OriginInfo {
    addr: Option<SocketAddr>,
    vc: Option<VcKey>,
    session: Option<ServerSession>,
    supports_chunked: bool,
    connect_attempts: u32,
}

/// The transaction state machine.
pub struct HttpTransaction {
    step: Step,
    reentrancy: u32,
    terminate: bool,
    destroy_emitted: bool,
    callout_status: CalloutStatus,
    dispatcher: HookDispatcher,
    overrides: TxnOverrides,

    client_addr: SocketAddr,
    local_addr: SocketAddr,
    client_sni: Option<String>,
    transparent: bool,

    request: RequestInfo,
    response: ResponseInfo,
    origin: OriginInfo,
    cache_key: Option<CacheKey>,
    cache_action: CacheAction,
    cache_hit: Option<crate::cache::CachedObject>,
    cache_write_ready: bool,

    blind_tunnel: bool,
    push_request: bool,
    redirects_followed: u32,
    /// Fine-grained failure reason, readable after the fact
    pub subcode: crate::error::Subcode,

    /// Endpoint table
    pub vc_table: VcTable,
    tunnel: Tunnel,
    /// Milestone store
    pub milestones: Milestones,

    client_vc: VcKey,
}

impl HttpTransaction {
    /// New transaction for an accepted client connection.
    #[must_use]
    pub fn new(
        client_vc: VcKey,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
        client_sni: Option<String>,
        transparent: bool,
        config: &ProxyConfig,
        now: Instant,
    ) -> Self {
        let mut vc_table = VcTable::new();
        let _ = vc_table.new_entry(client_vc, VcType::Client);
        let mut milestones = Milestones::new(now);
        milestones.record(Milestone::UaBegin, now);

        Self {
            step: Step::Idle,
            reentrancy: 0,
            terminate: false,
            destroy_emitted: false,
            callout_status: CalloutStatus::Idle,
            dispatcher: HookDispatcher::new(),
            overrides: TxnOverrides::default(),
            client_addr,
            local_addr,
            client_sni,
            transparent,
            request: RequestInfo::default(),
            response: ResponseInfo::default(),
            origin: OriginInfo::default(),
            cache_key: None,
            cache_action: CacheAction::None,
            cache_hit: None,
            cache_write_ready: false,
            blind_tunnel: false,
            push_request: false,
            redirects_followed: 0,
            subcode: crate::error::Subcode::None,
            vc_table,
            tunnel: Tunnel::new(
                config.background_fill_enabled,
                config.background_fill_threshold,
            ),
            milestones,
            client_vc,
        }
    }

    /// Register a transaction-local observer.
    pub fn register_observer(&mut self, hook: HookId, observer: crate::hooks::SharedObserver) {
        self.dispatcher.register_local(hook, observer);
    }

    /// Current callout bookkeeping.
    #[must_use]
    pub fn callout_status(&self) -> CalloutStatus {
        self.callout_status
    }

    /// Redirect hops followed so far.
    #[must_use]
    pub fn redirects_followed(&self) -> u32 {
        self.redirects_followed
    }

    /// The cache key this transaction looked up, once known.
    #[must_use]
    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    /// Whether the attached origin connection speaks chunked transfer
    /// encoding.
    #[must_use]
    pub fn origin_supports_chunked(&self) -> bool {
        self.origin.supports_chunked
    }

    /// True while a CONNECT blind tunnel is (or will be) in place.
    #[must_use]
    pub fn is_blind_tunnel(&self) -> bool {
        self.blind_tunnel
    }

    /// True once the machine reached its terminal state.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.step == Step::Dead
    }

    /// Deliver one event. Returns the actions the runtime must perform.
    pub fn handle_event(
        &mut self,
        ctx: &mut TxnContext<'_>,
        event: TxnEvent,
        now: Instant,
    ) -> Vec<TxnAction> {
        self.reentrancy += 1;
        let mut actions = Vec::new();
        self.dispatch(ctx, event, now, &mut actions);
        self.reentrancy -= 1;

        if self.reentrancy == 0 && self.terminate && !self.destroy_emitted {
            self.destroy_emitted = true;
            self.step = Step::Dead;
            self.milestones.record(Milestone::SmFinish, now);
            actions.push(TxnAction::Destroy);
        }
        actions
    }

    fn dispatch(
        &mut self,
        ctx: &mut TxnContext<'_>,
        event: TxnEvent,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        match event {
            TxnEvent::RequestHeaderReady { method, uri, version, headers, body } => {
                self.on_request_header(ctx, method, uri, version, headers, body, now, actions);
            }
            TxnEvent::RequestBodyComplete { body } => {
                self.request.buffered_body = Some(body);
                if self.step == Step::WaitForFullBody {
                    // Re-enter the step; with the body in hand it decides
                    // between the DNS walk and an internal cache write
                    self.advance(ctx, now, actions);
                }
            }
            TxnEvent::HookReenabled { verdict } => {
                self.on_hook_reenabled(ctx, &verdict, now, actions);
            }
            TxnEvent::DnsResolved { result } => self.on_dns(ctx, &result, now, actions),
            TxnEvent::CacheReadDone { result } => self.on_cache_read(ctx, result, now, actions),
            TxnEvent::CacheWriteDone { result } => {
                self.on_cache_write(ctx, &result, now, actions);
            }
            TxnEvent::OriginConnected { vc, supports_chunked } => {
                self.on_origin_connected(ctx, vc, supports_chunked, now, actions);
            }
            TxnEvent::OriginConnectFailed { phase } => {
                self.on_origin_connect_failed(ctx, phase, now, actions);
            }
            TxnEvent::OriginResponseHeader { status, headers } => {
                self.on_origin_response(ctx, status, headers, now, actions);
            }
            TxnEvent::OriginBodyBytes { data, eos } => {
                self.on_origin_body(ctx, &data, eos, now, actions);
            }
            TxnEvent::ClientBytes { data, eos } => {
                self.on_client_bytes(ctx, &data, eos, now, actions);
            }
            TxnEvent::ClientAborted => self.on_client_aborted(ctx, now, actions),
            TxnEvent::TimerFired { kind } => self.on_timer(ctx, kind, now, actions),
            TxnEvent::Shutdown => {
                if self.dispatcher.in_flight() {
                    self.callout_status = CalloutStatus::DeferredClose;
                } else {
                    self.begin_shutdown(ctx, true, now, actions);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request_header(
        &mut self,
        ctx: &mut TxnContext<'_>,
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: RequestBodyKind,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::Idle {
            debug!("request header in non-idle state ignored");
            return;
        }
        self.milestones.record(Milestone::UaFirstRead, now);
        self.milestones.record(Milestone::UaReadHeaderDone, now);

        // Wire-level method rules
        if method == Method::TRACE && body != RequestBodyKind::None {
            self.error_jump(ctx, &ProxyError::MethodNotAcceptable("TRACE with body"), now, actions);
            return;
        }
        if method.as_str() == "PUSH" {
            if !ctx.config.push_enabled {
                self.respond_canned(
                    ctx,
                    StatusCode::FORBIDDEN,
                    "PUSH is not enabled\n",
                    now,
                    actions,
                );
                return;
            }
            self.push_request = true;
        }
        if method == Method::CONNECT {
            self.blind_tunnel = true;
        }
        let scheme_is_https = uri.scheme_str() == Some("https");
        let transport_is_tls = self.client_sni.is_some();
        if scheme_is_https != transport_is_tls && uri.scheme_str().is_some() {
            match ctx.config.scheme_proto_mismatch_policy {
                SchemeProtoMismatchPolicy::Off => {}
                SchemeProtoMismatchPolicy::Warn => {
                    warn!(scheme = ?uri.scheme_str(), tls = transport_is_tls,
                        "request scheme does not match transport");
                }
                SchemeProtoMismatchPolicy::Reject => {
                    self.error_jump(
                        ctx,
                        &ProxyError::ClientParse("scheme does not match transport".into()),
                        now,
                        actions,
                    );
                    return;
                }
            }
        }
        let _ = version;

        self.request.client_chunked = body == RequestBodyKind::Chunked;
        self.request.method = Some(method);
        self.request.uri = Some(uri);
        self.request.headers = headers;
        self.request.body = body;

        self.step = Step::ReadRequestHdrHook;
        actions.push(TxnAction::SetTimer {
            kind: TimerKind::ActiveIn,
            duration: ctx.config.transaction_active_timeout_in,
        });
        self.advance(ctx, now, actions);
    }

    /// Walk the linear step sequence until an async boundary.
    fn advance(&mut self, ctx: &mut TxnContext<'_>, now: Instant, actions: &mut Vec<TxnAction>) {
        loop {
            match self.step {
                Step::Idle | Step::Dead => return,

                Step::ReadRequestHdrHook => {
                    if !self.run_callout(ctx, HookId::ReadRequestHdr, Step::PreRemapHook, now, actions)
                    {
                        return;
                    }
                }
                Step::PreRemapHook => {
                    if !self.run_callout(ctx, HookId::PreRemap, Step::RemapRequest, now, actions) {
                        return;
                    }
                }
                Step::RemapRequest => {
                    let allow_mismatch = self.do_remap(ctx);
                    if let Some(err) =
                        self.check_sni_host(ctx.config.sni_host_policy, allow_mismatch)
                    {
                        self.error_jump(ctx, &err, now, actions);
                        return;
                    }
                    self.step = Step::PostRemapHook;
                }
                Step::PostRemapHook => {
                    if !self.run_callout(ctx, HookId::PostRemap, Step::WaitForFullBody, now, actions)
                    {
                        return;
                    }
                }
                Step::WaitForFullBody => {
                    if self.needs_full_body() && self.request.buffered_body.is_none() {
                        actions.push(TxnAction::BufferRequestBody);
                        return;
                    }
                    // A push writes its body straight into the cache; no
                    // origin is involved
                    if self.push_request {
                        self.cache_key = Some(self.effective_cache_key());
                        self.cache_action = CacheAction::Write;
                        self.milestones.record(Milestone::CacheOpenWriteBegin, now);
                        self.step = Step::CacheWriteOpen;
                        if let Some(key) = self.cache_key.clone() {
                            actions.push(TxnAction::CacheOpenWrite { key });
                        }
                        return;
                    }
                    self.step = Step::OsDnsHook;
                }
                Step::OsDnsHook => {
                    if !self.run_callout(ctx, HookId::OsDns, Step::DnsLookup, now, actions) {
                        return;
                    }
                }
                Step::DnsLookup => {
                    let Some((hostname, port)) = self.origin_target() else {
                        self.error_jump(
                            ctx,
                            &ProxyError::ClientParse("request has no usable host".into()),
                            now,
                            actions,
                        );
                        return;
                    };
                    self.milestones.record(Milestone::DnsLookupBegin, now);
                    actions.push(TxnAction::ResolveDns { hostname, port });
                    return;
                }

                Step::CacheLookup => {
                    let key = self.effective_cache_key();
                    self.cache_key = Some(key.clone());
                    self.milestones.record(Milestone::CacheOpenReadBegin, now);
                    if self.is_cache_lookupable() {
                        actions.push(TxnAction::CacheOpenRead { key });
                        return;
                    }
                    self.milestones.record(Milestone::CacheOpenReadEnd, now);
                    self.step = Step::CacheLookupCompleteHook;
                }
                Step::ReadCacheHdrHook => {
                    if !self.run_callout(
                        ctx,
                        HookId::ReadCacheHdr,
                        Step::CacheLookupCompleteHook,
                        now,
                        actions,
                    ) {
                        return;
                    }
                }
                Step::CacheLookupCompleteHook => {
                    if !self.run_callout(
                        ctx,
                        HookId::CacheLookupComplete,
                        Step::OriginOpen,
                        now,
                        actions,
                    ) {
                        return;
                    }
                }

                Step::OriginOpen => {
                    // A fresh hit short-circuits to the response path
                    if matches!(self.cache_action, CacheAction::Serve | CacheAction::ServeAndUpdate)
                        && self.cache_hit.is_some()
                    {
                        self.step = Step::SendResponseHdrHook;
                        continue;
                    }
                    if self.origin.vc.is_some() {
                        self.step = Step::SendRequestHdrHook;
                        continue;
                    }
                    let Some(addr) = self.origin.addr else {
                        self.error_jump(
                            ctx,
                            &ProxyError::ConnectFailed { attempts: 0 },
                            now,
                            actions,
                        );
                        return;
                    };
                    let (hostname, _) = self.origin_target().unwrap_or_default();

                    // An idle pooled session skips the connect entirely.
                    // Blind tunnels always get a fresh connection.
                    let acquire = if self.blind_tunnel {
                        AcquireResult::NotFound
                    } else {
                        ctx.pool.acquire(
                            &AcquireKey {
                                addr,
                                hostname: hostname.clone(),
                                sni: self.client_sni.clone(),
                                cert_hash: None,
                            },
                            ctx.config.server_session_sharing_match,
                        )
                    };
                    self.milestones.record(Milestone::ServerFirstConnect, now);
                    self.milestones.record(Milestone::ServerConnect, now);
                    match acquire {
                        AcquireResult::Done(session) => {
                            debug!(id = session.id, "reusing pooled origin session");
                            self.origin.vc = Some(session.id);
                            self.origin.supports_chunked = true;
                            let _ = self.vc_table.new_entry(session.id, VcType::Origin);
                            self.origin.session = Some(session);
                            self.milestones.record(Milestone::ServerConnectEnd, now);
                            self.step = Step::SendRequestHdrHook;
                        }
                        AcquireResult::NotFound | AcquireResult::Retry => {
                            self.origin.connect_attempts += 1;
                            actions.push(TxnAction::ConnectOrigin {
                                addr,
                                timeout: self.effective_connect_timeout(ctx.config),
                            });
                            actions.push(TxnAction::SetTimer {
                                kind: TimerKind::Connect,
                                duration: self.effective_connect_timeout(ctx.config),
                            });
                            return;
                        }
                    }
                }
                Step::SendRequestHdrHook => {
                    if !self.run_callout(ctx, HookId::SendRequestHdr, Step::SendRequest, now, actions)
                    {
                        return;
                    }
                }
                Step::SendRequest => {
                    self.emit_origin_request(ctx, now, actions);
                    self.step = Step::ServerRead;
                    actions.push(TxnAction::SetTimer {
                        kind: TimerKind::InactivityOut,
                        duration: self.effective_inactivity_out(ctx.config),
                    });
                    return;
                }
                Step::ServerRead => return,
                Step::ReadResponseHdrHook => {
                    if !self.run_callout(
                        ctx,
                        HookId::ReadResponseHdr,
                        Step::CacheWriteOpen,
                        now,
                        actions,
                    ) {
                        return;
                    }
                }
                Step::CacheWriteOpen => {
                    // An observer may have set a redirect target during
                    // the response-header callout
                    if let Some(target) = self.overrides.redirect_url.take() {
                        if self.redirects_followed < ctx.config.number_of_redirections {
                            self.follow_redirect(ctx, target, now, actions);
                            return;
                        }
                        self.subcode = crate::error::Subcode::NumRedirectionsExceeded;
                    }
                    if self.should_cache_write() {
                        self.milestones.record(Milestone::CacheOpenWriteBegin, now);
                        if let Some(key) = self.cache_key.clone() {
                            actions.push(TxnAction::CacheOpenWrite { key });
                            return;
                        }
                    }
                    self.step = Step::SendResponseHdrHook;
                }
                Step::SendResponseHdrHook => {
                    if !self.run_callout(
                        ctx,
                        HookId::SendResponseHdr,
                        Step::SendResponse,
                        now,
                        actions,
                    ) {
                        return;
                    }
                }
                Step::SendResponse => {
                    self.emit_client_response(ctx, now, actions);
                    if self.tunnel.is_active() {
                        self.step = Step::Tunneling;
                        return;
                    }
                    self.step = Step::SmShutdownHook;
                }
                Step::Tunneling => return,
                Step::SmShutdownHook => {
                    self.milestones.record(Milestone::UaClose, now);
                    self.step = Step::TxnCloseHook;
                }
                Step::TxnCloseHook => {
                    if !self.run_callout(ctx, HookId::TxnClose, Step::Dead, now, actions) {
                        return;
                    }
                    self.finalize(actions);
                    return;
                }
            }
        }
    }

    /// Run a callout; true means the chain completed and `self.step` moved
    /// to `next`. False means the machine parked (retry, deferral) or
    /// jumped elsewhere (error, rewind).
    fn run_callout(
        &mut self,
        ctx: &mut TxnContext<'_>,
        hook: HookId,
        next: Step,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) -> bool {
        self.callout_status = CalloutStatus::InCallout;
        match self.dispatcher.run(ctx.registry, hook, &mut self.overrides, &mut self.milestones, now)
        {
            CalloutProgress::Complete => {
                self.callout_status = CalloutStatus::Idle;
                self.step = next;
                true
            }
            CalloutProgress::Retry => {
                actions.push(TxnAction::SetTimer {
                    kind: TimerKind::CalloutRetry,
                    duration: ctx.config.callout_retry_backoff,
                });
                false
            }
            CalloutProgress::InFlight => false,
            CalloutProgress::Error => {
                self.callout_status = CalloutStatus::Idle;
                if hook == HookId::TxnClose {
                    // Teardown proceeds regardless of observer failures
                    warn!("observer failed at TXN_CLOSE, closing anyway");
                    self.step = next;
                    return true;
                }
                self.error_jump(ctx, &ProxyError::PluginError, now, actions);
                false
            }
            CalloutProgress::Rewind => {
                self.callout_status = CalloutStatus::Idle;
                if hook == HookId::TxnClose {
                    self.step = next;
                    return true;
                }
                self.step = rewind_of(self.step);
                false
            }
        }
    }

    fn on_hook_reenabled(
        &mut self,
        ctx: &mut TxnContext<'_>,
        verdict: &ObserverVerdict,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        let progress = self.dispatcher.resume(
            ctx.registry,
            verdict,
            &mut self.overrides,
            &mut self.milestones,
            now,
        );

        let deferred = self.callout_status;
        match progress {
            CalloutProgress::Complete => {
                self.callout_status = CalloutStatus::Idle;
                let was = self.step;
                // The step the callout guarded resumes through advance()
                self.step = post_callout_step(was);
                if was == Step::TxnCloseHook {
                    self.finalize(actions);
                    return;
                }
                match deferred {
                    CalloutStatus::DeferredClose => {
                        self.begin_shutdown(ctx, false, now, actions);
                    }
                    CalloutStatus::DeferredServerError => {
                        self.error_jump(
                            ctx,
                            &ProxyError::ConnectFailed { attempts: self.origin.connect_attempts },
                            now,
                            actions,
                        );
                    }
                    _ => self.advance(ctx, now, actions),
                }
            }
            CalloutProgress::Error => {
                self.callout_status = CalloutStatus::Idle;
                if self.step == Step::TxnCloseHook {
                    warn!("observer failed at TXN_CLOSE, closing anyway");
                    self.step = Step::Dead;
                    self.finalize(actions);
                    return;
                }
                self.error_jump(ctx, &ProxyError::PluginError, now, actions);
            }
            CalloutProgress::Rewind => {
                self.callout_status = CalloutStatus::Idle;
                if self.step == Step::TxnCloseHook {
                    self.step = Step::Dead;
                    self.finalize(actions);
                    return;
                }
                self.step = rewind_of(self.step);
                self.advance(ctx, now, actions);
            }
            CalloutProgress::Retry => {
                actions.push(TxnAction::SetTimer {
                    kind: TimerKind::CalloutRetry,
                    duration: ctx.config.callout_retry_backoff,
                });
            }
            CalloutProgress::InFlight => {}
        }
    }

    fn do_remap(&mut self, ctx: &mut TxnContext<'_>) -> bool {
        let Some(uri) = &self.request.uri else { return false };
        match ctx.remap.remap(uri) {
            Some(result) => {
                debug!(from = %uri, to = %result.uri, "request remapped");
                self.request.uri = Some(result.uri);
                result.allow_host_sni_mismatch
            }
            None => false,
        }
    }

    fn check_sni_host(&self, policy: SniHostPolicy, allow_mismatch: bool) -> Option<ProxyError> {
        let sni = self.client_sni.as_deref()?;
        let host = self.effective_host()?;
        if host.eq_ignore_ascii_case(sni) {
            return None;
        }
        match policy {
            SniHostPolicy::Off => None,
            SniHostPolicy::Warn => {
                warn!(host, sni, "Host header does not match SNI");
                None
            }
            SniHostPolicy::Enforce => {
                if allow_mismatch {
                    None
                } else {
                    Some(ProxyError::SniHostMismatch {
                        host: host.to_string(),
                        sni: sni.to_string(),
                    })
                }
            }
        }
    }

    fn needs_full_body(&self) -> bool {
        // Chunked request bodies are buffered so a length-framed origin
        // request can carry an exact Content-Length; push bodies are the
        // object being stored
        self.request.client_chunked
            || (self.push_request && self.request.body != RequestBodyKind::None)
    }

    fn origin_target(&self) -> Option<(String, u16)> {
        let uri = self.request.uri.as_ref()?;
        let host = uri
            .host()
            .map(str::to_string)
            .or_else(|| self.effective_host().map(str::to_string))?;
        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
        Some((host, port))
    }

    fn effective_host(&self) -> Option<&str> {
        self.request
            .uri
            .as_ref()
            .and_then(Uri::host)
            .or_else(|| {
                self.request
                    .headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(|h| h.split(':').next().unwrap_or(h))
            })
    }

    fn effective_cache_key(&self) -> CacheKey {
        self.request
            .uri
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn is_cache_lookupable(&self) -> bool {
        matches!(self.request.method, Some(ref m) if *m == Method::GET || *m == Method::HEAD)
    }

    fn on_dns(
        &mut self,
        ctx: &mut TxnContext<'_>,
        result: &DnsResult,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::DnsLookup {
            return;
        }
        self.milestones.record(Milestone::DnsLookupEnd, now);

        match result {
            DnsResult::Resolved(addrs) => {
                let Some((_, port)) = self.origin_target() else {
                    self.error_jump(
                        ctx,
                        &ProxyError::ClientParse("request has no usable host".into()),
                        now,
                        actions,
                    );
                    return;
                };
                let Some(ip) = addrs.first().copied() else {
                    self.error_jump(ctx, &ProxyError::ConnectFailed { attempts: 0 }, now, actions);
                    return;
                };
                let addr = SocketAddr::new(ip, port);

                // Connecting back to our own inbound listener would loop
                if addr == self.local_addr && !self.transparent {
                    self.subcode = crate::error::Subcode::SelfLoopDetected;
                    self.error_jump(ctx, &ProxyError::SelfLoop, now, actions);
                    return;
                }

                let (hostname, _) = self.origin_target().unwrap_or_default();
                if ctx.host_status.is_down(&hostname, port, now)
                    && self.origin.connect_attempts
                        >= ctx.config.connect_attempts_max_retries_down_server
                {
                    self.error_jump(
                        ctx,
                        &ProxyError::ConnectFailed { attempts: self.origin.connect_attempts },
                        now,
                        actions,
                    );
                    return;
                }

                self.origin.addr = Some(addr);
                self.step = Step::CacheLookup;
                self.advance(ctx, now, actions);
            }
            DnsResult::NotFound | DnsResult::ServFail => {
                self.error_jump(ctx, &ProxyError::ConnectFailed { attempts: 0 }, now, actions);
            }
        }
    }

    fn on_cache_read(
        &mut self,
        ctx: &mut TxnContext<'_>,
        result: CacheReadResult,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::CacheLookup {
            return;
        }
        self.milestones.record(Milestone::CacheOpenReadEnd, now);

        match result {
            CacheReadResult::Hit(object) => {
                self.cache_action = CacheAction::Serve;
                self.cache_hit = Some(object);
                self.step = Step::ReadCacheHdrHook;
            }
            CacheReadResult::HitStale(object) => {
                self.cache_action = CacheAction::Update;
                self.cache_hit = Some(object);
                self.step = Step::ReadCacheHdrHook;
            }
            CacheReadResult::Miss => {
                self.cache_action = CacheAction::Write;
                self.step = Step::CacheLookupCompleteHook;
            }
            CacheReadResult::Error(reason) => {
                // A broken cache read degrades to an origin fetch
                debug!(%reason, "cache read error, treating as miss");
                self.cache_action = CacheAction::None;
                self.step = Step::CacheLookupCompleteHook;
            }
        }
        self.advance(ctx, now, actions);
    }

    fn on_cache_write(
        &mut self,
        ctx: &mut TxnContext<'_>,
        result: &CacheWriteResult,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::CacheWriteOpen {
            return;
        }
        self.milestones.record(Milestone::CacheOpenWriteEnd, now);

        // An internal (push) write commits the buffered body directly
        if self.push_request {
            match result {
                CacheWriteResult::Ready => {
                    if let Some(key) = self.cache_key.clone() {
                        actions.push(TxnAction::CacheCommit {
                            key,
                            object: crate::cache::CachedObject {
                                status: StatusCode::OK,
                                headers: self.request.headers.clone(),
                                body: self.request.buffered_body.clone().unwrap_or_default(),
                                request_sent_time: 0,
                                response_received_time: 0,
                            },
                        });
                    }
                    self.respond_canned(ctx, StatusCode::OK, "stored\n", now, actions);
                }
                CacheWriteResult::LockContended | CacheWriteResult::Error(_) => {
                    self.error_jump(
                        ctx,
                        &ProxyError::CacheReadFailed("push write unavailable".into()),
                        now,
                        actions,
                    );
                }
            }
            return;
        }

        match result {
            CacheWriteResult::Ready => {
                self.cache_write_ready = true;
            }
            CacheWriteResult::LockContended | CacheWriteResult::Error(_) => {
                match on_write_fail(
                    ctx.config.cache_open_write_fail_action,
                    self.cache_action == CacheAction::Update,
                ) {
                    WriteFailPath::FetchUncached | WriteFailPath::ReadRetry => {
                        // Serve without caching; read-retry degenerates to
                        // the same path once the origin read has started
                        self.cache_write_ready = false;
                        self.cache_action = CacheAction::None;
                    }
                    WriteFailPath::Error => {
                        self.error_jump(
                            ctx,
                            &ProxyError::CacheReadFailed("write lock unavailable".into()),
                            now,
                            actions,
                        );
                        return;
                    }
                }
            }
        }
        self.step = Step::SendResponseHdrHook;
        self.advance(ctx, now, actions);
    }

    fn on_origin_connected(
        &mut self,
        ctx: &mut TxnContext<'_>,
        vc: VcKey,
        supports_chunked: bool,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::OriginOpen {
            debug!("origin connected in unexpected state");
            return;
        }
        actions.push(TxnAction::ClearTimer { kind: TimerKind::Connect });
        self.milestones.record(Milestone::ServerConnectEnd, now);

        let (hostname, port) = self.origin_target().unwrap_or_default();
        ctx.host_status.record_success(&hostname, port);

        self.origin.vc = Some(vc);
        self.origin.supports_chunked = supports_chunked;
        let _ = self.vc_table.new_entry(vc, VcType::Origin);
        if let Some(addr) = self.origin.addr {
            self.origin.session = Some(ServerSession {
                id: vc,
                addr,
                hostname,
                sni: self.client_sni.clone(),
                cert_hash: None,
                private: self.is_session_private(),
                transact_count: 1,
            });
        }

        if self.blind_tunnel {
            self.start_blind_tunnel(ctx, vc, now, actions);
            return;
        }

        self.step = Step::SendRequestHdrHook;
        self.advance(ctx, now, actions);
    }

    /// CONNECT: answer 200 and splice the two endpoints byte-for-byte.
    fn start_blind_tunnel(
        &mut self,
        ctx: &mut TxnContext<'_>,
        origin_vc: VcKey,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        // A blind-tunneled connection must never be pooled
        if let Some(session) = &mut self.origin.session {
            session.private = true;
        }

        self.milestones.record(Milestone::UaBeginWrite, now);
        self.response.sent_to_client = true;
        actions.push(TxnAction::SendResponseToClient {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
        });

        let chunk_size = ctx.config.chunk_size;
        self.tunnel.add_producer(
            origin_vc,
            crate::tunnel::ChunkingAction::PassthruDechunkedContent,
            None,
            chunk_size,
        );
        self.tunnel.add_consumer(origin_vc, self.client_vc, crate::tunnel::ConsumerRole::Client);
        self.tunnel.add_producer(
            self.client_vc,
            crate::tunnel::ChunkingAction::PassthruDechunkedContent,
            None,
            chunk_size,
        );
        self.tunnel.add_consumer(self.client_vc, origin_vc, crate::tunnel::ConsumerRole::Origin);
        self.tunnel.tunnel_run();
        self.step = Step::Tunneling;
    }

    fn is_session_private(&self) -> bool {
        let method = self.request.method.clone().unwrap_or(Method::GET);
        ServerSession::is_request_private(
            &method,
            &self.request.headers,
            true,
            self.overrides.session_private,
        ) || self.overrides.session_private
    }

    fn on_origin_connect_failed(
        &mut self,
        ctx: &mut TxnContext<'_>,
        phase: ConnectFailurePhase,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.dispatcher.in_flight() {
            self.callout_status = CalloutStatus::DeferredServerError;
            return;
        }
        actions.push(TxnAction::ClearTimer { kind: TimerKind::Connect });

        let (hostname, port) = self.origin_target().unwrap_or_default();
        if let Some(addr) = self.origin.addr {
            ctx.host_status.record_failure(
                &hostname,
                addr,
                phase,
                ctx.config.connect_down_policy,
                ctx.config.mark_down_threshold,
                ctx.config.down_server_timeout,
                now,
            );
        }

        let budget = if ctx.host_status.is_down(&hostname, port, now) {
            ctx.config.connect_attempts_max_retries_down_server
        } else {
            ctx.config.connect_attempts_max_retries
        };
        if self.origin.connect_attempts < budget {
            self.milestones.clear(Milestone::ServerConnect);
            self.milestones.record(Milestone::ServerConnect, now);
            self.origin.connect_attempts += 1;
            if let Some(addr) = self.origin.addr {
                actions.push(TxnAction::ConnectOrigin {
                    addr,
                    timeout: self.effective_connect_timeout(ctx.config),
                });
                actions.push(TxnAction::SetTimer {
                    kind: TimerKind::Connect,
                    duration: self.effective_connect_timeout(ctx.config),
                });
                return;
            }
        }

        self.error_jump(
            ctx,
            &ProxyError::ConnectFailed { attempts: self.origin.connect_attempts },
            now,
            actions,
        );
    }

    fn emit_origin_request(
        &mut self,
        ctx: &mut TxnContext<'_>,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        let Some(vc) = self.origin.vc else { return };
        let method = self.request.method.clone().unwrap_or(Method::GET);
        let uri = self.request.uri.clone().unwrap_or_default();

        let mut headers =
            copy_header_fields(&self.request.headers, ctx.config.retain_proxy_auth, None);
        normalize_accept_encoding(&mut headers, ctx.config.normalize_ae);
        remove_privacy_headers(&mut headers, ctx.config);
        insert_via_header(
            &mut headers,
            ctx.config,
            ViaDirection::Request,
            &["http/1.1", "tcp"],
            "",
        );
        crate::headers::forwarded::add_forwarded_field(
            &mut headers,
            ctx.config,
            &crate::headers::forwarded::ForwardedContext {
                client_addr: self.client_addr,
                local_addr: self.local_addr,
                host: self.effective_host(),
                protocol_stack: &["http/1.1", "tcp"],
            },
        );

        // A buffered chunked body goes out length-framed; the proxy
        // answered any Expect itself while buffering
        let body = self.request.buffered_body.clone();
        if let Some(buffered) = &body {
            headers.remove(header::TRANSFER_ENCODING);
            if let Ok(value) = http::HeaderValue::from_str(&buffered.len().to_string()) {
                headers.insert(header::CONTENT_LENGTH, value);
            }
            remove_100_continue_header(&mut headers);
        }

        self.milestones.record(Milestone::ServerBeginWrite, now);
        actions.push(TxnAction::SendRequestToOrigin { vc, method, uri, headers, body });
    }

    fn on_origin_response(
        &mut self,
        ctx: &mut TxnContext<'_>,
        status: StatusCode,
        headers: HeaderMap,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::ServerRead {
            debug!("origin response in unexpected state");
            return;
        }
        actions.push(TxnAction::ClearTimer { kind: TimerKind::InactivityOut });
        self.milestones.record(Milestone::ServerFirstRead, now);
        self.milestones.record(Milestone::ServerReadHeaderDone, now);

        // Redirect following, when configured
        if is_redirect(status)
            && headers.contains_key(header::LOCATION)
            && ctx.config.number_of_redirections > 0
        {
            if self.redirects_followed < ctx.config.number_of_redirections {
                if let Some(location) = headers
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Uri>().ok())
                {
                    self.follow_redirect(ctx, location, now, actions);
                    return;
                }
            } else {
                // Chain exhausted: the current response goes back as-is
                self.subcode = crate::error::Subcode::NumRedirectionsExceeded;
            }
        }

        self.response.status = Some(status);
        self.response.headers = headers;
        self.step = Step::ReadResponseHdrHook;
        self.advance(ctx, now, actions);
    }

    fn follow_redirect(
        &mut self,
        ctx: &mut TxnContext<'_>,
        location: Uri,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        self.redirects_followed += 1;
        debug!(hop = self.redirects_followed, to = %location, "following redirect");

        // Clear origin state so the next round resolves fresh
        if let Some(vc) = self.origin.vc.take() {
            if let Some(id) = self.vc_table.find(vc) {
                let _ = self.vc_table.cleanup_entry(id);
            }
            actions.push(TxnAction::CloseOrigin { vc });
        }
        self.origin.session = None;
        self.origin.addr = None;
        self.origin.connect_attempts = 0;
        self.cache_hit = None;
        self.cache_action = CacheAction::None;
        self.milestones.clear(Milestone::ServerBeginWrite);
        self.milestones.clear(Milestone::ServerFirstRead);
        self.milestones.clear(Milestone::ServerReadHeaderDone);
        self.milestones.clear(Milestone::DnsLookupBegin);
        self.milestones.clear(Milestone::DnsLookupEnd);

        let rewritten = merge_redirect_target(self.request.uri.as_ref(), &location);
        self.request.uri = Some(rewritten);

        // Redirects re-enter the machine at request handling
        self.step = Step::PreRemapHook;
        self.advance(ctx, now, actions);
    }

    fn should_cache_write(&self) -> bool {
        if !self.cache_write_ready
            && matches!(self.cache_action, CacheAction::Write | CacheAction::Update)
        {
            let cacheable = self
                .response
                .status
                .is_some_and(|s| s == StatusCode::OK || s == StatusCode::NOT_MODIFIED);
            return cacheable;
        }
        false
    }

    fn emit_client_response(
        &mut self,
        ctx: &mut TxnContext<'_>,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        self.milestones.record(Milestone::UaBeginWrite, now);

        let serving_from_cache = matches!(
            self.cache_action,
            CacheAction::Serve | CacheAction::ServeAndUpdate | CacheAction::ServeAndDelete
        );
        let (status, mut headers, body) = if serving_from_cache
            && let Some(hit) = self.cache_hit.take()
        {
            let mut headers = copy_header_fields(&hit.headers, false, None);
            let date_value = hit
                .headers
                .get(header::DATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_http_date)
                .unwrap_or(0);
            let age_value = hit
                .headers
                .get(header::AGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
                .unwrap_or(0);
            // Resident time is charged by the runtime, which knows wall
            // time; here the age reflects the stored object only
            insert_time_and_age_headers(
                &mut headers,
                hit.request_sent_time,
                hit.response_received_time,
                date_value,
                age_value,
                hit.response_received_time,
            );
            (hit.status, headers, Some(hit.body))
        } else {
            let status = self.response.status.unwrap_or(StatusCode::BAD_GATEWAY);
            let headers = copy_header_fields(&self.response.headers, false, None);
            (status, headers, None)
        };

        insert_via_header(
            &mut headers,
            ctx.config,
            ViaDirection::Response,
            &["http/1.1"],
            "",
        );
        add_server_header(&mut headers, ctx.config);
        if self.client_sni.is_some() {
            crate::headers::transform::insert_hsts_header(&mut headers, ctx.config);
        }

        // Unconsumed request body forces drain-or-close
        match self.pending_body_disposition(ctx.config) {
            BodyDisposition::Drain => actions.push(TxnAction::DrainRequestBody),
            BodyDisposition::Close => add_connection_close(&mut headers),
            BodyDisposition::Consumed => {}
        }

        // The tunnel's re-framing decision shows up on the response head
        if self.origin.vc.is_some() && self.response.status.is_some() {
            match self.response_chunking_action() {
                crate::tunnel::ChunkingAction::ChunkContent => {
                    headers.remove(header::CONTENT_LENGTH);
                    headers.insert(
                        header::TRANSFER_ENCODING,
                        http::HeaderValue::from_static("chunked"),
                    );
                }
                crate::tunnel::ChunkingAction::DechunkContent => {
                    headers.remove(header::TRANSFER_ENCODING);
                }
                _ => {}
            }
        }

        let body = if status_suppresses_body(status) { None } else { body };
        self.response.sent_to_client = true;
        actions.push(TxnAction::SendResponseToClient { status, headers, body });

        // Origin body, if one is coming, flows through the tunnel
        if self.origin.vc.is_some() && self.response.status.is_some() {
            self.start_response_tunnel(ctx);
        }
    }

    fn response_chunking_action(&self) -> crate::tunnel::ChunkingAction {
        let content_length = self
            .response
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let origin_chunked = self
            .response
            .headers
            .get(header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        // The client edge is HTTP/1.1 and accepts chunked
        select_chunking_action(origin_chunked, true, content_length.is_some())
    }

    fn start_response_tunnel(&mut self, ctx: &mut TxnContext<'_>) {
        let Some(origin_vc) = self.origin.vc else { return };
        let content_length = self
            .response
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let action = self.response_chunking_action();
        self.tunnel
            .add_producer(origin_vc, action, content_length, ctx.config.chunk_size);
        self.tunnel.add_consumer(
            origin_vc,
            self.client_vc,
            crate::tunnel::ConsumerRole::Client,
        );
        if self.cache_write_ready {
            // Cache-write consumer key: the origin vc tagged into cache
            self.tunnel.add_consumer(
                origin_vc,
                CACHE_WRITE_VC,
                crate::tunnel::ConsumerRole::CacheWrite,
            );
        }
        if let Some(entry) = self.vc_table.find(origin_vc).and_then(|id| self.vc_table.get_mut(id))
        {
            entry.in_tunnel = true;
        }
        self.tunnel.tunnel_run();
    }

    fn on_origin_body(
        &mut self,
        ctx: &mut TxnContext<'_>,
        data: &Bytes,
        eos: bool,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::Tunneling {
            return;
        }
        let Some(origin_vc) = self.origin.vc else { return };

        let mut tunnel_actions = Vec::new();
        let mut events = Vec::new();
        if !data.is_empty() {
            self.tunnel
                .handle_bytes(origin_vc, data, &mut tunnel_actions, &mut events);
        }
        if eos {
            self.tunnel.handle_eos(origin_vc, &mut tunnel_actions, &mut events);
        }
        actions.extend(tunnel_actions.into_iter().map(TxnAction::Tunnel));

        for event in events {
            self.on_tunnel_event(ctx, &event, now, actions);
        }
    }

    fn on_client_bytes(
        &mut self,
        ctx: &mut TxnContext<'_>,
        data: &Bytes,
        eos: bool,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step != Step::Tunneling || !self.blind_tunnel {
            return;
        }
        let mut tunnel_actions = Vec::new();
        let mut events = Vec::new();
        if !data.is_empty() {
            self.tunnel
                .handle_bytes(self.client_vc, data, &mut tunnel_actions, &mut events);
        }
        if eos {
            self.tunnel.handle_eos(self.client_vc, &mut tunnel_actions, &mut events);
        }
        actions.extend(tunnel_actions.into_iter().map(TxnAction::Tunnel));
        for event in events {
            self.on_tunnel_event(ctx, &event, now, actions);
        }
    }

    fn on_tunnel_event(
        &mut self,
        ctx: &mut TxnContext<'_>,
        event: &TunnelEvent,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        match event {
            TunnelEvent::Done { .. } => {
                self.release_or_close_origin(ctx, true, now, actions);
                self.step = Step::SmShutdownHook;
                self.advance(ctx, now, actions);
            }
            TunnelEvent::ParseError { .. } => {
                // Origin body framing broke mid-stream: the inbound
                // connection closes to signal truncation
                self.release_or_close_origin(ctx, false, now, actions);
                actions.push(TxnAction::CloseClient { reuse: false });
                self.begin_shutdown(ctx, false, now, actions);
            }
            TunnelEvent::Precomplete { bytes_seen, expected, .. } => {
                debug!(bytes_seen, expected, "origin truncated the response body");
                self.release_or_close_origin(ctx, false, now, actions);
                actions.push(TxnAction::CloseClient { reuse: false });
                self.begin_shutdown(ctx, false, now, actions);
            }
            TunnelEvent::ConsumerDetach { .. } => {
                self.release_or_close_origin(ctx, false, now, actions);
                self.begin_shutdown(ctx, false, now, actions);
            }
        }
    }

    fn release_or_close_origin(
        &mut self,
        ctx: &mut TxnContext<'_>,
        clean: bool,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        self.milestones.record(Milestone::ServerClose, now);
        if let Some(vc) = self.origin.vc.take() {
            if let Some(id) = self.vc_table.find(vc) {
                let _ = self.vc_table.cleanup_entry(id);
            }
            match self.origin.session.take() {
                Some(session) if clean && !session.private => {
                    ctx.pool
                        .release(session.clone(), ctx.config.server_session_sharing_match);
                    actions.push(TxnAction::ReleaseSession { session });
                }
                _ => actions.push(TxnAction::CloseOrigin { vc }),
            }
        }
    }

    fn on_client_aborted(
        &mut self,
        ctx: &mut TxnContext<'_>,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.step == Step::Tunneling {
            let mut tunnel_actions = Vec::new();
            let mut events = Vec::new();
            self.tunnel
                .handle_consumer_death(self.client_vc, &mut tunnel_actions, &mut events);
            actions.extend(tunnel_actions.into_iter().map(TxnAction::Tunnel));
            for event in events {
                self.on_tunnel_event(ctx, &event, now, actions);
            }
            return;
        }
        if self.dispatcher.in_flight() {
            self.callout_status = CalloutStatus::DeferredClose;
            return;
        }
        self.begin_shutdown(ctx, false, now, actions);
    }

    fn on_timer(
        &mut self,
        ctx: &mut TxnContext<'_>,
        kind: TimerKind,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        match kind {
            TimerKind::CalloutRetry => {
                // Retry the parked callout step
                self.advance(ctx, now, actions);
            }
            TimerKind::Connect => {
                self.on_origin_connect_failed(ctx, ConnectFailurePhase::PreTls, now, actions);
            }
            TimerKind::InactivityIn | TimerKind::InactivityOut => {
                let err = ProxyError::InactivityTimeout {
                    elapsed: self.effective_inactivity_out(ctx.config),
                    response_started: self.response.sent_to_client,
                };
                if self.response.sent_to_client {
                    actions.push(TxnAction::CloseClient { reuse: false });
                    self.begin_shutdown(ctx, false, now, actions);
                } else {
                    self.error_jump(ctx, &err, now, actions);
                }
            }
            TimerKind::ActiveIn | TimerKind::ActiveOut => {
                let err = ProxyError::ActiveTimeout {
                    budget: ctx.config.transaction_active_timeout_in,
                };
                if self.response.sent_to_client {
                    actions.push(TxnAction::CloseClient { reuse: false });
                    self.begin_shutdown(ctx, false, now, actions);
                } else {
                    self.error_jump(ctx, &err, now, actions);
                }
            }
        }
    }

    /// The error-jump entry: build the canned response and transition to
    /// the response-send step.
    fn error_jump(
        &mut self,
        ctx: &mut TxnContext<'_>,
        error: &ProxyError,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if self.response.sent_to_client {
            // Too late for a clean error response; just close
            actions.push(TxnAction::CloseClient { reuse: false });
            self.begin_shutdown(ctx, false, now, actions);
            return;
        }
        warn!(%error, "transaction failed");
        if self.subcode == crate::error::Subcode::None {
            self.subcode = error.subcode();
        }
        self.respond_canned(ctx, error.status(), &error.canned_body(), now, actions);
    }

    fn respond_canned(
        &mut self,
        ctx: &mut TxnContext<'_>,
        status: StatusCode,
        body: &str,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
        add_server_header(&mut headers, ctx.config);

        match self.pending_body_disposition(ctx.config) {
            BodyDisposition::Drain => actions.push(TxnAction::DrainRequestBody),
            BodyDisposition::Close => add_connection_close(&mut headers),
            BodyDisposition::Consumed => {}
        }

        self.milestones.record(Milestone::UaBeginWrite, now);
        self.response.sent_to_client = true;
        let body =
            (!status_suppresses_body(status)).then(|| Bytes::copy_from_slice(body.as_bytes()));
        actions.push(TxnAction::SendResponseToClient { status, headers, body });
        self.begin_shutdown(ctx, false, now, actions);
    }

    fn pending_body_disposition(&self, config: &ProxyConfig) -> BodyDisposition {
        if self.request.buffered_body.is_some() {
            return BodyDisposition::Consumed;
        }
        match self.request.body {
            RequestBodyKind::None => BodyDisposition::Consumed,
            // Chunked bodies always force close
            RequestBodyKind::Chunked => BodyDisposition::Close,
            RequestBodyKind::Sized(len) => {
                if len as usize <= config.max_drain_body_size {
                    BodyDisposition::Drain
                } else {
                    BodyDisposition::Close
                }
            }
        }
    }

    fn begin_shutdown(
        &mut self,
        ctx: &mut TxnContext<'_>,
        external: bool,
        now: Instant,
        actions: &mut Vec<TxnAction>,
    ) {
        if matches!(self.step, Step::SmShutdownHook | Step::TxnCloseHook | Step::Dead) {
            return;
        }
        if external {
            debug!("external shutdown requested");
        }
        if self.origin.vc.is_some() {
            self.release_or_close_origin(ctx, false, now, actions);
        }
        self.step = Step::SmShutdownHook;
        self.advance(ctx, now, actions);
    }

    fn finalize(&mut self, actions: &mut Vec<TxnAction>) {
        // Tear down every remaining endpoint through the single cleanup
        // path
        let ids: Vec<_> = self.vc_table.ids().collect();
        for id in ids {
            let _ = self.vc_table.cleanup_entry(id);
        }
        for kind in [
            TimerKind::Connect,
            TimerKind::InactivityIn,
            TimerKind::InactivityOut,
            TimerKind::ActiveIn,
            TimerKind::ActiveOut,
        ] {
            actions.push(TxnAction::ClearTimer { kind });
        }
        self.terminate = true;
    }

    fn effective_connect_timeout(&self, config: &ProxyConfig) -> Duration {
        // An observer-set override wins over configuration
        self.overrides
            .connect_timeout
            .unwrap_or(config.connect_attempts_timeout)
    }

    fn effective_inactivity_out(&self, config: &ProxyConfig) -> Duration {
        self.overrides
            .no_activity_timeout_out
            .unwrap_or(config.transaction_no_activity_timeout_out)
    }
}

/// Cache-write consumer key within the tunnel (not a real endpoint).
const CACHE_WRITE_VC: VcKey = u64::MAX;

#[derive(Debug, PartialEq, Eq)]
enum BodyDisposition {
    Consumed,
    Drain,
    Close,
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        300 | 301 | 302 | 303 | 305 | 307 | 308
    )
}

/// Resolve a Location target against the current request URL.
fn merge_redirect_target(current: Option<&Uri>, location: &Uri) -> Uri {
    if location.scheme().is_some() && location.host().is_some() {
        return location.clone();
    }
    // Relative Location: keep scheme and authority
    let Some(base) = current else { return location.clone() };
    let mut parts = http::uri::Parts::default();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    parts.path_and_query = location.path_and_query().cloned();
    Uri::from_parts(parts).unwrap_or_else(|_| location.clone())
}

/// The step a callout guards transitions into once the chain completes.
fn post_callout_step(step: Step) -> Step {
    match step {
        Step::ReadRequestHdrHook => Step::PreRemapHook,
        Step::PreRemapHook => Step::RemapRequest,
        Step::PostRemapHook => Step::WaitForFullBody,
        Step::OsDnsHook => Step::DnsLookup,
        Step::ReadCacheHdrHook => Step::CacheLookupCompleteHook,
        Step::CacheLookupCompleteHook => Step::OriginOpen,
        Step::SendRequestHdrHook => Step::SendRequest,
        Step::ReadResponseHdrHook => Step::CacheWriteOpen,
        Step::SendResponseHdrHook => Step::SendResponse,
        Step::TxnCloseHook => Step::Dead,
        other => other,
    }
}

/// One step back, for the observer rewind primitive.
fn rewind_of(step: Step) -> Step {
    match step {
        Step::PreRemapHook => Step::ReadRequestHdrHook,
        Step::RemapRequest | Step::PostRemapHook => Step::PreRemapHook,
        Step::OsDnsHook => Step::PostRemapHook,
        Step::DnsLookup => Step::OsDnsHook,
        Step::CacheLookupCompleteHook => Step::CacheLookup,
        Step::SendRequestHdrHook => Step::OriginOpen,
        Step::SendResponseHdrHook => Step::ReadResponseHdrHook,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::session::InMemorySessionPool;

    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig { push_enabled: false, ..ProxyConfig::default() }
    }

    struct Ctx {
        config: ProxyConfig,
        registry: HookRegistry,
        pool: InMemorySessionPool,
        host_status: HostStatusMap,
    }

    impl Ctx {
        fn new(config: ProxyConfig) -> Self {
            Self {
                config,
                registry: HookRegistry::new(),
                pool: InMemorySessionPool::new(),
                host_status: HostStatusMap::new(),
            }
        }

        fn borrow<'a>(&'a mut self, remap: &'a dyn RemapTable) -> TxnContext<'a> {
            TxnContext {
                config: &self.config,
                registry: &self.registry,
                remap,
                pool: &self.pool,
                host_status: &mut self.host_status,
            }
        }
    }

    fn txn(config: &ProxyConfig) -> HttpTransaction {
        HttpTransaction::new(
            1,
            "203.0.113.5:41000".parse().unwrap(),
            "192.0.2.1:8080".parse().unwrap(),
            None,
            false,
            config,
            Instant::now(),
        )
    }

    fn request_event(method: Method, uri: &str, body: RequestBodyKind) -> TxnEvent {
        TxnEvent::RequestHeaderReady {
            method,
            uri: uri.parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body,
        }
    }

    fn response_of(actions: &[TxnAction]) -> Option<(StatusCode, bool)> {
        actions.iter().find_map(|a| match a {
            TxnAction::SendResponseToClient { status, body, .. } => {
                Some((*status, body.is_some()))
            }
            _ => None,
        })
    }

    #[test]
    fn get_request_walks_to_dns() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);

        let actions = txn.handle_event(
            &mut ctx,
            request_event(Method::GET, "http://origin.example.com/x", RequestBodyKind::None),
            Instant::now(),
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            TxnAction::ResolveDns { hostname, port: 80 } if hostname == "origin.example.com"
        )));
    }

    #[test]
    fn trace_with_body_rejected() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);

        let actions = txn.handle_event(
            &mut ctx,
            request_event(Method::TRACE, "http://h.example.com/", RequestBodyKind::Sized(10)),
            Instant::now(),
        );
        let (status, _) = response_of(&actions).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        // The short body gets drained, not a forced close
        assert!(actions.contains(&TxnAction::DrainRequestBody));
    }

    #[test]
    fn push_disabled_means_403() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);

        let actions = txn.handle_event(
            &mut ctx,
            request_event(
                Method::from_bytes(b"PUSH").unwrap(),
                "http://h.example.com/",
                RequestBodyKind::None,
            ),
            Instant::now(),
        );
        let (status, _) = response_of(&actions).unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn self_loop_rejected_without_origin_connect() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);
        let now = Instant::now();

        let _ = txn.handle_event(
            &mut ctx,
            request_event(Method::GET, "http://127.0.0.1:8080/", RequestBodyKind::None),
            now,
        );
        // Resolver hands back our own inbound address
        txn.local_addr_for_tests("127.0.0.1:8080");
        let actions = txn.handle_event(
            &mut ctx,
            TxnEvent::DnsResolved {
                result: DnsResult::Resolved(vec!["127.0.0.1".parse::<IpAddr>().unwrap()]),
            },
            now,
        );

        let (status, has_body) = response_of(&actions).unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(has_body);
        assert_eq!(txn.subcode, crate::error::Subcode::SelfLoopDetected);
        assert!(!actions.iter().any(|a| matches!(a, TxnAction::ConnectOrigin { .. })));
    }

    #[test]
    fn chunked_body_buffered_before_dns() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);
        let now = Instant::now();

        let actions = txn.handle_event(
            &mut ctx,
            request_event(Method::POST, "http://h.example.com/upload", RequestBodyKind::Chunked),
            now,
        );
        assert!(actions.contains(&TxnAction::BufferRequestBody));
        assert!(!actions.iter().any(|a| matches!(a, TxnAction::ResolveDns { .. })));

        let actions = txn.handle_event(
            &mut ctx,
            TxnEvent::RequestBodyComplete { body: Bytes::from_static(b"hello body") },
            now,
        );
        assert!(actions.iter().any(|a| matches!(a, TxnAction::ResolveDns { .. })));
    }

    #[test]
    fn buffered_chunked_body_goes_out_length_framed() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);
        let now = Instant::now();

        let _ = txn.handle_event(
            &mut ctx,
            request_event(Method::POST, "http://h.example.com/upload", RequestBodyKind::Chunked),
            now,
        );
        let _ = txn.handle_event(
            &mut ctx,
            TxnEvent::RequestBodyComplete { body: Bytes::from_static(b"0123456789") },
            now,
        );
        let _ = txn.handle_event(
            &mut ctx,
            TxnEvent::DnsResolved {
                result: DnsResult::Resolved(vec!["192.0.2.200".parse::<IpAddr>().unwrap()]),
            },
            now,
        );
        // POST skips the cache lookup and goes straight to origin open
        let actions = txn.handle_event(
            &mut ctx,
            TxnEvent::OriginConnected { vc: 7, supports_chunked: false },
            now,
        );

        let sent = actions.iter().find_map(|a| match a {
            TxnAction::SendRequestToOrigin { headers, body, .. } => {
                Some((headers.clone(), body.clone()))
            }
            _ => None,
        });
        let (headers, body) = sent.unwrap();
        assert_eq!(body.unwrap().as_ref(), b"0123456789");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "10");
        assert!(!headers.contains_key(header::TRANSFER_ENCODING));
    }

    #[test]
    fn sni_host_mismatch_enforced_after_remap() {
        let mut cfg = config();
        cfg.sni_host_policy = SniHostPolicy::Enforce;
        let mut env = Ctx::new(cfg);
        let mut ctx = env.borrow(&NullRemap);

        let mut txn = HttpTransaction::new(
            1,
            "203.0.113.5:41000".parse().unwrap(),
            "192.0.2.1:8443".parse().unwrap(),
            Some("tls.example.com".to_string()),
            false,
            ctx.config,
            Instant::now(),
        );

        let actions = txn.handle_event(
            &mut ctx,
            request_event(Method::GET, "https://other.example.com/", RequestBodyKind::None),
            Instant::now(),
        );
        let (status, _) = response_of(&actions).unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn remap_rule_can_allow_sni_mismatch() {
        struct AllowRemap;
        impl RemapTable for AllowRemap {
            fn remap(&self, uri: &Uri) -> Option<RemapResult> {
                Some(RemapResult { uri: uri.clone(), allow_host_sni_mismatch: true })
            }
        }

        let mut cfg = config();
        cfg.sni_host_policy = SniHostPolicy::Enforce;
        let mut env = Ctx::new(cfg);
        let mut ctx = env.borrow(&AllowRemap);

        let mut txn = HttpTransaction::new(
            1,
            "203.0.113.5:41000".parse().unwrap(),
            "192.0.2.1:8443".parse().unwrap(),
            Some("tls.example.com".to_string()),
            false,
            ctx.config,
            Instant::now(),
        );

        let actions = txn.handle_event(
            &mut ctx,
            request_event(Method::GET, "https://other.example.com/", RequestBodyKind::None),
            Instant::now(),
        );
        // The rule overrode the policy, so the walk reached DNS
        assert!(actions.iter().any(|a| matches!(a, TxnAction::ResolveDns { .. })));
    }

    #[test]
    fn destroy_only_at_zero_reentrancy_with_terminate() {
        let mut env = Ctx::new(config());
        let mut ctx = env.borrow(&NullRemap);
        let mut txn = txn(ctx.config);

        let actions = txn.handle_event(&mut ctx, TxnEvent::Shutdown, Instant::now());
        assert_eq!(actions.last(), Some(&TxnAction::Destroy));
        assert!(txn.is_dead());
    }

    impl HttpTransaction {
        fn local_addr_for_tests(&mut self, addr: &str) {
            if let Ok(addr) = addr.parse() {
                self.local_addr = addr;
            }
        }
    }
}
