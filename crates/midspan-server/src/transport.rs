//! Per-connection runtime driver.
//!
//! Owns the client socket, parses the HTTP/1.x edge with `httparse`, and
//! feeds the transaction state machine, executing every [`TxnAction`] it
//! returns. The driver holds no protocol policy: limits, redirects,
//! timeouts, and header rewrites all come back as actions or canned
//! responses from the core.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header};
use midspan_core::{
    ProxyConfig,
    cache::{CacheEngine, CachedObject},
    hooks::HookRegistry,
    resolver::{ConnectFailurePhase, DnsResult, HostStatusMap},
    session::{InMemorySessionPool, SessionId},
    transaction::{
        HttpTransaction, NullRemap, RequestBodyKind, TimerKind, TxnAction, TxnContext, TxnEvent,
    },
    tunnel::{ChunkedDecoder, TunnelAction},
    vc::VcKey,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

/// Errors ending a connection.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed mid-header
    #[error("connection closed during header")]
    UnexpectedClose,
}

/// State shared by every connection.
pub struct SharedState {
    /// Proxy configuration
    pub config: Arc<ProxyConfig>,
    /// Global observer registry
    pub registry: HookRegistry,
    /// Outbound session pool
    pub pool: InMemorySessionPool,
    /// Cache engine
    pub cache: crate::cache_store::MemoryCache,
    /// Origin up/down records
    pub host_status: Mutex<HostStatusMap>,
    idle_streams: Mutex<HashMap<SessionId, TcpStream>>,
    next_vc: AtomicU64,
}

impl SharedState {
    /// Fresh shared state.
    #[must_use]
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self {
            config,
            registry: HookRegistry::new(),
            pool: InMemorySessionPool::new(),
            cache: crate::cache_store::MemoryCache::default(),
            host_status: Mutex::new(HostStatusMap::new()),
            idle_streams: Mutex::new(HashMap::new()),
            next_vc: AtomicU64::new(1),
        }
    }

    fn issue_vc(&self) -> VcKey {
        self.next_vc.fetch_add(1, Ordering::Relaxed)
    }

    fn park_stream(&self, id: SessionId, stream: TcpStream) {
        if let Ok(mut idle) = self.idle_streams.lock() {
            idle.insert(id, stream);
        }
    }

    fn take_stream(&self, id: SessionId) -> Option<TcpStream> {
        self.idle_streams.lock().ok()?.remove(&id)
    }
}

/// A parsed request head plus any body bytes already read.
struct ParsedRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: RequestBodyKind,
    leftover: BytesMut,
    keep_alive: bool,
}

/// Drives one client connection through any number of transactions.
pub struct ConnectionDriver {
    client: TcpStream,
    peer: SocketAddr,
    shared: Arc<SharedState>,
}

impl ConnectionDriver {
    /// Driver for an accepted connection.
    pub fn new(client: TcpStream, peer: SocketAddr, shared: Arc<SharedState>) -> Self {
        Self { client, peer, shared }
    }

    /// Serve requests until the client closes or a transaction forbids
    /// reuse.
    pub async fn run(mut self) -> Result<(), DriverError> {
        loop {
            let request = match self.read_request_head().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(EdgeReject { status, reason }) => {
                    self.write_simple_response(status, &reason).await?;
                    return Ok(());
                }
            };
            let keep_alive = request.keep_alive;
            let reuse = self.run_transaction(request).await?;
            if !(keep_alive && reuse) {
                return Ok(());
            }
        }
    }

    /// Read and validate one request head. `Ok(None)` means a clean close
    /// between requests.
    async fn read_request_head(&mut self) -> Result<Option<ParsedRequest>, EdgeReject> {
        let config = Arc::clone(&self.shared.config);
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            if let Some(end) = find_header_end(&buf) {
                return parse_request_head(&config, &mut buf, end).map(Some);
            }
            if buf.len() > config.max_header_size {
                return Err(EdgeReject {
                    status: StatusCode::BAD_REQUEST,
                    reason: "header block too large".into(),
                });
            }
            // The request line is bounded before the full head arrives
            let line_len = first_line_len(&buf).unwrap_or(buf.len());
            if line_len > config.max_request_line_len {
                return Err(EdgeReject {
                    status: StatusCode::URI_TOO_LONG,
                    reason: "request line too long".into(),
                });
            }

            let n = self
                .client
                .read_buf(&mut buf)
                .await
                .map_err(|_| EdgeReject {
                    status: StatusCode::BAD_REQUEST,
                    reason: "read failed".into(),
                })?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(EdgeReject {
                    status: StatusCode::BAD_REQUEST,
                    reason: "connection closed during header".into(),
                });
            }
        }
    }

    /// Run one transaction to completion. Returns whether the inbound
    /// connection may be reused.
    async fn run_transaction(&mut self, request: ParsedRequest) -> Result<bool, DriverError> {
        let shared = Arc::clone(&self.shared);
        let config = Arc::clone(&shared.config);
        let client_vc = shared.issue_vc();
        let local_addr = self.client.local_addr()?;

        let mut txn = HttpTransaction::new(
            client_vc,
            self.peer,
            local_addr,
            None,
            false,
            &config,
            Instant::now(),
        );

        let mut origin: Option<TcpStream> = None;
        let mut origin_vc: Option<VcKey> = None;
        let mut cache_body = BytesMut::new();
        let mut cache_headers: Option<(StatusCode, HeaderMap)> = None;
        let mut request_times: (i64, i64) = (0, 0);
        let mut reuse_client = true;
        let mut client_body = request.leftover;
        let request_body = request.body;

        let mut events = std::collections::VecDeque::new();
        events.push_back(TxnEvent::RequestHeaderReady {
            method: request.method,
            uri: request.uri,
            version: request.version,
            headers: request.headers,
            body: request.body,
        });

        'txn: while let Some(event) = events.pop_front() {
            let actions = {
                let Ok(mut host_status) = shared.host_status.lock() else {
                    break 'txn;
                };
                let mut ctx = TxnContext {
                    config: &config,
                    registry: &shared.registry,
                    remap: &NullRemap,
                    pool: &shared.pool,
                    host_status: &mut host_status,
                };
                txn.handle_event(&mut ctx, event, Instant::now())
            };

            for action in actions {
                match action {
                    TxnAction::ResolveDns { hostname, port } => {
                        let result = resolve(&hostname, port).await;
                        events.push_back(TxnEvent::DnsResolved { result });
                    }
                    TxnAction::CacheOpenRead { key } => {
                        let result = shared.cache.open_read(&key);
                        events.push_back(TxnEvent::CacheReadDone { result });
                    }
                    TxnAction::CacheOpenWrite { key } => {
                        let result = shared.cache.open_write(&key);
                        events.push_back(TxnEvent::CacheWriteDone { result });
                    }
                    TxnAction::BufferRequestBody => {
                        let buffered = match request_body {
                            RequestBodyKind::Chunked => {
                                self.buffer_chunked_body(&mut client_body, config.max_header_size)
                                    .await
                            }
                            RequestBodyKind::Sized(len) => {
                                self.buffer_sized_body(&mut client_body, len).await
                            }
                            RequestBodyKind::None => Ok(Bytes::new()),
                        };
                        match buffered {
                            Ok(body) => events.push_back(TxnEvent::RequestBodyComplete { body }),
                            Err(err) => {
                                debug!(%err, "request body buffering failed");
                                reuse_client = false;
                                events.push_back(TxnEvent::ClientAborted);
                            }
                        }
                    }
                    TxnAction::ConnectOrigin { addr, timeout: budget } => {
                        match timeout(budget, TcpStream::connect(addr)).await {
                            Ok(Ok(stream)) => {
                                let vc = shared.issue_vc();
                                origin = Some(stream);
                                origin_vc = Some(vc);
                                events.push_back(TxnEvent::OriginConnected {
                                    vc,
                                    supports_chunked: true,
                                });
                            }
                            Ok(Err(err)) => {
                                debug!(%err, %addr, "origin connect failed");
                                events.push_back(TxnEvent::OriginConnectFailed {
                                    phase: ConnectFailurePhase::PreTls,
                                });
                            }
                            Err(_) => {
                                events.push_back(TxnEvent::TimerFired { kind: TimerKind::Connect });
                            }
                        }
                    }
                    TxnAction::SendRequestToOrigin { vc, method, uri, headers, body } => {
                        if origin.is_none() {
                            // A pooled session: reclaim its parked stream
                            if let Some(stream) = shared.take_stream(vc) {
                                origin = Some(stream);
                                origin_vc = Some(vc);
                            }
                        }
                        let Some(stream) = origin.as_mut() else {
                            events.push_back(TxnEvent::OriginConnectFailed {
                                phase: ConnectFailurePhase::PreTls,
                            });
                            continue;
                        };
                        request_times.0 = unix_now();
                        let head = format_request_head(&method, &uri, &headers);
                        stream.write_all(&head).await?;
                        if let Some(body) = body {
                            stream.write_all(&body).await?;
                        }

                        match read_response_head(
                            stream,
                            config.max_header_size,
                            effective_read_timeout(&config),
                        )
                        .await
                        {
                            Ok((status, resp_headers, leftover)) => {
                                request_times.1 = unix_now();
                                cache_headers = Some((status, resp_headers.clone()));
                                client_body = leftover;
                                events.push_back(TxnEvent::OriginResponseHeader {
                                    status,
                                    headers: resp_headers,
                                });
                            }
                            Err(ReadHeadError::Timeout) => {
                                events.push_back(TxnEvent::TimerFired {
                                    kind: TimerKind::InactivityOut,
                                });
                            }
                            Err(err) => {
                                debug!(%err, "origin response unreadable");
                                events.push_back(TxnEvent::OriginConnectFailed {
                                    phase: ConnectFailurePhase::PreTls,
                                });
                            }
                        }
                    }
                    TxnAction::SendResponseToClient { status, headers, body } => {
                        let head = format_response_head(status, &headers, body.as_deref());
                        self.client.write_all(&head).await?;
                        if let Some(body) = &body {
                            self.client.write_all(body).await?;
                        }
                        // A streamed origin body follows through the tunnel
                        if body.is_none() && origin.is_some() {
                            self.pump_origin_body(
                                &mut txn,
                                &mut origin,
                                &mut client_body,
                                &mut cache_body,
                                cache_headers.as_ref(),
                                request_times,
                                &mut reuse_client,
                                &mut events,
                            )
                            .await?;
                        }
                    }
                    TxnAction::DrainRequestBody => {
                        if let RequestBodyKind::Sized(len) = request_body {
                            drain_body(&mut self.client, &mut client_body, len).await?;
                        }
                    }
                    TxnAction::Tunnel(tunnel_action) => match tunnel_action {
                        TunnelAction::WriteTo { consumer, data } => {
                            if Some(consumer) == origin_vc {
                                if let Some(stream) = origin.as_mut() {
                                    stream.write_all(&data).await?;
                                }
                            } else if consumer == CACHE_WRITE_VC {
                                cache_body.extend_from_slice(&data);
                            } else {
                                self.client.write_all(&data).await?;
                            }
                        }
                        TunnelAction::CloseConsumer { consumer } => {
                            if consumer == CACHE_WRITE_VC {
                                commit_cache_object(
                                    &shared,
                                    &txn,
                                    cache_headers.as_ref(),
                                    &cache_body,
                                    request_times,
                                );
                            }
                        }
                        TunnelAction::AbortProducer { .. } => {
                            origin = None;
                        }
                    },
                    TxnAction::SetTimer { kind: TimerKind::CalloutRetry, duration } => {
                        tokio::time::sleep(duration).await;
                        events.push_back(TxnEvent::TimerFired { kind: TimerKind::CalloutRetry });
                    }
                    TxnAction::SetTimer { .. } | TxnAction::ClearTimer { .. } => {
                        // Inactivity budgets are applied directly on the
                        // awaits above
                    }
                    TxnAction::CacheCommit { key, object } => {
                        shared.cache.commit(&key, object);
                    }
                    TxnAction::ReleaseSession { session } => {
                        if let Some(stream) = origin.take() {
                            shared.park_stream(session.id, stream);
                        }
                    }
                    TxnAction::CloseOrigin { .. } => {
                        origin = None;
                    }
                    TxnAction::CloseClient { reuse } => {
                        reuse_client = reuse;
                    }
                    TxnAction::Destroy => break 'txn,
                }
            }
        }

        Ok(reuse_client)
    }

    /// Stream the origin response body through the machine's tunnel.
    #[allow(clippy::too_many_arguments)]
    async fn pump_origin_body(
        &mut self,
        txn: &mut HttpTransaction,
        origin: &mut Option<TcpStream>,
        preread: &mut BytesMut,
        cache_body: &mut BytesMut,
        cache_headers: Option<&(StatusCode, HeaderMap)>,
        request_times: (i64, i64),
        reuse_client: &mut bool,
        events: &mut std::collections::VecDeque<TxnEvent>,
    ) -> Result<(), DriverError> {
        let shared = Arc::clone(&self.shared);
        let config = Arc::clone(&shared.config);
        let mut carried = std::mem::take(preread);
        let mut framing = BodyFraming::from_head(cache_headers.map(|(_, h)| h));

        loop {
            let (chunk, mut eos) = if carried.is_empty() {
                let Some(stream) = origin.as_mut() else { break };
                let mut buf = BytesMut::with_capacity(16 * 1024);
                match timeout(effective_read_timeout(&config), stream.read_buf(&mut buf)).await {
                    Ok(Ok(0)) => (Bytes::new(), true),
                    Ok(Ok(_)) => (buf.freeze(), false),
                    Ok(Err(err)) => {
                        debug!(%err, "origin read failed");
                        (Bytes::new(), true)
                    }
                    Err(_) => {
                        events.push_back(TxnEvent::TimerFired { kind: TimerKind::InactivityOut });
                        break;
                    }
                }
            } else {
                (carried.split().freeze(), false)
            };
            // The framing tells us when the body ends without waiting for
            // the origin to close a keep-alive connection
            eos |= framing.observe(&chunk);

            let actions = {
                let Ok(mut host_status) = shared.host_status.lock() else {
                    break;
                };
                let mut ctx = TxnContext {
                    config: &config,
                    registry: &shared.registry,
                    remap: &NullRemap,
                    pool: &shared.pool,
                    host_status: &mut host_status,
                };
                txn.handle_event(
                    &mut ctx,
                    TxnEvent::OriginBodyBytes { data: chunk, eos },
                    Instant::now(),
                )
            };

            let mut finished = eos;
            for action in actions {
                match action {
                    TxnAction::Tunnel(TunnelAction::WriteTo { consumer, data }) => {
                        if consumer == CACHE_WRITE_VC {
                            cache_body.extend_from_slice(&data);
                        } else {
                            self.client.write_all(&data).await?;
                        }
                    }
                    TxnAction::Tunnel(TunnelAction::CloseConsumer { consumer }) => {
                        if consumer == CACHE_WRITE_VC {
                            commit_cache_object(
                                &shared,
                                txn,
                                cache_headers,
                                cache_body,
                                request_times,
                            );
                        }
                    }
                    TxnAction::Tunnel(TunnelAction::AbortProducer { .. }) => {
                        *origin = None;
                        finished = true;
                    }
                    TxnAction::ReleaseSession { session } => {
                        if let Some(stream) = origin.take() {
                            shared.park_stream(session.id, stream);
                        }
                    }
                    TxnAction::CloseOrigin { .. } => {
                        *origin = None;
                    }
                    TxnAction::CloseClient { reuse } => {
                        *reuse_client = reuse;
                    }
                    TxnAction::Destroy => finished = true,
                    TxnAction::SetTimer { .. } | TxnAction::ClearTimer { .. } => {}
                    other => debug!(?other, "unexpected action during body pump"),
                }
            }
            if finished {
                break;
            }
        }
        Ok(())
    }

    /// Buffer a Content-Length framed request body.
    async fn buffer_sized_body(
        &mut self,
        preread: &mut BytesMut,
        len: u64,
    ) -> Result<Bytes, DriverError> {
        let mut out = BytesMut::with_capacity(len.min(64 * 1024) as usize);
        out.extend_from_slice(&preread.split());
        while (out.len() as u64) < len {
            let n = self.client.read_buf(&mut out).await?;
            if n == 0 {
                return Err(DriverError::UnexpectedClose);
            }
        }
        out.truncate(len as usize);
        Ok(out.freeze())
    }

    /// Buffer (and dechunk) the whole chunked request body.
    async fn buffer_chunked_body(
        &mut self,
        preread: &mut BytesMut,
        limit: usize,
    ) -> Result<Bytes, DriverError> {
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();

        loop {
            if !preread.is_empty() {
                let chunk = preread.split();
                decoder
                    .feed(&chunk, &mut out)
                    .map_err(|_| DriverError::UnexpectedClose)?;
            }
            if decoder.is_complete() {
                return Ok(out.freeze());
            }
            if out.len() > limit * 16 {
                return Err(DriverError::UnexpectedClose);
            }
            let n = self.client.read_buf(preread).await?;
            if n == 0 {
                return Err(DriverError::UnexpectedClose);
            }
        }
    }

    async fn write_simple_response(
        &mut self,
        status: StatusCode,
        reason: &str,
    ) -> Result<(), DriverError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        let body = format!("{reason}\n");
        let head = format_response_head(status, &headers, Some(body.as_bytes()));
        self.client.write_all(&head).await?;
        self.client.write_all(body.as_bytes()).await?;
        Ok(())
    }
}

/// Cache-write consumer key the core uses inside the tunnel.
const CACHE_WRITE_VC: VcKey = u64::MAX;

/// How the origin response body is delimited.
enum BodyFraming {
    /// Bytes remaining under a Content-Length
    Length(u64),
    /// Chunked framing; the detector finds the zero chunk
    Chunked(ChunkedDecoder),
    /// Body runs to connection close
    Eof,
}

impl BodyFraming {
    fn from_head(headers: Option<&HeaderMap>) -> Self {
        let Some(headers) = headers else { return Self::Eof };
        let chunked = headers
            .get(header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Self::Chunked(ChunkedDecoder::new());
        }
        match headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(len) => Self::Length(len),
            None => Self::Eof,
        }
    }

    /// Account for `chunk`; true once the body is complete.
    fn observe(&mut self, chunk: &[u8]) -> bool {
        match self {
            Self::Length(remaining) => {
                *remaining = remaining.saturating_sub(chunk.len() as u64);
                *remaining == 0
            }
            Self::Chunked(detector) => {
                let mut sink = BytesMut::new();
                let _ = detector.feed(chunk, &mut sink);
                detector.is_complete()
            }
            Self::Eof => false,
        }
    }
}

struct EdgeReject {
    status: StatusCode,
    reason: String,
}

#[derive(Error, Debug)]
enum ReadHeadError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("origin response malformed")]
    Malformed,
    #[error("origin read timed out")]
    Timeout,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|at| at + 4)
}

fn first_line_len(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn parse_request_head(
    config: &ProxyConfig,
    buf: &mut BytesMut,
    head_end: usize,
) -> Result<ParsedRequest, EdgeReject> {
    let head = buf.split_to(head_end);

    if first_line_len(&head).unwrap_or(head.len()) > config.max_request_line_len {
        return Err(EdgeReject {
            status: StatusCode::URI_TOO_LONG,
            reason: "request line too long".into(),
        });
    }

    let mut header_storage = [httparse::EMPTY_HEADER; 100];
    let mut parsed = httparse::Request::new(&mut header_storage);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => {
            return Err(EdgeReject {
                status: StatusCode::BAD_REQUEST,
                reason: "malformed request".into(),
            });
        }
    }

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(EdgeReject {
            status: StatusCode::BAD_REQUEST,
            reason: "bad method".into(),
        })?;
    let version =
        if parsed.version == Some(0) { Version::HTTP_10 } else { Version::HTTP_11 };

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(h.name),
            HeaderValue::from_bytes(h.value),
        ) {
            headers.append(name, value);
        }
    }

    let uri = effective_uri(parsed.path.unwrap_or("/"), &headers).ok_or(EdgeReject {
        status: StatusCode::BAD_REQUEST,
        reason: "unresolvable request target".into(),
    })?;

    let body = body_kind(&headers);
    let keep_alive = !headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        && version == Version::HTTP_11;

    Ok(ParsedRequest {
        method,
        uri,
        version,
        headers,
        body,
        leftover: buf.split(),
        keep_alive,
    })
}

fn effective_uri(path: &str, headers: &HeaderMap) -> Option<Uri> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.parse().ok();
    }
    let host = headers.get(header::HOST)?.to_str().ok()?;
    format!("http://{host}{path}").parse().ok()
}

fn body_kind(headers: &HeaderMap) -> RequestBodyKind {
    let chunked = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return RequestBodyKind::Chunked;
    }
    match headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(0) | None => RequestBodyKind::None,
        Some(len) => RequestBodyKind::Sized(len),
    }
}

async fn resolve(hostname: &str, port: u16) -> DnsResult {
    match tokio::net::lookup_host((hostname, port)).await {
        Ok(addrs) => {
            let ips: Vec<_> = addrs.map(|a| a.ip()).collect();
            if ips.is_empty() { DnsResult::NotFound } else { DnsResult::Resolved(ips) }
        }
        Err(err) => {
            debug!(%err, hostname, "dns lookup failed");
            DnsResult::NotFound
        }
    }
}

async fn read_response_head(
    stream: &mut TcpStream,
    max_header_size: usize,
    budget: Duration,
) -> Result<(StatusCode, HeaderMap, BytesMut), ReadHeadError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = buf.split_to(end);
            let mut header_storage = [httparse::EMPTY_HEADER; 100];
            let mut parsed = httparse::Response::new(&mut header_storage);
            let Ok(httparse::Status::Complete(_)) = parsed.parse(&head) else {
                return Err(ReadHeadError::Malformed);
            };
            let status = StatusCode::from_u16(parsed.code.unwrap_or(502))
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for h in parsed.headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(h.name),
                    HeaderValue::from_bytes(h.value),
                ) {
                    headers.append(name, value);
                }
            }
            return Ok((status, headers, buf));
        }
        if buf.len() > max_header_size {
            return Err(ReadHeadError::Malformed);
        }
        match timeout(budget, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Err(ReadHeadError::Malformed),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(ReadHeadError::Io(err)),
            Err(_) => return Err(ReadHeadError::Timeout),
        }
    }
}

async fn drain_body(
    client: &mut TcpStream,
    preread: &mut BytesMut,
    len: u64,
) -> Result<(), DriverError> {
    let mut remaining = len.saturating_sub(preread.len() as u64);
    preread.clear();
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let n = client.read(&mut scratch[..want]).await?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

fn format_request_head(method: &Method, uri: &Uri, headers: &HeaderMap) -> Vec<u8> {
    let path = uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    let mut out = format!("{method} {path} HTTP/1.1\r\n").into_bytes();
    if !headers.contains_key(header::HOST)
        && let Some(host) = uri.host()
    {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn format_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(body) = body
        && !headers.contains_key(header::CONTENT_LENGTH)
    {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn commit_cache_object(
    shared: &SharedState,
    txn: &HttpTransaction,
    head: Option<&(StatusCode, HeaderMap)>,
    body: &BytesMut,
    times: (i64, i64),
) {
    let Some((status, headers)) = head else { return };
    let Some(key) = txn.cache_key().cloned() else { return };
    shared.cache.commit(
        &key,
        CachedObject {
            status: *status,
            headers: headers.clone(),
            body: Bytes::copy_from_slice(body),
            request_sent_time: times.0,
            response_received_time: times.1,
        },
    );
}

fn effective_read_timeout(config: &ProxyConfig) -> Duration {
    let budget = config.transaction_no_activity_timeout_out;
    if budget.is_zero() { Duration::from_secs(30) } else { budget }
}

fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
