//! Proxy configuration.
//!
//! Plain data with defaults; the server binary deserializes overrides and
//! layers CLI flags on top. Per-transaction observers may further override
//! the timeout fields through the hook API, and an observer-set value wins
//! over configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How eagerly origin connect failures mark a host down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectDownPolicy {
    /// Never mark hosts down
    Never = 0,
    /// Mark on pre-TLS TCP errors only
    #[default]
    TcpOnly = 1,
    /// Mark on any connect-phase error, TLS included
    Any = 2,
}

/// Outbound session sharing pool scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPoolScope {
    /// One pool shared by every worker thread
    #[default]
    Global,
    /// One pool per worker thread
    Thread,
}

/// Fallback when a cache open-write fails (write lock held elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheOpenWriteFailAction {
    /// Fetch from origin without caching
    #[default]
    Default,
    /// Retry the cache read; another writer may finish first
    ReadRetry,
    /// Return an error on miss or revalidate instead of going to origin
    ErrorOnMissOrRevalidate,
}

/// Accept-Encoding normalization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeAe {
    /// Leave the header untouched
    #[default]
    Off = 0,
    /// Collapse to `gzip` when acceptable, else delete
    Gzip = 1,
    /// Prefer `br`, then `gzip`, else delete
    BrotliThenGzip = 2,
}

/// Behavior when the request scheme disagrees with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemeProtoMismatchPolicy {
    /// Ignore the mismatch
    Off = 0,
    /// Log a warning and continue
    #[default]
    Warn = 1,
    /// Reject the request with 400
    Reject = 2,
}

/// Host/SNI agreement enforcement for TLS inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SniHostPolicy {
    /// Do not compare
    #[default]
    Off,
    /// Log a warning on mismatch
    Warn,
    /// Reject mismatches with 403 (after remap, so rules may override)
    Enforce,
}

/// Bitmask of outbound session match requirements.
///
/// `NONE` disables pooling entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingMatch(pub u8);

impl SharingMatch {
    /// Pooling disabled.
    pub const NONE: Self = Self(0);
    /// Match on origin IP address.
    pub const IP: Self = Self(1 << 0);
    /// Match on hostname only.
    pub const HOSTONLY: Self = Self(1 << 1);
    /// Match on hostname with SNI agreement.
    pub const HOSTSNISYNC: Self = Self(1 << 2);
    /// Match on SNI.
    pub const SNI: Self = Self(1 << 3);
    /// Match on client certificate.
    pub const CERT: Self = Self(1 << 4);
    /// Match on both IP and host (the usual default).
    pub const BOTH: Self = Self(Self::IP.0 | Self::HOSTONLY.0);

    /// True if every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if pooling is disabled.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Bitmask selecting `Forwarded` header parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ForwardedOptions(pub u16);

impl ForwardedOptions {
    /// Emit nothing.
    pub const NONE: Self = Self(0);
    /// `for=<client ip>`
    pub const FOR: Self = Self(1 << 0);
    /// `by=unknown`
    pub const BY_UNKNOWN: Self = Self(1 << 1);
    /// `by=<proxy hostname>`
    pub const BY_SERVER_NAME: Self = Self(1 << 2);
    /// `by=_<uuid>`
    pub const BY_UUID: Self = Self(1 << 3);
    /// `by=<inbound local ip>`
    pub const BY_IP: Self = Self(1 << 4);
    /// `proto=<scheme stack>`
    pub const PROTO: Self = Self(1 << 5);
    /// `host=<request Host>`
    pub const HOST: Self = Self(1 << 6);
    /// `connection=<compact protocol stack>`
    pub const CONNECTION_COMPACT: Self = Self(1 << 7);
    /// `connection=<standard protocol stack>`
    pub const CONNECTION_STD: Self = Self(1 << 8);
    /// `connection=<full protocol stack>`
    pub const CONNECTION_FULL: Self = Self(1 << 9);

    /// True if every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no parameter is selected.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Via header verbosity, applied independently to request and response.
pub type ViaVerbosity = u8;

/// Complete proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Maximum redirect chain length followed on behalf of a client
    pub number_of_redirections: u32,
    /// When connect failures mark an origin down
    pub connect_down_policy: ConnectDownPolicy,
    /// Outbound session sharing requirements
    pub server_session_sharing_match: SharingMatch,
    /// Pool scope for shared outbound sessions
    pub server_session_sharing_pool: SessionPoolScope,

    /// Inactivity timeout while talking to the client
    pub transaction_no_activity_timeout_in: Duration,
    /// Inactivity timeout while talking to the origin
    pub transaction_no_activity_timeout_out: Duration,
    /// Total transaction budget on the client side
    pub transaction_active_timeout_in: Duration,
    /// Total transaction budget on the origin side
    pub transaction_active_timeout_out: Duration,

    /// Budget for one origin connect attempt
    pub connect_attempts_timeout: Duration,
    /// Connect attempts against a live origin
    pub connect_attempts_max_retries: u32,
    /// Connect attempts against an origin already marked down
    pub connect_attempts_max_retries_down_server: u32,
    /// Consecutive failures before a host is marked down
    pub mark_down_threshold: u32,
    /// How long a marked-down host stays down
    pub down_server_timeout: Duration,

    /// Fallback when cache open-write fails
    pub cache_open_write_fail_action: CacheOpenWriteFailAction,
    /// Which `Forwarded` parameters to emit
    pub insert_forwarded: ForwardedOptions,
    /// Accept-Encoding normalization mode
    pub normalize_ae: NormalizeAe,
    /// Fraction of the body that must be consumed before a client abort
    /// converts into a background fill instead of killing the origin read
    pub background_fill_threshold: f64,
    /// Master switch for background fill
    pub background_fill_enabled: bool,

    /// Hostname advertised in Via and by=
    pub proxy_hostname: String,
    /// Stable process UUID advertised in Via
    pub proxy_uuid: String,
    /// Via tag inserted on requests
    pub request_via_string: String,
    /// Via tag inserted on responses
    pub response_via_string: String,
    /// Request Via verbosity (0 = none, up to 4)
    pub insert_request_via: ViaVerbosity,
    /// Response Via verbosity (0 = none, up to 4)
    pub insert_response_via: ViaVerbosity,

    /// `Strict-Transport-Security` max-age; zero disables the header
    pub hsts_max_age: u64,
    /// Append `includeSubDomains` to HSTS
    pub hsts_include_subdomains: bool,

    /// Keep Proxy-Authorization when copying headers outbound
    pub retain_proxy_auth: bool,

    /// Longest request line accepted before 414
    pub max_request_line_len: usize,
    /// Largest total header block accepted before 400
    pub max_header_size: usize,
    /// Honor the PUSH method (403 otherwise)
    pub push_enabled: bool,
    /// Chunk size used when the tunnel re-chunks a body
    pub chunk_size: usize,
    /// Bodies at or below this size are drained before an early response
    pub max_drain_body_size: usize,

    /// Host/SNI mismatch policy for TLS inbound
    pub sni_host_policy: SniHostPolicy,
    /// Scheme versus transport mismatch policy
    pub scheme_proto_mismatch_policy: SchemeProtoMismatchPolicy,

    /// Backoff before retrying a hook callout that lost its lock race
    pub callout_retry_backoff: Duration,

    /// Remove `From` on outbound requests
    pub anonymize_remove_from: bool,
    /// Remove `Referer` on outbound requests
    pub anonymize_remove_referer: bool,
    /// Remove `User-Agent` on outbound requests
    pub anonymize_remove_user_agent: bool,
    /// Remove `Cookie` on outbound requests
    pub anonymize_remove_cookie: bool,
    /// Extra header names to remove on outbound requests
    pub anonymize_other_headers: Vec<String>,

    /// `Server` header written on responses (0 = never, 1 = if absent,
    /// 2 = always)
    pub response_server_enabled: u8,
    /// Value for the `Server` header
    pub response_server_string: String,

    /// Cap on concurrent outbound connections per (host, port) group;
    /// zero disables tracking
    pub outbound_connection_limit: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            number_of_redirections: 0,
            connect_down_policy: ConnectDownPolicy::default(),
            server_session_sharing_match: SharingMatch::BOTH,
            server_session_sharing_pool: SessionPoolScope::default(),
            transaction_no_activity_timeout_in: Duration::from_secs(30),
            transaction_no_activity_timeout_out: Duration::from_secs(30),
            transaction_active_timeout_in: Duration::from_secs(900),
            transaction_active_timeout_out: Duration::from_secs(0),
            connect_attempts_timeout: Duration::from_secs(30),
            connect_attempts_max_retries: 3,
            connect_attempts_max_retries_down_server: 1,
            mark_down_threshold: 5,
            down_server_timeout: Duration::from_secs(300),
            cache_open_write_fail_action: CacheOpenWriteFailAction::default(),
            insert_forwarded: ForwardedOptions::NONE,
            normalize_ae: NormalizeAe::default(),
            background_fill_threshold: 0.5,
            background_fill_enabled: false,
            proxy_hostname: "midspan".to_string(),
            proxy_uuid: String::new(),
            request_via_string: "midspan".to_string(),
            response_via_string: "midspan".to_string(),
            insert_request_via: 1,
            insert_response_via: 0,
            hsts_max_age: 0,
            hsts_include_subdomains: false,
            retain_proxy_auth: false,
            max_request_line_len: 8190,
            max_header_size: 131_072,
            push_enabled: false,
            chunk_size: 4096,
            max_drain_body_size: 32_768,
            sni_host_policy: SniHostPolicy::default(),
            scheme_proto_mismatch_policy: SchemeProtoMismatchPolicy::default(),
            callout_retry_backoff: Duration::from_millis(10),
            anonymize_remove_from: false,
            anonymize_remove_referer: false,
            anonymize_remove_user_agent: false,
            anonymize_remove_cookie: false,
            anonymize_other_headers: Vec::new(),
            response_server_enabled: 1,
            response_server_string: "MIDSPAN/0.1".to_string(),
            outbound_connection_limit: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_match_bits() {
        assert!(SharingMatch::BOTH.contains(SharingMatch::IP));
        assert!(SharingMatch::BOTH.contains(SharingMatch::HOSTONLY));
        assert!(!SharingMatch::BOTH.contains(SharingMatch::SNI));
        assert!(SharingMatch::NONE.is_none());
        assert!(!SharingMatch::IP.is_none());
    }

    #[test]
    fn forwarded_option_bits() {
        let opts = ForwardedOptions(ForwardedOptions::FOR.0 | ForwardedOptions::PROTO.0);
        assert!(opts.contains(ForwardedOptions::FOR));
        assert!(opts.contains(ForwardedOptions::PROTO));
        assert!(!opts.contains(ForwardedOptions::HOST));
        assert!(ForwardedOptions::NONE.is_empty());
    }

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::default();
        assert_eq!(config.number_of_redirections, 0);
        assert!(config.background_fill_threshold >= 0.0);
        assert!(config.background_fill_threshold <= 1.0);
        assert!(config.max_request_line_len > 0);
        assert!(!config.push_enabled);
    }
}
