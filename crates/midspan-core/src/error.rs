//! Transaction error taxonomy.
//!
//! Errors that end a transaction map onto a complete HTTP response: once a
//! response has not yet been sent, the client always receives a full status
//! line and body, never a half-response. Errors local to a sub-component
//! (a frame that does not fit, a cache write that cannot start) are
//! recovered in place and never appear here.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Fine-grained reason recorded alongside the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcode {
    /// No special reason
    None,
    /// Redirect chain exceeded `number_of_redirections`
    NumRedirectionsExceeded,
    /// Origin resolved to our own inbound address
    SelfLoopDetected,
    /// Outbound connection cap reached
    OutboundThrottled,
    /// TLS SNI and Host header disagreed under enforcement
    SniHostMismatch,
}

/// Errors that surface to the client as an HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Client sent an unparsable or oversize request line
    #[error("malformed request line")]
    RequestLineMalformed,

    /// Request line exceeded the configured maximum
    #[error("request line of {len} bytes exceeds maximum {max}")]
    RequestLineTooLong {
        /// Observed length
        len: usize,
        /// Configured cap
        max: usize,
    },

    /// Header block exceeded the configured maximum
    #[error("header block of {len} bytes exceeds maximum {max}")]
    HeadersTooLarge {
        /// Observed length
        len: usize,
        /// Configured cap
        max: usize,
    },

    /// Client request was syntactically invalid
    #[error("malformed client request: {0}")]
    ClientParse(String),

    /// TRACE with a body, PUSH while disabled, and similar method rules
    #[error("method not acceptable: {0}")]
    MethodNotAcceptable(&'static str),

    /// Origin response was syntactically invalid
    #[error("malformed origin response: {0}")]
    OriginParse(String),

    /// Could not open a connection to the origin
    #[error("origin connect failed after {attempts} attempts")]
    ConnectFailed {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Origin connect did not complete within budget
    #[error("origin connect timed out after {elapsed:?}")]
    ConnectTimeout {
        /// Time spent connecting
        elapsed: Duration,
    },

    /// No bytes moved in either direction within budget
    #[error("transaction inactive for {elapsed:?}")]
    InactivityTimeout {
        /// Idle time observed
        elapsed: Duration,
        /// Whether the origin response had already started
        response_started: bool,
    },

    /// Total transaction budget exhausted
    #[error("transaction exceeded active timeout {budget:?}")]
    ActiveTimeout {
        /// Configured budget
        budget: Duration,
    },

    /// Cache storage failed mid-read with no origin fallback available
    #[error("cache read failed: {0}")]
    CacheReadFailed(String),

    /// Outbound per-host connection cap reached
    #[error("outbound connections to {host} throttled")]
    Throttled {
        /// Destination host
        host: String,
    },

    /// Origin address equals our own inbound address
    #[error("request would loop to this proxy")]
    SelfLoop,

    /// TLS SNI disagreed with the Host header under enforcement
    #[error("host {host} does not match SNI {sni}")]
    SniHostMismatch {
        /// Request Host
        host: String,
        /// Inbound SNI
        sni: String,
    },

    /// Destination forbidden for this method by ACL
    #[error("access denied")]
    AccessDenied,

    /// An observer returned an error from a callout
    #[error("plugin observer failed at hook")]
    PluginError,

    /// Redirect chain exceeded the configured maximum
    #[error("too many redirections")]
    TooManyRedirects,
}

impl ProxyError {
    /// The response status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RequestLineTooLong { .. } => StatusCode::URI_TOO_LONG,
            Self::RequestLineMalformed
            | Self::HeadersTooLarge { .. }
            | Self::ClientParse(_)
            | Self::MethodNotAcceptable(_) => StatusCode::BAD_REQUEST,
            Self::OriginParse(_) | Self::SelfLoop => StatusCode::BAD_GATEWAY,
            Self::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::ConnectTimeout { .. } | Self::ActiveTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::InactivityTimeout { response_started, .. } => {
                if *response_started {
                    // The client already has a partial response; the
                    // connection is simply dropped, but record 504
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::REQUEST_TIMEOUT
                }
            }
            Self::CacheReadFailed(_) | Self::PluginError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Throttled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::SniHostMismatch { .. } | Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::TooManyRedirects => StatusCode::BAD_GATEWAY,
        }
    }

    /// Subcode recorded with the response.
    #[must_use]
    pub fn subcode(&self) -> Subcode {
        match self {
            Self::TooManyRedirects => Subcode::NumRedirectionsExceeded,
            Self::SelfLoop => Subcode::SelfLoopDetected,
            Self::Throttled { .. } => Subcode::OutboundThrottled,
            Self::SniHostMismatch { .. } => Subcode::SniHostMismatch,
            _ => Subcode::None,
        }
    }

    /// True when a fresh origin attempt might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::ConnectTimeout { .. })
    }

    /// Canned plain-text body for the error response.
    #[must_use]
    pub fn canned_body(&self) -> String {
        match self {
            Self::SelfLoop => {
                "The request would cause this proxy to connect to itself.\n".to_string()
            }
            Self::TooManyRedirects => "Too many redirections were followed.\n".to_string(),
            Self::Throttled { host } => {
                format!("Too many connections in flight to {host}. Try again shortly.\n")
            }
            other => format!("{other}\n"),
        }
    }
}
