//! RFC 7239 `Forwarded` header construction.
//!
//! The configured bitmask selects which parameters are emitted. Parameters
//! are joined with `;`; the finished element is appended to an existing
//! `Forwarded` with a comma. IPv6 addresses are quoted in brackets as the
//! RFC requires.

use std::net::{IpAddr, SocketAddr};

use http::{HeaderMap, header};

use crate::config::{ForwardedOptions, ProxyConfig};

use super::{ProtocolStackDetail, via::append_with_comma, write_protocol_stack};

/// Inputs the Forwarded builder needs from the transaction.
#[derive(Debug, Clone)]
pub struct ForwardedContext<'a> {
    /// Client source address
    pub client_addr: SocketAddr,
    /// Our inbound local address
    pub local_addr: SocketAddr,
    /// Request `Host` value, if present
    pub host: Option<&'a str>,
    /// Inbound protocol stack, outermost first
    pub protocol_stack: &'a [&'a str],
}

fn format_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("\"[{v6}]\""),
    }
}

/// Append the configured `Forwarded` element to `headers`. No-op when the
/// option mask is empty.
pub fn add_forwarded_field(
    headers: &mut HeaderMap,
    config: &ProxyConfig,
    ctx: &ForwardedContext<'_>,
) {
    let opts = config.insert_forwarded;
    if opts.is_empty() {
        return;
    }

    let mut params: Vec<String> = Vec::new();

    if opts.contains(ForwardedOptions::FOR) {
        params.push(format!("for={}", format_ip(ctx.client_addr.ip())));
    }
    if opts.contains(ForwardedOptions::BY_UNKNOWN) {
        params.push("by=unknown".to_string());
    }
    if opts.contains(ForwardedOptions::BY_SERVER_NAME) {
        params.push(format!("by={}", config.proxy_hostname));
    }
    if opts.contains(ForwardedOptions::BY_UUID) && !config.proxy_uuid.is_empty() {
        params.push(format!("by=_{}", config.proxy_uuid));
    }
    if opts.contains(ForwardedOptions::BY_IP) {
        params.push(format!("by={}", format_ip(ctx.local_addr.ip())));
    }
    if opts.contains(ForwardedOptions::PROTO) && !ctx.protocol_stack.is_empty() {
        params.push(format!(
            "proto={}",
            write_protocol_stack(ProtocolStackDetail::Compact, ctx.protocol_stack, '-')
        ));
    }
    if opts.contains(ForwardedOptions::HOST)
        && let Some(host) = ctx.host
        && !host.is_empty()
    {
        // A port needs quoting, a bare name does not
        if host.contains(':') {
            params.push(format!("host=\"{host}\""));
        } else {
            params.push(format!("host={host}"));
        }
    }
    if !ctx.protocol_stack.is_empty() {
        for (opt, detail) in [
            (ForwardedOptions::CONNECTION_COMPACT, ProtocolStackDetail::Compact),
            (ForwardedOptions::CONNECTION_STD, ProtocolStackDetail::Standard),
            (ForwardedOptions::CONNECTION_FULL, ProtocolStackDetail::Full),
        ] {
            if opts.contains(opt) {
                params.push(format!(
                    "connection={}",
                    write_protocol_stack(detail, ctx.protocol_stack, '-')
                ));
            }
        }
    }

    if params.is_empty() {
        return;
    }
    append_with_comma(headers, header::FORWARDED, &params.join(";"));
}
