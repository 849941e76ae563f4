//! Via header construction.
//!
//! The inserted value is
//! `"<protocol-stack> <hostname>[<uuid>] (<via-string>[ [<trace>]][ [<full-stack>]])"`.
//! Verbosity levels: 1 emits the base form, 2 adds the incoming Via trace
//! in brackets, 3 the full trace, 4 adds the full protocol stack in a
//! second bracket pair. An existing `Via` is appended to with a comma.

use http::{HeaderMap, HeaderValue, header};

use crate::config::ProxyConfig;

use super::{ProtocolStackDetail, write_protocol_stack};

/// Where the Via is being inserted, which selects the tag string and
/// verbosity knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaDirection {
    /// Request heading to the origin
    Request,
    /// Response heading to the client
    Response,
}

/// Insert the proxy's Via entry into `headers`.
///
/// `protocol_stack` is the inbound protocol stack, outermost first;
/// `incoming_trace` is the condensed trace of the incoming Via value (may
/// be empty).
pub fn insert_via_header(
    headers: &mut HeaderMap,
    config: &ProxyConfig,
    direction: ViaDirection,
    protocol_stack: &[&str],
    incoming_trace: &str,
) {
    let (verbosity, via_string) = match direction {
        ViaDirection::Request => (config.insert_request_via, &config.request_via_string),
        ViaDirection::Response => (config.insert_response_via, &config.response_via_string),
    };
    if verbosity == 0 {
        return;
    }

    let mut value = write_protocol_stack(ProtocolStackDetail::Standard, protocol_stack, ' ');
    if value.is_empty() {
        value.push_str("http/1.1");
    }
    value.push(' ');
    value.push_str(&config.proxy_hostname);
    if !config.proxy_uuid.is_empty() {
        value.push('[');
        value.push_str(&config.proxy_uuid);
        value.push(']');
    }
    value.push_str(" (");
    value.push_str(via_string);

    if verbosity > 1 {
        value.push_str(" [");
        if verbosity > 2 {
            value.push_str(incoming_trace);
        } else {
            // Condensed: just the first two markers of the trace
            value.push_str(incoming_trace.get(..2).unwrap_or(incoming_trace));
        }
        value.push(']');

        if verbosity > 3 {
            value.push_str(" [");
            value.push_str(&write_protocol_stack(
                ProtocolStackDetail::Full,
                protocol_stack,
                ' ',
            ));
            value.push(']');
        }
    }
    value.push(')');

    append_with_comma(headers, header::VIA, &value);
}

/// Append `value` to a comma-separated header, creating it if absent.
pub(crate) fn append_with_comma(
    headers: &mut HeaderMap,
    name: header::HeaderName,
    value: &str,
) {
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {value}"),
        _ => value.to_string(),
    };
    if let Ok(hv) = HeaderValue::from_str(&combined) {
        headers.insert(name, hv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(verbosity: u8) -> ProxyConfig {
        ProxyConfig {
            insert_request_via: verbosity,
            proxy_hostname: "proxy.example.com".to_string(),
            proxy_uuid: "0e8e9c05-92fa-4140-b962-a1b4bc35a2e2".to_string(),
            request_via_string: "uSC".to_string(),
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn base_form() {
        let mut headers = HeaderMap::new();
        insert_via_header(
            &mut headers,
            &config(1),
            ViaDirection::Request,
            &["http/1.1", "tcp"],
            "",
        );
        assert_eq!(
            headers.get(header::VIA).unwrap().to_str().unwrap(),
            "http/1.1 proxy.example.com[0e8e9c05-92fa-4140-b962-a1b4bc35a2e2] (uSC)"
        );
    }

    #[test]
    fn verbosity_zero_inserts_nothing() {
        let mut headers = HeaderMap::new();
        insert_via_header(&mut headers, &config(0), ViaDirection::Request, &["http/1.1"], "");
        assert!(headers.get(header::VIA).is_none());
    }

    #[test]
    fn trace_brackets_at_higher_verbosity() {
        let mut headers = HeaderMap::new();
        insert_via_header(
            &mut headers,
            &config(3),
            ViaDirection::Request,
            &["http/1.1"],
            "cMsSf",
        );
        let value = headers.get(header::VIA).unwrap().to_str().unwrap();
        assert!(value.contains("[cMsSf]"));
    }

    #[test]
    fn full_stack_at_highest_verbosity() {
        let mut headers = HeaderMap::new();
        insert_via_header(
            &mut headers,
            &config(4),
            ViaDirection::Request,
            &["http/1.1", "tls/1.3", "tcp"],
            "cM",
        );
        let value = headers.get(header::VIA).unwrap().to_str().unwrap();
        assert!(value.contains("[http/1.1 tls/1.3 tcp]"));
    }

    #[test]
    fn appends_to_existing_via() {
        let mut headers = HeaderMap::new();
        headers.insert(header::VIA, HeaderValue::from_static("1.1 upstream"));
        insert_via_header(&mut headers, &config(1), ViaDirection::Request, &["http/1.1"], "");
        let value = headers.get(header::VIA).unwrap().to_str().unwrap();
        assert!(value.starts_with("1.1 upstream, "));
    }
}
