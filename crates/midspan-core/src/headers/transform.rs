//! Header copy rules, normalizations, and RFC 7234 age arithmetic.

use std::time::{Duration, UNIX_EPOCH};

use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tracing::debug;

use crate::config::{NormalizeAe, ProxyConfig};

/// Hop-by-hop fields stripped when a header block crosses the proxy.
///
/// `TE` is treated as hop-by-hop; `Transfer-Encoding` is copied and fixed
/// up later when the tunnel decides to re-frame the body.
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

const KEEP_ALIVE: header::HeaderName = header::HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: header::HeaderName = header::HeaderName::from_static("proxy-connection");

/// Duplicate `src` into a fresh map, stripping hop-by-hop fields.
///
/// `Keep-Alive` is always kept; `Proxy-Authorization` (and the legacy
/// `Proxy-Connection`) survive iff `retain_proxy_auth`. A `Date` is set
/// from `date_epoch` when the source had none.
#[must_use]
pub fn copy_header_fields(
    src: &HeaderMap,
    retain_proxy_auth: bool,
    date_epoch: Option<i64>,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if HOP_BY_HOP.contains(name) {
            let retained = retain_proxy_auth && *name == header::PROXY_AUTHORIZATION;
            if !retained {
                continue;
            }
        }
        if *name == PROXY_CONNECTION && !retain_proxy_auth {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    // Keep-Alive is exempt from the hop-by-hop rule
    if let Some(value) = src.get(&KEEP_ALIVE)
        && !out.contains_key(&KEEP_ALIVE)
    {
        out.insert(KEEP_ALIVE, value.clone());
    }

    if !out.contains_key(header::DATE)
        && let Some(epoch) = date_epoch
        && epoch > 0
        && let Ok(value) = HeaderValue::from_str(&format_http_date(epoch))
    {
        out.insert(header::DATE, value);
    }
    out
}

/// Normalize `Accept-Encoding` for better cache hit rates.
pub fn normalize_accept_encoding(headers: &mut HeaderMap, mode: NormalizeAe) {
    if mode == NormalizeAe::Off {
        return;
    }
    let Some(value) = headers.get(header::ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) else {
        return;
    };

    let accepts = |coding: &str| {
        value
            .split(',')
            .map(|item| item.split(';').next().unwrap_or("").trim())
            .any(|item| item.eq_ignore_ascii_case(coding))
    };

    let replacement: Option<&'static str> = match mode {
        NormalizeAe::Gzip => accepts("gzip").then_some("gzip"),
        NormalizeAe::BrotliThenGzip => {
            if accepts("br") {
                Some("br")
            } else if accepts("gzip") {
                Some("gzip")
            } else {
                None
            }
        }
        NormalizeAe::Off => return,
    };

    match replacement {
        Some(coding) => {
            headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(coding));
        }
        None => {
            headers.remove(header::ACCEPT_ENCODING);
            debug!("removed non-normalizable Accept-Encoding");
        }
    }
}

/// Set `Strict-Transport-Security` on a response. No-op when max-age is 0.
pub fn insert_hsts_header(headers: &mut HeaderMap, config: &ProxyConfig) {
    if config.hsts_max_age == 0 {
        return;
    }
    let mut value = format!("max-age={}", config.hsts_max_age);
    if config.hsts_include_subdomains {
        value.push_str("; includeSubDomains");
    }
    if let Ok(hv) = HeaderValue::from_str(&value) {
        headers.insert(header::STRICT_TRANSPORT_SECURITY, hv);
    }
}

/// RFC 7234 §4.2.3 current-age calculation. All times are unix seconds;
/// `age_value` and `date_value` come from the stored response headers.
///
/// Returns -1 when the `Age` header overflowed (negative), matching the
/// cache's "unusable age" convention.
#[must_use]
pub fn calculate_document_age(
    request_time: i64,
    response_time: i64,
    age_value: i64,
    date_value: i64,
    now: i64,
) -> i64 {
    // Clock skew: never let "now" precede the response
    let now_value = now.max(response_time);

    if age_value < 0 {
        return -1;
    }

    let apparent_age =
        if date_value > 0 { (response_time - date_value).max(0) } else { 0 };
    let corrected_received_age = apparent_age.max(age_value);
    let response_delay = response_time - request_time;
    let corrected_initial_age = corrected_received_age + response_delay;
    let resident_time = now_value - response_time;
    corrected_initial_age + resident_time
}

/// Remove conditional headers from an outbound request (used when the
/// proxy decides to fetch a full object regardless of client validators).
pub fn remove_conditional_headers(headers: &mut HeaderMap) {
    let present = headers.contains_key(header::IF_MODIFIED_SINCE)
        || headers.contains_key(header::IF_UNMODIFIED_SINCE)
        || headers.contains_key(header::IF_MATCH)
        || headers.contains_key(header::IF_NONE_MATCH);
    if present {
        headers.remove(header::IF_MODIFIED_SINCE);
        headers.remove(header::IF_UNMODIFIED_SINCE);
        headers.remove(header::IF_MATCH);
        headers.remove(header::IF_NONE_MATCH);
    }
}

/// Drop `Expect: 100-continue` from an outbound request when the proxy
/// answers the expectation itself.
pub fn remove_100_continue_header(headers: &mut HeaderMap) {
    let is_100_continue = headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
    if is_100_continue {
        headers.remove(header::EXPECT);
    }
}

/// Set or overwrite the response `Server` header per configuration.
pub fn add_server_header(headers: &mut HeaderMap, config: &ProxyConfig) {
    if config.response_server_enabled == 0 || config.response_server_string.is_empty() {
        return;
    }
    let overwrite = config.response_server_enabled == 2 || !headers.contains_key(header::SERVER);
    if overwrite && let Ok(value) = HeaderValue::from_str(&config.response_server_string) {
        headers.insert(header::SERVER, value);
    }
}

/// Remove privacy-sensitive headers from an outbound request.
pub fn remove_privacy_headers(headers: &mut HeaderMap, config: &ProxyConfig) {
    if config.anonymize_remove_from {
        headers.remove(header::FROM);
    }
    if config.anonymize_remove_referer {
        headers.remove(header::REFERER);
    }
    if config.anonymize_remove_user_agent {
        headers.remove(header::USER_AGENT);
    }
    if config.anonymize_remove_cookie {
        headers.remove(header::COOKIE);
    }
    for name in &config.anonymize_other_headers {
        if let Ok(name) = header::HeaderName::try_from(name.as_str()) {
            headers.remove(name);
        }
    }
}

/// Force `Connection: close` on a header block.
pub fn add_connection_close(headers: &mut HeaderMap) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
}

/// Set `Date` and `Age` on a response served from cache.
pub fn insert_time_and_age_headers(
    headers: &mut HeaderMap,
    request_sent_time: i64,
    response_received_time: i64,
    date_value: i64,
    age_value: i64,
    now: i64,
) {
    let age = calculate_document_age(
        request_sent_time,
        response_received_time,
        age_value,
        date_value,
        now,
    );
    if age >= 0 && let Ok(value) = HeaderValue::from_str(&age.to_string()) {
        headers.insert(header::AGE, value);
    }
    if !headers.contains_key(header::DATE)
        && let Ok(value) = HeaderValue::from_str(&format_http_date(now))
    {
        headers.insert(header::DATE, value);
    }
}

/// True if a response with `status` never carries a body.
#[must_use]
pub fn status_suppresses_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// True if a response to `method` never carries a body.
#[must_use]
pub fn method_suppresses_body(method: &Method) -> bool {
    *method == Method::HEAD
}

/// Downgrade an outbound request to HTTP/1.0: strip 1.1-only mechanics.
pub fn convert_to_1_0_request(headers: &mut HeaderMap) {
    headers.remove(header::TE);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    remove_100_continue_header(headers);
}

/// Upgrade a header block to HTTP/1.1 semantics: the legacy
/// `Proxy-Connection` has no meaning end-to-end.
pub fn convert_to_1_1_request(headers: &mut HeaderMap) {
    headers.remove(PROXY_CONNECTION);
}

/// Render a unix timestamp as an IMF-fixdate string. Timestamps before
/// the epoch clamp to it.
#[must_use]
pub fn format_http_date(epoch: i64) -> String {
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(epoch.max(0) as u64))
}

/// Parse an HTTP date header value (IMF-fixdate, or the legacy RFC 850
/// and asctime forms) into unix seconds.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<i64> {
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                header::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn hop_by_hop_stripped_on_copy() {
        let src = headers(&[
            ("connection", "keep-alive"),
            ("upgrade", "h2c"),
            ("te", "trailers"),
            ("host", "example.com"),
            ("keep-alive", "timeout=5"),
        ]);
        let out = copy_header_fields(&src, false, None);
        assert!(!out.contains_key(header::CONNECTION));
        assert!(!out.contains_key(header::UPGRADE));
        assert!(!out.contains_key(header::TE));
        assert!(out.contains_key(header::HOST));
        // Keep-Alive survives the hop-by-hop rule
        assert_eq!(out.get("keep-alive").unwrap(), "timeout=5");
    }

    #[test]
    fn proxy_authorization_retained_only_on_request() {
        let src = headers(&[("proxy-authorization", "Basic Zm9vOmJhcg==")]);
        let stripped = copy_header_fields(&src, false, None);
        assert!(!stripped.contains_key(header::PROXY_AUTHORIZATION));

        let retained = copy_header_fields(&src, true, None);
        assert!(retained.contains_key(header::PROXY_AUTHORIZATION));
    }

    #[test]
    fn copy_equals_print_for_plain_fields() {
        let src = headers(&[
            ("content-type", "text/html"),
            ("etag", "\"abc\""),
            ("cache-control", "max-age=60"),
        ]);
        let out = copy_header_fields(&src, false, None);
        for (name, value) in &src {
            assert_eq!(out.get(name).unwrap(), value);
        }
    }

    #[test]
    fn date_set_when_absent() {
        let src = headers(&[("content-type", "text/plain")]);
        let out = copy_header_fields(&src, false, Some(784_111_777));
        assert_eq!(
            out.get(header::DATE).unwrap(),
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );
    }

    #[test]
    fn http_date_parses_known_forms() {
        // RFC 7231 ties all three forms to the same instant
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784_111_777)
        );
        assert_eq!(
            parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"),
            Some(784_111_777)
        );
        assert_eq!(parse_http_date("Sun Nov  6 08:49:37 1994"), Some(784_111_777));
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn normalize_ae_gzip_mode() {
        let mut h = headers(&[("accept-encoding", "gzip, deflate, br")]);
        normalize_accept_encoding(&mut h, NormalizeAe::Gzip);
        assert_eq!(h.get(header::ACCEPT_ENCODING).unwrap(), "gzip");

        let mut h = headers(&[("accept-encoding", "deflate")]);
        normalize_accept_encoding(&mut h, NormalizeAe::Gzip);
        assert!(!h.contains_key(header::ACCEPT_ENCODING));
    }

    #[test]
    fn normalize_ae_brotli_mode() {
        let mut h = headers(&[("accept-encoding", "gzip, br")]);
        normalize_accept_encoding(&mut h, NormalizeAe::BrotliThenGzip);
        assert_eq!(h.get(header::ACCEPT_ENCODING).unwrap(), "br");

        let mut h = headers(&[("accept-encoding", "gzip;q=0.5")]);
        normalize_accept_encoding(&mut h, NormalizeAe::BrotliThenGzip);
        assert_eq!(h.get(header::ACCEPT_ENCODING).unwrap(), "gzip");

        let mut h = headers(&[("accept-encoding", "identity")]);
        normalize_accept_encoding(&mut h, NormalizeAe::BrotliThenGzip);
        assert!(!h.contains_key(header::ACCEPT_ENCODING));
    }

    #[test]
    fn normalize_ae_off_leaves_header() {
        let mut h = headers(&[("accept-encoding", "deflate")]);
        normalize_accept_encoding(&mut h, NormalizeAe::Off);
        assert_eq!(h.get(header::ACCEPT_ENCODING).unwrap(), "deflate");
    }

    #[test]
    fn hsts_header_forms() {
        let mut h = HeaderMap::new();
        let mut config = ProxyConfig { hsts_max_age: 600, ..ProxyConfig::default() };
        insert_hsts_header(&mut h, &config);
        assert_eq!(
            h.get(header::STRICT_TRANSPORT_SECURITY).unwrap(),
            "max-age=600"
        );

        config.hsts_include_subdomains = true;
        insert_hsts_header(&mut h, &config);
        assert_eq!(
            h.get(header::STRICT_TRANSPORT_SECURITY).unwrap(),
            "max-age=600; includeSubDomains"
        );
    }

    #[test]
    fn age_calculation_follows_rfc7234() {
        // Response carried Age: 100, Date 50s before arrival, 10s request
        // delay, observed 30s after arrival.
        let request_time = 1000;
        let response_time = 1010;
        let date_value = 960;
        let age_value = 100;
        let now = 1040;

        // apparent = max(0, 1010-960) = 50; corrected_received = max(50,100)
        // = 100; initial = 100 + 10 = 110; resident = 1040-1010 = 30
        assert_eq!(
            calculate_document_age(request_time, response_time, age_value, date_value, now),
            140
        );
    }

    #[test]
    fn age_handles_clock_skew() {
        // "now" behind response_time clamps resident time to zero
        assert_eq!(calculate_document_age(0, 100, 0, 100, 50), 0);
    }

    #[test]
    fn age_negative_overflow_propagates() {
        assert_eq!(calculate_document_age(0, 10, -1, 0, 20), -1);
    }

    #[test]
    fn conditional_headers_removed_together() {
        let mut h = headers(&[
            ("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("if-none-match", "\"v1\""),
            ("range", "bytes=0-1023"),
        ]);
        remove_conditional_headers(&mut h);
        assert!(!h.contains_key(header::IF_MODIFIED_SINCE));
        assert!(!h.contains_key(header::IF_NONE_MATCH));
        assert!(h.contains_key(header::RANGE));
    }

    #[test]
    fn expect_100_continue_removed() {
        let mut h = headers(&[("expect", "100-continue")]);
        remove_100_continue_header(&mut h);
        assert!(!h.contains_key(header::EXPECT));

        let mut h = headers(&[("expect", "something-else")]);
        remove_100_continue_header(&mut h);
        assert!(h.contains_key(header::EXPECT));
    }

    #[test]
    fn server_header_modes() {
        let mut config = ProxyConfig {
            response_server_enabled: 1,
            response_server_string: "MIDSPAN/0.1".to_string(),
            ..ProxyConfig::default()
        };

        let mut h = HeaderMap::new();
        add_server_header(&mut h, &config);
        assert_eq!(h.get(header::SERVER).unwrap(), "MIDSPAN/0.1");

        // Mode 1 keeps an origin-supplied value
        let mut h = headers(&[("server", "origin/9")]);
        add_server_header(&mut h, &config);
        assert_eq!(h.get(header::SERVER).unwrap(), "origin/9");

        // Mode 2 overwrites it
        config.response_server_enabled = 2;
        add_server_header(&mut h, &config);
        assert_eq!(h.get(header::SERVER).unwrap(), "MIDSPAN/0.1");
    }

    #[test]
    fn privacy_headers_removed() {
        let config = ProxyConfig {
            anonymize_remove_cookie: true,
            anonymize_remove_user_agent: true,
            anonymize_other_headers: vec!["x-internal-debug".to_string()],
            ..ProxyConfig::default()
        };
        let mut h = headers(&[
            ("cookie", "session=1"),
            ("user-agent", "curl/8"),
            ("x-internal-debug", "1"),
            ("accept", "*/*"),
        ]);
        remove_privacy_headers(&mut h, &config);
        assert!(!h.contains_key(header::COOKIE));
        assert!(!h.contains_key(header::USER_AGENT));
        assert!(!h.contains_key("x-internal-debug"));
        assert!(h.contains_key(header::ACCEPT));
    }

    #[test]
    fn body_suppression_rules() {
        assert!(status_suppresses_body(StatusCode::CONTINUE));
        assert!(status_suppresses_body(StatusCode::NO_CONTENT));
        assert!(status_suppresses_body(StatusCode::NOT_MODIFIED));
        assert!(!status_suppresses_body(StatusCode::OK));
        assert!(method_suppresses_body(&Method::HEAD));
        assert!(!method_suppresses_body(&Method::GET));
    }

    #[test]
    fn downgrade_strips_11_mechanics() {
        let mut h = headers(&[
            ("transfer-encoding", "chunked"),
            ("expect", "100-continue"),
            ("host", "example.com"),
        ]);
        convert_to_1_0_request(&mut h);
        assert!(!h.contains_key(header::TRANSFER_ENCODING));
        assert!(!h.contains_key(header::EXPECT));
        assert!(h.contains_key(header::HOST));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Current age never decreases as the clock advances.
            #[test]
            fn age_monotone_in_now(
                request_time in 0i64..1_000_000,
                delay in 0i64..10_000,
                age_value in 0i64..1_000_000,
                date_skew in -10_000i64..10_000,
                later in 0i64..1_000_000,
            ) {
                let response_time = request_time + delay;
                let date_value = (response_time + date_skew).max(0);
                let a = calculate_document_age(
                    request_time, response_time, age_value, date_value, response_time,
                );
                let b = calculate_document_age(
                    request_time, response_time, age_value, date_value, response_time + later,
                );
                prop_assert!(b >= a);
                prop_assert!(a >= 0);
            }

            /// An HTTP date survives a format/parse round trip.
            #[test]
            fn http_date_round_trips(epoch in 0i64..4_102_444_800) {
                prop_assert_eq!(parse_http_date(&format_http_date(epoch)), Some(epoch));
            }

            /// Copying a header block never invents or loses plain fields.
            #[test]
            fn copy_preserves_plain_fields(values in prop::collection::vec("[a-z0-9]{1,12}", 1..8)) {
                let mut src = HeaderMap::new();
                for (i, value) in values.iter().enumerate() {
                    let name = header::HeaderName::try_from(format!("x-field-{i}")).unwrap();
                    src.insert(name, HeaderValue::from_str(value).unwrap());
                }
                let out = copy_header_fields(&src, false, None);
                for (name, value) in &src {
                    prop_assert_eq!(out.get(name).unwrap(), value);
                }
                prop_assert_eq!(out.len(), src.len());
            }
        }
    }
}
