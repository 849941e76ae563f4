//! Cache miss-fill-hit flow.
//!
//! The first request misses, fetches from origin, and commits the body to
//! the cache; the second request for the same URL is served from the cache
//! with no origin round trip.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use midspan_core::{
    ProxyConfig,
    cache::CachedObject,
    transaction::RequestBodyKind,
};
use midspan_harness::{OriginBehavior, SimRuntime};

fn ok_response(body: &'static [u8]) -> OriginBehavior {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string()).unwrap(),
    );
    OriginBehavior::Respond {
        status: StatusCode::OK,
        headers,
        body: Bytes::from_static(body),
    }
}

#[test]
fn miss_fills_cache_then_hit_serves_from_it() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.50".parse().unwrap()]);
    sim.origin.push(ok_response(b"cached payload"));

    // First request: miss, origin fetch, cache fill
    let mut txn = sim.new_txn("203.0.113.2:40001", "192.0.2.1:8080");
    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/object",
        HeaderMap::new(),
        RequestBodyKind::None,
    );
    assert_eq!(sim.origin.requests.len(), 1);
    assert_eq!(sim.client_tunnel_bytes, b"cached payload");
    assert!(sim.cache.get("http://origin.example.com/object").is_some());
    assert!(sim.destroyed);

    // Second request: served from cache, origin untouched
    sim.client_tunnel_bytes.clear();
    let mut txn = sim.new_txn("203.0.113.2:40002", "192.0.2.1:8080");
    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/object",
        HeaderMap::new(),
        RequestBodyKind::None,
    );
    assert_eq!(sim.origin.requests.len(), 1);

    let response = sim.responses.last().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref().unwrap().as_ref(), b"cached payload");
    // A cache-served response carries an Age
    assert!(response.headers.contains_key(header::AGE));
}

#[test]
fn cache_read_error_degrades_to_origin_fetch() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.50".parse().unwrap()]);
    sim.cache.fail_next_read = Some("disk error".into());
    sim.origin.push(ok_response(b"fresh"));

    let mut txn = sim.new_txn("203.0.113.2:40003", "192.0.2.1:8080");
    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/x",
        HeaderMap::new(),
        RequestBodyKind::None,
    );

    assert_eq!(sim.origin.requests.len(), 1);
    assert_eq!(sim.responses.last().unwrap().status, StatusCode::OK);
}

#[test]
fn write_lock_contention_serves_without_caching() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.50".parse().unwrap()]);
    sim.cache.contend_writes = true;
    sim.origin.push(ok_response(b"uncached"));

    let mut txn = sim.new_txn("203.0.113.2:40004", "192.0.2.1:8080");
    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/y",
        HeaderMap::new(),
        RequestBodyKind::None,
    );

    assert_eq!(sim.responses.last().unwrap().status, StatusCode::OK);
    assert_eq!(sim.client_tunnel_bytes, b"uncached");
    assert!(sim.cache.get("http://origin.example.com/y").is_none());
}

#[test]
fn seeded_hit_skips_origin_entirely() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.50".parse().unwrap()]);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    sim.cache.seed(
        "http://origin.example.com/seeded",
        CachedObject {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"<h1>hello</h1>"),
            request_sent_time: 1_000,
            response_received_time: 1_002,
        },
    );

    let mut txn = sim.new_txn("203.0.113.2:40005", "192.0.2.1:8080");
    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/seeded",
        HeaderMap::new(),
        RequestBodyKind::None,
    );

    assert!(sim.origin.requests.is_empty());
    let response = sim.responses.last().unwrap();
    assert_eq!(response.body.as_ref().unwrap().as_ref(), b"<h1>hello</h1>");
    assert!(txn.milestones.is_ordered());
}
