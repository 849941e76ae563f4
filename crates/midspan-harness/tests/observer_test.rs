//! Observer callout semantics at the transaction level: deferral parks the
//! machine, a shutdown arriving mid-callout is deferred until re-enable,
//! and an observer error produces the plugin-error response.

use std::sync::{Arc, Mutex};

use http::{HeaderMap, Method, StatusCode};
use midspan_core::{
    CalloutStatus, HookId, ObserverVerdict, ProxyConfig, TxnObserver,
    hooks::TxnOverrides,
    transaction::{RequestBodyKind, TxnEvent},
};
use midspan_harness::SimRuntime;

struct FixedObserver {
    verdict: ObserverVerdict,
}

impl TxnObserver for FixedObserver {
    fn on_hook(&mut self, _hook: HookId, _overrides: &mut TxnOverrides) -> ObserverVerdict {
        self.verdict.clone()
    }
}

#[test]
fn deferred_observer_parks_transaction_and_shutdown_waits() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.60".parse().unwrap()]);

    let mut txn = sim.new_txn("203.0.113.3:41000", "192.0.2.1:8080");
    txn.register_observer(
        HookId::ReadRequestHdr,
        Arc::new(Mutex::new(FixedObserver { verdict: ObserverVerdict::Defer })),
    );

    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/",
        HeaderMap::new(),
        RequestBodyKind::None,
    );
    // Parked in the callout: no DNS or origin activity yet
    assert!(sim.origin.requests.is_empty());
    assert_eq!(txn.callout_status(), CalloutStatus::InCallout);

    // A shutdown arriving mid-callout must wait for the observer
    sim.drive(&mut txn, TxnEvent::Shutdown);
    assert_eq!(txn.callout_status(), CalloutStatus::DeferredClose);
    assert!(!sim.destroyed);

    // Re-enable: the deferred close now runs to completion
    sim.drive(&mut txn, TxnEvent::HookReenabled { verdict: ObserverVerdict::Continue });
    assert!(sim.destroyed);
    assert!(txn.is_dead());
}

#[test]
fn observer_error_becomes_plugin_error_response() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.60".parse().unwrap()]);

    let mut txn = sim.new_txn("203.0.113.3:41001", "192.0.2.1:8080");
    txn.register_observer(
        HookId::ReadRequestHdr,
        Arc::new(Mutex::new(FixedObserver { verdict: ObserverVerdict::Error })),
    );

    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/",
        HeaderMap::new(),
        RequestBodyKind::None,
    );

    assert!(sim.origin.requests.is_empty());
    let response = sim.responses.last().unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(sim.destroyed);
}

#[test]
fn observer_continue_is_transparent() {
    let mut sim = SimRuntime::new(ProxyConfig::default());
    sim.resolver
        .insert("origin.example.com", vec!["192.0.2.60".parse().unwrap()]);

    let mut txn = sim.new_txn("203.0.113.3:41002", "192.0.2.1:8080");
    for hook in [HookId::ReadRequestHdr, HookId::SendRequestHdr, HookId::SendResponseHdr] {
        txn.register_observer(
            hook,
            Arc::new(Mutex::new(FixedObserver { verdict: ObserverVerdict::Continue })),
        );
    }

    sim.run_request(
        &mut txn,
        Method::GET,
        "http://origin.example.com/",
        HeaderMap::new(),
        RequestBodyKind::None,
    );

    assert_eq!(sim.origin.requests.len(), 1);
    assert_eq!(sim.responses.last().unwrap().status, StatusCode::OK);
    assert!(sim.destroyed);
}
