//! Property: for any configured redirect budget and any longer origin
//! loop, the machine makes exactly budget + 1 origin round trips and stops.

use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use midspan_core::{ProxyConfig, transaction::RequestBodyKind};
use midspan_harness::{OriginBehavior, SimRuntime};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn redirect_budget_bounds_origin_round_trips(
        budget in 1u32..6,
        extra_hops in 1usize..5,
    ) {
        let config = ProxyConfig { number_of_redirections: budget, ..ProxyConfig::default() };
        let mut sim = SimRuntime::new(config);
        sim.resolver
            .insert("loop.example.com", vec!["192.0.2.88".parse().unwrap()]);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://loop.example.com/"),
        );
        let hop = OriginBehavior::Respond {
            status: StatusCode::FOUND,
            headers,
            body: bytes::Bytes::new(),
        };
        sim.origin.push_repeated(&hop, budget as usize + extra_hops + 1);

        let mut txn = sim.new_txn("203.0.113.8:40100", "192.0.2.1:8080");
        sim.run_request(
            &mut txn,
            Method::GET,
            "http://loop.example.com/",
            HeaderMap::new(),
            RequestBodyKind::None,
        );

        prop_assert_eq!(sim.origin.requests.len(), budget as usize + 1);
        prop_assert_eq!(txn.redirects_followed(), budget);
        prop_assert_eq!(sim.responses.last().unwrap().status, StatusCode::FOUND);
        prop_assert!(sim.destroyed);
        prop_assert!(txn.milestones.is_ordered());
    }
}
