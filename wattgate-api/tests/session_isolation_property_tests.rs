//! Property tests for session isolation.
//!
//! A session bound to one customer must never reach upstream data for another,
//! whatever identity the caller puts in the request.

mod support;

use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::json;
use support::{gateway_post, TestApp};
use wattgate_test_utils::fixtures::{metering_points_payload, time_series_payload};
use wattgate_test_utils::generators::{
    arb_aggregation, arb_customer_id, arb_cvr, arb_date, arb_metering_point_id,
};
use wattgate_test_utils::FakeUpstream;

const ONE_KWH: &[&str] = &["1"];

fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Runtime::new().unwrap().block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_foreign_customer_is_rejected_before_upstream(
        bound in arb_cvr(),
        requested in arb_cvr(),
        use_identifier in any::<bool>(),
        action in prop_oneof![
            Just("thirdparty-authorizations"),
            Just("thirdparty-consumption"),
        ],
    ) {
        prop_assume!(bound != requested);

        let (status, body, upstream_calls) = run(async {
            let app = TestApp::new(FakeUpstream::new());
            app.bind("session-prop", &bound).await;

            let field = if use_identifier { "identifier" } else { "customerId" };
            let mut body = json!({
                "action": action,
                "dateFrom": "2024-01-01",
                "dateTo": "2024-01-31",
            });
            body[field] = json!(requested);

            let (status, _, body) = app.send(gateway_post(body, Some("session-prop"))).await;
            (status, body, app.upstream.total_calls())
        });

        prop_assert_eq!(status, 403);
        prop_assert_eq!(&body["error"], "CUSTOMER_MISMATCH");
        prop_assert_eq!(upstream_calls, 0);
    }

    #[test]
    fn prop_numeric_customer_id_matches_its_string_form(bound in arb_cvr()) {
        let (status, upstream_calls) = run(async {
            let upstream = FakeUpstream::new().with_authorizations(
                wattgate_test_utils::fixtures::authorizations_payload(&[
                    wattgate_test_utils::fixtures::authorization(
                        wattgate_test_utils::fixtures::TEST_AUTHORIZATION_ID,
                        &bound,
                        "Bound Customer",
                    ),
                ]),
            );
            let app = TestApp::new(upstream);
            app.bind("session-prop", &bound).await;

            let numeric: u64 = bound.parse().unwrap();
            let (status, _, _) = app
                .send(gateway_post(
                    json!({ "action": "thirdparty-authorizations", "customerId": numeric }),
                    Some("session-prop"),
                ))
                .await;
            (status, app.upstream.total_calls())
        });

        prop_assert_eq!(status, 200);
        prop_assert!(upstream_calls >= 1);
    }

    #[test]
    fn prop_bound_customer_reads_only_own_metering_points(
        bound in arb_customer_id(),
        ids in prop::collection::hash_set(arb_metering_point_id(), 1..4),
        date_from in arb_date(),
        date_to in arb_date(),
        aggregation in arb_aggregation(),
    ) {
        let ids: Vec<String> = ids.into_iter().collect();
        let (status, body, sent) = run(async {
            let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let series: Vec<(&str, &[&str])> =
                id_refs.iter().map(|id| (*id, ONE_KWH)).collect();
            let upstream = FakeUpstream::new()
                .with_metering_points(metering_points_payload(&id_refs))
                .with_time_series(time_series_payload(&series));
            let app = TestApp::new(upstream);
            app.bind("session-prop", &bound).await;

            let (status, _, body) = app
                .send(gateway_post(
                    json!({
                        "action": "thirdparty-consumption",
                        "dateFrom": date_from.to_string(),
                        "dateTo": date_to.to_string(),
                        "aggregation": aggregation.as_str(),
                    }),
                    Some("session-prop"),
                ))
                .await;
            (status, body, app.upstream.last_time_series_ids())
        });

        prop_assert_eq!(status, 200, "{}", body);
        prop_assert_eq!(&body["customerId"], &json!(bound));
        prop_assert_eq!(&body["aggregation"], &json!(aggregation.as_str()));
        prop_assert!(body["dateFrom"].as_str() <= body["dateTo"].as_str());
        prop_assert_eq!(body["totalConsumption"].as_f64(), Some(ids.len() as f64));
        let sent: HashSet<String> = sent.into_iter().collect();
        let expected: HashSet<String> = ids.into_iter().collect();
        prop_assert_eq!(sent, expected);
    }
}
