use chrono::Utc;
use proptest::prelude::*;
use vigil::{Config, Event, RequestEvent};
use vigil_consume::MonitorState;

fn event(id: &str, completion: Option<(u16, f64)>) -> Event {
    Event::Request(RequestEvent {
        id: id.to_string(),
        endpoint: "/orders/{id}".to_string(),
        method: "PUT".to_string(),
        status_code: completion.map(|(status, _)| status),
        duration_ms: completion.map(|(_, duration)| duration),
        client: "10.0.0.1".to_string(),
        timestamp: Utc::now(),
        request_params: None,
        request_body: None,
        request_headers: None,
        response_body: None,
        runtime_logs: vec![],
        exceptions: vec![],
        pending: completion.is_none(),
        completed: completion.is_some(),
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn one_hit_per_id_matching_the_last_completion(
        completions in prop::collection::vec((100u16..600, 0.0f64..5000.0), 1..8),
        extra_pending in 0usize..3,
    ) {
        let mut state = MonitorState::new(&Config::default());
        state.apply(event("req", None));
        for (i, (status, duration)) in completions.iter().enumerate() {
            state.apply(event("req", Some((*status, *duration))));
            if i < extra_pending {
                state.apply(event("req", None));
            }
        }

        let hits = state.hits("/orders/{id}");
        prop_assert_eq!(hits.len(), 1);
        let (status, duration) = completions[completions.len() - 1];
        prop_assert!(!hits[0].pending);
        prop_assert_eq!(hits[0].status_code, Some(status));
        prop_assert_eq!(hits[0].duration_ms, Some(duration));

        let stats = state.stats("/orders/{id}").unwrap();
        prop_assert_eq!(stats.total_hits, 1);
        prop_assert_eq!(stats.success_count + stats.error_count, 1);
    }

    #[test]
    fn total_hits_counts_distinct_ids(ids in prop::collection::vec(0u8..20, 1..60)) {
        let mut state = MonitorState::new(&Config::default());
        for id in &ids {
            state.apply(event(&format!("r{id}"), None));
            state.apply(event(&format!("r{id}"), Some((200, 1.0))));
        }
        let distinct: std::collections::HashSet<_> = ids.iter().collect();
        prop_assert_eq!(state.stats("/orders/{id}").unwrap().total_hits, distinct.len() as u64);
    }
}
