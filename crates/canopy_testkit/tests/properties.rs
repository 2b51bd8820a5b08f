//! Property tests: every client converges on the server state.

use canopy_sync_engine::{EventType, Mutation, QueryOps};
use canopy_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::{Map, Value as Json};

fn apply(client: &TestClient, op: TreeOp) {
    let (path, kind, payload) = op.into_write();
    let reference = client.reference(&path).unwrap();
    // Rejected payloads never reach the cache or the server.
    let _ = reference.write(kind, payload);
}

fn last_value(log: &EventLog) -> Option<Json> {
    log.take_values().pop()
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn single_client_matches_server(ops in prop::collection::vec(tree_op_strategy(3), 1..12)) {
        let harness = TestHarness::new();
        let client = harness.client();
        let log = EventLog::new();
        client.root().on(log.options(EventType::Value)).unwrap();

        for op in ops {
            apply(&client, op);
        }
        settle(&client);

        prop_assert_eq!(client.outstanding_writes(), 0);
        prop_assert_eq!(last_value(&log), Some(harness.server.value("/").unwrap()));
    }

    #[test]
    fn interleaved_clients_converge(
        ops in prop::collection::vec((any::<bool>(), tree_op_strategy(2)), 1..12)
    ) {
        let harness = TestHarness::new();
        let alice = harness.client();
        let bob = harness.client();
        let alice_log = EventLog::new();
        let bob_log = EventLog::new();
        alice.root().on(alice_log.options(EventType::Value)).unwrap();
        bob.root().on(bob_log.options(EventType::Value)).unwrap();

        for (by_alice, op) in ops {
            apply(if by_alice { &alice } else { &bob }, op);
        }
        settle(&alice);
        settle(&bob);

        let server = harness.server.value("/").unwrap();
        prop_assert_eq!(last_value(&alice_log), Some(server.clone()));
        prop_assert_eq!(last_value(&bob_log), Some(server));
    }

    #[test]
    fn first_n_by_value(
        scores in prop::collection::btree_map(key_strategy(), -50i64..50, 0..8),
        limit in 1usize..5,
    ) {
        let harness = TestHarness::new();
        let seeded: Map<String, Json> = scores
            .iter()
            .map(|(k, v)| (k.clone(), Json::from(*v)))
            .collect();
        harness.server.set_value("/scores", Json::Object(seeded)).unwrap();

        let client = harness.client();
        let log = EventLog::new();
        client
            .reference("scores")
            .unwrap()
            .order_by_value()
            .unwrap()
            .limit_to_first(limit)
            .unwrap()
            .on(log.options(EventType::ChildAdded))
            .unwrap();
        settle(&client);

        let mut expected: Vec<(i64, String)> =
            scores.into_iter().map(|(k, v)| (v, k)).collect();
        expected.sort();
        expected.truncate(limit);
        let added = log.take();
        prop_assert_eq!(added.len(), expected.len());
        let mut prev: Option<String> = None;
        for (event, (value, key)) in added.iter().zip(&expected) {
            prop_assert_eq!(event.key.as_deref(), Some(key.as_str()));
            prop_assert_eq!(&event.value, &Json::from(*value));
            prop_assert_eq!(&event.prev_key, &prev);
            prev = Some(key.clone());
        }
    }
}
