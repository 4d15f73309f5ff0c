//! End-to-end scenarios over the multi-client harness: sliding, detach,
//! local-wins conflict ordering, index coherence under slides, reconnect
//! rebase, and the serialization boundary cases.

mod harness;

use std::cell::RefCell;
use std::rc::Rc;

use harness::{World, LABEL};
use interval_collection::collection::{CollectionOptions, IntervalError};
use interval_collection::ops::{load_collection, store_collection, SerializedCollection};
use interval_collection::properties::PropertySet;
use interval_collection::{IntervalStickiness, IntervalType, DETACHED_POSITION};
use serde_json::json;

fn props(pairs: &[(&str, serde_json::Value)]) -> PropertySet {
    pairs.iter().map(|(k, v)| ((*k).into(), v.clone())).collect()
}

#[test]
fn basic_slide() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "ABCD");
    w.settle();

    let interval = w
        .client(0)
        .collection
        .add(1, 3, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();
    w.settle();
    assert_eq!(w.client(1).positions(&id), (1, 3));

    w.client(0).remove(2, 3);
    // Pending local removal: A already observes the shifted positions.
    assert_eq!(w.client(0).positions(&id), (1, 2));

    w.settle();
    assert_eq!(w.client(0).client.text(), "ABD");
    assert_eq!(w.client(0).positions(&id), (1, 2));
    assert_eq!(w.client(1).positions(&id), (1, 2));
    w.assert_converged();
}

#[test]
fn interval_on_fully_removed_text_detaches() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "ABCDEF");
    w.settle();

    // B removes everything; A concurrently creates (1,1); B then inserts
    // "X". Sequencer order: remove, add, insert.
    w.client(1).remove(0, 6);
    w.sequence_from(1);
    let interval = w
        .client(0)
        .collection
        .add(1, 1, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();
    w.sequence_from(0);
    w.client(1).insert(0, "X");
    w.sequence_from(1);
    w.deliver_all();

    for idx in [0, 1] {
        let client = w.client(idx);
        assert_eq!(client.client.text(), "X");
        assert_eq!(
            client.positions(&id),
            (DETACHED_POSITION, DETACHED_POSITION),
            "client {idx} did not detach"
        );
        let found = client.collection.find_overlapping_intervals(0, 0).unwrap();
        assert!(found.iter().all(|iv| iv.id().unwrap() != id.as_str()));
        let found = client.collection.find_overlapping_intervals(0, 1).unwrap();
        assert!(found.iter().all(|iv| iv.id().unwrap() != id.as_str()));
    }
    w.assert_converged();
}

#[test]
fn concurrent_change_local_wins() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "0123456789");
    w.settle();

    let interval = w
        .client(0)
        .collection
        .add(0, 0, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();
    w.settle();
    assert_eq!(w.client(0).positions(&id), (0, 0));

    // Record every endpoint move A observes.
    let observed = Rc::new(RefCell::new(vec![w.client(0).positions(&id)]));
    {
        let observed = observed.clone();
        w.client(0)
            .collection
            .events()
            .change_interval
            .on(move |args| {
                observed.borrow_mut().push((
                    args.interval.start_position(),
                    args.interval.end_position(),
                ));
            });
    }

    // Interleaved submissions: B(1,1), A(2,2), B(3,3), A(4,4).
    w.client(1).collection.change(&id, Some(1), Some(1)).unwrap();
    w.sequence_from(1);
    w.client(0).collection.change(&id, Some(2), Some(2)).unwrap();
    w.sequence_from(0);
    w.client(1).collection.change(&id, Some(3), Some(3)).unwrap();
    w.sequence_from(1);
    w.client(0).collection.change(&id, Some(4), Some(4)).unwrap();
    w.sequence_from(0);
    w.deliver_all();

    // A only ever observed its own changes.
    assert_eq!(*observed.borrow(), vec![(0, 0), (2, 2), (4, 4)]);
    assert_eq!(w.client(0).positions(&id), (4, 4));
    assert_eq!(w.client(1).positions(&id), (4, 4));
    w.assert_converged();
}

#[test]
fn indices_stay_coherent_while_endpoints_pend_a_slide() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "ABCDEFG");
    w.settle();

    let add = |start, end| {
        w.client(0)
            .collection
            .add(start, end, IntervalType::SLIDE_ON_REMOVE, None, None)
            .unwrap()
            .id()
            .unwrap()
            .to_string()
    };
    let outer = add(1, 6);
    let middle = add(2, 5);
    let inner = add(3, 4);
    w.settle();

    w.client(0).remove(1, 5);
    // Unacked removal: every start already reports the collapsed position.
    assert_eq!(w.client(0).positions(&outer), (1, 2));
    assert_eq!(w.client(0).positions(&middle), (1, 1));
    assert_eq!(w.client(0).positions(&inner), (1, 1));

    // Removing an interval mid-burst must find it in every index.
    assert!(w
        .client(0)
        .collection
        .remove_interval_by_id(&inner)
        .is_some());
    w.settle();

    for idx in [0, 1] {
        let client = w.client(idx);
        assert_eq!(client.client.text(), "AFG");
        assert_eq!(client.positions(&outer), (1, 2));
        assert_eq!(client.positions(&middle), (1, 1));
        assert!(client.collection.get_interval_by_id(&inner).is_none());
    }
    w.assert_converged();
}

#[test]
fn reconnect_rebases_pending_add() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "hello friend");
    w.settle();

    // A disconnects and creates an interval over "ri".
    let interval = w
        .client(0)
        .collection
        .add(6, 8, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();

    // Meanwhile B expands the text.
    w.client(1).insert(7, "amily its my f");
    w.sequence_from(1);
    w.deliver_to(1);
    assert_eq!(w.client(1).client.text(), "hello family its my friend");

    // A reconnects: catch up, rebase pending ops, resubmit.
    w.deliver_to(0);
    w.rebase_pending(0);
    w.sequence_from(0);
    w.deliver_all();

    assert_eq!(w.client(0).positions(&id), (6, 22));
    assert_eq!(w.client(1).positions(&id), (6, 22));
    w.assert_converged();
}

#[test]
fn reconnect_drops_op_for_removed_text() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "ABCDEF");
    w.settle();

    let interval = w
        .client(0)
        .collection
        .add(2, 4, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();

    // B removes the whole document while A is offline.
    w.client(1).remove(0, 6);
    w.sequence_from(1);
    w.deliver_to(1);

    w.deliver_to(0);
    w.rebase_pending(0);
    // The pending add became a no-op and the local interval is gone.
    assert!(w.client(0).outbox.borrow().is_empty());
    assert!(w.client(0).collection.get_interval_by_id(&id).is_none());
    w.settle();
    w.assert_converged();
}

#[test]
fn pre_ack_interval_does_not_slide_into_overlap_searches() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "ABCD");
    w.settle();

    // A creates (1,2) over "BC"; before the add is sequenced, B's removal
    // of "BC" arrives. The pending endpoints stay put until ack.
    let interval = w
        .client(0)
        .collection
        .add(1, 2, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();
    w.client(1).remove(1, 3);
    w.sequence_from(1);
    w.deliver_all();

    assert_eq!(w.client(0).client.text(), "AD");
    assert_eq!(w.client(0).positions(&id), (1, 1));
    // Historically documented behavior: the un-acked start has not slid,
    // so a search over the surviving position misses the interval.
    let found = w.client(0).collection.find_overlapping_intervals(1, 1).unwrap();
    assert!(found.iter().all(|iv| iv.id().unwrap() != id.as_str()));

    // Ack promotes and slides the endpoints; now the search finds it.
    w.rebase_pending(0);
    w.sequence_from(0);
    w.deliver_all();
    assert_eq!(w.client(0).positions(&id), (1, 1));
    let found = w.client(0).collection.find_overlapping_intervals(1, 1).unwrap();
    assert!(found.iter().any(|iv| iv.id().unwrap() == id.as_str()));
    w.assert_converged();
}

#[test]
fn property_changes_converge_with_local_wins() {
    let mut w = World::new(&["A", "B"]);
    w.client(0).insert(0, "ABCD");
    w.settle();
    let interval = w
        .client(0)
        .collection
        .add(0, 2, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();
    w.settle();

    w.client(0)
        .collection
        .change_properties(&id, props(&[("color", json!("red"))]))
        .unwrap();
    w.sequence_from(0);
    w.client(1)
        .collection
        .change_properties(&id, props(&[("color", json!("blue")), ("weight", json!(2))]))
        .unwrap();
    w.sequence_from(1);
    w.deliver_all();

    // B's pending "color" beat A's remote value at B; once acked, B's op
    // is the last writer everywhere.
    for idx in [0, 1] {
        let interval = w.client(idx).collection.get_interval_by_id(&id).unwrap();
        assert_eq!(
            interval.with_properties(|p| p.get("color").cloned()),
            Some(json!("blue"))
        );
        assert_eq!(
            interval.with_properties(|p| p.get("weight").cloned()),
            Some(json!(2))
        );
    }
    w.assert_converged();
}

// ---------------------------------------------------------------------
// Rejection / boundary behavior
// ---------------------------------------------------------------------

#[test]
fn add_on_empty_string_is_rejected() {
    let w = World::new(&["A"]);
    let result = w
        .client(0)
        .collection
        .add(0, 0, IntervalType::SLIDE_ON_REMOVE, None, None);
    assert!(matches!(result, Err(IntervalError::OutOfBounds(_))));
}

#[test]
fn add_past_end_is_rejected() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "AB");
    w.settle();
    let result = w
        .client(0)
        .collection
        .add(0, 5, IntervalType::SLIDE_ON_REMOVE, None, None);
    assert!(matches!(result, Err(IntervalError::OutOfBounds(5))));
}

#[test]
fn transient_add_is_rejected() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "AB");
    w.settle();
    let result = w
        .client(0)
        .collection
        .add(0, 1, IntervalType::TRANSIENT, None, None);
    assert!(matches!(result, Err(IntervalError::TransientInterval)));
}

#[test]
fn stickiness_requires_feature_option() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "AB");
    w.settle();
    let result = w.client(0).collection.add(
        0,
        1,
        IntervalType::SLIDE_ON_REMOVE,
        None,
        Some(IntervalStickiness::FULL),
    );
    assert!(matches!(result, Err(IntervalError::StickinessDisabled)));

    let mut w = World::with_options(
        &["A"],
        CollectionOptions {
            interval_stickiness_enabled: true,
        },
    );
    w.client(0).insert(0, "AB");
    w.settle();
    assert!(w
        .client(0)
        .collection
        .add(
            0,
            1,
            IntervalType::SLIDE_ON_REMOVE,
            None,
            Some(IntervalStickiness::FULL),
        )
        .is_ok());
}

#[test]
fn reserved_properties_cannot_be_overwritten() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "AB");
    w.settle();
    let interval = w
        .client(0)
        .collection
        .add(0, 1, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    let id = interval.id().unwrap().to_string();
    w.settle();

    let result = w
        .client(0)
        .collection
        .change_properties(&id, props(&[("rangeLabels", json!(["other"]))]));
    assert!(matches!(result, Err(IntervalError::ReservedProperty(_))));
    let result = w
        .client(0)
        .collection
        .change_properties(&id, props(&[("intervalId", json!("forged"))]));
    assert!(matches!(result, Err(IntervalError::ReservedProperty(_))));
}

#[test]
fn change_of_unknown_id_returns_none() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "AB");
    w.settle();
    assert!(w
        .client(0)
        .collection
        .change("no-such-id", Some(0), Some(1))
        .unwrap()
        .is_none());
    assert!(w.client(0).collection.remove_interval_by_id("nope").is_none());
}

// ---------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------

#[test]
fn store_load_roundtrip_preserves_state() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "hello world");
    w.settle();
    w.client(0)
        .collection
        .add(
            0,
            4,
            IntervalType::SLIDE_ON_REMOVE,
            Some(props(&[("kind", json!("greeting"))])),
            None,
        )
        .unwrap();
    w.client(0)
        .collection
        .add(6, 10, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    w.settle();

    let stored = store_collection(&w.client(0).collection);
    assert_eq!(stored.version, 2);
    assert_eq!(stored.label.as_str(), LABEL);
    // rangeLabels is stripped from rows; it lives in the label field.
    for row in &stored.intervals {
        assert!(!row.properties.contains_key("rangeLabels"));
    }

    let json_text = serde_json::to_string(&stored).unwrap();
    let parsed: SerializedCollection = serde_json::from_str(&json_text).unwrap();
    let reloaded = load_collection(
        LABEL,
        Some(w.client(0).client.clone()),
        parsed,
        CollectionOptions::default(),
    );
    reloaded.attach(Box::new(|_, _| {})).unwrap();

    let tuples = |collection: &interval_collection::IntervalCollection| {
        let mut rows: Vec<(String, i64, i64)> = collection
            .iter()
            .map(|iv| {
                (
                    iv.id().unwrap().to_string(),
                    iv.start_position(),
                    iv.end_position(),
                )
            })
            .collect();
        rows.sort();
        rows
    };
    assert_eq!(tuples(&w.client(0).collection), tuples(&reloaded));

    // Storing the reloaded collection is identical modulo row order.
    let restored = store_collection(&reloaded);
    assert_eq!(
        serde_json::to_value(&stored).unwrap(),
        serde_json::to_value(&restored).unwrap()
    );
}

#[test]
fn v1_rows_without_ids_get_deterministic_legacy_ids() {
    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "ABCDEF");
    w.settle();

    let v1 = r#"[{"start":1,"end":4,"sequenceNumber":1,"intervalType":2}]"#;
    let parsed: SerializedCollection = serde_json::from_str(v1).unwrap();
    let collection = load_collection(
        LABEL,
        Some(w.client(0).client.clone()),
        parsed,
        CollectionOptions::default(),
    );
    collection.attach(Box::new(|_, _| {})).unwrap();

    let interval = collection.get_interval_by_id("legacy1-4").unwrap();
    assert_eq!(interval.start_position(), 1);
    assert_eq!(interval.end_position(), 4);
}

#[test]
fn attached_index_sees_existing_and_future_intervals() {
    use interval_collection::index::EndpointInRangeIndex;

    let mut w = World::new(&["A"]);
    w.client(0).insert(0, "ABCDEFG");
    w.settle();
    let first = w
        .client(0)
        .collection
        .add(1, 3, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    w.settle();

    let index = Rc::new(RefCell::new(EndpointInRangeIndex::new(
        w.client(0).client.clone(),
        LABEL,
    )));
    w.client(0).collection.attach_index(index.clone()).unwrap();

    let second = w
        .client(0)
        .collection
        .add(2, 5, IntervalType::SLIDE_ON_REMOVE, None, None)
        .unwrap();
    w.settle();

    let ends_in_1_to_3: Vec<String> = index
        .borrow()
        .find_intervals_with_endpoint_in_range(1, 3)
        .iter()
        .map(|iv| iv.id().unwrap().to_string())
        .collect();
    assert_eq!(ends_in_1_to_3, vec![first.id().unwrap().to_string()]);

    let ends_in_1_to_5 = index.borrow().find_intervals_with_endpoint_in_range(1, 5);
    assert_eq!(ends_in_1_to_5.len(), 2);

    // Degenerate ranges return nothing.
    assert!(index
        .borrow()
        .find_intervals_with_endpoint_in_range(0, 3)
        .is_empty());
    assert!(index
        .borrow()
        .find_intervals_with_endpoint_in_range(4, 2)
        .is_empty());

    let as_dyn: Rc<RefCell<dyn interval_collection::index::IntervalIndex>> = index.clone();
    assert!(w.client(0).collection.detach_index(&as_dyn).unwrap());
    assert!(!w.client(0).collection.detach_index(&as_dyn).unwrap());
    let _ = second;
}
