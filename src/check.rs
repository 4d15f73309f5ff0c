//! Cross-index consistency checking, used by tests and fuzzers after every
//! step. Panics on any disagreement.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::interval::{compare_ends, compare_ids, compare_starts, Interval, IntervalHandle};
use crate::local_collection::LocalIntervalCollection;

pub(crate) fn check_local_collection(collection: &LocalIntervalCollection) {
    let count = collection.id_index().len();
    assert_eq!(
        collection.endpoint_index().len(),
        count,
        "endpoint index out of sync with id index"
    );
    assert_eq!(
        collection.overlap_index().len(),
        count,
        "overlap index out of sync with id index"
    );

    // Every id-indexed interval appears in the ordered indices exactly once,
    // has an id, and has no slide burst in flight.
    collection.id_index().for_each(|interval| {
        let id = interval.id().expect("indexed interval without id");
        let by_id = collection
            .id_index()
            .get(&id)
            .expect("id lookup failed for indexed interval");
        assert!(
            Rc::ptr_eq(&by_id, interval),
            "id index maps {id} to a different interval"
        );
        if let Interval::Sequence(si) = &**interval {
            assert_eq!(
                si.slide_pending.get(),
                0,
                "interval {id} left a slide burst open"
            );
        }

        let mut seen = 0;
        collection.endpoint_index().for_each(|other| {
            if Rc::ptr_eq(other, interval) {
                seen += 1;
            }
        });
        assert_eq!(seen, 1, "interval {id} not exactly once in endpoint index");

        let mut seen = 0;
        collection.overlap_index().for_each(|other| {
            if Rc::ptr_eq(other, interval) {
                seen += 1;
            }
        });
        assert_eq!(seen, 1, "interval {id} not exactly once in overlap index");
    });

    // Ordered indices really are ordered under their comparators.
    let mut previous: Option<IntervalHandle> = None;
    collection.endpoint_index().for_each(|interval| {
        if let Some(prev) = &previous {
            let order = compare_ends(prev, interval).then_with(|| compare_ids(prev, interval));
            assert_ne!(order, Ordering::Greater, "endpoint index order violated");
        }
        previous = Some(interval.clone());
    });

    let mut previous: Option<IntervalHandle> = None;
    collection.overlap_index().for_each(|interval| {
        if let Some(prev) = &previous {
            let order = compare_starts(prev, interval)
                .then_with(|| compare_ends(prev, interval))
                .then_with(|| compare_ids(prev, interval));
            assert_ne!(order, Ordering::Greater, "overlap index order violated");
        }
        previous = Some(interval.clone());
    });
}
