//! The cooperating indices over one collection's intervals.
//!
//! Four kinds observe the same interval set: the id map, the endpoint
//! (end-ordered) index, the overlap tree, and the attachable
//! endpoint/startpoint-in-range indices. Every index is updated in
//! lockstep by the owning collection; slide hooks remove an interval from
//! all of them before its endpoints move and re-add it afterwards, so an
//! interval is never findable under a stale key.

mod endpoint_index;
mod id_index;
mod in_range;
mod overlap_index;
pub(crate) mod tree;

use std::cmp::Ordering;

pub use endpoint_index::EndpointIndex;
pub use id_index::IdIndex;
pub use in_range::{EndpointInRangeIndex, StartpointInRangeIndex};
pub use overlap_index::OverlapIndex;

use crate::interval::{compare_ends, compare_ids, compare_starts, Interval, IntervalHandle};
use crate::index::tree::TreeOps;

/// An index over a collection's intervals. User indices implement this and
/// are attached with `IntervalCollection::attach_index`.
pub trait IntervalIndex {
    fn add(&mut self, interval: &IntervalHandle);
    fn remove(&mut self, interval: &IntervalHandle);
}

/// Comparator override used by query probes: a probe with bias -1 sorts
/// strictly before every real interval with an equal key, +1 strictly
/// after. Real intervals always carry bias 0.
fn compare_bias(a: &Interval, b: &Interval) -> Ordering {
    a.probe_bias().cmp(&b.probe_bias())
}

/// Order by end reference position, then probe bias, then id.
pub(crate) struct EndOrderOps;

impl TreeOps<IntervalHandle> for EndOrderOps {
    fn cmp_key(&self, a: &IntervalHandle, b: &IntervalHandle) -> Ordering {
        compare_ends(a, b)
            .then_with(|| compare_bias(a, b))
            .then_with(|| compare_ids(a, b))
    }
    fn cmp_aug(&self, a: &IntervalHandle, b: &IntervalHandle) -> Ordering {
        compare_ends(a, b)
    }
    fn same(&self, a: &IntervalHandle, b: &IntervalHandle) -> bool {
        std::rc::Rc::ptr_eq(a, b)
    }
}

/// Order by start reference position, then probe bias, then id.
pub(crate) struct StartOrderOps;

impl TreeOps<IntervalHandle> for StartOrderOps {
    fn cmp_key(&self, a: &IntervalHandle, b: &IntervalHandle) -> Ordering {
        compare_starts(a, b)
            .then_with(|| compare_bias(a, b))
            .then_with(|| compare_ids(a, b))
    }
    fn cmp_aug(&self, a: &IntervalHandle, b: &IntervalHandle) -> Ordering {
        compare_ends(a, b)
    }
    fn same(&self, a: &IntervalHandle, b: &IntervalHandle) -> bool {
        std::rc::Rc::ptr_eq(a, b)
    }
}

/// Order by (start, end, id); augmented by end for overlap search.
pub(crate) struct OverlapOps;

impl TreeOps<IntervalHandle> for OverlapOps {
    fn cmp_key(&self, a: &IntervalHandle, b: &IntervalHandle) -> Ordering {
        compare_starts(a, b)
            .then_with(|| compare_ends(a, b))
            .then_with(|| compare_ids(a, b))
    }
    fn cmp_aug(&self, a: &IntervalHandle, b: &IntervalHandle) -> Ordering {
        compare_ends(a, b)
    }
    fn same(&self, a: &IntervalHandle, b: &IntervalHandle) -> bool {
        std::rc::Rc::ptr_eq(a, b)
    }
    fn cmp_item_start_to_query_end(&self, item: &IntervalHandle, query: &IntervalHandle) -> Ordering {
        crate::interval::compare_start_to_end(item, query)
    }
    fn cmp_item_end_to_query_start(&self, item: &IntervalHandle, query: &IntervalHandle) -> Ordering {
        crate::interval::compare_start_to_end(query, item).reverse()
    }
}
