//! Interval variants and their helpers.
//!
//! An interval is a pair of endpoints plus properties and a stable id.
//! Two variants exist: numeric (raw integer positions, for collections not
//! backed by a sequence) and sequence-anchored (reference-backed). Code
//! that cares which kind it has matches on the variant explicitly; the
//! helpers here dispatch comparison and creation.

mod numeric;
mod sequence;

use std::cmp::Ordering;
use std::rc::Rc;

use smartstring::alias::String as SmartString;

pub use numeric::NumericInterval;
pub use sequence::SequenceInterval;

use crate::properties::{PropertySet, RESERVED_INTERVAL_ID_KEY};
use crate::sequence::SlidingPreference;
use crate::Seq;

/// Bitmask of interval behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct IntervalType(pub u8);

impl IntervalType {
    pub const SIMPLE: Self = Self(0x0);
    pub const NEST: Self = Self(0x1);
    pub const SLIDE_ON_REMOVE: Self = Self(0x2);
    pub const TRANSIENT: Self = Self(0x4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for IntervalType {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Whether a range absorbs adjacent inserts at each end. A 2-bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IntervalStickiness(pub u8);

impl IntervalStickiness {
    pub const NONE: Self = Self(0);
    pub const START: Self = Self(1);
    pub const END: Self = Self(2);
    pub const FULL: Self = Self(3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl Default for IntervalStickiness {
    fn default() -> Self {
        Self::END
    }
}

/// Sliding preference of a start endpoint under a given stickiness: a
/// sticky start absorbs inserts before the range, so the reference prefers
/// to stay behind them.
pub fn start_reference_sliding_preference(stickiness: IntervalStickiness) -> SlidingPreference {
    if stickiness.contains(IntervalStickiness::START) {
        SlidingPreference::Backward
    } else {
        SlidingPreference::Forward
    }
}

pub fn end_reference_sliding_preference(stickiness: IntervalStickiness) -> SlidingPreference {
    if stickiness.contains(IntervalStickiness::END) {
        SlidingPreference::Forward
    } else {
        SlidingPreference::Backward
    }
}

/// An interval as stored in a collection. Shared between all indices.
pub type IntervalHandle = Rc<Interval>;

#[derive(Debug)]
pub enum Interval {
    Numeric(NumericInterval),
    Sequence(SequenceInterval),
}

impl Interval {
    pub fn as_sequence(&self) -> Option<&SequenceInterval> {
        match self {
            Interval::Sequence(si) => Some(si),
            Interval::Numeric(_) => None,
        }
    }

    pub fn interval_type(&self) -> IntervalType {
        match self {
            Interval::Numeric(ni) => ni.interval_type,
            Interval::Sequence(si) => si.interval_type,
        }
    }

    pub fn stickiness(&self) -> IntervalStickiness {
        match self {
            Interval::Numeric(_) => IntervalStickiness::END,
            Interval::Sequence(si) => si.stickiness,
        }
    }

    /// The stable id, read from the reserved property. Present once the
    /// interval is attached to a collection.
    pub fn id(&self) -> Option<SmartString> {
        self.with_properties(|props| {
            props
                .get(RESERVED_INTERVAL_ID_KEY)
                .and_then(|v| v.as_str())
                .map(SmartString::from)
        })
    }

    pub fn with_properties<R>(&self, f: impl FnOnce(&PropertySet) -> R) -> R {
        match self {
            Interval::Numeric(ni) => f(&ni.properties.borrow()),
            Interval::Sequence(si) => f(&si.properties.borrow()),
        }
    }

    pub fn with_properties_mut<R>(&self, f: impl FnOnce(&mut PropertySet) -> R) -> R {
        match self {
            Interval::Numeric(ni) => f(&mut ni.properties.borrow_mut()),
            Interval::Sequence(si) => f(&mut si.properties.borrow_mut()),
        }
    }

    pub fn properties_snapshot(&self) -> PropertySet {
        self.with_properties(|p| p.clone())
    }

    /// Current resolved start position. Detached endpoints resolve to
    /// [`crate::DETACHED_POSITION`].
    pub fn start_position(&self) -> i64 {
        match self {
            Interval::Numeric(ni) => ni.start,
            Interval::Sequence(si) => si.client.resolve(&si.start),
        }
    }

    pub fn end_position(&self) -> i64 {
        match self {
            Interval::Numeric(ni) => ni.end,
            Interval::Sequence(si) => si.client.resolve(&si.end),
        }
    }

    /// Sequence number recorded when serializing this interval.
    pub(crate) fn serialization_seq(&self) -> Seq {
        match self {
            Interval::Numeric(_) => 0,
            Interval::Sequence(si) => si.client.get_current_seq(),
        }
    }

    pub(crate) fn probe_bias(&self) -> i8 {
        match self {
            Interval::Numeric(ni) => ni.probe_bias.get(),
            Interval::Sequence(si) => si.probe_bias.get(),
        }
    }

    pub(crate) fn set_probe_bias(&self, bias: i8) {
        match self {
            Interval::Numeric(ni) => ni.probe_bias.set(bias),
            Interval::Sequence(si) => si.probe_bias.set(bias),
        }
    }
}

fn mixed_kinds() -> ! {
    panic!("Internal consistency error: comparing intervals of different kinds")
}

pub fn compare_starts(a: &Interval, b: &Interval) -> Ordering {
    match (a, b) {
        (Interval::Numeric(x), Interval::Numeric(y)) => x.start.cmp(&y.start),
        (Interval::Sequence(x), Interval::Sequence(y)) => x.start.compare(&y.start),
        _ => mixed_kinds(),
    }
}

pub fn compare_ends(a: &Interval, b: &Interval) -> Ordering {
    match (a, b) {
        (Interval::Numeric(x), Interval::Numeric(y)) => x.end.cmp(&y.end),
        (Interval::Sequence(x), Interval::Sequence(y)) => x.end.compare(&y.end),
        _ => mixed_kinds(),
    }
}

pub(crate) fn compare_start_to_end(a: &Interval, b: &Interval) -> Ordering {
    match (a, b) {
        (Interval::Numeric(x), Interval::Numeric(y)) => x.start.cmp(&y.end),
        (Interval::Sequence(x), Interval::Sequence(y)) => x.start.compare(&y.end),
        _ => mixed_kinds(),
    }
}

/// Range overlap: `start(a) <= end(b) && end(a) >= start(b)`.
pub fn overlaps(a: &Interval, b: &Interval) -> bool {
    compare_start_to_end(a, b) != Ordering::Greater
        && compare_start_to_end(b, a) != Ordering::Greater
}

/// Deterministic total order used as the final tie-breaker in indices:
/// lexicographic on id. Query probes carry no id and sort as empty.
pub fn compare_ids(a: &Interval, b: &Interval) -> Ordering {
    let a_id = a.id().unwrap_or_default();
    let b_id = b.id().unwrap_or_default();
    a_id.cmp(&b_id)
}

/// A transient sequence interval used as a query probe. Positions are
/// clamped into the document; on an empty document the probe's references
/// are detached, which orders it before every live interval.
pub(crate) fn transient_probe(
    client: &crate::sequence::SequenceClient,
    label: &str,
    start: i64,
    end: i64,
    bias: i8,
) -> IntervalHandle {
    let last = (client.visible_length() as i64 - 1).max(0);
    let clamp = |pos: i64| pos.clamp(0, last);
    let interval = SequenceInterval::create(
        label,
        clamp(start),
        clamp(end),
        client,
        IntervalType::TRANSIENT,
        None,
        true,
        IntervalStickiness::END,
    )
    .unwrap_or_else(|_| panic!("Internal consistency error: probe creation failed"));
    let handle: IntervalHandle = Rc::new(Interval::Sequence(interval));
    handle.set_probe_bias(bias);
    handle
}

/// A numeric probe interval for collections without a sequence backing.
pub(crate) fn numeric_probe(start: i64, end: i64, bias: i8) -> IntervalHandle {
    let handle: IntervalHandle = Rc::new(Interval::Numeric(NumericInterval::new(
        start,
        end,
        IntervalType::TRANSIENT,
        PropertySet::new(),
    )));
    handle.set_probe_bias(bias);
    handle
}
