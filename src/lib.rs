//! Collaborative labelled intervals anchored into a distributed sequence.
//!
//! Each site keeps an ordered sequence (owned by a merge-tree style sequence
//! client) and a collection of labelled intervals whose endpoints are
//! anchored to positions in that sequence. Sites concurrently insert and
//! remove text, add intervals, move interval endpoints and edit interval
//! properties, and every site converges to the same interval set and
//! endpoint placement.
//!
//! The interesting parts live in:
//!
//! - [`sequence`]: position references that survive concurrent text removal
//!   by sliding to the nearest surviving segment, plus a compact sequence
//!   client implementing the surface the interval layer consumes.
//! - [`interval`]: the interval variants (numeric and sequence-anchored) and
//!   their comparison helpers.
//! - [`index`]: the cooperating indices (id map, endpoint order, overlap
//!   tree, endpoint/startpoint-in-range).
//! - [`collection`]: the public surface - add / change / remove, op
//!   emission, acknowledgement, reconnect rebase and events.
//! - [`rebase`]: commit-graph branch rebasing with revision identity
//!   skipping.

pub mod properties;
pub mod events;
pub mod sequence;
pub mod interval;
pub mod index;
pub mod local_collection;
pub mod collection;
pub mod ops;
pub mod rebase;
mod check;

pub use collection::{CollectionOptions, IntervalCollection, IntervalError};
pub use interval::{Interval, IntervalHandle, IntervalStickiness, IntervalType};
pub use sequence::{LocalReference, ReferenceType, SequenceClient, SlidingPreference};

/// Server-assigned sequence number for an acknowledged op.
pub type Seq = u64;

/// Per-client monotonically increasing counter assigned to each locally
/// submitted op. Used to correlate submit and ack, and to order pending ops
/// during reconnect rebase.
pub type LocalSeq = u64;

/// Sentinel sequence number for ops (and segments) that have not been
/// acknowledged yet.
pub const UNASSIGNED_SEQ: Seq = Seq::MAX;

/// Resolved position of a reference whose anchor segment has been removed
/// and no slide target exists. Never overlaps any live range.
pub const DETACHED_POSITION: i64 = -1;
