//! The endpoint index: intervals ordered by end reference position.

use crate::index::tree::AvlTree;
use crate::index::{EndOrderOps, IntervalIndex};
use crate::interval::IntervalHandle;

#[derive(Default)]
pub struct EndpointIndex {
    tree: AvlTree<IntervalHandle>,
}

impl EndpointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Last interval whose end is at or before the probe. The probe is a
    /// transient interval at `(pos, pos)` with bias +1 so that equal-end
    /// intervals count.
    pub fn previous_interval(&self, probe: &IntervalHandle) -> Option<IntervalHandle> {
        self.tree.floor(probe, &EndOrderOps)
    }

    /// First interval whose end is at or after the probe (bias -1).
    pub fn next_interval(&self, probe: &IntervalHandle) -> Option<IntervalHandle> {
        self.tree.ceil(probe, &EndOrderOps)
    }

    pub fn for_each(&self, mut f: impl FnMut(&IntervalHandle)) {
        self.tree.for_each(&mut f);
    }
}

impl IntervalIndex for EndpointIndex {
    fn add(&mut self, interval: &IntervalHandle) {
        self.tree.insert(interval.clone(), &EndOrderOps);
    }

    fn remove(&mut self, interval: &IntervalHandle) {
        let removed = self.tree.remove(interval, &EndOrderOps);
        assert!(
            removed,
            "Internal consistency error: interval missing from endpoint index"
        );
    }
}
