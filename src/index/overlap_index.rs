//! The overlap index: an interval tree keyed by (start, end) answering
//! range overlap queries and powering ordered iteration.

use crate::index::tree::AvlTree;
use crate::index::{IntervalIndex, OverlapOps};
use crate::interval::IntervalHandle;

#[derive(Default)]
pub struct OverlapIndex {
    tree: AvlTree<IntervalHandle>,
}

impl OverlapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Every interval overlapping the probe interval, in (start, end, id)
    /// order.
    pub fn find_overlapping(&self, probe: &IntervalHandle) -> Vec<IntervalHandle> {
        let mut results = Vec::new();
        self.tree
            .for_each_overlapping(probe, &OverlapOps, &mut |interval| {
                results.push(interval.clone())
            });
        results
    }

    pub fn for_each(&self, mut f: impl FnMut(&IntervalHandle)) {
        self.tree.for_each(&mut f);
    }

    pub fn for_each_rev(&self, mut f: impl FnMut(&IntervalHandle)) {
        self.tree.for_each_rev(&mut f);
    }
}

impl IntervalIndex for OverlapIndex {
    fn add(&mut self, interval: &IntervalHandle) {
        self.tree.insert(interval.clone(), &OverlapOps);
    }

    fn remove(&mut self, interval: &IntervalHandle) {
        let removed = self.tree.remove(interval, &OverlapOps);
        assert!(
            removed,
            "Internal consistency error: interval missing from overlap index"
        );
    }
}
