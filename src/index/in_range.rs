//! Attachable indices answering "which intervals have an endpoint (or
//! startpoint) inside a position range".
//!
//! Both are ordered trees over one endpoint with two comparator
//! tie-breakers: the probe bias (so a query probe strictly precedes or
//! follows every real interval sharing its endpoint, giving half-open
//! iteration), and lexicographic id order (a deterministic total order
//! across all sites).

use smartstring::alias::String as SmartString;

use crate::index::tree::AvlTree;
use crate::index::{EndOrderOps, IntervalIndex, StartOrderOps};
use crate::interval::{transient_probe, IntervalHandle};
use crate::sequence::SequenceClient;

pub struct EndpointInRangeIndex {
    tree: AvlTree<IntervalHandle>,
    client: SequenceClient,
    label: SmartString,
}

impl EndpointInRangeIndex {
    pub fn new(client: SequenceClient, label: impl Into<SmartString>) -> Self {
        EndpointInRangeIndex {
            tree: AvlTree::new(),
            client,
            label: label.into(),
        }
    }

    /// Intervals whose end lies in `[start, end]`. Degenerate ranges
    /// (`start <= 0` or `start > end`) yield nothing.
    pub fn find_intervals_with_endpoint_in_range(
        &self,
        start: i64,
        end: i64,
    ) -> Vec<IntervalHandle> {
        if start <= 0 || start > end || self.tree.is_empty() {
            return Vec::new();
        }
        let lo = transient_probe(&self.client, &self.label, start, start, -1);
        let hi = transient_probe(&self.client, &self.label, end, end, 1);
        let mut results = Vec::new();
        self.tree
            .for_each_in_range(&lo, &hi, &EndOrderOps, &mut |interval| {
                results.push(interval.clone())
            });
        results
    }
}

impl IntervalIndex for EndpointInRangeIndex {
    fn add(&mut self, interval: &IntervalHandle) {
        self.tree.insert(interval.clone(), &EndOrderOps);
    }

    fn remove(&mut self, interval: &IntervalHandle) {
        self.tree.remove(interval, &EndOrderOps);
    }
}

pub struct StartpointInRangeIndex {
    tree: AvlTree<IntervalHandle>,
    client: SequenceClient,
    label: SmartString,
}

impl StartpointInRangeIndex {
    pub fn new(client: SequenceClient, label: impl Into<SmartString>) -> Self {
        StartpointInRangeIndex {
            tree: AvlTree::new(),
            client,
            label: label.into(),
        }
    }

    pub fn find_intervals_with_startpoint_in_range(
        &self,
        start: i64,
        end: i64,
    ) -> Vec<IntervalHandle> {
        if start <= 0 || start > end || self.tree.is_empty() {
            return Vec::new();
        }
        let lo = transient_probe(&self.client, &self.label, start, start, -1);
        let hi = transient_probe(&self.client, &self.label, end, end, 1);
        let mut results = Vec::new();
        self.tree
            .for_each_in_range(&lo, &hi, &StartOrderOps, &mut |interval| {
                results.push(interval.clone())
            });
        results
    }
}

impl IntervalIndex for StartpointInRangeIndex {
    fn add(&mut self, interval: &IntervalHandle) {
        self.tree.insert(interval.clone(), &StartOrderOps);
    }

    fn remove(&mut self, interval: &IntervalHandle) {
        self.tree.remove(interval, &StartOrderOps);
    }
}
