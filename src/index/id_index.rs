//! The id index: stable id to interval.

use std::collections::HashMap;

use smartstring::alias::String as SmartString;

use crate::index::IntervalIndex;
use crate::interval::IntervalHandle;

#[derive(Debug, Default)]
pub struct IdIndex {
    map: HashMap<SmartString, IntervalHandle>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<IntervalHandle> {
        self.map.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&IntervalHandle)) {
        for interval in self.map.values() {
            f(interval);
        }
    }
}

impl IntervalIndex for IdIndex {
    fn add(&mut self, interval: &IntervalHandle) {
        let id = interval
            .id()
            .unwrap_or_else(|| panic!("Internal consistency error: indexed interval without id"));
        let previous = self.map.insert(id.clone(), interval.clone());
        assert!(
            previous.is_none(),
            "Internal consistency error: duplicate interval id {id}"
        );
    }

    fn remove(&mut self, interval: &IntervalHandle) {
        if let Some(id) = interval.id() {
            self.map.remove(id.as_str());
        }
    }
}
