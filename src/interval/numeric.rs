//! Numeric intervals: raw integer endpoints, no sequence backing.

use std::cell::{Cell, RefCell};

use crate::interval::IntervalType;
use crate::properties::{PropertyManager, PropertySet};

#[derive(Debug)]
pub struct NumericInterval {
    pub start: i64,
    pub end: i64,
    pub(crate) interval_type: IntervalType,
    pub(crate) properties: RefCell<PropertySet>,
    pub(crate) property_manager: RefCell<PropertyManager>,
    pub(crate) probe_bias: Cell<i8>,
}

impl NumericInterval {
    pub fn new(start: i64, end: i64, interval_type: IntervalType, properties: PropertySet) -> Self {
        NumericInterval {
            start,
            end,
            interval_type,
            properties: RefCell::new(properties),
            property_manager: RefCell::new(PropertyManager::new()),
            probe_bias: Cell::new(0),
        }
    }

    /// A new interval with the given endpoints replaced; `None` positions
    /// keep the old value. Properties and pending-property state carry
    /// over. Returns `None` when nothing would change.
    pub fn modify(&self, start: Option<i64>, end: Option<i64>) -> Option<NumericInterval> {
        let new_start = start.unwrap_or(self.start);
        let new_end = end.unwrap_or(self.end);
        if new_start == self.start && new_end == self.end {
            return None;
        }
        Some(NumericInterval {
            start: new_start,
            end: new_end,
            interval_type: self.interval_type,
            properties: RefCell::new(self.properties.borrow().clone()),
            property_manager: RefCell::new(self.property_manager.borrow().clone()),
            probe_bias: Cell::new(0),
        })
    }
}
