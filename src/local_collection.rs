//! The local interval collection: owns the intervals and every index, and
//! keeps them coherent while endpoints slide.
//!
//! Coherence rule: whenever an endpoint's reference is about to change
//! position, the interval is fully removed from order-sensitive indices,
//! the reference change is applied, and the interval is re-inserted. Both
//! endpoints can slide in one sequence op, so the slide hooks count a burst
//! per interval: the first `beforeSlide` snapshots and removes, the last
//! `afterSlide` re-adds and reports the move.

use std::cell::RefCell;
use std::rc::Rc;

use smartstring::alias::String as SmartString;
use tracing::trace;
use uuid::Uuid;

use crate::collection::IntervalError;
use crate::index::{EndpointIndex, IdIndex, IntervalIndex, OverlapIndex};
use crate::interval::{
    Interval, IntervalHandle, IntervalStickiness, IntervalType, NumericInterval, SequenceInterval,
};
use crate::ops::{
    CompactSerializedInterval, SequencedOp, SerializedCollectionV2, SerializedInterval,
    COLLECTION_FORMAT_VERSION,
};
use crate::properties::{
    PropertySet, RESERVED_INTERVAL_ID_KEY, RESERVED_RANGE_LABELS_KEY,
};
use crate::sequence::{LocalReference, SequenceClient};

pub type PositionChangeCallback = Rc<dyn Fn(&IntervalHandle, &IntervalHandle)>;

pub struct LocalIntervalCollection {
    label: SmartString,
    client: Option<SequenceClient>,
    id_index: IdIndex,
    endpoint_index: EndpointIndex,
    overlap_index: OverlapIndex,
    extra_indices: Vec<Rc<RefCell<dyn IntervalIndex>>>,
    /// Invoked after a slide burst completes, with (interval, previous).
    on_position_change: Option<PositionChangeCallback>,
}

impl LocalIntervalCollection {
    pub fn new(
        label: SmartString,
        client: Option<SequenceClient>,
        on_position_change: Option<PositionChangeCallback>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(LocalIntervalCollection {
            label,
            client,
            id_index: IdIndex::new(),
            endpoint_index: EndpointIndex::new(),
            overlap_index: OverlapIndex::new(),
            extra_indices: Vec::new(),
            on_position_change,
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn client(&self) -> Option<&SequenceClient> {
        self.client.as_ref()
    }

    pub fn id_index(&self) -> &IdIndex {
        &self.id_index
    }

    pub fn endpoint_index(&self) -> &EndpointIndex {
        &self.endpoint_index
    }

    pub fn overlap_index(&self) -> &OverlapIndex {
        &self.overlap_index
    }

    pub fn len(&self) -> usize {
        self.id_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_index.is_empty()
    }

    pub fn append_index(&mut self, index: Rc<RefCell<dyn IntervalIndex>>) {
        {
            let mut idx = index.borrow_mut();
            self.id_index.for_each(|interval| idx.add(interval));
        }
        self.extra_indices.push(index);
    }

    pub fn remove_index(&mut self, index: &Rc<RefCell<dyn IntervalIndex>>) -> bool {
        let Some(position) = self
            .extra_indices
            .iter()
            .position(|existing| Rc::ptr_eq(existing, index))
        else {
            return false;
        };
        let removed = self.extra_indices.remove(position);
        let mut idx = removed.borrow_mut();
        self.id_index.for_each(|interval| idx.remove(interval));
        true
    }

    fn add_to_indices(&mut self, interval: &IntervalHandle) {
        self.id_index.add(interval);
        self.endpoint_index.add(interval);
        self.overlap_index.add(interval);
        for index in &self.extra_indices {
            index.borrow_mut().add(interval);
        }
    }

    fn remove_from_indices(&mut self, interval: &IntervalHandle) {
        self.id_index.remove(interval);
        self.endpoint_index.remove(interval);
        self.overlap_index.remove(interval);
        for index in &self.extra_indices {
            index.borrow_mut().remove(interval);
        }
    }

    // ------------------------------------------------------------------
    // Slide hooks
    // ------------------------------------------------------------------

    fn install_slide_hooks(this: &Rc<RefCell<Self>>, interval: &IntervalHandle) {
        let Interval::Sequence(si) = &**interval else {
            return;
        };
        for reference in [&si.start, &si.end] {
            let weak_collection = Rc::downgrade(this);
            let weak_interval = Rc::downgrade(interval);
            let before = Rc::new(move |_reference: &LocalReference| {
                if let (Some(collection), Some(interval)) =
                    (weak_collection.upgrade(), weak_interval.upgrade())
                {
                    Self::on_before_slide(&collection, &interval);
                }
            });
            let weak_collection = Rc::downgrade(this);
            let weak_interval = Rc::downgrade(interval);
            let after = Rc::new(move |_reference: &LocalReference| {
                if let (Some(collection), Some(interval)) =
                    (weak_collection.upgrade(), weak_interval.upgrade())
                {
                    Self::on_after_slide(&collection, &interval);
                }
            });
            reference.set_slide_hooks(before, after);
        }
    }

    fn remove_slide_hooks(interval: &IntervalHandle) {
        if let Interval::Sequence(si) = &**interval {
            si.start.clear_slide_hooks();
            si.end.clear_slide_hooks();
        }
    }

    fn on_before_slide(this: &Rc<RefCell<Self>>, interval: &IntervalHandle) {
        let Interval::Sequence(si) = &**interval else {
            return;
        };
        let pending = si.slide_pending.get();
        si.slide_pending.set(pending + 1);
        if pending == 0 {
            let previous: IntervalHandle =
                Rc::new(Interval::Sequence(si.clone_transient_snapshot()));
            *si.slide_previous.borrow_mut() = Some(previous);
            this.borrow_mut().remove_from_indices(interval);
        }
    }

    fn on_after_slide(this: &Rc<RefCell<Self>>, interval: &IntervalHandle) {
        let Interval::Sequence(si) = &**interval else {
            return;
        };
        let pending = si.slide_pending.get();
        assert!(
            pending > 0,
            "Internal consistency error: afterSlide without matching beforeSlide"
        );
        si.slide_pending.set(pending - 1);
        if pending == 1 {
            let previous = si
                .slide_previous
                .borrow_mut()
                .take()
                .unwrap_or_else(|| {
                    panic!("Internal consistency error: slide burst without snapshot")
                });
            let callback = {
                let mut collection = this.borrow_mut();
                collection.add_to_indices(interval);
                collection.on_position_change.clone()
            };
            if let Some(callback) = callback {
                callback(interval, &previous);
            }
        }
    }

    // ------------------------------------------------------------------
    // Interval lifecycle
    // ------------------------------------------------------------------

    /// Create an interval and add it to every index.
    ///
    /// `op` provenance controls the endpoint removal behavior (see
    /// [`SequenceInterval::create`]). A fresh v4 UUID id is assigned when
    /// the properties carry none.
    #[allow(clippy::too_many_arguments)]
    pub fn add_interval(
        this: &Rc<RefCell<Self>>,
        start: i64,
        end: i64,
        interval_type: IntervalType,
        properties: Option<PropertySet>,
        op: Option<&SequencedOp>,
        from_snapshot: bool,
        stickiness: IntervalStickiness,
    ) -> Result<IntervalHandle, IntervalError> {
        assert!(
            !interval_type.contains(IntervalType::TRANSIENT),
            "Internal consistency error: transient interval added to a collection"
        );
        let (label, client) = {
            let collection = this.borrow();
            (collection.label.clone(), collection.client.clone())
        };

        let properties = properties.unwrap_or_default();
        if let Some(labels) = properties.get(RESERVED_RANGE_LABELS_KEY) {
            let matches = labels
                .as_array()
                .is_some_and(|a| a.len() == 1 && a[0].as_str() == Some(label.as_str()));
            if !matches {
                return Err(IntervalError::LabelMismatch);
            }
        }

        let interval = match &client {
            Some(client) => Interval::Sequence(SequenceInterval::create(
                &label,
                start,
                end,
                client,
                interval_type,
                op,
                from_snapshot,
                stickiness,
            )?),
            None => Interval::Numeric(NumericInterval::new(start, end, interval_type, PropertySet::new())),
        };
        let handle: IntervalHandle = Rc::new(interval);

        handle.with_properties_mut(|props| {
            props.extend(properties);
            props.insert(
                SmartString::from(RESERVED_RANGE_LABELS_KEY),
                serde_json::json!([label.as_str()]),
            );
            props
                .entry(SmartString::from(RESERVED_INTERVAL_ID_KEY))
                .or_insert_with(|| serde_json::Value::String(Uuid::new_v4().to_string()));
        });

        Self::add_existing(this, &handle);
        trace!(label = %label, id = %handle.id().unwrap_or_default(), "interval added");
        Ok(handle)
    }

    /// Index an already constructed interval and wire its slide hooks.
    pub fn add_existing(this: &Rc<RefCell<Self>>, interval: &IntervalHandle) {
        this.borrow_mut().add_to_indices(interval);
        Self::install_slide_hooks(this, interval);
    }

    /// Remove from every index and unhook slide listeners. Does not touch
    /// the endpoint references themselves: on an endpoint change the new
    /// interval may share them.
    pub fn remove_existing_interval(this: &Rc<RefCell<Self>>, interval: &IntervalHandle) {
        this.borrow_mut().remove_from_indices(interval);
        Self::remove_slide_hooks(interval);
    }

    /// Replace an interval with a modified copy. Returns `None` (leaving
    /// the collection untouched) when nothing would change.
    pub fn change_interval(
        this: &Rc<RefCell<Self>>,
        interval: &IntervalHandle,
        start: Option<i64>,
        end: Option<i64>,
        op: Option<&SequencedOp>,
    ) -> Result<Option<IntervalHandle>, IntervalError> {
        let modified = match &**interval {
            Interval::Sequence(si) => si
                .modify(start, end, op, None)?
                .map(|si| Rc::new(Interval::Sequence(si))),
            Interval::Numeric(ni) => ni
                .modify(start, end)
                .map(|ni| Rc::new(Interval::Numeric(ni))),
        };
        let Some(modified) = modified else {
            return Ok(None);
        };
        Self::remove_existing_interval(this, interval);
        Self::add_existing(this, &modified);
        Ok(Some(modified))
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// The V2 snapshot form: label stored once, `rangeLabels` stripped from
    /// each row, default stickiness omitted.
    pub fn serialize(&self) -> SerializedCollectionV2 {
        let mut intervals = Vec::with_capacity(self.overlap_index.len());
        self.overlap_index.for_each(|interval| {
            let serialized = interval.serialize();
            let mut properties = serialized.properties.unwrap_or_default();
            properties.remove(RESERVED_RANGE_LABELS_KEY);
            intervals.push(CompactSerializedInterval {
                start: serialized.start,
                end: serialized.end,
                sequence_number: serialized.sequence_number,
                interval_type: serialized.interval_type,
                properties,
                stickiness: serialized.stickiness,
            });
        });
        SerializedCollectionV2 {
            label: self.label.clone(),
            version: COLLECTION_FORMAT_VERSION,
            intervals,
        }
    }

    /// Ensure inbound serialized data names an id, synthesizing the
    /// deterministic legacy form when it does not, so every site agrees on
    /// the id of unlabelled incoming intervals.
    pub fn ensure_serialized_id(serialized: &mut SerializedInterval) -> SmartString {
        let properties = serialized.properties.get_or_insert_with(PropertySet::new);
        if let Some(id) = properties
            .get(RESERVED_INTERVAL_ID_KEY)
            .and_then(|v| v.as_str())
        {
            return SmartString::from(id);
        }
        let id = format!("legacy{}-{}", serialized.start, serialized.end);
        properties.insert(
            SmartString::from(RESERVED_INTERVAL_ID_KEY),
            serde_json::Value::String(id.clone()),
        );
        SmartString::from(id)
    }
}
