//! The public interval collection surface: add / change / remove, property
//! changes, op emission, acknowledgement, reconnect rebase and events.
//!
//! A locally originated op moves through three states:
//!
//! ```text
//! CREATED(StayOnRemove) --submit--> PENDING --ack--> COMMITTED(SlideOnRemove)
//!                                      |
//!                                      +--disconnect--> REBASE on reconnect
//! ```
//!
//! While a local change for an endpoint is pending, remote changes for that
//! endpoint of that id are ignored; the local client will send its own op.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use smartstring::alias::String as SmartString;
use thiserror::Error;
use tracing::{debug, trace};

use crate::events::Listeners;
use crate::index::IntervalIndex;
use crate::interval::{numeric_probe, transient_probe, Interval, IntervalHandle, IntervalStickiness, IntervalType};
use crate::local_collection::LocalIntervalCollection;
use crate::ops::{
    CollectionOp, OpMetadata, OpName, SequencedOp, SerializedCollectionV2, SerializedInterval,
    SerializedIntervalDelta,
};
use crate::properties::{
    is_reserved_key, PropertySet, RESERVED_INTERVAL_ID_KEY,
};
use crate::sequence::{ReferenceType, SequenceClient};
use crate::{LocalSeq, UNASSIGNED_SEQ};

/// Usage errors: caller-visible failures that leave state unchanged.
#[derive(Debug, Error)]
pub enum IntervalError {
    #[error("transient intervals cannot be added to a collection")]
    TransientInterval,
    #[error("interval stickiness requires the intervalStickinessEnabled option")]
    StickinessDisabled,
    #[error("interval position {0} is out of range")]
    OutOfBounds(i64),
    #[error("interval start must not be greater than end")]
    InvertedRange,
    #[error("cannot change reserved property {0}")]
    ReservedProperty(SmartString),
    #[error("interval collection already attached")]
    AlreadyAttached,
    #[error("interval collection is not attached")]
    NotAttached,
    #[error("rangeLabels does not match this collection")]
    LabelMismatch,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionOptions {
    pub interval_stickiness_enabled: bool,
}

// Event argument types.

#[derive(Clone)]
pub struct AddIntervalArgs {
    pub interval: IntervalHandle,
    pub local: bool,
    pub op: Option<SequencedOp>,
}

#[derive(Clone)]
pub struct DeleteIntervalArgs {
    pub interval: IntervalHandle,
    pub local: bool,
    pub op: Option<SequencedOp>,
}

#[derive(Clone)]
pub struct ChangeIntervalArgs {
    pub interval: IntervalHandle,
    pub previous: IntervalHandle,
    pub local: bool,
    pub op: Option<SequencedOp>,
    pub slide: bool,
}

#[derive(Clone)]
pub struct PropertyChangedArgs {
    pub interval: IntervalHandle,
    pub deltas: PropertySet,
    pub local: bool,
    pub op: Option<SequencedOp>,
}

#[derive(Default)]
pub struct CollectionEvents {
    pub add_interval: Listeners<AddIntervalArgs>,
    pub delete_interval: Listeners<DeleteIntervalArgs>,
    pub change_interval: Listeners<ChangeIntervalArgs>,
    pub property_changed: Listeners<PropertyChangedArgs>,
}

type Emitter = Box<dyn FnMut(CollectionOp, OpMetadata)>;

pub(crate) struct CollectionInner {
    label: SmartString,
    client: Option<SequenceClient>,
    options: CollectionOptions,
    local: RefCell<Option<Rc<RefCell<LocalIntervalCollection>>>>,
    /// Serialized intervals awaiting attach (snapshot load).
    saved: RefCell<Vec<SerializedInterval>>,
    pending_change_start: RefCell<HashMap<SmartString, VecDeque<SerializedIntervalDelta>>>,
    pending_change_end: RefCell<HashMap<SmartString, VecDeque<SerializedIntervalDelta>>>,
    local_seq_to_serialized: RefCell<HashMap<LocalSeq, SerializedIntervalDelta>>,
    local_seq_to_rebased: RefCell<HashMap<LocalSeq, SerializedIntervalDelta>>,
    emitter: RefCell<Option<Emitter>>,
    events: CollectionEvents,
    /// Local seq source for collections without a sequence client.
    own_local_seq: Cell<LocalSeq>,
}

/// A cheap-to-clone handle to one labelled interval collection.
#[derive(Clone)]
pub struct IntervalCollection {
    inner: Rc<CollectionInner>,
}

impl IntervalCollection {
    pub fn new(
        label: impl Into<SmartString>,
        client: Option<SequenceClient>,
        options: CollectionOptions,
    ) -> Self {
        IntervalCollection {
            inner: Rc::new(CollectionInner {
                label: label.into(),
                client,
                options,
                local: RefCell::new(None),
                saved: RefCell::new(Vec::new()),
                pending_change_start: RefCell::new(HashMap::new()),
                pending_change_end: RefCell::new(HashMap::new()),
                local_seq_to_serialized: RefCell::new(HashMap::new()),
                local_seq_to_rebased: RefCell::new(HashMap::new()),
                emitter: RefCell::new(None),
                events: CollectionEvents::default(),
                own_local_seq: Cell::new(0),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn options(&self) -> CollectionOptions {
        self.inner.options
    }

    pub fn events(&self) -> &CollectionEvents {
        &self.inner.events
    }

    pub fn attached(&self) -> bool {
        self.inner.local.borrow().is_some()
    }

    /// Queue serialized intervals to be materialized on attach.
    pub(crate) fn load_saved(&self, intervals: Vec<SerializedInterval>) {
        self.inner.saved.borrow_mut().extend(intervals);
    }

    /// Wire the collection to its op emitter and materialize any snapshot
    /// intervals. Attaching twice is a usage error.
    pub fn attach(&self, emitter: Emitter) -> Result<(), IntervalError> {
        if self.attached() {
            return Err(IntervalError::AlreadyAttached);
        }
        let weak = Rc::downgrade(&self.inner);
        let on_position_change: crate::local_collection::PositionChangeCallback =
            Rc::new(move |interval: &IntervalHandle, previous: &IntervalHandle| {
                if let Some(inner) = weak.upgrade() {
                    let collection = IntervalCollection { inner };
                    collection.emit_change_interval(interval, previous, true, None, true);
                }
            });
        let local = LocalIntervalCollection::new(
            self.inner.label.clone(),
            self.inner.client.clone(),
            Some(on_position_change),
        );
        *self.inner.local.borrow_mut() = Some(local.clone());
        *self.inner.emitter.borrow_mut() = Some(emitter);

        for mut serialized in self.inner.saved.borrow_mut().drain(..) {
            LocalIntervalCollection::ensure_serialized_id(&mut serialized);
            LocalIntervalCollection::add_interval(
                &local,
                serialized.start,
                serialized.end,
                serialized.interval_type,
                serialized.properties.clone(),
                None,
                true,
                serialized.stickiness.unwrap_or_default(),
            )?;
        }
        Ok(())
    }

    fn require_local(&self) -> Result<Rc<RefCell<LocalIntervalCollection>>, IntervalError> {
        self.inner
            .local
            .borrow()
            .clone()
            .ok_or(IntervalError::NotAttached)
    }

    fn next_local_seq(&self) -> LocalSeq {
        match &self.inner.client {
            Some(client) => client.get_collab_window().next_local_seq(),
            None => {
                let next = self.inner.own_local_seq.get() + 1;
                self.inner.own_local_seq.set(next);
                next
            }
        }
    }

    fn current_seq(&self) -> crate::Seq {
        self.inner
            .client
            .as_ref()
            .map_or(0, |client| client.get_current_seq())
    }

    fn emit_op(&self, op: CollectionOp, metadata: OpMetadata) {
        if let Some(emitter) = self.inner.emitter.borrow_mut().as_mut() {
            emitter(op, metadata);
        }
    }

    /// Fire a change event with the previous interval's endpoints
    /// temporarily retyped transient, so position queries on the snapshot
    /// resolve even after the live endpoints have moved on.
    fn emit_change_interval(
        &self,
        interval: &IntervalHandle,
        previous: &IntervalHandle,
        local: bool,
        op: Option<SequencedOp>,
        slide: bool,
    ) {
        let restore = previous.as_sequence().map(|si| {
            (si.start.retype_transient(), si.end.retype_transient())
        });
        self.inner.events.change_interval.emit(&ChangeIntervalArgs {
            interval: interval.clone(),
            previous: previous.clone(),
            local,
            op,
            slide,
        });
        if let (Some((start_type, end_type)), Some(si)) = (restore, previous.as_sequence()) {
            si.start.restore_type(start_type);
            si.end.restore_type(end_type);
        }
    }

    // ------------------------------------------------------------------
    // Indices
    // ------------------------------------------------------------------

    pub fn attach_index(
        &self,
        index: Rc<RefCell<dyn IntervalIndex>>,
    ) -> Result<(), IntervalError> {
        let local = self.require_local()?;
        local.borrow_mut().append_index(index);
        Ok(())
    }

    pub fn detach_index(
        &self,
        index: &Rc<RefCell<dyn IntervalIndex>>,
    ) -> Result<bool, IntervalError> {
        let local = self.require_local()?;
        let removed = local.borrow_mut().remove_index(index);
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_interval_by_id(&self, id: &str) -> Option<IntervalHandle> {
        let local = self.inner.local.borrow().clone()?;
        let interval = local.borrow().id_index().get(id);
        interval
    }

    fn probe(&self, start: i64, end: i64, bias: i8) -> IntervalHandle {
        match &self.inner.client {
            Some(client) => transient_probe(client, &self.inner.label, start, end, bias),
            None => numeric_probe(start, end, bias),
        }
    }

    /// Every interval overlapping `[start, end]`. Detached intervals never
    /// overlap a live range.
    pub fn find_overlapping_intervals(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<IntervalHandle>, IntervalError> {
        let local = self.require_local()?;
        if start > end {
            return Ok(Vec::new());
        }
        let local = local.borrow();
        if local.overlap_index().is_empty() {
            return Ok(Vec::new());
        }
        let probe = self.probe(start, end, 0);
        Ok(local.overlap_index().find_overlapping(&probe))
    }

    /// Last interval ending at or before `pos`.
    pub fn previous_interval(&self, pos: i64) -> Result<Option<IntervalHandle>, IntervalError> {
        let local = self.require_local()?;
        let probe = self.probe(pos, pos, 1);
        let result = local.borrow().endpoint_index().previous_interval(&probe);
        Ok(result)
    }

    /// First interval ending at or after `pos`.
    pub fn next_interval(&self, pos: i64) -> Result<Option<IntervalHandle>, IntervalError> {
        let local = self.require_local()?;
        let probe = self.probe(pos, pos, -1);
        let result = local.borrow().endpoint_index().next_interval(&probe);
        Ok(result)
    }

    /// Collect intervals in (start, end, id) order, optionally filtered to
    /// an exact start or end position, forward or backward.
    pub fn gather_iteration_results(
        &self,
        results: &mut Vec<IntervalHandle>,
        iterates_forward: bool,
        start: Option<i64>,
        end: Option<i64>,
    ) {
        let Ok(local) = self.require_local() else {
            return;
        };
        let local = local.borrow();
        let mut push = |interval: &IntervalHandle| {
            let start_matches = start.map_or(true, |s| interval.start_position() == s);
            let end_matches = end.map_or(true, |e| interval.end_position() == e);
            if start_matches && end_matches {
                results.push(interval.clone());
            }
        };
        if iterates_forward {
            local.overlap_index().for_each(&mut push);
        } else {
            local.overlap_index().for_each_rev(&mut push);
        }
    }

    pub fn iter(&self) -> std::vec::IntoIter<IntervalHandle> {
        let mut results = Vec::new();
        self.gather_iteration_results(&mut results, true, None, None);
        results.into_iter()
    }

    /// Run a deserializer synchronously over every interval.
    pub fn attach_deserializer(&self, mut deserializer: impl FnMut(&IntervalHandle)) {
        for interval in self.iter() {
            deserializer(&interval);
        }
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Create an interval over `[start, end]` and broadcast it.
    pub fn add(
        &self,
        start: i64,
        end: i64,
        interval_type: IntervalType,
        properties: Option<PropertySet>,
        stickiness: Option<IntervalStickiness>,
    ) -> Result<IntervalHandle, IntervalError> {
        let local = self.require_local()?;
        if interval_type.contains(IntervalType::TRANSIENT) {
            return Err(IntervalError::TransientInterval);
        }
        let stickiness = stickiness.unwrap_or_default();
        if stickiness != IntervalStickiness::END
            && !self.inner.options.interval_stickiness_enabled
        {
            return Err(IntervalError::StickinessDisabled);
        }
        if start > end {
            return Err(IntervalError::InvertedRange);
        }

        let interval = LocalIntervalCollection::add_interval(
            &local,
            start,
            end,
            interval_type,
            properties,
            None,
            false,
            stickiness,
        )?;

        let serialized = interval.serialize().to_delta();
        let local_seq = self.next_local_seq();
        self.inner
            .local_seq_to_serialized
            .borrow_mut()
            .insert(local_seq, serialized.clone());
        debug!(label = %self.inner.label, local_seq, "submitting interval add");
        self.emit_op(
            CollectionOp {
                name: OpName::Add,
                value: serialized,
            },
            OpMetadata { local_seq },
        );
        self.inner.events.add_interval.emit(&AddIntervalArgs {
            interval: interval.clone(),
            local: true,
            op: None,
        });
        Ok(interval)
    }

    /// Remove an interval by id. Unknown ids yield `None`.
    pub fn remove_interval_by_id(&self, id: &str) -> Option<IntervalHandle> {
        let local = self.inner.local.borrow().clone()?;
        let interval = local.borrow().id_index().get(id)?;
        LocalIntervalCollection::remove_existing_interval(&local, &interval);
        self.destroy_endpoint_references(&interval);

        let serialized = SerializedIntervalDelta {
            start: None,
            end: None,
            sequence_number: self.current_seq(),
            interval_type: interval.interval_type(),
            properties: Some(
                [(
                    SmartString::from(RESERVED_INTERVAL_ID_KEY),
                    serde_json::Value::String(id.to_string()),
                )]
                .into_iter()
                .collect(),
            ),
            stickiness: None,
        };
        let local_seq = self.next_local_seq();
        debug!(label = %self.inner.label, id, local_seq, "submitting interval delete");
        self.emit_op(
            CollectionOp {
                name: OpName::Delete,
                value: serialized,
            },
            OpMetadata { local_seq },
        );
        self.inner.events.delete_interval.emit(&DeleteIntervalArgs {
            interval: interval.clone(),
            local: true,
            op: None,
        });
        Some(interval)
    }

    /// Move one or both endpoints of an interval. Unknown ids and no-op
    /// changes yield `None`.
    pub fn change(
        &self,
        id: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Option<IntervalHandle>, IntervalError> {
        let local = self.require_local()?;
        let Some(interval) = local.borrow().id_index().get(id) else {
            return Ok(None);
        };
        if start.is_none() && end.is_none() {
            return Ok(None);
        }

        let Some(modified) =
            LocalIntervalCollection::change_interval(&local, &interval, start, end, None)?
        else {
            return Ok(None);
        };

        let serialized = SerializedIntervalDelta {
            start,
            end,
            sequence_number: self.current_seq(),
            interval_type: interval.interval_type(),
            properties: Some(
                [(
                    SmartString::from(RESERVED_INTERVAL_ID_KEY),
                    serde_json::Value::String(id.to_string()),
                )]
                .into_iter()
                .collect(),
            ),
            stickiness: None,
        };
        let local_seq = self.next_local_seq();
        self.inner
            .local_seq_to_serialized
            .borrow_mut()
            .insert(local_seq, serialized.clone());
        self.add_pending_change(id, &serialized);
        debug!(label = %self.inner.label, id, local_seq, "submitting interval change");
        self.emit_op(
            CollectionOp {
                name: OpName::Change,
                value: serialized,
            },
            OpMetadata { local_seq },
        );
        self.emit_change_interval(&modified, &interval, true, None, false);
        Ok(Some(modified))
    }

    /// Change user properties. Reserved keys are rejected; unknown ids are
    /// a silent no-op.
    pub fn change_properties(
        &self,
        id: &str,
        properties: PropertySet,
    ) -> Result<(), IntervalError> {
        self.require_local()?;
        for key in properties.keys() {
            if is_reserved_key(key) {
                return Err(IntervalError::ReservedProperty(key.clone()));
            }
        }
        let Some(interval) = self.get_interval_by_id(id) else {
            return Ok(());
        };

        let deltas = match &*interval {
            Interval::Sequence(si) => si.property_manager.borrow_mut().change_properties(
                &properties,
                &mut si.properties.borrow_mut(),
                UNASSIGNED_SEQ,
            ),
            Interval::Numeric(ni) => ni.property_manager.borrow_mut().change_properties(
                &properties,
                &mut ni.properties.borrow_mut(),
                UNASSIGNED_SEQ,
            ),
        };

        let mut op_properties = properties;
        op_properties.insert(
            SmartString::from(RESERVED_INTERVAL_ID_KEY),
            serde_json::Value::String(id.to_string()),
        );
        let serialized = SerializedIntervalDelta {
            start: None,
            end: None,
            sequence_number: self.current_seq(),
            interval_type: interval.interval_type(),
            properties: Some(op_properties),
            stickiness: None,
        };
        let local_seq = self.next_local_seq();
        self.inner
            .local_seq_to_serialized
            .borrow_mut()
            .insert(local_seq, serialized.clone());
        debug!(label = %self.inner.label, id, local_seq, "submitting property change");
        self.emit_op(
            CollectionOp {
                name: OpName::Change,
                value: serialized,
            },
            OpMetadata { local_seq },
        );
        self.inner.events.property_changed.emit(&PropertyChangedArgs {
            interval,
            deltas,
            local: true,
            op: None,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending-change bookkeeping
    // ------------------------------------------------------------------

    fn add_pending_change(&self, id: &str, delta: &SerializedIntervalDelta) {
        if delta.start.is_some() {
            self.inner
                .pending_change_start
                .borrow_mut()
                .entry(SmartString::from(id))
                .or_default()
                .push_back(delta.clone());
        }
        if delta.end.is_some() {
            self.inner
                .pending_change_end
                .borrow_mut()
                .entry(SmartString::from(id))
                .or_default()
                .push_back(delta.clone());
        }
    }

    fn remove_pending_change(&self, id: &str, delta: &SerializedIntervalDelta) {
        fn pop(
            map: &RefCell<HashMap<SmartString, VecDeque<SerializedIntervalDelta>>>,
            id: &str,
            expected: Option<i64>,
            which: &str,
        ) {
            let mut map = map.borrow_mut();
            let queue = map.get_mut(id).unwrap_or_else(|| {
                panic!("Internal consistency error: ack without pending {which} change")
            });
            let head = queue.pop_front().unwrap_or_else(|| {
                panic!("Internal consistency error: ack without pending {which} change")
            });
            let head_value = if which == "start" { head.start } else { head.end };
            assert_eq!(
                head_value, expected,
                "Internal consistency error: acked {which} does not match pending change"
            );
            if queue.is_empty() {
                map.remove(id);
            }
        }
        if delta.start.is_some() {
            pop(&self.inner.pending_change_start, id, delta.start, "start");
        }
        if delta.end.is_some() {
            pop(&self.inner.pending_change_end, id, delta.end, "end");
        }
    }

    fn has_pending_change_start(&self, id: &str) -> bool {
        self.inner.pending_change_start.borrow().contains_key(id)
    }

    fn has_pending_change_end(&self, id: &str) -> bool {
        self.inner.pending_change_end.borrow().contains_key(id)
    }

    fn consume_local_seq(&self, local_seq: LocalSeq) -> Option<SerializedIntervalDelta> {
        let rebased = self.inner.local_seq_to_rebased.borrow_mut().remove(&local_seq);
        let original = self
            .inner
            .local_seq_to_serialized
            .borrow_mut()
            .remove(&local_seq);
        rebased.or(original)
    }

    // ------------------------------------------------------------------
    // Acknowledgement
    // ------------------------------------------------------------------

    pub fn ack_add(
        &self,
        serialized: &SerializedIntervalDelta,
        local: bool,
        op: &SequencedOp,
        metadata: Option<&OpMetadata>,
    ) {
        let local_collection = self
            .require_local()
            .unwrap_or_else(|_| panic!("Internal consistency error: op before attach"));
        if local {
            let metadata = metadata
                .unwrap_or_else(|| panic!("Internal consistency error: local ack without metadata"));
            self.consume_local_seq(metadata.local_seq);
            let id = delta_interval_id(serialized);
            trace!(label = %self.inner.label, %id, "add acked");
            if let Some(interval) = self.get_interval_by_id(&id) {
                self.ack_interval(&interval, op);
            }
            return;
        }

        let mut full = serialized.require_full();
        let _id = LocalIntervalCollection::ensure_serialized_id(&mut full);
        let interval = LocalIntervalCollection::add_interval(
            &local_collection,
            full.start,
            full.end,
            full.interval_type,
            full.properties.clone(),
            Some(op),
            false,
            full.stickiness.unwrap_or_default(),
        )
        .unwrap_or_else(|_| panic!("Internal consistency error: remote add failed"));
        self.inner.events.add_interval.emit(&AddIntervalArgs {
            interval,
            local: false,
            op: Some(op.clone()),
        });
    }

    pub fn ack_change(
        &self,
        serialized: &SerializedIntervalDelta,
        local: bool,
        op: &SequencedOp,
        metadata: Option<&OpMetadata>,
    ) {
        let local_collection = self
            .require_local()
            .unwrap_or_else(|_| panic!("Internal consistency error: op before attach"));

        // Strip the id out of the op's property set; the remainder is the
        // property change payload.
        let mut op_properties = serialized.properties.clone().unwrap_or_default();
        let id = op_properties
            .remove(RESERVED_INTERVAL_ID_KEY)
            .and_then(|v| v.as_str().map(SmartString::from))
            .unwrap_or_else(|| panic!("Internal consistency error: change op without id"));

        if local {
            let metadata = metadata
                .unwrap_or_else(|| panic!("Internal consistency error: local ack without metadata"));
            self.consume_local_seq(metadata.local_seq);
            if serialized.start.is_some() || serialized.end.is_some() {
                self.remove_pending_change(&id, serialized);
            }
            trace!(label = %self.inner.label, %id, "change acked");
            if let Some(interval) = self.get_interval_by_id(&id) {
                if !op_properties.is_empty() {
                    match &*interval {
                        Interval::Sequence(si) => si
                            .property_manager
                            .borrow_mut()
                            .ack_pending_properties(&op_properties),
                        Interval::Numeric(ni) => ni
                            .property_manager
                            .borrow_mut()
                            .ack_pending_properties(&op_properties),
                    }
                }
                self.ack_interval(&interval, op);
            }
            return;
        }

        let Some(interval) = self.get_interval_by_id(&id) else {
            // Concurrently deleted; nothing to apply.
            return;
        };

        // A pending local change for an endpoint wins over the remote one.
        let start = if self.has_pending_change_start(&id) {
            None
        } else {
            serialized.start
        };
        let end = if self.has_pending_change_end(&id) {
            None
        } else {
            serialized.end
        };

        let modified = if start.is_some() || end.is_some() {
            LocalIntervalCollection::change_interval(
                &local_collection,
                &interval,
                start,
                end,
                Some(op),
            )
            .unwrap_or_else(|_| panic!("Internal consistency error: remote change failed"))
        } else {
            None
        };
        let current = modified.clone().unwrap_or_else(|| interval.clone());

        let deltas = if op_properties.is_empty() {
            PropertySet::new()
        } else {
            match &*current {
                Interval::Sequence(si) => si.property_manager.borrow_mut().change_properties(
                    &op_properties,
                    &mut si.properties.borrow_mut(),
                    op.sequence_number,
                ),
                Interval::Numeric(ni) => ni.property_manager.borrow_mut().change_properties(
                    &op_properties,
                    &mut ni.properties.borrow_mut(),
                    op.sequence_number,
                ),
            }
        };

        if let Some(modified) = &modified {
            self.emit_change_interval(modified, &interval, false, Some(op.clone()), false);
        }
        if !deltas.is_empty() {
            self.inner.events.property_changed.emit(&PropertyChangedArgs {
                interval: current,
                deltas,
                local: false,
                op: Some(op.clone()),
            });
        }
    }

    pub fn ack_delete(&self, serialized: &SerializedIntervalDelta, local: bool, op: &SequencedOp) {
        if local {
            // Deletes apply on submit; the ack is a no-op.
            return;
        }
        let Ok(local_collection) = self.require_local() else {
            panic!("Internal consistency error: op before attach");
        };
        let id = delta_interval_id(serialized);
        let Some(interval) = self.get_interval_by_id(&id) else {
            return;
        };
        LocalIntervalCollection::remove_existing_interval(&local_collection, &interval);
        self.destroy_endpoint_references(&interval);
        self.inner.events.delete_interval.emit(&DeleteIntervalArgs {
            interval,
            local: false,
            op: Some(op.clone()),
        });
    }

    /// Promote a locally created interval's endpoints on ack: clear
    /// STAY_ON_REMOVE, set SLIDE_ON_REMOVE, and slide each endpoint whose
    /// segment's removal has since been acknowledged. Endpoints with a
    /// pending local change are left for that change's own ack.
    fn ack_interval(&self, interval: &IntervalHandle, op: &SequencedOp) {
        let Interval::Sequence(si) = &**interval else {
            return;
        };
        let stay = ReferenceType::STAY_ON_REMOVE;
        if !si.start.ref_type().contains(stay) && !si.end.ref_type().contains(stay) {
            return;
        }
        let Some(client) = self.inner.client.clone() else {
            return;
        };
        let id = interval
            .id()
            .unwrap_or_else(|| panic!("Internal consistency error: acked interval without id"));

        let mut moves = Vec::new();
        for (reference, has_pending) in [
            (&si.start, self.has_pending_change_start(&id)),
            (&si.end, self.has_pending_change_end(&id)),
        ] {
            if has_pending || !reference.ref_type().contains(stay) {
                continue;
            }
            reference.set_ref_type(
                reference
                    .ref_type()
                    .without(stay)
                    .with(ReferenceType::SLIDE_ON_REMOVE),
            );
            if let Some(segment) = reference.segment() {
                if segment.removed_seq.get().is_some() {
                    let target = client.get_slide_to_segment(
                        &segment,
                        reference.offset(),
                        reference.sliding_preference(),
                    );
                    moves.push((reference.clone(), target));
                }
            }
        }

        if moves.is_empty() {
            return;
        }
        trace!(label = %self.inner.label, %id, "sliding promoted endpoints");

        let local_collection = self
            .require_local()
            .unwrap_or_else(|_| panic!("Internal consistency error: op before attach"));
        let previous: IntervalHandle = Rc::new(Interval::Sequence(si.clone_transient_snapshot()));
        LocalIntervalCollection::remove_existing_interval(&local_collection, interval);
        for (reference, target) in moves {
            reference.move_to(target);
        }
        LocalIntervalCollection::add_existing(&local_collection, interval);
        self.emit_change_interval(interval, &previous, true, Some(op.clone()), true);
    }

    /// Unregister an interval's endpoint references from their segments.
    /// Only called when the interval is destroyed, never when it is
    /// replaced (replacements may share references).
    fn destroy_endpoint_references(&self, interval: &IntervalHandle) {
        let (Some(client), Interval::Sequence(si)) = (&self.inner.client, &**interval) else {
            return;
        };
        client.remove_local_reference_position(&si.start);
        client.remove_local_reference_position(&si.end);
    }

    // ------------------------------------------------------------------
    // Rebase
    // ------------------------------------------------------------------

    /// Recompute a pending op's positions against current sequence state.
    ///
    /// Returns the rebased delta to resubmit, or `None` when the op became
    /// a no-op because its text is gone (the local interval, if any, is
    /// removed without events and the op's bookkeeping is dropped).
    pub fn rebase_local_interval(
        &self,
        op_name: OpName,
        serialized: &SerializedIntervalDelta,
        local_seq: LocalSeq,
    ) -> Option<SerializedIntervalDelta> {
        let Some(client) = self.inner.client.clone() else {
            return Some(serialized.clone());
        };
        let local_collection = self.require_local().ok()?;
        let id = delta_interval_id(serialized);
        let stickiness = serialized.stickiness.unwrap_or_default();

        let rebase_endpoint = |pos: Option<i64>, is_start: bool| -> Option<i64> {
            let pos = pos?;
            if pos < 0 {
                return Some(crate::DETACHED_POSITION);
            }
            let perspective = client.local_perspective(serialized.sequence_number, local_seq);
            let (segment, offset) = client
                .get_containing_segment(pos as usize, Some(&perspective), Some(local_seq))
                .unwrap_or_else(|| {
                    panic!("Internal consistency error: rebased position has no segment")
                });
            let preference = if is_start {
                crate::interval::start_reference_sliding_preference(stickiness)
            } else {
                crate::interval::end_reference_sliding_preference(stickiness)
            };
            match client.get_slide_to_segment(&segment, offset, preference) {
                Some((segment, offset)) => {
                    Some(client.find_reconnection_position(&segment, local_seq) as i64 + offset as i64)
                }
                None => Some(crate::DETACHED_POSITION),
            }
        };

        let new_start = rebase_endpoint(serialized.start, true);
        let new_end = rebase_endpoint(serialized.end, false);

        let detached = new_start == Some(crate::DETACHED_POSITION)
            || new_end == Some(crate::DETACHED_POSITION);
        if detached {
            debug!(label = %self.inner.label, %id, "pending op references removed text; dropping");
            if let Some(interval) = self.get_interval_by_id(&id) {
                LocalIntervalCollection::remove_existing_interval(&local_collection, &interval);
                self.destroy_endpoint_references(&interval);
            }
            if serialized.start.is_some() || serialized.end.is_some() {
                if op_name == OpName::Change {
                    self.remove_pending_change(&id, serialized);
                }
            }
            self.inner
                .local_seq_to_serialized
                .borrow_mut()
                .remove(&local_seq);
            self.inner.local_seq_to_rebased.borrow_mut().remove(&local_seq);
            return None;
        }

        let mut rebased = serialized.clone();
        rebased.start = new_start;
        rebased.end = new_end;
        self.inner
            .local_seq_to_rebased
            .borrow_mut()
            .insert(local_seq, rebased.clone());

        if op_name == OpName::Change {
            self.replace_pending_change(&id, serialized, &rebased);
        }

        if let Some(interval) = self.get_interval_by_id(&id) {
            if let Ok(Some(modified)) = LocalIntervalCollection::change_interval(
                &local_collection,
                &interval,
                new_start,
                new_end,
                None,
            ) {
                self.emit_change_interval(&modified, &interval, true, None, false);
            }
        }
        Some(rebased)
    }

    /// Swap the queued pending-change entry for this op with its rebased
    /// form so the eventual ack matches.
    fn replace_pending_change(
        &self,
        id: &str,
        old: &SerializedIntervalDelta,
        new: &SerializedIntervalDelta,
    ) {
        fn replace(
            map: &RefCell<HashMap<SmartString, VecDeque<SerializedIntervalDelta>>>,
            id: &str,
            old_value: Option<i64>,
            new_delta: &SerializedIntervalDelta,
            is_start: bool,
        ) {
            let mut map = map.borrow_mut();
            if let Some(queue) = map.get_mut(id) {
                for entry in queue.iter_mut() {
                    let value = if is_start { entry.start } else { entry.end };
                    if value == old_value && entry.sequence_number == new_delta.sequence_number {
                        *entry = new_delta.clone();
                        break;
                    }
                }
            }
        }
        if old.start.is_some() {
            replace(&self.inner.pending_change_start, id, old.start, new, true);
        }
        if old.end.is_some() {
            replace(&self.inner.pending_change_end, id, old.end, new, false);
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub fn serialize(&self) -> SerializedCollectionV2 {
        match self.inner.local.borrow().as_ref() {
            Some(local) => local.borrow().serialize(),
            None => {
                let mut intervals = Vec::new();
                for serialized in self.inner.saved.borrow().iter() {
                    let mut properties = serialized.properties.clone().unwrap_or_default();
                    properties.remove(crate::properties::RESERVED_RANGE_LABELS_KEY);
                    intervals.push(crate::ops::CompactSerializedInterval {
                        start: serialized.start,
                        end: serialized.end,
                        sequence_number: serialized.sequence_number,
                        interval_type: serialized.interval_type,
                        properties,
                        stickiness: serialized.stickiness,
                    });
                }
                SerializedCollectionV2 {
                    label: self.inner.label.clone(),
                    version: crate::ops::COLLECTION_FORMAT_VERSION,
                    intervals,
                }
            }
        }
    }

    /// Validate cross-index agreement. Test and fuzzing support.
    pub fn check(&self) {
        if let Some(local) = self.inner.local.borrow().as_ref() {
            crate::check::check_local_collection(&local.borrow());
        }
    }
}

fn delta_interval_id(serialized: &SerializedIntervalDelta) -> SmartString {
    serialized
        .properties
        .as_ref()
        .and_then(|props| props.get(RESERVED_INTERVAL_ID_KEY))
        .and_then(|v| v.as_str())
        .map(SmartString::from)
        .unwrap_or_else(|| panic!("Internal consistency error: op without interval id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn numeric_collection() -> (IntervalCollection, Rc<RefCell<Vec<CollectionOp>>>) {
        let collection = IntervalCollection::new("ranges", None, CollectionOptions::default());
        let ops: Rc<RefCell<Vec<CollectionOp>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = ops.clone();
        collection
            .attach(Box::new(move |op, _metadata| sink.borrow_mut().push(op)))
            .unwrap();
        (collection, ops)
    }

    #[test]
    fn numeric_collection_add_change_query() {
        let (collection, ops) = numeric_collection();

        let a = collection
            .add(0, 5, IntervalType::SLIDE_ON_REMOVE, None, None)
            .unwrap();
        let b = collection
            .add(10, 12, IntervalType::SLIDE_ON_REMOVE, None, None)
            .unwrap();
        assert_eq!(ops.borrow().len(), 2);
        collection.check();

        let a_id = a.id().unwrap();
        let changed = collection
            .change(&a_id, Some(2), Some(7))
            .unwrap()
            .expect("change applied");
        assert_eq!(changed.start_position(), 2);
        assert_eq!(changed.end_position(), 7);
        collection.check();

        let overlapping = collection.find_overlapping_intervals(6, 11).unwrap();
        assert_eq!(overlapping.len(), 2);
        let overlapping = collection.find_overlapping_intervals(8, 9).unwrap();
        assert!(overlapping.is_empty());

        let previous = collection.previous_interval(9).unwrap().unwrap();
        assert_eq!(previous.end_position(), 7);
        let next = collection.next_interval(9).unwrap().unwrap();
        assert_eq!(next.end_position(), 12);
        let _ = b;
    }

    #[test]
    fn numeric_collection_serializes_v2() {
        let (collection, _ops) = numeric_collection();
        collection
            .add(
                1,
                3,
                IntervalType::SLIDE_ON_REMOVE,
                Some(
                    [(SmartString::from("tag"), json!("x"))]
                        .into_iter()
                        .collect(),
                ),
                None,
            )
            .unwrap();

        let stored = collection.serialize();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.intervals.len(), 1);
        let row = &stored.intervals[0];
        assert_eq!((row.start, row.end), (1, 3));
        assert_eq!(row.properties.get("tag"), Some(&json!("x")));
        assert!(!row.properties.contains_key("rangeLabels"));
    }

    #[test]
    fn add_before_attach_is_rejected() {
        let collection = IntervalCollection::new("ranges", None, CollectionOptions::default());
        let result = collection.add(0, 1, IntervalType::SLIDE_ON_REMOVE, None, None);
        assert!(matches!(result, Err(IntervalError::NotAttached)));
        assert!(matches!(
            collection.find_overlapping_intervals(0, 1),
            Err(IntervalError::NotAttached)
        ));
    }

    #[test]
    fn attach_twice_is_rejected() {
        let (collection, _ops) = numeric_collection();
        assert!(matches!(
            collection.attach(Box::new(|_, _| {})),
            Err(IntervalError::AlreadyAttached)
        ));
    }
}
