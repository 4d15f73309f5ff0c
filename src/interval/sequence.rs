//! Sequence-anchored intervals: endpoints are position references into the
//! sequence, created with the removal behavior their provenance demands.

use std::cell::{Cell, RefCell};

use smartstring::alias::String as SmartString;

use crate::collection::IntervalError;
use crate::interval::{
    end_reference_sliding_preference, start_reference_sliding_preference, IntervalHandle,
    IntervalStickiness, IntervalType,
};
use crate::ops::SequencedOp;
use crate::properties::{PropertyManager, PropertySet, RESERVED_RANGE_LABELS_KEY};
use crate::sequence::{LocalReference, Perspective, ReferenceType, SequenceClient, SlidingPreference};

#[derive(Debug)]
pub struct SequenceInterval {
    pub(crate) client: SequenceClient,
    pub(crate) start: LocalReference,
    pub(crate) end: LocalReference,
    pub(crate) interval_type: IntervalType,
    pub(crate) stickiness: IntervalStickiness,
    pub(crate) properties: RefCell<PropertySet>,
    pub(crate) property_manager: RefCell<PropertyManager>,
    pub(crate) probe_bias: Cell<i8>,

    /// Slide burst state: how many endpoint slides are in flight, and the
    /// pre-slide snapshot taken on the first of them.
    pub(crate) slide_pending: Cell<u32>,
    pub(crate) slide_previous: RefCell<Option<IntervalHandle>>,
}

fn endpoint_base_type(interval_type: IntervalType, is_start: bool) -> ReferenceType {
    if interval_type.contains(IntervalType::TRANSIENT) {
        ReferenceType::TRANSIENT
    } else if interval_type.contains(IntervalType::NEST) {
        if is_start {
            ReferenceType::NEST_BEGIN
        } else {
            ReferenceType::NEST_END
        }
    } else if is_start {
        ReferenceType::RANGE_BEGIN
    } else {
        ReferenceType::RANGE_END
    }
}

/// Create an endpoint reference at `pos`.
///
/// References born from an acked op (or a snapshot) are SLIDE_ON_REMOVE and
/// slide immediately if their target segment is already gone; locally
/// created references are STAY_ON_REMOVE and are promoted on ack. A
/// position that cannot be anchored under an op's perspective (including
/// the detached sentinel itself) yields a detached reference; for local
/// creation it is a usage error.
pub(crate) fn create_position_reference(
    client: &SequenceClient,
    pos: i64,
    ref_type: ReferenceType,
    op: Option<&SequencedOp>,
    from_snapshot: bool,
    sliding: SlidingPreference,
) -> Result<LocalReference, IntervalError> {
    if pos < 0 {
        if op.is_some() || from_snapshot {
            return Ok(client.create_detached_local_reference_position(ref_type, sliding));
        }
        return Err(IntervalError::OutOfBounds(pos));
    }
    let pos = pos as usize;

    if let Some(op) = op {
        let perspective = Perspective {
            ref_seq: op.reference_sequence_number,
            client_id: op.client_id.clone(),
            local_seq: None,
        };
        let segoff = client
            .get_containing_segment(pos, Some(&perspective), None)
            .and_then(|(seg, off)| client.get_slide_to_segment(&seg, off, sliding));
        return Ok(match segoff {
            Some((seg, off)) => {
                client.create_local_reference_position(&seg, off, ref_type, sliding)
            }
            None => client.create_detached_local_reference_position(ref_type, sliding),
        });
    }

    match client.get_containing_segment(pos, None, None) {
        Some((seg, off)) => Ok(client.create_local_reference_position(&seg, off, ref_type, sliding)),
        None if from_snapshot => {
            Ok(client.create_detached_local_reference_position(ref_type, sliding))
        }
        None => Err(IntervalError::OutOfBounds(pos as i64)),
    }
}

impl SequenceInterval {
    /// Construct a new interval over `[start, end]`.
    ///
    /// The reference types depend on provenance: an acked op or snapshot
    /// yields SLIDE_ON_REMOVE endpoints, local creation yields
    /// STAY_ON_REMOVE endpoints (promoted on ack of the add op). Transient
    /// intervals get transient references.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        label: &str,
        start: i64,
        end: i64,
        client: &SequenceClient,
        interval_type: IntervalType,
        op: Option<&SequencedOp>,
        from_snapshot: bool,
        stickiness: IntervalStickiness,
    ) -> Result<SequenceInterval, IntervalError> {
        let transient = interval_type.contains(IntervalType::TRANSIENT);
        let slide_flag = if transient {
            ReferenceType::SIMPLE
        } else if op.is_some() || from_snapshot {
            ReferenceType::SLIDE_ON_REMOVE
        } else {
            ReferenceType::STAY_ON_REMOVE
        };

        let start_ref = create_position_reference(
            client,
            start,
            endpoint_base_type(interval_type, true).with(slide_flag),
            op,
            from_snapshot,
            start_reference_sliding_preference(stickiness),
        )?;
        let end_ref = create_position_reference(
            client,
            end,
            endpoint_base_type(interval_type, false).with(slide_flag),
            op,
            from_snapshot,
            end_reference_sliding_preference(stickiness),
        )?;

        let interval = SequenceInterval {
            client: client.clone(),
            start: start_ref,
            end: end_ref,
            interval_type,
            stickiness,
            properties: RefCell::new(PropertySet::new()),
            property_manager: RefCell::new(PropertyManager::new()),
            probe_bias: Cell::new(0),
            slide_pending: Cell::new(0),
            slide_previous: RefCell::new(None),
        };
        interval.label_endpoints(label);
        Ok(interval)
    }

    /// Stamp both endpoints with the collection label so an endpoint can be
    /// located back to its collection.
    fn label_endpoints(&self, label: &str) {
        for reference in [&self.start, &self.end] {
            reference.properties_mut().insert(
                SmartString::from(RESERVED_RANGE_LABELS_KEY),
                serde_json::json!([label]),
            );
        }
    }

    /// Build a new interval with the given endpoints moved.
    ///
    /// A fresh reference is created only for an endpoint whose position
    /// actually changes; unchanged endpoints reuse the existing reference.
    /// Without an op the fresh references are STAY_ON_REMOVE (pending).
    /// Returns `None` when nothing changes.
    pub(crate) fn modify(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        op: Option<&SequencedOp>,
        stickiness: Option<IntervalStickiness>,
    ) -> Result<Option<SequenceInterval>, IntervalError> {
        let stickiness = stickiness.unwrap_or(self.stickiness);
        let slide_flag = if op.is_some() {
            ReferenceType::SLIDE_ON_REMOVE
        } else {
            ReferenceType::STAY_ON_REMOVE
        };

        // A remote position is in the op's coordinates; comparing it to a
        // local resolve would be meaningless, so ops always rebuild their
        // endpoints. Locally, an endpoint that isn't actually moving keeps
        // its reference.
        let mut changed = false;
        let start_ref = match start {
            Some(pos) if op.is_some() || pos != self.client.resolve(&self.start) => {
                changed = true;
                create_position_reference(
                    &self.client,
                    pos,
                    endpoint_base_type(self.interval_type, true).with(slide_flag),
                    op,
                    false,
                    start_reference_sliding_preference(stickiness),
                )?
            }
            _ => self.start.clone(),
        };
        let end_ref = match end {
            Some(pos) if op.is_some() || pos != self.client.resolve(&self.end) => {
                changed = true;
                create_position_reference(
                    &self.client,
                    pos,
                    endpoint_base_type(self.interval_type, false).with(slide_flag),
                    op,
                    false,
                    end_reference_sliding_preference(stickiness),
                )?
            }
            _ => self.end.clone(),
        };

        if !changed {
            return Ok(None);
        }

        let modified = SequenceInterval {
            client: self.client.clone(),
            start: start_ref,
            end: end_ref,
            interval_type: self.interval_type,
            stickiness,
            properties: RefCell::new(self.properties.borrow().clone()),
            property_manager: RefCell::new(self.property_manager.borrow().clone()),
            probe_bias: Cell::new(0),
            slide_pending: Cell::new(0),
            slide_previous: RefCell::new(None),
        };
        // Fresh references need the collection label the old ones carried.
        let labels = self.start.properties().get(RESERVED_RANGE_LABELS_KEY).cloned();
        if let Some(labels) = labels {
            for reference in [&modified.start, &modified.end] {
                reference
                    .properties_mut()
                    .entry(SmartString::from(RESERVED_RANGE_LABELS_KEY))
                    .or_insert_with(|| labels.clone());
            }
        }
        Ok(Some(modified))
    }

    /// A transient snapshot sharing the current segment/offset of both
    /// endpoints, used as the `previousInterval` in change events.
    pub(crate) fn clone_transient_snapshot(&self) -> SequenceInterval {
        SequenceInterval {
            client: self.client.clone(),
            start: self.start.clone_transient(),
            end: self.end.clone_transient(),
            interval_type: self.interval_type,
            stickiness: self.stickiness,
            properties: RefCell::new(self.properties.borrow().clone()),
            property_manager: RefCell::new(self.property_manager.borrow().clone()),
            probe_bias: Cell::new(0),
            slide_pending: Cell::new(0),
            slide_previous: RefCell::new(None),
        }
    }
}
