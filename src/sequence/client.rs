//! A compact merge-tree style sequence client.
//!
//! This implements the surface the interval layer consumes: perspective
//! based segment visibility, local pending ops, ack application, reference
//! registration and the slide protocol, and the reconnection position
//! queries rebase needs. Where a production sequence would keep segments in
//! a b-tree, this keeps a flat ordered `Vec` and walks it; only the
//! semantics matter here.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smartstring::alias::String as SmartString;
use tracing::trace;

use crate::events::Listeners;
use crate::sequence::reference::{LocalReference, ReferenceType, SlidingPreference};
use crate::sequence::segment::{Perspective, Segment};
use crate::{LocalSeq, Seq, DETACHED_POSITION, UNASSIGNED_SEQ};

/// A text operation, in visible-position coordinates of the submitting
/// client's view at submission time.
#[derive(Debug, Clone)]
pub enum TextOp {
    Insert { pos: usize, text: SmartString },
    Remove { start: usize, end: usize },
}

/// A locally submitted text op, ready for the sequencer.
#[derive(Debug, Clone)]
pub struct PendingTextOp {
    pub op: TextOp,
    pub client_id: SmartString,
    pub ref_seq: Seq,
    pub local_seq: LocalSeq,
}

/// A text op stamped by the sequencer. Delivered to every client, the
/// submitter included (which treats it as the ack).
#[derive(Debug, Clone)]
pub struct SequencedTextOp {
    pub op: TextOp,
    pub client_id: SmartString,
    pub ref_seq: Seq,
    pub seq: Seq,
    pub local_seq: LocalSeq,
}

/// The mutable per-client counter local ops draw their sequence numbers
/// from. Shared between text ops and interval ops.
#[derive(Debug, Default)]
pub struct CollabWindow {
    local_seq: Cell<LocalSeq>,
}

impl CollabWindow {
    pub fn local_seq(&self) -> LocalSeq {
        self.local_seq.get()
    }

    pub fn next_local_seq(&self) -> LocalSeq {
        let next = self.local_seq.get() + 1;
        self.local_seq.set(next);
        next
    }
}

struct ClientInner {
    client_id: SmartString,
    /// All segments in document order, tombstones included.
    segments: RefCell<Vec<Rc<Segment>>>,
    current_seq: Cell<Seq>,
    collab_window: CollabWindow,
    normalize_listeners: Listeners<()>,
}

/// Cheap-to-clone handle to a client's sequence state.
#[derive(Clone)]
pub struct SequenceClient {
    inner: Rc<ClientInner>,
}

impl std::fmt::Debug for SequenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceClient")
            .field("client_id", &self.inner.client_id)
            .field("len", &self.visible_length())
            .finish()
    }
}

impl SequenceClient {
    pub fn new(client_id: impl Into<SmartString>) -> Self {
        SequenceClient {
            inner: Rc::new(ClientInner {
                client_id: client_id.into(),
                segments: RefCell::new(Vec::new()),
                current_seq: Cell::new(0),
                collab_window: CollabWindow::default(),
                normalize_listeners: Listeners::new(),
            }),
        }
    }

    pub fn get_long_client_id(&self) -> SmartString {
        self.inner.client_id.clone()
    }

    pub fn get_current_seq(&self) -> Seq {
        self.inner.current_seq.get()
    }

    pub fn get_collab_window(&self) -> &CollabWindow {
        &self.inner.collab_window
    }

    pub fn same_client(&self, other: &SequenceClient) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn visible_length(&self) -> usize {
        self.inner
            .segments
            .borrow()
            .iter()
            .filter(|s| s.is_visible_locally())
            .map(|s| s.len())
            .sum()
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for seg in self.inner.segments.borrow().iter() {
            if seg.is_visible_locally() {
                out.push_str(&seg.text.borrow());
            }
        }
        out
    }

    fn renumber_ordinals(&self) {
        for (i, seg) in self.inner.segments.borrow().iter().enumerate() {
            seg.ordinal.set(i as u64);
        }
    }

    fn index_of(&self, segment: &Rc<Segment>) -> Option<usize> {
        self.inner
            .segments
            .borrow()
            .iter()
            .position(|s| Rc::ptr_eq(s, segment))
    }

    /// Find the vec index at which an insert at visible position `pos`
    /// lands, splitting a straddling segment if needed.
    ///
    /// `perspective` is `None` for local inserts. For remote inserts, at an
    /// exact boundary the new segment passes over this client's pending
    /// segments (their eventual sequence numbers are higher than the
    /// incoming op's, and later inserts at one position sort leftward), and
    /// stops before everything else, tombstones included.
    fn find_insert_index(&self, pos: usize, perspective: Option<&Perspective>) -> usize {
        let mut acc = 0usize;
        let mut i = 0usize;
        loop {
            let seg = {
                let segments = self.inner.segments.borrow();
                match segments.get(i) {
                    Some(seg) => seg.clone(),
                    None => {
                        assert_eq!(acc, pos, "Internal consistency error: insert past end");
                        return i;
                    }
                }
            };
            let visible = match perspective {
                Some(p) => seg.visible_to(p),
                None => seg.is_visible_locally(),
            };
            if visible {
                let len = seg.len();
                if acc + len > pos {
                    if pos == acc {
                        return i;
                    }
                    self.split_segment_at(i, pos - acc);
                    return i + 1;
                }
                acc += len;
                i += 1;
            } else if acc < pos {
                i += 1;
            } else if perspective.is_some() && seg.seq.get() == UNASSIGNED_SEQ {
                // Boundary: concurrent pending-local insert; pass it.
                i += 1;
            } else {
                return i;
            }
        }
    }

    fn split_segment_at(&self, index: usize, at: usize) {
        let tail = {
            let segments = self.inner.segments.borrow();
            segments[index].split(at)
        };
        self.inner.segments.borrow_mut().insert(index + 1, tail);
    }

    /// Split segments so that visible positions `start` and `end` (under
    /// `perspective`, or the local view) fall on segment boundaries, and
    /// return the segments wholly inside `[start, end)` that are visible.
    fn segments_in_range(
        &self,
        start: usize,
        end: usize,
        perspective: Option<&Perspective>,
    ) -> Vec<Rc<Segment>> {
        let mut result = Vec::new();
        let mut acc = 0usize;
        let mut i = 0usize;
        loop {
            let seg = {
                let segments = self.inner.segments.borrow();
                match segments.get(i) {
                    Some(seg) => seg.clone(),
                    None => break,
                }
            };
            let visible = match perspective {
                Some(p) => seg.visible_to(p),
                None => seg.is_visible_locally(),
            };
            if !visible {
                i += 1;
                continue;
            }
            let len = seg.len();
            if acc >= end {
                break;
            }
            if acc + len <= start {
                acc += len;
                i += 1;
                continue;
            }
            // Overlapping. Trim the head, then the tail.
            if acc < start {
                self.split_segment_at(i, start - acc);
                acc += start - acc;
                i += 1;
                continue;
            }
            if acc + len > end {
                self.split_segment_at(i, end - acc);
                // The head part (now at i) is fully inside.
            }
            let seg = self.inner.segments.borrow()[i].clone();
            acc += seg.len();
            result.push(seg);
            i += 1;
        }
        result
    }

    // ------------------------------------------------------------------
    // Local ops
    // ------------------------------------------------------------------

    pub fn insert_local(&self, pos: usize, text: impl Into<SmartString>) -> PendingTextOp {
        let text: SmartString = text.into();
        assert!(!text.is_empty(), "cannot insert empty text");
        assert!(pos <= self.visible_length(), "insert position out of range");

        let local_seq = self.inner.collab_window.next_local_seq();
        let index = self.find_insert_index(pos, None);
        let segment = Segment::new(text.clone(), self.inner.client_id.clone());
        segment.local_seq.set(Some(local_seq));
        self.inner.segments.borrow_mut().insert(index, segment);
        self.renumber_ordinals();

        trace!(client = %self.inner.client_id, pos, local_seq, "local insert");
        PendingTextOp {
            op: TextOp::Insert { pos, text },
            client_id: self.inner.client_id.clone(),
            ref_seq: self.get_current_seq(),
            local_seq,
        }
    }

    pub fn remove_local(&self, start: usize, end: usize) -> PendingTextOp {
        assert!(start < end && end <= self.visible_length(), "remove range out of range");

        let local_seq = self.inner.collab_window.next_local_seq();
        for seg in self.segments_in_range(start, end, None) {
            seg.local_removed_seq.set(Some(local_seq));
        }
        self.renumber_ordinals();

        trace!(client = %self.inner.client_id, start, end, local_seq, "local remove");
        PendingTextOp {
            op: TextOp::Remove { start, end },
            client_id: self.inner.client_id.clone(),
            ref_seq: self.get_current_seq(),
            local_seq,
        }
    }

    // ------------------------------------------------------------------
    // Sequenced op application (own acks and remote ops)
    // ------------------------------------------------------------------

    pub fn apply(&self, msg: &SequencedTextOp) {
        if msg.client_id == self.inner.client_id {
            self.ack_own(msg);
        } else {
            self.apply_remote(msg);
        }
        self.inner.current_seq.set(msg.seq);
    }

    /// Ops outside the sequence (interval ops) consume sequence numbers
    /// too; the host advances the acknowledged seq after processing one.
    pub fn advance_current_seq(&self, seq: Seq) {
        debug_assert!(seq >= self.inner.current_seq.get());
        self.inner.current_seq.set(seq);
    }

    fn ack_own(&self, msg: &SequencedTextOp) {
        match &msg.op {
            TextOp::Insert { .. } => {
                for seg in self.inner.segments.borrow().iter() {
                    if seg.local_seq.get() == Some(msg.local_seq)
                        && seg.seq.get() == UNASSIGNED_SEQ
                    {
                        seg.seq.set(msg.seq);
                    }
                }
            }
            TextOp::Remove { .. } => {
                let mut removed = Vec::new();
                for seg in self.inner.segments.borrow().iter() {
                    if seg.local_removed_seq.get() == Some(msg.local_seq)
                        && seg.removed_seq.get().is_none()
                    {
                        seg.removed_seq.set(Some(msg.seq));
                        *seg.removed_client.borrow_mut() = Some(self.inner.client_id.clone());
                        removed.push(seg.clone());
                    }
                }
                self.slide_references_off(&removed);
            }
        }
    }

    fn apply_remote(&self, msg: &SequencedTextOp) {
        let perspective = Perspective {
            ref_seq: msg.ref_seq,
            client_id: msg.client_id.clone(),
            local_seq: None,
        };
        match &msg.op {
            TextOp::Insert { pos, text } => {
                let index = self.find_insert_index(*pos, Some(&perspective));
                let segment = Segment::new(text.clone(), msg.client_id.clone());
                segment.seq.set(msg.seq);
                self.inner.segments.borrow_mut().insert(index, segment);
                self.renumber_ordinals();
            }
            TextOp::Remove { start, end } => {
                let mut removed = Vec::new();
                for seg in self.segments_in_range(*start, *end, Some(&perspective)) {
                    if seg.removed_seq.get().is_none() {
                        seg.removed_seq.set(Some(msg.seq));
                        *seg.removed_client.borrow_mut() = Some(msg.client_id.clone());
                        removed.push(seg);
                    }
                }
                self.renumber_ordinals();
                self.slide_references_off(&removed);
            }
        }
    }

    /// The slide protocol: move every SLIDE_ON_REMOVE reference off the
    /// given removed segments. All `beforeSlide` hooks fire, then all
    /// references move, then all `afterSlide` hooks fire, so that an
    /// interval whose endpoints both slide in one op sees a single burst.
    fn slide_references_off(&self, removed: &[Rc<Segment>]) {
        let mut sliding: Vec<LocalReference> = Vec::new();
        for seg in removed {
            for weak in seg.refs.borrow().iter() {
                if let Some(inner) = weak.upgrade() {
                    let reference = LocalReference { inner };
                    if reference.ref_type().contains(ReferenceType::SLIDE_ON_REMOVE) {
                        sliding.push(reference);
                    }
                }
            }
        }
        if sliding.is_empty() {
            return;
        }
        trace!(count = sliding.len(), "sliding references off removed segments");

        for reference in &sliding {
            reference.fire_before_slide();
        }
        for reference in &sliding {
            let target = reference.segment().and_then(|seg| {
                self.get_slide_to_segment(&seg, reference.offset(), reference.sliding_preference())
            });
            reference.move_to(target);
        }
        for reference in &sliding {
            reference.fire_after_slide();
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The segment and in-segment offset containing visible position `pos`,
    /// under `perspective` (or the local view). `local_seq` bounds the walk
    /// to this client's pending ops at or before that op.
    pub fn get_containing_segment(
        &self,
        pos: usize,
        perspective: Option<&Perspective>,
        local_seq: Option<LocalSeq>,
    ) -> Option<(Rc<Segment>, usize)> {
        let adjusted = perspective.map(|p| Perspective {
            ref_seq: p.ref_seq,
            client_id: p.client_id.clone(),
            local_seq: local_seq.or(p.local_seq),
        });
        let mut acc = 0usize;
        for seg in self.inner.segments.borrow().iter() {
            let visible = match &adjusted {
                Some(p) => seg.visible_to(p),
                None => seg.is_visible_locally(),
            };
            if !visible {
                continue;
            }
            let len = seg.len();
            if acc + len > pos {
                return Some((seg.clone(), pos - acc));
            }
            acc += len;
        }
        None
    }

    /// Where a reference on `segment` should slide: the segment itself if
    /// its removal has not been acknowledged, else the nearest valid
    /// segment in the preferred direction, then the other direction, else
    /// `None` (detached).
    ///
    /// Only acknowledged segments are valid targets. Slides run while a
    /// sequenced op is applied, when every client's acknowledged state is
    /// identical; a pending local segment would give each site a different
    /// destination.
    pub fn get_slide_to_segment(
        &self,
        segment: &Rc<Segment>,
        offset: usize,
        preference: SlidingPreference,
    ) -> Option<(Rc<Segment>, usize)> {
        if segment.removed_seq.get().is_none() {
            return Some((segment.clone(), offset));
        }
        let index = self
            .index_of(segment)
            .unwrap_or_else(|| panic!("Internal consistency error: segment not in sequence"));
        let segments = self.inner.segments.borrow();
        let valid_target =
            |s: &&Rc<Segment>| s.seq.get() != UNASSIGNED_SEQ && s.removed_seq.get().is_none();

        let forward = || {
            segments[index + 1..]
                .iter()
                .find(valid_target)
                .map(|s| (s.clone(), 0))
        };
        let backward = || {
            segments[..index]
                .iter()
                .rev()
                .find(valid_target)
                .map(|s| (s.clone(), s.len().saturating_sub(1)))
        };

        match preference {
            SlidingPreference::Forward => forward().or_else(backward),
            SlidingPreference::Backward => backward().or_else(forward),
        }
    }

    /// The position `segment` will occupy when a pending op with sequence
    /// number `local_seq` is resubmitted: every acknowledged segment plus
    /// this client's pending ops submitted strictly before it.
    pub fn find_reconnection_position(&self, segment: &Rc<Segment>, local_seq: LocalSeq) -> usize {
        let mut acc = 0usize;
        for seg in self.inner.segments.borrow().iter() {
            if Rc::ptr_eq(seg, segment) {
                return acc;
            }
            let inserted = seg.seq.get() != UNASSIGNED_SEQ
                || seg.local_seq.get().is_some_and(|ls| ls < local_seq);
            let removed = seg.removed_seq.get().is_some()
                || seg.local_removed_seq.get().is_some_and(|ls| ls < local_seq);
            if inserted && !removed {
                acc += seg.len();
            }
        }
        panic!("Internal consistency error: segment not in sequence");
    }

    /// Resolve a reference to its current numeric position in this client's
    /// view. Detached references resolve to [`DETACHED_POSITION`]; a
    /// reference on an invisible segment resolves to the position the
    /// removed text occupied.
    pub fn resolve(&self, reference: &LocalReference) -> i64 {
        let Some(segment) = reference.segment() else {
            return DETACHED_POSITION;
        };
        let mut acc = 0usize;
        for seg in self.inner.segments.borrow().iter() {
            if Rc::ptr_eq(seg, &segment) {
                if seg.is_visible_locally() {
                    return (acc + reference.offset()) as i64;
                }
                return acc as i64;
            }
            if seg.is_visible_locally() {
                acc += seg.len();
            }
        }
        panic!("Internal consistency error: reference segment not in sequence");
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    pub fn create_local_reference_position(
        &self,
        segment: &Rc<Segment>,
        offset: usize,
        ref_type: ReferenceType,
        sliding: SlidingPreference,
    ) -> LocalReference {
        debug_assert!(offset < segment.len(), "reference offset out of range");
        LocalReference::new_live(segment, offset, ref_type, sliding)
    }

    pub fn remove_local_reference_position(&self, reference: &LocalReference) {
        if let Some(segment) = reference.segment() {
            segment.unregister_ref(&reference.inner);
        }
    }

    pub fn create_detached_local_reference_position(
        &self,
        ref_type: ReferenceType,
        sliding: SlidingPreference,
    ) -> LocalReference {
        LocalReference::new_detached(ref_type, sliding)
    }

    // ------------------------------------------------------------------
    // Normalize
    // ------------------------------------------------------------------

    /// Register a callback fired when pending ops are about to be rebased
    /// (reconnect).
    pub fn on_normalize(&self, listener: impl FnMut(&()) + 'static) {
        self.inner.normalize_listeners.on(listener);
    }

    /// Announce that pending ops are being rebased against current state.
    /// The host calls this on reconnect before resubmitting pending ops.
    pub fn normalize(&self) {
        self.inner.normalize_listeners.emit(&());
    }

    /// Perspective of one of this client's own pending ops, for rebase.
    pub fn local_perspective(&self, ref_seq: Seq, local_seq: LocalSeq) -> Perspective {
        Perspective {
            ref_seq,
            client_id: self.inner.client_id.clone(),
            local_seq: Some(local_seq),
        }
    }

}
