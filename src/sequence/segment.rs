//! Segments: the units of the sequence. Each insert creates one; edits
//! split them; removals tombstone them in place.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

use crate::sequence::reference::RefInner;
use crate::{LocalSeq, Seq, UNASSIGNED_SEQ};

/// The view a sequenced op has of the document: everything acknowledged at
/// `ref_seq`, plus everything the op's own client had already done.
///
/// `local_seq` bounds the walk to this client's pending ops submitted at or
/// before a given local sequence number. It is only set when recomputing a
/// pending op's positions during reconnect rebase.
#[derive(Debug, Clone)]
pub struct Perspective {
    pub ref_seq: Seq,
    pub client_id: SmartString,
    pub local_seq: Option<LocalSeq>,
}

#[derive(Debug)]
pub struct Segment {
    pub(crate) text: RefCell<SmartString>,

    /// Position in the total segment order. Maintained by the client;
    /// renumbered after every structural change. Only relative order is
    /// meaningful.
    pub(crate) ordinal: Cell<u64>,

    /// The client that inserted this segment.
    pub(crate) client_id: SmartString,

    /// Server sequence number of the insert; [`UNASSIGNED_SEQ`] while the
    /// insert is pending locally.
    pub(crate) seq: Cell<Seq>,

    /// Local sequence number of the insert, if this client inserted it.
    /// Kept after ack: rebase perspectives need to know which pending ops
    /// an earlier local op could see.
    pub(crate) local_seq: Cell<Option<LocalSeq>>,

    pub(crate) removed_seq: Cell<Option<Seq>>,
    pub(crate) removed_client: RefCell<Option<SmartString>>,
    /// Local sequence number of a pending (or since-acked) local removal.
    pub(crate) local_removed_seq: Cell<Option<LocalSeq>>,

    /// References anchored to this segment. Weak: references are owned by
    /// the intervals holding them.
    pub(crate) refs: RefCell<SmallVec<[Weak<RefInner>; 2]>>,
}

impl Segment {
    pub(crate) fn new(text: SmartString, client_id: SmartString) -> Rc<Self> {
        Rc::new(Segment {
            text: RefCell::new(text),
            ordinal: Cell::new(0),
            client_id,
            seq: Cell::new(UNASSIGNED_SEQ),
            local_seq: Cell::new(None),
            removed_seq: Cell::new(None),
            removed_client: RefCell::new(None),
            local_removed_seq: Cell::new(None),
            refs: RefCell::new(SmallVec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.text.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible in this client's current view: neither removed nor pending
    /// local removal.
    pub fn is_visible_locally(&self) -> bool {
        self.removed_seq.get().is_none() && self.local_removed_seq.get().is_none()
    }

    /// Whether the insert of this segment is within `p`'s view.
    fn insert_visible_to(&self, p: &Perspective) -> bool {
        let seq = self.seq.get();
        if seq != UNASSIGNED_SEQ && seq <= p.ref_seq {
            return true;
        }
        if self.client_id != p.client_id {
            return false;
        }
        // The op's own client always sees its own inserts, except when a
        // local-seq bound restricts the walk to earlier pending ops.
        match (p.local_seq, self.local_seq.get()) {
            (Some(bound), Some(local_seq)) => local_seq <= bound,
            _ => true,
        }
    }

    /// Whether a removal of this segment is within `p`'s view.
    fn remove_visible_to(&self, p: &Perspective) -> bool {
        if let Some(removed_seq) = self.removed_seq.get() {
            if removed_seq <= p.ref_seq {
                return true;
            }
            if p.local_seq.is_none()
                && self.removed_client.borrow().as_deref() == Some(p.client_id.as_str())
            {
                return true;
            }
        }
        // A local-seq bound means `p` is one of our own pending ops; it saw
        // whatever we had locally removed by then, acked since or not.
        if let (Some(bound), Some(local_removed)) = (p.local_seq, self.local_removed_seq.get()) {
            if local_removed <= bound {
                return true;
            }
        }
        false
    }

    /// A segment contributes length to `p`'s view iff its insert is visible
    /// and no removal is.
    pub fn visible_to(&self, p: &Perspective) -> bool {
        self.insert_visible_to(p) && !self.remove_visible_to(p)
    }

    /// Split this segment at `at` (0 < at < len), returning the new tail
    /// segment. References anchored at or beyond the split point move to
    /// the tail. The caller owns inserting the tail into the segment order
    /// and renumbering ordinals.
    pub(crate) fn split(self: &Rc<Self>, at: usize) -> Rc<Segment> {
        debug_assert!(at > 0 && at < self.len(), "split point out of range");

        let tail_text: SmartString = {
            let mut text = self.text.borrow_mut();
            let tail = SmartString::from(&text.as_str()[at..]);
            text.truncate(at);
            tail
        };

        let tail = Rc::new(Segment {
            text: RefCell::new(tail_text),
            ordinal: Cell::new(self.ordinal.get()),
            client_id: self.client_id.clone(),
            seq: Cell::new(self.seq.get()),
            local_seq: Cell::new(self.local_seq.get()),
            removed_seq: Cell::new(self.removed_seq.get()),
            removed_client: RefCell::new(self.removed_client.borrow().clone()),
            local_removed_seq: Cell::new(self.local_removed_seq.get()),
            refs: RefCell::new(SmallVec::new()),
        });

        let mut keep: SmallVec<[Weak<RefInner>; 2]> = SmallVec::new();
        let mut moved: SmallVec<[Weak<RefInner>; 2]> = SmallVec::new();
        for weak in self.refs.borrow_mut().drain(..) {
            let Some(inner) = weak.upgrade() else { continue };
            if inner.offset.get() >= at {
                inner.offset.set(inner.offset.get() - at);
                inner.rebind_segment(&tail);
                moved.push(weak);
            } else {
                keep.push(weak);
            }
        }
        *self.refs.borrow_mut() = keep;
        *tail.refs.borrow_mut() = moved;

        tail
    }

    pub(crate) fn register_ref(&self, inner: &Rc<RefInner>) {
        self.refs.borrow_mut().push(Rc::downgrade(inner));
    }

    pub(crate) fn unregister_ref(&self, inner: &Rc<RefInner>) {
        self.refs
            .borrow_mut()
            .retain(|weak| weak.upgrade().is_some_and(|r| !Rc::ptr_eq(&r, inner)));
    }
}
