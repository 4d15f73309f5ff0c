//! Local references: anchors into the sequence that survive segment splits
//! and removals.
//!
//! A reference names a (segment, offset) pair plus flags describing what it
//! anchors (a range begin/end, a nest begin/end) and how it behaves when its
//! segment is removed: `SLIDE_ON_REMOVE` references move to the nearest
//! surviving segment in their preferred direction, `STAY_ON_REMOVE`
//! references stay put until promoted on acknowledgement.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;

use crate::properties::PropertySet;
use crate::sequence::segment::Segment;

/// Bitmask describing what a reference anchors and its removal behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferenceType(pub u16);

impl ReferenceType {
    pub const SIMPLE: Self = Self(0);
    pub const NEST_BEGIN: Self = Self(0x2);
    pub const NEST_END: Self = Self(0x4);
    pub const RANGE_BEGIN: Self = Self(0x10);
    pub const RANGE_END: Self = Self(0x20);
    pub const SLIDE_ON_REMOVE: Self = Self(0x40);
    pub const STAY_ON_REMOVE: Self = Self(0x80);
    pub const TRANSIENT: Self = Self(0x100);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for ReferenceType {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Which direction a reference moves when its segment is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlidingPreference {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
pub(crate) enum Anchor {
    Live(Rc<Segment>),
    Detached,
}

#[derive(Default)]
pub(crate) struct SlideHooks {
    pub(crate) before: Option<Rc<dyn Fn(&LocalReference)>>,
    pub(crate) after: Option<Rc<dyn Fn(&LocalReference)>>,
}

pub(crate) struct RefInner {
    pub(crate) anchor: RefCell<Anchor>,
    pub(crate) offset: Cell<usize>,
    pub(crate) ref_type: Cell<ReferenceType>,
    pub(crate) sliding: Cell<SlidingPreference>,
    pub(crate) properties: RefCell<PropertySet>,
    pub(crate) hooks: RefCell<SlideHooks>,
}

impl RefInner {
    /// Point this reference at a different segment without touching
    /// registration lists. Used by [`Segment::split`].
    pub(crate) fn rebind_segment(&self, segment: &Rc<Segment>) {
        *self.anchor.borrow_mut() = Anchor::Live(segment.clone());
    }
}

impl std::fmt::Debug for RefInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefInner")
            .field("offset", &self.offset.get())
            .field("ref_type", &self.ref_type.get())
            .field("detached", &matches!(*self.anchor.borrow(), Anchor::Detached))
            .finish()
    }
}

/// A shared handle to a position reference. Cloning shares the anchor.
#[derive(Debug, Clone)]
pub struct LocalReference {
    pub(crate) inner: Rc<RefInner>,
}

impl LocalReference {
    pub(crate) fn new_live(
        segment: &Rc<Segment>,
        offset: usize,
        ref_type: ReferenceType,
        sliding: SlidingPreference,
    ) -> Self {
        let inner = Rc::new(RefInner {
            anchor: RefCell::new(Anchor::Live(segment.clone())),
            offset: Cell::new(offset),
            ref_type: Cell::new(ref_type),
            sliding: Cell::new(sliding),
            properties: RefCell::new(PropertySet::new()),
            hooks: RefCell::new(SlideHooks::default()),
        });
        if !ref_type.contains(ReferenceType::TRANSIENT) {
            segment.register_ref(&inner);
        }
        LocalReference { inner }
    }

    pub(crate) fn new_detached(ref_type: ReferenceType, sliding: SlidingPreference) -> Self {
        LocalReference {
            inner: Rc::new(RefInner {
                anchor: RefCell::new(Anchor::Detached),
                offset: Cell::new(0),
                ref_type: Cell::new(ref_type),
                sliding: Cell::new(sliding),
                properties: RefCell::new(PropertySet::new()),
                hooks: RefCell::new(SlideHooks::default()),
            }),
        }
    }

    pub fn ref_type(&self) -> ReferenceType {
        self.inner.ref_type.get()
    }

    pub fn set_ref_type(&self, ref_type: ReferenceType) {
        debug_assert!(
            !(ref_type.contains(ReferenceType::SLIDE_ON_REMOVE)
                && ref_type.contains(ReferenceType::STAY_ON_REMOVE)),
            "SLIDE_ON_REMOVE and STAY_ON_REMOVE are mutually exclusive"
        );
        self.inner.ref_type.set(ref_type);
    }

    pub fn sliding_preference(&self) -> SlidingPreference {
        self.inner.sliding.get()
    }

    pub fn is_detached(&self) -> bool {
        matches!(*self.inner.anchor.borrow(), Anchor::Detached)
    }

    pub fn segment(&self) -> Option<Rc<Segment>> {
        match &*self.inner.anchor.borrow() {
            Anchor::Live(segment) => Some(segment.clone()),
            Anchor::Detached => None,
        }
    }

    pub fn offset(&self) -> usize {
        self.inner.offset.get()
    }

    pub fn properties(&self) -> std::cell::Ref<'_, PropertySet> {
        self.inner.properties.borrow()
    }

    pub fn properties_mut(&self) -> std::cell::RefMut<'_, PropertySet> {
        self.inner.properties.borrow_mut()
    }

    pub fn same_reference(&self, other: &LocalReference) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable total order over references: detached references precede all
    /// live ones; live references order by segment ordinal, then offset.
    pub fn compare(&self, other: &LocalReference) -> Ordering {
        match (self.segment(), other.segment()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a
                .ordinal
                .get()
                .cmp(&b.ordinal.get())
                .then_with(|| self.offset().cmp(&other.offset())),
        }
    }

    pub fn min<'a>(a: &'a LocalReference, b: &'a LocalReference) -> &'a LocalReference {
        if a.compare(b) == Ordering::Greater {
            b
        } else {
            a
        }
    }

    pub fn max<'a>(a: &'a LocalReference, b: &'a LocalReference) -> &'a LocalReference {
        if a.compare(b) == Ordering::Less {
            b
        } else {
            a
        }
    }

    pub(crate) fn set_slide_hooks(
        &self,
        before: Rc<dyn Fn(&LocalReference)>,
        after: Rc<dyn Fn(&LocalReference)>,
    ) {
        *self.inner.hooks.borrow_mut() = SlideHooks {
            before: Some(before),
            after: Some(after),
        };
    }

    pub(crate) fn clear_slide_hooks(&self) {
        *self.inner.hooks.borrow_mut() = SlideHooks::default();
    }

    pub(crate) fn fire_before_slide(&self) {
        let hook = self.inner.hooks.borrow().before.clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    pub(crate) fn fire_after_slide(&self) {
        let hook = self.inner.hooks.borrow().after.clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Move this reference to a new anchor, maintaining segment
    /// registration. Does not fire slide hooks; callers orchestrate those.
    pub(crate) fn move_to(&self, target: Option<(Rc<Segment>, usize)>) {
        if let Some(old) = self.segment() {
            if !self.ref_type().contains(ReferenceType::TRANSIENT) {
                old.unregister_ref(&self.inner);
            }
        }
        match target {
            Some((segment, offset)) => {
                self.inner.offset.set(offset);
                *self.inner.anchor.borrow_mut() = Anchor::Live(segment.clone());
                if !self.ref_type().contains(ReferenceType::TRANSIENT) {
                    segment.register_ref(&self.inner);
                }
            }
            None => {
                self.inner.offset.set(0);
                *self.inner.anchor.borrow_mut() = Anchor::Detached;
            }
        }
    }

    /// A transient clone sharing the same segment and offset, used to
    /// snapshot an endpoint's position before a slide.
    pub(crate) fn clone_transient(&self) -> LocalReference {
        let ref_type = self
            .ref_type()
            .without(ReferenceType::SLIDE_ON_REMOVE)
            .without(ReferenceType::STAY_ON_REMOVE)
            .with(ReferenceType::TRANSIENT);
        match self.segment() {
            Some(segment) => {
                LocalReference::new_live(&segment, self.offset(), ref_type, self.sliding_preference())
            }
            None => LocalReference::new_detached(ref_type, self.sliding_preference()),
        }
    }

    /// Temporarily retype as transient (for event emission on snapshots);
    /// returns the previous type so the caller can restore it.
    pub(crate) fn retype_transient(&self) -> ReferenceType {
        let previous = self.ref_type();
        self.inner
            .ref_type
            .set(previous.with(ReferenceType::TRANSIENT));
        previous
    }

    pub(crate) fn restore_type(&self, ref_type: ReferenceType) {
        self.inner.ref_type.set(ref_type);
    }
}
