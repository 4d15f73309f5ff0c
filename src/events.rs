//! An explicit observer registry per event name.
//!
//! Listeners are invoked synchronously in registration order. Errors
//! (panics) from listeners propagate to the caller unchanged; nothing here
//! catches them.

use std::cell::RefCell;
use std::rc::Rc;

type Listener<A> = Rc<RefCell<dyn FnMut(&A)>>;

/// Opaque handle returned by [`Listeners::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

pub struct Listeners<A> {
    inner: RefCell<Vec<(ListenerToken, Listener<A>)>>,
    next_token: std::cell::Cell<u64>,
}

impl<A> Default for Listeners<A> {
    fn default() -> Self {
        Self {
            inner: RefCell::new(Vec::new()),
            next_token: std::cell::Cell::new(0),
        }
    }
}

impl<A> Listeners<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, listener: impl FnMut(&A) + 'static) -> ListenerToken {
        let token = ListenerToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.inner
            .borrow_mut()
            .push((token, Rc::new(RefCell::new(listener))));
        token
    }

    pub fn off(&self, token: ListenerToken) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.len();
        inner.retain(|(t, _)| *t != token);
        inner.len() != before
    }

    pub fn emit(&self, args: &A) {
        // Snapshot so a listener registering or unregistering listeners
        // doesn't invalidate the iteration.
        let snapshot: Vec<Listener<A>> =
            self.inner.borrow().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            (listener.borrow_mut())(args);
        }
    }
}

impl<A> std::fmt::Debug for Listeners<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.inner.borrow().len())
            .finish()
    }
}
