//! Observer lists dispatched over a snapshot.
//!
//! Handlers may connect, disconnect, or trigger further emissions while a
//! signal is being emitted. Emission walks a copy of the handler list taken
//! up front; a handler disconnected mid-emission is skipped.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Returned by [`Signal::connect`]; pass to [`Signal::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Rc<dyn Fn(&T)>;

pub struct Signal<T> {
    handlers: RefCell<Vec<(HandlerId, Handler<T>)>>,
    next_id: Cell<u64>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, handler: impl Fn(&T) + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push((id, Rc::new(handler)));
        id
    }

    /// Returns false if the handler was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn is_connected(&self, id: HandlerId) -> bool {
        self.handlers.borrow().iter().any(|(h, _)| *h == id)
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<(HandlerId, Handler<T>)> = self.handlers.borrow().clone();
        for (id, handler) in snapshot {
            if self.is_connected(id) {
                handler(value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("handlers", &self.len())
            .finish()
    }
}
