//! Outbound change-event stream for presentation collaborators.
//!
//! Handlers run synchronously in subscription order. The bus is a cheap
//! clonable handle, so a handler may hold a clone and unsubscribe or clear
//! the bus while an event is being dispatched.

use std::cell::RefCell;
use std::rc::Rc;

use crate::chain::ChangeEvent;

/// Identifies one subscription for [`EventBus::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&ChangeEvent)>;

struct HandlerInfo {
    id: SubscriptionId,
    /// Taken out while the handler runs so it can re-enter the bus
    handler: Option<Handler>,
    events_processed: usize,
}

#[derive(Default)]
struct Inner {
    handlers: Vec<HandlerInfo>,
    next_id: u64,
    /// Bumped by `clear`; a dispatch stops once it observes a change
    generation: u64,
    closed: bool,
    events_dispatched: usize,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. After [`EventBus::close`] the handler is dropped unseen.
    pub fn subscribe(&self, handler: impl FnMut(&ChangeEvent) + 'static) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        if inner.closed {
            log::debug!("ignoring subscription {id:?} on a closed event bus");
            return id;
        }
        inner.handlers.push(HandlerInfo {
            id,
            handler: Some(Box::new(handler)),
            events_processed: 0,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.handlers.len();
        inner.handlers.retain(|info| info.id != id);
        inner.handlers.len() != before
    }

    /// Remove every subscriber. Safe to call from inside a handler.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.handlers.clear();
        inner.generation += 1;
    }

    /// Clear and refuse all later subscriptions
    pub fn close(&self) {
        self.clear();
        self.inner.borrow_mut().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().handlers.len()
    }

    pub fn events_dispatched(&self) -> usize {
        self.inner.borrow().events_dispatched
    }

    /// Events delivered to one subscriber, `None` once it is gone
    pub fn events_processed(&self, id: SubscriptionId) -> Option<usize> {
        self.inner
            .borrow()
            .handlers
            .iter()
            .find(|info| info.id == id)
            .map(|info| info.events_processed)
    }

    /// Deliver `event` to every handler subscribed before this call
    pub fn emit(&self, event: &ChangeEvent) {
        let (targets, generation) = {
            let mut inner = self.inner.borrow_mut();
            inner.events_dispatched += 1;
            let targets: Vec<SubscriptionId> = inner.handlers.iter().map(|info| info.id).collect();
            (targets, inner.generation)
        };

        for id in targets {
            let handler = {
                let mut inner = self.inner.borrow_mut();
                if inner.generation != generation {
                    break;
                }
                inner
                    .handlers
                    .iter_mut()
                    .find(|info| info.id == id)
                    .and_then(|info| info.handler.take())
            };
            let Some(mut handler) = handler else {
                continue;
            };

            handler(event);

            let mut inner = self.inner.borrow_mut();
            if let Some(info) = inner.handlers.iter_mut().find(|info| info.id == id) {
                info.handler = Some(handler);
                info.events_processed += 1;
            }
        }
    }
}
