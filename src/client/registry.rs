//! Topic registry and lifecycle listener sets.
//!
//! Both structures hand out a [`Subscription`] guard per registered callback. Dropping the
//! guard removes exactly that callback; [`Subscription::detach`] keeps it registered for
//! the owner's lifetime instead.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use dashmap::{DashMap, Entry};

use crate::types::Frame;

/// Callback invoked for every frame of a subscribed type.
pub type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Keeps a callback registered until dropped.
#[must_use = "dropping a Subscription unregisters its callback immediately"]
pub struct Subscription {
    id: HandlerId,
    remove: Option<Box<dyn FnOnce() -> bool + Send>>,
}

impl Subscription {
    fn new<F>(id: HandlerId, remove: F) -> Self
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        Self {
            id,
            remove: Some(Box::new(remove)),
        }
    }

    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the callback now. Returns `false` if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.remove.take().is_some_and(|remove| remove())
    }

    /// Keep the callback registered for as long as its registry lives.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.remove.is_some())
            .finish()
    }
}

/// Map from frame type to the handlers interested in it.
#[derive(Default)]
pub struct TopicRegistry {
    topics: DashMap<String, Vec<(HandlerId, Handler)>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for frames whose `type` equals `msg_type`.
    pub fn subscribe<T, F>(self: &Arc<Self>, msg_type: T, handler: F) -> Subscription
    where
        T: Into<String>,
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let msg_type = msg_type.into();
        let id = HandlerId::next();

        self.topics
            .entry(msg_type.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        #[cfg(feature = "tracing")]
        tracing::debug!(%msg_type, handler = %id, "registered frame handler");

        let registry = Arc::downgrade(self);
        Subscription::new(id, move || remove_handler(&registry, &msg_type, id))
    }

    /// Remove one handler. The topic entry is dropped with its last handler.
    pub fn unsubscribe(&self, msg_type: &str, id: HandlerId) -> bool {
        let Entry::Occupied(mut entry) = self.topics.entry(msg_type.to_owned()) else {
            return false;
        };

        let handlers = entry.get_mut();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() < before;

        if handlers.is_empty() {
            entry.remove();
        }

        #[cfg(feature = "tracing")]
        if removed {
            tracing::debug!(%msg_type, handler = %id, "removed frame handler");
        }

        removed
    }

    /// Invoke every handler registered for the frame's type, in registration order.
    ///
    /// The handler set is copied before the first call, so handlers may subscribe or
    /// unsubscribe; such changes apply from the next frame. A panicking handler is
    /// logged and does not prevent the remaining handlers from running.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let handlers: Vec<Handler> = match self.topics.get(frame.frame_type()) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };

        for handler in &handlers {
            invoke_isolated(|| handler(frame), frame.frame_type());
        }

        handlers.len()
    }

    /// Number of types with at least one handler.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    #[must_use]
    pub fn handler_count(&self, msg_type: &str) -> usize {
        self.topics.get(msg_type).map_or(0, |handlers| handlers.len())
    }
}

fn remove_handler(registry: &Weak<TopicRegistry>, msg_type: &str, id: HandlerId) -> bool {
    registry
        .upgrade()
        .is_some_and(|registry| registry.unsubscribe(msg_type, id))
}

/// A multi-listener slot for one lifecycle event.
pub struct ListenerSet<E: ?Sized> {
    listeners: RwLock<Vec<(HandlerId, Listener<E>)>>,
}

impl<E: ?Sized> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E: ?Sized + 'static> ListenerSet<E> {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let set = Arc::downgrade(self);
        Subscription::new(id, move || set.upgrade().is_some_and(|set| set.remove(id)))
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() < before
    }

    /// Call every listener with `event`. Returns how many were called.
    pub fn emit(&self, event: &E) -> usize {
        // The lock is released before calling out so listeners can add or remove others.
        let listeners: Vec<Listener<E>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in &listeners {
            invoke_isolated(|| listener(event), "lifecycle");
        }

        listeners.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn invoke_isolated<F: FnOnce()>(call: F, context: &str) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        #[cfg(feature = "tracing")]
        tracing::error!(%context, "callback panicked, continuing with remaining callbacks");
        #[cfg(not(feature = "tracing"))]
        let _ = context;
    }
}
