//! Typed publish/subscribe between subsystems
//!
//! Subsystems first register themselves with [`EventDispatcher::register_subscriber`], which hands
//! out a [`SubscriberIndex`], and then attach callbacks for the event types they care about.
//!
//! Dispatch is synchronous: every callback runs on the publishing thread before
//! [`EventDispatcher::dispatch`] returns. The callback list is copied out before any callback runs,
//! so callbacks are free to subscribe, dispatch further events, or call back into the registry.
//!
//! Worker threads that want something to happen on the main thread can [`EventDispatcher::queue`]
//! an event instead. Queued events are delivered in order by
//! [`EventDispatcher::process_queued_events`], which the frame scheduler calls once per frame.
//!
//! ## Callback bookkeeping
//! Every event type has a unique [`EventFlags`] bit. Whenever a subscriber's callback runs, the
//! bit is set in that subscriber's invoked mask, which lets other threads block until a given
//! subscriber has seen an event (see [`EventDispatcher::wait_for_event_callbacks`]).

use ahash::AHashMap;
use crossbeam::queue::SegQueue;
use log::*;
use parking_lot::{Condvar, Mutex};
use std::{
    any::{type_name, Any, TypeId},
    fmt,
    sync::Arc,
};
use thiserror::Error;

#[doc(inline)]
pub use types::*;
mod types;

/// A dispatchable event.
pub trait Event: Any + Send + Sync {
    /// Bit identifying this event type in invoked masks.
    const FLAG: EventFlags;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("subscriber {0:?} was never registered with this dispatcher")]
    UnregisteredSubscriber(SubscriberIndex),
}

/// Handle of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberIndex(usize);

impl SubscriberIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type QueuedEvent = Box<dyn FnOnce(&EventDispatcher) + Send>;

struct SubscriberInfo {
    type_id: TypeId,
    name: &'static str,
}

#[derive(Default)]
struct DispatcherState {
    subscribers: Vec<SubscriberInfo>,
    callbacks: AHashMap<TypeId, Vec<(SubscriberIndex, Callback)>>,
}

pub struct EventDispatcher {
    state: Mutex<DispatcherState>,
    invoked: Mutex<Vec<EventFlags>>,
    invoked_changed: Condvar,
    queued: SegQueue<QueuedEvent>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DispatcherState::default()),
            invoked: Mutex::new(Vec::new()),
            invoked_changed: Condvar::new(),
            queued: SegQueue::new(),
        }
    }

    /// Registers `S` as a subscriber. Registering the same type twice returns the original index.
    pub fn register_subscriber<S: Any>(&self) -> SubscriberIndex {
        let type_id = TypeId::of::<S>();
        let mut state = self.state.lock();

        if let Some(index) = state.subscribers.iter().position(|s| s.type_id == type_id) {
            warn!("Subscriber `{}` is already registered", type_name::<S>());
            return SubscriberIndex(index);
        }

        let index = SubscriberIndex(state.subscribers.len());
        state.subscribers.push(SubscriberInfo {
            type_id,
            name: type_name::<S>(),
        });
        self.invoked.lock().push(EventFlags::empty());
        debug!("Registered subscriber `{}` as {index:?}", type_name::<S>());
        index
    }

    /// Attaches a callback for events of type `E`.
    pub fn subscribe<E: Event>(
        &self,
        subscriber: SubscriberIndex,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> Result<(), EventError> {
        let mut state = self.state.lock();
        if subscriber.0 >= state.subscribers.len() {
            return Err(EventError::UnregisteredSubscriber(subscriber));
        }

        trace!(
            "`{}` subscribed to {}",
            state.subscribers[subscriber.0].name,
            type_name::<E>()
        );

        let callback: Callback = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        state
            .callbacks
            .entry(TypeId::of::<E>())
            .or_default()
            .push((subscriber, callback));
        Ok(())
    }

    /// Runs every callback subscribed to `E`, in subscription order, on the current thread.
    pub fn dispatch<E: Event>(&self, event: &E) {
        let count = self.fan_out(event);
        if count == 0 {
            warn!("Dispatched {} without any subscribers", type_name::<E>());
        } else {
            trace!("Dispatched {} to {count} callback(s)", type_name::<E>());
        }
    }

    /// Same as [`Self::dispatch`], minus the logging. Meant for per-frame events.
    pub fn dispatch_quiet<E: Event>(&self, event: &E) {
        self.fan_out(event);
    }

    /// Defers an event until the next [`Self::process_queued_events`] call. Can be called from
    /// any thread.
    pub fn queue<E: Event>(&self, event: E) {
        self.queued
            .push(Box::new(move |dispatcher: &EventDispatcher| dispatcher.dispatch(&event)));
    }

    /// Dispatches events queued so far, in FIFO order. Events queued by the callbacks themselves
    /// are left for the next call. Returns the number of dispatched events.
    pub fn process_queued_events(&self) -> usize {
        let pending = self.queued.len();
        for _ in 0..pending {
            match self.queued.pop() {
                Some(deliver) => deliver(self),
                None => break,
            }
        }
        pending
    }

    /// Checks whether the subscriber has seen all of the given events since the last reset.
    pub fn event_callbacks_invoked(&self, subscriber: SubscriberIndex, flags: EventFlags) -> bool {
        self.invoked
            .lock()
            .get(subscriber.0)
            .map(|mask| mask.contains(flags))
            .unwrap_or(false)
    }

    /// Blocks until the subscriber has seen all of the given events.
    pub fn wait_for_event_callbacks(
        &self,
        subscriber: SubscriberIndex,
        flags: EventFlags,
    ) -> Result<(), EventError> {
        let mut invoked = self.invoked.lock();
        if subscriber.0 >= invoked.len() {
            return Err(EventError::UnregisteredSubscriber(subscriber));
        }
        while !invoked[subscriber.0].contains(flags) {
            self.invoked_changed.wait(&mut invoked);
        }
        Ok(())
    }

    /// Clears the invoked masks of all subscribers.
    pub fn reset_event_callback_registry(&self) {
        for mask in self.invoked.lock().iter_mut() {
            *mask = EventFlags::empty();
        }
    }

    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.state
            .lock()
            .callbacks
            .get(&TypeId::of::<E>())
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn fan_out<E: Event>(&self, event: &E) -> usize {
        let callbacks = self
            .state
            .lock()
            .callbacks
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();

        for (subscriber, callback) in &callbacks {
            callback(event);

            let mut invoked = self.invoked.lock();
            if let Some(mask) = invoked.get_mut(subscriber.0) {
                mask.insert(E::FLAG);
            }
            drop(invoked);
            self.invoked_changed.notify_all();
        }

        callbacks.len()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventDispatcher")
            .field(
                "subscribers",
                &state.subscribers.iter().map(|s| s.name).collect::<Vec<_>>(),
            )
            .field("queued", &self.queued.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Extent2D;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    struct Listener;
    struct OtherListener;

    #[test]
    pub fn dispatch_reaches_subscribers_in_order() {
        let dispatcher = EventDispatcher::new();
        let first = dispatcher.register_subscriber::<Listener>();
        let second = dispatcher.register_subscriber::<OtherListener>();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (index, tag) in [(first, "first"), (second, "second")] {
            let seen = seen.clone();
            dispatcher
                .subscribe::<UpdateViewportSize>(index, move |event| {
                    seen.lock().push((tag, event.extent.width));
                })
                .unwrap();
        }

        dispatcher.dispatch(&UpdateViewportSize {
            extent: Extent2D::new(640, 480),
        });
        assert_eq!(*seen.lock(), vec![("first", 640), ("second", 640)]);
        assert!(dispatcher.event_callbacks_invoked(first, UpdateViewportSize::FLAG));
        assert!(!dispatcher.event_callbacks_invoked(first, RegistryReset::FLAG));

        dispatcher.reset_event_callback_registry();
        assert!(!dispatcher.event_callbacks_invoked(first, UpdateViewportSize::FLAG));
    }

    #[test]
    pub fn duplicate_registration_returns_same_index() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.register_subscriber::<Listener>();
        let b = dispatcher.register_subscriber::<Listener>();
        assert_eq!(a, b);
    }

    #[test]
    pub fn unregistered_subscribers_are_rejected() {
        let dispatcher = EventDispatcher::new();
        let bogus = SubscriberIndex(3);
        assert_eq!(
            dispatcher.subscribe::<RegistryReset>(bogus, |_| {}),
            Err(EventError::UnregisteredSubscriber(bogus))
        );
    }

    #[test]
    pub fn callbacks_can_dispatch_reentrantly() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let index = dispatcher.register_subscriber::<Listener>();
        let resets = Arc::new(AtomicUsize::new(0));

        {
            let inner = Arc::downgrade(&dispatcher);
            dispatcher
                .subscribe::<SceneLoadComplete>(index, move |_| {
                    if let Some(dispatcher) = inner.upgrade() {
                        dispatcher.dispatch(&RegistryReset);
                    }
                })
                .unwrap();
        }
        {
            let resets = resets.clone();
            dispatcher
                .subscribe::<RegistryReset>(index, move |_| {
                    resets.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        dispatcher.dispatch(&SceneLoadComplete { entity_count: 0 });
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    pub fn queued_events_are_delivered_in_order() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let index = dispatcher.register_subscriber::<Listener>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            dispatcher
                .subscribe::<SceneLoadProgress>(index, move |event| {
                    seen.lock().push(event.loaded);
                })
                .unwrap();
        }

        let worker = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                for loaded in 1..=3 {
                    dispatcher.queue(SceneLoadProgress { loaded, total: 3 });
                }
            })
        };
        worker.join().unwrap();

        assert!(seen.lock().is_empty());
        assert_eq!(dispatcher.process_queued_events(), 3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    pub fn waiting_for_callbacks_unblocks() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let index = dispatcher.register_subscriber::<Listener>();
        dispatcher
            .subscribe::<BufferManagerIsValid>(index, |_| {})
            .unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                dispatcher
                    .wait_for_event_callbacks(index, BufferManagerIsValid::FLAG)
                    .unwrap();
            })
        };
        dispatcher.dispatch(&BufferManagerIsValid);
        waiter.join().unwrap();
    }
}
