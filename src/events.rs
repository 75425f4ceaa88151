//! Typed observer plumbing
//!
//! `EventBus` fans a value out to every subscriber. `GuardChain` runs
//! subscribers that may veto an action by returning an error.

use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Guard<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Fan-out of events to registered listeners
pub struct EventBus<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((id, Arc::new(listener))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(listener))),
        }
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener in subscription order
    pub fn emit(&self, event: &E) {
        // Listeners run outside the lock so they may subscribe or emit themselves
        let snapshot: Vec<Listener<E>> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, l)| l.clone()).collect(),
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered set of checks that can abort an action
pub struct GuardChain<T> {
    next_id: AtomicU64,
    guards: RwLock<Vec<(SubscriptionId, Guard<T>)>>,
}

impl<T> Default for GuardChain<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            guards: RwLock::new(Vec::new()),
        }
    }
}

impl<T> GuardChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, guard: F) -> SubscriptionId
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.guards.write() {
            Ok(mut guards) => guards.push((id, Arc::new(guard))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(guard))),
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guards = match self.guards.write() {
            Ok(guards) => guards,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guards.len();
        guards.retain(|(sub, _)| *sub != id);
        guards.len() != before
    }

    /// Run every guard; the first error stops the chain and is returned
    pub fn check(&self, subject: &T) -> Result<()> {
        let snapshot: Vec<Guard<T>> = match self.guards.read() {
            Ok(guards) => guards.iter().map(|(_, g)| g.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, g)| g.clone()).collect(),
        };
        for guard in snapshot {
            guard(subject)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_listeners_in_order() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe(move |e| first.lock().unwrap().push(("first", *e)));
        let second = seen.clone();
        bus.subscribe(move |e| second.lock().unwrap().push(("second", *e)));

        bus.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_| *c.lock().unwrap() += 1);

        bus.emit(&1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&2);
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_guard_chain_stops_at_first_error() {
        let chain: GuardChain<String> = GuardChain::new();
        let later = Arc::new(Mutex::new(false));
        chain.subscribe(|name| {
            if name == "busy" {
                Err(FleetError::Network("still attached".to_string()))
            } else {
                Ok(())
            }
        });
        let l = later.clone();
        chain.subscribe(move |_| {
            *l.lock().unwrap() = true;
            Ok(())
        });

        assert!(chain.check(&"busy".to_string()).is_err());
        assert!(!*later.lock().unwrap());
        assert!(chain.check(&"idle".to_string()).is_ok());
        assert!(*later.lock().unwrap());
    }
}
