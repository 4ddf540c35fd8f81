//! Event fan-out.
//!
//! A typed listener list with explicit subscribe/unsubscribe. Listeners run
//! synchronously on the publishing thread, in registration order.

/// Handle returned by [`Listeners::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Box<dyn FnMut(&E) + Send>;

/// Ordered set of listeners for events of type `E`.
pub struct Listeners<E> {
    next_id: u64,
    handlers: Vec<(ListenerId, Handler<E>)>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            handlers: Vec::new(),
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener after all existing ones.
    pub fn subscribe(&mut self, f: impl FnMut(&E) + Send + 'static) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, Box::new(f)));
        id
    }

    /// Removes a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        self.handlers.len() != before
    }

    /// Delivers `event` to every listener in registration order.
    pub fn publish(&mut self, event: &E) {
        for (_, handler) in &mut self.handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn delivers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = Listeners::<u32>::new();
        for tag in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            listeners.subscribe(move |n| log.lock().unwrap().push(format!("{tag}{n}")));
        }
        listeners.publish(&1);
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hits = Arc::new(Mutex::new(0));
        let mut listeners = Listeners::<()>::new();
        let h = Arc::clone(&hits);
        let id = listeners.subscribe(move |_| *h.lock().unwrap() += 1);
        listeners.publish(&());
        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        listeners.publish(&());
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(listeners.is_empty());
    }
}
