//! Name-addressed local event emitter.
//!
//! Each relay owns one [`Emitter`]; there is no process-wide registry.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Identifier returned when a listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Registered<A> {
    id: ListenerId,
    once: bool,
    listener: Listener<A>,
}

/// Per-instance mapping from event name to ordered listeners.
pub struct Emitter<A> {
    listeners: RwLock<HashMap<String, Vec<Registered<A>>>>,
    next_id: AtomicU64,
}

impl<A> Default for Emitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Emitter<A> {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register<F>(&self, event: &str, once: bool, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Registered {
                id,
                once,
                listener: Arc::new(listener),
            });
        id
    }

    /// Register a listener for every emission of `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.register(event, false, listener)
    }

    /// Register a listener for the next emission of `event` only.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.register(event, true, listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Remove every listener for `event`.
    pub fn remove_all(&self, event: &str) {
        self.listeners.write().remove(event);
    }

    /// Number of listeners registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Call every listener of `event` in registration order.
    ///
    /// Listeners may register or remove listeners while running; such
    /// changes apply from the next emission on. Returns whether any
    /// listener was called.
    pub fn emit(&self, event: &str, args: &A) -> bool {
        let snapshot: Vec<Listener<A>> = {
            let mut listeners = self.listeners.write();
            let Some(list) = listeners.get_mut(event) else {
                return false;
            };
            let snapshot = list.iter().map(|r| Arc::clone(&r.listener)).collect();
            list.retain(|r| !r.once);
            if list.is_empty() {
                listeners.remove(event);
            }
            snapshot
        };

        for listener in &snapshot {
            listener(args);
        }
        !snapshot.is_empty()
    }
}

impl<A> Emitter<A>
where
    A: Clone + Send + 'static,
{
    /// Stream of owned arguments for every emission of `event`.
    ///
    /// The backing listener stays registered until removed with
    /// [`Emitter::off`]; once the stream is dropped it simply discards.
    pub fn stream(&self, event: &str) -> (ListenerId, impl Stream<Item = A> + Send + use<A>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(event, move |args: &A| {
            let _ = tx.send(args.clone());
        });
        (id, UnboundedReceiverStream::new(rx))
    }
}

impl<A> fmt::Debug for Emitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        let mut events: Vec<_> = listeners.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        events.sort_unstable();
        f.debug_struct("Emitter").field("events", &events).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_emit_calls_listeners_in_order() {
        let emitter = Emitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            emitter.on("tick", move |n| seen.lock().push(format!("{tag}{n}")));
        }

        assert!(emitter.emit("tick", &1));
        assert!(!emitter.emit("other", &2));
        assert_eq!(*seen.lock(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_once_and_off() {
        let emitter = Emitter::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        emitter.once("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&count);
        let id = emitter.on("x", move |_| {
            c.fetch_add(10, Ordering::SeqCst);
        });

        emitter.emit("x", &());
        emitter.emit("x", &());
        assert_eq!(count.load(Ordering::SeqCst), 21);

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        assert_eq!(emitter.listener_count("x"), 0);
        assert!(!emitter.emit("x", &()));
    }

    #[test]
    fn test_listener_may_register_during_emit() {
        let emitter = Arc::new(Emitter::<()>::new());
        let inner = Arc::clone(&emitter);
        emitter.on("x", move |_| {
            inner.on("x", |_| {});
        });

        emitter.emit("x", &());
        assert_eq!(emitter.listener_count("x"), 2);
    }

    #[test]
    fn test_remove_all() {
        let emitter = Emitter::<()>::new();
        emitter.on("x", |_| {});
        emitter.on("x", |_| {});
        emitter.on("y", |_| {});
        emitter.remove_all("x");
        assert_eq!(emitter.listener_count("x"), 0);
        assert_eq!(emitter.listener_count("y"), 1);
    }

    #[tokio::test]
    async fn test_stream_yields_emissions() {
        let emitter = Emitter::<String>::new();
        let (id, stream) = emitter.stream("msg");
        emitter.emit("msg", &"one".to_string());
        emitter.emit("msg", &"two".to_string());
        emitter.off(id);
        emitter.emit("msg", &"three".to_string());

        let got: Vec<String> = stream.collect().await;
        assert_eq!(got, vec!["one", "two"]);
    }
}
