//! Change notification for stores.
//!
//! Listeners are plain callbacks held behind a [`Subscription`] guard; dropping
//! the guard removes the listener. Async consumers can instead await the
//! revision counter exposed through [`ChangeEmitter::changes`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

pub struct ChangeEmitter {
    listeners: Mutex<Listeners>,
    revision: watch::Sender<u64>,
}

impl ChangeEmitter {
    pub fn new() -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            listeners: Mutex::new(Listeners::default()),
            revision,
        })
    }

    /// Register `listener`; it stays registered until the returned guard is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            emitter: Arc::downgrade(self),
            id,
        }
    }

    /// Bump the revision and call every listener in subscription order.
    pub fn emit(&self) {
        self.revision.send_modify(|rev| *rev += 1);
        // Listeners may subscribe or unsubscribe while being notified.
        let snapshot: Vec<Listener> = self
            .lock()
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener();
        }
    }

    /// Receiver that wakes on every emitted change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn remove(&self, id: u64) {
        self.lock().entries.retain(|(entry, _)| *entry != id);
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    emitter: Weak<ChangeEmitter>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(emitter) = self.emitter.upgrade() {
            emitter.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
