//! Binds a [`CollectionStore`] key to a render callback.

use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use crate::emitter::Subscription;
use crate::store::{CollectionStore, Identified, Projection};

/// Starts a fetch for the next page of a key. Implemented by action creators.
pub trait Fetcher<K>: Send + Sync {
    fn fetch(&self, key: &K);
}

impl<K, F> Fetcher<K> for F
where
    F: Fn(&K) + Send + Sync,
{
    fn fetch(&self, key: &K) {
        self(key)
    }
}

/// A consumer attached to one key of a store.
///
/// While attached, every store change is turned into a fresh [`Projection`]
/// and handed to the render callback. Dropping the binding detaches it.
pub struct Binding<K, T: Identified> {
    store: Arc<CollectionStore<K, T>>,
    key: K,
    fetcher: Arc<dyn Fetcher<K>>,
    subscription: Option<Subscription>,
}

impl<K, T> Binding<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
    T: Identified + Clone + Send + Sync + 'static,
{
    /// Render the current projection, subscribe, then ask `fetcher` for data.
    pub fn attach<R>(
        store: Arc<CollectionStore<K, T>>,
        key: K,
        fetcher: Arc<dyn Fetcher<K>>,
        render: R,
    ) -> Self
    where
        R: Fn(Projection<T>) + Send + Sync + 'static,
    {
        render(store.projection(&key));

        let weak = Arc::downgrade(&store);
        let listen_key = key.clone();
        let subscription = store.subscribe(move || {
            if let Some(store) = weak.upgrade() {
                render(store.projection(&listen_key));
            }
        });

        // The fetch notifies synchronously, so subscribe first.
        fetcher.fetch(&key);
        debug!(store = store.name(), %key, "binding attached");

        Self {
            store,
            key,
            fetcher,
            subscription: Some(subscription),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn projection(&self) -> Projection<T> {
        self.store.projection(&self.key)
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    /// Ask for the next page. Returns false when a fetch is already in
    /// flight, the last page was reached, or the binding is detached.
    pub fn request_more(&self) -> bool {
        if !self.is_attached()
            || self.store.is_fetching_next_page(&self.key)
            || !self.store.has_next_page(&self.key)
        {
            return false;
        }
        self.fetcher.fetch(&self.key);
        true
    }

    /// Stop receiving change notifications.
    pub fn detach(&mut self) {
        if self.subscription.take().is_some() {
            debug!(store = self.store.name(), key = %self.key, "binding detached");
        }
    }
}

impl<K, T: Identified> Drop for Binding<K, T> {
    fn drop(&mut self) {
        self.subscription.take();
    }
}
