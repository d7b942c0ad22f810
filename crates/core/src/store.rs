use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::action::{AsCollectionAction, CollectionAction, Payload};
use crate::dispatcher::{DispatchToken, Dispatcher};
use crate::emitter::{ChangeEmitter, Subscription};
use crate::error::{DispatchError, Result};
use crate::query::Query;

/// Items carry a stable identity used to deduplicate cached sequences.
pub trait Identified {
    type Id: Eq + Hash + Clone + Send + Sync;

    fn id(&self) -> Self::Id;
}

/// Decides whether an incoming item belongs under the key's active query.
///
/// Called during dispatch with the store unlocked; reading any store is fine,
/// dispatching is not.
pub trait ItemFilter<K, T>: Send + Sync {
    fn matches(&self, key: &K, query: Option<&Query>, item: &T) -> bool;
}

/// Default filter: every item is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<K, T> ItemFilter<K, T> for AcceptAll {
    fn matches(&self, _key: &K, _query: Option<&Query>, _item: &T) -> bool {
        true
    }
}

impl<K, T, F> ItemFilter<K, T> for F
where
    F: Fn(&K, Option<&Query>, &T) -> bool + Send + Sync,
{
    fn matches(&self, key: &K, query: Option<&Query>, item: &T) -> bool {
        self(key, query, item)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Query every effective query starts from.
    pub default_query: Query,
    /// Fields ignored when deciding whether two queries are the same.
    pub ignore_params: Vec<String>,
    /// Field the pagination cursor is sent under.
    pub cursor_param: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_query: Query::new().with("number", 20),
            ignore_params: vec!["number".into(), "page_handle".into()],
            cursor_param: "page_handle".into(),
        }
    }
}

impl StoreConfig {
    pub fn with_page_size(mut self, number: u32) -> Self {
        self.default_query.insert("number", number);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Cursor {
    #[default]
    Unstarted,
    Next(String),
    Exhausted,
}

#[derive(Debug, Clone, Default)]
struct ActiveQuery {
    query: Option<Query>,
    is_fetching_next_page: bool,
    cursor: Cursor,
    last_error: Option<String>,
}

struct Collection<T: Identified> {
    items: Vec<T>,
    ids: HashSet<T::Id>,
}

impl<T: Identified> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ids: HashSet::new(),
        }
    }
}

struct State<K, T: Identified> {
    active: HashMap<K, ActiveQuery>,
    collections: HashMap<K, Collection<T>>,
}

/// Render-facing snapshot of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection<T> {
    pub items: Option<Vec<T>>,
    pub query: Query,
    pub is_fetching: bool,
    pub has_next_page: bool,
    pub last_error: Option<String>,
}

/// Keyed read-through cache of one remote collection.
///
/// State is only written by the dispatch handler installed with
/// [`CollectionStore::register`]; everything public is a read.
pub struct CollectionStore<K, T: Identified> {
    name: String,
    config: StoreConfig,
    filter: Box<dyn ItemFilter<K, T>>,
    state: RwLock<State<K, T>>,
    emitter: Arc<ChangeEmitter>,
    token: OnceLock<DispatchToken>,
}

impl<K, T> CollectionStore<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
    T: Identified + Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, StoreConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: StoreConfig) -> Self {
        Self {
            name: name.into(),
            config,
            filter: Box::new(AcceptAll),
            state: RwLock::new(State {
                active: HashMap::new(),
                collections: HashMap::new(),
            }),
            emitter: ChangeEmitter::new(),
            token: OnceLock::new(),
        }
    }

    /// Replace the insert-time match predicate.
    pub fn with_filter(mut self, filter: impl ItemFilter<K, T> + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribe the store to `dispatcher`, running after the handlers in `after`.
    pub fn register<A>(
        self: &Arc<Self>,
        dispatcher: &Dispatcher<A>,
        after: &[DispatchToken],
    ) -> Result<DispatchToken>
    where
        A: AsCollectionAction<K, T> + 'static,
    {
        if let Some(token) = self.token.get() {
            return Err(DispatchError::AlreadyRegistered {
                store: self.name.clone(),
                token: *token,
            });
        }

        let store = Arc::downgrade(self);
        let handler = move |action: &A| {
            if let (Some(store), Some(action)) = (store.upgrade(), action.as_collection_action()) {
                store.handle(action);
            }
        };
        let token = if after.is_empty() {
            dispatcher.register(handler)
        } else {
            dispatcher.register_after(after, handler)?
        };

        if let Err(existing) = self.token.set(token) {
            dispatcher.unregister(token)?;
            return Err(DispatchError::AlreadyRegistered {
                store: self.name.clone(),
                token: existing,
            });
        }
        debug!(store = %self.name, %token, "store registered");
        Ok(token)
    }

    /// Token of this store's handler, once registered.
    pub fn dispatch_token(&self) -> Option<DispatchToken> {
        self.token.get().copied()
    }

    /// Cached items for `key`; `None` until the key has received data.
    pub fn get_all(&self, key: &K) -> Option<Vec<T>> {
        self.read().collections.get(key).map(|c| c.items.clone())
    }

    /// Effective query: defaults, then the pagination cursor, then the active query.
    pub fn get_query(&self, key: &K) -> Query {
        let state = self.read();
        let mut query = self.config.default_query.clone();
        let Some(active) = state.active.get(key) else {
            return query;
        };
        if let Cursor::Next(handle) = &active.cursor {
            query.insert(self.config.cursor_param.clone(), Value::String(handle.clone()));
        }
        if let Some(active_query) = &active.query {
            query.merge(active_query);
        }
        query
    }

    pub fn is_fetching_next_page(&self, key: &K) -> bool {
        self.read()
            .active
            .get(key)
            .is_some_and(|a| a.is_fetching_next_page)
    }

    /// False only once a page arrived without a next page handle.
    pub fn has_next_page(&self, key: &K) -> bool {
        self.read()
            .active
            .get(key)
            .is_none_or(|a| a.cursor != Cursor::Exhausted)
    }

    /// Reason the most recent fetch for `key` produced no data, if it failed.
    pub fn last_error(&self, key: &K) -> Option<String> {
        self.read()
            .active
            .get(key)
            .and_then(|a| a.last_error.clone())
    }

    pub fn projection(&self, key: &K) -> Projection<T> {
        Projection {
            items: self.get_all(key),
            query: self.get_query(key),
            is_fetching: self.is_fetching_next_page(key),
            has_next_page: self.has_next_page(key),
            last_error: self.last_error(key),
        }
    }

    /// Call `listener` after every state change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.emitter.subscribe(listener)
    }

    /// Revision counter that ticks on every state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.emitter.changes()
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    fn handle(&self, action: &CollectionAction<K, T>) {
        let changed = match action {
            CollectionAction::SetQuery { key, query } => self.apply_query(key, query),
            CollectionAction::Fetch { key } => {
                let mut state = self.write();
                let active = state.active.entry(key.clone()).or_default();
                active.is_fetching_next_page = true;
                active.last_error = None;
                true
            }
            CollectionAction::Received {
                key,
                query,
                payload,
            } => {
                self.receive(key, query.as_ref(), payload);
                true
            }
            CollectionAction::Receive { key, items } => {
                self.merge_items(key, items);
                true
            }
        };

        if changed {
            self.emitter.emit();
        }
    }

    /// Record `query` as active; returns true when it invalidated cached state.
    fn apply_query(&self, key: &K, query: &Query) -> bool {
        let query = query.without(&[&self.config.cursor_param]);
        let mut state = self.write();
        let same = self.is_query_same(&state, key, &query);
        if !same {
            debug!(store = %self.name, %key, "query changed, clearing cached items");
            state.collections.remove(key);
        }
        let active = state.active.entry(key.clone()).or_default();
        if !same {
            active.cursor = Cursor::Unstarted;
            active.is_fetching_next_page = false;
            active.last_error = None;
        }
        active.query = Some(query);
        !same
    }

    fn receive(&self, key: &K, query: Option<&Query>, payload: &Payload<T>) {
        let page = {
            let mut state = self.write();
            state.active.entry(key.clone()).or_default().is_fetching_next_page = false;

            if let Some(query) = query
                && !self.is_query_same(&state, key, query)
            {
                debug!(store = %self.name, %key, "dropping response for superseded query");
                return;
            }

            let Some(active) = state.active.get_mut(key) else {
                return;
            };
            match payload {
                Payload::Page(page) => {
                    active.cursor = match &page.next_page {
                        Some(handle) => Cursor::Next(handle.clone()),
                        None => Cursor::Exhausted,
                    };
                    page
                }
                Payload::Missing => {
                    active.last_error = Some("response carried no data".into());
                    return;
                }
                Payload::Failed(reason) => {
                    debug!(store = %self.name, %key, reason = %reason, "fetch failed");
                    active.last_error = Some(reason.clone());
                    return;
                }
            }
        };

        self.merge_items(key, &page.items);
    }

    /// Append unseen items accepted by the filter. The filter runs with no
    /// lock held, so it may read this store.
    fn merge_items(&self, key: &K, items: &[T]) {
        let (query, candidates) = {
            let state = self.read();
            let query = state.active.get(key).and_then(|a| a.query.clone());
            let known = state.collections.get(key).map(|c| &c.ids);
            let candidates: Vec<&T> = items
                .iter()
                .filter(|item| known.is_none_or(|ids| !ids.contains(&item.id())))
                .collect();
            (query, candidates)
        };

        let accepted: Vec<&T> = candidates
            .into_iter()
            .filter(|item| self.filter.matches(key, query.as_ref(), item))
            .collect();

        let mut state = self.write();
        let collection = state.collections.entry(key.clone()).or_default();
        let before = collection.items.len();
        for item in accepted {
            if collection.ids.insert(item.id()) {
                collection.items.push(item.clone());
            }
        }
        debug!(
            store = %self.name,
            %key,
            added = collection.items.len() - before,
            total = collection.items.len(),
            "merged items"
        );
    }

    fn is_query_same(&self, state: &State<K, T>, key: &K, query: &Query) -> bool {
        let Some(active) = state.active.get(key) else {
            return false;
        };
        let empty = Query::new();
        let current = active.query.as_ref().unwrap_or(&empty);
        query.is_equivalent(current, self.config.ignore_params.as_slice())
    }

    fn read(&self) -> RwLockReadGuard<'_, State<K, T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<K, T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::action::Page;

    #[derive(Debug, Clone, PartialEq)]
    struct Folder {
        id: u64,
        name: &'static str,
    }

    impl Identified for Folder {
        type Id = u64;

        fn id(&self) -> u64 {
            self.id
        }
    }

    type Action = CollectionAction<u64, Folder>;

    fn folder(id: u64) -> Folder {
        Folder { id, name: "f" }
    }

    fn setup() -> (Dispatcher<Action>, Arc<CollectionStore<u64, Folder>>) {
        let dispatcher = Dispatcher::new();
        let store = Arc::new(CollectionStore::new("folders"));
        store.register(&dispatcher, &[]).unwrap();
        (dispatcher, store)
    }

    fn received(key: u64, query: Option<Query>, ids: &[u64]) -> Action {
        Action::Received {
            key,
            query,
            payload: Payload::Page(Page::new(ids.iter().map(|&id| folder(id)).collect())),
        }
    }

    fn ids(store: &CollectionStore<u64, Folder>, key: u64) -> Vec<u64> {
        store
            .get_all(&key)
            .unwrap_or_default()
            .iter()
            .map(|f| f.id)
            .collect()
    }

    #[test]
    fn unknown_key_reads_as_default() {
        let (_, store) = setup();
        assert!(store.get_all(&5).is_none());
        assert!(!store.is_fetching_next_page(&5));
        assert!(store.has_next_page(&5));
        assert_eq!(store.get_query(&5), Query::new().with("number", 20));
    }

    #[test]
    fn fetch_then_receive_populates_cache() {
        let (dispatcher, store) = setup();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        assert!(store.is_fetching_next_page(&5));

        let query = store.get_query(&5);
        dispatcher.dispatch(&received(5, Some(query), &[1, 2])).unwrap();
        assert_eq!(ids(&store, 5), vec![1, 2]);
        assert!(!store.is_fetching_next_page(&5));
    }

    #[test]
    fn repeated_items_are_not_duplicated() {
        let (dispatcher, store) = setup();
        dispatcher.dispatch(&received(5, None, &[1, 2])).unwrap();
        dispatcher.dispatch(&received(5, None, &[2, 3])).unwrap();
        dispatcher.dispatch(&received(5, None, &[2, 3])).unwrap();
        assert_eq!(ids(&store, 5), vec![1, 2, 3]);
    }

    #[test]
    fn new_query_clears_cache() {
        let (dispatcher, store) = setup();
        dispatcher.dispatch(&received(5, None, &[1, 2])).unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: Query::new().with("search", "cats"),
            })
            .unwrap();

        assert!(store.get_all(&5).is_none());
        assert!(!store.is_fetching_next_page(&5));
        assert_eq!(
            store.get_query(&5),
            Query::new().with("number", 20).with("search", "cats")
        );
    }

    #[test]
    fn equivalent_query_keeps_cache() {
        let (dispatcher, store) = setup();
        let cats = Query::new().with("search", "cats");
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: cats.clone(),
            })
            .unwrap();
        dispatcher
            .dispatch(&received(5, Some(cats.clone()), &[1]))
            .unwrap();
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: cats.with("number", 100).with("page_handle", "xyz"),
            })
            .unwrap();

        assert_eq!(ids(&store, 5), vec![1]);
        assert_eq!(store.get_query(&5).get("number"), Some(&Value::from(100)));
        assert!(!store.get_query(&5).contains_key("page_handle"));
    }

    #[test]
    fn stale_response_is_dropped() {
        let (dispatcher, store) = setup();
        let cats = Query::new().with("search", "cats");
        let dogs = Query::new().with("search", "dogs");
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: cats.clone(),
            })
            .unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: dogs.clone(),
            })
            .unwrap();
        dispatcher.dispatch(&received(5, Some(dogs), &[7])).unwrap();

        dispatcher.dispatch(&received(5, Some(cats), &[1, 2])).unwrap();
        assert_eq!(ids(&store, 5), vec![7]);
        assert!(!store.is_fetching_next_page(&5));
        assert!(store.last_error(&5).is_none());
    }

    #[test]
    fn late_failure_for_old_query_is_not_an_error() {
        let (dispatcher, store) = setup();
        let cats = Query::new().with("search", "cats");
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: cats.clone(),
            })
            .unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        let issued = store.get_query(&5);
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: Query::new().with("search", "dogs"),
            })
            .unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();

        dispatcher
            .dispatch(&Action::Received {
                key: 5,
                query: Some(issued.clone()),
                payload: Payload::Failed("HTTP 500".into()),
            })
            .unwrap();
        assert!(store.last_error(&5).is_none());

        dispatcher
            .dispatch(&Action::Received {
                key: 5,
                query: Some(issued),
                payload: Payload::Missing,
            })
            .unwrap();
        assert!(store.last_error(&5).is_none());
        assert!(store.get_all(&5).is_none());
    }

    #[test]
    fn out_of_band_items_keep_fetch_state() {
        let (dispatcher, store) = setup();
        dispatcher
            .dispatch(&Action::Received {
                key: 5,
                query: None,
                payload: Payload::Page(Page::new(vec![folder(1)]).with_next_page("p2")),
            })
            .unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();

        dispatcher
            .dispatch(&Action::Receive {
                key: 5,
                items: vec![folder(1), folder(9)],
            })
            .unwrap();
        assert_eq!(ids(&store, 5), vec![1, 9]);
        assert!(store.is_fetching_next_page(&5));
        assert_eq!(
            store.get_query(&5).get("page_handle"),
            Some(&Value::from("p2"))
        );

        dispatcher
            .dispatch(&Action::Receive {
                key: 6,
                items: vec![folder(3)],
            })
            .unwrap();
        assert_eq!(ids(&store, 6), vec![3]);
        assert!(store.has_next_page(&6));
        assert!(!store.is_fetching_next_page(&6));
    }

    #[test]
    fn filter_may_read_its_own_store() {
        let dispatcher = Dispatcher::new();
        let store: Arc<CollectionStore<u64, Folder>> =
            Arc::new_cyclic(|weak: &Weak<CollectionStore<u64, Folder>>| {
                let this = weak.clone();
                CollectionStore::new("capped").with_filter(
                    move |key: &u64, _: Option<&Query>, _: &Folder| {
                        this.upgrade()
                            .is_none_or(|s| s.get_all(key).map_or(0, |items| items.len()) < 2)
                    },
                )
            });
        store.register(&dispatcher, &[]).unwrap();

        dispatcher.dispatch(&received(5, None, &[1, 2, 3])).unwrap();
        dispatcher.dispatch(&received(5, None, &[4])).unwrap();
        assert_eq!(ids(&store, 5), vec![1, 2, 3]);
    }

    #[test]
    fn failed_fetch_leaves_cache_untouched() {
        let (dispatcher, store) = setup();
        dispatcher.dispatch(&received(5, None, &[1, 2])).unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        dispatcher
            .dispatch(&Action::Received {
                key: 5,
                query: None,
                payload: Payload::Failed("HTTP 500".into()),
            })
            .unwrap();

        assert_eq!(ids(&store, 5), vec![1, 2]);
        assert!(!store.is_fetching_next_page(&5));
        assert_eq!(store.last_error(&5).as_deref(), Some("HTTP 500"));

        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        assert!(store.last_error(&5).is_none());
        dispatcher
            .dispatch(&Action::Received {
                key: 5,
                query: None,
                payload: Payload::Missing,
            })
            .unwrap();
        assert_eq!(ids(&store, 5), vec![1, 2]);
        assert!(store.last_error(&5).is_some());
    }

    #[test]
    fn cursor_is_tracked_per_page() {
        let (dispatcher, store) = setup();
        dispatcher
            .dispatch(&Action::Received {
                key: 5,
                query: None,
                payload: Payload::Page(Page::new(vec![folder(1)]).with_next_page("p2")),
            })
            .unwrap();
        assert_eq!(
            store.get_query(&5).get("page_handle"),
            Some(&Value::from("p2"))
        );
        assert!(store.has_next_page(&5));

        dispatcher.dispatch(&received(5, None, &[2])).unwrap();
        assert!(!store.has_next_page(&5));
        assert!(!store.get_query(&5).contains_key("page_handle"));

        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: Query::new().with("search", "x"),
            })
            .unwrap();
        assert!(store.has_next_page(&5));
    }

    #[test]
    fn keys_are_independent() {
        let (dispatcher, store) = setup();
        dispatcher.dispatch(&received(5, None, &[1])).unwrap();
        dispatcher.dispatch(&Action::Fetch { key: 6 }).unwrap();
        assert_eq!(ids(&store, 5), vec![1]);
        assert!(store.get_all(&6).is_none());
        assert!(store.is_fetching_next_page(&6));
        assert!(!store.is_fetching_next_page(&5));
    }

    #[test]
    fn filter_rejects_items_on_insert() {
        let dispatcher = Dispatcher::new();
        let store = Arc::new(
            CollectionStore::new("even-folders")
                .with_filter(|_: &u64, _: Option<&Query>, f: &Folder| f.id % 2 == 0),
        );
        store.register(&dispatcher, &[]).unwrap();

        dispatcher.dispatch(&received(5, None, &[1, 2, 3, 4])).unwrap();
        assert_eq!(ids(&store, 5), vec![2, 4]);
    }

    #[test]
    fn notifies_on_every_mutation() {
        let (dispatcher, store) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = store.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.dispatch(&received(5, None, &[1])).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Equivalent query: nothing to invalidate.
        dispatcher
            .dispatch(&Action::SetQuery {
                key: 5,
                query: Query::new().with("number", 40),
            })
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_sees_committed_state() {
        let (dispatcher, store) = setup();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let reader = Arc::downgrade(&store);
        let log = Arc::clone(&seen);
        let _sub = store.subscribe(move || {
            if let Some(store) = reader.upgrade() {
                log.lock().unwrap().push(store.is_fetching_next_page(&5));
            }
        });

        dispatcher.dispatch(&Action::Fetch { key: 5 }).unwrap();
        dispatcher.dispatch(&received(5, None, &[1])).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn double_registration_is_rejected() {
        let (dispatcher, store) = setup();
        let token = store.dispatch_token().unwrap();
        assert_eq!(
            store.register(&dispatcher, &[]),
            Err(DispatchError::AlreadyRegistered {
                store: "folders".into(),
                token,
            })
        );
        assert_eq!(dispatcher.handler_count(), 1);
    }
}
