use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use wpcache_core::action::AsCollectionAction;
use wpcache_core::{
    CollectionAction, CollectionStore, DispatchError, Dispatcher, Fetcher, Payload, Query,
};

use crate::media::{FolderSource, MediaFolder, SiteId};

pub type FolderAction = CollectionAction<SiteId, MediaFolder>;
pub type FolderStore = CollectionStore<SiteId, MediaFolder>;

/// Keys with an operation underway. Claiming is atomic across threads.
struct Claims<T>(Mutex<HashSet<T>>);

impl<T> Default for Claims<T> {
    fn default() -> Self {
        Self(Mutex::new(HashSet::new()))
    }
}

impl<T: Eq + Hash> Claims<T> {
    fn claim(&self, key: T) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(key)
    }

    fn release(&self, key: &T) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    fn contains(&self, key: &T) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// Action creators for the media folder collection.
///
/// Every page request is bracketed by a `Fetch` action, dispatched before
/// the request starts, and a `Received` action carrying the query the request
/// was made with, dispatched from the spawned task when it resolves. Single
/// folder lookups only dispatch `Receive` on success.
pub struct MediaFolderActions<A = FolderAction> {
    dispatcher: Arc<Dispatcher<A>>,
    store: Arc<FolderStore>,
    source: Arc<dyn FolderSource>,
    runtime: Handle,
    starting: Claims<SiteId>,
    requesting: Arc<Claims<(SiteId, u64)>>,
    _action: PhantomData<fn() -> A>,
}

impl<A> MediaFolderActions<A>
where
    A: From<FolderAction> + AsCollectionAction<SiteId, MediaFolder> + Send + Sync + 'static,
{
    /// Must be called from inside a tokio runtime; requests are spawned on it.
    pub fn new(
        dispatcher: Arc<Dispatcher<A>>,
        store: Arc<FolderStore>,
        source: Arc<dyn FolderSource>,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().context("media folder actions need a tokio runtime")?;
        Ok(Self {
            dispatcher,
            store,
            source,
            runtime,
            starting: Claims::default(),
            requesting: Arc::new(Claims::default()),
            _action: PhantomData,
        })
    }

    pub fn store(&self) -> &Arc<FolderStore> {
        &self.store
    }

    /// Make `query` the active folder query for `site`.
    pub fn set_query(&self, site: SiteId, query: Query) -> Result<(), DispatchError> {
        self.dispatcher
            .dispatch(&A::from(FolderAction::SetQuery { key: site, query }))
    }

    /// Merge folders obtained elsewhere into the cache for `site`.
    pub fn receive_folders(
        &self,
        site: SiteId,
        folders: Vec<MediaFolder>,
    ) -> Result<(), DispatchError> {
        self.dispatcher.dispatch(&A::from(FolderAction::Receive {
            key: site,
            items: folders,
        }))
    }

    /// Fetch the next page of folders for `site`.
    ///
    /// Returns `None` without touching the network when a fetch for the site
    /// is in flight or being started on another thread, or when the start
    /// action could not be dispatched.
    pub fn fetch_folders(&self, site: SiteId) -> Option<JoinHandle<()>> {
        if !self.starting.claim(site) {
            debug!(site, "folder fetch already starting");
            return None;
        }
        let started = self.start_fetch(site);
        self.starting.release(&site);
        if !started {
            return None;
        }

        let query = self.store.get_query(&site);
        let request_id = Uuid::new_v4();
        let dispatcher = Arc::clone(&self.dispatcher);
        let source = Arc::clone(&self.source);
        let span = info_span!("fetch_folders", site, %request_id);

        let task = async move {
            let start = Instant::now();
            let payload = match source.fetch_folders(site, &query).await {
                Ok(page) => page.into_payload(),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(error = %reason, "folder fetch failed");
                    Payload::Failed(reason)
                }
            };
            debug!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "folder fetch resolved"
            );

            let received = FolderAction::Received {
                key: site,
                query: Some(query),
                payload,
            };
            if let Err(err) = dispatcher.dispatch(&A::from(received)) {
                warn!(error = %err, "could not deliver folder page");
            }
        };
        Some(self.runtime.spawn(task.instrument(span)))
    }

    /// Dispatch `Fetch` unless one is already in flight for `site`.
    fn start_fetch(&self, site: SiteId) -> bool {
        if self.store.is_fetching_next_page(&site) {
            debug!(site, "folder fetch already in flight");
            return false;
        }
        match self
            .dispatcher
            .dispatch(&A::from(FolderAction::Fetch { key: site }))
        {
            Ok(()) => true,
            Err(err) => {
                warn!(site, error = %err, "could not start folder fetch");
                false
            }
        }
    }

    /// Fetch one folder by id and merge it into the cache for `site`.
    ///
    /// Returns `None` when the same folder is already being requested.
    pub fn fetch_folder(&self, site: SiteId, folder: u64) -> Option<JoinHandle<()>> {
        if !self.requesting.claim((site, folder)) {
            debug!(site, folder, "folder request already in flight");
            return None;
        }

        let request_id = Uuid::new_v4();
        let dispatcher = Arc::clone(&self.dispatcher);
        let source = Arc::clone(&self.source);
        let requesting = Arc::clone(&self.requesting);
        let span = info_span!("fetch_folder", site, folder, %request_id);

        let task = async move {
            match source.fetch_folder(site, folder).await {
                Ok(found) => {
                    let receive = FolderAction::Receive {
                        key: site,
                        items: vec![found],
                    };
                    if let Err(err) = dispatcher.dispatch(&A::from(receive)) {
                        warn!(error = %err, "could not deliver folder");
                    }
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(error = %reason, "folder request failed");
                }
            }
            requesting.release(&(site, folder));
        };
        Some(self.runtime.spawn(task.instrument(span)))
    }

    pub fn is_requesting_folder(&self, site: SiteId, folder: u64) -> bool {
        self.requesting.contains(&(site, folder))
    }
}

impl<A> Fetcher<SiteId> for MediaFolderActions<A>
where
    A: From<FolderAction> + AsCollectionAction<SiteId, MediaFolder> + Send + Sync + 'static,
{
    fn fetch(&self, site: &SiteId) {
        self.fetch_folders(*site);
    }
}
