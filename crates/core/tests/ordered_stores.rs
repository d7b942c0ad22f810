//! Two stores on one dispatcher, the second ordered after the first.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use wpcache_core::action::AsCollectionAction;
use wpcache_core::{
    Binding, CollectionAction, CollectionStore, Dispatcher, Fetcher, Identified, Page, Payload,
    Projection, Query,
};

#[derive(Debug, Clone, PartialEq)]
struct MediaItem {
    id: u64,
    folder: Option<u64>,
}

impl Identified for MediaItem {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

/// Application-wide action type: media actions plus unrelated traffic.
#[derive(Debug, Clone)]
enum AppAction {
    Media(CollectionAction<u64, MediaItem>),
    Ping,
}

impl AsCollectionAction<u64, MediaItem> for AppAction {
    fn as_collection_action(&self) -> Option<&CollectionAction<u64, MediaItem>> {
        match self {
            AppAction::Media(action) => Some(action),
            AppAction::Ping => None,
        }
    }
}

type Store = CollectionStore<u64, MediaItem>;

fn item(id: u64, folder: Option<u64>) -> MediaItem {
    MediaItem { id, folder }
}

fn ids(store: &Store, key: u64) -> Vec<u64> {
    store
        .get_all(&key)
        .unwrap_or_default()
        .iter()
        .map(|m| m.id)
        .collect()
}

/// `library` caches everything; `folder_view` only keeps items that the
/// library already holds and that sit in the queried folder.
fn stores(dispatcher: &Dispatcher<AppAction>) -> (Arc<Store>, Arc<Store>) {
    let library = Arc::new(Store::new("library"));
    let library_token = library.register(dispatcher, &[]).unwrap();

    let seen = Arc::clone(&library);
    let folder_view = Arc::new(Store::new("folder-view").with_filter(
        move |site: &u64, query: Option<&Query>, media: &MediaItem| {
            let in_library = seen
                .get_all(site)
                .is_some_and(|items| items.iter().any(|m| m.id == media.id));
            let wanted = query
                .and_then(|q| q.get("folder"))
                .and_then(Value::as_u64);
            in_library && (wanted.is_none() || wanted == media.folder)
        },
    ));
    folder_view.register(dispatcher, &[library_token]).unwrap();
    (library, folder_view)
}

fn received(site: u64, items: Vec<MediaItem>) -> AppAction {
    AppAction::Media(CollectionAction::Received {
        key: site,
        query: None,
        payload: Payload::Page(Page::new(items)),
    })
}

#[test]
fn dependent_store_observes_updated_dependency() {
    let dispatcher = Dispatcher::new();
    let (library, folder_view) = stores(&dispatcher);

    dispatcher
        .dispatch(&received(5, vec![item(1, Some(10)), item(2, None)]))
        .unwrap();

    assert_eq!(ids(&library, 5), vec![1, 2]);
    assert_eq!(ids(&folder_view, 5), vec![1, 2]);
}

#[test]
fn dependent_store_keeps_order_when_registered_first() {
    let dispatcher = Dispatcher::new();

    let library = Arc::new(Store::new("library"));
    let seen = Arc::clone(&library);
    let folder_view = Arc::new(Store::new("folder-view").with_filter(
        move |site: &u64, _: Option<&Query>, media: &MediaItem| {
            seen.get_all(site)
                .is_some_and(|items| items.iter().any(|m| m.id == media.id))
        },
    ));

    let view_token = folder_view.register(&dispatcher, &[]).unwrap();
    let library_token = library.register(&dispatcher, &[]).unwrap();
    dispatcher.wait_for(view_token, &[library_token]).unwrap();
    assert!(dispatcher.wait_for(library_token, &[view_token]).is_err());

    dispatcher.dispatch(&received(5, vec![item(1, None)])).unwrap();
    assert_eq!(ids(&folder_view, 5), vec![1]);
}

#[test]
fn query_filter_applies_on_insert() {
    let dispatcher = Dispatcher::new();
    let (library, folder_view) = stores(&dispatcher);

    dispatcher
        .dispatch(&AppAction::Media(CollectionAction::SetQuery {
            key: 5,
            query: Query::new().with("folder", 10),
        }))
        .unwrap();
    dispatcher
        .dispatch(&received(
            5,
            vec![item(1, Some(10)), item(2, Some(11)), item(3, Some(10))],
        ))
        .unwrap();
    dispatcher.dispatch(&AppAction::Ping).unwrap();

    assert_eq!(ids(&library, 5), vec![1, 2, 3]);
    assert_eq!(ids(&folder_view, 5), vec![1, 3]);
}

#[test]
fn binding_follows_the_full_fetch_cycle() {
    let dispatcher: Arc<Dispatcher<AppAction>> = Arc::new(Dispatcher::new());
    let (_library, folder_view) = stores(&dispatcher);

    let started = Arc::clone(&dispatcher);
    let fetcher: Arc<dyn Fetcher<u64>> = Arc::new(move |site: &u64| {
        started
            .dispatch(&AppAction::Media(CollectionAction::Fetch { key: *site }))
            .unwrap();
    });

    let renders: Arc<Mutex<Vec<Projection<MediaItem>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&renders);
    let binding = Binding::attach(Arc::clone(&folder_view), 5, fetcher, move |p| {
        sink.lock().unwrap().push(p)
    });

    assert!(binding.projection().is_fetching);

    dispatcher
        .dispatch(&AppAction::Media(CollectionAction::Received {
            key: 5,
            query: Some(folder_view.get_query(&5)),
            payload: Payload::Page(Page::new(vec![item(1, None)]).with_next_page("next")),
        }))
        .unwrap();

    let last = renders.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.items, Some(vec![item(1, None)]));
    assert!(!last.is_fetching);
    assert_eq!(last.query.get("page_handle"), Some(&Value::from("next")));

    drop(binding);
    assert_eq!(folder_view.listener_count(), 0);
}
