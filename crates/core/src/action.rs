use crate::query::Query;

/// One page of items as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the following page; `None` on the last page.
    pub next_page: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next_page: None,
        }
    }

    pub fn with_next_page(mut self, handle: impl Into<String>) -> Self {
        self.next_page = Some(handle.into());
        self
    }
}

/// Outcome carried by a `Received` action.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    Page(Page<T>),
    /// The request succeeded but the response had no usable data.
    Missing,
    /// Transport or HTTP failure.
    Failed(String),
}

/// Actions understood by a [`CollectionStore`](crate::store::CollectionStore).
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionAction<K, T> {
    /// Apply a new active query for `key`.
    SetQuery { key: K, query: Query },
    /// A fetch for the next page of `key` has started.
    Fetch { key: K },
    /// A fetch for `key` resolved. `query` is the query the request was issued with.
    Received {
        key: K,
        query: Option<Query>,
        payload: Payload<T>,
    },
    /// Items delivered outside any paginated fetch, such as a single item
    /// looked up by id. Merged without touching fetch or cursor state.
    Receive { key: K, items: Vec<T> },
}

impl<K, T> CollectionAction<K, T> {
    pub fn key(&self) -> &K {
        match self {
            CollectionAction::SetQuery { key, .. }
            | CollectionAction::Fetch { key }
            | CollectionAction::Received { key, .. }
            | CollectionAction::Receive { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CollectionAction::SetQuery { .. } => "set_query",
            CollectionAction::Fetch { .. } => "fetch",
            CollectionAction::Received { .. } => "received",
            CollectionAction::Receive { .. } => "receive",
        }
    }
}

/// Lets an application-wide action enum route its variants to collection stores.
pub trait AsCollectionAction<K, T> {
    fn as_collection_action(&self) -> Option<&CollectionAction<K, T>>;
}

impl<K, T> AsCollectionAction<K, T> for CollectionAction<K, T> {
    fn as_collection_action(&self) -> Option<&CollectionAction<K, T>> {
        Some(self)
    }
}
