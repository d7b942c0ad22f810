pub mod action;
pub mod binding;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod query;
pub mod store;

pub use action::{CollectionAction, Page, Payload};
pub use binding::{Binding, Fetcher};
pub use dispatcher::{DispatchToken, Dispatcher};
pub use error::DispatchError;
pub use query::Query;
pub use store::{CollectionStore, Identified, Projection, StoreConfig};
