pub mod actions;
pub mod client;
pub mod media;

pub use actions::{FolderAction, FolderStore, MediaFolderActions};
pub use client::RestClient;
pub use media::{FolderSource, MediaFolder, SiteId};
