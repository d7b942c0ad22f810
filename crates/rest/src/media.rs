use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use wpcache_core::{Identified, Page, Payload, Query};

use crate::client::RestClient;

pub type SiteId = u64;

// ---------------------------------------------------------------------------
// Data structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFolder {
    #[serde(rename = "ID")]
    pub id: u64,
    pub name: String,
    pub parent: Option<u64>,
    pub date: Option<DateTime<Utc>>,
    pub media_count: Option<u64>,
}

impl Identified for MediaFolder {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

/// Response of `GET /sites/{site}/media/folders`.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderPage {
    pub found: Option<u64>,
    pub folders: Option<Vec<MediaFolder>>,
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageMeta {
    pub next_page: Option<String>,
}

impl FolderPage {
    /// A response without a `folders` array counts as missing data.
    pub fn into_payload(self) -> Payload<MediaFolder> {
        let next_page = self.meta.and_then(|m| m.next_page);
        match self.folders {
            Some(items) => Payload::Page(Page { items, next_page }),
            None => Payload::Missing,
        }
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Anything that can produce media folders for a site.
#[async_trait]
pub trait FolderSource: Send + Sync {
    /// One page of folders matching `query`.
    async fn fetch_folders(&self, site: SiteId, query: &Query) -> Result<FolderPage>;

    /// A single folder by id.
    async fn fetch_folder(&self, site: SiteId, folder: u64) -> Result<MediaFolder>;
}

#[async_trait]
impl FolderSource for RestClient {
    async fn fetch_folders(&self, site: SiteId, query: &Query) -> Result<FolderPage> {
        let page: FolderPage = self
            .get_json(&format!("/sites/{site}/media/folders"), query)
            .await?;
        debug!(
            site,
            folders = page.folders.as_ref().map_or(0, Vec::len),
            found = ?page.found,
            "fetched folder page"
        );
        Ok(page)
    }

    async fn fetch_folder(&self, site: SiteId, folder: u64) -> Result<MediaFolder> {
        let folder: MediaFolder = self
            .get_json(&format!("/sites/{site}/media/folders/{folder}"), &Query::new())
            .await?;
        debug!(site, folder = folder.id, "fetched folder");
        Ok(folder)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
