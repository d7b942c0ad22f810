use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use wpcache_core::StoreConfig;
use wpcache_rest::client::DEFAULT_API_BASE;
use wpcache_rest::{RestClient, SiteId};

const CONFIG_FILE: &str = "wpcache.toml";
const TOKEN_ENV: &str = "WPCACHE_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub token: Option<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub site_id: SiteId,
}

fn default_base_url() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_per_page() -> u32 {
    20
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            per_page: default_per_page(),
        }
    }
}

impl AppConfig {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wpcache")
            .join(CONFIG_FILE)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "config not found at {} (run `wpcache init` first)",
                path.display()
            )
        })?;
        toml::from_str(&content).context("failed to parse config")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn find_site(&self, name: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// A configured site name, or a bare numeric site id.
    pub fn resolve_site(&self, name_or_id: &str) -> Result<SiteId> {
        if let Some(site) = self.find_site(name_or_id) {
            return Ok(site.site_id);
        }
        name_or_id
            .parse()
            .map_err(|_| anyhow::anyhow!("site '{name_or_id}' not found"))
    }

    /// Token from the environment, falling back to the config file.
    pub fn token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.api.token.clone())
    }

    pub fn client(&self) -> Result<RestClient> {
        RestClient::new(&self.api.base_url, self.token())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default().with_page_size(self.api.per_page)
    }
}
