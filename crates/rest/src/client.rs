use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use wpcache_core::Query;

pub const DEFAULT_API_BASE: &str = "https://public-api.wordpress.com/rest/v1.1";
const MAX_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct RestClient {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("wpcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        let base = base.into().trim_end_matches('/').to_string();
        Ok(Self { base, token, http })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Absolute URLs pass through; anything else is joined to the API base.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base, path.trim_start_matches('/'))
        }
    }

    /// GET `path` with `query` as URL parameters, retrying when rate limited.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &Query) -> Result<T> {
        let url = self.url(path);
        let params = query.to_params();

        let mut retries = 0;
        loop {
            let mut request = self.http.get(&url).query(&params);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let resp = request
                .send()
                .await
                .with_context(|| format!("GET {url} failed"))?;

            let status = resp.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            {
                retries += 1;
                if retries > MAX_RETRIES {
                    anyhow::bail!("max retries exceeded for {url}");
                }
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(2u64.pow(retries));
                warn!(url = %url, retry_after, retries, "rate limited, backing off");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("GET {url} returned {status}: {}", error_message(&body));
            }

            debug!(url = %url, "OK");
            return resp.json().await.context("failed to deserialize response");
        }
    }
}

/// The API reports failures as `{"error": "...", "message": "..."}`.
fn error_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ApiError {
        error: String,
        message: Option<String>,
    }

    match serde_json::from_str::<ApiError>(body) {
        Ok(ApiError {
            error,
            message: Some(message),
        }) => format!("{error}: {message}"),
        Ok(ApiError { error, .. }) => error,
        Err(_) => body.to_string(),
    }
}
