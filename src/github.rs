//! GitHub API access for a single watched account
//!
//! [`RepoSource`] is the seam between the poll cycle and the network.
//! [`GitHubClient`] implements it over plain REST calls; tests swap in
//! scripted sources.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::GitHubConfig;
use crate::error::{FetchError, FetchResult};

/// Number of repositories requested per page. A shorter page ends pagination.
pub const PER_PAGE: usize = 100;

/// One repository as listed by `GET /users/{account}/repos`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Entry {
    /// `owner/name`, unique within the account
    pub full_name: String,
    /// Upstream creation timestamp, kept verbatim
    pub created_at: String,
}

impl Entry {
    pub fn new(full_name: impl Into<String>, created_at: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            created_at: created_at.into(),
        }
    }
}

/// Account summary from `GET /users/{account}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountSummary {
    pub login: String,
    pub public_repos: u64,
}

/// Source of repository listings for an account
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Fetch one page of the listing. `page` is zero-based.
    async fn fetch_page(&self, account: &str, page: usize) -> FetchResult<Vec<Entry>>;

    /// Fetch the account summary (not paginated)
    async fn fetch_summary(&self, account: &str) -> FetchResult<AccountSummary>;
}

/// Walk the listing page by page until a short page, returning every entry
/// in upstream order.
///
/// Any failed page fails the whole walk; no partial listing is returned.
pub async fn fetch_all_entries<S>(source: &S, account: &str) -> FetchResult<Vec<Entry>>
where
    S: RepoSource + ?Sized,
{
    let mut entries = Vec::new();

    for page in 0.. {
        let items = source.fetch_page(account, page).await?;
        let count = items.len();
        debug!("Fetched page {} for {}: {} repositories", page, account, count);

        entries.extend(items);

        if count < PER_PAGE {
            break;
        }
    }

    debug!("Listing for {} complete: {} repositories", account, entries.len());
    Ok(entries)
}

/// REST client for the GitHub users API
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
}

impl GitHubClient {
    /// Build a client from the `github` section of the configuration
    pub fn new(config: &GitHubConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("GitHub token contains invalid characters")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
            info!("Using authenticated GitHub requests");
        }

        let builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout))
            .default_headers(headers);

        let http = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> FetchResult<T> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl RepoSource for GitHubClient {
    async fn fetch_page(&self, account: &str, page: usize) -> FetchResult<Vec<Entry>> {
        let url = format!("{}/users/{}/repos", self.api_base, account);
        // GitHub pages are 1-based and serve page 1 for page=0
        let query = [
            ("per_page", PER_PAGE.to_string()),
            ("page", (page + 1).to_string()),
        ];
        self.get_json(&url, &query).await
    }

    async fn fetch_summary(&self, account: &str) -> FetchResult<AccountSummary> {
        let url = format!("{}/users/{}", self.api_base, account);
        self.get_json(&url, &[]).await
    }
}
