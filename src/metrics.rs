//! Repo counter and the `/metrics` scrape endpoint
//!
//! The counter accumulates: every poll cycle adds the account's current
//! `public_repos` to it, so the exposed value keeps growing even while the
//! account is unchanged.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::FetchResult;
use crate::github::RepoSource;

/// Name of the exposed counter
pub const METRIC_NAME: &str = "number_of_repos";

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Monotonic counter shared between the poll loop and the HTTP handler
#[derive(Debug, Clone, Default)]
pub struct RepoCounter {
    value: Arc<AtomicU64>,
}

impl RepoCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to the counter, returning the new total
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fetch the account summary and add its `public_repos` to the counter.
///
/// Returns the fetched count. The counter is untouched on error.
pub async fn record_repo_count<S>(
    source: &S,
    account: &str,
    counter: &RepoCounter,
) -> FetchResult<u64>
where
    S: RepoSource + ?Sized,
{
    let summary = source.fetch_summary(account).await?;
    let total = counter.add(summary.public_repos);
    debug!(
        "Account {} has {} public repos, counter now {}",
        summary.login, summary.public_repos, total
    );
    Ok(summary.public_repos)
}

/// Render the counter in the Prometheus text exposition format
pub fn render(account: &str, counter: &RepoCounter) -> String {
    format!(
        concat!(
            "# HELP {name} Number of repos\n",
            "# TYPE {name} counter\n",
            "{name}{{account=\"{account}\"}} {value}\n",
        ),
        name = METRIC_NAME,
        account = escape_label(account),
        value = counter.get(),
    )
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[derive(Clone)]
struct MetricsState {
    account: Arc<str>,
    counter: RepoCounter,
}

/// Router serving `GET /metrics`
pub fn router(account: &str, counter: RepoCounter) -> Router {
    let state = MetricsState {
        account: Arc::from(account),
        counter,
    };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        render(&state.account, &state.counter),
    )
}

/// Serve the metrics router until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .context("Failed to read metrics listener address")?;
    info!("Serving metrics on http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Metrics server error")?;

    info!("Metrics server stopped");
    Ok(())
}
