//! Daemon - the poll loop driving fetch, reconcile, and metrics refresh
//!
//! Each cycle lists every repository of the account, reconciles the listing
//! against the tracked set, then adds the account's public repo count to the
//! counter. Cycles repeat at a fixed interval until a shutdown signal
//! arrives. A cycle in progress always runs to completion; the signal is only
//! observed while waiting for the next one.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ErrorPolicy};
use crate::error::CycleError;
use crate::github::{fetch_all_entries, RepoSource};
use crate::metrics::{record_repo_count, RepoCounter};
use crate::notify::Notifier;
use crate::reconcile::{reconcile, ReconcileSummary};
use crate::store::RepoStore;

/// Lifecycle of the poll loop. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Running,
    Stopped,
}

/// Results of one poll cycle
#[derive(Debug, Clone)]
pub struct CycleSummary {
    /// Repositories in the upstream listing
    pub listed: usize,
    pub reconcile: ReconcileSummary,
    /// Count added to the repo counter this cycle
    pub public_repos: u64,
    pub duration: Duration,
}

/// Daemon statistics and status
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    /// Repositories announced since start
    pub announced: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            state: DaemonState::Running,
            total_cycles: 0,
            successful_cycles: 0,
            failed_cycles: 0,
            announced: 0,
            last_cycle_at: None,
        }
    }
}

/// Poll loop for one account
pub struct Daemon<S, N> {
    account: String,
    interval: Duration,
    policy: ErrorPolicy,
    source: S,
    store: RepoStore,
    notifier: N,
    counter: RepoCounter,
    status: DaemonStatus,
}

impl<S, N> Daemon<S, N>
where
    S: RepoSource,
    N: Notifier,
{
    /// Create a daemon for the configured account.
    ///
    /// Creates the account's bucket if this is the first run against `store`.
    pub fn new(
        config: &Config,
        source: S,
        store: RepoStore,
        notifier: N,
        counter: RepoCounter,
    ) -> Result<Self> {
        config.validate()?;
        store.create_bucket_if_not_exists(&config.account)?;

        Ok(Self {
            account: config.account.clone(),
            interval: config.interval_duration()?,
            policy: config.on_fetch_error,
            source,
            store,
            notifier,
            counter,
            status: DaemonStatus::default(),
        })
    }

    pub fn status(&self) -> &DaemonStatus {
        &self.status
    }

    pub fn store(&self) -> &RepoStore {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Run one full cycle: listing, reconcile, then counter refresh.
    ///
    /// A failed listing skips reconcile and the counter. A failed summary
    /// fetch fails the cycle after reconcile has already committed.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, CycleError> {
        let start = Instant::now();
        self.status.total_cycles += 1;
        self.status.last_cycle_at = Some(Utc::now());

        let result = self.poll_once(start).await;
        match &result {
            Ok(summary) => {
                self.status.successful_cycles += 1;
                self.status.announced += summary.reconcile.new as u64;
            }
            Err(_) => self.status.failed_cycles += 1,
        }
        result
    }

    async fn poll_once(&mut self, start: Instant) -> Result<CycleSummary, CycleError> {
        debug!("Starting poll cycle for {}", self.account);

        let entries = fetch_all_entries(&self.source, &self.account)
            .await
            .map_err(CycleError::listing)?;

        let reconcile = reconcile(
            &mut self.store,
            &self.account,
            &entries,
            &mut self.notifier,
        );

        let public_repos = record_repo_count(&self.source, &self.account, &self.counter)
            .await
            .map_err(CycleError::summary)?;

        Ok(CycleSummary {
            listed: entries.len(),
            reconcile,
            public_repos,
            duration: start.elapsed(),
        })
    }

    /// Run cycles until `shutdown` fires (or its sender is dropped).
    ///
    /// A failed cycle stops the loop and is returned as the error when the
    /// policy is [`ErrorPolicy::Abort`] or the error is not retryable.
    /// A stopped daemon cannot be run again.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.status.state == DaemonState::Stopped {
            bail!("Daemon for {} has already stopped", self.account);
        }

        info!(
            "Watching {} every {:?} (on fetch error: {:?})",
            self.account, self.interval, self.policy
        );

        loop {
            match self.run_cycle().await {
                Ok(summary) => self.log_cycle_success(&summary),
                Err(e) => {
                    let fatal = self.is_fatal(&e);
                    self.log_cycle_failure(&e, fatal);
                    if fatal {
                        self.status.state = DaemonState::Stopped;
                        return Err(e.into());
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.status.state = DaemonState::Stopped;
        info!("Daemon loop exiting");
        Ok(())
    }

    fn log_cycle_success(&self, summary: &CycleSummary) {
        info!(
            "Cycle completed in {:.2}s: {} listed, {} new, {} known, {} failed, {} public repos",
            summary.duration.as_secs_f64(),
            summary.listed,
            summary.reconcile.new,
            summary.reconcile.known,
            summary.reconcile.failed,
            summary.public_repos
        );
        if summary.reconcile.failed > 0 {
            warn!(
                "{} repositories could not be recorded and will be retried next cycle",
                summary.reconcile.failed
            );
        }
        debug!(
            "Cycles: {} total, {} successful, {} failed; counter at {}",
            self.status.total_cycles,
            self.status.successful_cycles,
            self.status.failed_cycles,
            self.counter.get()
        );
    }

    fn is_fatal(&self, err: &CycleError) -> bool {
        match self.policy {
            ErrorPolicy::Abort => true,
            ErrorPolicy::Skip => !err.source.is_retryable(),
        }
    }

    fn log_cycle_failure(&self, err: &CycleError, fatal: bool) {
        if !fatal {
            error!("{}; retrying in {:?}", err, self.interval);
        } else if self.policy == ErrorPolicy::Skip {
            error!("{}; error is not retryable, stopping", err);
        } else {
            error!("{}; stopping", err);
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("Ctrl+C received"),
        _ = terminate => debug!("SIGTERM received"),
    }
}

/// Spawn a task that broadcasts shutdown when a process signal arrives
pub fn spawn_signal_handler(shutdown_sender: broadcast::Sender<()>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping...");
        let _ = shutdown_sender.send(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CycleStage, FetchError, FetchResult};
    use crate::github::{AccountSummary, Entry};
    use crate::notify::WriterNotifier;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves one scripted listing per cycle; `None` fails the listing with
    /// `failure`. Sends shutdown once the script runs out.
    struct ScriptedSource {
        cycles: Mutex<VecDeque<Option<Vec<Entry>>>>,
        current: Mutex<Vec<Entry>>,
        failure: fn(&str) -> FetchError,
        shutdown: Option<broadcast::Sender<()>>,
    }

    impl ScriptedSource {
        fn new(cycles: Vec<Option<Vec<Entry>>>) -> Self {
            Self {
                cycles: Mutex::new(cycles.into()),
                current: Mutex::new(Vec::new()),
                failure: unavailable,
                shutdown: None,
            }
        }

        fn failing_with(mut self, failure: fn(&str) -> FetchError) -> Self {
            self.failure = failure;
            self
        }

        fn stopping(mut self, sender: broadcast::Sender<()>) -> Self {
            self.shutdown = Some(sender);
            self
        }

        fn stop_if_done(&self) {
            if self.cycles.lock().unwrap().is_empty() {
                if let Some(sender) = &self.shutdown {
                    let _ = sender.send(());
                }
            }
        }
    }

    fn unavailable(url: &str) -> FetchError {
        FetchError::Status {
            url: url.to_string(),
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn rate_limited(url: &str) -> FetchError {
        FetchError::Status {
            url: url.to_string(),
            status: reqwest::StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn not_found(url: &str) -> FetchError {
        FetchError::Status {
            url: url.to_string(),
            status: reqwest::StatusCode::NOT_FOUND,
        }
    }

    fn malformed(url: &str) -> FetchError {
        FetchError::Decode {
            url: url.to_string(),
            source: serde_json::from_str::<Vec<Entry>>("<html>").unwrap_err(),
        }
    }

    #[async_trait]
    impl RepoSource for ScriptedSource {
        async fn fetch_page(&self, _account: &str, page: usize) -> FetchResult<Vec<Entry>> {
            assert_eq!(page, 0, "scripted listings fit on one page");
            let next = self.cycles.lock().unwrap().pop_front().flatten();
            match next {
                Some(entries) => {
                    *self.current.lock().unwrap() = entries.clone();
                    Ok(entries)
                }
                None => {
                    self.stop_if_done();
                    Err((self.failure)("/users/alice/repos"))
                }
            }
        }

        async fn fetch_summary(&self, account: &str) -> FetchResult<AccountSummary> {
            let public_repos = self.current.lock().unwrap().len() as u64;
            self.stop_if_done();
            Ok(AccountSummary {
                login: account.to_string(),
                public_repos,
            })
        }
    }

    fn config(policy: ErrorPolicy) -> Config {
        let mut config = Config::default();
        config.account = "alice".to_string();
        config.interval = "1s".to_string();
        config.on_fetch_error = policy;
        config
    }

    fn daemon(
        config: &Config,
        source: ScriptedSource,
    ) -> Daemon<ScriptedSource, WriterNotifier<Vec<u8>>> {
        Daemon::new(
            config,
            source,
            RepoStore::open_in_memory().unwrap(),
            WriterNotifier::new(Vec::new()),
            RepoCounter::new(),
        )
        .unwrap()
    }

    fn output<S>(daemon: &Daemon<S, WriterNotifier<Vec<u8>>>) -> String
    where
        S: RepoSource,
    {
        String::from_utf8(daemon.notifier().get_ref().clone()).unwrap()
    }

    fn first_cycle() -> Vec<Entry> {
        vec![
            Entry::new("a/1", "2020-01-01"),
            Entry::new("a/2", "2020-06-01"),
        ]
    }

    fn second_cycle() -> Vec<Entry> {
        let mut entries = first_cycle();
        entries.push(Entry::new("a/3", "2021-01-01"));
        entries
    }

    #[test]
    fn test_new_requires_account() {
        let result = Daemon::new(
            &Config::default(),
            ScriptedSource::new(vec![]),
            RepoStore::open_in_memory().unwrap(),
            WriterNotifier::new(Vec::new()),
            RepoCounter::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cycles_announce_only_new_repositories() {
        let source = ScriptedSource::new(vec![Some(first_cycle()), Some(second_cycle())]);
        let mut daemon = daemon(&config(ErrorPolicy::Abort), source);

        let first = daemon.run_cycle().await.unwrap();
        assert_eq!(first.listed, 2);
        assert_eq!(first.reconcile.new, 2);
        assert_eq!(first.public_repos, 2);

        let second = daemon.run_cycle().await.unwrap();
        assert_eq!(second.reconcile.new, 1);
        assert_eq!(second.reconcile.known, 2);

        assert_eq!(
            output(&daemon),
            "2020-01-01 repository a/1 created\n\
             2020-06-01 repository a/2 created\n\
             2021-01-01 repository a/3 created\n"
        );
        assert_eq!(daemon.store().len("alice").unwrap(), 3);
        assert_eq!(daemon.counter.get(), 5);
        assert_eq!(daemon.status().successful_cycles, 2);
        assert_eq!(daemon.status().announced, 3);
    }

    #[tokio::test]
    async fn test_failed_listing_leaves_store_and_counter_untouched() {
        let source = ScriptedSource::new(vec![None]);
        let mut daemon = daemon(&config(ErrorPolicy::Skip), source);

        let err = daemon.run_cycle().await.unwrap_err();
        assert_eq!(err.stage, CycleStage::Listing);
        assert_matches!(err.source, FetchError::Status { .. });
        assert!(daemon.store().is_empty("alice").unwrap());
        assert_eq!(daemon.counter.get(), 0);
        assert_eq!(daemon.status().failed_cycles, 1);
    }

    #[tokio::test]
    async fn test_abort_policy_stops_on_first_failure() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![None, Some(first_cycle())]);
        let mut daemon = daemon(&config(ErrorPolicy::Abort), source);

        let err = daemon.run(receiver).await.unwrap_err();
        let cycle_err = err.downcast_ref::<CycleError>().expect("cycle error");
        assert_eq!(cycle_err.stage, CycleStage::Listing);
        assert_eq!(daemon.status().state, DaemonState::Stopped);
        assert_eq!(daemon.status().total_cycles, 1);
        drop(sender);
    }

    #[tokio::test]
    async fn test_skip_policy_retries_next_interval() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![None, Some(first_cycle())]).stopping(sender);
        let mut daemon = daemon(&config(ErrorPolicy::Skip), source);

        daemon.run(receiver).await.unwrap();

        let status = daemon.status();
        assert_eq!(status.state, DaemonState::Stopped);
        assert_eq!(status.failed_cycles, 1);
        assert_eq!(status.successful_cycles, 1);
        assert_eq!(daemon.store().len("alice").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_skip_policy_retries_rate_limiting() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![None, Some(first_cycle())])
            .failing_with(rate_limited)
            .stopping(sender);
        let mut daemon = daemon(&config(ErrorPolicy::Skip), source);

        daemon.run(receiver).await.unwrap();

        assert_eq!(daemon.status().failed_cycles, 1);
        assert_eq!(daemon.status().successful_cycles, 1);
    }

    #[tokio::test]
    async fn test_skip_policy_stops_on_unknown_account() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![None, Some(first_cycle())]).failing_with(not_found);
        let mut daemon = daemon(&config(ErrorPolicy::Skip), source);

        let err = daemon.run(receiver).await.unwrap_err();
        let cycle_err = err.downcast_ref::<CycleError>().expect("cycle error");
        assert_matches!(
            cycle_err.source,
            FetchError::Status { status, .. } if status == reqwest::StatusCode::NOT_FOUND
        );
        assert_eq!(daemon.status().state, DaemonState::Stopped);
        assert_eq!(daemon.status().total_cycles, 1);
        drop(sender);
    }

    #[tokio::test]
    async fn test_skip_policy_stops_on_malformed_payload() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![None, Some(first_cycle())]).failing_with(malformed);
        let mut daemon = daemon(&config(ErrorPolicy::Skip), source);

        let err = daemon.run(receiver).await.unwrap_err();
        let cycle_err = err.downcast_ref::<CycleError>().expect("cycle error");
        assert_matches!(cycle_err.source, FetchError::Decode { .. });
        assert_eq!(daemon.status().total_cycles, 1);
        assert!(daemon.store().is_empty("alice").unwrap());
        drop(sender);
    }

    #[tokio::test]
    async fn test_stopped_daemon_does_not_run_again() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![None, Some(first_cycle())]);
        let mut daemon = daemon(&config(ErrorPolicy::Abort), source);

        daemon.run(receiver).await.unwrap_err();
        assert_eq!(daemon.status().state, DaemonState::Stopped);

        let err = daemon.run(sender.subscribe()).await.unwrap_err();
        assert!(err.to_string().contains("already stopped"));
        assert_eq!(daemon.status().state, DaemonState::Stopped);
        assert_eq!(daemon.status().total_cycles, 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_cycle_stops_after_it_completes() {
        let (sender, receiver) = broadcast::channel(1);
        let source = ScriptedSource::new(vec![Some(first_cycle())]).stopping(sender);
        let mut daemon = daemon(&config(ErrorPolicy::Skip), source);

        daemon.run(receiver).await.unwrap();

        assert_eq!(daemon.status().total_cycles, 1);
        assert_eq!(daemon.store().len("alice").unwrap(), 2);
    }
}
