//! repowatch - Announces newly created GitHub repositories
//!
//! repowatch polls one GitHub account's public repository listing, keeps a
//! durable ledger of every repository it has ever seen, and prints a line
//! the first time a repository shows up.
//!
//! ## Core Features
//!
//! - **Full listing sweeps**: Every cycle walks all pages of the listing
//! - **Append-only ledger**: SQLite-backed tracked set, one bucket per account
//! - **At-most-once announcements**: Each repository is announced before it
//!   is recorded, in its own transaction
//! - **Metrics**: A cumulative repo counter served on `GET /metrics`
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`github`]: GitHub API access and pagination
//! - [`store`]: Durable tracked set
//! - [`reconcile`]: Diff-and-persist of a listing against the tracked set
//! - [`notify`]: Announcement sinks
//! - [`metrics`]: Repo counter and scrape endpoint
//! - [`daemon`]: Poll loop and shutdown handling

pub mod config;
pub mod daemon;
pub mod error;
pub mod github;
pub mod metrics;
pub mod notify;
pub mod reconcile;
pub mod store;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{CycleError, FetchError};
pub use github::{fetch_all_entries, Entry, GitHubClient, RepoSource};
pub use metrics::RepoCounter;
pub use notify::{Notifier, StdoutNotifier};
pub use reconcile::{reconcile, ReconcileSummary};
pub use store::RepoStore;
