//! Diff-and-persist: compare a fresh listing against the tracked set
//!
//! Every entry gets its own transaction. A new entry is announced first and
//! only recorded once the announcement succeeded, so a failed announcement
//! leaves the entry untracked and it is retried on the next cycle. A crash
//! between announcing and committing can repeat an announcement; it can
//! never drop one.

use anyhow::Result;
use tracing::{debug, warn};

use crate::github::Entry;
use crate::notify::Notifier;
use crate::store::RepoStore;

/// Outcome of reconciling one listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Entries announced and recorded
    pub new: usize,
    /// Entries already tracked
    pub known: usize,
    /// Entries whose announcement or transaction failed
    pub failed: usize,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.new + self.known + self.failed
    }
}

/// Whether an entry was recorded by [`reconcile_entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    New,
    Known,
}

/// Reconcile a single entry in its own transaction
pub fn reconcile_entry(
    store: &mut RepoStore,
    account: &str,
    entry: &Entry,
    notifier: &mut dyn Notifier,
) -> Result<EntryOutcome> {
    store.update(account, |bucket| {
        if bucket.get(&entry.full_name)?.is_some() {
            return Ok(EntryOutcome::Known);
        }

        notifier.notify(entry)?;
        bucket.put(&entry.full_name, &entry.created_at)?;
        Ok(EntryOutcome::New)
    })
}

/// Reconcile a whole listing against the account's bucket.
///
/// Failures are per entry: they are logged and counted, and processing moves
/// on to the next entry.
pub fn reconcile(
    store: &mut RepoStore,
    account: &str,
    entries: &[Entry],
    notifier: &mut dyn Notifier,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();

    for entry in entries {
        match reconcile_entry(store, account, entry, notifier) {
            Ok(EntryOutcome::New) => {
                debug!("Recorded new repository {}", entry.full_name);
                summary.new += 1;
            }
            Ok(EntryOutcome::Known) => summary.known += 1,
            Err(e) => {
                warn!("Failed to reconcile {}: {:#}", entry.full_name, e);
                summary.failed += 1;
            }
        }
    }

    debug!(
        "Reconciled {} entries for {}: {} new",
        summary.total(),
        account,
        summary.new
    );
    summary
}
