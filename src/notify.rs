//! Announcements for newly discovered repositories

use anyhow::{Context, Result};
use std::io::{self, Write};

use crate::github::Entry;

/// Receives each repository the first time it is seen
///
/// Returning an error tells the caller the announcement did not go out, so
/// the repository must not be recorded as seen.
pub trait Notifier {
    fn notify(&mut self, entry: &Entry) -> Result<()>;
}

/// The announcement line for a new repository
pub fn notification_line(entry: &Entry) -> String {
    format!("{} repository {} created", entry.created_at, entry.full_name)
}

/// Writes announcements to any [`Write`] sink, one line each, flushing after
/// every line.
pub struct WriterNotifier<W: Write> {
    out: W,
}

impl<W: Write> WriterNotifier<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Notifier for WriterNotifier<W> {
    fn notify(&mut self, entry: &Entry) -> Result<()> {
        writeln!(self.out, "{}", notification_line(entry))
            .with_context(|| format!("Failed to announce {}", entry.full_name))?;
        self.out
            .flush()
            .with_context(|| format!("Failed to flush announcement for {}", entry.full_name))?;
        Ok(())
    }
}

/// Announces on standard output
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&mut self, entry: &Entry) -> Result<()> {
        WriterNotifier::new(io::stdout().lock()).notify(entry)
    }
}
