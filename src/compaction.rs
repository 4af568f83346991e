//! History compaction: trigger policy, single-flight guard, and
//! result merge.
//!
//! The compactor itself (archival mechanics, the summarization call) is
//! an external collaborator behind the [`Compactor`] trait. This module
//! owns everything around it: when to invoke it, the guarantee that two
//! compactions never overlap for one adventure, and how a finished
//! result is folded back into a history that may have grown in the
//! meantime.

use crate::adventure::{HistorySummary, NarrativeEntry, NarrativeHistory};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Default character threshold before compaction is triggered.
pub const DEFAULT_THRESHOLD_CHARS: usize = 16_000;

/// Default number of recent entries the compactor is asked to retain.
pub const DEFAULT_RETAIN_ENTRIES: usize = 20;

/// Default model identifier handed to the compactor.
pub const DEFAULT_COMPACTION_MODEL: &str = "claude-sonnet-4-20250514";

/// Compaction trigger settings.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Total entry character length at which compaction is invoked.
    pub threshold_chars: usize,

    /// How many recent entries the compactor should keep verbatim.
    pub retain_entries: usize,

    /// Model identifier passed through to the compactor.
    pub model: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_chars: DEFAULT_THRESHOLD_CHARS,
            retain_entries: DEFAULT_RETAIN_ENTRIES,
            model: DEFAULT_COMPACTION_MODEL.to_string(),
        }
    }
}

impl CompactionConfig {
    /// Set the character threshold.
    pub fn with_threshold_chars(mut self, chars: usize) -> Self {
        self.threshold_chars = chars;
        self
    }

    /// Set the retained entry count.
    pub fn with_retain_entries(mut self, entries: usize) -> Self {
        self.retain_entries = entries;
        self
    }

    /// Set the compactor model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Input to one compaction run: a snapshot of the history taken when
/// the run started.
#[derive(Debug, Clone)]
pub struct CompactionRequest {
    pub entries: Vec<NarrativeEntry>,
    pub retain: usize,
    pub model: String,
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    pub success: bool,

    /// Replacement entry list, order preserved. `None` leaves the
    /// entries untouched.
    pub retained_entries: Option<Vec<NarrativeEntry>>,

    /// New summary text. `None` keeps whatever summary already exists.
    pub summary: Option<String>,

    pub entries_archived: usize,

    /// Where the archived entries were written, if anywhere.
    pub archive_path: Option<String>,

    pub error: Option<String>,
}

impl CompactionResult {
    /// A failed run with the given reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// External history compactor.
#[async_trait]
pub trait Compactor: Send + Sync {
    /// Archive old entries and summarize them. Failures are reported
    /// in the result, never panicked.
    async fn compact(&self, request: CompactionRequest) -> CompactionResult;
}

/// Decide whether a history of `content_len` characters is due for
/// compaction.
pub(crate) fn threshold_exceeded(config: &CompactionConfig, content_len: usize) -> bool {
    content_len >= config.threshold_chars
}

/// Fold a finished compaction result into the live history.
///
/// `snapshot_len` is the entry count at the moment the compaction
/// snapshot was taken. The foreground only ever appends, and the
/// single-flight guard keeps other compactions out, so everything past
/// `snapshot_len` arrived during this run and is stitched back on after
/// the retained entries. Returns whether the history changed.
pub(crate) fn merge_result(
    history: &mut NarrativeHistory,
    snapshot_len: usize,
    result: CompactionResult,
) -> bool {
    if !result.success {
        return false;
    }

    let mut changed = false;

    if let Some(retained) = result.retained_entries {
        let appended = history.entries.split_off(snapshot_len.min(history.entries.len()));
        history.entries = retained;
        history.entries.extend(appended);
        changed = true;
    }

    if let Some(text) = result.summary {
        history.summary = Some(HistorySummary {
            text,
            entries_archived: result.entries_archived,
            updated_at: Utc::now(),
        });
        changed = true;
    }

    changed
}

/// Per-adventure single-flight guard and join point for the background
/// compaction task.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    in_flight: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SingleFlight {
    /// Claim the guard. Returns false if a run is already in flight.
    pub(crate) fn try_begin(&self) -> bool {
        !self.in_flight.swap(true, Ordering::SeqCst)
    }

    /// Release the guard at the end of a run.
    pub(crate) fn finish(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Record the task handle for the current run.
    pub(crate) fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock().expect("compaction handle lock") = Some(handle);
    }

    /// Take the current task handle, if any.
    pub(crate) fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().expect("compaction handle lock").take()
    }
}
