//! Testing utilities for the session runtime.
//!
//! This module provides scripted stand-ins for the external
//! collaborators, for deterministic integration tests without a live
//! narrator or summarizer:
//! - [`MockExecutor`] plays back scripted turns as event streams
//! - [`MockCompactor`] retains the requested entry count and can be
//!   gated to hold a compaction open mid-run

use crate::compaction::{CompactionRequest, CompactionResult, Compactor};
use crate::executor::{ExecutorError, TurnEvent, TurnExecutor, TurnRequest, TurnStream};
use crate::id::MessageId;
use crate::protocol::ToolState;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One scripted narrator turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    chunks: Vec<String>,
    tools: Vec<(ToolState, String)>,
    outcome: Outcome,
}

#[derive(Debug, Clone)]
enum Outcome {
    Complete { agent_session_id: Option<String> },
    Fail { reason: String, retryable: bool },
}

impl ScriptedTurn {
    /// A turn that streams the given chunks and completes.
    pub fn narrative<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            tools: Vec::new(),
            outcome: Outcome::Complete {
                agent_session_id: None,
            },
        }
    }

    /// A turn that starts and then fails with a retryable error.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            tools: Vec::new(),
            outcome: Outcome::Fail {
                reason: reason.into(),
                retryable: true,
            },
        }
    }

    /// Report a narrator continuity id on completion.
    pub fn with_agent_session_id(mut self, id: impl Into<String>) -> Self {
        if let Outcome::Complete { agent_session_id } = &mut self.outcome {
            *agent_session_id = Some(id.into());
        }
        self
    }

    /// Emit a tool status event before the narrative chunks.
    pub fn with_tool(mut self, state: ToolState, description: impl Into<String>) -> Self {
        self.tools.push((state, description.into()));
        self
    }

    fn into_events(self, message_id: MessageId) -> Vec<TurnEvent> {
        let mut events = vec![TurnEvent::Started { message_id }];
        for (state, description) in self.tools {
            events.push(TurnEvent::Tool { state, description });
        }
        for text in self.chunks {
            events.push(TurnEvent::Chunk { message_id, text });
        }
        events.push(match self.outcome {
            Outcome::Complete { agent_session_id } => TurnEvent::Completed {
                message_id,
                agent_session_id,
            },
            Outcome::Fail { reason, retryable } => TurnEvent::Failed {
                message_id,
                reason,
                retryable,
            },
        });
        events
    }
}

/// A turn executor that plays back scripted turns in order.
pub struct MockExecutor {
    turns: Mutex<VecDeque<ScriptedTurn>>,
}

impl MockExecutor {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    /// Queue another turn.
    pub fn queue(&self, turn: ScriptedTurn) {
        self.turns.lock().expect("scripted turns lock").push_back(turn);
    }
}

#[async_trait]
impl TurnExecutor for MockExecutor {
    async fn execute(&self, request: TurnRequest) -> Result<TurnStream, ExecutorError> {
        let next = self.turns.lock().expect("scripted turns lock").pop_front();
        let message_id = request.message_id;
        let events = match next {
            Some(turn) => turn.into_events(message_id),
            None => vec![
                TurnEvent::Started { message_id },
                TurnEvent::Failed {
                    message_id,
                    reason: "no more scripted turns".to_string(),
                    retryable: false,
                },
            ],
        };
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// A compactor that keeps the requested number of recent entries and
/// summarizes the rest.
///
/// `gated()` makes each run block until [`release`](Self::release) is
/// called, so tests can hold a compaction open while the foreground
/// keeps working.
#[derive(Clone)]
pub struct MockCompactor {
    inner: Arc<CompactorInner>,
}

struct CompactorInner {
    calls: AtomicUsize,
    fail: bool,
    gated: bool,
    started: Notify,
    gate: Notify,
}

impl MockCompactor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompactorInner {
                calls: AtomicUsize::new(0),
                fail: false,
                gated: false,
                started: Notify::new(),
                gate: Notify::new(),
            }),
        }
    }

    /// A compactor whose every run fails.
    pub fn failing() -> Self {
        Self {
            inner: Arc::new(CompactorInner {
                calls: AtomicUsize::new(0),
                fail: true,
                gated: false,
                started: Notify::new(),
                gate: Notify::new(),
            }),
        }
    }

    /// Block each run until released.
    pub fn gated(self) -> Self {
        let inner = CompactorInner {
            calls: AtomicUsize::new(self.inner.calls.load(Ordering::SeqCst)),
            fail: self.inner.fail,
            gated: true,
            started: Notify::new(),
            gate: Notify::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// How many times `compact` has been invoked.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Wait until a gated run has taken its snapshot and entered the
    /// compactor.
    pub async fn wait_until_started(&self) {
        self.inner.started.notified().await;
    }

    /// Let a gated run proceed.
    pub fn release(&self) {
        self.inner.gate.notify_one();
    }

    /// Erase the concrete type for store configuration.
    pub fn into_arc(self) -> Arc<dyn Compactor> {
        Arc::new(self)
    }
}

impl Default for MockCompactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Compactor for MockCompactor {
    async fn compact(&self, request: CompactionRequest) -> CompactionResult {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.started.notify_one();
        if self.inner.gated {
            self.inner.gate.notified().await;
        }

        if self.inner.fail {
            return CompactionResult::failed("scripted compaction failure");
        }

        let keep_from = request.entries.len().saturating_sub(request.retain);
        let retained = request.entries[keep_from..].to_vec();
        let archived = keep_from;
        CompactionResult {
            success: true,
            retained_entries: Some(retained),
            summary: Some(format!("{archived} earlier entries summarized")),
            entries_archived: archived,
            archive_path: None,
            error: None,
        }
    }
}
