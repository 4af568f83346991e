//! Streaming response coordinator.
//!
//! A pure state machine over one narrative turn's lifecycle:
//!
//! ```text
//! Idle -> Streaming -> Idle            (end finalizes)
//! Streaming -> Aborting -> Idle        (terminal event observed)
//! {Streaming|Aborting} -> Idle         (error discards)
//! ```
//!
//! Events are keyed by the server-issued [`MessageId`]; anything keyed
//! to a turn that is no longer active is ignored rather than treated
//! as an error, which tolerates stale messages arriving after a fast
//! abort/retry cycle. The coordinator accumulates text only; the
//! session layer appends the finalized entry to durable storage.

use crate::id::MessageId;
use thiserror::Error;

/// Errors from opening a turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("a turn is already in flight ({0})")]
    TurnInFlight(MessageId),
}

/// Externally visible coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    Aborting,
}

/// Outcome of observing an `end` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnd {
    /// The active turn finished; the accumulated text should become
    /// one `gm_response` history entry.
    Finalized(String),

    /// The event did not belong to the active turn. Duplicate `end`s
    /// land here, which is what makes finalization exactly-once.
    Stale,
}

/// Per-session turn state machine.
#[derive(Debug, Default)]
pub struct TurnCoordinator {
    phase: Phase,
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    Streaming {
        message_id: MessageId,
        buffer: String,
    },
    Aborting {
        message_id: MessageId,
        buffer: String,
    },
}

impl TurnCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> TurnPhase {
        match self.phase {
            Phase::Idle => TurnPhase::Idle,
            Phase::Streaming { .. } => TurnPhase::Streaming,
            Phase::Aborting { .. } => TurnPhase::Aborting,
        }
    }

    /// The id of the turn currently in flight, if any.
    pub fn active_message_id(&self) -> Option<MessageId> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Streaming { message_id, .. } | Phase::Aborting { message_id, .. } => {
                Some(*message_id)
            }
        }
    }

    /// Open a turn. At most one turn may be in flight per session; a
    /// second `begin` is a protocol violation, never an interleave.
    pub fn begin(&mut self, message_id: MessageId) -> Result<(), TurnError> {
        match &self.phase {
            Phase::Idle => {
                self.phase = Phase::Streaming {
                    message_id,
                    buffer: String::new(),
                };
                Ok(())
            }
            Phase::Streaming { message_id: active, .. }
            | Phase::Aborting { message_id: active, .. } => Err(TurnError::TurnInFlight(*active)),
        }
    }

    /// Accumulate a content chunk. Returns whether the chunk was
    /// accepted; chunks for inactive turns and chunks arriving after an
    /// abort are dropped silently.
    pub fn chunk(&mut self, message_id: MessageId, text: &str) -> bool {
        match &mut self.phase {
            Phase::Streaming { message_id: active, buffer } if *active == message_id => {
                buffer.push_str(text);
                true
            }
            _ => false,
        }
    }

    /// Observe an `end` for the given turn.
    ///
    /// For the active streaming turn this finalizes the accumulated
    /// text. After an abort, an explicit `end` still finalizes what was
    /// accumulated up to the abort. Anything else is stale and a no-op.
    pub fn end(&mut self, message_id: MessageId) -> TurnEnd {
        match std::mem::take(&mut self.phase) {
            Phase::Streaming { message_id: active, buffer }
            | Phase::Aborting { message_id: active, buffer }
                if active == message_id =>
            {
                TurnEnd::Finalized(buffer)
            }
            other => {
                self.phase = other;
                TurnEnd::Stale
            }
        }
    }

    /// Request an abort. Only meaningful while streaming; the turn
    /// stays in `Aborting` until a terminating event arrives. Returns
    /// whether the state changed.
    pub fn abort(&mut self) -> bool {
        match std::mem::take(&mut self.phase) {
            Phase::Streaming { message_id, buffer } => {
                self.phase = Phase::Aborting { message_id, buffer };
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// Observe an error for the given turn. Clears any partial content
    /// and reopens input. Returns whether this terminated the active
    /// turn; stale errors are no-ops.
    pub fn error(&mut self, message_id: MessageId) -> bool {
        match std::mem::take(&mut self.phase) {
            Phase::Streaming { message_id: active, .. }
            | Phase::Aborting { message_id: active, .. }
                if active == message_id =>
            {
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// Force the coordinator back to `Idle`, discarding any partial
    /// content. Used for failures not keyed to a message id, such as a
    /// turn deadline expiring.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
    }
}
