//! Interface to the external narrator turn executor.
//!
//! The executor accepts one player input plus the narrator continuity
//! id and emits the start/chunk/end/error sequence for the turn as an
//! event stream. The session runtime issues the `MessageId` up front
//! and every event echoes it, which is what lets stale events from a
//! superseded turn be recognized and dropped.

use crate::id::MessageId;
use crate::protocol::ToolState;
use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::Stream;

/// Errors starting a turn. Failures mid-turn arrive as
/// [`TurnEvent::Failed`] on the stream instead.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("narrator unavailable: {0}")]
    Unavailable(String),
}

/// One turn's worth of work for the executor.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Server-issued id for this turn. Every emitted event must carry it.
    pub message_id: MessageId,

    /// The player's input text.
    pub input: String,

    /// Narrator continuity id from a previous turn, if any.
    pub agent_session_id: Option<String>,

    /// Flips to `true` when the player aborts. Executors should stop
    /// generating and terminate the stream promptly; ignoring it only
    /// wastes work, the runtime discards late content either way.
    pub abort: watch::Receiver<bool>,
}

/// Events emitted while a turn streams.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The executor began generating.
    Started { message_id: MessageId },

    /// One fragment of narrative text.
    Chunk { message_id: MessageId, text: String },

    /// Progress of a narrator-side tool invocation, forwarded to the
    /// client verbatim.
    Tool { state: ToolState, description: String },

    /// The turn finished. `agent_session_id` carries an updated
    /// continuity id when the narrator opened or rotated its session.
    Completed {
        message_id: MessageId,
        agent_session_id: Option<String>,
    },

    /// The turn failed partway through.
    Failed {
        message_id: MessageId,
        reason: String,
        retryable: bool,
    },
}

/// Stream of turn events.
pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send + Sync>>;

/// External narrator turn executor.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    /// Start one turn and return its event stream.
    async fn execute(&self, request: TurnRequest) -> Result<TurnStream, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, ScriptedTurn};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_scripted_turn_event_sequence() {
        let executor = MockExecutor::new(vec![ScriptedTurn::narrative(vec!["The ", "gate ", "opens."])]);
        let (_abort_tx, abort) = watch::channel(false);
        let message_id = MessageId::new();

        let mut stream = executor
            .execute(TurnRequest {
                message_id,
                input: "I push the gate".to_string(),
                agent_session_id: None,
                abort,
            })
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(events.first(), Some(TurnEvent::Started { message_id: m }) if *m == message_id));
        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Chunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["The ", "gate ", "opens."]);
        assert!(matches!(events.last(), Some(TurnEvent::Completed { .. })));
    }
}
