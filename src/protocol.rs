//! Session protocol messages exchanged over the long-lived connection.
//!
//! Both directions are tagged enums serialized as `{"type": ...}`
//! objects. New variants may be added at the end; renaming or removing
//! a variant is a breaking protocol change.

use crate::adventure::{HistorySummary, NarrativeEntry};
use crate::id::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Messages from the client to the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Prove ownership of an adventure and load it.
    Authenticate { token: String, adventure_id: String },
    /// Submit one player turn.
    PlayerInput { text: String },
    /// Liveness probe.
    Ping,
    /// Stop the in-flight narrator turn.
    Abort,
    /// Request a full history resync.
    Recap,
}

/// Messages from the session runtime to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication succeeded; full state follows.
    AdventureLoaded {
        history: Vec<NarrativeEntry>,
        summary: Option<HistorySummary>,
    },
    /// A narrator turn opened under this server-issued id.
    GmResponseStart { message_id: MessageId },
    /// One streamed fragment of the narrator's reply.
    GmResponseChunk { message_id: MessageId, text: String },
    /// The turn finished and its text was recorded.
    GmResponseEnd { message_id: MessageId },
    /// A typed failure. Retryable errors keep the last input available
    /// for a client-initiated retry.
    Error {
        code: ErrorCode,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        technical_details: Option<String>,
    },
    /// Progress of a narrator-side tool invocation.
    ToolStatus { state: ToolState, description: String },
    /// Reply to a liveness probe.
    Pong,
    RecapStarted,
    RecapComplete {
        history: Vec<NarrativeEntry>,
        summary: Option<HistorySummary>,
    },
    RecapError { reason: String },
    /// The scene's theme changed; clients may animate the transition.
    ThemeChange {
        mood: String,
        genre: String,
        region: String,
        background_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transition_duration_ms: Option<u64>,
    },
}

impl ServerMessage {
    /// Build an error message with the code's canonical retryability.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            retryable: code.retryable(),
            code,
            message: message.into(),
            technical_details: None,
        }
    }

    /// Build an error message carrying technical details.
    pub fn error_with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::Error {
            retryable: code.retryable(),
            code,
            message: message.into(),
            technical_details: Some(details.into()),
        }
    }
}

/// Protocol-level error classes surfaced to the client.
///
/// Compaction failures have no code here: they are logged server-side
/// and never interrupt play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AdventureNotFound,
    InvalidSession,
    TurnFailed,
    RateLimited,
    CorruptedState,
    ProcessingTimeout,
}

impl ErrorCode {
    /// Whether the client should offer a one-click retry of the last
    /// input. Non-retryable errors still re-enable input.
    pub fn retryable(self) -> bool {
        match self {
            ErrorCode::AdventureNotFound => false,
            ErrorCode::InvalidSession => false,
            ErrorCode::TurnFailed => true,
            ErrorCode::RateLimited => true,
            ErrorCode::CorruptedState => false,
            ErrorCode::ProcessingTimeout => true,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::AdventureNotFound => "adventure_not_found",
            ErrorCode::InvalidSession => "invalid_session",
            ErrorCode::TurnFailed => "turn_failed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::CorruptedState => "corrupted_state",
            ErrorCode::ProcessingTimeout => "processing_timeout",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle of a narrator-side tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Running,
    Complete,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let msg = ClientMessage::Authenticate {
            token: "tok".to_string(),
            adventure_id: "adv".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "authenticate");
        assert_eq!(json["adventure_id"], "adv");

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_wire_format() {
        let id = MessageId::new();
        let msg = ServerMessage::GmResponseChunk {
            message_id: id,
            text: "The door".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "gm_response_chunk");
        assert_eq!(json["message_id"], id.to_string());
    }

    #[test]
    fn test_error_carries_canonical_retryability() {
        let msg = ServerMessage::error(ErrorCode::RateLimited, "slow down");
        match msg {
            ServerMessage::Error {
                retryable,
                technical_details,
                ..
            } => {
                assert!(retryable);
                assert!(technical_details.is_none());
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_details_omitted_from_wire_when_none() {
        let json =
            serde_json::to_string(&ServerMessage::error(ErrorCode::TurnFailed, "oops")).unwrap();
        assert!(!json.contains("technical_details"));
    }

    #[test]
    fn test_retryability_table() {
        assert!(!ErrorCode::AdventureNotFound.retryable());
        assert!(!ErrorCode::InvalidSession.retryable());
        assert!(!ErrorCode::CorruptedState.retryable());
        assert!(ErrorCode::TurnFailed.retryable());
        assert!(ErrorCode::RateLimited.retryable());
        assert!(ErrorCode::ProcessingTimeout.retryable());
    }

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::ProcessingTimeout).unwrap();
        assert_eq!(json, "\"processing_timeout\"");
    }
}
