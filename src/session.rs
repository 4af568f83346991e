//! The session runtime: one authenticated connection driving one
//! adventure.
//!
//! [`AdventureSession::run`] is the event loop. It multiplexes three
//! sources: inbound client messages, events from the active narrator
//! turn, and the turn deadline. The loop is strictly single-turn; a
//! second `player_input` while one is streaming is rejected rather
//! than interleaved.

use crate::adventure::{EntryKind, Theme};
use crate::executor::{ExecutorError, TurnEvent, TurnExecutor, TurnRequest, TurnStream};
use crate::id::MessageId;
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::store::{AdventureStore, LoadError, LoadedAdventure, SaveError};
use crate::turn::{TurnCoordinator, TurnEnd, TurnPhase};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors from session-level operations invoked by the embedding
/// application (not the wire).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no adventure loaded")]
    NotLoaded,

    #[error(transparent)]
    Save(#[from] SaveError),
}

/// Session runtime settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long one narrator turn may run before it is abandoned with
    /// a `processing_timeout` error.
    pub turn_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(120),
        }
    }
}

impl SessionConfig {
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }
}

struct ActiveTurn {
    message_id: MessageId,
    stream: TurnStream,
    deadline: Instant,
    abort_tx: watch::Sender<bool>,
}

enum Step {
    Client(Option<ClientMessage>),
    Turn(Option<TurnEvent>),
    Deadline,
}

/// One client's session against one adventure.
pub struct AdventureSession {
    store: AdventureStore,
    executor: Arc<dyn TurnExecutor>,
    outbound: mpsc::Sender<ServerMessage>,
    config: SessionConfig,
    adventure: Option<LoadedAdventure>,
    coordinator: TurnCoordinator,
    active: Option<ActiveTurn>,
    last_input: Option<String>,
}

impl AdventureSession {
    pub fn new(
        store: AdventureStore,
        executor: Arc<dyn TurnExecutor>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            store,
            executor,
            outbound,
            config: SessionConfig::default(),
            adventure: None,
            coordinator: TurnCoordinator::new(),
            active: None,
            last_input: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// The loaded adventure handle, if authentication has succeeded.
    /// This is how the panel subsystem reaches the panel accessors.
    pub fn adventure(&self) -> Option<&LoadedAdventure> {
        self.adventure.as_ref()
    }

    /// The most recent player input, kept until a turn completes so a
    /// retryable failure can be resubmitted.
    pub fn last_input(&self) -> Option<&str> {
        self.last_input.as_deref()
    }

    /// Drive the session until the inbound channel closes. Joins any
    /// in-flight compaction before returning.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>) {
        loop {
            let step = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    msg = inbound.recv() => Step::Client(msg),
                    event = active.stream.next() => Step::Turn(event),
                    _ = tokio::time::sleep_until(active.deadline) => Step::Deadline,
                },
                None => Step::Client(inbound.recv().await),
            };

            match step {
                Step::Client(Some(msg)) => self.handle_client(msg).await,
                Step::Client(None) => break,
                Step::Turn(Some(event)) => self.handle_turn_event(event).await,
                Step::Turn(None) => self.turn_stream_ended().await,
                Step::Deadline => self.turn_timed_out().await,
            }
        }
        self.shutdown().await;
    }

    /// Persist a new theme and announce it to the client.
    pub async fn change_theme(
        &self,
        theme: Theme,
        transition: Option<Duration>,
    ) -> Result<(), SessionError> {
        let adventure = self.adventure.clone().ok_or(SessionError::NotLoaded)?;
        adventure.set_theme(theme.clone()).await?;
        self.send(ServerMessage::ThemeChange {
            mood: theme.mood,
            genre: theme.genre,
            region: theme.region,
            background_url: theme.background_url,
            transition_duration_ms: transition.map(|d| d.as_millis() as u64),
        })
        .await;
        Ok(())
    }

    async fn handle_client(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Authenticate { token, adventure_id } => {
                self.authenticate(&adventure_id, &token).await
            }
            ClientMessage::PlayerInput { text } => self.player_input(text).await,
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
            ClientMessage::Abort => self.abort_turn(),
            ClientMessage::Recap => self.recap().await,
        }
    }

    async fn authenticate(&mut self, adventure_id: &str, token: &str) {
        if self.active.is_some() {
            self.send(ServerMessage::error(
                ErrorCode::RateLimited,
                "cannot re-authenticate while a turn is streaming",
            ))
            .await;
            return;
        }

        match self.store.load(adventure_id, token).await {
            Ok(loaded) => {
                let history = loaded.history().await;
                self.adventure = Some(loaded);
                self.send(ServerMessage::AdventureLoaded {
                    history: history.entries,
                    summary: history.summary,
                })
                .await;
            }
            Err(LoadError::NotFound) => {
                self.send(ServerMessage::error(
                    ErrorCode::AdventureNotFound,
                    "no adventure with that id",
                ))
                .await;
            }
            Err(LoadError::InvalidToken) => {
                self.send(ServerMessage::error(
                    ErrorCode::InvalidSession,
                    "the session token does not match this adventure",
                ))
                .await;
            }
            Err(LoadError::Corrupted { path, reason }) => {
                self.send(ServerMessage::error_with_details(
                    ErrorCode::CorruptedState,
                    "the adventure's save data is corrupted",
                    format!("{}: {reason}", path.display()),
                ))
                .await;
            }
        }
    }

    async fn player_input(&mut self, text: String) {
        if self.active.is_some() || self.coordinator.phase() != TurnPhase::Idle {
            self.send(ServerMessage::error(
                ErrorCode::RateLimited,
                "a narrator turn is already in flight",
            ))
            .await;
            return;
        }
        let Some(adventure) = self.adventure.clone() else {
            self.send(ServerMessage::error(
                ErrorCode::InvalidSession,
                "authenticate before sending input",
            ))
            .await;
            return;
        };

        self.last_input = Some(text.clone());
        if let Err(e) = adventure.append_history(EntryKind::PlayerInput, &text).await {
            self.send(ServerMessage::error_with_details(
                ErrorCode::TurnFailed,
                "failed to record your input",
                e.to_string(),
            ))
            .await;
            return;
        }

        let message_id = MessageId::new();
        let (abort_tx, abort_rx) = watch::channel(false);
        let agent_session_id = adventure.state().await.agent_session_id;

        match self
            .executor
            .execute(TurnRequest {
                message_id,
                input: text,
                agent_session_id,
                abort: abort_rx,
            })
            .await
        {
            Ok(stream) => {
                if let Err(e) = self.coordinator.begin(message_id) {
                    // Unreachable given the phase check above.
                    warn!(error = %e, "coordinator refused a fresh turn");
                    return;
                }
                self.send(ServerMessage::GmResponseStart { message_id }).await;
                self.active = Some(ActiveTurn {
                    message_id,
                    stream,
                    deadline: Instant::now() + self.config.turn_timeout,
                    abort_tx,
                });
            }
            Err(ExecutorError::Unavailable(reason)) => {
                self.send(ServerMessage::error_with_details(
                    ErrorCode::TurnFailed,
                    "the narrator is unavailable",
                    reason,
                ))
                .await;
            }
        }
    }

    async fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            // The turn was opened when the stream was issued.
            TurnEvent::Started { .. } => {}
            TurnEvent::Chunk { message_id, text } => {
                if self.coordinator.chunk(message_id, &text) {
                    self.send(ServerMessage::GmResponseChunk { message_id, text })
                        .await;
                }
            }
            TurnEvent::Tool { state, description } => {
                self.send(ServerMessage::ToolStatus { state, description })
                    .await;
            }
            TurnEvent::Completed {
                message_id,
                agent_session_id,
            } => match self.coordinator.end(message_id) {
                TurnEnd::Finalized(text) => {
                    self.finalize_turn(message_id, text, agent_session_id).await
                }
                TurnEnd::Stale => {}
            },
            TurnEvent::Failed {
                message_id,
                reason,
                retryable,
            } => {
                if self.coordinator.error(message_id) {
                    self.active = None;
                    self.send(ServerMessage::Error {
                        code: ErrorCode::TurnFailed,
                        message: reason,
                        retryable,
                        technical_details: None,
                    })
                    .await;
                }
            }
        }
    }

    async fn finalize_turn(
        &mut self,
        message_id: MessageId,
        text: String,
        agent_session_id: Option<String>,
    ) {
        self.active = None;

        let Some(adventure) = self.adventure.clone() else {
            return;
        };
        if !text.is_empty() {
            if let Err(e) = adventure.append_history(EntryKind::GmResponse, &text).await {
                self.send(ServerMessage::error_with_details(
                    ErrorCode::TurnFailed,
                    "failed to record the narrator's reply",
                    e.to_string(),
                ))
                .await;
                return;
            }
        }
        if let Some(id) = agent_session_id {
            if let Err(e) = adventure.set_agent_session_id(&id).await {
                warn!(error = %e, "failed to persist narrator continuity id");
            }
        }

        self.last_input = None;
        self.send(ServerMessage::GmResponseEnd { message_id }).await;
    }

    fn abort_turn(&mut self) {
        if self.coordinator.abort() {
            if let Some(active) = &self.active {
                let _ = active.abort_tx.send(true);
                debug!(message_id = %active.message_id, "abort requested, awaiting terminal event");
            }
        }
    }

    async fn turn_stream_ended(&mut self) {
        if let Some(message_id) = self.coordinator.active_message_id() {
            self.coordinator.error(message_id);
        }
        self.active = None;
        self.send(ServerMessage::error(
            ErrorCode::TurnFailed,
            "the narrator stream ended unexpectedly",
        ))
        .await;
    }

    async fn turn_timed_out(&mut self) {
        if let Some(active) = &self.active {
            let _ = active.abort_tx.send(true);
            debug!(message_id = %active.message_id, "turn deadline expired");
        }
        self.coordinator.reset();
        self.active = None;
        self.send(ServerMessage::error(
            ErrorCode::ProcessingTimeout,
            "the narrator took too long to respond",
        ))
        .await;
    }

    async fn recap(&mut self) {
        let Some(adventure) = self.adventure.clone() else {
            self.send(ServerMessage::RecapError {
                reason: "no adventure loaded".to_string(),
            })
            .await;
            return;
        };

        self.send(ServerMessage::RecapStarted).await;
        let history = adventure.history().await;
        self.send(ServerMessage::RecapComplete {
            history: history.entries,
            summary: history.summary,
        })
        .await;
    }

    async fn shutdown(&mut self) {
        if let Some(active) = &self.active {
            let _ = active.abort_tx.send(true);
        }
        // A save already underway runs to completion; only the
        // background compaction needs an explicit join.
        if let Some(adventure) = &self.adventure {
            adventure.await_compaction().await;
        }
    }

    async fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            debug!("outbound channel closed, dropping server message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adventure::NarrativeHistory;
    use crate::testing::{MockExecutor, ScriptedTurn};
    use async_trait::async_trait;
    use futures::stream;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Harness {
        _base: TempDir,
        store: AdventureStore,
        adventure_id: String,
        token: String,
        inbound: mpsc::Sender<ClientMessage>,
        outbound: mpsc::Receiver<ServerMessage>,
        session: JoinHandle<()>,
    }

    async fn harness(executor: Arc<dyn TurnExecutor>, config: SessionConfig) -> Harness {
        let base = TempDir::new().unwrap();
        let store = AdventureStore::new(base.path());
        let created = store.create(None).await.unwrap();
        let state = created.state().await;
        drop(created);

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(64);
        let session = AdventureSession::new(store.clone(), executor, out_tx).with_config(config);
        let handle = tokio::spawn(session.run(in_rx));

        Harness {
            _base: base,
            store,
            adventure_id: state.id.to_string(),
            token: state.session_token,
            inbound: in_tx,
            outbound: out_rx,
            session: handle,
        }
    }

    impl Harness {
        async fn send(&self, msg: ClientMessage) {
            self.inbound.send(msg).await.unwrap();
        }

        async fn recv(&mut self) -> ServerMessage {
            self.outbound.recv().await.expect("outbound channel closed")
        }

        async fn authenticate(&mut self) {
            self.send(ClientMessage::Authenticate {
                token: self.token.clone(),
                adventure_id: self.adventure_id.clone(),
            })
            .await;
            match self.recv().await {
                ServerMessage::AdventureLoaded { .. } => {}
                other => panic!("expected AdventureLoaded, got {other:?}"),
            }
        }

        async fn finish(mut self) -> NarrativeHistory {
            drop(self.inbound);
            self.session.await.unwrap();
            let loaded = self.store.load(&self.adventure_id, &self.token).await.unwrap();
            let history = loaded.history().await;
            // Keep the temp dir on disk so a caller that loads again after
            // `finish` (the store is cloned out first) still sees the files.
            let _ = self._base.keep();
            history
        }
    }

    struct FnExecutor<F>(F);

    #[async_trait]
    impl<F> TurnExecutor for FnExecutor<F>
    where
        F: Fn(TurnRequest) -> TurnStream + Send + Sync,
    {
        async fn execute(&self, request: TurnRequest) -> Result<TurnStream, ExecutorError> {
            Ok((self.0)(request))
        }
    }

    #[tokio::test]
    async fn test_authenticate_failures() {
        let executor = Arc::new(MockExecutor::new(vec![]));
        let mut h = harness(executor, SessionConfig::default()).await;

        h.send(ClientMessage::Authenticate {
            token: "wrong".to_string(),
            adventure_id: h.adventure_id.clone(),
        })
        .await;
        match h.recv().await {
            ServerMessage::Error { code, retryable, .. } => {
                assert_eq!(code, ErrorCode::InvalidSession);
                assert!(!retryable);
            }
            other => panic!("expected Error, got {other:?}"),
        }

        h.send(ClientMessage::Authenticate {
            token: h.token.clone(),
            adventure_id: "nonexistent".to_string(),
        })
        .await;
        match h.recv().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::AdventureNotFound),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_turn_round_trip() {
        let executor = Arc::new(MockExecutor::new(vec![ScriptedTurn::narrative(vec![
            "The door ",
            "swings open.",
        ])]));
        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "I open the door".to_string(),
        })
        .await;

        let start_id = match h.recv().await {
            ServerMessage::GmResponseStart { message_id } => message_id,
            other => panic!("expected GmResponseStart, got {other:?}"),
        };
        let mut streamed = String::new();
        loop {
            match h.recv().await {
                ServerMessage::GmResponseChunk { message_id, text } => {
                    assert_eq!(message_id, start_id);
                    streamed.push_str(&text);
                }
                ServerMessage::GmResponseEnd { message_id } => {
                    assert_eq!(message_id, start_id);
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(streamed, "The door swings open.");

        let history = h.finish().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries[0].kind, EntryKind::PlayerInput);
        assert_eq!(history.entries[0].content, "I open the door");
        assert_eq!(history.entries[1].kind, EntryKind::GmResponse);
        assert_eq!(history.entries[1].content, "The door swings open.");
    }

    #[tokio::test]
    async fn test_input_before_authentication_rejected() {
        let executor = Arc::new(MockExecutor::new(vec![]));
        let mut h = harness(executor, SessionConfig::default()).await;

        h.send(ClientMessage::PlayerInput {
            text: "hello?".to_string(),
        })
        .await;
        match h.recv().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidSession),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_and_recap() {
        let executor = Arc::new(MockExecutor::new(vec![ScriptedTurn::narrative(vec!["Hi."])]));
        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::Ping).await;
        assert!(matches!(h.recv().await, ServerMessage::Pong));

        h.send(ClientMessage::Recap).await;
        assert!(matches!(h.recv().await, ServerMessage::RecapStarted));
        match h.recv().await {
            ServerMessage::RecapComplete { history, .. } => assert!(history.is_empty()),
            other => panic!("expected RecapComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recap_without_adventure() {
        let executor = Arc::new(MockExecutor::new(vec![]));
        let mut h = harness(executor, SessionConfig::default()).await;

        h.send(ClientMessage::Recap).await;
        assert!(matches!(h.recv().await, ServerMessage::RecapError { .. }));
    }

    #[tokio::test]
    async fn test_turn_failure_keeps_input_retryable() {
        let executor = Arc::new(MockExecutor::new(vec![
            ScriptedTurn::failing("model overloaded"),
            ScriptedTurn::narrative(vec!["Second attempt lands."]),
        ]));
        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "I try the rope bridge".to_string(),
        })
        .await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseStart { .. }));
        match h.recv().await {
            ServerMessage::Error { code, retryable, message, .. } => {
                assert_eq!(code, ErrorCode::TurnFailed);
                assert!(retryable);
                assert_eq!(message, "model overloaded");
            }
            other => panic!("expected Error, got {other:?}"),
        }

        // Client-initiated retry of the same input succeeds.
        h.send(ClientMessage::PlayerInput {
            text: "I try the rope bridge".to_string(),
        })
        .await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseStart { .. }));
        assert!(matches!(h.recv().await, ServerMessage::GmResponseChunk { .. }));
        assert!(matches!(h.recv().await, ServerMessage::GmResponseEnd { .. }));

        let history = h.finish().await;
        // Both submissions persisted as inputs, one narrator reply.
        let kinds: Vec<_> = history.entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::PlayerInput, EntryKind::PlayerInput, EntryKind::GmResponse]
        );
    }

    #[tokio::test]
    async fn test_concurrent_input_rejected_and_abort_finalizes_partial() {
        // A turn that streams one chunk, then completes only once the
        // abort signal flips.
        let executor = Arc::new(FnExecutor(|req: TurnRequest| -> TurnStream {
            let id = req.message_id;
            let mut abort = req.abort.clone();
            Box::pin(
                stream::iter(vec![
                    TurnEvent::Started { message_id: id },
                    TurnEvent::Chunk {
                        message_id: id,
                        text: "You step into".to_string(),
                    },
                ])
                .chain(stream::once(async move {
                    while !*abort.borrow() {
                        if abort.changed().await.is_err() {
                            break;
                        }
                    }
                    TurnEvent::Completed {
                        message_id: id,
                        agent_session_id: None,
                    }
                })),
            )
        }));

        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "I enter".to_string(),
        })
        .await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseStart { .. }));
        assert!(matches!(h.recv().await, ServerMessage::GmResponseChunk { .. }));

        // A second input while streaming is a protocol violation.
        h.send(ClientMessage::PlayerInput {
            text: "I also do this".to_string(),
        })
        .await;
        match h.recv().await {
            ServerMessage::Error { code, retryable, .. } => {
                assert_eq!(code, ErrorCode::RateLimited);
                assert!(retryable);
            }
            other => panic!("expected Error, got {other:?}"),
        }

        // Abort; the executor answers with a terminal end, which
        // finalizes the frozen partial content.
        h.send(ClientMessage::Abort).await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseEnd { .. }));

        let history = h.finish().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries[1].content, "You step into");
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timeout_surfaces_distinct_error() {
        let executor = Arc::new(FnExecutor(|req: TurnRequest| -> TurnStream {
            let id = req.message_id;
            Box::pin(
                stream::iter(vec![TurnEvent::Started { message_id: id }])
                    .chain(stream::pending()),
            )
        }));

        let config = SessionConfig::default().with_turn_timeout(Duration::from_millis(200));
        let mut h = harness(executor, config).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "anyone there?".to_string(),
        })
        .await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseStart { .. }));
        match h.recv().await {
            ServerMessage::Error { code, retryable, .. } => {
                assert_eq!(code, ErrorCode::ProcessingTimeout);
                assert!(retryable);
            }
            other => panic!("expected Error, got {other:?}"),
        }

        // Input reopens after the timeout.
        h.send(ClientMessage::Ping).await;
        assert!(matches!(h.recv().await, ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_unexpected_stream_end_reported() {
        let executor = Arc::new(FnExecutor(|req: TurnRequest| -> TurnStream {
            let id = req.message_id;
            Box::pin(stream::iter(vec![
                TurnEvent::Started { message_id: id },
                TurnEvent::Chunk {
                    message_id: id,
                    text: "and then".to_string(),
                },
            ]))
        }));

        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "go on".to_string(),
        })
        .await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseStart { .. }));
        assert!(matches!(h.recv().await, ServerMessage::GmResponseChunk { .. }));
        match h.recv().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::TurnFailed),
            other => panic!("expected Error, got {other:?}"),
        }

        // The partial content was discarded.
        let history = h.finish().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history.entries[0].kind, EntryKind::PlayerInput);
    }

    #[tokio::test]
    async fn test_tool_status_forwarded() {
        use crate::protocol::ToolState;

        let executor = Arc::new(MockExecutor::new(vec![ScriptedTurn::narrative(vec![
            "You rolled a 17.",
        ])
        .with_tool(ToolState::Running, "Rolling a d20")]));
        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "I roll for perception".to_string(),
        })
        .await;
        assert!(matches!(h.recv().await, ServerMessage::GmResponseStart { .. }));
        match h.recv().await {
            ServerMessage::ToolStatus { state, description } => {
                assert_eq!(state, ToolState::Running);
                assert_eq!(description, "Rolling a d20");
            }
            other => panic!("expected ToolStatus, got {other:?}"),
        }
        assert!(matches!(h.recv().await, ServerMessage::GmResponseChunk { .. }));
        assert!(matches!(h.recv().await, ServerMessage::GmResponseEnd { .. }));
    }

    #[tokio::test]
    async fn test_continuity_id_persisted_after_turn() {
        let executor = Arc::new(MockExecutor::new(vec![ScriptedTurn::narrative(vec![
            "Welcome back.",
        ])
        .with_agent_session_id("narrator-session-9")]));
        let mut h = harness(executor, SessionConfig::default()).await;
        h.authenticate().await;

        h.send(ClientMessage::PlayerInput {
            text: "hello".to_string(),
        })
        .await;
        loop {
            if matches!(h.recv().await, ServerMessage::GmResponseEnd { .. }) {
                break;
            }
        }

        let store = h.store.clone();
        let (id, token) = (h.adventure_id.clone(), h.token.clone());
        h.finish().await;
        let loaded = store.load(&id, &token).await.unwrap();
        assert_eq!(
            loaded.state().await.agent_session_id.as_deref(),
            Some("narrator-session-9")
        );
    }
}
