//! Session runtime for an AI-narrated adventure engine.
//!
//! This crate provides:
//! - Crash-safe persistence of adventure state and narrative history
//! - The streaming protocol governing one narrator turn's lifecycle
//! - Threshold-triggered background compaction of long histories
//! - Heartbeat liveness detection with full-resync reconnection
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tale_core::{AdventureSession, AdventureStore, ClientMessage};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = AdventureStore::new("./adventures");
//!     let created = store.create(None).await?;
//!     let state = created.state().await;
//!
//!     let (in_tx, in_rx) = mpsc::channel(16);
//!     let (out_tx, mut out_rx) = mpsc::channel(64);
//!     let session = AdventureSession::new(store, narrator(), out_tx);
//!     tokio::spawn(session.run(in_rx));
//!
//!     in_tx.send(ClientMessage::Authenticate {
//!         token: state.session_token,
//!         adventure_id: state.id.to_string(),
//!     }).await?;
//!
//!     while let Some(msg) = out_rx.recv().await {
//!         println!("{msg:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod adventure;
pub mod compaction;
pub mod executor;
pub mod heartbeat;
pub mod id;
pub mod migrate;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod store;
pub mod testing;
pub mod turn;

// Primary public API
pub use adventure::{
    Adventure, EntryKind, HistorySummary, NarrativeEntry, NarrativeHistory, Panel, Theme, XpStyle,
};
pub use compaction::{CompactionConfig, CompactionRequest, CompactionResult, Compactor};
pub use executor::{ExecutorError, TurnEvent, TurnExecutor, TurnRequest, TurnStream};
pub use heartbeat::{
    ConnectionStatus, HeartbeatConfig, HeartbeatDriver, HeartbeatHandle, HeartbeatMonitor,
    ReconnectPolicy,
};
pub use id::{AdventureId, EntryId, MessageId};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage, ToolState};
pub use session::{AdventureSession, SessionConfig, SessionError};
pub use store::{AdventureStore, CreateError, LoadError, LoadedAdventure, SaveError};
pub use turn::{TurnCoordinator, TurnEnd, TurnError, TurnPhase};
