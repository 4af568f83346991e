//! Adventure state and narrative history data model.
//!
//! An [`Adventure`] is one persisted narrative session: scene, theme,
//! external document refs, UI panels, and the secrets that gate access
//! to it. The [`NarrativeHistory`] is the append-only transcript of
//! player inputs and narrator responses, optionally fronted by a
//! compaction summary.

use crate::id::{AdventureId, EntryId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Visual and tonal theme for the current scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
    pub mood: String,
    pub genre: String,
    pub region: String,
    pub background_url: Option<String>,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            mood: "calm".to_string(),
            genre: "fantasy".to_string(),
            region: "frontier".to_string(),
            background_url: None,
        }
    }
}

/// How the narrator awards character progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XpStyle {
    Milestone,
    Experience,
    Freeform,
}

/// An auxiliary information block surfaced alongside the narrative.
///
/// Only panels marked `persistent` survive a save; ephemeral panels
/// exist in memory for the duration of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Panel {
    pub id: String,
    pub title: String,
    pub body: String,
    pub persistent: bool,
}

impl Panel {
    /// Create a persistent panel.
    pub fn persistent(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            persistent: true,
        }
    }

    /// Create an ephemeral panel that will not be saved.
    pub fn ephemeral(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            persistent: false,
        }
    }
}

/// One persisted narrative session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adventure {
    /// Opaque collision-resistant id; doubles as the directory name.
    pub id: AdventureId,

    /// Opaque secret proving the right to load this adventure.
    /// Generated at creation, never changed afterwards.
    pub session_token: String,

    /// Narrator continuity id, if the executor reported one.
    pub agent_session_id: Option<String>,

    /// When the adventure was created.
    pub created_at: DateTime<Utc>,

    /// Updated on every load and save.
    pub last_active_at: DateTime<Utc>,

    /// Free-text description of the current scene.
    pub scene: String,

    /// Current visual and tonal theme.
    pub theme: Theme,

    /// Relative path to an external character document.
    pub player_ref: Option<String>,

    /// Relative path to an external world document.
    pub world_ref: Option<String>,

    /// Progression style, if the player picked one.
    pub xp_style: Option<XpStyle>,

    /// All panels, persistent and ephemeral.
    pub panels: Vec<Panel>,
}

impl Adventure {
    /// Create a fresh adventure with default state and a new token.
    pub fn new(id: AdventureId) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_token: generate_session_token(),
            agent_session_id: None,
            created_at: now,
            last_active_at: now,
            scene: String::new(),
            theme: Theme::default(),
            player_ref: None,
            world_ref: None,
            xp_style: None,
            panels: Vec::new(),
        }
    }

    /// Panels that survive a save.
    pub fn persistent_panels(&self) -> Vec<Panel> {
        self.panels.iter().filter(|p| p.persistent).cloned().collect()
    }
}

/// Whether an entry came from the player or the narrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    PlayerInput,
    GmResponse,
}

/// One atomic unit of story text. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeEntry {
    pub id: EntryId,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub content: String,
}

impl NarrativeEntry {
    /// Create a new entry stamped with the current time.
    pub fn new(kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            timestamp: Utc::now(),
            kind,
            content: content.into(),
        }
    }
}

/// Gist of archived entries, produced by compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub text: String,
    pub entries_archived: usize,
    pub updated_at: DateTime<Utc>,
}

/// Append-only transcript of the adventure.
///
/// Entry order is meaningful and preserved. Compaction may drop a
/// prefix of entries and attach a summary in their place; it never
/// reorders what it retains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrativeHistory {
    pub entries: Vec<NarrativeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistorySummary>,
}

impl NarrativeHistory {
    /// Total character length of all entries.
    ///
    /// This is the quantity the compaction threshold is measured
    /// against.
    pub fn content_len(&self) -> usize {
        self.entries.iter().map(|e| e.content.chars().count()).sum()
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the transcript has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Generate a fresh opaque session token: 32 random bytes, hex encoded.
pub(crate) fn generate_session_token() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
