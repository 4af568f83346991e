//! Durable adventure persistence.
//!
//! One adventure owns one directory under the store's base directory,
//! holding `state.json` and `history.json`. Every mutation persists
//! through write-temp-then-rename, so a crash at any point leaves the
//! previously committed files loadable.
//!
//! The store is split into two types so the "no state loaded" failure
//! mode cannot exist: [`AdventureStore`] can only create or load, and
//! every mutator lives on the [`LoadedAdventure`] handle those return.

use crate::adventure::{
    Adventure, EntryKind, NarrativeEntry, NarrativeHistory, Panel, Theme, XpStyle,
};
use crate::compaction::{
    merge_result, threshold_exceeded, CompactionConfig, CompactionRequest, Compactor, SingleFlight,
};
use crate::id::AdventureId;
use crate::migrate;
use crate::paths::{self, PathError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.json";
const HISTORY_FILE: &str = "history.json";
const STATE_TMP: &str = ".state.json.tmp";
const HISTORY_TMP: &str = ".history.json.tmp";

/// Errors from `create`.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("invalid adventure id: {0:?}")]
    InvalidId(String),

    #[error("adventure {0} already exists")]
    AlreadyExists(AdventureId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Save(#[from] SaveError),
}

/// Errors from `load`, returned as a typed result.
///
/// An invalid id and a missing adventure are deliberately collapsed
/// into `NotFound` so callers cannot probe which ids exist.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("adventure not found")]
    NotFound,

    #[error("corrupted save data at {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("session token mismatch")]
    InvalidToken,
}

/// Errors from persisting state.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The persisted projection of [`Adventure`]. Panels are filtered to
/// `persistent == true` on the way out.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    id: AdventureId,
    session_token: String,
    #[serde(default)]
    agent_session_id: Option<String>,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    #[serde(default)]
    scene: String,
    theme: Theme,
    #[serde(default)]
    player_ref: Option<String>,
    #[serde(default)]
    world_ref: Option<String>,
    #[serde(default)]
    xp_style: Option<XpStyle>,
    panels: Vec<Panel>,
}

impl PersistedState {
    fn from_adventure(adventure: &Adventure) -> Self {
        Self {
            version: migrate::STATE_VERSION,
            id: adventure.id.clone(),
            session_token: adventure.session_token.clone(),
            agent_session_id: adventure.agent_session_id.clone(),
            created_at: adventure.created_at,
            last_active_at: adventure.last_active_at,
            scene: adventure.scene.clone(),
            theme: adventure.theme.clone(),
            player_ref: adventure.player_ref.clone(),
            world_ref: adventure.world_ref.clone(),
            xp_style: adventure.xp_style,
            panels: adventure.persistent_panels(),
        }
    }

    fn into_adventure(self) -> Adventure {
        Adventure {
            id: self.id,
            session_token: self.session_token,
            agent_session_id: self.agent_session_id,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            scene: self.scene,
            theme: self.theme,
            player_ref: self.player_ref,
            world_ref: self.world_ref,
            xp_style: self.xp_style,
            panels: self.panels,
        }
    }
}

/// Factory for adventure directories. Holds configuration only; all
/// per-adventure state lives on [`LoadedAdventure`].
#[derive(Clone)]
pub struct AdventureStore {
    base_dir: PathBuf,
    compaction: CompactionConfig,
    compactor: Option<Arc<dyn Compactor>>,
}

impl AdventureStore {
    /// Create a store rooted at `base_dir`. The directory is created
    /// lazily on the first `create`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            compaction: CompactionConfig::default(),
            compactor: None,
        }
    }

    /// Set the compaction trigger configuration.
    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Attach the external compactor. Without one, the threshold is
    /// never evaluated and history grows unbounded.
    pub fn with_compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// The configured base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a new adventure and perform its initial save.
    ///
    /// A caller-supplied id must pass the strict allow-list; otherwise
    /// a fresh id is generated.
    pub async fn create(&self, id: Option<&str>) -> Result<LoadedAdventure, CreateError> {
        let id = match id {
            Some(raw) => {
                if !paths::validate_id(raw) {
                    return Err(CreateError::InvalidId(raw.to_string()));
                }
                AdventureId::from_validated(raw)
            }
            None => AdventureId::generate(),
        };

        ensure_owner_only_dir(&self.base_dir).await?;
        let dir = match paths::confine(&self.base_dir, id.as_str()) {
            Ok(dir) => dir,
            Err(PathError::InvalidId(_)) | Err(PathError::Escape(_)) => {
                return Err(CreateError::InvalidId(id.as_str().to_string()))
            }
            Err(PathError::Base(e)) => return Err(CreateError::Io(e)),
        };

        if fs::try_exists(dir.join(STATE_FILE)).await? {
            return Err(CreateError::AlreadyExists(id));
        }

        ensure_owner_only_dir(&dir).await?;

        let adventure = Adventure::new(id.clone());
        let mut inner = AdventureInner {
            dir,
            state: adventure,
            history: NarrativeHistory::default(),
        };
        save_locked(&mut inner).await?;

        info!(adventure = %id, "created adventure");
        Ok(self.loaded(inner))
    }

    /// Load an existing adventure, validating the session token.
    ///
    /// On token mismatch the parsed state is dropped before returning:
    /// a wrong token yields no state data, not even metadata. If the
    /// history has outgrown the compaction threshold, compaction is
    /// started in the background before this returns.
    pub async fn load(&self, id: &str, token: &str) -> Result<LoadedAdventure, LoadError> {
        let dir = paths::confine(&self.base_dir, id).map_err(|_| LoadError::NotFound)?;

        let state_path = dir.join(STATE_FILE);
        let raw = match fs::read_to_string(&state_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(LoadError::NotFound),
            Err(e) => return Err(corrupted(&state_path, e)),
        };

        let doc: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| corrupted(&state_path, e))?;
        let doc = migrate::upgrade_state(doc).map_err(|e| corrupted(&state_path, e))?;
        let persisted: PersistedState =
            serde_json::from_value(doc).map_err(|e| corrupted(&state_path, e))?;

        if persisted.session_token != token {
            // Drop the parsed document without exposing any of it.
            return Err(LoadError::InvalidToken);
        }

        let history_path = dir.join(HISTORY_FILE);
        let history = match fs::read_to_string(&history_path).await {
            Ok(raw) => {
                serde_json::from_str::<NarrativeHistory>(&raw)
                    .map_err(|e| corrupted(&history_path, e))?
            }
            // Valid for a brand-new adventure.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NarrativeHistory::default(),
            Err(e) => return Err(corrupted(&history_path, e)),
        };

        let mut state = persisted.into_adventure();
        state.last_active_at = Utc::now();
        let content_len = history.content_len();

        let loaded = self.loaded(AdventureInner { dir, state, history });
        loaded.maybe_spawn_compaction(content_len);
        debug!(adventure = %loaded.id(), entries = loaded.inner_entry_hint(), "loaded adventure");
        Ok(loaded)
    }

    fn loaded(&self, inner: AdventureInner) -> LoadedAdventure {
        LoadedAdventure {
            id: inner.state.id.clone(),
            inner: Arc::new(Mutex::new(inner)),
            compaction: self.compaction.clone(),
            compactor: self.compactor.clone(),
            guard: Arc::new(SingleFlight::default()),
        }
    }
}

struct AdventureInner {
    dir: PathBuf,
    state: Adventure,
    history: NarrativeHistory,
}

/// Handle to the one loaded adventure. All mutators live here, so they
/// are statically unavailable before a successful `create` or `load`.
///
/// Cloning shares the same underlying state; the background compaction
/// task holds such a clone.
#[derive(Clone)]
pub struct LoadedAdventure {
    id: AdventureId,
    inner: Arc<Mutex<AdventureInner>>,
    compaction: CompactionConfig,
    compactor: Option<Arc<dyn Compactor>>,
    guard: Arc<SingleFlight>,
}

impl std::fmt::Debug for LoadedAdventure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedAdventure")
            .field("id", &self.id)
            .field("compaction", &self.compaction)
            .field("has_compactor", &self.compactor.is_some())
            .finish_non_exhaustive()
    }
}

impl LoadedAdventure {
    /// The adventure's id.
    pub fn id(&self) -> &AdventureId {
        &self.id
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> Adventure {
        self.inner.lock().await.state.clone()
    }

    /// Snapshot of the current history.
    pub async fn history(&self) -> NarrativeHistory {
        self.inner.lock().await.history.clone()
    }

    /// All panels, ephemeral ones included.
    pub async fn panels(&self) -> Vec<Panel> {
        self.inner.lock().await.state.panels.clone()
    }

    /// Persist the current state and history.
    pub async fn save(&self) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        save_locked(&mut inner).await
    }

    /// Append one entry, persist, and evaluate the compaction
    /// threshold. Returns the appended entry.
    pub async fn append_history(
        &self,
        kind: EntryKind,
        content: impl Into<String>,
    ) -> Result<NarrativeEntry, SaveError> {
        let entry = NarrativeEntry::new(kind, content);
        let content_len = {
            let mut inner = self.inner.lock().await;
            inner.history.entries.push(entry.clone());
            save_locked(&mut inner).await?;
            inner.history.content_len()
        };
        self.maybe_spawn_compaction(content_len);
        Ok(entry)
    }

    /// Replace the scene description.
    pub async fn set_scene(&self, scene: impl Into<String>) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.scene = scene.into();
        save_locked(&mut inner).await
    }

    /// Replace the theme.
    pub async fn set_theme(&self, theme: Theme) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.theme = theme;
        save_locked(&mut inner).await
    }

    /// Set the progression style.
    pub async fn set_xp_style(&self, style: XpStyle) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.xp_style = Some(style);
        save_locked(&mut inner).await
    }

    /// Point at an external character document.
    pub async fn set_player_ref(&self, player_ref: Option<String>) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.player_ref = player_ref;
        save_locked(&mut inner).await
    }

    /// Point at an external world document.
    pub async fn set_world_ref(&self, world_ref: Option<String>) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.world_ref = world_ref;
        save_locked(&mut inner).await
    }

    /// Record the narrator continuity id.
    pub async fn set_agent_session_id(&self, id: impl Into<String>) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.agent_session_id = Some(id.into());
        save_locked(&mut inner).await
    }

    /// Forget the narrator continuity id so the next turn starts a
    /// fresh narrator session.
    pub async fn clear_agent_session(&self) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.agent_session_id = None;
        save_locked(&mut inner).await
    }

    /// Replace the panel list. Ephemeral panels are kept in memory and
    /// dropped from the persisted projection.
    pub async fn replace_panels(&self, panels: Vec<Panel>) -> Result<(), SaveError> {
        let mut inner = self.inner.lock().await;
        inner.state.panels = panels;
        save_locked(&mut inner).await
    }

    /// Wait for an in-flight background compaction, if any. Returns
    /// immediately otherwise. Intended for shutdown and tests.
    pub async fn await_compaction(&self) {
        if let Some(handle) = self.guard.take_handle() {
            let _ = handle.await;
        }
    }

    fn maybe_spawn_compaction(&self, content_len: usize) {
        let Some(compactor) = self.compactor.clone() else {
            return;
        };
        if !threshold_exceeded(&self.compaction, content_len) {
            return;
        }
        if !self.guard.try_begin() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let guard = Arc::clone(&self.guard);
        let config = self.compaction.clone();
        let id = self.id.clone();

        let handle = tokio::spawn(async move {
            let (entries, snapshot_len) = {
                let locked = inner.lock().await;
                (locked.history.entries.clone(), locked.history.len())
            };
            let result = compactor
                .compact(CompactionRequest {
                    entries,
                    retain: config.retain_entries,
                    model: config.model.clone(),
                })
                .await;

            if result.success {
                let archived = result.entries_archived;
                let mut locked = inner.lock().await;
                if merge_result(&mut locked.history, snapshot_len, result) {
                    match save_locked(&mut locked).await {
                        Ok(()) => debug!(adventure = %id, archived, "history compacted"),
                        Err(e) => {
                            warn!(adventure = %id, error = %e, "failed to persist compacted history")
                        }
                    }
                }
            } else {
                // Never surfaced to the client; play continues on the
                // uncompacted history.
                warn!(adventure = %id, error = ?result.error, "history compaction failed");
            }
            guard.finish();
        });
        self.guard.set_handle(handle);
    }

    fn inner_entry_hint(&self) -> usize {
        self.inner.try_lock().map(|g| g.history.len()).unwrap_or(0)
    }
}

fn corrupted(path: &Path, reason: impl std::fmt::Display) -> LoadError {
    LoadError::Corrupted {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Write both documents atomically: temp files first, then renames.
/// On any failure the temp files are removed best-effort and the
/// original error is re-raised, leaving the committed files untouched.
async fn save_locked(inner: &mut AdventureInner) -> Result<(), SaveError> {
    inner.state.last_active_at = Utc::now();

    let state_json = serde_json::to_string_pretty(&PersistedState::from_adventure(&inner.state))?;
    let history_json = serde_json::to_string_pretty(&inner.history)?;

    let state_tmp = inner.dir.join(STATE_TMP);
    let history_tmp = inner.dir.join(HISTORY_TMP);

    let result = commit_files(&inner.dir, &state_tmp, &state_json, &history_tmp, &history_json).await;
    if result.is_err() {
        let _ = fs::remove_file(&state_tmp).await;
        let _ = fs::remove_file(&history_tmp).await;
    }
    result
}

async fn commit_files(
    dir: &Path,
    state_tmp: &Path,
    state_json: &str,
    history_tmp: &Path,
    history_json: &str,
) -> Result<(), SaveError> {
    write_owner_only(state_tmp, state_json).await?;
    write_owner_only(history_tmp, history_json).await?;
    fs::rename(state_tmp, dir.join(STATE_FILE)).await?;
    fs::rename(history_tmp, dir.join(HISTORY_FILE)).await?;
    Ok(())
}

async fn write_owner_only(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

async fn ensure_owner_only_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}
