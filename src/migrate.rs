//! Schema migration for persisted adventure documents.
//!
//! Older `state.json` documents predate the theme and panel fields.
//! [`upgrade_state`] lifts any supported document to the current
//! version before deserialization, so the store itself only ever sees
//! current-shape documents. Applied once at load time.

use crate::adventure::Theme;
use serde_json::{json, Value};
use thiserror::Error;

/// Current `state.json` schema version.
pub const STATE_VERSION: u32 = 2;

/// Errors from schema migration.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("document is not a JSON object")]
    NotAnObject,

    #[error("unsupported schema version {found} (newest supported is {supported})")]
    FutureVersion { found: u32, supported: u32 },
}

/// Upgrade a raw `state.json` document to [`STATE_VERSION`].
///
/// Version 1 documents carry no `theme` and no `panels`; both are
/// injected with defaults. Documents newer than this build understands
/// are refused rather than silently reinterpreted.
pub fn upgrade_state(mut doc: Value) -> Result<Value, MigrateError> {
    let obj = doc.as_object_mut().ok_or(MigrateError::NotAnObject)?;

    let found = obj
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if found > STATE_VERSION {
        return Err(MigrateError::FutureVersion {
            found,
            supported: STATE_VERSION,
        });
    }

    if found < 2 {
        if !obj.contains_key("theme") {
            let theme = serde_json::to_value(Theme::default())
                .expect("default theme serializes");
            obj.insert("theme".to_string(), theme);
        }
        if !obj.contains_key("panels") {
            obj.insert("panels".to_string(), json!([]));
        }
    }

    obj.insert("version".to_string(), json!(STATE_VERSION));
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_document_gains_defaults() {
        let doc = json!({
            "id": "abc",
            "session_token": "tok",
            "scene": "A dark cave."
        });

        let upgraded = upgrade_state(doc).unwrap();
        assert_eq!(upgraded["version"], STATE_VERSION);
        assert_eq!(upgraded["panels"], json!([]));
        assert_eq!(upgraded["theme"]["genre"], "fantasy");
        assert_eq!(upgraded["scene"], "A dark cave.");
    }

    #[test]
    fn test_current_document_passes_through() {
        let doc = json!({
            "version": 2,
            "theme": { "mood": "tense", "genre": "horror", "region": "crypt", "background_url": null },
            "panels": [{ "id": "a", "title": "t", "body": "b", "persistent": true }]
        });

        let upgraded = upgrade_state(doc.clone()).unwrap();
        assert_eq!(upgraded["theme"], doc["theme"]);
        assert_eq!(upgraded["panels"], doc["panels"]);
    }

    #[test]
    fn test_existing_fields_not_overwritten() {
        let doc = json!({
            "version": 1,
            "theme": { "mood": "grim", "genre": "noir", "region": "docks", "background_url": null }
        });

        let upgraded = upgrade_state(doc).unwrap();
        assert_eq!(upgraded["theme"]["mood"], "grim");
    }

    #[test]
    fn test_future_version_refused() {
        let doc = json!({ "version": 99 });
        assert!(matches!(
            upgrade_state(doc),
            Err(MigrateError::FutureVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_non_object_refused() {
        assert!(matches!(
            upgrade_state(json!([1, 2, 3])),
            Err(MigrateError::NotAnObject)
        ));
    }
}
