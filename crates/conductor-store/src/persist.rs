//! Whole-document JSON persistence.
//!
//! Documents have the shape `{"schema_version": 1, "<key>": {id: record}}`.
//! Older files that are a bare `{id: record}` mapping still load.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use conductor_core::ids::RunId;

use crate::error::StoreError;

pub const SCHEMA_VERSION: u64 = 1;

/// Replace `path` with `value` via a sibling temp file and rename.
pub fn atomic_write(path: &Path, value: &Value) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `entries` under `key` and write the document atomically.
pub fn save_document<T: Serialize>(
    path: &Path,
    key: &str,
    entries: &BTreeMap<RunId, T>,
) -> Result<(), StoreError> {
    let mut body = Map::with_capacity(entries.len());
    for (id, record) in entries {
        let _ = body.insert(id.to_string(), serde_json::to_value(record)?);
    }
    let mut doc = Map::new();
    let _ = doc.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    let _ = doc.insert(key.into(), Value::Object(body));
    atomic_write(path, &Value::Object(doc))
}

/// Read and decode the document at `path`.
///
/// A missing file is [`StoreError::NotFound`]; a document that does not parse
/// is [`StoreError::Corrupt`]. Individual entries that do not decode are
/// dropped with a warning and the rest kept.
pub fn read_document<T: DeserializeOwned>(
    path: &Path,
    key: &str,
) -> Result<BTreeMap<RunId, T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let entries = parse_document(&raw, key).map_err(|reason| StoreError::Corrupt {
        path: path.display().to_string(),
        reason,
    })?;

    let mut out = BTreeMap::new();
    for (id, value) in entries {
        match serde_json::from_value::<T>(value) {
            Ok(record) => {
                let _ = out.insert(RunId::new(&id), record);
            }
            Err(e) => warn!(path = %path.display(), id = %id, error = %e, "skipping malformed entry"),
        }
    }
    Ok(out)
}

/// Load the document at `path`, never failing.
///
/// - missing file: empty
/// - unreadable file: empty, left in place
/// - corrupt document: empty, original moved aside
pub fn load_document<T: DeserializeOwned>(path: &Path, key: &str) -> BTreeMap<RunId, T> {
    match read_document(path, key) {
        Ok(entries) => entries,
        Err(StoreError::NotFound(_)) => {
            info!(path = %path.display(), "no state file yet, starting empty");
            BTreeMap::new()
        }
        Err(StoreError::Corrupt { reason, .. }) => {
            let moved = quarantine(path);
            error!(
                path = %path.display(),
                quarantined = ?moved,
                %reason,
                "corrupt state file, starting empty"
            );
            BTreeMap::new()
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read state file, starting empty");
            BTreeMap::new()
        }
    }
}

fn parse_document(raw: &str, key: &str) -> Result<Map<String, Value>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let Value::Object(mut doc) = value else {
        return Err("document is not a JSON object".into());
    };

    let Some(version) = doc.get("schema_version") else {
        // Legacy layout: the document is the id → record mapping itself.
        return Ok(doc);
    };
    match version.as_u64() {
        Some(v) if v > SCHEMA_VERSION => {
            warn!(version = v, supported = SCHEMA_VERSION, "state file written by a newer version");
        }
        Some(_) => {}
        None => return Err(format!("invalid schema_version: {version}")),
    }

    match doc.remove(key) {
        Some(Value::Object(entries)) => Ok(entries),
        None | Some(Value::Null) => Ok(Map::new()),
        Some(_) => Err(format!("`{key}` is not a JSON object")),
    }
}

/// Move a corrupt file to `<name>.corrupt-<timestamp>` so it can be inspected.
fn quarantine(path: &Path) -> Option<PathBuf> {
    let mut name = path.file_name()?.to_os_string();
    name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    let target = path.with_file_name(name);
    match fs::rename(path, &target) {
        Ok(()) => Some(target),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to quarantine corrupt file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Deserialize, serde::Serialize)]
    struct Entry {
        n: u32,
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/things.json");
        let mut entries = BTreeMap::new();
        entries.insert(RunId::from(1u64), Entry { n: 10 });
        entries.insert(RunId::from("abc"), Entry { n: 20 });

        save_document(&path, "things", &entries).unwrap();
        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["schema_version"], 1);
        assert_eq!(doc["things"]["1"]["n"], 10);
        assert!(!temp_path(&path).exists());

        let loaded: BTreeMap<RunId, Entry> = load_document(&path, "things");
        assert_eq!(loaded, entries);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: BTreeMap<RunId, Entry> = load_document(&dir.path().join("nope.json"), "things");
        assert!(loaded.is_empty());
    }

    #[test]
    fn read_distinguishes_missing_from_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("things.json");

        let err = read_document::<Entry>(&path, "things").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        fs::write(&path, r#"{"schema_version": 1, "things": [1, 2]}"#).unwrap();
        let err = read_document::<Entry>(&path, "things").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref reason, .. } if reason.contains("things")));
        // reading alone never moves the file
        assert!(path.exists());
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("things.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded: BTreeMap<RunId, Entry> = load_document(&path, "things");
        assert!(loaded.is_empty());
        assert!(!path.exists());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("things.json.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("things.json");
        fs::write(
            &path,
            r#"{"schema_version": 1, "things": {"1": {"n": 1}, "2": {"n": "two"}, "3": {"n": 3}}}"#,
        )
        .unwrap();

        let loaded: BTreeMap<RunId, Entry> = load_document(&path, "things");
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.contains_key(&RunId::from(2u64)));
    }

    #[test]
    fn legacy_bare_mapping_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("things.json");
        fs::write(&path, r#"{" 7 ": {"n": 7}}"#).unwrap();

        let loaded: BTreeMap<RunId, Entry> = load_document(&path, "things");
        assert_eq!(loaded.get(&RunId::from(7u64)), Some(&Entry { n: 7 }));
    }
}
