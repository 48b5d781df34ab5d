//! Filesystem persistence for snapshots.
//!
//! Directory layout:
//! ```text
//! root/
//!   <session_id>/
//!     snapshots-index.json
//!     snapshot-<id>.json
//!     snapshot-<id>.json
//! ```
//!
//! Documents and the index are written atomically (temp file, fsync,
//! rename), so a crash leaves either the old or the new file. The index is
//! a cache: if it is missing or unreadable it is rebuilt from the documents.

use crate::api::ids::is_path_safe;
use crate::snapshot::document::{self, ContextSnapshot, SnapshotMetadata};
use crate::{ContextError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Per-session index file name.
pub const INDEX_FILE: &str = "snapshots-index.json";

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Result of a structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    Valid { version: u32 },
    Corrupted { reason: String },
    NotFound,
}

impl VerifyStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyStatus::Valid { .. })
    }
}

#[derive(Serialize)]
struct IndexOut<'a> {
    session_id: &'a str,
    updated_at: DateTime<Utc>,
    snapshots: &'a [SnapshotMetadata],
}

/// Entries are parsed one by one so a bad entry cannot hide the rest.
#[derive(Deserialize)]
struct IndexIn {
    #[serde(default)]
    snapshots: Vec<serde_json::Value>,
}

/// Snapshot store rooted at one directory.
pub struct SnapshotStorage {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl SnapshotStorage {
    /// Create a store, ensuring the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        if !is_path_safe(session_id) {
            return Err(ContextError::InvalidId(session_id.to_string()));
        }
        Ok(self.root.join(session_id))
    }

    fn snapshot_filename(id: &str) -> String {
        format!("{SNAPSHOT_PREFIX}{id}{SNAPSHOT_SUFFIX}")
    }

    fn snapshot_id_from_filename(name: &str) -> Option<&str> {
        name.strip_prefix(SNAPSHOT_PREFIX)?
            .strip_suffix(SNAPSHOT_SUFFIX)
    }

    /// Find the document for `id` in any session directory.
    fn locate(&self, id: &str) -> Result<Option<PathBuf>> {
        if !is_path_safe(id) {
            return Err(ContextError::InvalidId(id.to_string()));
        }
        let filename = Self::snapshot_filename(id);
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type().is_ok_and(|ft| ft.is_dir()) {
                continue;
            }
            let candidate = entry.path().join(&filename);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    // ── Document operations ────────────────────────────────────────

    /// Write a snapshot document and record it in the session index.
    pub fn save(&self, snapshot: &ContextSnapshot) -> Result<SnapshotMetadata> {
        if !is_path_safe(&snapshot.id) {
            return Err(ContextError::InvalidId(snapshot.id.clone()));
        }
        let dir = self.session_dir(&snapshot.session_id)?;
        fs::create_dir_all(&dir)?;

        let json = document::encode(snapshot)?;
        let path = dir.join(Self::snapshot_filename(&snapshot.id));
        write_atomic(&path, json.as_bytes())?;
        let meta = snapshot.metadata(json.len() as u64);
        debug!("Saved snapshot {} ({} bytes)", snapshot.id, meta.size_bytes);

        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_index_or_rebuild(&snapshot.session_id, &dir)?;
        entries.retain(|m| m.id != meta.id);
        entries.push(meta.clone());
        self.write_index(&snapshot.session_id, &dir, &mut entries)?;
        Ok(meta)
    }

    /// Load and normalize a snapshot.
    ///
    /// Fails with [`ContextError::NotFound`] for an unknown id and
    /// [`ContextError::Corruption`] for a damaged document.
    pub fn load(&self, id: &str) -> Result<ContextSnapshot> {
        let path = self
            .locate(id)?
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
        let text = fs::read_to_string(&path)?;
        document::decode(id, &text)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.locate(id)?.is_some())
    }

    /// Structural validation without building a [`ContextSnapshot`].
    pub fn verify(&self, id: &str) -> Result<VerifyStatus> {
        let Some(path) = self.locate(id)? else {
            return Ok(VerifyStatus::NotFound);
        };
        let text = fs::read_to_string(&path)?;
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                return Ok(VerifyStatus::Corrupted {
                    reason: format!("unparseable JSON: {e}"),
                });
            }
        };
        Ok(match document::validate(&value) {
            Ok(version) => VerifyStatus::Valid { version },
            Err(reason) => VerifyStatus::Corrupted { reason },
        })
    }

    /// Delete a snapshot document and its index entry.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self
            .locate(id)?
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
        fs::remove_file(&path)?;

        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let session_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_index_or_rebuild(&session_id, dir)?;
        entries.retain(|m| m.id != id);
        self.write_index(&session_id, dir, &mut entries)?;
        debug!("Deleted snapshot {id}");
        Ok(())
    }

    // ── Listing ────────────────────────────────────────────────────

    /// Metadata for every snapshot of a session, oldest first.
    ///
    /// Malformed index entries and entries whose document is gone are
    /// skipped with a warning. A missing or unreadable index is rebuilt.
    pub fn list(&self, session_id: &str) -> Result<Vec<SnapshotMetadata>> {
        let dir = self.session_dir(session_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_index_or_rebuild(session_id, &dir)?;
        entries.retain(|m| {
            let present = dir.join(Self::snapshot_filename(&m.id)).is_file();
            if !present {
                warn!("Skipping index entry {}: document is missing", m.id);
            }
            present
        });
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Session ids that have a directory under the root.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type().is_ok_and(|ft| ft.is_dir()) {
                sessions.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    // ── Index ──────────────────────────────────────────────────────

    /// Index entries, or `None` if the index is missing or unparseable.
    fn read_index(&self, dir: &Path) -> Option<Vec<SnapshotMetadata>> {
        let path = dir.join(INDEX_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Unreadable snapshot index at {}: {e}", path.display());
                return None;
            }
        };
        let index: IndexIn = match serde_json::from_str(&text) {
            Ok(index) => index,
            Err(e) => {
                warn!("Malformed snapshot index at {}: {e}", path.display());
                return None;
            }
        };

        let mut entries = Vec::with_capacity(index.snapshots.len());
        for (i, raw) in index.snapshots.into_iter().enumerate() {
            match serde_json::from_value::<SnapshotMetadata>(raw) {
                Ok(meta) => entries.push(meta),
                Err(e) => warn!("Skipping malformed index entry #{i} in {}: {e}", path.display()),
            }
        }
        Some(entries)
    }

    fn read_index_or_rebuild(&self, session_id: &str, dir: &Path) -> Result<Vec<SnapshotMetadata>> {
        match self.read_index(dir) {
            Some(entries) => Ok(entries),
            None => self.rebuild_index(session_id, dir),
        }
    }

    /// Rebuild the index by scanning and decoding every document.
    /// Documents that fail to decode are skipped with a warning.
    fn rebuild_index(&self, session_id: &str, dir: &Path) -> Result<Vec<SnapshotMetadata>> {
        let mut entries = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(id) = Self::snapshot_id_from_filename(&name) else {
                    continue;
                };
                let text = match fs::read_to_string(entry.path()) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Skipping unreadable snapshot {id}: {e}");
                        continue;
                    }
                };
                match document::decode(id, &text) {
                    Ok(snapshot) => entries.push(snapshot.metadata(text.len() as u64)),
                    Err(e) => warn!("Skipping snapshot while rebuilding index: {e}"),
                }
            }
        }
        debug!(
            "Rebuilt snapshot index for session {session_id}: {} entries",
            entries.len()
        );
        if dir.is_dir() {
            self.write_index(session_id, dir, &mut entries)?;
        }
        Ok(entries)
    }

    fn write_index(
        &self,
        session_id: &str,
        dir: &Path,
        entries: &mut [SnapshotMetadata],
    ) -> Result<()> {
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let index = IndexOut {
            session_id,
            updated_at: Utc::now(),
            snapshots: entries,
        };
        let json = serde_json::to_string_pretty(&index)?;
        write_atomic(&dir.join(INDEX_FILE), json.as_bytes())?;
        Ok(())
    }
}

/// Atomic write: temp file in the same directory, fsync, rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{name}.tmp"));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::context::conversation::{ConversationContext, ModelInfo};
    use tempfile::TempDir;

    fn snapshot_for(session: &str, text: &str) -> ContextSnapshot {
        let mut ctx = ConversationContext::new(session, &ModelInfo::new("m", None), 4096);
        ctx.set_system_prompt("prompt");
        ctx.push(Message::user(text));
        ctx.push(Message::assistant("ok"));
        ContextSnapshot::capture(&ctx)
    }

    fn store() -> (TempDir, SnapshotStorage) {
        let dir = TempDir::new().unwrap();
        let storage = SnapshotStorage::new(dir.path().join("snapshots")).unwrap();
        (dir, storage)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, storage) = store();
        let snap = snapshot_for("s1", "x".repeat(5000).as_str());
        let meta = storage.save(&snap).unwrap();
        assert_eq!(meta.id, snap.id);
        assert!(meta.size_bytes > 5000);

        let loaded = storage.load(&snap.id).unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(loaded.user_messages[0].content, "x".repeat(5000));
        assert!(storage.exists(&snap.id).unwrap());
        assert_eq!(
            storage.verify(&snap.id).unwrap(),
            VerifyStatus::Valid { version: 2 }
        );
    }

    #[test]
    fn layout_matches_documented_paths() {
        let (_dir, storage) = store();
        let snap = snapshot_for("s1", "hi");
        storage.save(&snap).unwrap();
        let session_dir = storage.root().join("s1");
        assert!(session_dir.join(format!("snapshot-{}.json", snap.id)).is_file());
        assert!(session_dir.join(INDEX_FILE).is_file());
        let leftovers: Vec<_> = fs::read_dir(&session_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupted_sibling_does_not_block_others() {
        let (_dir, storage) = store();
        let good = snapshot_for("s1", "good");
        let bad = snapshot_for("s1", "bad");
        storage.save(&good).unwrap();
        storage.save(&bad).unwrap();

        let bad_path = storage
            .root()
            .join("s1")
            .join(format!("snapshot-{}.json", bad.id));
        fs::write(&bad_path, "{ \"version\": 2, \"id\": ").unwrap();

        assert_eq!(storage.load(&good.id).unwrap(), good);
        assert!(storage.load(&bad.id).unwrap_err().is_corruption());
        assert!(matches!(
            storage.verify(&bad.id).unwrap(),
            VerifyStatus::Corrupted { .. }
        ));
        let listed = storage.list("s1").unwrap();
        assert!(listed.iter().any(|m| m.id == good.id));
    }

    #[test]
    fn corrupt_index_is_rebuilt_without_bad_documents() {
        let (_dir, storage) = store();
        let good = snapshot_for("s1", "good");
        let bad = snapshot_for("s1", "bad");
        storage.save(&good).unwrap();
        storage.save(&bad).unwrap();

        let session_dir = storage.root().join("s1");
        fs::write(session_dir.join(format!("snapshot-{}.json", bad.id)), "not json").unwrap();
        fs::write(session_dir.join(INDEX_FILE), "[[[").unwrap();

        let listed = storage.list("s1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);

        // The rebuilt index is readable again.
        assert!(storage.read_index(&session_dir).is_some());
    }

    #[test]
    fn malformed_index_entries_are_skipped() {
        let (_dir, storage) = store();
        let a = snapshot_for("s1", "a");
        let b = snapshot_for("s1", "b");
        storage.save(&a).unwrap();
        storage.save(&b).unwrap();

        let index_path = storage.root().join("s1").join(INDEX_FILE);
        let mut index: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&index_path).unwrap()).unwrap();
        index["snapshots"][0] = serde_json::json!({ "id": 17 });
        fs::write(&index_path, index.to_string()).unwrap();

        let listed = storage.list("s1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);
    }

    #[test]
    fn list_is_session_scoped_and_ordered() {
        let (_dir, storage) = store();
        let first = snapshot_for("s1", "one");
        let second = snapshot_for("s1", "two");
        let other = snapshot_for("s2", "three");
        storage.save(&second).unwrap();
        storage.save(&first).unwrap();
        storage.save(&other).unwrap();

        let ids: Vec<_> = storage.list("s1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(storage.list("missing-session").unwrap().is_empty());
        assert_eq!(storage.list_sessions().unwrap(), vec!["s1", "s2"]);
    }

    #[test]
    fn delete_removes_document_and_entry() {
        let (_dir, storage) = store();
        let snap = snapshot_for("s1", "bye");
        storage.save(&snap).unwrap();
        storage.delete(&snap.id).unwrap();

        assert!(!storage.exists(&snap.id).unwrap());
        assert!(storage.list("s1").unwrap().is_empty());
        assert!(matches!(
            storage.delete(&snap.id),
            Err(ContextError::NotFound(_))
        ));
        assert_eq!(storage.verify(&snap.id).unwrap(), VerifyStatus::NotFound);
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        let (_dir, storage) = store();
        assert!(matches!(
            storage.load("../etc/passwd"),
            Err(ContextError::InvalidId(_))
        ));
        assert!(matches!(
            storage.list("a/b"),
            Err(ContextError::InvalidId(_))
        ));
    }
}
