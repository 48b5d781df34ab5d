//! Snapshot lifecycle: capture, rolling retention, restore, thresholds.

use crate::config::{SnapshotConfig, SnapshotsToggle};
use crate::context::ConversationContext;
use crate::snapshot::document::{ContextSnapshot, SnapshotMetadata};
use crate::snapshot::storage::{SnapshotStorage, VerifyStatus};
use crate::snapshot::threshold::{ThresholdCallback, ThresholdMonitor, ThresholdReport};
use crate::{ContextError, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates, restores and prunes snapshots for any number of sessions.
///
/// Threshold callbacks work regardless of whether persistence is enabled;
/// every storage operation on a disabled manager returns
/// [`ContextError::Configuration`].
pub struct SnapshotManager {
    storage: Option<Arc<SnapshotStorage>>,
    config: SnapshotConfig,
    thresholds: ThresholdMonitor,
}

impl SnapshotManager {
    /// Build from configuration. Storage is opened only when enabled.
    pub fn new(toggle: SnapshotsToggle) -> Result<Self> {
        let storage = if toggle.enabled {
            Some(Arc::new(SnapshotStorage::new(&toggle.config.directory)?))
        } else {
            None
        };
        Ok(Self {
            storage,
            config: toggle.config,
            thresholds: ThresholdMonitor::new(),
        })
    }

    /// Use an existing storage instance.
    pub fn with_storage(storage: Arc<SnapshotStorage>, config: SnapshotConfig) -> Self {
        Self {
            storage: Some(storage),
            config,
            thresholds: ThresholdMonitor::new(),
        }
    }

    /// A manager with persistence switched off.
    pub fn disabled() -> Self {
        Self {
            storage: None,
            config: SnapshotConfig::default(),
            thresholds: ThresholdMonitor::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn storage(&self) -> Result<&Arc<SnapshotStorage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| ContextError::Configuration("snapshots are disabled".into()))
    }

    // ── Snapshot operations ────────────────────────────────────────

    /// Capture and persist `ctx`, then prune the session down to `max_count`.
    pub fn create_snapshot(&self, ctx: &ConversationContext) -> Result<SnapshotMetadata> {
        let storage = self.storage()?;
        let snapshot = ContextSnapshot::capture(ctx);
        persist(storage, &snapshot, self.config.max_count)
    }

    /// Capture `ctx` now and write it on the blocking pool.
    ///
    /// Await the handle for a durable acknowledgment, or drop it to let the
    /// write finish in the background.
    pub fn spawn_snapshot(
        &self,
        ctx: &ConversationContext,
    ) -> Result<JoinHandle<Result<SnapshotMetadata>>> {
        let storage = Arc::clone(self.storage()?);
        let snapshot = ContextSnapshot::capture(ctx);
        let max_count = self.config.max_count;
        Ok(tokio::task::spawn_blocking(move || {
            persist(&storage, &snapshot, max_count)
        }))
    }

    /// Load a snapshot and rebuild its context.
    pub fn restore_snapshot(&self, id: &str) -> Result<ConversationContext> {
        let snapshot = self.storage()?.load(id)?;
        debug!(
            "Restoring snapshot {id}: {} user + {} other messages",
            snapshot.user_messages.len(),
            snapshot.messages.len()
        );
        Ok(snapshot.into_context())
    }

    pub fn list_snapshots(&self, session_id: &str) -> Result<Vec<SnapshotMetadata>> {
        self.storage()?.list(session_id)
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.storage()?.delete(id)
    }

    pub fn verify_snapshot(&self, id: &str) -> Result<VerifyStatus> {
        self.storage()?.verify(id)
    }

    /// Delete the oldest snapshots beyond `max_count`. Returns the number deleted.
    pub fn rolling_cleanup(&self, session_id: &str) -> Result<usize> {
        rolling_cleanup(self.storage()?, session_id, self.config.max_count)
    }

    // ── Thresholds ─────────────────────────────────────────────────

    /// See [`ThresholdMonitor::on_context_threshold`].
    pub fn on_context_threshold(&self, fraction: f64, callback: ThresholdCallback) -> bool {
        self.thresholds.on_context_threshold(fraction, callback)
    }

    pub fn on_before_overflow(&self, callback: ThresholdCallback) -> bool {
        self.thresholds.on_before_overflow(callback)
    }

    pub fn check_thresholds(&self, current_tokens: usize, max_tokens: usize) -> ThresholdReport {
        self.thresholds.check(current_tokens, max_tokens)
    }

    pub fn thresholds(&self) -> &ThresholdMonitor {
        &self.thresholds
    }
}

fn persist(
    storage: &SnapshotStorage,
    snapshot: &ContextSnapshot,
    max_count: usize,
) -> Result<SnapshotMetadata> {
    let meta = storage.save(snapshot)?;
    info!(
        "Snapshot {} saved for session {} ({} tokens, {} bytes)",
        meta.id, meta.session_id, meta.token_count, meta.size_bytes
    );
    if let Err(e) = rolling_cleanup(storage, &meta.session_id, max_count) {
        warn!("Rolling cleanup failed for session {}: {e}", meta.session_id);
    }
    Ok(meta)
}

fn rolling_cleanup(storage: &SnapshotStorage, session_id: &str, max_count: usize) -> Result<usize> {
    let mut entries = storage.list(session_id)?;
    if entries.len() <= max_count {
        return Ok(0);
    }
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));

    let mut deleted = 0;
    for meta in entries.iter().skip(max_count) {
        match storage.delete(&meta.id) {
            Ok(()) => deleted += 1,
            Err(e) => warn!("Failed to delete old snapshot {}: {e}", meta.id),
        }
    }
    if deleted > 0 {
        info!("Rolling cleanup removed {deleted} snapshot(s) from session {session_id}");
    }
    Ok(deleted)
}
