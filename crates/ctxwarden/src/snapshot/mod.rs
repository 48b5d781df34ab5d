//! Recovery points for the live conversation.
//!
//! - [`document`]: the on-disk snapshot shape, its schema and the
//!   current/legacy version handling.
//! - [`storage`]: [`SnapshotStorage`], one JSON document per snapshot plus
//!   a per-session index.
//! - [`manager`]: [`SnapshotManager`]: capture, rolling retention, restore.
//! - [`threshold`]: edge-triggered usage callbacks and the pre-overflow
//!   warning.

pub mod document;
pub mod manager;
pub mod storage;
pub mod threshold;

pub use document::{ContextSnapshot, SnapshotMetadata, SnapshotStats};
pub use manager::SnapshotManager;
pub use storage::{SnapshotStorage, VerifyStatus};
pub use threshold::{ThresholdCallback, ThresholdHit, ThresholdMonitor, ThresholdReport};
