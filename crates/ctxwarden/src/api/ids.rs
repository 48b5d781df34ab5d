//! Identifier generation.
//!
//! Ids are `<prefix>-<nanos hex>-<counter hex>`: sortable by creation time
//! within a process, unique under sub-nanosecond bursts, and safe to use as
//! file name components.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:x}-{count:04x}")
}

/// Generate a unique message id.
pub fn generate_message_id() -> String {
    generate_id("msg")
}

/// Generate a unique snapshot id.
pub fn generate_snapshot_id() -> String {
    generate_id("snap")
}

/// Generate a unique checkpoint record id.
pub fn generate_checkpoint_id() -> String {
    generate_id("cp")
}

/// Whether `id` can be used verbatim as a path component.
///
/// Accepts ASCII alphanumerics, `-`, `_` and `.`, rejects empty strings and
/// anything that could walk out of a directory.
pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
