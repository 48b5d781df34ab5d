//! Configuration consumed by the context engine.
//!
//! Every recognized setting is a typed field with a documented default.
//! Unknown keys found in a config file land in [`ContextConfig::extra`] so
//! newer files still load on older builds.
//!
//! # Examples
//!
//! Defaults:
//!
//! ```
//! use ctxwarden::config::ContextConfig;
//!
//! let config = ContextConfig::default();
//! assert!(config.compression.enabled);
//! assert_eq!(config.snapshots.config.max_count, 10);
//! ```
//!
//! Disabling a module and tweaking another:
//!
//! ```
//! use ctxwarden::config::{ContextConfig, SnapshotsToggle};
//!
//! let config = ContextConfig {
//!     snapshots: SnapshotsToggle::disabled(),
//!     ..ContextConfig::default()
//! }
//! .with_compression_threshold(0.7);
//! assert!(!config.snapshots.enabled);
//! ```

use crate::api::retry::RetryConfig;
use crate::compression::StrategyKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for module configurations.
///
/// When `enabled` is `false`, the module is skipped regardless of the inner
/// config values, and explicit calls into it fail with a configuration error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    #[serde(flatten)]
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

/// Compression module configuration.
pub type CompressionToggle = Toggle<CompressionConfig>;
/// Snapshot module configuration.
pub type SnapshotsToggle = Toggle<SnapshotConfig>;

// ── Compression ───────────────────────────────────────────────────

/// Settings for the compression engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Usage fraction at which compression starts. Default: `0.80`.
    pub threshold: f64,
    /// Strategy forced for every tier. `None` uses the tier's strategy class.
    pub default_strategy: Option<StrategyKind>,
    /// Token budget kept verbatim. `None` derives it from the tier's
    /// utilization target.
    pub preserve_recent: Option<usize>,
    /// Maximum tokens for a generated summary. Default: `1024`.
    pub summary_max_tokens: usize,
    /// Model used for summaries. `None` uses the session's model.
    pub summary_model: Option<String>,
    /// Upper bound on one summarization call, in seconds. Default: `60`.
    pub timeout_secs: u64,
    /// Retries for transient provider errors. Default: `2`.
    pub max_retries: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            default_strategy: None,
            preserve_recent: None,
            summary_max_tokens: 1024,
            summary_model: None,
            timeout_secs: 60,
            max_retries: 2,
        }
    }
}

impl CompressionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_retries(self.max_retries)
    }
}

// ── Snapshots ─────────────────────────────────────────────────────

/// Settings for snapshot persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Root directory; each session gets a subdirectory. Default: `.ctxwarden/snapshots`.
    pub directory: PathBuf,
    /// Take a snapshot automatically when usage crosses `auto_threshold`.
    pub auto_create: bool,
    /// Usage fraction for automatic snapshots. Default: `0.85`.
    pub auto_threshold: f64,
    /// Maximum snapshots retained per session. Default: `10`.
    pub max_count: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".ctxwarden/snapshots"),
            auto_create: true,
            auto_threshold: 0.85,
            max_count: 10,
        }
    }
}

// ── Context size ──────────────────────────────────────────────────

/// How large the working context should be.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSizeConfig {
    /// Preferred size when auto-sizing is off or has no data. Default: `8192`.
    pub target: usize,
    /// Lower clamp. Default: `2048`.
    pub min: usize,
    /// Upper clamp. Default: `131072`.
    pub max: usize,
    /// Derive the size from available accelerator memory. Default: `true`.
    pub auto_size: bool,
}

impl Default for ContextSizeConfig {
    fn default() -> Self {
        Self {
            target: 8192,
            min: 2048,
            max: 131_072,
            auto_size: true,
        }
    }
}

// ── Root ──────────────────────────────────────────────────────────

/// Root configuration for a [`ContextOrchestrator`](crate::orchestrator::ContextOrchestrator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub compression: CompressionToggle,
    pub snapshots: SnapshotsToggle,
    pub context_size: ContextSizeConfig,
    /// Unrecognized keys, kept verbatim for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContextConfig {
    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the usage fraction at which compression starts.
    pub fn with_compression_threshold(mut self, threshold: f64) -> Self {
        self.compression.config.threshold = threshold;
        self
    }

    /// Set the snapshot root directory.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshots.config.directory = dir.into();
        self
    }

    /// Set the per-session snapshot limit.
    pub fn with_max_snapshots(mut self, max: usize) -> Self {
        self.snapshots.config.max_count = max;
        self
    }

    /// Force one strategy for every tier.
    pub fn with_strategy(mut self, kind: StrategyKind) -> Self {
        self.compression.config.default_strategy = Some(kind);
        self
    }
}
