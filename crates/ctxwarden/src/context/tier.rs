//! Context-size tiers and capacity-based sizing.
//!
//! A context limit is bucketed into one of five ordered [`ContextTier`]s.
//! Each tier fixes the compression strategy class, how many structured
//! checkpoints are rendered into the prompt, the target utilization used to
//! derive the verbatim-preservation budget, and the system-prompt budget.

use crate::compression::{CompressionStrategy, StrategyKind};
use crate::config::{CompressionConfig, ContextSizeConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

const GIB: u64 = 1024 * 1024 * 1024;

/// Tier breakpoints: a limit below `TIER_BREAKPOINTS[i]` lands in tier `i`.
pub const TIER_BREAKPOINTS: [usize; 4] = [4096, 8192, 32_768, 65_536];

/// Size class of the context window.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum ContextTier {
    /// Below 4K tokens.
    Minimal,
    /// 4K to 8K.
    Basic,
    /// 8K to 32K.
    Standard,
    /// 32K to 64K.
    Extended,
    /// 64K and above.
    Premium,
}

/// Parameters attached to a tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierProfile {
    pub strategy: StrategyKind,
    pub max_checkpoints: usize,
    pub utilization_target: f64,
    pub prompt_budget: usize,
}

impl ContextTier {
    pub const ALL: [ContextTier; 5] = [
        ContextTier::Minimal,
        ContextTier::Basic,
        ContextTier::Standard,
        ContextTier::Extended,
        ContextTier::Premium,
    ];

    /// Bucket a context limit into a tier.
    pub fn select(context_limit: usize) -> Self {
        match TIER_BREAKPOINTS
            .iter()
            .position(|&bound| context_limit < bound)
        {
            Some(0) => ContextTier::Minimal,
            Some(1) => ContextTier::Basic,
            Some(2) => ContextTier::Standard,
            Some(3) => ContextTier::Extended,
            _ => ContextTier::Premium,
        }
    }

    /// 1-based tier number.
    pub fn level(self) -> u8 {
        match self {
            ContextTier::Minimal => 1,
            ContextTier::Basic => 2,
            ContextTier::Standard => 3,
            ContextTier::Extended => 4,
            ContextTier::Premium => 5,
        }
    }

    pub fn profile(self) -> TierProfile {
        match self {
            ContextTier::Minimal => TierProfile {
                strategy: StrategyKind::Truncate,
                max_checkpoints: 2,
                utilization_target: 0.60,
                prompt_budget: 200,
            },
            ContextTier::Basic => TierProfile {
                strategy: StrategyKind::Truncate,
                max_checkpoints: 4,
                utilization_target: 0.65,
                prompt_budget: 500,
            },
            ContextTier::Standard => TierProfile {
                strategy: StrategyKind::Hybrid,
                max_checkpoints: 8,
                utilization_target: 0.70,
                prompt_budget: 1000,
            },
            ContextTier::Extended => TierProfile {
                strategy: StrategyKind::Hybrid,
                max_checkpoints: 12,
                utilization_target: 0.75,
                prompt_budget: 1500,
            },
            ContextTier::Premium => TierProfile {
                strategy: StrategyKind::Summarize,
                max_checkpoints: 20,
                utilization_target: 0.80,
                prompt_budget: 2000,
            },
        }
    }

    /// Compression strategy for this tier at `context_limit`.
    ///
    /// The verbatim budget is half the utilization target unless the config
    /// pins it; a configured default strategy overrides the tier's class.
    pub fn strategy_for(self, context_limit: usize, config: &CompressionConfig) -> CompressionStrategy {
        let profile = self.profile();
        let preserve_recent = config.preserve_recent.unwrap_or_else(|| {
            (profile.utilization_target * context_limit as f64 * 0.5).floor() as usize
        });
        CompressionStrategy {
            kind: config.default_strategy.unwrap_or(profile.strategy),
            preserve_recent,
            summary_max_tokens: Some(config.summary_max_tokens),
        }
    }
}

impl fmt::Display for ContextTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextTier::Minimal => "minimal",
            ContextTier::Basic => "basic",
            ContextTier::Standard => "standard",
            ContextTier::Extended => "extended",
            ContextTier::Premium => "premium",
        };
        write!(f, "tier {} ({name})", self.level())
    }
}

/// Shorthand for [`ContextTier::select`].
pub fn select_tier(context_limit: usize) -> ContextTier {
    ContextTier::select(context_limit)
}

// ── Capacity ───────────────────────────────────────────────────────

/// Reports accelerator memory available for the model, if known.
pub trait CapacitySource: Send + Sync {
    fn available_memory_bytes(&self) -> Option<u64>;
}

/// Capacity source that never knows anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownCapacity;

impl CapacitySource for UnknownCapacity {
    fn available_memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Fixed capacity, for tests and explicit overrides.
#[derive(Debug, Clone, Copy)]
pub struct FixedCapacity(pub u64);

impl CapacitySource for FixedCapacity {
    fn available_memory_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// Reads available memory in MiB from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCapacity {
    var: String,
}

impl EnvCapacity {
    pub const DEFAULT_VAR: &'static str = "CTXWARDEN_ACCELERATOR_MEMORY_MB";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCapacity {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl CapacitySource for EnvCapacity {
    fn available_memory_bytes(&self) -> Option<u64> {
        let raw = std::env::var(&self.var).ok()?;
        let mib: u64 = raw.trim().parse().ok()?;
        Some(mib.saturating_mul(1024 * 1024))
    }
}

/// Context size affordable with `bytes` of accelerator memory.
pub fn size_for_memory(bytes: u64) -> usize {
    match bytes {
        b if b < 4 * GIB => 4096,
        b if b < 8 * GIB => 8192,
        b if b < 16 * GIB => 32_768,
        b if b < 24 * GIB => 65_536,
        _ => 131_072,
    }
}

/// Resolve the working context limit.
///
/// Starts from the capacity-derived size (auto-sizing on, capacity known) or
/// the configured target, clamps to the configured min/max, then caps at the
/// model's own limit, which always wins.
pub fn resolve_context_limit(
    model_limit: Option<usize>,
    capacity: &dyn CapacitySource,
    config: &ContextSizeConfig,
) -> usize {
    let detected = if config.auto_size {
        capacity.available_memory_bytes().map(size_for_memory)
    } else {
        None
    };
    let base = detected.unwrap_or(config.target);
    let upper = config.max.max(config.min);
    let mut limit = base.clamp(config.min, upper);
    if let Some(model_limit) = model_limit {
        limit = limit.min(model_limit);
    }
    debug!(
        "Resolved context limit {limit} (detected={detected:?}, target={}, model={model_limit:?})",
        config.target
    );
    limit
}
