//! Point-in-time usage of the context window.

use crate::at_or_above;
use serde::{Deserialize, Serialize};

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub estimated_tokens: usize,
    /// Maximum context window.
    pub max_tokens: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Compute usage for `tokens` out of `max_tokens`. A zero-sized window
    /// reports full usage.
    pub fn new(estimated_tokens: usize, max_tokens: usize) -> Self {
        let usage_pct = if max_tokens > 0 {
            estimated_tokens as f64 / max_tokens as f64
        } else {
            1.0
        };
        Self {
            estimated_tokens,
            max_tokens,
            usage_pct,
        }
    }

    /// Tokens left before the window is full.
    pub fn remaining(&self) -> usize {
        self.max_tokens.saturating_sub(self.estimated_tokens)
    }

    /// Whether usage is at or above `fraction` (epsilon-tolerant).
    pub fn exceeds(&self, fraction: f64) -> bool {
        at_or_above(self.usage_pct, fraction)
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.max_tokens,
        )
    }
}
