//! Conversation state and the lookup tables that size it.
//!
//! 1. **[`tokens`]**: [`TokenCounter`] trait and the default character-ratio
//!    estimator with an id-keyed memo cache.
//! 2. **[`budget`]**: [`ContextUsage`], a point-in-time usage reading.
//! 3. **[`tier`]**: five context-size tiers and capacity-based sizing.
//! 4. **[`mode`]**: operational modes, content categories and protection rules.
//! 5. **[`prompt`]**: system prompt templates keyed by (tier, mode).
//! 6. **[`conversation`]**: the live [`ConversationContext`].

pub mod budget;
pub mod conversation;
pub mod mode;
pub mod prompt;
pub mod tier;
pub mod tokens;

pub use budget::ContextUsage;
pub use conversation::{
    Checkpoint, CheckpointKind, CompressionRecord, ContextMetadata, ConversationContext, GoalStack,
    ModelInfo, ReasoningTrace,
};
pub use mode::{ContentCategory, ModeProfile, OperationalMode};
pub use prompt::{PromptTemplate, select_prompt_template};
pub use tier::{CapacitySource, ContextTier, resolve_context_limit, select_tier};
pub use tokens::{DEFAULT_CHARS_PER_TOKEN, HeuristicTokenCounter, TokenCounter};
