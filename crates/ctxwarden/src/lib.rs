//! Context-window management engine for terminal LLM clients.
//!
//! `ctxwarden` keeps an unboundedly growing conversation inside a fixed token
//! budget. The budget is the model's context limit, sized for the running
//! environment; the engine decides what stays verbatim, what gets compressed,
//! and when to persist a recovery point. The core abstraction is the
//! [`ContextOrchestrator`](orchestrator::ContextOrchestrator), which owns one
//! live [`ConversationContext`](context::ConversationContext) and drives the
//! other components:
//!
//! ```ignore
//! use ctxwarden::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ctxwarden::Result<()> {
//!     let counter = Arc::new(HeuristicTokenCounter::default());
//!     let model = ModelInfo::new("anthropic/claude-sonnet-4", Some(32_768));
//!
//!     let mut orchestrator = ContextOrchestrator::new("session-1", model, ContextConfig::default(), counter)
//!         .with_event_handler(LoggingHandler);
//!     orchestrator.start()?;
//!
//!     orchestrator.add_message(Message::user("Refactor the storage layer.")).await?;
//!     orchestrator.add_message(Message::assistant("Starting with the index file.")).await?;
//!
//!     println!("{}", orchestrator.usage().to_log_string());
//!     orchestrator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Token estimates:** [`TokenCounter`](context::tokens::TokenCounter) and the
//!   default [`HeuristicTokenCounter`](context::tokens::HeuristicTokenCounter).
//! - **Sizing:** [`context::tier`] buckets a context limit into a
//!   [`ContextTier`](context::tier::ContextTier); [`context::mode`] holds the
//!   per-mode protection rules; [`context::prompt`] selects the system prompt.
//! - **Compression:** [`CompressionEngine`](compression::CompressionEngine) with
//!   truncate, summarize and hybrid strategies.
//! - **Recovery points:** [`SnapshotStorage`](snapshot::SnapshotStorage) and
//!   [`SnapshotManager`](snapshot::SnapshotManager).
//! - **Provider calls:** the [`ChatProvider`](api::ChatProvider) trait and the
//!   OpenRouter implementation in [`api::openrouter`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Provider adapter trait, OpenRouter SSE client, retry, id generation |
//! | [`context`] | Token counting, usage, tiers, modes, prompts, conversation state |
//! | [`compression`] | Compression engine, selection plan, summarizer |
//! | [`snapshot`] | Snapshot documents, storage, manager, threshold monitor |
//! | [`orchestrator`] | Live-session state machine and its events |

pub mod api;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod prelude;
pub mod snapshot;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use context::mode::ContentCategory;
pub use error::{ContextError, ProviderError, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Default model for summarization calls when none is configured.
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-haiku";

/// Fixed fraction at which the pre-overflow warning fires, regardless of
/// registered thresholds.
pub const OVERFLOW_WARNING_FRACTION: f64 = 0.95;

/// Tolerance used for every threshold comparison.
pub const THRESHOLD_EPSILON: f64 = 1e-9;

/// `value >= threshold`, tolerant of floating-point noise.
pub fn at_or_above(value: f64, threshold: f64) -> bool {
    value + THRESHOLD_EPSILON >= threshold
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Cached token estimate, filled in by the orchestrator on add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    /// Content category assigned by the active mode's extraction rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ContentCategory>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: api::ids::generate_message_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            token_count: None,
            category: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Tag the message with a content category.
    pub fn with_category(mut self, category: ContentCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }

    /// Whether this message is a summary produced by an earlier compression.
    pub fn is_summary(&self) -> bool {
        self.is_system() && self.content.starts_with(compression::SUMMARY_MARKER)
    }
}

/// Extract the first `max_chars` characters of the first user message.
pub fn extract_message_preview(messages: &[Message], max_chars: usize) -> String {
    messages
        .iter()
        .find(|m| m.is_user())
        .map(|m| m.content.chars().take(max_chars).collect())
        .unwrap_or_default()
}
