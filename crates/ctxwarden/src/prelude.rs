//! Convenience re-exports for common `ctxwarden` types.
//!
//! ```ignore
//! use ctxwarden::prelude::*;
//! ```
//!
//! Covers what a client needs to run a session: the orchestrator and its
//! event handlers, configuration, messages, token counting and the provider
//! trait. Storage internals and the compression plan are left out; import
//! those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ContextError, Message, MessageRole, ProviderError, Result};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{
    CompressionConfig, ContextConfig, ContextSizeConfig, SnapshotConfig, Toggle,
};

// ── Context ─────────────────────────────────────────────────────────
pub use crate::context::{
    ContextTier, ContextUsage, ConversationContext, HeuristicTokenCounter, ModelInfo,
    OperationalMode, TokenCounter,
};

// ── Compression ─────────────────────────────────────────────────────
pub use crate::compression::{
    CompressionEngine, CompressionResult, CompressionStatus, CompressionStrategy, StrategyKind,
};

// ── Snapshots ───────────────────────────────────────────────────────
pub use crate::snapshot::{SnapshotManager, SnapshotMetadata, ThresholdHit};

// ── Orchestration ───────────────────────────────────────────────────
pub use crate::orchestrator::{
    ChannelHandler, CompositeEventHandler, ContextEvent, ContextOrchestrator, EventHandler,
    FnEventHandler, LoggingHandler, NoopHandler,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::api::ChatProvider;
pub use crate::api::openrouter::OpenRouterClient;
