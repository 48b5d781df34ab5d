//! Provider layer: everything between the compression engine and the LLM.
//!
//! - [`provider`]: the [`ChatProvider`] trait, the single operation the
//!   engine consumes: stream a chat completion as text chunks.
//! - [`openrouter`]: [`OpenRouterClient`](openrouter::OpenRouterClient), an
//!   SSE-backed [`ChatProvider`] for the OpenRouter chat completions API.
//! - [`retry`]: exponential backoff with jitter for transient failures.
//! - [`ids`]: unique ids for messages, snapshots and checkpoints.

pub mod ids;
pub mod openrouter;
pub mod provider;
pub mod retry;

// Re-export commonly used items at the module level.
pub use provider::{ChatProvider, ChunkStream, collect_chunks};
pub use retry::RetryConfig;
