//! The provider adapter consumed by the compression engine.
//!
//! The engine needs exactly one thing from an LLM backend: given a model id
//! and a message list, a stream of text chunks. Everything else about the
//! provider client (auth, routing, tools) stays outside this crate.

use crate::{Message, ProviderError};
use futures::StreamExt;
use futures::stream::BoxStream;

/// Stream of text chunks produced by a streaming chat completion.
///
/// A connection failure is reported as the first (and only) `Err` item.
pub type ChunkStream<'a> = BoxStream<'a, Result<String, ProviderError>>;

/// A backend able to stream a chat completion.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl ChatProvider for Echo {
///     fn stream_chat(&self, _model: &str, messages: Vec<Message>, _max_tokens: usize) -> ChunkStream<'_> {
///         let text = messages.last().map(|m| m.content.clone()).unwrap_or_default();
///         futures::stream::iter(vec![Ok(text)]).boxed()
///     }
/// }
/// ```
pub trait ChatProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "provider"
    }

    /// Start a streaming chat completion.
    fn stream_chat(&self, model: &str, messages: Vec<Message>, max_tokens: usize)
    -> ChunkStream<'_>;
}

/// Concatenate every chunk of a stream. The first error aborts collection.
pub async fn collect_chunks(mut stream: ChunkStream<'_>) -> Result<String, ProviderError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}
