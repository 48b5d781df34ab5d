//! OpenRouter chat completions over Server-Sent Events.
//!
//! [`OpenRouterClient`] implements [`ChatProvider`] by posting a streaming
//! request and turning each `data:` line's text delta into one chunk. The
//! body is read incrementally via `chunk()` so long summaries never hit a
//! single-body timeout.

use crate::api::provider::{ChatProvider, ChunkStream};
use crate::{Message, MessageRole, ProviderError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENROUTER_KEY";

// ── Request types ──────────────────────────────────────────────────

/// Message shape on the wire: role and content only.
#[derive(Serialize, Debug)]
struct WireMessage {
    role: MessageRole,
    content: String,
}

/// Streaming chat completion request body.
#[derive(Serialize, Debug)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

impl ChatRequest {
    fn streaming(model: &str, messages: Vec<Message>, max_tokens: usize) -> Self {
        Self {
            model: model.to_string(),
            messages: messages
                .into_iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            max_tokens,
            temperature: 0.2,
            stream: true,
        }
    }
}

// ── SSE chunk types ────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

/// Token usage reported in the final chunk.
#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_headers(api_key, "https://github.com/ctxwarden", "ctxwarden")
    }

    /// Create a client from the `OPENROUTER_KEY` environment variable.
    pub fn from_env() -> Result<Self, ProviderError> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| ProviderError::Request(format!("{API_KEY_ENV} not set")))?;
        Self::new(key)
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("ctxwarden/0.1")
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    async fn open_stream(&self, body: ChatRequest) -> Result<reqwest::Response, ProviderError> {
        debug!(
            "Streaming request: model={}, messages={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.max_tokens
        );

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(resp)
    }
}

impl ChatProvider for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn stream_chat(
        &self,
        model: &str,
        messages: Vec<Message>,
        max_tokens: usize,
    ) -> ChunkStream<'_> {
        let body = ChatRequest::streaming(model, messages, max_tokens);
        futures::stream::once(self.open_stream(body))
            .flat_map(|opened| match opened {
                Ok(resp) => sse_text_stream(resp).boxed(),
                Err(e) => futures::stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed()
    }
}

// ── SSE decoding ───────────────────────────────────────────────────

/// Reader state threaded through [`futures::stream::unfold`].
struct SseReader {
    resp: reqwest::Response,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
}

impl SseReader {
    /// Move every complete line out of the buffer into `pending`.
    fn drain_lines(&mut self) {
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            if parse_sse_line(line.trim(), &mut self.pending) {
                self.done = true;
                return;
            }
        }
    }
}

fn sse_text_stream(
    resp: reqwest::Response,
) -> impl futures::Stream<Item = Result<String, ProviderError>> + Send + 'static {
    let reader = SseReader {
        resp,
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(text) = reader.pending.pop_front() {
                return Some((Ok(text), reader));
            }
            if reader.done {
                return None;
            }
            match reader.resp.chunk().await {
                Ok(Some(bytes)) => {
                    reader.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    reader.drain_lines();
                }
                Ok(None) => {
                    // Incomplete final line without a trailing newline.
                    let remaining = std::mem::take(&mut reader.buffer);
                    parse_sse_line(remaining.trim(), &mut reader.pending);
                    reader.done = true;
                }
                Err(e) => {
                    reader.done = true;
                    reader.pending.clear();
                    return Some((Err(ProviderError::Stream(e.to_string())), reader));
                }
            }
        }
    })
}

/// Parse one SSE line, pushing any text delta. Returns `true` on `[DONE]`.
fn parse_sse_line(line: &str, out: &mut VecDeque<String>) -> bool {
    if line.is_empty() || line.starts_with(':') {
        return false;
    }
    if line == "data: [DONE]" {
        return true;
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return false;
    };
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(usage) = chunk.usage {
                debug!(
                    "Summary token usage: prompt={}, completion={}",
                    usage.prompt_tokens.unwrap_or(0),
                    usage.completion_tokens.unwrap_or(0)
                );
            }
            for choice in chunk.choices.unwrap_or_default() {
                if let Some(content) = choice.delta.and_then(|d| d.content)
                    && !content.is_empty()
                {
                    out.push_back(content);
                }
                if choice.finish_reason.is_some() {
                    trace!("Stream finish_reason: {:?}", choice.finish_reason);
                }
            }
        }
        Err(e) => warn!("Failed to parse SSE chunk: {e} (data: {data})"),
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_deltas() {
        let mut out = VecDeque::new();
        let done = parse_sse_line(
            r#"data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
            &mut out,
        );
        assert!(!done);
        assert_eq!(out.pop_front().as_deref(), Some("Hello"));
    }

    #[test]
    fn done_marker_ends_stream() {
        let mut out = VecDeque::new();
        assert!(parse_sse_line("data: [DONE]", &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn comments_and_empty_deltas_ignored() {
        let mut out = VecDeque::new();
        assert!(!parse_sse_line(": OPENROUTER PROCESSING", &mut out));
        assert!(!parse_sse_line("", &mut out));
        parse_sse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#, &mut out);
        parse_sse_line(
            r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_chunk_is_skipped() {
        let mut out = VecDeque::new();
        assert!(!parse_sse_line("data: {not json", &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn request_serializes_roles_lowercase() {
        let req = ChatRequest::streaming("m", vec![Message::system("s"), Message::user("u")], 64);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "u");
        assert_eq!(json["stream"], true);
        assert!(json["messages"][0].get("id").is_none());
    }
}
