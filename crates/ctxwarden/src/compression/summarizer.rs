//! Provider-backed summarization of a message span.
//!
//! Builds a one-shot (system, user) request from the span, merging any
//! earlier summary so the result supersedes it, then streams the answer from
//! the [`ChatProvider`]. Transient failures are retried; timeouts and
//! cancellation are final.

use crate::api::provider::{ChatProvider, collect_chunks};
use crate::api::retry::RetryConfig;
use crate::compression::SUMMARY_MARKER;
use crate::{Message, ProviderError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Instructions sent as the system message of every summarization call.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths and function names mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise. Every token must earn its place.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Do not simply append: integrate, deduplicate, and update. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Build the summarization request for a span.
///
/// Earlier summaries in the span go under an `EXISTING SUMMARY` heading with
/// their marker stripped; everything else is listed as new messages.
pub fn build_summarization_request(span: &[Message]) -> Vec<Message> {
    let (existing, fresh): (Vec<&Message>, Vec<&Message>) =
        span.iter().partition(|m| m.is_summary());

    let mut content = String::new();
    if !existing.is_empty() {
        content.push_str("=== EXISTING SUMMARY ===\n");
        for summary in &existing {
            let body = summary
                .content
                .strip_prefix(SUMMARY_MARKER)
                .unwrap_or(&summary.content)
                .trim();
            content.push_str(body);
            content.push('\n');
        }
        content.push_str("\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }

    for msg in fresh {
        content.push_str(&format!("[{}]: {}\n\n", msg.role, msg.content));
    }

    vec![
        Message::system(SUMMARIZATION_PROMPT),
        Message::user(content),
    ]
}

/// One summarization client: provider, model, limits.
#[derive(Clone)]
pub struct Summarizer {
    provider: Arc<dyn ChatProvider>,
    model: String,
    max_tokens: usize,
    timeout: Duration,
    retry: RetryConfig,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 1024,
            timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Summarize `span`, returning the trimmed summary text.
    ///
    /// An empty answer is reported as a stream error.
    pub async fn summarize(
        &self,
        span: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = build_summarization_request(span);
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                res = tokio::time::timeout(self.timeout, self.call_once(request.clone())) => {
                    res.unwrap_or(Err(ProviderError::Timeout(self.timeout.as_secs())))
                }
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        "Summarization via {} failed (attempt {}): {e}; retrying in {delay:?}",
                        self.provider.name(),
                        attempt + 1
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, request: Vec<Message>) -> Result<String, ProviderError> {
        debug!(
            "Requesting summary from {} (model={}, max_tokens={})",
            self.provider.name(),
            self.model,
            self.max_tokens
        );
        let stream = self
            .provider
            .stream_chat(&self.model, request, self.max_tokens);
        let text = collect_chunks(stream).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::Stream("provider returned an empty summary".into()));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::provider::ChunkStream;
    use futures::StreamExt;
    use std::sync::Mutex;

    /// Replays one scripted outcome per call.
    struct Scripted {
        outcomes: Mutex<Vec<Result<Vec<&'static str>, ProviderError>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Vec<&'static str>, ProviderError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }
    }

    impl ChatProvider for Scripted {
        fn stream_chat(&self, _: &str, _: Vec<Message>, _: usize) -> ChunkStream<'_> {
            *self.calls.lock().unwrap() += 1;
            let next = self.outcomes.lock().unwrap().remove(0);
            match next {
                Ok(chunks) => futures::stream::iter(chunks.into_iter().map(|c| Ok(c.to_string())))
                    .boxed(),
                Err(e) => futures::stream::iter(vec![Err(e)]).boxed(),
            }
        }
    }

    struct Hanging;

    impl ChatProvider for Hanging {
        fn stream_chat(&self, _: &str, _: Vec<Message>, _: usize) -> ChunkStream<'_> {
            futures::stream::pending::<Result<String, ProviderError>>().boxed()
        }
    }

    fn fast_retry(n: u32) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryConfig::with_retries(n)
        }
    }

    #[test]
    fn request_without_existing_summary() {
        let span = vec![Message::assistant("Read src/main.rs"), Message::tool("fn main() {}")];
        let request = build_summarization_request(&span);
        assert_eq!(request.len(), 2);
        assert!(request[0].content.contains("Summarize"));
        assert!(request[1].content.contains("[assistant]: Read src/main.rs"));
        assert!(request[1].content.contains("[tool]: fn main() {}"));
        assert!(!request[1].content.contains("EXISTING SUMMARY"));
    }

    #[test]
    fn request_merges_existing_summary() {
        let span = vec![
            Message::system(format!("{SUMMARY_MARKER} Found the entry point.")),
            Message::assistant("Now reading lib.rs"),
        ];
        let request = build_summarization_request(&span);
        let body = &request[1].content;
        assert!(body.contains("=== EXISTING SUMMARY ===\nFound the entry point."));
        assert!(body.contains("NEW MESSAGES TO SUMMARIZE"));
        assert!(!body.contains(SUMMARY_MARKER));
    }

    #[tokio::test]
    async fn concatenates_chunks() {
        let provider = Arc::new(Scripted::new(vec![Ok(vec!["Fixed ", "the parser."])]));
        let summarizer = Summarizer::new(provider, "m");
        let text = summarizer
            .summarize(&[Message::assistant("x")], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "Fixed the parser.");
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let provider = Arc::new(Scripted::new(vec![
            Err(ProviderError::Http {
                status: 503,
                body: "busy".into(),
            }),
            Ok(vec!["ok"]),
        ]));
        let summarizer = Summarizer::new(provider.clone(), "m").with_retry(fast_retry(2));
        let text = summarizer
            .summarize(&[Message::assistant("x")], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(*provider.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = Arc::new(Scripted::new(vec![Err(ProviderError::Http {
            status: 401,
            body: "no".into(),
        })]));
        let summarizer = Summarizer::new(provider.clone(), "m").with_retry(fast_retry(3));
        let err = summarizer
            .summarize(&[Message::assistant("x")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 401, .. }));
        assert_eq!(*provider.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_answer_is_an_error() {
        let provider = Arc::new(Scripted::new(vec![Ok(vec!["  ", "\n"])]));
        let summarizer = Summarizer::new(provider, "m");
        let err = summarizer
            .summarize(&[Message::assistant("x")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Stream(_)));
    }

    #[tokio::test]
    async fn times_out() {
        let summarizer =
            Summarizer::new(Arc::new(Hanging), "m").with_timeout(Duration::from_millis(20));
        let err = summarizer
            .summarize(&[Message::assistant("x")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_call() {
        let summarizer = Summarizer::new(Arc::new(Hanging), "m");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = summarizer
            .summarize(&[Message::assistant("x")], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Cancelled);
    }
}
