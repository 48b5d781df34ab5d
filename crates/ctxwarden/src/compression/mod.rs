//! Compression engine: truncate, summarize and hybrid strategies.
//!
//! Every strategy runs the same [`CompressionPlan`] first, so the safety
//! rules hold no matter which one is chosen:
//!
//! - user messages are copied to `preserved` untouched and never summarized,
//! - the first system message is always kept,
//! - at least `max(preserve_recent, 0.30 × total)` tokens of non-user content
//!   stay verbatim,
//! - a result that did not shrink the context is marked
//!   [`CompressionStatus::Inflated`] and returned intact.
//!
//! Summarization never makes `compress()` fail: a missing provider, an
//! error, a timeout or a cancellation all produce a deterministic
//! placeholder summary instead.

pub mod plan;
pub mod summarizer;

pub use plan::{CompressionPlan, PRESERVATION_FLOOR_FRACTION, preservation_floor};
pub use summarizer::{Summarizer, build_summarization_request};

use crate::api::provider::ChatProvider;
use crate::api::retry::RetryConfig;
use crate::config::CompressionConfig;
use crate::context::conversation::CompressionRecord;
use crate::context::mode::{ModeProfile, OperationalMode};
use crate::context::tokens::TokenCounter;
use crate::{DEFAULT_MODEL, Message, MessageRole};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix carried by every synthesized summary message.
pub const SUMMARY_MARKER: &str = "[Conversation summary]";

/// Input tokens the summarizer may consume per output token in hybrid mode.
const HYBRID_INPUT_PER_SUMMARY_TOKEN: usize = 4;

/// Placeholder used whenever no summary text could be produced.
pub fn fallback_summary_text(compressed: usize) -> String {
    format!(
        "{SUMMARY_MARKER} {compressed} earlier message(s) were compressed, but no summary could be generated."
    )
}

fn noop_summary_text() -> String {
    format!("{SUMMARY_MARKER} Nothing was compressed.")
}

// ── Strategy and result types ──────────────────────────────────────

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Truncate,
    Summarize,
    Hybrid,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Truncate => write!(f, "truncate"),
            StrategyKind::Summarize => write!(f, "summarize"),
            StrategyKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Parameters for one compression pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionStrategy {
    pub kind: StrategyKind,
    /// Tokens of recent non-user content to keep verbatim.
    pub preserve_recent: usize,
    /// Cap on generated summary length.
    pub summary_max_tokens: Option<usize>,
}

impl CompressionStrategy {
    pub fn new(kind: StrategyKind, preserve_recent: usize) -> Self {
        Self {
            kind,
            preserve_recent,
            summary_max_tokens: None,
        }
    }

    pub fn truncate(preserve_recent: usize) -> Self {
        Self::new(StrategyKind::Truncate, preserve_recent)
    }

    pub fn summarize(preserve_recent: usize) -> Self {
        Self::new(StrategyKind::Summarize, preserve_recent)
    }

    pub fn hybrid(preserve_recent: usize) -> Self {
        Self::new(StrategyKind::Hybrid, preserve_recent)
    }

    pub fn with_summary_max_tokens(mut self, tokens: usize) -> Self {
        self.summary_max_tokens = Some(tokens);
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStatus {
    Success,
    /// The candidate is not smaller than the input. Nothing was discarded;
    /// the caller decides what to do with it.
    Inflated,
}

/// Outcome of one compression pass.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub status: CompressionStatus,
    pub strategy: StrategyKind,
    /// Messages kept verbatim, in input order.
    pub preserved: Vec<Message>,
    /// Synthesized summary (role = system).
    pub summary: Message,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compression_ratio: f64,
    pub truncated_count: usize,
    pub summarized_count: usize,
    /// The placeholder replaced a provider summary.
    pub used_fallback: bool,
}

impl CompressionResult {
    fn noop(strategy: StrategyKind, messages: Vec<Message>, original_tokens: usize) -> Self {
        let summary = Message::system(noop_summary_text());
        Self {
            status: CompressionStatus::Success,
            strategy,
            preserved: messages,
            summary,
            original_tokens,
            compressed_tokens: original_tokens,
            compression_ratio: 1.0,
            truncated_count: 0,
            summarized_count: 0,
            used_fallback: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompressionStatus::Success
    }

    pub fn is_inflated(&self) -> bool {
        self.status == CompressionStatus::Inflated
    }

    /// Nothing was dropped; the summary is a placeholder not meant for insertion.
    pub fn is_noop(&self) -> bool {
        self.messages_compressed() == 0
    }

    pub fn messages_compressed(&self) -> usize {
        self.truncated_count + self.summarized_count
    }

    /// The replacement message list: preserved messages plus the summary,
    /// chronologically ordered. A no-op result yields the input unchanged.
    pub fn into_messages(self) -> Vec<Message> {
        let noop = self.is_noop();
        let mut messages = self.preserved;
        if !noop {
            messages.push(self.summary);
            messages.sort_by_key(|m| m.timestamp);
        }
        messages
    }

    pub fn to_record(&self) -> CompressionRecord {
        CompressionRecord {
            timestamp: Utc::now(),
            strategy: self.strategy,
            original_tokens: self.original_tokens,
            compressed_tokens: self.compressed_tokens,
            ratio: self.compression_ratio,
            messages_compressed: self.messages_compressed(),
            used_fallback: self.used_fallback,
        }
    }
}

/// Summary text and bookkeeping before token accounting.
struct Draft {
    text: String,
    truncated: usize,
    summarized: usize,
    used_fallback: bool,
}

// ── Engine ─────────────────────────────────────────────────────────

/// Runs compression passes over message sets.
///
/// Cheap to clone: collaborators are shared behind `Arc`.
#[derive(Clone)]
pub struct CompressionEngine {
    counter: Arc<dyn TokenCounter>,
    provider: Option<Arc<dyn ChatProvider>>,
    summary_model: String,
    timeout: Duration,
    retry: RetryConfig,
    profile: ModeProfile,
}

impl CompressionEngine {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            counter,
            provider: None,
            summary_model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            profile: OperationalMode::default().profile(),
        }
    }

    /// Engine configured from `config`; the summary model defaults to `session_model`.
    pub fn from_config(
        counter: Arc<dyn TokenCounter>,
        config: &CompressionConfig,
        session_model: &str,
    ) -> Self {
        Self {
            summary_model: config
                .summary_model
                .clone()
                .unwrap_or_else(|| session_model.to_string()),
            timeout: config.timeout(),
            retry: config.retry(),
            ..Self::new(counter)
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = model.into();
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

    pub fn with_profile(mut self, profile: ModeProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn set_provider(&mut self, provider: Option<Arc<dyn ChatProvider>>) {
        self.provider = provider;
    }

    pub fn set_profile(&mut self, profile: ModeProfile) {
        self.profile = profile;
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    fn counts(&self, messages: &[Message]) -> Vec<usize> {
        messages
            .iter()
            .map(|m| self.counter.count_message_tokens(m))
            .collect()
    }

    /// Compress `messages` with `strategy`.
    ///
    /// Never fails: provider problems degrade to a placeholder summary.
    /// `cancel` aborts an in-flight provider call.
    pub async fn compress(
        &self,
        messages: &[Message],
        strategy: &CompressionStrategy,
        cancel: &CancellationToken,
    ) -> CompressionResult {
        if strategy.kind == StrategyKind::Truncate {
            return self.truncate(messages, strategy.preserve_recent);
        }

        let counts = self.counts(messages);
        let plan = CompressionPlan::build(
            messages,
            &counts,
            &self.profile,
            strategy.preserve_recent,
            true,
        );
        if plan.is_noop() {
            debug!(
                "Nothing to compress: floor {} covers all non-user content",
                plan.floor_tokens
            );
            return CompressionResult::noop(strategy.kind, messages.to_vec(), plan.total_tokens);
        }

        let (preserved, dropped) = plan.split(messages);
        let anchor = dropped.first().map(|m| m.timestamp).unwrap_or_else(Utc::now);
        let max_tokens = strategy.summary_max_tokens.unwrap_or(1024);

        let draft = match strategy.kind {
            StrategyKind::Hybrid => {
                let budget = max_tokens.saturating_mul(HYBRID_INPUT_PER_SUMMARY_TOKEN);
                let (old, recent) = self.split_for_hybrid(&dropped, budget);
                self.hybrid_draft(&old, &recent, dropped.len(), max_tokens, cancel)
                    .await
            }
            _ => {
                self.summarize_draft(&dropped, dropped.len(), max_tokens, cancel)
                    .await
            }
        };

        self.finish(strategy.kind, preserved, draft, anchor, plan.total_tokens)
    }

    /// Synchronous truncate pass. Used directly for emergency relief.
    pub fn truncate(&self, messages: &[Message], preserve_recent: usize) -> CompressionResult {
        let counts = self.counts(messages);
        let plan =
            CompressionPlan::build(messages, &counts, &self.profile, preserve_recent, false);
        if plan.is_noop() {
            return CompressionResult::noop(
                StrategyKind::Truncate,
                messages.to_vec(),
                plan.total_tokens,
            );
        }
        let (preserved, dropped) = plan.split(messages);
        let anchor = dropped.first().map(|m| m.timestamp).unwrap_or_else(Utc::now);
        let draft = Draft {
            text: format!("{SUMMARY_MARKER} {}", truncation_note(&dropped)),
            truncated: dropped.len(),
            summarized: 0,
            used_fallback: false,
        };
        self.finish(StrategyKind::Truncate, preserved, draft, anchor, plan.total_tokens)
    }

    /// Split the overflow into (truncated, summarized), both chronological.
    ///
    /// The newest messages go to the summarizer until `budget` input tokens
    /// are used (at least one always goes); earlier summaries always go.
    fn split_for_hybrid(&self, dropped: &[Message], budget: usize) -> (Vec<Message>, Vec<Message>) {
        let mut to_summarize = vec![false; dropped.len()];
        let mut used = 0usize;
        let mut any_regular = false;
        let mut open = true;
        for (i, m) in dropped.iter().enumerate().rev() {
            if m.is_summary() {
                to_summarize[i] = true;
                continue;
            }
            if !open {
                continue;
            }
            let tokens = self.counter.count_message_tokens(m);
            if !any_regular || used + tokens <= budget {
                to_summarize[i] = true;
                used += tokens;
                any_regular = true;
            } else {
                open = false;
            }
        }

        let mut old = Vec::new();
        let mut recent = Vec::new();
        for (m, summarize) in dropped.iter().zip(to_summarize) {
            if summarize {
                recent.push(m.clone());
            } else {
                old.push(m.clone());
            }
        }
        (old, recent)
    }

    async fn summarize_draft(
        &self,
        span: &[Message],
        compressed: usize,
        max_tokens: usize,
        cancel: &CancellationToken,
    ) -> Draft {
        match self.request_summary(span, max_tokens, cancel).await {
            Some(text) => Draft {
                text: format!("{SUMMARY_MARKER}\n{text}"),
                truncated: 0,
                summarized: span.len(),
                used_fallback: false,
            },
            None => Draft {
                text: fallback_summary_text(compressed),
                truncated: 0,
                summarized: span.len(),
                used_fallback: true,
            },
        }
    }

    async fn hybrid_draft(
        &self,
        old: &[Message],
        recent: &[Message],
        compressed: usize,
        max_tokens: usize,
        cancel: &CancellationToken,
    ) -> Draft {
        match self.request_summary(recent, max_tokens, cancel).await {
            Some(text) if old.is_empty() => Draft {
                text: format!("{SUMMARY_MARKER}\n{text}"),
                truncated: 0,
                summarized: recent.len(),
                used_fallback: false,
            },
            Some(text) => Draft {
                text: format!("{SUMMARY_MARKER} {}\n{text}", truncation_note(old)),
                truncated: old.len(),
                summarized: recent.len(),
                used_fallback: false,
            },
            None => Draft {
                text: fallback_summary_text(compressed),
                truncated: old.len(),
                summarized: recent.len(),
                used_fallback: true,
            },
        }
    }

    /// Provider summary for `span`, or `None` when the placeholder must be used.
    async fn request_summary(
        &self,
        span: &[Message],
        max_tokens: usize,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let Some(provider) = &self.provider else {
            warn!(
                "No summarization provider configured; using placeholder for {} message(s)",
                span.len()
            );
            return None;
        };
        let summarizer = Summarizer::new(Arc::clone(provider), &self.summary_model)
            .with_max_tokens(max_tokens)
            .with_timeout(self.timeout)
            .with_retry(self.retry.clone());
        match summarizer.summarize(span, cancel).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Summarization failed, using placeholder: {e}");
                None
            }
        }
    }

    fn finish(
        &self,
        strategy: StrategyKind,
        preserved: Vec<Message>,
        draft: Draft,
        anchor: DateTime<Utc>,
        original_tokens: usize,
    ) -> CompressionResult {
        let summary = Message::system(draft.text).with_timestamp(anchor);
        let compressed_tokens = self.counter.count_conversation_tokens(&preserved)
            + self.counter.count_message_tokens(&summary);
        let compression_ratio = if original_tokens > 0 {
            compressed_tokens as f64 / original_tokens as f64
        } else {
            1.0
        };
        let status = if compressed_tokens >= original_tokens {
            warn!(
                "Compression inflated context: {original_tokens} -> {compressed_tokens} tokens ({strategy})"
            );
            CompressionStatus::Inflated
        } else {
            info!(
                "Compressed {} message(s) with {strategy}: {original_tokens} -> {compressed_tokens} tokens ({:.0}%)",
                draft.truncated + draft.summarized,
                compression_ratio * 100.0
            );
            CompressionStatus::Success
        };

        CompressionResult {
            status,
            strategy,
            preserved,
            summary,
            original_tokens,
            compressed_tokens,
            compression_ratio,
            truncated_count: draft.truncated,
            summarized_count: draft.summarized,
            used_fallback: draft.used_fallback,
        }
    }
}

/// "Truncated N earlier message(s): a assistant, t tool." plus a note when
/// earlier summaries were among them.
fn truncation_note(dropped: &[Message]) -> String {
    let count = |role: MessageRole| {
        dropped
            .iter()
            .filter(|m| m.role == role && !m.is_summary())
            .count()
    };
    let parts: Vec<String> = [MessageRole::Assistant, MessageRole::Tool, MessageRole::System]
        .into_iter()
        .map(|role| (role, count(role)))
        .filter(|(_, n)| *n > 0)
        .map(|(role, n)| format!("{n} {role}"))
        .collect();
    let summaries = dropped.iter().filter(|m| m.is_summary()).count();

    let mut note = format!("Truncated {} earlier message(s)", dropped.len());
    if !parts.is_empty() {
        note.push_str(": ");
        note.push_str(&parts.join(", "));
    }
    if summaries > 0 {
        note.push_str(&format!(", including {summaries} earlier summary"));
    }
    note.push('.');
    note
}
