//! Live conversation state.
//!
//! [`ConversationContext`] is what the orchestrator mutates and what a
//! snapshot captures: the chronological message list, the designated system
//! prompt, structured checkpoints that live outside the message list, the
//! optional goal stack and reasoning trace, and model metadata with the
//! compression history.

use crate::api::ids::generate_checkpoint_id;
use crate::compression::StrategyKind;
use crate::context::budget::ContextUsage;
use crate::context::tokens::TokenCounter;
use crate::{Message, MessageRole};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fixed id of the designated system prompt message.
pub const SYSTEM_PROMPT_ID: &str = "system-prompt";

/// Reasoning steps retained before the oldest are dropped.
pub const MAX_REASONING_STEPS: usize = 64;

/// Model identity and its advertised context window.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    /// Context limit from model metadata, when the provider reports one.
    pub context_limit: Option<usize>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, context_limit: Option<usize>) -> Self {
        Self {
            id: id.into(),
            context_limit,
        }
    }
}

// ── Checkpoints ────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    TaskDefinition,
    ArchitectureDecision,
    NeverCompressed,
}

/// A structured record that is never compressed.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub kind: CheckpointKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(kind: CheckpointKind, content: impl Into<String>) -> Self {
        Self {
            id: generate_checkpoint_id(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ── Goals and reasoning ────────────────────────────────────────────

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct Goal {
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Nested goals; the top of `active` is the one being worked on.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct GoalStack {
    #[serde(default)]
    pub active: Vec<Goal>,
    #[serde(default)]
    pub completed: Vec<Goal>,
}

impl GoalStack {
    pub fn push(&mut self, description: impl Into<String>) {
        self.active.push(Goal {
            description: description.into(),
            created_at: Utc::now(),
            completed_at: None,
        });
    }

    /// Mark the current goal complete and return it.
    pub fn complete(&mut self) -> Option<Goal> {
        let mut goal = self.active.pop()?;
        goal.completed_at = Some(Utc::now());
        self.completed.push(goal.clone());
        Some(goal)
    }

    pub fn current(&self) -> Option<&Goal> {
        self.active.last()
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct ReasoningStep {
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// Bounded log of reasoning notes.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct ReasoningTrace {
    #[serde(default)]
    pub steps: Vec<ReasoningStep>,
}

impl ReasoningTrace {
    pub fn record(&mut self, content: impl Into<String>) {
        self.steps.push(ReasoningStep {
            timestamp: Utc::now(),
            content: content.into(),
        });
        if self.steps.len() > MAX_REASONING_STEPS {
            let excess = self.steps.len() - MAX_REASONING_STEPS;
            self.steps.drain(..excess);
        }
    }
}

// ── Metadata ───────────────────────────────────────────────────────

/// One applied compression.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct CompressionRecord {
    pub timestamp: DateTime<Utc>,
    pub strategy: StrategyKind,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub ratio: f64,
    pub messages_compressed: usize,
    #[serde(default)]
    pub used_fallback: bool,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct ContextMetadata {
    pub model: String,
    pub context_size: usize,
    /// Oldest first.
    #[serde(default)]
    pub compression_history: Vec<CompressionRecord>,
    /// Unrecognized keys, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ── Context ────────────────────────────────────────────────────────

/// The live conversation owned by one orchestrator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationContext {
    pub session_id: String,
    /// Chronological: timestamps never decrease.
    pub messages: Vec<Message>,
    /// Id of the designated system prompt inside `messages`.
    pub system_prompt_id: Option<String>,
    pub token_count: usize,
    pub max_tokens: usize,
    pub goal_stack: Option<GoalStack>,
    pub reasoning_trace: Option<ReasoningTrace>,
    pub checkpoints: Vec<Checkpoint>,
    pub metadata: ContextMetadata,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>, model: &ModelInfo, max_tokens: usize) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            system_prompt_id: None,
            token_count: 0,
            max_tokens,
            goal_stack: None,
            reasoning_trace: None,
            checkpoints: Vec::new(),
            metadata: ContextMetadata {
                model: model.id.clone(),
                context_size: max_tokens,
                compression_history: Vec::new(),
                extra: serde_json::Map::new(),
            },
        }
    }

    /// Install or replace the designated system prompt.
    ///
    /// An existing prompt is edited in place; a new one goes first with a
    /// timestamp no later than the earliest message.
    pub fn set_system_prompt(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(existing) = self.system_prompt_mut() {
            existing.content = text;
            existing.token_count = None;
            return;
        }
        let timestamp = self
            .messages
            .first()
            .map(|m| m.timestamp.min(Utc::now()))
            .unwrap_or_else(Utc::now);
        let prompt = Message::system(text)
            .with_id(SYSTEM_PROMPT_ID)
            .with_timestamp(timestamp);
        self.system_prompt_id = Some(prompt.id.clone());
        self.messages.insert(0, prompt);
    }

    pub fn system_prompt(&self) -> Option<&Message> {
        let id = self.system_prompt_id.as_deref()?;
        self.messages.iter().find(|m| m.id == id)
    }

    fn system_prompt_mut(&mut self) -> Option<&mut Message> {
        let id = self.system_prompt_id.clone()?;
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Insert a message at its chronological position (after equal timestamps).
    pub fn push(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(idx, message);
    }

    /// Replace the whole message list, restoring chronological order.
    pub fn replace_messages(&mut self, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.timestamp);
        self.messages = messages;
        if let Some(id) = self.system_prompt_id.clone()
            && !self.messages.iter().any(|m| m.id == id)
        {
            self.system_prompt_id = None;
        }
    }

    pub fn is_chronological(&self) -> bool {
        self.messages
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == MessageRole::User)
    }

    pub fn add_checkpoint(&mut self, kind: CheckpointKind, content: impl Into<String>) -> &Checkpoint {
        self.checkpoints.push(Checkpoint::new(kind, content));
        let last = self.checkpoints.len() - 1;
        &self.checkpoints[last]
    }

    /// The most recent task definition.
    pub fn task_definition(&self) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.kind == CheckpointKind::TaskDefinition)
    }

    /// Render checkpoints as one block.
    ///
    /// The latest task definition is always included; other records are
    /// capped at `max_records`, newest kept, shown oldest first.
    pub fn checkpoint_block(&self, max_records: usize) -> Option<String> {
        let task = self.task_definition();
        let others: Vec<&Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.kind != CheckpointKind::TaskDefinition)
            .collect();
        let skip = others.len().saturating_sub(max_records);
        let others = &others[skip..];

        if task.is_none() && others.is_empty() {
            return None;
        }

        let mut block = String::from("## Checkpoints");
        if let Some(task) = task {
            block.push_str("\n\nTask: ");
            block.push_str(&task.content);
        }
        if !others.is_empty() {
            block.push('\n');
            for record in others {
                let label = match record.kind {
                    CheckpointKind::ArchitectureDecision => "decision",
                    _ => "keep",
                };
                block.push_str(&format!("\n- [{label}] {}", record.content));
            }
        }
        Some(block)
    }

    /// Recompute `token_count` from the message list and checkpoint block.
    pub fn recount(&mut self, counter: &dyn TokenCounter, max_checkpoints: usize) -> usize {
        let block_tokens = self
            .checkpoint_block(max_checkpoints)
            .map(|b| counter.count_tokens(&b))
            .unwrap_or(0);
        self.token_count = counter.count_conversation_tokens(&self.messages) + block_tokens;
        self.token_count
    }

    pub fn usage(&self) -> ContextUsage {
        ContextUsage::new(self.token_count, self.max_tokens)
    }

    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        self.max_tokens = max_tokens;
        self.metadata.context_size = max_tokens;
    }

    pub fn record_compression(&mut self, record: CompressionRecord) {
        self.metadata.compression_history.push(record);
    }

    pub fn last_compression_ratio(&self) -> Option<f64> {
        self.metadata.compression_history.last().map(|r| r.ratio)
    }
}
