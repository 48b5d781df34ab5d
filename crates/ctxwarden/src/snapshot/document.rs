//! On-disk snapshot documents.
//!
//! Every document carries a `version` tag. Version 2 (current) stores user
//! messages separately from the rest; version 1 (legacy, or no tag at all)
//! interleaves everything in one `messages` array. Both shapes are validated
//! against a JSON Schema derived from their serde types and normalized into
//! [`ContextSnapshot`] here; nothing outside this module sees the legacy
//! shape.

use crate::api::ids::generate_snapshot_id;
use crate::context::conversation::{
    Checkpoint, CompressionRecord, ConversationContext, GoalStack, ModelInfo, ReasoningTrace,
    SYSTEM_PROMPT_ID,
};
use crate::{ContextError, Message, MessageRole, Result, extract_message_preview};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Format version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// Version assumed when a document has no `version` tag.
pub const LEGACY_VERSION: u32 = 1;

const PREVIEW_CHARS: usize = 80;

/// Model and size information captured with a snapshot.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SnapshotStats {
    pub model: String,
    pub context_size: usize,
    /// Ratio of the most recent compression, 1.0 if none ran.
    pub compression_ratio: f64,
    pub message_count: usize,
    pub user_message_count: usize,
    pub compressions: usize,
}

/// A point-in-time capture of a conversation.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct ContextSnapshot {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    /// Short description for listings.
    pub summary: String,
    /// Every user message of the conversation, unmodified.
    pub user_messages: Vec<Message>,
    /// Non-user messages only.
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_stack: Option<GoalStack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<ReasoningTrace>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Compressions applied before the capture, oldest first.
    #[serde(default)]
    pub compression_history: Vec<CompressionRecord>,
    /// Unrecognized context metadata, kept verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
    pub metadata: SnapshotStats,
}

/// Index entry describing one stored snapshot.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct SnapshotMetadata {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    pub summary: String,
    /// Size of the stored document in bytes.
    pub size_bytes: u64,
}

impl ContextSnapshot {
    /// Capture `ctx` under a fresh id.
    pub fn capture(ctx: &ConversationContext) -> Self {
        let (user_messages, messages): (Vec<Message>, Vec<Message>) =
            ctx.messages.iter().cloned().partition(|m| m.is_user());
        let preview = extract_message_preview(&user_messages, PREVIEW_CHARS);
        let summary = if preview.is_empty() {
            format!("{} messages, no user input", ctx.messages.len())
        } else {
            format!(
                "{} messages ({} user): {preview}",
                ctx.messages.len(),
                user_messages.len()
            )
        };

        Self {
            id: generate_snapshot_id(),
            session_id: ctx.session_id.clone(),
            timestamp: Utc::now(),
            token_count: ctx.token_count,
            summary,
            system_prompt_id: ctx.system_prompt_id.clone(),
            goal_stack: ctx.goal_stack.clone(),
            reasoning_trace: ctx.reasoning_trace.clone(),
            checkpoints: ctx.checkpoints.clone(),
            compression_history: ctx.metadata.compression_history.clone(),
            extra: ctx.metadata.extra.clone(),
            metadata: SnapshotStats {
                model: ctx.metadata.model.clone(),
                context_size: ctx.metadata.context_size,
                compression_ratio: ctx.last_compression_ratio().unwrap_or(1.0),
                message_count: ctx.messages.len(),
                user_message_count: user_messages.len(),
                compressions: ctx.metadata.compression_history.len(),
            },
            user_messages,
            messages,
        }
    }

    /// Rebuild a live context: user and non-user messages merged and
    /// re-sorted by timestamp (stable, so ties keep their stored order).
    pub fn into_context(self) -> ConversationContext {
        let mut messages = self.messages;
        messages.extend(self.user_messages);
        messages.sort_by_key(|m| m.timestamp);

        let system_prompt_id = self
            .system_prompt_id
            .filter(|id| messages.iter().any(|m| &m.id == id));

        let mut ctx = ConversationContext::new(
            self.session_id,
            &ModelInfo::new(self.metadata.model, None),
            self.metadata.context_size,
        );
        ctx.messages = messages;
        ctx.system_prompt_id = system_prompt_id;
        ctx.token_count = self.token_count;
        ctx.goal_stack = self.goal_stack;
        ctx.reasoning_trace = self.reasoning_trace;
        ctx.checkpoints = self.checkpoints;
        ctx.metadata.compression_history = self.compression_history;
        ctx.metadata.extra = self.extra;
        ctx
    }

    pub fn metadata(&self, size_bytes: u64) -> SnapshotMetadata {
        SnapshotMetadata {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            timestamp: self.timestamp,
            token_count: self.token_count,
            summary: self.summary.clone(),
            size_bytes,
        }
    }
}

// ── Document shapes ────────────────────────────────────────────────

/// Current document: version tag plus every snapshot field.
#[derive(Serialize, Deserialize, JsonSchema)]
struct SnapshotDocument {
    version: u32,
    #[serde(flatten)]
    snapshot: ContextSnapshot,
}

#[derive(Serialize)]
struct SnapshotDocumentRef<'a> {
    version: u32,
    #[serde(flatten)]
    snapshot: &'a ContextSnapshot,
}

/// Legacy document: one interleaved message list. A `version` tag, if
/// present, has already been checked by [`detect_version`].
#[derive(Deserialize, JsonSchema)]
struct LegacySnapshotDocument {
    id: String,
    session_id: String,
    timestamp: DateTime<Utc>,
    token_count: usize,
    #[serde(default)]
    summary: String,
    messages: Vec<Message>,
    #[serde(default)]
    goal_stack: Option<GoalStack>,
    #[serde(default)]
    reasoning_trace: Option<ReasoningTrace>,
    #[serde(default)]
    metadata: SnapshotStats,
}

impl LegacySnapshotDocument {
    fn normalize(self) -> ContextSnapshot {
        let (mut user_messages, mut messages): (Vec<Message>, Vec<Message>) =
            self.messages.into_iter().partition(|m| m.role == MessageRole::User);
        user_messages.sort_by_key(|m| m.timestamp);
        messages.sort_by_key(|m| m.timestamp);

        let system_prompt_id = messages
            .iter()
            .find(|m| m.id == SYSTEM_PROMPT_ID)
            .or_else(|| messages.iter().find(|m| m.is_system() && !m.is_summary()))
            .map(|m| m.id.clone());

        ContextSnapshot {
            id: self.id,
            session_id: self.session_id,
            timestamp: self.timestamp,
            token_count: self.token_count,
            summary: self.summary,
            user_messages,
            messages,
            system_prompt_id,
            goal_stack: self.goal_stack,
            reasoning_trace: self.reasoning_trace,
            checkpoints: Vec::new(),
            compression_history: Vec::new(),
            extra: serde_json::Map::new(),
            metadata: self.metadata,
        }
    }
}

// ── Validation ─────────────────────────────────────────────────────

fn schema_value<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

fn current_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(schema_value::<SnapshotDocument>)
}

fn legacy_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(schema_value::<LegacySnapshotDocument>)
}

/// Format version of a parsed document. Untagged documents are legacy.
pub fn detect_version(value: &Value) -> Option<u32> {
    match value.get("version") {
        None | Some(Value::Null) => Some(LEGACY_VERSION),
        Some(v) => v.as_u64().and_then(|v| u32::try_from(v).ok()),
    }
}

/// Structural check of a parsed document. Returns its version or a reason.
pub fn validate(value: &Value) -> std::result::Result<u32, String> {
    if !value.is_object() {
        return Err("document is not a JSON object".into());
    }
    let version = detect_version(value).ok_or_else(|| "`version` is not an integer".to_string())?;
    let schema = match version {
        CURRENT_VERSION => current_schema(),
        LEGACY_VERSION => legacy_schema(),
        other => return Err(format!("unsupported format version {other}")),
    };
    let validator =
        jsonschema::validator_for(schema).map_err(|e| format!("invalid document schema: {e}"))?;
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(version)
    } else {
        Err(errors.join("; "))
    }
}

/// Serialize a snapshot as a current-version document.
pub fn encode(snapshot: &ContextSnapshot) -> Result<String> {
    let doc = SnapshotDocumentRef {
        version: CURRENT_VERSION,
        snapshot,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Parse, validate and normalize a document read for snapshot `id`.
pub fn decode(id: &str, text: &str) -> Result<ContextSnapshot> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ContextError::corruption(id, e.to_string()))?;
    let version = validate(&value).map_err(|reason| ContextError::corruption(id, reason))?;
    let snapshot = match version {
        CURRENT_VERSION => serde_json::from_value::<SnapshotDocument>(value).map(|d| d.snapshot),
        _ => serde_json::from_value::<LegacySnapshotDocument>(value)
            .map(LegacySnapshotDocument::normalize),
    }
    .map_err(|e| ContextError::corruption(id, e.to_string()))?;

    if snapshot.id != id {
        return Err(ContextError::corruption(
            id,
            format!("document holds snapshot {}", snapshot.id),
        ));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::StrategyKind;
    use crate::context::conversation::CheckpointKind;
    use chrono::Duration;

    fn sample_context() -> ConversationContext {
        let mut ctx = ConversationContext::new("s1", &ModelInfo::new("test/model", None), 8192);
        let t0 = Utc::now() - Duration::seconds(10);
        ctx.set_system_prompt("You are helpful.");
        ctx.messages[0].timestamp = t0;
        ctx.push(Message::user("Fix the parser.").with_timestamp(t0 + Duration::seconds(1)));
        ctx.push(Message::assistant("Looking.").with_timestamp(t0 + Duration::seconds(2)));
        ctx.push(Message::user("Thanks!").with_timestamp(t0 + Duration::seconds(3)));
        ctx.add_checkpoint(CheckpointKind::TaskDefinition, "Fix the parser");
        ctx.token_count = 42;
        ctx
    }

    #[test]
    fn capture_separates_user_messages() {
        let snap = ContextSnapshot::capture(&sample_context());
        assert_eq!(snap.user_messages.len(), 2);
        assert_eq!(snap.messages.len(), 2);
        assert!(snap.messages.iter().all(|m| !m.is_user()));
        assert_eq!(snap.metadata.user_message_count, 2);
        assert!((snap.metadata.compression_ratio - 1.0).abs() < f64::EPSILON);
        assert!(snap.summary.contains("Fix the parser."));
    }

    #[test]
    fn encoded_document_validates_and_decodes() {
        let snap = ContextSnapshot::capture(&sample_context());
        let text = encode(&snap).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], CURRENT_VERSION);
        assert_eq!(validate(&value), Ok(CURRENT_VERSION));
        assert_eq!(decode(&snap.id, &text).unwrap(), snap);
    }

    #[test]
    fn restore_merges_and_sorts() {
        let original = sample_context();
        let restored = ContextSnapshot::capture(&original).into_context();
        assert_eq!(restored.messages, original.messages);
        assert_eq!(restored.system_prompt().unwrap().content, "You are helpful.");
        assert_eq!(restored.checkpoints, original.checkpoints);
        assert_eq!(restored.token_count, 42);
    }

    #[test]
    fn compression_history_and_extra_survive_a_round_trip() {
        let mut ctx = sample_context();
        ctx.record_compression(CompressionRecord {
            timestamp: Utc::now(),
            strategy: StrategyKind::Summarize,
            original_tokens: 900,
            compressed_tokens: 300,
            ratio: 0.5,
            messages_compressed: 6,
            used_fallback: false,
        });
        ctx.metadata
            .extra
            .insert("client".into(), Value::String("term".into()));

        let snap = ContextSnapshot::capture(&ctx);
        assert_eq!(snap.metadata.compressions, 1);
        let restored = decode(&snap.id, &encode(&snap).unwrap())
            .unwrap()
            .into_context();

        let history = &restored.metadata.compression_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, StrategyKind::Summarize);
        assert_eq!(history[0].messages_compressed, 6);
        assert_eq!(restored.last_compression_ratio(), Some(0.5));
        assert_eq!(restored.metadata.extra["client"], "term");
    }

    #[test]
    fn documents_without_history_still_decode() {
        let snap = ContextSnapshot::capture(&sample_context());
        let mut value: Value = serde_json::from_str(&encode(&snap).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("compression_history");
        assert_eq!(validate(&value), Ok(CURRENT_VERSION));
        let decoded = decode(&snap.id, &value.to_string()).unwrap();
        assert!(decoded.compression_history.is_empty());
        assert!(decoded.extra.is_empty());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let snap = ContextSnapshot::capture(&sample_context());
        let mut value = serde_json::to_value(SnapshotDocumentRef {
            version: CURRENT_VERSION,
            snapshot: &snap,
        })
        .unwrap();
        value.as_object_mut().unwrap().remove("user_messages");
        let reason = validate(&value).unwrap_err();
        assert!(reason.contains("user_messages"), "{reason}");

        let err = decode(&snap.id, &value.to_string()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn wrong_type_is_reported() {
        let snap = ContextSnapshot::capture(&sample_context());
        let mut value: Value = serde_json::from_str(&encode(&snap).unwrap()).unwrap();
        value["token_count"] = Value::String("many".into());
        assert!(validate(&value).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let value = serde_json::json!({ "version": 9, "id": "x" });
        assert!(validate(&value).unwrap_err().contains("unsupported format version 9"));
    }

    #[test]
    fn truncated_json_is_corruption() {
        let err = decode("snap-1", "{\"version\": 2, \"id\": ").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn legacy_document_is_normalized() {
        let t0 = Utc::now() - Duration::seconds(60);
        let messages = vec![
            Message::system("prompt").with_timestamp(t0),
            Message::user("first").with_timestamp(t0 + Duration::seconds(1)),
            Message::assistant("reply").with_timestamp(t0 + Duration::seconds(2)),
            Message::user("second").with_timestamp(t0 + Duration::seconds(3)),
        ];
        let legacy = serde_json::json!({
            "id": "snap-old",
            "session_id": "s1",
            "timestamp": t0,
            "token_count": 12,
            "summary": "old format",
            "messages": messages,
        });
        assert_eq!(validate(&legacy), Ok(LEGACY_VERSION));

        let snap = decode("snap-old", &legacy.to_string()).unwrap();
        assert_eq!(snap.user_messages.len(), 2);
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.system_prompt_id.as_deref(), Some(messages[0].id.as_str()));

        let ctx = snap.into_context();
        assert_eq!(ctx.messages, messages);
        assert!(ctx.is_chronological());
    }

    #[test]
    fn id_mismatch_is_corruption() {
        let snap = ContextSnapshot::capture(&sample_context());
        let text = encode(&snap).unwrap();
        assert!(decode("snap-other", &text).unwrap_err().is_corruption());
    }
}
