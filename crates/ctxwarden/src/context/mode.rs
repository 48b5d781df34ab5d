//! Operational modes and content classification.
//!
//! A mode decides which content categories are protected from compression
//! and in which order the rest is given up. Messages are classified on add
//! by the active mode's keyword rules, then by generic heuristics.

use crate::{Message, MessageRole};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Kind of content a message carries.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum ContentCategory {
    Code,
    ArchitectureDecision,
    ErrorTrace,
    TaskDefinition,
    Plan,
    ToolOutput,
    Discussion,
}

/// Task-oriented profile of the session.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum OperationalMode {
    #[default]
    Developer,
    Planning,
    Assistant,
    Debugger,
}

impl OperationalMode {
    pub const ALL: [OperationalMode; 4] = [
        OperationalMode::Developer,
        OperationalMode::Planning,
        OperationalMode::Assistant,
        OperationalMode::Debugger,
    ];

    pub fn profile(self) -> ModeProfile {
        use ContentCategory::*;
        match self {
            OperationalMode::Developer => ModeProfile {
                never_compress: HashSet::from([ArchitectureDecision, TaskDefinition]),
                compression_priority: vec![ToolOutput, Discussion, ErrorTrace, Plan, Code],
                extraction_rules: vec![
                    ExtractionRule::new(
                        ArchitectureDecision,
                        &["decision:", "we decided", "architecture:", "adr-"],
                    ),
                    ExtractionRule::new(
                        ErrorTrace,
                        &["error[e", "panicked at", "traceback", "stack backtrace"],
                    ),
                    ExtractionRule::new(TaskDefinition, &["task:", "acceptance criteria"]),
                ],
            },
            OperationalMode::Planning => ModeProfile {
                never_compress: HashSet::from([TaskDefinition, Plan, ArchitectureDecision]),
                compression_priority: vec![ToolOutput, ErrorTrace, Code, Discussion],
                extraction_rules: vec![
                    ExtractionRule::new(
                        Plan,
                        &["plan:", "milestone", "roadmap", "step 1", "- [ ]"],
                    ),
                    ExtractionRule::new(
                        TaskDefinition,
                        &["goal:", "task:", "requirement", "acceptance criteria"],
                    ),
                    ExtractionRule::new(ArchitectureDecision, &["decision:", "we decided"]),
                ],
            },
            OperationalMode::Assistant => ModeProfile {
                never_compress: HashSet::from([TaskDefinition]),
                compression_priority: vec![ToolOutput, Code, ErrorTrace, Plan, Discussion],
                extraction_rules: vec![ExtractionRule::new(
                    TaskDefinition,
                    &["task:", "goal:", "remember that"],
                )],
            },
            OperationalMode::Debugger => ModeProfile {
                never_compress: HashSet::from([ErrorTrace, TaskDefinition]),
                compression_priority: vec![Discussion, Plan, ToolOutput, Code],
                extraction_rules: vec![
                    ExtractionRule::new(
                        ErrorTrace,
                        &[
                            "error",
                            "panicked at",
                            "traceback",
                            "exception",
                            "stack backtrace",
                            "segmentation fault",
                            "exit code",
                        ],
                    ),
                    ExtractionRule::new(TaskDefinition, &["repro:", "expected:", "actual:"]),
                ],
            },
        }
    }
}

impl fmt::Display for OperationalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationalMode::Developer => "developer",
            OperationalMode::Planning => "planning",
            OperationalMode::Assistant => "assistant",
            OperationalMode::Debugger => "debugger",
        };
        f.write_str(name)
    }
}

/// Case-insensitive substring rule mapping content to a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRule {
    pub category: ContentCategory,
    pub keywords: &'static [&'static str],
}

impl ExtractionRule {
    pub const fn new(category: ContentCategory, keywords: &'static [&'static str]) -> Self {
        Self { category, keywords }
    }

    /// `lowered` must already be lowercase.
    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k))
    }
}

/// Protection and ordering rules for one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeProfile {
    /// Categories protected like the system prompt.
    pub never_compress: HashSet<ContentCategory>,
    /// Categories given up first, in order. Unlisted categories go last.
    pub compression_priority: Vec<ContentCategory>,
    pub extraction_rules: Vec<ExtractionRule>,
}

impl ModeProfile {
    /// Assign a category: mode rules first, then generic heuristics.
    pub fn classify(&self, role: MessageRole, content: &str) -> ContentCategory {
        let lowered = content.to_lowercase();
        if let Some(rule) = self.extraction_rules.iter().find(|r| r.matches(&lowered)) {
            return rule.category;
        }
        if role == MessageRole::Tool {
            ContentCategory::ToolOutput
        } else if content.contains("```") {
            ContentCategory::Code
        } else {
            ContentCategory::Discussion
        }
    }

    /// Category already stored on the message, else a fresh classification.
    pub fn category_of(&self, message: &Message) -> ContentCategory {
        message
            .category
            .unwrap_or_else(|| self.classify(message.role, &message.content))
    }

    pub fn is_protected(&self, category: ContentCategory) -> bool {
        self.never_compress.contains(&category)
    }

    /// Position in the drop order; lower ranks are compressed first.
    pub fn drop_rank(&self, category: ContentCategory) -> usize {
        self.compression_priority
            .iter()
            .position(|&c| c == category)
            .unwrap_or(self.compression_priority.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn developer_is_default() {
        assert_eq!(OperationalMode::default(), OperationalMode::Developer);
    }

    #[test]
    fn mode_rules_take_precedence() {
        let profile = OperationalMode::Developer.profile();
        assert_eq!(
            profile.classify(MessageRole::Assistant, "Decision: use SQLite for the index."),
            ContentCategory::ArchitectureDecision
        );
        assert_eq!(
            profile.classify(MessageRole::Tool, "thread 'main' panicked at src/lib.rs:3"),
            ContentCategory::ErrorTrace
        );
    }

    #[test]
    fn generic_fallbacks() {
        let profile = OperationalMode::Assistant.profile();
        assert_eq!(
            profile.classify(MessageRole::Tool, "file contents"),
            ContentCategory::ToolOutput
        );
        assert_eq!(
            profile.classify(MessageRole::Assistant, "```rust\nfn main() {}\n```"),
            ContentCategory::Code
        );
        assert_eq!(
            profile.classify(MessageRole::Assistant, "Sure, happy to help."),
            ContentCategory::Discussion
        );
    }

    #[test]
    fn debugger_protects_error_traces() {
        let debugger = OperationalMode::Debugger.profile();
        let developer = OperationalMode::Developer.profile();
        assert!(debugger.is_protected(ContentCategory::ErrorTrace));
        assert!(!developer.is_protected(ContentCategory::ErrorTrace));
        assert!(developer.is_protected(ContentCategory::ArchitectureDecision));
    }

    #[test]
    fn every_mode_protects_task_definitions() {
        for mode in OperationalMode::ALL {
            assert!(mode.profile().is_protected(ContentCategory::TaskDefinition));
        }
    }

    #[test]
    fn drop_rank_orders_unlisted_last() {
        let profile = OperationalMode::Developer.profile();
        assert_eq!(profile.drop_rank(ContentCategory::ToolOutput), 0);
        assert!(
            profile.drop_rank(ContentCategory::Discussion)
                < profile.drop_rank(ContentCategory::Code)
        );
        assert_eq!(
            profile.drop_rank(ContentCategory::TaskDefinition),
            profile.compression_priority.len()
        );
    }

    #[test]
    fn stored_category_wins() {
        let profile = OperationalMode::Developer.profile();
        let msg = Message::assistant("plain text").with_category(ContentCategory::Plan);
        assert_eq!(profile.category_of(&msg), ContentCategory::Plan);
    }

    #[test]
    fn category_serializes_kebab_case() {
        let json = serde_json::to_string(&ContentCategory::ArchitectureDecision).unwrap();
        assert_eq!(json, "\"architecture-decision\"");
    }
}
