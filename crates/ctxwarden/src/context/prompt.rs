//! System prompt templates keyed by (tier, mode).
//!
//! Larger tiers get more sections and a larger token budget. Templates are
//! assembled with [`SystemPromptBuilder`] so every section renders as a
//! `## Heading` block.

use crate::context::mode::OperationalMode;
use crate::context::tier::ContextTier;
use crate::context::tokens::TokenCounter;

/// Builder for multi-section system prompts.
///
/// Sections are joined with double newlines. Empty sections are skipped.
///
/// ```
/// use ctxwarden::context::prompt::SystemPromptBuilder;
///
/// let prompt = SystemPromptBuilder::new("You are a coding assistant.")
///     .section("Rules", "Keep answers short.")
///     .section_if(false, "Hidden", || "never shown".into())
///     .build();
///
/// assert!(prompt.contains("## Rules"));
/// assert!(!prompt.contains("## Hidden"));
/// ```
pub struct SystemPromptBuilder {
    sections: Vec<String>,
}

impl SystemPromptBuilder {
    /// Create a builder with a preamble that is included as-is.
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            sections: vec![preamble.into()],
        }
    }

    /// Append a named section. Skipped if `content` is empty.
    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.is_empty() {
            self.sections.push(format!("## {heading}\n\n{content}"));
        }
        self
    }

    /// Append a section only when `condition` holds.
    pub fn section_if(
        self,
        condition: bool,
        heading: &str,
        content_fn: impl FnOnce() -> String,
    ) -> Self {
        if condition {
            self.section(heading, content_fn())
        } else {
            self
        }
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

/// A selected system prompt and the token budget it must fit in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub tier: ContextTier,
    pub mode: OperationalMode,
    pub text: String,
    pub token_budget: usize,
}

impl PromptTemplate {
    /// Whether the rendered text fits the budget under `counter`.
    pub fn fits(&self, counter: &dyn TokenCounter) -> bool {
        counter.count_tokens(&self.text) <= self.token_budget
    }
}

fn preamble(mode: OperationalMode) -> &'static str {
    match mode {
        OperationalMode::Developer => {
            "You are a software engineering assistant working in the user's terminal."
        }
        OperationalMode::Planning => {
            "You are a planning assistant helping the user break work into concrete steps."
        }
        OperationalMode::Assistant => "You are a helpful general-purpose assistant.",
        OperationalMode::Debugger => {
            "You are a debugging assistant helping the user find the root cause of a failure."
        }
    }
}

fn rules(mode: OperationalMode) -> &'static str {
    match mode {
        OperationalMode::Developer => {
            "- Prefer small, verifiable changes.\n- Show code, not prose about code."
        }
        OperationalMode::Planning => {
            "- Number every step.\n- Name the deliverable of each step."
        }
        OperationalMode::Assistant => "- Answer directly.\n- Ask when the request is ambiguous.",
        OperationalMode::Debugger => {
            "- Quote the exact error.\n- Form one hypothesis at a time and test it."
        }
    }
}

fn working_style(mode: OperationalMode) -> &'static str {
    match mode {
        OperationalMode::Developer => {
            "Read the relevant code before editing it. Keep existing conventions: naming, \
             error handling and test layout. When a change touches several files, list them \
             first and then work through them in order."
        }
        OperationalMode::Planning => {
            "Start from the goal and work backwards. Separate what is decided from what is \
             still open. Keep plans short enough to fit on one screen and revise them when \
             new information arrives."
        }
        OperationalMode::Assistant => {
            "Match the depth of the answer to the question. Use lists for steps and prose \
             for explanations. Say so when you are unsure."
        }
        OperationalMode::Debugger => {
            "Reproduce first. Narrow the failure to the smallest input that still fails. \
             Record each hypothesis with its outcome so that ruled-out causes are not \
             revisited."
        }
    }
}

const CONTEXT_SECTION: &str = "Older parts of this conversation may be replaced by a \
    message starting with \"[Conversation summary]\". Treat it as an accurate record of \
    earlier work. User messages are never summarized, so quote them when precision matters.";

const CHECKPOINT_SECTION: &str = "A block titled \"Checkpoints\" may follow this prompt. It \
    holds the task definition, architecture decisions and notes the user asked to keep. \
    These records are authoritative: do not contradict them without saying so explicitly.";

const COLLABORATION_SECTION: &str = "For long tasks, restate the current goal when you \
    resume after a summary. Point out when a request conflicts with an earlier decision. \
    Prefer finishing one thread of work before starting another.";

/// Select the system prompt for `(tier, mode)`.
pub fn select_prompt_template(tier: ContextTier, mode: OperationalMode) -> PromptTemplate {
    let text = SystemPromptBuilder::new(preamble(mode))
        .section("Rules", rules(mode))
        .section_if(tier >= ContextTier::Basic, "Working style", || {
            working_style(mode).to_string()
        })
        .section_if(tier >= ContextTier::Standard, "Context", || {
            CONTEXT_SECTION.to_string()
        })
        .section_if(tier >= ContextTier::Extended, "Checkpoints", || {
            CHECKPOINT_SECTION.to_string()
        })
        .section_if(tier >= ContextTier::Premium, "Collaboration", || {
            COLLABORATION_SECTION.to_string()
        })
        .build();

    PromptTemplate {
        tier,
        mode,
        text,
        token_budget: tier.profile().prompt_budget,
    }
}
