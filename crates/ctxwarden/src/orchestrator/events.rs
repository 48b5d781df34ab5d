//! Notifications emitted by the [`ContextOrchestrator`](super::ContextOrchestrator).
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget sessions |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`ChannelHandler`] | Forward events to another task over a channel |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::compression::StrategyKind;
use crate::context::{ContextTier, OperationalMode};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Everything an observer can learn about a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEvent {
    /// The tier was selected (`from` is `None` at start) or moved.
    TierChanged {
        from: Option<ContextTier>,
        to: ContextTier,
        context_limit: usize,
    },
    ModeChanged {
        from: OperationalMode,
        to: OperationalMode,
    },
    /// A new system prompt was installed.
    SystemPromptUpdated {
        tier: ContextTier,
        mode: OperationalMode,
        tokens: usize,
    },
    TaskDefined { content: String },
    ArchitectureDecision { content: String },
    NeverCompressedAdded { content: String },
    /// A compression result replaced the live message list.
    CompressionCompleted {
        strategy: StrategyKind,
        original_tokens: usize,
        compressed_tokens: usize,
        messages_compressed: usize,
        used_fallback: bool,
    },
    /// A compression result was discarded because it did not shrink anything.
    CompressionInflated {
        strategy: StrategyKind,
        original_tokens: usize,
        compressed_tokens: usize,
    },
    SnapshotCreated { id: String, token_count: usize },
    ThresholdReached { fraction: f64, usage: f64 },
    OverflowWarning {
        usage: f64,
        current_tokens: usize,
        max_tokens: usize,
    },
}

/// Observer of [`ContextEvent`]s. Handlers run synchronously on the
/// orchestrator's task and should return quickly.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ContextEvent) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ContextEvent::OverflowWarning { usage, .. } = event {
///         eprintln!("context at {:.0}%", usage * 100.0);
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ContextEvent) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ContextEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ContextEvent) + Send + Sync,
{
    fn on_event(&self, event: &ContextEvent) {
        (self.0)(event)
    }
}

/// Forwards a clone of every event to an unbounded channel.
///
/// Sends after the receiver is dropped are silently discarded.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ContextEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContextEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelHandler {
    fn on_event(&self, event: &ContextEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Delegates to multiple handlers in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, my_debug_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.push(handler);
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn push(&mut self, handler: impl EventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ContextEvent) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs every event via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ContextEvent) {
        match event {
            ContextEvent::TierChanged {
                from,
                to,
                context_limit,
            } => match from {
                Some(from) => info!("Context tier {from} -> {to} ({context_limit} tokens)"),
                None => info!("Context tier {to} ({context_limit} tokens)"),
            },
            ContextEvent::ModeChanged { from, to } => {
                info!("Mode changed: {from} -> {to}");
            }
            ContextEvent::SystemPromptUpdated { tier, mode, tokens } => {
                debug!("System prompt updated for {tier} / {mode}: ~{tokens} tokens");
            }
            ContextEvent::TaskDefined { content } => {
                info!("Task defined: {}", preview(content));
            }
            ContextEvent::ArchitectureDecision { content } => {
                info!("Architecture decision recorded: {}", preview(content));
            }
            ContextEvent::NeverCompressedAdded { content } => {
                debug!("Pinned content: {}", preview(content));
            }
            ContextEvent::CompressionCompleted {
                strategy,
                original_tokens,
                compressed_tokens,
                messages_compressed,
                used_fallback,
            } => {
                info!(
                    "Compression ({strategy}): {messages_compressed} message(s), {original_tokens} -> {compressed_tokens} tokens{}",
                    if *used_fallback { " [placeholder summary]" } else { "" }
                );
            }
            ContextEvent::CompressionInflated {
                strategy,
                original_tokens,
                compressed_tokens,
            } => {
                warn!(
                    "Compression ({strategy}) discarded: {original_tokens} -> {compressed_tokens} tokens"
                );
            }
            ContextEvent::SnapshotCreated { id, token_count } => {
                info!("Snapshot {id} created ({token_count} tokens)");
            }
            ContextEvent::ThresholdReached { fraction, usage } => {
                debug!(
                    "Threshold {:.0}% reached (usage {:.1}%)",
                    fraction * 100.0,
                    usage * 100.0
                );
            }
            ContextEvent::OverflowWarning {
                usage,
                current_tokens,
                max_tokens,
            } => {
                warn!(
                    "Context near overflow: {current_tokens}/{max_tokens} tokens ({:.1}%)",
                    usage * 100.0
                );
            }
        }
    }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(120).collect();
    if head.len() < text.len() {
        format!("{head}...")
    } else {
        head
    }
}
