//! Live-session state machine over (tier × mode).
//!
//! A [`ContextOrchestrator`] owns one [`ConversationContext`] and runs the
//! same loop after every change to it:
//!
//! ```text
//! mutation ─► recount ─► apply finished compression ─► threshold check
//!                                                        │
//!        ┌──────────────────────┬────────────────────────┤
//!        ▼                      ▼                        ▼
//!   compression due        auto-snapshot due      pre-overflow warning
//!   (background task)      (blocking pool)        (cancel + inline truncate)
//! ```
//!
//! Background compression works on a copy of the messages. Its result is
//! applied on the next mutation or on [`wait_for_compression`]; messages
//! added in the meantime are appended after the compressed set. Before a
//! result discards anything, a guard snapshot is written and awaited.
//!
//! [`wait_for_compression`]: ContextOrchestrator::wait_for_compression

pub mod events;

pub use events::{
    ChannelHandler, CompositeEventHandler, ContextEvent, EventHandler, FnEventHandler,
    LoggingHandler, NoopHandler,
};

use crate::api::provider::ChatProvider;
use crate::compression::{CompressionEngine, CompressionResult, CompressionStrategy};
use crate::config::ContextConfig;
use crate::context::conversation::{CheckpointKind, Goal};
use crate::context::tier::{CapacitySource, EnvCapacity};
use crate::context::{
    ContextTier, ContextUsage, ConversationContext, ModeProfile, ModelInfo, OperationalMode,
    PromptTemplate, TokenCounter, resolve_context_limit, select_prompt_template, select_tier,
};
use crate::snapshot::{SnapshotManager, SnapshotMetadata, ThresholdHit};
use crate::{ContextError, Message, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Id of the synthetic message that carries the checkpoint block in
/// [`ContextOrchestrator::prompt_messages`].
pub const CHECKPOINT_BLOCK_ID: &str = "checkpoints";

struct PendingCompression {
    handle: JoinHandle<CompressionResult>,
    cancel: CancellationToken,
    /// Ids of the messages the task was given.
    input_ids: HashSet<String>,
}

/// Owns one session's context and keeps it inside its token budget.
pub struct ContextOrchestrator {
    model: ModelInfo,
    config: ContextConfig,
    counter: Arc<dyn TokenCounter>,
    engine: CompressionEngine,
    snapshots: Option<SnapshotManager>,
    capacity: Box<dyn CapacitySource>,
    events: CompositeEventHandler,

    ctx: ConversationContext,
    tier: ContextTier,
    mode: OperationalMode,
    profile: ModeProfile,
    prompt: Option<PromptTemplate>,
    started: bool,

    session_cancel: CancellationToken,
    pending: Option<PendingCompression>,
    snapshot_tasks: Vec<JoinHandle<Result<SnapshotMetadata>>>,
    compress_due: Arc<AtomicBool>,
    snapshot_due: Arc<AtomicBool>,
}

impl ContextOrchestrator {
    pub fn new(
        session_id: impl Into<String>,
        model: ModelInfo,
        config: ContextConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        let mode = OperationalMode::default();
        let profile = mode.profile();
        let engine =
            CompressionEngine::from_config(Arc::clone(&counter), &config.compression.config, &model.id)
                .with_profile(profile.clone());
        let initial_limit = model.context_limit.unwrap_or(config.context_size.target);
        let ctx = ConversationContext::new(session_id, &model, initial_limit);

        Self {
            model,
            config,
            counter,
            engine,
            snapshots: None,
            capacity: Box::new(EnvCapacity::default()),
            events: CompositeEventHandler::new(),
            ctx,
            tier: select_tier(initial_limit),
            mode,
            profile,
            prompt: None,
            started: false,
            session_cancel: CancellationToken::new(),
            pending: None,
            snapshot_tasks: Vec::new(),
            compress_due: Arc::new(AtomicBool::new(false)),
            snapshot_due: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Provider used for summarize and hybrid passes.
    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.engine.set_provider(Some(provider));
        self
    }

    /// Use this manager instead of one built from the snapshot config.
    pub fn with_snapshot_manager(mut self, manager: SnapshotManager) -> Self {
        self.snapshots = Some(manager);
        self
    }

    pub fn with_capacity_source(mut self, source: impl CapacitySource + 'static) -> Self {
        self.capacity = Box::new(source);
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events.push(handler);
        self
    }

    /// Initial mode; takes effect at [`start`](Self::start).
    pub fn with_mode(mut self, mode: OperationalMode) -> Self {
        self.mode = mode;
        self.profile = mode.profile();
        self.engine.set_profile(self.profile.clone());
        self
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Resolve the context limit, select the tier and install the system
    /// prompt. Idempotent; every other operation starts the session if needed.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let threshold = self.config.compression.config.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ContextError::Configuration(format!(
                "compression threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.snapshots.is_none() {
            self.snapshots = Some(SnapshotManager::new(self.config.snapshots.clone())?);
        }

        let limit = resolve_context_limit(
            self.model.context_limit,
            self.capacity.as_ref(),
            &self.config.context_size,
        );
        self.ctx.set_max_tokens(limit);
        self.tier = select_tier(limit);
        self.emit(ContextEvent::TierChanged {
            from: None,
            to: self.tier,
            context_limit: limit,
        });

        self.register_thresholds()?;
        self.started = true;
        self.refresh_prompt();
        info!(
            "Session {} started: {} tokens, {}, {} mode",
            self.ctx.session_id, limit, self.tier, self.mode
        );
        Ok(())
    }

    /// Cancel in-flight summarization (its result is discarded) and wait
    /// for background snapshot writes.
    pub async fn stop(&mut self) {
        self.session_cancel.cancel();
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
            let _ = pending.handle.await;
            debug!("Discarded in-flight compression on stop");
        }
        let tasks = std::mem::take(&mut self.snapshot_tasks);
        for handle in tasks {
            self.finish_snapshot_task(handle).await;
        }
        self.session_cancel = CancellationToken::new();
        info!("Session {} stopped", self.ctx.session_id);
    }

    fn register_thresholds(&self) -> Result<()> {
        let manager = self.snapshots()?;
        if self.config.compression.enabled {
            let flag = Arc::clone(&self.compress_due);
            manager.on_context_threshold(
                self.config.compression.config.threshold,
                Arc::new(move |_hit: &ThresholdHit| flag.store(true, Ordering::Release)),
            );
        }
        if manager.is_enabled() && manager.config().auto_create {
            let flag = Arc::clone(&self.snapshot_due);
            manager.on_context_threshold(
                manager.config().auto_threshold,
                Arc::new(move |_hit: &ThresholdHit| flag.store(true, Ordering::Release)),
            );
        }
        Ok(())
    }

    // ── Messages ───────────────────────────────────────────────────

    /// Append a message and run the post-mutation loop.
    pub async fn add_message(&mut self, mut message: Message) -> Result<()> {
        self.start()?;
        if message.category.is_none() {
            message.category = Some(self.profile.classify(message.role, &message.content));
        }
        let tokens = self.counter.count_message_tokens(&message);
        message.token_count = Some(tokens);
        trace!(
            "Adding {} message {} ({tokens} tokens, {:?})",
            message.role, message.id, message.category
        );
        self.ctx.push(message);
        self.recount();
        self.after_mutation().await
    }

    /// Messages to send to the provider: system prompt, checkpoint block,
    /// then the conversation.
    pub fn prompt_messages(&self) -> Vec<Message> {
        let prompt_id = self.ctx.system_prompt_id.as_deref();
        let mut out = Vec::with_capacity(self.ctx.messages.len() + 1);
        if let Some(prompt) = self.ctx.system_prompt() {
            out.push(prompt.clone());
        }
        if let Some(block) = self.ctx.checkpoint_block(self.tier.profile().max_checkpoints) {
            out.push(Message::system(block).with_id(CHECKPOINT_BLOCK_ID));
        }
        out.extend(
            self.ctx
                .messages
                .iter()
                .filter(|m| Some(m.id.as_str()) != prompt_id)
                .cloned(),
        );
        out
    }

    // ── Mode and tier ──────────────────────────────────────────────

    pub async fn set_mode(&mut self, mode: OperationalMode) -> Result<()> {
        self.start()?;
        if mode == self.mode {
            return Ok(());
        }
        let from = self.mode;
        self.mode = mode;
        self.profile = mode.profile();
        self.engine.set_profile(self.profile.clone());
        self.emit(ContextEvent::ModeChanged { from, to: mode });
        self.refresh_prompt();
        self.after_mutation().await
    }

    /// Apply a new context limit, e.g. after switching models.
    pub async fn update_context_limit(&mut self, limit: usize) -> Result<()> {
        self.start()?;
        self.ctx.set_max_tokens(limit);
        let tier = select_tier(limit);
        if tier != self.tier {
            let from = self.tier;
            self.tier = tier;
            self.emit(ContextEvent::TierChanged {
                from: Some(from),
                to: tier,
                context_limit: limit,
            });
            self.refresh_prompt();
        } else {
            self.recount();
        }
        self.after_mutation().await
    }

    fn refresh_prompt(&mut self) {
        let template = select_prompt_template(self.tier, self.mode);
        if !template.fits(self.counter.as_ref()) {
            warn!(
                "System prompt for {} / {} exceeds its {}-token budget",
                self.tier, self.mode, template.token_budget
            );
        }
        let tokens = self.counter.count_tokens(&template.text);
        self.ctx.set_system_prompt(template.text.clone());
        self.prompt = Some(template);
        self.recount();
        self.emit(ContextEvent::SystemPromptUpdated {
            tier: self.tier,
            mode: self.mode,
            tokens,
        });
    }

    // ── Structured records ─────────────────────────────────────────

    pub async fn set_task_definition(&mut self, text: impl Into<String>) -> Result<()> {
        self.add_record(CheckpointKind::TaskDefinition, text.into())
            .await
    }

    pub async fn add_architecture_decision(&mut self, text: impl Into<String>) -> Result<()> {
        self.add_record(CheckpointKind::ArchitectureDecision, text.into())
            .await
    }

    pub async fn add_never_compressed(&mut self, text: impl Into<String>) -> Result<()> {
        self.add_record(CheckpointKind::NeverCompressed, text.into())
            .await
    }

    async fn add_record(&mut self, kind: CheckpointKind, content: String) -> Result<()> {
        self.start()?;
        self.ctx.add_checkpoint(kind, content.clone());
        self.recount();
        self.emit(match kind {
            CheckpointKind::TaskDefinition => ContextEvent::TaskDefined { content },
            CheckpointKind::ArchitectureDecision => ContextEvent::ArchitectureDecision { content },
            CheckpointKind::NeverCompressed => ContextEvent::NeverCompressedAdded { content },
        });
        self.after_mutation().await
    }

    pub fn push_goal(&mut self, description: impl Into<String>) {
        self.ctx
            .goal_stack
            .get_or_insert_with(Default::default)
            .push(description);
    }

    /// Complete the current goal.
    pub fn complete_goal(&mut self) -> Option<Goal> {
        self.ctx.goal_stack.as_mut()?.complete()
    }

    pub fn record_reasoning(&mut self, step: impl Into<String>) {
        self.ctx
            .reasoning_trace
            .get_or_insert_with(Default::default)
            .record(step);
    }

    // ── Compression ────────────────────────────────────────────────

    /// Run compression inline with the tier's strategy, superseding any
    /// background pass.
    pub async fn compress_now(&mut self) -> Result<CompressionResult> {
        self.start()?;
        if !self.config.compression.enabled {
            return Err(ContextError::Configuration(
                "compression is disabled".into(),
            ));
        }
        self.cancel_pending("explicit compression");
        let strategy = self.strategy();
        let cancel = self.session_cancel.child_token();
        let result = self
            .engine
            .compress(&self.ctx.messages, &strategy, &cancel)
            .await;
        let result = self.apply_result(result, Vec::new()).await;
        self.after_mutation().await?;
        Ok(result)
    }

    /// Wait for the background pass, if any, and apply its result.
    pub async fn wait_for_compression(&mut self) -> Result<Option<CompressionResult>> {
        self.start()?;
        let result = self.finish_pending().await;
        if result.is_some() {
            self.after_mutation().await?;
        }
        Ok(result)
    }

    pub fn has_pending_compression(&self) -> bool {
        self.pending.is_some()
    }

    fn strategy(&self) -> CompressionStrategy {
        self.tier
            .strategy_for(self.ctx.max_tokens, &self.config.compression.config)
    }

    fn spawn_compression(&mut self) {
        if self.pending.is_some() {
            debug!("Compression already in flight");
            return;
        }
        let strategy = self.strategy();
        let cancel = self.session_cancel.child_token();
        let token = cancel.clone();
        let engine = self.engine.clone();
        let messages = self.ctx.messages.clone();
        let input_ids = messages.iter().map(|m| m.id.clone()).collect();

        info!(
            "Compression started in background ({}, preserve_recent={})",
            strategy.kind, strategy.preserve_recent
        );
        let handle = tokio::spawn(async move { engine.compress(&messages, &strategy, &token).await });
        self.pending = Some(PendingCompression {
            handle,
            cancel,
            input_ids,
        });
    }

    fn cancel_pending(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
            pending.handle.abort();
            debug!("Discarded in-flight compression: {reason}");
        }
    }

    async fn apply_finished_compression(&mut self) {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.handle.is_finished())
        {
            self.finish_pending().await;
        }
    }

    async fn finish_pending(&mut self) -> Option<CompressionResult> {
        let pending = self.pending.take()?;
        match pending.handle.await {
            Ok(_) if pending.cancel.is_cancelled() => {
                debug!("Discarding result of a cancelled compression");
                None
            }
            Ok(result) => {
                let added: Vec<Message> = self
                    .ctx
                    .messages
                    .iter()
                    .filter(|m| !pending.input_ids.contains(&m.id))
                    .cloned()
                    .collect();
                Some(self.apply_result(result, added).await)
            }
            Err(e) => {
                warn!("Background compression task failed: {e}");
                None
            }
        }
    }

    /// Replace the live messages with a compression result plus `added`.
    /// Inflated and no-op results leave the context untouched.
    async fn apply_result(
        &mut self,
        result: CompressionResult,
        added: Vec<Message>,
    ) -> CompressionResult {
        if result.is_inflated() {
            self.emit(ContextEvent::CompressionInflated {
                strategy: result.strategy,
                original_tokens: result.original_tokens,
                compressed_tokens: result.compressed_tokens,
            });
            return result;
        }
        if result.is_noop() {
            debug!("Compression found nothing to drop");
            return result;
        }

        self.guard_snapshot().await;

        let mut messages = result.clone().into_messages();
        messages.extend(added);
        self.ctx.replace_messages(messages);
        if let Some(text) = self.prompt.as_ref().map(|p| p.text.clone()) {
            self.ctx.set_system_prompt(text);
        }
        self.ctx.record_compression(result.to_record());
        self.recount();
        self.emit(ContextEvent::CompressionCompleted {
            strategy: result.strategy,
            original_tokens: result.original_tokens,
            compressed_tokens: result.compressed_tokens,
            messages_compressed: result.messages_compressed(),
            used_fallback: result.used_fallback,
        });
        result
    }

    /// Cancel background work and truncate inline.
    async fn relieve_overflow(&mut self) {
        if !self.config.compression.enabled {
            warn!("Context near overflow and compression is disabled");
            return;
        }
        self.cancel_pending("pre-overflow relief");
        let strategy = self.strategy();
        let result = self
            .engine
            .truncate(&self.ctx.messages, strategy.preserve_recent);
        let result = self.apply_result(result, Vec::new()).await;
        if result.is_inflated() || result.is_noop() {
            return;
        }
        // The relief may land between the compression threshold and the
        // warning, where neither would fire again on its own.
        if let Some(manager) = self.snapshots.as_ref() {
            manager.thresholds().reset();
        }
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Snapshot the live context and wait until it is on disk.
    pub async fn create_snapshot(&mut self) -> Result<SnapshotMetadata> {
        self.start()?;
        let handle = self.snapshots()?.spawn_snapshot(&self.ctx)?;
        let meta = handle
            .await
            .map_err(|e| ContextError::Task(e.to_string()))??;
        self.emit(ContextEvent::SnapshotCreated {
            id: meta.id.clone(),
            token_count: meta.token_count,
        });
        Ok(meta)
    }

    /// Replace the live context with a stored snapshot.
    ///
    /// The session id, context limit and system prompt of this orchestrator
    /// are kept; messages, checkpoints, goals and history come from the
    /// snapshot.
    pub async fn restore_snapshot(&mut self, id: &str) -> Result<()> {
        self.start()?;
        self.cancel_pending("restore");
        let mut restored = self.snapshots()?.restore_snapshot(id)?;
        restored.session_id = self.ctx.session_id.clone();
        restored.metadata.model = self.model.id.clone();
        restored.set_max_tokens(self.ctx.max_tokens);
        self.ctx = restored;
        if let Some(text) = self.prompt.as_ref().map(|p| p.text.clone()) {
            self.ctx.set_system_prompt(text);
        }
        self.recount();
        self.snapshots()?.thresholds().reset();
        info!(
            "Restored snapshot {id}: {} messages, {}",
            self.ctx.messages.len(),
            self.ctx.usage().to_log_string()
        );
        self.after_mutation().await
    }

    async fn guard_snapshot(&self) {
        let Some(manager) = self.snapshots.as_ref().filter(|m| m.is_enabled()) else {
            return;
        };
        let outcome = match manager.spawn_snapshot(&self.ctx) {
            Ok(handle) => handle
                .await
                .map_err(|e| ContextError::Task(e.to_string()))
                .and_then(|r| r),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(meta) => {
                debug!("Guard snapshot {} written before compression", meta.id);
                self.emit(ContextEvent::SnapshotCreated {
                    id: meta.id,
                    token_count: meta.token_count,
                });
            }
            Err(e) => warn!("Guard snapshot failed, compressing anyway: {e}"),
        }
    }

    fn schedule_snapshot(&mut self) {
        let Some(manager) = self.snapshots.as_ref().filter(|m| m.is_enabled()) else {
            return;
        };
        match manager.spawn_snapshot(&self.ctx) {
            Ok(handle) => self.snapshot_tasks.push(handle),
            Err(e) => warn!("Could not schedule snapshot: {e}"),
        }
    }

    /// Collect background snapshot writes that have finished.
    async fn reap_snapshots(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.snapshot_tasks)
            .into_iter()
            .partition(|h| h.is_finished());
        self.snapshot_tasks = running;
        for handle in done {
            self.finish_snapshot_task(handle).await;
        }
    }

    async fn finish_snapshot_task(&self, handle: JoinHandle<Result<SnapshotMetadata>>) {
        match handle.await {
            Ok(Ok(meta)) => self.emit(ContextEvent::SnapshotCreated {
                id: meta.id,
                token_count: meta.token_count,
            }),
            Ok(Err(e)) => warn!("Background snapshot failed: {e}"),
            Err(e) => warn!("Background snapshot task failed: {e}"),
        }
    }

    fn snapshots(&self) -> Result<&SnapshotManager> {
        self.snapshots
            .as_ref()
            .ok_or_else(|| ContextError::Configuration("orchestrator not started".into()))
    }

    // ── Post-mutation loop ─────────────────────────────────────────

    async fn after_mutation(&mut self) -> Result<()> {
        self.reap_snapshots().await;
        self.apply_finished_compression().await;

        let report = self
            .snapshots()?
            .check_thresholds(self.ctx.token_count, self.ctx.max_tokens);
        for &fraction in &report.crossed {
            self.emit(ContextEvent::ThresholdReached {
                fraction,
                usage: report.usage,
            });
        }

        if report.overflow_warning {
            self.emit(ContextEvent::OverflowWarning {
                usage: report.usage,
                current_tokens: self.ctx.token_count,
                max_tokens: self.ctx.max_tokens,
            });
            self.relieve_overflow().await;
            self.compress_due.store(false, Ordering::Release);
        } else if self.compress_due.swap(false, Ordering::AcqRel) {
            self.spawn_compression();
        }

        if self.snapshot_due.swap(false, Ordering::AcqRel) {
            self.schedule_snapshot();
        }
        Ok(())
    }

    fn recount(&mut self) {
        self.ctx
            .recount(self.counter.as_ref(), self.tier.profile().max_checkpoints);
    }

    fn emit(&self, event: ContextEvent) {
        self.events.on_event(&event);
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn usage(&self) -> ContextUsage {
        self.ctx.usage()
    }

    pub fn context(&self) -> &ConversationContext {
        &self.ctx
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    pub fn tier(&self) -> ContextTier {
        self.tier
    }

    pub fn mode(&self) -> OperationalMode {
        self.mode
    }

    pub fn prompt(&self) -> Option<&PromptTemplate> {
        self.prompt.as_ref()
    }

    pub fn snapshot_manager(&self) -> Option<&SnapshotManager> {
        self.snapshots.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotsToggle;
    use crate::context::HeuristicTokenCounter;
    use crate::context::tier::UnknownCapacity;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn orchestrator(
        config: ContextConfig,
        model_limit: usize,
    ) -> (ContextOrchestrator, UnboundedReceiver<ContextEvent>) {
        let (handler, rx) = ChannelHandler::new();
        let orch = ContextOrchestrator::new(
            "test-session",
            ModelInfo::new("test/model", Some(model_limit)),
            config,
            Arc::new(HeuristicTokenCounter::default()),
        )
        .with_capacity_source(UnknownCapacity)
        .with_event_handler(handler);
        (orch, rx)
    }

    fn no_snapshots() -> ContextConfig {
        ContextConfig {
            snapshots: SnapshotsToggle::disabled(),
            ..ContextConfig::default()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ContextEvent>) -> Vec<ContextEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn start_selects_tier_and_prompt() {
        let (mut orch, mut rx) = orchestrator(no_snapshots(), 16_384);
        orch.start().unwrap();

        assert_eq!(orch.tier(), ContextTier::Standard);
        assert_eq!(orch.context().max_tokens, 8192);
        assert_eq!(orch.mode(), OperationalMode::Developer);
        assert!(orch.context().system_prompt().is_some());

        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            ContextEvent::TierChanged {
                from: None,
                to: ContextTier::Standard,
                context_limit: 8192
            }
        ));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ContextEvent::SystemPromptUpdated { .. }))
        );

        // Idempotent.
        orch.start().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn invalid_threshold_is_a_configuration_error() {
        let (mut orch, _rx) = orchestrator(no_snapshots().with_compression_threshold(1.5), 8192);
        assert!(matches!(orch.start(), Err(ContextError::Configuration(_))));
    }

    #[tokio::test]
    async fn mode_change_replaces_prompt() {
        let (mut orch, mut rx) = orchestrator(no_snapshots(), 8192);
        orch.start().unwrap();
        let before = orch.context().system_prompt().unwrap().content.clone();
        drain(&mut rx);

        orch.set_mode(OperationalMode::Debugger).await.unwrap();
        let after = orch.context().system_prompt().unwrap().content.clone();
        assert_ne!(before, after);
        assert_eq!(
            orch.context().messages.iter().filter(|m| m.is_system()).count(),
            1
        );

        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            ContextEvent::ModeChanged {
                from: OperationalMode::Developer,
                to: OperationalMode::Debugger
            }
        ));

        orch.set_mode(OperationalMode::Debugger).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn limit_update_moves_tier() {
        let (mut orch, mut rx) = orchestrator(no_snapshots(), 8192);
        orch.start().unwrap();
        assert_eq!(orch.tier(), ContextTier::Standard);
        drain(&mut rx);

        orch.update_context_limit(3000).await.unwrap();
        assert_eq!(orch.tier(), ContextTier::Minimal);
        assert_eq!(orch.usage().max_tokens, 3000);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ContextEvent::TierChanged {
                from: Some(ContextTier::Standard),
                to: ContextTier::Minimal,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn records_emit_events_and_reach_the_prompt() {
        let (mut orch, mut rx) = orchestrator(no_snapshots(), 8192);
        orch.set_task_definition("Port the index to the new format")
            .await
            .unwrap();
        orch.add_architecture_decision("Keep one JSON document per snapshot")
            .await
            .unwrap();
        orch.add_never_compressed("API key lives in OPENROUTER_KEY")
            .await
            .unwrap();
        orch.add_message(Message::user("go")).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ContextEvent::TaskDefined { .. })));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ContextEvent::ArchitectureDecision { .. }))
        );
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ContextEvent::NeverCompressedAdded { .. }))
        );

        let messages = orch.prompt_messages();
        assert_eq!(messages[0].id, crate::context::conversation::SYSTEM_PROMPT_ID);
        assert_eq!(messages[1].id, CHECKPOINT_BLOCK_ID);
        assert!(messages[1].content.contains("Task: Port the index"));
        assert!(messages[1].content.contains("[decision] Keep one JSON"));
        assert_eq!(messages.last().unwrap().content, "go");
        assert_eq!(messages.len(), orch.context().messages.len() + 1);
    }

    #[tokio::test]
    async fn goals_and_reasoning_are_tracked() {
        let (mut orch, _rx) = orchestrator(no_snapshots(), 8192);
        orch.push_goal("parse");
        orch.push_goal("validate");
        orch.record_reasoning("index first");
        assert_eq!(orch.complete_goal().unwrap().description, "validate");
        let ctx = orch.context();
        assert_eq!(ctx.goal_stack.as_ref().unwrap().completed.len(), 1);
        assert_eq!(ctx.reasoning_trace.as_ref().unwrap().steps.len(), 1);
    }

    #[tokio::test]
    async fn compress_now_requires_compression_enabled() {
        let config = ContextConfig {
            compression: crate::config::CompressionToggle::disabled(),
            ..no_snapshots()
        };
        let (mut orch, _rx) = orchestrator(config, 8192);
        assert!(matches!(
            orch.compress_now().await,
            Err(ContextError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn overflow_triggers_inline_truncate_with_guard_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = ContextConfig::default()
            .with_snapshot_dir(dir.path())
            .with_compression_threshold(1.0);
        let (mut orch, mut rx) = orchestrator(config, 4096);
        orch.start().unwrap();
        assert_eq!(orch.tier(), ContextTier::Basic);

        for i in 0..30 {
            orch.add_message(Message::user(format!("continue with part {i}")))
                .await
                .unwrap();
            orch.add_message(Message::assistant(format!("Part {i} done. {}", "ok ".repeat(230))))
                .await
                .unwrap();
            assert!(orch.usage().usage_pct < 1.0, "usage exceeded the window");
        }
        orch.stop().await;

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ContextEvent::OverflowWarning { .. }))
        );
        assert!(events.iter().any(|e| matches!(
            e,
            ContextEvent::CompressionCompleted {
                strategy: crate::compression::StrategyKind::Truncate,
                ..
            }
        )));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ContextEvent::SnapshotCreated { .. }))
        );

        let ctx = orch.context();
        assert_eq!(ctx.user_messages().count(), 30);
        assert!(ctx.is_chronological());
        assert!(ctx.messages.iter().any(|m| m.is_summary()));
        assert_eq!(ctx.system_prompt().unwrap().id, ctx.messages[0].id);
        assert!(!orch.snapshot_manager().unwrap().list_snapshots("test-session").unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflow_relief_rearms_the_compression_threshold() {
        let mut config = no_snapshots().with_strategy(crate::compression::StrategyKind::Truncate);
        config.compression.config.preserve_recent = Some(3400);
        let (mut orch, mut rx) = orchestrator(config, 4096);
        orch.start().unwrap();

        let mut events = Vec::new();
        for i in 0..40 {
            orch.add_message(Message::assistant(format!("note {i} {}", "lorem ".repeat(115))))
                .await
                .unwrap();
            events.extend(drain(&mut rx));
            if events
                .iter()
                .any(|e| matches!(e, ContextEvent::OverflowWarning { .. }))
            {
                break;
            }
        }
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ContextEvent::OverflowWarning { .. }))
        );
        let usage = orch.usage().usage_pct;
        assert!((0.80..0.95).contains(&usage), "relief left usage at {usage}");

        orch.add_message(Message::user("keep going")).await.unwrap();
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ContextEvent::ThresholdReached { fraction, .. } if (*fraction - 0.80).abs() < 1e-9
        )));
        orch.stop().await;
    }

    #[tokio::test]
    async fn restore_brings_back_compression_history() {
        let dir = TempDir::new().unwrap();
        let mut config = ContextConfig::default()
            .with_snapshot_dir(dir.path())
            .with_compression_threshold(1.0)
            .with_strategy(crate::compression::StrategyKind::Truncate);
        config.compression.config.preserve_recent = Some(0);
        let (mut orch, _rx) = orchestrator(config, 8192);
        orch.start().unwrap();

        for i in 0..10 {
            orch.add_message(Message::assistant(format!("note {i} {}", "lorem ".repeat(40))))
                .await
                .unwrap();
        }
        orch.compress_now().await.unwrap();
        assert_eq!(orch.context().metadata.compression_history.len(), 1);

        let meta = orch.create_snapshot().await.unwrap();
        orch.add_message(Message::user("after the snapshot"))
            .await
            .unwrap();
        orch.restore_snapshot(&meta.id).await.unwrap();

        let ctx = orch.context();
        assert_eq!(ctx.metadata.compression_history.len(), 1);
        assert_eq!(
            ctx.metadata.compression_history[0].strategy,
            crate::compression::StrategyKind::Truncate
        );
        assert!(ctx.last_compression_ratio().unwrap() < 1.0);
        assert!(!ctx.messages.iter().any(|m| m.content == "after the snapshot"));
        orch.stop().await;
    }

    #[tokio::test]
    async fn background_compression_is_applied_on_wait() {
        let config = no_snapshots().with_compression_threshold(0.5);
        let (mut orch, mut rx) = orchestrator(config, 4096);
        orch.start().unwrap();

        while !orch.has_pending_compression() {
            orch.add_message(Message::assistant(format!("note {}", "lorem ".repeat(60))))
                .await
                .unwrap();
            if orch.usage().usage_pct > 0.9 {
                break;
            }
        }
        let before = orch.usage().estimated_tokens;
        orch.add_message(Message::user("added while compressing"))
            .await
            .unwrap();

        // The pass may already have been applied by the last add.
        let _ = orch.wait_for_compression().await.unwrap();
        assert!(!orch.has_pending_compression());
        assert!(orch.usage().estimated_tokens < before);
        assert!(
            orch.context()
                .messages
                .iter()
                .any(|m| m.content == "added while compressing")
        );
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ContextEvent::CompressionCompleted { .. }
        )));
        assert_eq!(orch.context().metadata.compression_history.len(), 1);
    }
}
