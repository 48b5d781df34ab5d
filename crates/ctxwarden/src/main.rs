//! Inspect tiers, replay transcripts and manage snapshots from the shell.
//!
//! Log output goes to stderr and is controlled by `RUST_LOG`.
//!
//! # Examples
//!
//! ```sh
//! # What a 16K window gets
//! ctxwarden tier --limit 16384 --mode debugger --show-prompt
//!
//! # Feed a transcript through a session, summarizing via OpenRouter
//! OPENROUTER_KEY=... ctxwarden replay transcript.json --limit 8192 --summarize
//!
//! # Snapshots
//! ctxwarden snapshots list my-session
//! ctxwarden snapshots verify snap-18f2c3a1b2c4d5e6-0003
//! ctxwarden snapshots restore snap-18f2c3a1b2c4d5e6-0003
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use ctxwarden::context::tier::{EnvCapacity, resolve_context_limit};
use ctxwarden::context::{ContextTier, OperationalMode, select_prompt_template};
use ctxwarden::prelude::*;
use ctxwarden::snapshot::VerifyStatus;
use serde::Deserialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Context-window management for terminal LLM clients.
#[derive(Parser)]
#[command(name = "ctxwarden", version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the tier, strategy and system prompt for a context limit
    Tier {
        /// Context limit in tokens; resolved from config and capacity when omitted
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, value_enum, default_value_t = ModeArg::Developer)]
        mode: ModeArg,

        /// Print the full system prompt
        #[arg(long)]
        show_prompt: bool,
    },

    /// Feed a JSON transcript (`[{"role": ..., "content": ...}]`) through a session
    Replay {
        transcript: PathBuf,

        /// Session id used for snapshots
        #[arg(long, default_value = "replay")]
        session: String,

        /// Model id reported to the summarizer
        #[arg(long, default_value = "anthropic/claude-sonnet-4")]
        model: String,

        /// Model context limit in tokens
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, value_enum, default_value_t = ModeArg::Developer)]
        mode: ModeArg,

        /// Summarize through OpenRouter (reads OPENROUTER_KEY)
        #[arg(long)]
        summarize: bool,

        /// Print the final message list as JSON
        #[arg(long)]
        dump: bool,
    },

    /// Inspect and manage stored snapshots
    Snapshots {
        /// Snapshot root; overrides the configured directory
        #[arg(long)]
        dir: Option<PathBuf>,

        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List sessions that have snapshots
    Sessions,
    /// List a session's snapshots, oldest first
    List { session: String },
    /// Structurally validate a snapshot document
    Verify { id: String },
    /// Print the restored context as JSON
    Restore { id: String },
    Delete { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Developer,
    Planning,
    Assistant,
    Debugger,
}

impl From<ModeArg> for OperationalMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Developer => OperationalMode::Developer,
            ModeArg::Planning => OperationalMode::Planning,
            ModeArg::Assistant => OperationalMode::Assistant,
            ModeArg::Debugger => OperationalMode::Debugger,
        }
    }
}

#[derive(Deserialize)]
struct TranscriptEntry {
    role: MessageRole,
    content: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> ctxwarden::Result<()> {
    let config = match &cli.config {
        Some(path) => ContextConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ContextConfig::default(),
    };

    match cli.command {
        Command::Tier {
            limit,
            mode,
            show_prompt,
        } => {
            show_tier(&config, limit, mode.into(), show_prompt);
            Ok(())
        }
        Command::Replay {
            transcript,
            session,
            model,
            limit,
            mode,
            summarize,
            dump,
        } => {
            let opts = ReplayOptions {
                session,
                model: ModelInfo::new(model, limit),
                mode: mode.into(),
                summarize,
                dump,
            };
            replay(config, &transcript, opts).await
        }
        Command::Snapshots { dir, action } => {
            let mut toggle = config.snapshots;
            toggle.enabled = true;
            if let Some(dir) = dir {
                toggle.config.directory = dir;
            }
            snapshots(SnapshotManager::new(toggle)?, action)
        }
    }
}

fn show_tier(config: &ContextConfig, limit: Option<usize>, mode: OperationalMode, show_prompt: bool) {
    let limit = limit.unwrap_or_else(|| {
        resolve_context_limit(None, &EnvCapacity::default(), &config.context_size)
    });
    let tier = ContextTier::select(limit);
    let profile = tier.profile();
    let strategy = tier.strategy_for(limit, &config.compression.config);
    let template = select_prompt_template(tier, mode);
    let counter = HeuristicTokenCounter::default();

    println!("limit:              {limit}");
    println!("tier:               {tier}");
    println!("strategy:           {}", strategy.kind);
    println!("preserve recent:    {} tokens", strategy.preserve_recent);
    println!("utilization target: {:.0}%", profile.utilization_target * 100.0);
    println!("max checkpoints:    {}", profile.max_checkpoints);
    println!(
        "system prompt:      ~{} / {} tokens ({mode})",
        counter.count_tokens(&template.text),
        template.token_budget
    );
    if show_prompt {
        println!("\n{}", template.text);
    }
}

struct ReplayOptions {
    session: String,
    model: ModelInfo,
    mode: OperationalMode,
    summarize: bool,
    dump: bool,
}

async fn replay(
    config: ContextConfig,
    path: &std::path::Path,
    opts: ReplayOptions,
) -> ctxwarden::Result<()> {
    let entries: Vec<TranscriptEntry> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let counter: Arc<dyn TokenCounter> = Arc::new(HeuristicTokenCounter::default());

    let mut orchestrator = ContextOrchestrator::new(opts.session, opts.model, config, counter)
        .with_mode(opts.mode)
        .with_event_handler(LoggingHandler);
    if opts.summarize {
        let client = OpenRouterClient::from_env()
            .map_err(|e| ContextError::Configuration(e.to_string()))?;
        orchestrator = orchestrator.with_provider(Arc::new(client));
    }
    orchestrator.start()?;

    for entry in entries {
        orchestrator
            .add_message(Message::new(entry.role, entry.content))
            .await?;
    }
    orchestrator.wait_for_compression().await?;
    orchestrator.stop().await;

    let ctx = orchestrator.context();
    println!("{}", orchestrator.usage().to_log_string());
    println!(
        "{} messages ({} user), {} compression(s), {}",
        ctx.messages.len(),
        ctx.user_messages().count(),
        ctx.metadata.compression_history.len(),
        orchestrator.tier()
    );
    if opts.dump {
        println!("{}", serde_json::to_string_pretty(&orchestrator.prompt_messages())?);
    }
    Ok(())
}

fn snapshots(manager: SnapshotManager, action: SnapshotAction) -> ctxwarden::Result<()> {
    match action {
        SnapshotAction::Sessions => {
            for session in manager.storage()?.list_sessions()? {
                println!("{session}");
            }
        }
        SnapshotAction::List { session } => {
            for meta in manager.list_snapshots(&session)? {
                println!(
                    "{}  {}  {:>7} tokens  {:>8} bytes  {}",
                    meta.id,
                    meta.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    meta.token_count,
                    meta.size_bytes,
                    meta.summary
                );
            }
        }
        SnapshotAction::Verify { id } => match manager.verify_snapshot(&id)? {
            VerifyStatus::Valid { version } => println!("{id}: valid (version {version})"),
            VerifyStatus::Corrupted { reason } => {
                println!("{id}: corrupted: {reason}");
                return Err(ContextError::Corruption { id, reason });
            }
            VerifyStatus::NotFound => return Err(ContextError::NotFound(id)),
        },
        SnapshotAction::Restore { id } => {
            let ctx = manager.restore_snapshot(&id)?;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        SnapshotAction::Delete { id } => {
            manager.delete_snapshot(&id)?;
            println!("deleted {id}");
        }
    }
    Ok(())
}
