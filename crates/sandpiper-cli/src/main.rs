//! Sandpiper CLI
//!
//! The `sandpiper` command runs sandboxed programs and scripted agent turns
//! against a directory of JSON / NDJSON datasets.
//!
//! ## Commands
//!
//! - `exec`: Run one program and print its artifact
//! - `turn`: Run a scripted turn, streaming events as newline-delimited JSON
//! - `tables`: List the tables visible to sandboxed code
//! - `history`: List conversations or show one in full
//! - `replay`: Re-run a stored artifact against the current data

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use sandpiper_core::domain::ExecutionTiming;
use sandpiper_core::sandbox::{Dispatcher, Executor, FetchPolicy};
use sandpiper_core::turn::{ArtifactPayload, ModelClient};
use sandpiper_core::{ChatService, EngineConfig, ScriptedModelClient};
use sandpiper_state::{
    ConversationId, ConversationStore, EqualityFilter, SurrealConversationStore, TableStore,
};

#[derive(Parser)]
#[command(name = "sandpiper")]
#[command(author = "Sandpiper Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed code execution and turn streaming for data agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single program and print the resulting artifact
    Exec {
        /// Dataset directory
        #[arg(short, long, env = "SANDPIPER_DATA", default_value = "data")]
        data: PathBuf,

        /// Program file, or `-` to read from stdin
        program: PathBuf,
    },

    /// Run one turn with a scripted model, streaming events as NDJSON
    Turn {
        /// Dataset directory
        #[arg(short, long, env = "SANDPIPER_DATA", default_value = "data")]
        data: PathBuf,

        /// Conversation database directory
        #[arg(long, env = "SANDPIPER_DB", default_value = ".sandpiper/db")]
        db: PathBuf,

        /// JSON file of model blocks (one turn, or a list of turns)
        #[arg(short, long)]
        script: PathBuf,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// The user message
        message: String,
    },

    /// List tables and their columns
    Tables {
        /// Dataset directory
        #[arg(short, long, env = "SANDPIPER_DATA", default_value = "data")]
        data: PathBuf,
    },

    /// List conversations, or show one conversation in full
    History {
        /// Conversation database directory
        #[arg(long, env = "SANDPIPER_DB", default_value = ".sandpiper/db")]
        db: PathBuf,

        /// Conversation to show
        conversation: Option<String>,
    },

    /// Re-run a stored artifact against the current datasets
    Replay {
        /// Dataset directory
        #[arg(short, long, env = "SANDPIPER_DATA", default_value = "data")]
        data: PathBuf,

        /// Conversation database directory
        #[arg(long, env = "SANDPIPER_DB", default_value = ".sandpiper/db")]
        db: PathBuf,

        /// Artifact ID
        artifact: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    sandpiper_core::init_tracing(cli.json, level);

    let config = EngineConfig::from_env().context("Invalid SANDPIPER_* configuration")?;
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Exec { data, program } => {
            let store = open_data(&data)?;
            let source = read_program(&program)?;
            cmd_exec(store, &config, &source, &mut out).await
        }
        Commands::Turn {
            data,
            db,
            script,
            conversation,
            message,
        } => {
            let text = std::fs::read_to_string(&script)
                .context(format!("Failed to read model script {:?}", script))?;
            let model = ScriptedModelClient::from_json(&text)
                .context(format!("Invalid model script {:?}", script))?;
            let service = ChatService::new(
                open_data(&data)?,
                open_history(&db).await?,
                Arc::new(model),
                config,
            );
            cmd_turn(&service, conversation, &message, &mut out).await
        }
        Commands::Tables { data } => cmd_tables(open_data(&data)?.as_ref(), &mut out).await,
        Commands::History { db, conversation } => {
            let service = ChatService::new(
                Arc::new(sandpiper_state::MemoryTableStore::new()),
                open_history(&db).await?,
                idle_model(),
                config,
            );
            cmd_history(&service, conversation, &mut out).await
        }
        Commands::Replay { data, db, artifact } => {
            let service = ChatService::new(
                open_data(&data)?,
                open_history(&db).await?,
                idle_model(),
                config,
            );
            cmd_replay(&service, &artifact, &mut out).await
        }
    }
}

fn open_data(dir: &Path) -> Result<Arc<dyn TableStore>> {
    let store = sandpiper_state::loader::load_dir(dir)
        .context(format!("Failed to load datasets from {:?}", dir))?;
    info!(tables = store.len(), "datasets loaded");
    Ok(Arc::new(store))
}

async fn open_history(db: &Path) -> Result<Arc<dyn ConversationStore>> {
    let store = SurrealConversationStore::local(db)
        .await
        .context(format!("Failed to open conversation database {:?}", db))?;
    Ok(Arc::new(store))
}

/// Model for commands that never start a turn.
fn idle_model() -> Arc<dyn ModelClient> {
    Arc::new(ScriptedModelClient::default())
}

fn read_program(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read program from stdin")?;
        Ok(source)
    } else {
        std::fs::read_to_string(path).context(format!("Failed to read program {:?}", path))
    }
}

#[derive(Serialize)]
struct ExecOutput {
    #[serde(flatten)]
    artifact: ArtifactPayload,
    timing: ExecutionTiming,
}

/// Run one program and print its artifact as JSON.
async fn cmd_exec(
    store: Arc<dyn TableStore>,
    config: &EngineConfig,
    source: &str,
    out: &mut impl Write,
) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(store, FetchPolicy::new(config.max_fetch_limit)));
    let executor = Executor::new(dispatcher, config.interpreter_limits())
        .with_dispatch_timeout(config.dispatch_timeout());
    let cancel = CancellationToken::new();

    let report = executor.execute(source, &cancel).await;
    if let Some(fault) = report.upstream {
        anyhow::bail!("Execution aborted: {}", fault);
    }

    let output = ExecOutput {
        artifact: ArtifactPayload::from(&report.artifact),
        timing: report.artifact.timing.clone(),
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&output)?)?;
    Ok(())
}

/// Run one turn, writing each event as a JSON line. Ctrl-C cancels the turn.
async fn cmd_turn(
    service: &ChatService,
    conversation: Option<String>,
    message: &str,
    out: &mut impl Write,
) -> Result<()> {
    let mut stream = service
        .start_turn(conversation.map(ConversationId), message)
        .await
        .context("Failed to start turn")?;
    let cancel = stream.cancellation_token();

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                writeln!(out, "{}", serde_json::to_string(&event)?)?;
                out.flush()?;
            }
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                info!("interrupted; cancelling turn");
                cancel.cancel();
            }
        }
    }
    Ok(())
}

async fn cmd_tables(store: &dyn TableStore, out: &mut impl Write) -> Result<()> {
    let names = store.table_names().await?;
    if names.is_empty() {
        writeln!(out, "No tables found.")?;
        return Ok(());
    }

    for name in names {
        let rows = store.count(&name, &EqualityFilter::new()).await?;
        writeln!(out, "{} ({} rows)", name, rows)?;
        for column in store.describe(&name).await? {
            writeln!(out, "  {:<24} {}", column.column_name, column.column_type)?;
        }
    }
    Ok(())
}

async fn cmd_history(
    service: &ChatService,
    conversation: Option<String>,
    out: &mut impl Write,
) -> Result<()> {
    match conversation {
        Some(id) => {
            let detail = service
                .get_conversation(&ConversationId(id.clone()))
                .await
                .context(format!("Conversation not found: {}", id))?;
            writeln!(out, "{}", serde_json::to_string_pretty(&detail)?)?;
        }
        None => {
            let conversations = service.list_conversations().await?;
            if conversations.is_empty() {
                writeln!(out, "No conversations yet.")?;
            }
            for c in conversations {
                writeln!(
                    out,
                    "{}  {}  {}",
                    c.id,
                    c.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    c.title
                )?;
            }
        }
    }
    Ok(())
}

async fn cmd_replay(service: &ChatService, artifact_id: &str, out: &mut impl Write) -> Result<()> {
    let result = service
        .replay(artifact_id)
        .await
        .context(format!("Failed to replay artifact {}", artifact_id))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
    Ok(())
}
