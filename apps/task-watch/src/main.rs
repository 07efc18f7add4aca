#![allow(clippy::print_stdout)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use task_sync::{ConversationTurn, Envelope};
use task_sync_client::{EventHandler, SubscriptionFilter, SyncConfig, TaskSync};
use tracing::{info, warn};

/// Follow one task's conversation over the live event socket.
#[derive(Parser, Debug)]
struct Args {
    /// Task whose conversation is rendered.
    #[arg(long)]
    task: String,

    /// Socket URL. Relative paths are joined onto the API origin.
    #[arg(long)]
    ws_url: Option<String>,

    #[arg(long)]
    api_base: Option<String>,

    #[arg(long)]
    reconnect_interval_ms: Option<u64>,

    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Print turns as JSON lines instead of text.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(ws_url) = &self.ws_url {
            config.ws_url = Some(ws_url.clone());
        }
        if let Some(api_base) = &self.api_base {
            config.api_base_url.clone_from(api_base);
        }
        if let Some(ms) = self.reconnect_interval_ms {
            config.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = SyncConfig::from_env().context("read TASK_SYNC_* environment")?;
    args.apply(&mut config);

    let sync = TaskSync::with_defaults(&config).context("initialize task sync")?;
    let task_id = args.task.clone();

    let event_log: EventHandler = Arc::new(log_event);
    let subscription = sync.subscribe(
        event_log,
        SubscriptionFilter::all().with_task_ids([task_id.clone()]),
    );

    sync.connect();
    if let Err(error) = sync.load_conversation(&task_id).await {
        warn!(%task_id, "initial conversation load failed: {}", error);
    }
    render(&sync.get_turns(&task_id), args.json)?;

    let mut changes = sync.conversation_changes();
    let mut connection = sync.watch_connection_state();
    let mut last_status = sync.connection_status();
    info!(status = last_status.as_str(), "connection");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                render(&sync.get_turns(&task_id), args.json)?;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = sync.connection_status();
                if status != last_status {
                    info!(status = status.as_str(), "connection");
                    last_status = status;
                }
            }
        }
    }

    sync.unsubscribe(&subscription);
    sync.shutdown().await;
    Ok(())
}

fn log_event(envelope: Envelope) -> task_sync_client::Result<()> {
    info!(
        event_type = %envelope.event_type,
        timestamp = %envelope.timestamp,
        task_id = envelope.task_id.as_deref().unwrap_or("-"),
        "task event"
    );
    Ok(())
}

fn render(turns: &[ConversationTurn], json: bool) -> Result<()> {
    if json {
        for turn in turns {
            println!("{}", serde_json::to_string(turn).context("encode turn")?);
        }
        return Ok(());
    }

    println!("--- {} turns", turns.len());
    for turn in turns {
        match turn {
            ConversationTurn::Message { role, message } => {
                println!("[{}] {}", role.as_str(), message.text().unwrap_or_default());
            }
            ConversationTurn::Assistant(assistant) => {
                let marker = if assistant.is_streaming() { "..." } else { "" };
                for interaction in &assistant.tool_interactions {
                    let state = if interaction.tool_response.is_some() {
                        "done"
                    } else {
                        "pending"
                    };
                    println!(
                        "[tool] {} ({state})",
                        interaction.tool_call.function.name
                    );
                }
                println!(
                    "[assistant] {}{marker}",
                    assistant.final_content.as_deref().unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
