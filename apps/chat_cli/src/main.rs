use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{build_controller, load_settings, ChatSnapshot, SyncController, SyncEvent};
use shared::domain::{ChatMessage, ConversationId};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal chat client for pet matches.
#[derive(Parser, Debug)]
struct Args {
    /// Bearer token issued by the matchmaking backend.
    #[arg(long)]
    token: String,
    /// Overrides `api_base_url` from chat.toml and the environment.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    /// Match to open instead of the most recent one.
    #[arg(long = "match")]
    match_id: Option<String>,
}

const HELP: &str = "/list  /switch <match-id>  /read  /resync  /hide  /show  /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(base) = args.api_base_url {
        settings.api_base_url = client_core::config::normalize_api_base(&base);
    }
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = Some(ws_url);
    }

    let controller = build_controller(&settings, &args.token).context("invalid client settings")?;
    let printer = tokio::spawn(print_updates(
        Arc::clone(&controller),
        controller.subscribe_updates(),
    ));

    controller
        .start(&args.token)
        .await
        .context("failed to start chat session")?;
    if let Some(match_id) = args.match_id {
        controller
            .select_conversation(ConversationId::from(match_id))
            .await;
    }
    print_conversations(&controller.snapshot().await);
    println!("{HELP}");

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !run_command(&controller, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.shutdown().await;
    printer.abort();
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_command(controller: &Arc<SyncController>, line: &str) -> bool {
    let mut parts = line.splitn(2, ' ');
    match (parts.next().unwrap_or_default(), parts.next().map(str::trim)) {
        ("", _) => {}
        ("/quit", _) => return false,
        ("/list", _) => print_conversations(&controller.snapshot().await),
        ("/switch", Some(id)) if !id.is_empty() => {
            controller
                .select_conversation(ConversationId::from(id))
                .await
        }
        ("/read", _) => controller.mark_active_read().await,
        ("/resync", _) => controller.resync().await,
        ("/hide", _) => controller.set_visibility(false).await,
        ("/show", _) => controller.set_visibility(true).await,
        (command, _) if command.starts_with('/') => println!("{HELP}"),
        _ => {
            controller.set_draft(line).await;
            controller.send_message().await;
        }
    }
    true
}

async fn print_updates(controller: Arc<SyncController>, mut updates: broadcast::Receiver<SyncEvent>) {
    let mut printed: HashSet<String> = HashSet::new();
    let mut current: Option<ConversationId> = None;
    loop {
        match updates.recv().await {
            Ok(SyncEvent::Changed) => {
                let snapshot = controller.snapshot().await;
                let open = snapshot.phase.conversation_id().cloned();
                if open != current {
                    printed.clear();
                    current = open;
                }
                for message in &snapshot.messages {
                    if printed.insert(message_key(message)) {
                        print_message(&snapshot, message);
                    }
                }
            }
            Ok(SyncEvent::SendFailed { text, error }) => {
                println!("! not sent ({error}): {text}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// Pending entries are keyed by temp id and printed again once confirmed.
fn message_key(message: &ChatMessage) -> String {
    match (&message.id, &message.client_temp_id) {
        (Some(id), _) => id.to_string(),
        (None, Some(temp)) => temp.to_string(),
        (None, None) => format!("{}:{}", message.sender_id, message.created_at),
    }
}

fn print_message(snapshot: &ChatSnapshot, message: &ChatMessage) {
    let who = if snapshot.local_user.as_ref() == Some(&message.sender_id) {
        "me".to_string()
    } else {
        snapshot
            .conversations
            .iter()
            .find(|c| c.id == message.conversation_id)
            .and_then(|c| c.participants.iter().find(|p| p.user_id == message.sender_id))
            .and_then(|p| p.display_name.clone())
            .unwrap_or_else(|| message.sender_id.to_string())
    };
    let status = if message.is_pending() { " (sending)" } else { "" };
    println!(
        "[{}] {who}: {}{status}",
        message.created_at.format("%H:%M"),
        message.text
    );
}

fn print_conversations(snapshot: &ChatSnapshot) {
    let Some(me) = snapshot.local_user.as_ref() else {
        return;
    };
    let open = snapshot.phase.conversation_id();
    for conversation in &snapshot.conversations {
        let marker = if Some(&conversation.id) == open { '*' } else { ' ' };
        let label = conversation
            .peer_of(me)
            .map(|peer| peer.label())
            .unwrap_or_else(|| "Partner".to_string());
        let preview = conversation
            .last_preview
            .as_ref()
            .map(|p| p.text.as_str())
            .unwrap_or("No messages yet");
        let unread = match conversation.unread_count {
            0 => String::new(),
            n => format!(" [{n}]"),
        };
        println!("{marker} {} {label}{unread}: {preview}", conversation.id);
    }
    if snapshot.peer_read_last_own {
        println!("  · Read");
    }
}
