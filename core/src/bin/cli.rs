/// CLI for one-shot store and queue operations
use colored::*;
use nutrisync_core::config::StoreBackend;
use nutrisync_core::session::{Draft, PageLoad};
use nutrisync_core::store::{open_stores, MessageStore, OutboundQueue, SledStore};
use nutrisync_core::types::{AuthorRole, DeliveryStatus, NewMessage, QueueEntryId, SessionContext};
use nutrisync_core::view::ViewRow;
use nutrisync_core::{ChatSession, Config};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let bin = args.first().cloned().unwrap_or_else(|| "cli".to_string());
    let (config, positional) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = positional.first() else {
        print_usage(&bin);
        return Ok(());
    };
    let rest = &positional[1..];

    match (command.as_str(), rest) {
        ("history", [user_code, more @ ..]) => {
            let pages = more.first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1);
            history(&config, user_code, pages).await?;
        }
        ("post", [user_code, words @ ..]) if !words.is_empty() => {
            post_client_message(&config, user_code, words.join(" ")).await?;
        }
        ("send", [user_code, words @ ..]) if !words.is_empty() => {
            send(&config, user_code, words.join(" "), AuthorRole::Operator).await?;
        }
        ("reply", [user_code, words @ ..]) if !words.is_empty() => {
            send(&config, user_code, words.join(" "), AuthorRole::Assistant).await?;
        }
        ("queue", more) => {
            let limit = more.first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(20);
            show_queue(&config, limit).await?;
        }
        ("settle", [id, status]) => {
            settle(&config, id, status).await?;
        }
        _ => {
            eprintln!("{} Unknown or incomplete command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "NutriSync CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args] [--data-dir <path>] [--rest-url <url>] [--operator <id>]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <user_code> [pages]     Print the newest page(s) of a conversation", "history".cyan());
    println!("  {} <user_code> <text>         Store a client-authored message", "post".cyan());
    println!("  {} <user_code> <text>         Queue an operator reply", "send".cyan());
    println!("  {} <user_code> <text>        Queue an assistant reply", "reply".cyan());
    println!("  {} [limit]                   List pending outbound entries", "queue".cyan());
    println!("  {} <entry_id> sent|failed   Settle an outbound entry", "settle".cyan());
}

fn context(config: &Config) -> SessionContext {
    match &config.operator_id {
        Some(id) => SessionContext::human(id.clone()),
        None => SessionContext::automation(None),
    }
}

async fn history(config: &Config, user_code: &str, pages: usize) -> anyhow::Result<()> {
    let stores = open_stores(config)?;
    let mut session = ChatSession::new(config, stores, context(config));
    session.open(user_code).await?;
    for _ in 1..pages {
        match session.load_older().await {
            PageLoad::Loaded { .. } => {}
            PageLoad::Failed(e) => anyhow::bail!("loading history failed: {}", e),
            _ => break,
        }
    }

    let view = session.view();
    if view.is_empty() {
        println!("No messages for {}", user_code);
    }
    for row in view.rows() {
        if let ViewRow::Confirmed(m) = row {
            let who = match m.role {
                AuthorRole::Client => m.role.to_string().green(),
                AuthorRole::Operator => m.role.to_string().cyan(),
                AuthorRole::Assistant => m.role.to_string().magenta(),
            };
            println!(
                "{} {} {}: {}",
                format!("#{}", m.id).dimmed(),
                m.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                who,
                m.content
            );
        }
    }
    if view.has_more() {
        println!("{}", "(older messages available)".dimmed());
    }
    session.close().await;
    Ok(())
}

async fn post_client_message(config: &Config, user_code: &str, text: String) -> anyhow::Result<()> {
    // The embedded store creates conversations on first contact; a hosted
    // store must already have one.
    let (messages, conversation): (Arc<dyn MessageStore>, _) = match &config.store {
        StoreBackend::Sled { data_dir } => {
            let store = SledStore::new(data_dir)?;
            let conversation = store.create_conversation(user_code, Some(user_code.to_string()))?;
            (Arc::new(store), conversation)
        }
        StoreBackend::Rest { .. } => {
            let messages = open_stores(config)?.messages;
            let conversation = messages.conversation_by_user_code(user_code).await?;
            (messages, conversation)
        }
    };
    let stored = messages
        .create(NewMessage {
            conversation_id: conversation.id,
            role: AuthorRole::Client,
            content: text,
            attachment_url: None,
        })
        .await?;
    println!("{} Stored message #{} in conversation {}", "✓".green(), stored.id, conversation.id);
    Ok(())
}

async fn send(config: &Config, user_code: &str, text: String, role: AuthorRole) -> anyhow::Result<()> {
    let stores = open_stores(config)?;
    let mut session = ChatSession::new(config, stores, context(config));
    session.open(user_code).await?;
    let result = match role {
        AuthorRole::Assistant => session.send_assistant_reply(Draft::text(text)).await,
        _ => session.send(Draft::text(text)).await,
    };
    session.close().await;

    match result {
        Ok(sent) => {
            println!(
                "{} Queued entry {} ({:?}, priority {})",
                "✓".green(),
                sent.entry.id,
                sent.entry.message_type,
                sent.entry.priority
            );
            Ok(())
        }
        Err(failure) => {
            eprintln!("{} {}", "✗".red().bold(), failure);
            eprintln!("  draft: {}", failure.draft.content);
            std::process::exit(1);
        }
    }
}

async fn show_queue(config: &Config, limit: usize) -> anyhow::Result<()> {
    let stores = open_stores(config)?;
    let pending = stores.queue.pending(limit).await?;
    if pending.is_empty() {
        println!("No pending entries");
        return Ok(());
    }
    println!("Pending ({}):", pending.len());
    println!("{:-<60}", "");
    for e in pending {
        println!(
            "  {} [p{}] {:?} -> {} @ {}: {}",
            e.id,
            e.priority,
            e.message_type,
            e.target_user_id,
            e.scheduled_for.format("%Y-%m-%d %H:%M"),
            e.content
        );
    }
    Ok(())
}

async fn settle(config: &Config, id: &str, status: &str) -> anyhow::Result<()> {
    let id = QueueEntryId(id.parse::<i64>().map_err(|_| anyhow::anyhow!("entry id must be a number"))?);
    let status = match status {
        "sent" => DeliveryStatus::Sent,
        "failed" => DeliveryStatus::Failed,
        other => anyhow::bail!("status must be sent or failed, got {}", other),
    };
    let stores = open_stores(config)?;
    let entry = stores.queue.settle(id, status).await?;
    println!("{} Entry {} is now {}", "✓".green(), entry.id, entry.status);
    Ok(())
}
