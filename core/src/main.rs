/// NutriSync console - watches one client conversation
///
/// Prints view events as JSON lines on stdout. Lines typed on stdin are sent
/// as operator replies; `/older` loads history, `/refresh` polls now,
/// `/open <user_code>` switches conversation.
use nutrisync_core::session::{Draft, PageLoad};
use nutrisync_core::store::open_stores;
use nutrisync_core::types::SessionContext;
use nutrisync_core::{ChatSession, Config};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays one JSON event per line
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (config, positional) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let user_code = positional.first().cloned().ok_or_else(|| {
        anyhow::anyhow!(
            "Usage: {} <user_code> [--data-dir <path>] [--rest-url <url>] [--page-size <n>] [--poll-secs <n>] [--max-backoff-secs <n>] [--operator <id>]",
            args.first().map(String::as_str).unwrap_or("core")
        )
    })?;
    let operator_id = config
        .operator_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("An operator id is required (--operator or NUTRISYNC_OPERATOR_ID)"))?;

    let stores = open_stores(&config)?;
    let mut session = ChatSession::new(&config, stores, SessionContext::human(operator_id));
    let mut events = session.subscribe();

    info!("Starting NutriSync console for {}", user_code);
    session.open(&user_code).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            _ = session.next_update() => {}
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(n)) => warn!("Console lagged {} events", n),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => handle_line(&mut session, line.trim()).await,
                None => stdin_open = false,
            },
        }
    }

    session.close().await;
    info!("Console stopped");
    Ok(())
}

async fn handle_line(session: &mut ChatSession, line: &str) {
    if line.is_empty() {
        return;
    }
    if line == "/older" {
        match session.load_older().await {
            PageLoad::Exhausted => info!("No older messages"),
            PageLoad::Failed(e) => warn!("Loading history failed: {}", e),
            _ => {}
        }
    } else if line == "/refresh" {
        session.refresh_now();
    } else if let Some(code) = line.strip_prefix("/open ") {
        if let Err(e) = session.open(code.trim()).await {
            warn!("Opening {} failed: {}", code.trim(), e);
        }
    } else if let Err(failure) = session.send(Draft::text(line)).await {
        // the draft stays with the operator; print it back for retry
        warn!("{} (draft kept: {:?})", failure, failure.draft.content);
    }
}
