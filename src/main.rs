//! Terminal front-end for a single chat session
//!
//! Usage: `chat-relay [CONFIG]`. Lines read from stdin are sent to the model;
//! `/continue`, `/restart`, `/model`, `/markdown` and `/metrics` are commands.

use anyhow::{Context, Result};
use chat_relay::config::{Config, SessionConfig, DEFAULT_CONFIG_PATH};
use chat_relay::metrics::METRICS;
use chat_relay::{escape_markdown, logging, ChatOrchestrator, JsonFileStore, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

const SESSION_ID: i64 = 0;

const TYPING_INTERVAL: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::from_file(&path).context("Failed to load configuration")?;

    logging::init(&config.logging)?;

    let orchestrator = Arc::new(
        ChatOrchestrator::from_config(&config).context("Failed to create orchestrator")?,
    );

    let store = config.snapshot.path.as_ref().map(JsonFileStore::new);
    if let Some(store) = &store {
        if let Some(snapshot) = store.load().await.context("Failed to load sessions")? {
            orchestrator.import_sessions(&snapshot).await;
        }
    }

    let sessions = &config.session;
    let mut markdown = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "/continue" => send(&orchestrator, sessions, "continue", true, markdown).await,
            "/restart" => {
                ensure_session(&orchestrator, sessions).await;
                match orchestrator.restart_session(SESSION_ID).await {
                    Ok(()) => println!("(conversation restarted)"),
                    Err(e) => {
                        warn!(error = %e, "restart failed");
                        println!("(restart failed: {})", e);
                    }
                }
            }
            "/model" => println!("(using the {} model)", orchestrator.active_endpoint()),
            "/markdown" => {
                markdown = !markdown;
                println!("(markdown output {})", if markdown { "on" } else { "off" });
            }
            "/metrics" => print!("{}", METRICS.gather_text()),
            text => send(&orchestrator, sessions, text, false, markdown).await,
        }
    }

    if let Some(store) = &store {
        let snapshot = orchestrator.export_sessions().await;
        store.save(&snapshot).await.context("Failed to save sessions")?;
    }
    orchestrator.shutdown();
    info!("bye");

    Ok(())
}

/// Start the chat again if it left the registry while idle
async fn ensure_session(orchestrator: &ChatOrchestrator, sessions: &SessionConfig) {
    let started = orchestrator
        .ensure_session(SESSION_ID, &sessions.default_prompt, sessions.default_max_history)
        .await;
    if started {
        debug!(session_id = SESSION_ID, "chat started implicitly");
    }
}

/// Run one reply on its own task while signalling progress on a timer
async fn send(
    orchestrator: &Arc<ChatOrchestrator>,
    sessions: &SessionConfig,
    text: &str,
    force_keep: bool,
    markdown: bool,
) {
    ensure_session(orchestrator, sessions).await;

    let mut worker = {
        let orchestrator = orchestrator.clone();
        let text = text.to_string();
        tokio::spawn(async move { orchestrator.get_reply(SESSION_ID, &text, force_keep).await })
    };

    let mut ticker = tokio::time::interval(TYPING_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => debug!(session_id = SESSION_ID, "typing"),
            joined = &mut worker => {
                match joined {
                    Ok(Ok(reply)) => {
                        if markdown {
                            println!("{}", escape_markdown(&reply.text));
                        } else {
                            println!("{}", reply.text);
                        }
                        if !reply.at_end {
                            println!("(reply truncated, send /continue)");
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "no reply");
                        println!("(no reply: {})", e);
                    }
                    Err(e) => error!(error = %e, "reply task failed"),
                }
                return;
            }
        }
    }
}
