#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use log::{debug, info, warn, LevelFilter};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod utils;

use tripchat::config::{self, ClientConfig};
use tripchat::error::ChatResult;
use tripchat::models::{Chat, ChatContext, MessagePage};
use tripchat::sync::api::{ChatApi, HttpChatApi};
use tripchat::sync::memory::{loopback_responder, MemoryTransport};
use tripchat::sync::ChatSession;
use tripchat::EngineEvent;

/// Command line arguments for tripchat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tripchat: booking-portal chat synchronization tools.",
    long_about = "Tools around the chat synchronization core.\n\n\
    replay   Feed a JSON-lines push-event script through the engine and print the resulting conversation\n\
    history  Fetch a conversation's history from the API\n\
    login    Store the API endpoint, user and token in the config file"
)]
struct Args {
    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Use this config file instead of the per-user one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a push-event script against an in-memory server
    Replay {
        script: PathBuf,
        #[arg(long, default_value = "booking")]
        context_type: String,
        #[arg(long)]
        context_id: String,
        /// Existing chat for the context; omit to start without one
        #[arg(long)]
        chat_id: Option<String>,
        /// Local user (defaults to the configured one)
        #[arg(long)]
        user: Option<String>,
    },
    /// Print the history of the chat attached to a context
    History {
        #[arg(long, default_value = "booking")]
        context_type: String,
        #[arg(long)]
        context_id: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Save the API endpoint and credentials for later runs
    Login {
        #[arg(long)]
        user: String,
        #[arg(long)]
        api_base_url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
}

/// One line of a replay script.
#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
enum ScriptStep {
    /// Server pushes `event` with `payload`.
    Push { event: String, payload: Value },
    Send { content: String },
    MarkRead,
    Typing,
    /// Transport drops; pushes are lost until `reconnect`.
    Drop {
        #[serde(default)]
        reason: Option<String>,
    },
    Reconnect,
    Wait { ms: u64 },
}

/// API stand-in for replays: knows one chat and has no stored history.
struct ReplayApi {
    chat: Option<Chat>,
}

#[async_trait]
impl ChatApi for ReplayApi {
    async fn fetch_chat(&self, context: &ChatContext) -> ChatResult<Option<Chat>> {
        Ok(self.chat.clone().filter(|chat| chat.context() == *context))
    }

    async fn fetch_messages(&self, _chat_id: &str, _page: u32, _limit: u32) -> ChatResult<MessagePage> {
        Ok(MessagePage::default())
    }

    async fn mark_chat_read(&self, _chat_id: &str) -> ChatResult<u32> {
        Ok(0)
    }

    async fn unread_count(&self, _chat_id: &str) -> ChatResult<u32> {
        Ok(0)
    }

    async fn total_unread_count(&self) -> ChatResult<u32> {
        Ok(0)
    }
}

fn read_script(path: &PathBuf) -> Result<Vec<ScriptStep>> {
    let file = File::open(path).with_context(|| format!("Cannot open script {}", path.display()))?;
    let mut steps = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let step = serde_json::from_str(trimmed)
            .with_context(|| format!("{}:{}: invalid step", path.display(), number + 1))?;
        steps.push(step);
    }
    Ok(steps)
}

async fn replay(config: ClientConfig, script: &PathBuf, context: ChatContext, chat_id: Option<String>) -> Result<()> {
    let steps = read_script(script)?;
    info!("Replaying {} steps for {} as {}", steps.len(), context, config.user_id);

    let chat = chat_id.map(|chat_id| Chat {
        chat_id,
        context_type: context.context_type.clone(),
        context_id: context.context_id.clone(),
        participant_type: None,
        participants: Vec::new(),
    });
    let transport = MemoryTransport::new();
    transport.set_responder(loopback_responder(&config.user_id));

    let user_id = config.user_id.clone();
    let (session, mut events) = ChatSession::new(config, Arc::new(ReplayApi { chat }), transport.clone());
    session.connect();
    session.open(context).await?;

    for step in steps {
        debug!("Step: {:?}", step);
        match step {
            ScriptStep::Push { event, payload } => {
                if !transport.deliver(&event, payload) {
                    warn!("'{}' lost: transport is down", event);
                }
            }
            ScriptStep::Send { content } => {
                if let Err(e) = session.send(&content).await {
                    warn!("Send failed: {}", e);
                }
            }
            ScriptStep::MarkRead => {
                if let Err(e) = session.mark_read().await {
                    warn!("Mark-read failed: {}", e);
                }
            }
            ScriptStep::Typing => session.notify_typing(),
            ScriptStep::Drop { reason } => {
                transport.drop_connection(reason.as_deref().unwrap_or("dropped by script"));
            }
            ScriptStep::Reconnect => {
                session.connection().reconnect();
            }
            ScriptStep::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
        // Let the connection watcher and spawned reactions run.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Error(e) => println!("! {}", e),
            EngineEvent::ChatCreated { chat_id } => println!("* chat {} created", chat_id),
            EngineEvent::Typing { user_id, typing } => {
                println!("* {} {} typing", user_id, if typing { "started" } else { "stopped" })
            }
            EngineEvent::MessagesChanged => {}
        }
    }

    println!(
        "chat: {}",
        session.engine().chat_id().unwrap_or_else(|| "(none)".to_string())
    );
    for message in session.engine().messages() {
        println!("{}", utils::format_message(&message, &user_id));
    }

    session.logout().await;
    Ok(())
}

async fn history(config: ClientConfig, context: ChatContext, page: u32) -> Result<()> {
    let api = HttpChatApi::new(&config)?;
    let chat = api
        .fetch_chat(&context)
        .await?
        .ok_or_else(|| anyhow!("No chat exists for {}", context))?;
    let fetched = api.fetch_messages(&chat.chat_id, page, config.page_size).await?;

    println!("chat {} ({} messages in total)", chat.chat_id, fetched.total);
    for message in &fetched.messages {
        println!("{}", utils::format_message(message, &config.user_id));
    }
    if fetched.has_more {
        println!("(more with --page {})", page + 1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    utils::setup_logging(args.log_file.as_ref().and_then(|p| p.to_str()), args.log_level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(path) = args.config {
        info!("Using config file {}", path.display());
        config::set_config_path_override(path);
    }
    let mut config = config::load_config()?;

    match args.command {
        Command::Replay {
            script,
            context_type,
            context_id,
            chat_id,
            user,
        } => {
            if let Some(user) = user {
                config.user_id = user;
            }
            if config.user_id.is_empty() {
                return Err(anyhow!("No local user: pass --user or set TRIPCHAT_USER_ID"));
            }
            replay(config, &script, ChatContext::new(context_type, context_id), chat_id).await
        }
        Command::History {
            context_type,
            context_id,
            page,
        } => history(config, ChatContext::new(context_type, context_id), page.max(1)).await,
        Command::Login {
            user,
            api_base_url,
            token,
        } => {
            let base_url = api_base_url.unwrap_or_else(|| config.api_base_url.clone());
            let mut stored = ClientConfig::new(&base_url, &user);
            stored.page_size = config.page_size;
            stored.request_timeout_ms = config.request_timeout_ms;
            if let Some(token) = token {
                stored = stored.with_token(&token);
            }
            config::save_config(&stored)?;
            println!("Saved config for {}", stored.user_id);
            Ok(())
        }
    }
}
