//! # wamp
//!
//! Command-line WAMP client: connects, announces configured prefixes, then
//! performs one call, publish, or subscription.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use wamp_core::logging::init_subscriber;
use wamp_session::WampSession;
use wamp_settings::loader::parse_prefix_pair;
use wamp_settings::{WampSettings, load_settings_from_path, settings_path};
use wamp_transport::{WebSocketConfig, WebSocketTransport};

/// WAMP command-line client.
#[derive(Parser, Debug)]
#[command(
    name = "wamp",
    about = "Call procedures and publish or subscribe to topics on a WAMP server"
)]
struct Cli {
    /// Server URL (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Settings file (defaults to `~/.wamp/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Prefix to announce after connecting, as `prefix=uri`. Repeatable.
    #[arg(long = "prefix", value_parser = parse_prefix_arg)]
    prefixes: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a procedure and print its result.
    Call {
        /// Procedure URI (full or `prefix:suffix`).
        procedure: String,
        /// Arguments, parsed as JSON and falling back to plain strings.
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
        /// Give up after this many milliseconds (overrides settings).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Publish one event to a topic.
    Publish {
        /// Topic URI (full or `prefix:suffix`).
        topic: String,
        /// Event payload, parsed as JSON and falling back to a plain string.
        #[arg(allow_hyphen_values = true)]
        event: String,
    },
    /// Print events from a topic, one JSON document per line.
    Subscribe {
        /// Topic URI (full or `prefix:suffix`).
        topic: String,
        /// Exit after this many events.
        #[arg(long)]
        count: Option<usize>,
    },
}

fn parse_prefix_arg(val: &str) -> std::result::Result<(String, String), String> {
    parse_prefix_pair(val).ok_or_else(|| format!("expected prefix=uri, got {val:?}"))
}

/// Parse a command-line value as JSON, falling back to a string.
fn parse_json_arg(val: &str) -> Value {
    serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.to_owned()))
}

fn load_settings(cli: &Cli) -> Result<WampSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    if let Some(url) = &cli.url {
        settings.client.url.clone_from(url);
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    for (prefix, uri) in &cli.prefixes {
        let _ = settings.prefixes.insert(prefix.clone(), uri.clone());
    }
    Ok(settings)
}

/// Connect, wait for WELCOME, and announce every configured prefix.
async fn connect(settings: &WampSettings) -> Result<(WampSession, Arc<WebSocketTransport>)> {
    let config = WebSocketConfig {
        subprotocol: settings.client.subprotocol().map(str::to_owned),
    };
    let (transport, inbound) = WebSocketTransport::new(config);
    let transport = Arc::new(transport);
    let session = WampSession::new(
        transport.clone(),
        inbound,
        settings.client.session_config(),
    );

    let url = &settings.client.url;
    let welcome = session
        .connect(url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    info!(
        session_id = %welcome.session_id,
        server = %welcome.server_ident,
        protocol_version = welcome.protocol_version,
        "welcomed"
    );

    for (prefix, uri) in &settings.prefixes {
        session
            .define_prefix(prefix, uri)
            .with_context(|| format!("Failed to announce prefix {prefix}"))?;
    }
    Ok((session, transport))
}

async fn run(session: &WampSession, command: Command) -> Result<()> {
    match command {
        Command::Call {
            procedure,
            args,
            timeout_ms,
        } => {
            let args = args.iter().map(|a| parse_json_arg(a)).collect();
            let pending = match timeout_ms {
                Some(ms) => {
                    session.call_with_timeout::<Value>(&procedure, args, Duration::from_millis(ms))
                }
                None => session.call::<Value>(&procedure, args),
            };
            let result = pending
                .await
                .with_context(|| format!("Call to {procedure} failed"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Publish { topic, event } => {
            session
                .publish(&topic, parse_json_arg(&event))
                .with_context(|| format!("Failed to publish to {topic}"))?;
        }
        Command::Subscribe { topic, count } => {
            let mut subscriber = session
                .subscribe::<Value>(&topic)
                .with_context(|| format!("Failed to subscribe to {topic}"))?;
            let mut received = 0usize;
            loop {
                tokio::select! {
                    event = subscriber.recv() => match event {
                        Some(Ok(event)) => {
                            println!("{}", serde_json::to_string(&event)?);
                            received += 1;
                            if count.is_some_and(|c| received >= c) {
                                break;
                            }
                        }
                        Some(Err(error)) => warn!(%error, "undecodable event"),
                        None => {
                            info!(topic = %topic, "subscription ended");
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_subscriber(&settings.logging.level);

    let (session, transport) = connect(&settings).await?;
    let outcome = run(&session, cli.command).await;

    session.close();
    if tokio::time::timeout(Duration::from_secs(2), transport.wait_closed())
        .await
        .is_err()
    {
        warn!("timed out flushing the connection");
    }
    outcome
}
