//! # relay
//!
//! Command-line watcher for TBURN live channels. Subscribes through
//! `relay-client` and prints every cache update as one JSON line on stdout.
//! Logs go to stderr.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use relay_client::{LiveClient, LiveQuery, QueryOptions};
use relay_logging::{LoggingConfig, init_logging};
use relay_settings::{RelaySettings, load_settings, load_settings_from_path};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Watch TBURN live channels.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Watch TBURN live channels", version)]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe and print updates until interrupted.
    Watch(WatchArgs),
    /// Fetch keys once over HTTP and print them.
    Fetch(FetchArgs),
    /// Print the effective settings.
    Settings,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// WebSocket endpoint (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// HTTP base URL for refetches (overrides settings).
    #[arg(long)]
    http: Option<String>,

    /// Subscription as `channel=key`. Repeatable.
    #[arg(long = "subscribe", short = 's', value_parser = parse_subscription, required = true)]
    subscriptions: Vec<(String, String)>,

    /// Also refetch every key over HTTP on this period, in seconds.
    #[arg(long)]
    poll_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct FetchArgs {
    /// HTTP base URL (overrides settings).
    #[arg(long)]
    http: Option<String>,

    /// Keys to fetch.
    #[arg(required = true)]
    keys: Vec<String>,
}

fn parse_subscription(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((channel, key)) if !channel.is_empty() && !key.is_empty() => {
            Ok((channel.to_string(), key.to_string()))
        }
        _ => Err(format!("expected channel=key, got {raw:?}")),
    }
}

fn emit(line: &Value) {
    println!("{line}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    if cli.json_logs {
        settings.logging.json = true;
    }
    init_logging(&LoggingConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    )?)?;

    match cli.command {
        Command::Watch(args) => watch(settings, args).await,
        Command::Fetch(args) => fetch(settings, args).await,
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn watch(mut settings: RelaySettings, args: WatchArgs) -> Result<()> {
    if let Some(url) = args.url {
        settings.connection.url = url;
    }
    if let Some(http) = args.http {
        settings.http.base_url = Some(http);
    }
    settings.validate()?;

    let mut options = QueryOptions::default();
    if let Some(secs) = args.poll_secs {
        options = options.refetch_interval(Duration::from_secs(secs));
    }

    let client = LiveClient::new(settings)?;
    let mut tasks = JoinSet::new();
    for (channel, key) in args.subscriptions {
        let query = client
            .subscribe_with(channel.as_str(), key.as_str(), options.clone())
            .with_context(|| format!("Failed to subscribe to {channel}={key}"))?;
        let _ = tasks.spawn(print_updates(query));
    }

    let mut states = client.watch_connection();
    let _ = tasks.spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            emit(&json!({"event": "connection", "state": state}));
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("interrupted, shutting down");
    client.close();
    tasks.abort_all();
    Ok(())
}

async fn print_updates(mut query: LiveQuery) {
    loop {
        match query.changed().await {
            Ok(view) => emit(&json!({
                "event": "update",
                "channel": query.channel().as_str(),
                "key": query.key().as_str(),
                "value": view.value.as_deref(),
                "stale": query.is_stale(),
                "fetching": view.is_fetching,
                "error": view.error.map(|e| e.to_string()),
                "revision": view.revision,
            })),
            Err(err) => {
                warn!(key = %query.key(), error = %err, "stopped watching");
                return;
            }
        }
    }
}

async fn fetch(mut settings: RelaySettings, args: FetchArgs) -> Result<()> {
    if let Some(http) = args.http {
        settings.http.base_url = Some(http);
    }
    if settings.http.base_url.is_none() {
        bail!("No HTTP base URL configured; pass --http or set RELAY_HTTP_BASE_URL");
    }
    settings.validate()?;

    let client = LiveClient::new(settings)?;
    for key in args.keys {
        let value = client
            .refetch(key.as_str())
            .await
            .with_context(|| format!("Failed to fetch {key}"))?;
        emit(&json!({"key": key, "value": &*value}));
    }
    client.close();
    Ok(())
}
