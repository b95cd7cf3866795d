//! Command-line probe for a realtime endpoint.
//!
//! Connects with options from a TOML file (plus flag overrides), then
//! either publishes messages and waits for their acks, or attaches to a
//! channel and prints every message it receives as a JSON line.
//!
//! Usage:
//!   rt-probe --config probe.toml publish chat greeting '{"text":"hi"}'
//!   rt-probe --endpoint wss://rt.example.com --key app.k:secret subscribe chat
//!
//! Logging follows `RUST_LOG` (default: `info`) and goes to stderr.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use rt_client::{ClientOptions, ConnectionState, Message, Realtime};
use rt_domain::ConfigSeverity;
use tracing_subscriber::EnvFilter;

/// Realtime connection probe.
#[derive(Debug, Parser)]
#[command(name = "rt-probe", version, about)]
struct Cli {
    /// TOML file with client options.
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Endpoint override.
    #[arg(long)]
    endpoint: Option<String>,
    /// API key override (`name:secret`).
    #[arg(long)]
    key: Option<String>,
    /// Client id override.
    #[arg(long)]
    client_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish messages and wait until the service acknowledges them.
    Publish {
        channel: String,
        /// Message name.
        name: String,
        /// Payload. Parsed as JSON when possible, sent as a string otherwise.
        data: String,
        /// Number of messages to publish.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Attach and print received messages until interrupted.
    Subscribe {
        channel: String,
        /// Exit after this many messages.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = load_options(&cli)?;

    let client = Realtime::builder()
        .options(options)
        .auto_connect(true)
        .build()?;
    spawn_state_logger(&client);

    let result = match cli.command {
        Command::Publish {
            channel,
            name,
            data,
            count,
        } => publish(&client, &channel, &name, &data, count).await,
        Command::Subscribe { channel, limit } => subscribe(&client, &channel, limit).await,
    };

    client.close();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client.wait_for_state(ConnectionState::Closed),
    )
    .await;
    result
}

fn load_options(cli: &Cli) -> anyhow::Result<ClientOptions> {
    let mut options = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ClientOptions::from_toml_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => ClientOptions::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        options.endpoint = endpoint.clone();
    }
    if let Some(key) = &cli.key {
        options.key = Some(key.clone());
    }
    if let Some(client_id) = &cli.client_id {
        options.client_id = Some(client_id.clone());
    }

    let errors: Vec<String> = options
        .validate()
        .into_iter()
        .filter(|issue| issue.severity == ConfigSeverity::Error)
        .map(|issue| issue.to_string())
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }
    Ok(options)
}

fn spawn_state_logger(client: &Realtime) {
    let mut changes = client.on_state_change();
    tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            match &change.reason {
                Some(reason) => tracing::info!(
                    from = %change.previous,
                    to = %change.current,
                    code = reason.code,
                    reason = %reason.message,
                    "connection state"
                ),
                None => tracing::info!(from = %change.previous, to = %change.current, "connection state"),
            }
        }
    });
}

async fn publish(
    client: &Realtime,
    channel: &str,
    name: &str,
    data: &str,
    count: u32,
) -> anyhow::Result<()> {
    let payload =
        serde_json::from_str(data).unwrap_or_else(|_| serde_json::Value::String(data.to_owned()));
    let channel = client.channel(channel);

    let started = Instant::now();
    let mut pending = Vec::with_capacity(count as usize);
    for _ in 0..count {
        pending.push(channel.publish(vec![Message::new(name, payload.clone())])?);
    }
    for (i, done) in pending.into_iter().enumerate() {
        done.await.with_context(|| format!("publish #{i} failed"))?;
    }
    tracing::info!(
        channel = %channel.name(),
        count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all messages acknowledged"
    );
    Ok(())
}

async fn subscribe(client: &Realtime, channel: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let channel = client.channel(channel);
    let mut messages = channel.subscribe();
    channel.attach().await.context("attach failed")?;
    tracing::info!(channel = %channel.name(), "attached; waiting for messages");

    let mut received = 0usize;
    loop {
        tokio::select! {
            msg = messages.next() => {
                let Some(msg) = msg else { break };
                println!("{}", serde_json::to_string(&msg)?);
                received += 1;
                if limit.is_some_and(|n| received >= n) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
    tracing::info!(channel = %channel.name(), received, "subscribe finished");
    Ok(())
}
