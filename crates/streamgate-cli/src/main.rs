//! streamgate - tail the API gateway event stream
//!
//! Connects to one streaming endpoint and prints every event as a JSON line
//! until interrupted.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use streamgate::{
    ConnectionEvent, Connectivity, Credentials, Entitlement, Envelope, PlanGate, PlanTier,
    StreamClient, StreamConfig,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(about = "Tail events from the API gateway stream")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print events from one endpoint until Ctrl-C
    Tail(TailArgs),

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "streamgate.toml")]
        output: PathBuf,

        /// Backend base URL
        #[arg(long, default_value = "http://localhost:8000")]
        base_url: String,
    },
}

#[derive(Args)]
struct TailArgs {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides the config file)
    #[arg(long, env = "STREAMGATE_BASE_URL")]
    base_url: Option<String>,

    /// Endpoint path, e.g. /apis/123/overview
    #[arg(short, long)]
    endpoint: String,

    /// Topic to print; repeatable
    #[arg(short, long = "topic", default_value = "*")]
    topics: Vec<String>,

    /// Auth token for the query-parameter fallback
    #[arg(long, env = "STREAMGATE_TOKEN")]
    token: Option<String>,

    /// Session cookie (`name=value`)
    #[arg(long, env = "STREAMGATE_COOKIE")]
    cookie: Option<String>,

    /// Caller's plan; live streaming requires pro or above
    #[arg(long)]
    plan: Option<PlanTier>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Tail(args) => {
            tail(args).await?;
        }

        Commands::InitConfig { output, base_url } => {
            init_config(&output, base_url)?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("streamgate=info"));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries events; logs go to stderr.
    if json {
        registry.with(fmt::layer().json().with_writer(io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
}

fn load_config(args: &TailArgs) -> anyhow::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => StreamConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url.clone_from(base_url);
        config.validate()?;
    }
    Ok(config)
}

async fn tail(args: TailArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    info!(base_url = %config.base_url, endpoint = %args.endpoint, "starting tail");

    let credentials = Credentials::none()
        .with_token(args.token.unwrap_or_default())
        .with_session_cookie(args.cookie.unwrap_or_default());

    let mut client = StreamClient::new(config, args.endpoint.as_str(), credentials);
    if let Some(plan) = args.plan {
        client = client.with_access(&PlanGate::default(), &Entitlement::for_plan(plan));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    for topic in &args.topics {
        let tx = tx.clone();
        client.subscribe(topic.as_str(), move |envelope| {
            let _ = tx.send(envelope.clone());
        });
    }
    drop(tx);

    if client.connect()? == Connectivity::Polling {
        warn!("plan does not include live streaming, poll the REST API instead");
        return Ok(());
    }

    let mut lifecycle = client.lifecycle();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                }
                break Ok(());
            }
            Some(envelope) = rx.recv() => {
                println!("{}", serde_json::to_string(&envelope)?);
            }
            event = lifecycle.recv() => match event {
                Ok(ConnectionEvent::ReconnectFailed { attempts, reason }) => {
                    break Err(anyhow::anyhow!(
                        "gave up after {attempts} reconnect attempts: {reason}"
                    ));
                }
                Ok(event) => info!(?event, "connection event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed connection events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    client.disconnect().await;
    info!("disconnected");
    result
}

fn init_config(output: &Path, base_url: String) -> anyhow::Result<()> {
    let config = StreamConfig::new(base_url);
    config.validate()?;
    std::fs::write(output, config.to_toml()?)
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Config written to {}", output.display());
    println!();
    println!("Then run:");
    println!(
        "  streamgate tail --config {} --endpoint /apis/<id>/overview --token <token>",
        output.display()
    );

    Ok(())
}
