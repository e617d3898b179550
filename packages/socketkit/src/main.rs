use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

use socketkit::config::{FileConfig, WebSocketConfig, load_config};
use socketkit::{Session, SessionEvent, WebSocketTransport};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "skit")]
#[command(about = "Talk to a socket session server from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./socketkit.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured endpoint
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Override the configured token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue one call and print its result
    Call(CallArgs),

    /// Print push events until interrupted
    Listen(ListenArgs),
}

#[derive(Parser)]
struct CallArgs {
    /// Operation name, e.g. get_current_client
    operation: String,

    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,
}

#[derive(Parser)]
struct ListenArgs {
    /// Event names to print
    #[arg(required = true)]
    events: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "socketkit=debug,skit=debug,info"
    } else {
        "socketkit=info,skit=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from("socketkit.toml")).filter(|p| p.exists()));
    let mut config: FileConfig = load_config(config_path.as_deref())
        .extract()
        .context("failed to load configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(token) = cli.token {
        config.credentials.token = token;
    }

    let transport = WebSocketTransport::new(WebSocketConfig::from_file(&config.websocket));
    let session = Session::with_lifecycle_capacity(Arc::new(transport), config.lifecycle_capacity);

    match cli.command {
        Commands::Call(args) => call_command(&session, &config, args).await,
        Commands::Listen(args) => listen_command(&session, &config, args).await,
    }
}

async fn open(session: &Session, config: &FileConfig) -> Result<broadcast::Receiver<SessionEvent>> {
    let mut lifecycle = session.lifecycle();
    session
        .connect(&config.endpoint, config.handshake())
        .with_context(|| format!("failed to connect to {}", config.endpoint))?;
    wait_for_connected(&mut lifecycle).await?;
    info!(endpoint = %config.endpoint, "session open");
    Ok(lifecycle)
}

async fn wait_for_connected(lifecycle: &mut broadcast::Receiver<SessionEvent>) -> Result<()> {
    let mut last_error = None;
    loop {
        match lifecycle.recv().await {
            Ok(SessionEvent::Connected) => return Ok(()),
            Ok(SessionEvent::Error { message }) => last_error = Some(message),
            Ok(SessionEvent::Disconnected { code, reason }) => {
                let detail = last_error.unwrap_or(reason);
                bail!("connection closed before it was established ({code}): {detail}");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "lifecycle receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => bail!("session dropped"),
        }
    }
}

async fn close(session: &Session) {
    if !session.close(CLOSE_TIMEOUT).await {
        debug!("timed out waiting for the connection to close");
    }
}

async fn call_command(session: &Session, config: &FileConfig, args: CallArgs) -> Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;
    open(session, config).await?;

    let outcome = session.call(&args.operation, payload).await;
    close(session).await;

    let result = outcome.with_context(|| format!("call {} failed", args.operation))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn listen_command(session: &Session, config: &FileConfig, args: ListenArgs) -> Result<()> {
    for event in &args.events {
        let name = event.clone();
        session.on(event.as_str(), move |payload| {
            println!("{}", serde_json::json!({"event": name, "payload": payload}));
        });
    }
    let mut lifecycle = open(session, config).await?;
    info!(events = ?args.events, "listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                close(session).await;
                return Ok(());
            }
            event = lifecycle.recv() => match event {
                Ok(SessionEvent::Disconnected { code, reason }) => {
                    bail!("connection closed ({code}): {reason}");
                }
                Ok(SessionEvent::Error { message }) => {
                    tracing::warn!(error = %message, "session error");
                }
                Ok(SessionEvent::Connected) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "lifecycle receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}
