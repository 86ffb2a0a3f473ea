#![forbid(unsafe_code)]

//! `duplex-requester`: drives one interaction against `duplex-responder`.
//!
//! The connection also serves the requester's health routes, which the
//! responder's duplex sessions call back into.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use duplex_watchdog::auth::Credentials;
use duplex_watchdog::config::GlobalConfig;
use duplex_watchdog::protocol::frame::{Metadata, SetupFrame};
use duplex_watchdog::roles::initiator::{
    initiator_router, HealthMonitor, Initiator, InitiatorSettings,
};
use duplex_watchdog::roles::CONNECT_SETUP_ROUTE;
use duplex_watchdog::transport::{connect, ConnectionContext};
use duplex_watchdog::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "duplex-requester",
    about = "Requester for duplex-responder",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Authenticate the whole connection with the configured requester
    /// credentials.
    #[arg(long)]
    setup_auth: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One request, one reply.
    RequestResponse {
        /// Destination id.
        #[arg(long, default_value_t = 123)]
        id: i64,
        /// Greeting payload.
        #[arg(long, default_value = "Reactive Spring")]
        payload: String,
    },

    /// Call the authenticated route.
    Auth {
        /// Username; defaults to `requester.username`.
        #[arg(long)]
        username: Option<String>,
        /// Password; defaults to the keychain or `DUPLEX_REQUESTER_PASSWORD`.
        #[arg(long)]
        password: Option<String>,
    },

    /// Send one message without waiting for a reply.
    FireForget,

    /// Stream ids through the upper-casing channel.
    ChannelStream,

    /// Open duplex sessions until the health watchdog stops them.
    Bidirectional {
        /// Override `channel.client_count`.
        #[arg(long)]
        clients: Option<u32>,
    },

    /// Call the failing route and print the fallback.
    Error,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Command::Bidirectional {
        clients: Some(clients),
    } = args.command
    {
        config.channel.client_count = clients.max(1);
    }

    let needs_credentials = args.setup_auth
        || matches!(args.command, Command::Auth { password: None, .. });
    if needs_credentials {
        config.load_credentials().await?;
    }

    let monitor = Arc::new(
        HealthMonitor::new(config.stop_after()).evict_after(config.poll_interval() * 10),
    );
    let ctx = ConnectionContext::new(initiator_router(monitor, config.poll_interval()));

    let mut metadata = Metadata::default();
    if args.setup_auth {
        let credentials = config.requester_credentials().ok_or_else(|| {
            AppError::Config("--setup-auth needs requester.username".into())
        })?;
        metadata = metadata.with_auth(credentials);
    }
    let setup = SetupFrame {
        route: Some(CONNECT_SETUP_ROUTE.to_owned()),
        metadata,
    };

    let ct = CancellationToken::new();
    let peer = connect(config.transport_addr()?, setup, ctx, &ct).await?;
    let initiator = Initiator::new(peer, InitiatorSettings::from_config(&config));

    let outcome = execute(&initiator, &config, args.command).await;
    ct.cancel();
    outcome
}

async fn execute(initiator: &Initiator, config: &GlobalConfig, command: Command) -> Result<()> {
    match command {
        Command::RequestResponse { id, payload } => {
            let reply = initiator.request_response(id, &payload).await?;
            println!("{reply}");
        }
        Command::Auth { username, password } => {
            let username = username.or_else(|| config.requester.username.clone());
            let credentials = match (username, password) {
                (Some(username), Some(password)) => Credentials::new(username, password),
                (Some(_), None) => config.requester_credentials().ok_or_else(|| {
                    AppError::Config("no password available for requester".into())
                })?,
                (None, _) => {
                    return Err(AppError::Config(
                        "auth needs --username or requester.username".into(),
                    ))
                }
            };
            let reply = initiator.authenticate(credentials).await?;
            println!("{reply}");
        }
        Command::FireForget => {
            let id = initiator.fire_and_forget().await?;
            info!(%id, "fire-and-forget sent");
            println!("sent {id}");
            // Brief sleep to let the writer flush before the runtime stops.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Command::ChannelStream => {
            let mut replies = Box::pin(initiator.channel_stream()?);
            while let Some(reply) = replies.next().await {
                println!("{}", reply?);
            }
        }
        Command::Bidirectional { .. } => {
            let mut replies = Box::pin(initiator.launch_clients());
            while let Some((client_id, reply)) = replies.next().await {
                match reply {
                    Ok(message) => println!(
                        "Client #{client_id} [{}] {}",
                        message.sequence,
                        duplex_watchdog::router::payload_text(&message.payload)
                    ),
                    Err(err) => eprintln!("Client #{client_id} failed: {err}"),
                }
            }
        }
        Command::Error => {
            println!("{}", initiator.error_with_fallback().await);
        }
    }
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
