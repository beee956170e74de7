//! tcp-comms command line.
//!
//! `serve` runs an echo listener, `connect` sends a few messages to a
//! listener and prints the replies.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tcp_comms::{ClientSettings, Comms, ServerSettings, TcpClient, TcpServer};

/// How often the command loops poll the input queue.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "tcp-comms")]
#[command(version)]
#[command(about = "Heartbeat-supervised message transport over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a listener that echoes every payload back to its sender
    Serve {
        /// Settings file (defaults to settings.json in the config directory)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a listener, send messages and print the replies
    Connect {
        /// Server address
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Server port
        #[arg(long)]
        port: u16,
        /// Payload to send (repeatable)
        #[arg(long = "message")]
        messages: Vec<String>,
        /// How long to wait for replies before disconnecting
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
        /// Settings file (defaults to settings.json in the config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Serve { config, port } => {
            let mut settings = match config {
                Some(path) => ServerSettings::load_from(&path)?,
                None => ServerSettings::load()?,
            };
            if let Some(port) = port {
                settings.port = port;
            }
            runtime.block_on(run_server(settings))
        }
        Commands::Connect {
            host,
            port,
            messages,
            wait_ms,
            config,
        } => {
            let settings = match config {
                Some(path) => ClientSettings::load_from(&path)?,
                None => ClientSettings::load()?,
            };
            runtime.block_on(run_client(
                settings,
                host,
                port,
                &messages,
                Duration::from_millis(wait_ms),
            ))
        }
    }
}

async fn run_server(settings: ServerSettings) -> Result<()> {
    let server = TcpServer::new(settings)?;
    let listener = server.bind().await?;
    let shutdown = CancellationToken::new();

    let serving = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = poll.tick() => {
                while let Some((connection_id, payload)) = server.read_next_any() {
                    log::info!("{} -> {}", connection_id, payload);
                    server.write(connection_id, &payload);
                }
            }
        }
    }

    log::info!("Shutting down");
    shutdown.cancel();
    serving.await?;
    Ok(())
}

async fn run_client(
    settings: ClientSettings,
    host: IpAddr,
    port: u16,
    messages: &[String],
    wait: Duration,
) -> Result<()> {
    let client = TcpClient::new(settings)?;
    let connection_id = client.connect(host, port).await?;

    for message in messages {
        client.write(connection_id, message);
    }

    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline && client.has_connection(connection_id) {
        print_replies(&client, connection_id);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    print_replies(&client, connection_id);

    if client.disconnect(connection_id) {
        let linger = tokio::time::Instant::now() + wait;
        while client.has_connection(connection_id) && tokio::time::Instant::now() < linger {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    Ok(())
}

fn print_replies(client: &TcpClient, connection_id: Uuid) {
    while let Some(payload) = client.read_next(connection_id) {
        println!("{}", payload);
    }
}
