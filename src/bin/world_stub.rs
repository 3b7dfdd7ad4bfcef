#![forbid(unsafe_code)]

//! `world-stub` — minimal interop-compliant stand-in world process.
//!
//! Speaks both session channels the way a real game build does: connects
//! to the host's event listener to announce readiness and reboots, and
//! serves the topic endpoint for commands. Used by the integration tests
//! and for local development without a real game installation.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedWrite};

use world_warden::session::topic::TopicCodec;
use world_warden::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "world-stub", about = "Stand-in world process for testing", version)]
struct Cli {
    /// Interop version announced in the ready event.
    #[arg(long, default_value = "1.0")]
    api_version: String,

    /// Never announce readiness (simulates a build without interop).
    #[arg(long)]
    no_ready: bool,

    /// Exit immediately with this code (simulates a crash during load).
    #[arg(long)]
    exit_code: Option<i32>,

    /// Announce a reboot every N seconds; 0 disables the ticker.
    #[arg(long, default_value_t = 0)]
    reboot_every: u64,
}

type EventWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, TopicCodec>>>;

fn main() -> Result<()> {
    let args = Cli::parse();

    if let Some(code) = args.exit_code {
        std::process::exit(code);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let port = env_u16("WARDEN_PORT")?;
    let event_port = env_u16("WARDEN_EVENT_PORT")?;
    let token = std::env::var("WARDEN_ACCESS_TOKEN")
        .map_err(|_| AppError::Config("WARDEN_ACCESS_TOKEN not set".into()))?;

    let event_stream = TcpStream::connect((Ipv4Addr::LOCALHOST, event_port))
        .await
        .map_err(|err| AppError::Communication(format!("cannot reach event listener: {err}")))?;
    let (_, write_half) = event_stream.into_split();
    let events: EventWriter = Arc::new(Mutex::new(FramedWrite::new(write_half, TopicCodec::new())));

    if !args.no_ready {
        send_event(&events, format!("{token} ready api={}", args.api_version)).await?;
    }

    let reboot_state = Arc::new(Mutex::new(String::from("normal")));

    if args.reboot_every > 0 {
        let events = Arc::clone(&events);
        let reboot_state = Arc::clone(&reboot_state);
        let token = token.clone();
        let period = Duration::from_secs(args.reboot_every);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if send_event(&events, format!("{token} reboot")).await.is_err() {
                    std::process::exit(0);
                }
                // A pending shutdown/restart request is consumed by the
                // reboot: announce it, then exit instead of rebooting.
                if reboot_state.lock().await.as_str() != "normal" {
                    std::process::exit(0);
                }
            }
        });
    }

    serve_topic(port, &token, &reboot_state).await
}

/// Serve the topic endpoint: one token-prefixed command line per
/// connection, one response line back.
async fn serve_topic(
    initial_port: u16,
    token: &str,
    reboot_state: &Arc<Mutex<String>>,
) -> Result<()> {
    let mut listener = bind_topic(initial_port).await?;

    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let mut framed = Framed::new(stream, TopicCodec::new());

        let Some(Ok(line)) = framed.next().await else {
            continue;
        };

        let command = match line.split_once(' ') {
            Some((received_token, rest)) if received_token == token => rest.trim().to_owned(),
            _ => {
                framed.send("error bad token".to_owned()).await.ok();
                continue;
            }
        };

        let mut rebind_to = None;
        let reply = if command == "ping" {
            "pong".to_owned()
        } else if let Some(state) = command.strip_prefix("set-reboot-state ") {
            *reboot_state.lock().await = state.to_owned();
            "ok".to_owned()
        } else if let Some(raw_port) = command.strip_prefix("set-port ") {
            match raw_port.parse::<u16>() {
                Ok(new_port) if new_port > 0 => {
                    rebind_to = Some(new_port);
                    "ok".to_owned()
                }
                _ => "error bad port".to_owned(),
            }
        } else {
            "error unknown command".to_owned()
        };

        framed.send(reply).await.ok();
        drop(framed);

        if let Some(new_port) = rebind_to {
            listener = bind_topic(new_port).await?;
        }
    }
}

async fn bind_topic(port: u16) -> Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|err| AppError::Communication(format!("cannot bind topic port {port}: {err}")))
}

async fn send_event(events: &EventWriter, line: String) -> Result<()> {
    events.lock().await.send(line).await
}

fn env_u16(name: &str) -> Result<u16> {
    std::env::var(name)
        .map_err(|_| AppError::Config(format!("{name} not set")))?
        .parse()
        .map_err(|_| AppError::Config(format!("{name} is not a port")))
}
