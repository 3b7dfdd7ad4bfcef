//! Host-side event listener the game process reports to.
//!
//! The controller binds a TCP listener; the process connects out and
//! sends token-authenticated event lines. The listener parses each line
//! into a [`SessionEvent`] and forwards it through an mpsc channel to the
//! controller's event pump. Malformed lines are logged and skipped — they
//! never terminate the listener.

use std::net::Ipv4Addr;

use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::topic::TopicCodec;
use crate::{AppError, Result};

/// An event announced by the game process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The process finished loading its world. `api_version` is present
    /// when the build embeds the host interop layer.
    Ready {
        /// Interop version reported by the build, e.g. `1.4`.
        api_version: Option<String>,
    },
    /// The world rebooted internally. Recurring.
    Reboot,
    /// The process is about to exit intentionally.
    TerminationRequested,
    /// A custom chat command extracted from protocol traffic.
    CustomCommand(String),
}

/// Parse one event line of the form `{token} {event}`.
///
/// # Return value
///
/// - `Ok(Some(event))` — recognized, authenticated event.
/// - `Ok(None)` — empty line or unknown event name (skipped, `DEBUG` log).
/// - `Err(AppError::Communication)` — missing or wrong access token.
pub fn parse_event_line(access_token: &str, line: &str) -> Result<Option<SessionEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let (token, event) = trimmed
        .split_once(' ')
        .map_or((trimmed, ""), |(token, rest)| (token, rest.trim()));

    if token != access_token {
        return Err(AppError::Communication(
            "event line carried an invalid access token".into(),
        ));
    }

    match event {
        "reboot" => Ok(Some(SessionEvent::Reboot)),
        "terminate" => Ok(Some(SessionEvent::TerminationRequested)),
        "ready" => Ok(Some(SessionEvent::Ready { api_version: None })),
        _ => {
            if let Some(version) = event.strip_prefix("ready api=") {
                return Ok(Some(SessionEvent::Ready {
                    api_version: Some(version.to_owned()),
                }));
            }
            if let Some(command) = event.strip_prefix("custom ") {
                return Ok(Some(SessionEvent::CustomCommand(command.to_owned())));
            }

            debug!(event, "skipping unknown session event");
            Ok(None)
        }
    }
}

/// Listener bound to the session's event port.
#[derive(Debug)]
pub struct EventListener {
    port: u16,
}

impl EventListener {
    /// Bind the listener and start the accept loop.
    ///
    /// Pass port `0` to bind an ephemeral port (fresh launch) or the
    /// persisted port when reattaching. Parsed events are forwarded to
    /// `event_tx`; the loop runs until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Communication` if the port cannot be bound.
    pub async fn bind(
        port: u16,
        access_token: String,
        event_tx: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|err| {
                AppError::Communication(format!("cannot bind event port {port}: {err}"))
            })?;
        let bound_port = listener
            .local_addr()
            .map_err(|err| AppError::Communication(format!("event port unavailable: {err}")))?
            .port();

        tokio::spawn(accept_loop(listener, access_token, event_tx, cancel));

        Ok(Self { port: bound_port })
    }

    /// Port the listener is bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Accept connections from the game process until cancelled.
async fn accept_loop(
    listener: TcpListener,
    access_token: String,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("event listener shutting down");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "game process connected to event listener");
                        tokio::spawn(connection_loop(
                            stream,
                            access_token.clone(),
                            event_tx.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(err) => {
                        warn!(%err, "event listener accept failed");
                    }
                }
            }
        }
    }
}

/// Read event lines from one connection until EOF or cancellation.
async fn connection_loop(
    stream: tokio::net::TcpStream,
    access_token: String,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut framed = FramedRead::new(stream, TopicCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = framed.next() => {
                match item {
                    None => {
                        debug!("event connection closed");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "event connection framing error, dropping connection");
                        break;
                    }
                    Some(Ok(line)) => match parse_event_line(&access_token, &line) {
                        Ok(Some(event)) => {
                            if event_tx.send(event).await.is_err() {
                                debug!("event channel closed, dropping connection");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(%err, "rejected event line");
                        }
                    },
                }
            }
        }
    }
}
