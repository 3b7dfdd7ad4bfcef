//! Control-protocol client for the game process's topic endpoint.
//!
//! A request is one sanitized command line, prefixed with the session's
//! access token, sent over a fresh TCP connection to the process's
//! listening port; the response is a single line. One connect per request
//! keeps the client stateless across process restarts — the controller
//! serializes requests, so there is never more than one connection open.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::{AppError, Result};

/// Maximum line length accepted on either direction of the wire: 64 KiB.
///
/// Longer inbound lines fail the request with `AppError::Communication`
/// instead of allocating unbounded memory for a misbehaving process.
pub const MAX_LINE_BYTES: usize = 65_536;

/// Line codec for the control protocol and the event channel.
///
/// Delegates framing to [`LinesCodec`] with a fixed [`MAX_LINE_BYTES`]
/// limit. Each newline-terminated UTF-8 string is one complete message.
#[derive(Debug)]
pub struct TopicCodec(LinesCodec);

impl TopicCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for TopicCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TopicCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for TopicCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Communication(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

/// Check a command for the protocol's delimiter characters.
///
/// Callers are responsible for sanitizing user-supplied text before it
/// reaches this layer; this check is the last line of defense.
///
/// # Errors
///
/// Returns `AppError::Invalid` if the command is empty or contains a
/// newline or carriage return.
pub fn sanitize_command(command: &str) -> Result<&str> {
    if command.is_empty() {
        return Err(AppError::Invalid("command must not be empty".into()));
    }

    if command.contains('\n') || command.contains('\r') {
        return Err(AppError::Invalid(
            "command contains the protocol delimiter".into(),
        ));
    }

    Ok(command)
}

/// Client for the game process's topic endpoint.
#[derive(Debug, Clone)]
pub struct TopicClient {
    access_token: String,
    timeout: Duration,
}

impl TopicClient {
    /// Create a client stamping `access_token` onto every request.
    #[must_use]
    pub fn new(access_token: String, timeout: Duration) -> Self {
        Self {
            access_token,
            timeout,
        }
    }

    /// Send one command and return the single-line response.
    ///
    /// # Errors
    ///
    /// - `AppError::Invalid` — the command failed sanitization.
    /// - `AppError::Cancelled` — `cancel` fired before a response.
    /// - `AppError::Timeout` — no response within the deadline.
    /// - `AppError::Communication` — connect failure or closed stream.
    pub async fn send(&self, port: u16, command: &str, cancel: &CancellationToken) -> Result<String> {
        let command = sanitize_command(command)?;

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                Err(AppError::Cancelled(format!("command '{command}' cancelled")))
            }

            result = tokio::time::timeout(self.timeout, self.round_trip(port, command)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(AppError::Timeout(format!(
                        "no response to '{command}' within {:?}",
                        self.timeout
                    ))),
                }
            }
        }
    }

    async fn round_trip(&self, port: u16, command: &str) -> Result<String> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|err| {
                AppError::Communication(format!("cannot reach control endpoint on {port}: {err}"))
            })?;

        let mut framed = Framed::new(stream, TopicCodec::new());
        framed
            .send(format!("{} {command}", self.access_token))
            .await?;

        match framed.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => Err(err),
            None => Err(AppError::Communication(
                "control endpoint closed the connection without responding".into(),
            )),
        }
    }
}
