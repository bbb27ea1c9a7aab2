//! TCP link to the remote sprinkler controller.
//!
//! Every request opens a fresh connection, writes the whole message, reads
//! until the controller hangs up (or goes quiet) and returns the trimmed
//! reply.  Transport failures are retried a fixed number of times with a
//! fixed pause; a reply that does not parse is surfaced at once.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::protocol::{ActuatorState, Request};

/// Total attempts per request, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Pause between attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the controller may stay silent before we stop reading.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 2048;

// ---------------------------------------------------------------------------
// Actuator seam
// ---------------------------------------------------------------------------

/// Anything that can carry one request to the controller and return the
/// state it reports back.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn send(&self, request: Request) -> Result<ActuatorState, LinkError>;
}

// ---------------------------------------------------------------------------
// TCP implementation
// ---------------------------------------------------------------------------

pub struct TcpLink {
    addr: String,
    retry_delay: Duration,
}

impl TcpLink {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a raw protocol message and return the trimmed reply.
    pub async fn send_raw(&self, message: &str) -> Result<String, LinkError> {
        with_retry(&self.addr, self.retry_delay, || exchange(&self.addr, message)).await
    }
}

#[async_trait]
impl Actuator for TcpLink {
    async fn send(&self, request: Request) -> Result<ActuatorState, LinkError> {
        let message = request.encode();
        let reply = self.send_raw(&message).await?;
        debug!(%request, %reply, "controller replied");
        ActuatorState::parse(&reply)
    }
}

/// Run `op` up to [`MAX_ATTEMPTS`] times, sleeping `delay` between failed
/// attempts.  The last failure is returned, never swallowed.
pub(crate) async fn with_retry<T, F, Fut>(
    addr: &str,
    delay: Duration,
    mut op: F,
) -> Result<T, LinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    %addr,
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    "controller exchange failed: {e}, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(LinkError::Transient {
                    addr: addr.to_string(),
                    attempts: attempt,
                    source: e,
                })
            }
        }
    }
}

/// One connect/write/read/close round-trip.
async fn exchange(addr: &str, message: &str) -> io::Result<String> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    stream.write_all(message.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match timeout(READ_IDLE_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
            // Some firmware keeps the socket open after replying.
            Err(_) if !buf.is_empty() => break,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no reply from controller",
                ))
            }
        }
    }

    let reply = String::from_utf8_lossy(&buf).trim().to_string();
    if reply.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "controller closed the connection without replying",
        ));
    }
    Ok(reply)
}

// ===========================================================================
// Tests
// ===========================================================================
