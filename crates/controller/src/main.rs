mod sim;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::ControllerSim;

const READ_BUF: usize = 256;

/// Off the hub's default web port so both run side by side on one host.
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8081";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("sprinkler controller simulator listening on {addr}");

    serve(listener, Arc::new(Mutex::new(ControllerSim::new()))).await
}

/// Accept connections forever, one request per connection.
async fn serve(listener: TcpListener, sim: Arc<Mutex<ControllerSim>>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let sim = Arc::clone(&sim);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &sim).await {
                warn!(%peer, "connection error: {e}");
            }
        });
    }
}

/// Single read, single reply, then hang up.
async fn handle_connection(mut stream: TcpStream, sim: &Mutex<ControllerSim>) -> Result<()> {
    let mut buf = [0u8; READ_BUF];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let msg = String::from_utf8_lossy(&buf[..n]);
    let reply = sim.lock().await.handle(&msg, Instant::now());
    debug!(request = msg.trim(), %reply, "handled");

    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
