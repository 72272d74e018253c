//! MI Session Bridge
//!
//! Serves a GDB/MI debug session to a host process (an IDE front end)
//! as line-delimited JSON-RPC 2.0 over stdin/stdout.
//!
//! Usage:
//!   ```json
//!   {"jsonrpc":"2.0","id":1,"method":"session/start","params":{"elf_file":"/work/build/top.elf"}}
//!   {"jsonrpc":"2.0","id":2,"method":"break/insert","params":{"file":"/work/src/top.vhd","line":42}}
//!   {"jsonrpc":"2.0","id":3,"method":"exec/run"}
//!   ```
//!
//! Session events arrive as `session/event` notifications, stop locations
//! as `editor/navigate`.

use anyhow::Result;
use mi_session::bridge::BridgeServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr; stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting MI session bridge v{}", env!("CARGO_PKG_VERSION"));

    let (outbound, mut outgoing) = mpsc::unbounded_channel::<String>();
    let server = Arc::new(BridgeServer::new(outbound.clone()));

    // Single writer so responses and notifications never interleave
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = outgoing.recv().await {
            debug!("Sending: {}", line);
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("MI session bridge ready, listening on stdin");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error reading from stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        // Requests run concurrently so `exec/pause` can reach a session
        // that is blocked in another command
        let server = Arc::clone(&server);
        let outbound = outbound.clone();
        tokio::spawn(async move {
            if let Some(response) = server.handle_line(&line).await {
                let _ = outbound.send(response);
            }
        });
    }

    info!("MI session bridge shutting down");
    let _ = server.handle_line(r#"{"jsonrpc":"2.0","method":"session/stop"}"#).await;

    // Session threads may still hold senders; flush what is queued
    drop(server);
    drop(outbound);
    match tokio::time::timeout(Duration::from_secs(1), writer).await {
        Ok(joined) => {
            if let Err(e) = joined? {
                error!("Error writing to stdout: {}", e);
            }
        }
        Err(_) => debug!("Writer still busy at exit"),
    }
    Ok(())
}
