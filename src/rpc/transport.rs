//! Line-oriented TCP listener: every request and response is one JSON
//! document terminated by `\n`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

pub struct Transport {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, handler: MethodHandler) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
        }
    }

    /// Accept clients until `shutdown` fires, then wait for open connections
    /// to drop. Connections stop reading once shutdown is requested.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", self.bind_addr))?;
        info!(addr = %self.bind_addr, "RPC server listening");

        let connections = TaskTracker::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept RPC connection");
                        continue;
                    }
                },
            };

            let handler = self.handler.clone();
            let shutdown = shutdown.clone();
            connections.spawn(
                async move {
                    debug!("Client connected");
                    if let Err(e) = serve_connection(stream, &handler, shutdown).await {
                        debug!(error = %e, "Connection closed with error");
                    }
                }
                .instrument(info_span!("rpc_conn", %peer)),
            );
        }

        connections.close();
        connections.wait().await;
        info!("RPC server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: &MethodHandler,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
        };

        let Some(response) = answer(handler, line.trim()).await else {
            continue;
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }
}

/// Response for one received line; `None` for blank lines and notifications.
async fn answer(handler: &MethodHandler, line: &str) -> Option<Response> {
    if line.is_empty() {
        return None;
    }

    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Unparseable RPC request");
            return Some(Response::parse_error());
        }
    };

    if let Err(reason) = request.validate() {
        warn!(method = %request.method, reason, "Invalid RPC request");
        return Some(Response::invalid_request(
            request.id.unwrap_or(Value::Null),
        ));
    }

    if request.is_notification() {
        debug!(method = %request.method, "Notification, no response sent");
        handler.handle(request).await;
        return None;
    }

    debug!(method = %request.method, "RPC call");
    Some(handler.handle(request).await)
}
