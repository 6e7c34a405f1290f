//! JSON-RPC 2.0 over TCP, one newline-delimited JSON message per line.
//!
//! - `protocol`: request/response types
//! - `transport`: listener and per-connection framing
//! - `methods`: dispatch onto the [`Orchestrator`]
//! - `client`: used by the CLI to reach the daemon

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    pub fn new(orchestrator: Orchestrator, bind_addr: SocketAddr) -> Self {
        let handler = MethodHandler::new(orchestrator);
        Self {
            transport: Transport::new(bind_addr, handler),
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}
