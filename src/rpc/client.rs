//! Client side of the daemon's JSON-RPC interface, used by the CLI.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{Request, Response, RpcError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to daemon at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to daemon at {0}")]
    ConnectTimeout(SocketAddr),
    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode request: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("daemon closed the connection without answering")]
    NoResponse,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub struct RpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `method` and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: self.addr,
                    source,
                });
            }
            Err(_) => return Err(ClientError::ConnectTimeout(self.addr)),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::call(method, params, id);

        let mut request_json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        request_json.push('\n');
        stream.write_all(request_json.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line).await? == 0 {
            return Err(ClientError::NoResponse);
        }

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;
        let result = response.into_result()?;
        serde_json::from_value(result).map_err(ClientError::Parse)
    }

    /// Call `method` with serializable parameters.
    pub async fn call_with<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<T, ClientError> {
        let params = serde_json::to_value(params).map_err(ClientError::Serialize)?;
        self.call(method, Some(params)).await
    }

    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }
}
