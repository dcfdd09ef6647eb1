//! JSON-lines RPC adapter
//!
//! Each line is one `{"id", "method", "params"}` envelope; each reply is one
//! `{"id", "result"}` or `{"id", "error": {"kind", "message"}}` line. The
//! adapter does no authentication.

use crate::context::NodeContext;
use crate::protocol::handle_rpc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

/// Longest accepted line; shards travel hex-encoded
pub const MAX_LINE_LENGTH: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ShardLeaseError> for RpcError {
    fn from(err: &ShardLeaseError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcReply {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, err: &ShardLeaseError) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.into()),
        }
    }

    /// The result, or the remote error as `(kind, message)`
    pub fn into_result(self) -> std::result::Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Answer one request line
pub async fn handle_line(ctx: &NodeContext, line: &str) -> RpcReply {
    let envelope: RpcEnvelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = ShardLeaseError::Format(format!("invalid envelope: {e}"));
            return RpcReply::err(Value::Null, &err);
        }
    };

    match handle_rpc(ctx, &envelope.method, envelope.params).await {
        Ok(result) => RpcReply::ok(envelope.id, result),
        Err(e) => RpcReply::err(envelope.id, &e),
    }
}

pub struct RpcServer {
    ctx: Arc<NodeContext>,
    listener: TcpListener,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, ctx: Arc<NodeContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "RPC server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                debug!(%peer, "Connection opened");
                handle_connection(ctx, stream).await;
                debug!(%peer, "Connection closed");
            });
        }
    }
}

async fn handle_connection(ctx: Arc<NodeContext>, stream: TcpStream) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Dropping connection after bad frame");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = handle_line(&ctx, &line).await;
        let encoded = match serde_json::to_string(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "Failed to encode reply");
                break;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            warn!(error = %e, "Failed to send reply");
            break;
        }
    }
}

/// Minimal client for the JSON-lines adapter
pub struct RpcClient {
    framed: Framed<TcpStream, LinesCodec>,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            next_id: 0,
        })
    }

    /// Send one request and wait for its reply
    pub async fn call(&mut self, method: &str, params: Value) -> Result<RpcReply> {
        self.next_id += 1;
        let envelope = RpcEnvelope {
            id: Value::from(self.next_id),
            method: method.to_string(),
            params,
        };
        self.framed
            .send(serde_json::to_string(&envelope)?)
            .await
            .map_err(|e| ShardLeaseError::Internal(format!("send failed: {e}")))?;

        match self.framed.next().await {
            Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
            Some(Err(e)) => Err(ShardLeaseError::Internal(format!("receive failed: {e}"))),
            None => Err(ShardLeaseError::Internal("connection closed".to_string())),
        }
    }
}
