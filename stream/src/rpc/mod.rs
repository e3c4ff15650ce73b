//! Framed-JSON RPC. Every frame is a 4-byte big-endian length followed
//! by a JSON body; `StreamChanges` answers with an unbounded sequence of
//! change frames on the same connection. Field and state names here are
//! part of the operator surface and must not rename between versions.

mod client;
mod server;

pub use client::RpcClient;
pub use server::RpcServer;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use common::change::Change;
use common::err::{KResult, KashoError};

/// Upper bound on a single frame; a change larger than this is a bug.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StartBootstrap { start_position: String },
    CompleteBootstrap,
    GetStatus,
    StreamChanges { from_position: String },
    /// Operator recovery: back to WAITING from any state.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Transition(TransitionReply),
    Status(StatusReply),
    Change { change: Change },
    Error { error: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionReply {
    pub prev: String,
    pub curr: String,
    pub ready_to_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub state: String,
    pub start_position: String,
    pub current_position: String,
    pub accumulated_count: u64,
    pub connected_clients: u32,
    pub uptime_seconds: u64,
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> KResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(KashoError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean close before the next frame.
pub async fn read_frame<R, T>(reader: &mut R) -> KResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(KashoError::Protocol(format!("oversized frame: {} bytes", len)));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

impl Response {
    pub fn error(err: &KashoError) -> Self {
        let kind = match err {
            KashoError::WrongState { .. } => "wrong_state",
            KashoError::InvalidPosition(_) => "invalid_position",
            KashoError::TransientIo(_) | KashoError::Connection(_) => "transient_io",
            _ => "internal",
        };
        Response::Error {
            error: kind.to_string(),
            message: err.to_string(),
        }
    }
}
