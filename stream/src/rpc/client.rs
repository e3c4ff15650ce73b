use tokio::io::BufStream;
use tokio::net::TcpStream;

use common::change::Change;
use common::err::{KResult, KashoError};

use crate::rpc::{read_frame, write_frame, Request, Response, StatusReply, TransitionReply};

/// Blocking-style client for the operator surface; the bootstrap
/// scripts, the CLI and the applier all go through this.
pub struct RpcClient {
    stream: BufStream<TcpStream>,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> KResult<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| KashoError::Connection(format!("rpc {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        Ok(RpcClient {
            stream: BufStream::new(tcp),
        })
    }

    pub async fn start_bootstrap(&mut self, start_position: &str) -> KResult<TransitionReply> {
        self.call(&Request::StartBootstrap {
            start_position: start_position.to_string(),
        })
        .await?
        .into_transition()
    }

    pub async fn complete_bootstrap(&mut self) -> KResult<TransitionReply> {
        self.call(&Request::CompleteBootstrap).await?.into_transition()
    }

    pub async fn reset(&mut self) -> KResult<TransitionReply> {
        self.call(&Request::Reset).await?.into_transition()
    }

    pub async fn status(&mut self) -> KResult<StatusReply> {
        match self.call(&Request::GetStatus).await? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Switch the connection into streaming mode; afterwards only
    /// [`ChangeStream::next_change`] is meaningful.
    pub async fn stream_changes(mut self, from_position: &str) -> KResult<ChangeStream> {
        write_frame(
            &mut self.stream,
            &Request::StreamChanges {
                from_position: from_position.to_string(),
            },
        )
        .await?;
        Ok(ChangeStream {
            stream: self.stream,
        })
    }

    async fn call(&mut self, request: &Request) -> KResult<Response> {
        write_frame(&mut self.stream, request).await?;
        match read_frame(&mut self.stream).await? {
            Some(response) => Ok(response),
            None => Err(KashoError::TransientIo("rpc connection closed".into())),
        }
    }
}

/// Lazy sequence of changes; finite only when the server goes away or
/// the client drops it.
pub struct ChangeStream {
    stream: BufStream<TcpStream>,
}

impl ChangeStream {
    pub async fn next_change(&mut self) -> KResult<Option<Change>> {
        match read_frame(&mut self.stream).await? {
            None => Ok(None),
            Some(Response::Change { change }) => Ok(Some(change)),
            Some(Response::Error { error, message }) => Err(remote_error(&error, message)),
            Some(other) => Err(unexpected(other)),
        }
    }
}

impl Response {
    fn into_transition(self) -> KResult<TransitionReply> {
        match self {
            Response::Transition(reply) => Ok(reply),
            Response::Error { error, message } => Err(remote_error(&error, message)),
            other => Err(unexpected(other)),
        }
    }
}

fn remote_error(kind: &str, message: String) -> KashoError {
    match kind {
        "wrong_state" => KashoError::Protocol(message),
        "invalid_position" => KashoError::InvalidPosition(message),
        "transient_io" => KashoError::TransientIo(message),
        _ => KashoError::Protocol(message),
    }
}

fn unexpected(response: Response) -> KashoError {
    KashoError::Protocol(format!("unexpected rpc response: {:?}", response))
}
