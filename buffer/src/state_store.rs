use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use common::err::{KResult, KashoError};

/// The three phases of the capture service. Names are part of the RPC
/// surface and never rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamPhase {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "ACCUMULATING")]
    Accumulating,
    #[serde(rename = "STREAMING")]
    Streaming,
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamPhase::Waiting => "WAITING",
            StreamPhase::Accumulating => "ACCUMULATING",
            StreamPhase::Streaming => "STREAMING",
        };
        f.write_str(s)
    }
}

/// Persisted state record; updated only on transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub state: StreamPhase,
    pub start_position: String,
}

impl StreamState {
    pub fn initial() -> Self {
        StreamState {
            state: StreamPhase::Waiting,
            start_position: String::new(),
        }
    }
}

/// Durable storage for the state record and the applier checkpoint,
/// colocated with the change buffer.
#[async_trait]
pub trait StateStore: Send {
    async fn load_state(&mut self) -> KResult<Option<StreamState>>;

    async fn save_state(&mut self, state: &StreamState) -> KResult<()>;

    async fn load_checkpoint(&mut self) -> KResult<Option<String>>;

    async fn save_checkpoint(&mut self, position: &str) -> KResult<()>;
}

pub struct RedisStateStore {
    con: redis::aio::MultiplexedConnection,
    keys: crate::BufferKeys,
}

impl RedisStateStore {
    pub fn new(con: redis::aio::MultiplexedConnection, keys: crate::BufferKeys) -> Self {
        RedisStateStore { con, keys }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load_state(&mut self) -> KResult<Option<StreamState>> {
        let raw: Option<String> = self
            .con
            .get(&self.keys.state)
            .await
            .map_err(|e| KashoError::TransientIo(format!("state load: {}", e)))?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    async fn save_state(&mut self, state: &StreamState) -> KResult<()> {
        let raw = serde_json::to_string(state)?;
        let _: () = self
            .con
            .set(&self.keys.state, raw)
            .await
            .map_err(|e| KashoError::TransientIo(format!("state save: {}", e)))?;
        Ok(())
    }

    async fn load_checkpoint(&mut self) -> KResult<Option<String>> {
        let raw: Option<String> = self
            .con
            .get(&self.keys.checkpoint)
            .await
            .map_err(|e| KashoError::TransientIo(format!("checkpoint load: {}", e)))?;
        Ok(raw.filter(|s| !s.is_empty()))
    }

    async fn save_checkpoint(&mut self, position: &str) -> KResult<()> {
        let _: () = self
            .con
            .set(&self.keys.checkpoint, position)
            .await
            .map_err(|e| KashoError::TransientIo(format!("checkpoint save: {}", e)))?;
        Ok(())
    }
}
