use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tracing::debug;

use common::change::Change;
use common::config::BufferConfig;
use common::err::{KResult, KashoError};
use common::position;

use crate::{ChangeSink, ChangeSource, PayloadStream};

/// Well-known key names derived from the configured namespace.
#[derive(Debug, Clone)]
pub struct BufferKeys {
    pub changes: String,
    pub channel: String,
    pub state: String,
    pub checkpoint: String,
}

impl BufferKeys {
    pub fn new(namespace: &str) -> Self {
        BufferKeys {
            changes: format!("{}:changes", namespace),
            channel: format!("{}:changes:chan", namespace),
            state: format!("{}:state", namespace),
            checkpoint: format!("{}:checkpoint", namespace),
        }
    }
}

/// Redis-backed ordered buffer. Clones share the multiplexed connection;
/// each clone belongs to one task.
#[derive(Clone)]
pub struct ChangeBuffer {
    client: redis::Client,
    con: redis::aio::MultiplexedConnection,
    keys: BufferKeys,
    ttl_secs: i64,
}

impl ChangeBuffer {
    pub async fn connect(url: &str, cfg: &BufferConfig) -> KResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| KashoError::Buffer(format!("{}: {}", url, e)))?;
        let con = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer connect: {}", e)))?;
        Ok(ChangeBuffer {
            client,
            con,
            keys: BufferKeys::new(&cfg.namespace),
            ttl_secs: cfg.ttl_secs as i64,
        })
    }

    pub fn keys(&self) -> &BufferKeys {
        &self.keys
    }

    pub fn state_store(&self) -> crate::RedisStateStore {
        crate::RedisStateStore::new(self.con.clone(), self.keys.clone())
    }

    /// Insert + TTL refresh + publish, in one atomic round trip.
    pub async fn add(&mut self, change: &Change) -> KResult<f64> {
        let score = position::score(&change.position)?;
        let payload = change.to_json()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&self.keys.changes, &payload, score)
            .ignore()
            .expire(&self.keys.changes, self.ttl_secs)
            .ignore()
            .publish(&self.keys.channel, &payload)
            .ignore();
        let _: () = pipe
            .query_async(&mut self.con)
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer add: {}", e)))?;

        debug!(position = %change.position, score, "buffered change");
        Ok(score)
    }

    /// Entries strictly above the given position, ascending by score.
    pub async fn entries_after(&mut self, pos: &str, limit: usize) -> KResult<Vec<String>> {
        let min = if pos.is_empty() {
            "-inf".to_string()
        } else {
            format!("({}", position::score(pos)?)
        };
        let entries: Vec<String> = self
            .con
            .zrangebyscore_limit(&self.keys.changes, min, "+inf", 0, limit as isize)
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer range: {}", e)))?;
        Ok(entries)
    }

    /// Drop entries with score strictly below the given position's.
    /// Called by the applier once a checkpoint is durably flushed.
    pub async fn trim_below(&mut self, pos: &str) -> KResult<usize> {
        if pos.is_empty() {
            return Ok(0);
        }
        let max = format!("({}", position::score(pos)?);
        let removed: usize = self
            .con
            .zrembyscore(&self.keys.changes, "-inf", max)
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer trim: {}", e)))?;
        Ok(removed)
    }

    pub async fn len(&mut self) -> KResult<usize> {
        let n: usize = self
            .con
            .zcard(&self.keys.changes)
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer len: {}", e)))?;
        Ok(n)
    }

    /// Payloads published on the wakeup channel from now on.
    pub async fn subscribe_channel(&self, channel: &str) -> KResult<PayloadStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer subscribe: {}", e)))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| KashoError::TransientIo(format!("buffer subscribe: {}", e)))?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }

    /// Releases the underlying connections.
    pub fn close(self) {
        drop(self);
    }
}

#[async_trait]
impl ChangeSink for ChangeBuffer {
    async fn publish(&mut self, change: &Change) -> KResult<f64> {
        self.add(change).await
    }
}

#[async_trait]
impl ChangeSource for ChangeBuffer {
    async fn range_after(&mut self, position: &str, limit: usize) -> KResult<Vec<String>> {
        self.entries_after(position, limit).await
    }

    async fn subscribe(&mut self) -> KResult<PayloadStream> {
        let channel = self.keys.channel.clone();
        self.subscribe_channel(&channel).await
    }

    async fn trim_below(&mut self, position: &str) -> KResult<usize> {
        ChangeBuffer::trim_below(self, position).await
    }
}
