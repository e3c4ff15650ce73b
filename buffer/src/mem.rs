//! In-memory buffer with the same contract as the Redis one. Backs unit
//! and scenario tests so no store is required.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use common::change::Change;
use common::err::KResult;
use common::position;

use crate::{ChangeSink, ChangeSource, PayloadStream, StateStore, StreamState};

#[derive(Default)]
struct Inner {
    // (score, payload), kept sorted by score
    entries: Vec<(f64, String)>,
}

#[derive(Clone)]
pub struct MemoryBuffer {
    inner: Arc<Mutex<Inner>>,
    wakeup: broadcast::Sender<String>,
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBuffer {
    pub fn new() -> Self {
        let (wakeup, _) = broadcast::channel(1024);
        MemoryBuffer {
            inner: Arc::new(Mutex::new(Inner::default())),
            wakeup,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn payloads(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub async fn changes(&self) -> Vec<Change> {
        self.payloads()
            .await
            .iter()
            .map(|p| Change::from_json(p).expect("stored payload parses"))
            .collect()
    }
}

#[async_trait]
impl ChangeSink for MemoryBuffer {
    async fn publish(&mut self, change: &Change) -> KResult<f64> {
        let score = position::score(&change.position)?;
        let payload = change.to_json()?;
        {
            let mut inner = self.inner.lock().await;
            let at = inner
                .entries
                .partition_point(|(s, _)| *s <= score);
            inner.entries.insert(at, (score, payload.clone()));
        }
        let _ = self.wakeup.send(payload);
        Ok(score)
    }
}

#[async_trait]
impl ChangeSource for MemoryBuffer {
    async fn range_after(&mut self, pos: &str, limit: usize) -> KResult<Vec<String>> {
        let min = if pos.is_empty() {
            f64::NEG_INFINITY
        } else {
            position::score(pos)?
        };
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|(s, _)| *s > min)
            .take(limit)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn subscribe(&mut self) -> KResult<PayloadStream> {
        let rx = self.wakeup.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }
}

/// State record + checkpoint held in memory.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<Option<StreamState>>>,
    checkpoint: Arc<Mutex<Option<String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_state(&mut self) -> KResult<Option<StreamState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save_state(&mut self, state: &StreamState) -> KResult<()> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }

    async fn load_checkpoint(&mut self) -> KResult<Option<String>> {
        Ok(self.checkpoint.lock().await.clone().filter(|s| !s.is_empty()))
    }

    async fn save_checkpoint(&mut self, position: &str) -> KResult<()> {
        *self.checkpoint.lock().await = Some(position.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use common::change::{ChangeData, ColumnValue, DmlEvent, DmlKind};

    use super::*;

    fn change_at(pos: &str, id: i64) -> Change {
        Change::dml(
            pos,
            DmlEvent {
                table: "t".into(),
                columnnames: vec!["id".into()],
                columnvalues: vec![ColumnValue::Int(id)],
                kind: DmlKind::Insert,
                oldkeys: None,
            },
        )
    }

    #[tokio::test]
    async fn range_after_is_strict_and_ordered() {
        let mut buf = MemoryBuffer::new();
        for (pos, id) in [("0/20", 2), ("0/10", 1), ("0/30", 3)] {
            buf.publish(&change_at(pos, id)).await.unwrap();
        }
        let entries = buf.range_after("0/10", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        let first = Change::from_json(&entries[0]).unwrap();
        assert_eq!(first.position, "0/20");

        let capped = buf.range_after("", 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn subscribe_sees_later_publishes() {
        let mut buf = MemoryBuffer::new();
        let mut sub = buf.subscribe().await.unwrap();
        buf.publish(&change_at("0/10", 1)).await.unwrap();
        let payload = tokio_stream::StreamExt::next(&mut sub).await.unwrap();
        let change = Change::from_json(&payload).unwrap();
        assert!(matches!(change.data, ChangeData::Dml(_)));
    }

    #[tokio::test]
    async fn invalid_position_rejected() {
        let mut buf = MemoryBuffer::new();
        let err = buf.publish(&change_at("garbage", 1)).await.unwrap_err();
        assert!(matches!(err, common::err::KashoError::InvalidPosition(_)));
    }
}
