//! The apply loop: read the durable checkpoint, catch up with ordered
//! range scans, tail the wakeup subscription, and keep the checkpoint
//! flowing forward. One task, one replica session, strict score order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use buffer::{ChangeSource, StateStore};
use common::cancel::CancelToken;
use common::change::{Change, ChangeData, DmlEvent, DmlKind};
use common::config::RetryConfig;
use common::err::{KResult, KashoError};
use common::position::{self, is_bootstrap};
use common::retry::Backoff;
use dialect::Dialect;

use crate::render::render_dml;
use crate::replica::{ReplicaWriter, WriteError};
use crate::transform::TransformEngine;

#[derive(Debug, Clone)]
pub struct ApplierOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Downgrade transform-layer failures to skip-with-warning. Apply
    /// failures stay fatal regardless.
    pub skip_transform_errors: bool,
    pub retry: RetryConfig,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        ApplierOptions {
            batch_size: 256,
            flush_interval: Duration::from_secs(5),
            skip_transform_errors: false,
            retry: RetryConfig::default(),
        }
    }
}

pub struct Translicator<Src, St, W>
where
    Src: ChangeSource,
    St: StateStore,
    W: ReplicaWriter,
{
    source: Src,
    state: St,
    writer: W,
    dialect: Arc<dyn Dialect>,
    transforms: TransformEngine,
    options: ApplierOptions,
    checkpoint: Option<String>,
    dirty: bool,
    resynced: bool,
    last_was_bootstrap: bool,
    applied: u64,
}

impl<Src, St, W> Translicator<Src, St, W>
where
    Src: ChangeSource,
    St: StateStore,
    W: ReplicaWriter,
{
    pub fn new(
        source: Src,
        state: St,
        writer: W,
        dialect: Arc<dyn Dialect>,
        transforms: TransformEngine,
        options: ApplierOptions,
    ) -> Self {
        Translicator {
            source,
            state,
            writer,
            dialect,
            transforms,
            options,
            checkpoint: None,
            dirty: false,
            resynced: false,
            last_was_bootstrap: false,
            applied: 0,
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    /// Load the durable checkpoint; the resumption point after any
    /// restart.
    pub async fn init(&mut self) -> KResult<()> {
        self.checkpoint = self.state.load_checkpoint().await?;
        self.last_was_bootstrap = self
            .checkpoint
            .as_deref()
            .map(is_bootstrap)
            .unwrap_or(false);
        info!(checkpoint = ?self.checkpoint, "translicator starting");
        Ok(())
    }

    /// Run until cancelled. Cancellation flushes the checkpoint before
    /// returning.
    pub async fn run(&mut self, mut cancel: CancelToken) -> KResult<()> {
        self.init().await?;

        let mut wakeup = self.source.subscribe().await?;
        let mut flush = tokio::time::interval(self.options.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if let Err(e) = self.drain(&mut cancel).await {
                break Err(e);
            }
            if cancel.is_cancelled() {
                break Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = wakeup.next() => {}
                _ = flush.tick() => {
                    if let Err(e) = self.flush_checkpoint().await {
                        break Err(e);
                    }
                }
            }
        };

        // best effort on the way out; an earlier error still wins
        let flushed = self.flush_checkpoint().await;
        let closed = self.writer.close().await;
        result.and(flushed).and(closed)
    }

    /// Apply a single batch pass; used by tests and by `run`.
    pub async fn drain(&mut self, cancel: &mut CancelToken) -> KResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let from = self.checkpoint.clone().unwrap_or_default();
            let batch = self
                .source
                .range_after(&from, self.options.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }
            for payload in batch {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let change = Change::from_json(&payload)?;
                self.apply_change(&change, cancel).await?;
                self.checkpoint = Some(change.position.clone());
                self.dirty = true;
                self.applied += 1;
            }
        }
    }

    async fn apply_change(&mut self, change: &Change, cancel: &mut CancelToken) -> KResult<()> {
        let bootstrap = is_bootstrap(&change.position);
        if self.last_was_bootstrap && !bootstrap && !self.resynced {
            self.resync(cancel).await?;
        }

        match &change.data {
            ChangeData::Ddl(event) => {
                debug!(position = %change.position, "applying ddl");
                self.execute_with_retry(&event.ddl, cancel)
                    .await
                    .map_err(|e| KashoError::ApplyDdl {
                        sql: event.ddl.clone(),
                        position: change.position.clone(),
                        cause: e.to_string(),
                    })?;
            }
            ChangeData::Dml(event) => {
                if !self.apply_dml(event, &change.position, cancel).await? {
                    // row skipped by the transform policy
                    self.last_was_bootstrap = bootstrap;
                    return Ok(());
                }
            }
        }
        self.last_was_bootstrap = bootstrap;
        Ok(())
    }

    /// `Ok(false)` when the row was skipped under the transform policy.
    async fn apply_dml(
        &mut self,
        event: &DmlEvent,
        position: &str,
        cancel: &mut CancelToken,
    ) -> KResult<bool> {
        let mut event = event.clone();
        let transformed = self.transforms.apply(
            &event.table,
            &event.columnnames,
            &mut event.columnvalues,
        );
        if let Err(e) = transformed {
            if self.options.skip_transform_errors && matches!(e, KashoError::Transform { .. }) {
                warn!(position, table = %event.table, "skipping row after transform failure: {}", e);
                return Ok(false);
            }
            return Err(e);
        }

        let sql = render_dml(self.dialect.as_ref(), &event).map_err(|e| match e {
            KashoError::ApplyDml { table, cause, .. } => KashoError::ApplyDml {
                table,
                position: position.to_string(),
                cause,
            },
            other => other,
        })?;

        let affected = self
            .execute_with_retry(&sql, cancel)
            .await
            .map_err(|e| KashoError::ApplyDml {
                table: event.table.clone(),
                position: position.to_string(),
                cause: e.to_string(),
            })?;
        if affected == 0 && event.kind != DmlKind::Insert {
            warn!(position, table = %event.table, "dml matched no replica rows");
        }
        Ok(true)
    }

    async fn execute_with_retry(
        &mut self,
        sql: &str,
        cancel: &mut CancelToken,
    ) -> Result<u64, WriteError> {
        let mut backoff = Backoff::new(&self.options.retry);
        loop {
            match self.writer.execute(sql).await {
                Ok(affected) => return Ok(affected),
                Err(WriteError::Transient(cause)) => {
                    warn!("replica write failed, retrying: {}", cause);
                    if !backoff.sleep_or_give_up(cancel).await {
                        return Err(WriteError::Transient(cause));
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// Sequence / auto-increment alignment, once per run, at the
    /// boundary between the last bootstrap event and the first live one.
    async fn resync(&mut self, cancel: &mut CancelToken) -> KResult<()> {
        info!("bootstrap drained; aligning sequences with inserted maxima");
        let rows = self
            .writer
            .query_rows(self.dialect.resync_discovery_sql())
            .await
            .map_err(|e| KashoError::TransientIo(format!("resync discovery: {}", e)))?;

        for row in rows {
            let (table, column, aux) = match (row.first(), row.get(1), row.get(2)) {
                (Some(Some(t)), Some(Some(c)), Some(aux)) => {
                    (t.clone(), c.clone(), aux.clone().unwrap_or_default())
                }
                _ => continue,
            };
            let max_rows = self
                .writer
                .query_rows(&self.dialect.max_value_sql(&table, &column))
                .await
                .map_err(|e| KashoError::TransientIo(format!("resync max: {}", e)))?;
            let max = max_rows
                .first()
                .and_then(|r| r.first())
                .and_then(|c| c.as_deref())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let statement = self.dialect.resync_statement(&table, &aux, max);
            debug!(%table, %column, max, "resync");
            self.execute_with_retry(&statement, cancel)
                .await
                .map_err(|e| KashoError::ApplyDdl {
                    sql: statement.clone(),
                    position: String::new(),
                    cause: e.to_string(),
                })?;
        }
        self.resynced = true;
        Ok(())
    }

    pub async fn flush_checkpoint(&mut self) -> KResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(checkpoint) = self.checkpoint.clone() {
            // the durable checkpoint never regresses
            if let Some(durable) = self.state.load_checkpoint().await? {
                if position::score(&durable)? >= position::score(&checkpoint)? {
                    self.dirty = false;
                    return Ok(());
                }
            }
            self.state.save_checkpoint(&checkpoint).await?;
            let trimmed = self.source.trim_below(&checkpoint).await?;
            if trimmed > 0 {
                debug!(trimmed, %checkpoint, "evicted applied buffer entries");
            }
            self.dirty = false;
            debug!(%checkpoint, "checkpoint flushed");
        }
        Ok(())
    }
}
