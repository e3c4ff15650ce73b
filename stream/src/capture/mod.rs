//! Replication drivers. One trait, two implementations: logical
//! replication with the wal2json plugin for Postgres, the binlog
//! protocol via mysql_async for MySQL. The capture loop in
//! `service` owns exactly one driver and never shares it.

mod mysql;
mod pg_wire;
mod postgres;

pub use mysql::MySqlReplicationDriver;
pub use pg_wire::{CopyFrame, PgWireConnection};
pub use postgres::PostgresReplicationDriver;

use async_trait::async_trait;

use common::change::Change;
use common::err::KResult;

#[async_trait]
pub trait ReplicationDriver: Send {
    /// Whether the replication source (slot / binlog) is reachable and
    /// provisioned. Drives the WAITING probe; opens no stream.
    async fn probe(&mut self) -> KResult<bool>;

    /// Provision the slot if needed and open the stream. An empty
    /// `start` resumes from the source's own confirmed position.
    async fn start(&mut self, start: &str) -> KResult<()>;

    /// Block for the next decoded changes, in primary order. Keepalives
    /// and transaction markers yield an empty batch.
    async fn next_changes(&mut self) -> KResult<Vec<Change>>;

    /// Confirm durability up to and including `position`; nothing may be
    /// confirmed before the corresponding change is in the buffer.
    async fn ack(&mut self, position: &str) -> KResult<()>;

    /// Most recent position observed on the source.
    fn current_position(&self) -> String;
}
