//! Postgres logical replication via the wal2json output plugin,
//! format-version 2: every row change arrives as its own JSON message
//! with its own LSN, so buffer scores stay strictly increasing. Inserts
//! into the `kasho_ddl_log` trigger table are folded into DDL changes;
//! everything else maps I/U/D -> insert/update/delete.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use common::change::{Change, ColumnValue, DdlEvent, DmlEvent, DmlKind, OldKeys};
use common::err::{KResult, KashoError};
use common::position::{format_lsn, parse_lsn};
use common::{DDL_LOG_TABLE, KASHO_PREFIX};
use dialect::{Dialect, Dsn, PostgresDialect};

use super::pg_wire::{CopyFrame, PgWireConnection};
use super::ReplicationDriver;

pub struct PostgresReplicationDriver {
    dsn: Dsn,
    slot: String,
    conn: Option<PgWireConnection>,
    current_lsn: u64,
    flushed_lsn: u64,
    /// set when the sender asked for an immediate status update
    reply_pending: bool,
}

impl PostgresReplicationDriver {
    pub fn new(primary_url: &str, slot: &str) -> KResult<Self> {
        let dsn = PostgresDialect.shape_dsn(primary_url)?;
        Ok(PostgresReplicationDriver {
            dsn,
            slot: slot.to_string(),
            conn: None,
            current_lsn: 0,
            flushed_lsn: 0,
            reply_pending: false,
        })
    }

    async fn control_connect(&self) -> KResult<PgWireConnection> {
        PgWireConnection::connect(&self.dsn, true).await
    }

    async fn slot_exists(&self, conn: &mut PgWireConnection) -> KResult<bool> {
        let rows = conn
            .simple_query(&format!(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = '{}'",
                self.slot.replace('\'', "''")
            ))
            .await?;
        Ok(!rows.is_empty())
    }

    fn conn(&mut self) -> KResult<&mut PgWireConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| KashoError::Connection("replication stream not started".into()))
    }

    fn decode_payload(&mut self, start: u64, payload: &[u8]) -> KResult<Vec<Change>> {
        let msg: Wal2JsonMessage = serde_json::from_slice(payload)
            .map_err(|e| KashoError::Protocol(format!("wal2json payload: {}", e)))?;
        let position = format_lsn(start);
        self.current_lsn = self.current_lsn.max(start);

        let table = msg.table.clone().unwrap_or_default();
        match msg.action.as_str() {
            "B" | "C" | "M" => Ok(vec![]),
            "I" if table == DDL_LOG_TABLE => {
                Ok(vec![Change::ddl(position, ddl_from_log_row(&msg)?)])
            }
            "I" | "U" | "D" if table.starts_with(KASHO_PREFIX) => {
                debug!(%table, "dropping change on reserved-prefix table");
                Ok(vec![])
            }
            "I" => Ok(vec![Change::dml(position, msg.into_dml(DmlKind::Insert)?)]),
            "U" => Ok(vec![Change::dml(position, msg.into_dml(DmlKind::Update)?)]),
            "D" => Ok(vec![Change::dml(position, msg.into_dml(DmlKind::Delete)?)]),
            "T" => {
                // truncate arrives without SQL; forward a synthesized one
                let ddl = DdlEvent {
                    id: 0,
                    time: String::new(),
                    username: String::new(),
                    database: self.dsn.database.clone(),
                    ddl: format!("TRUNCATE TABLE {}", PostgresDialect.quote_ident(&table)),
                };
                Ok(vec![Change::ddl(position, ddl)])
            }
            other => Err(KashoError::Protocol(format!(
                "unknown wal2json action {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl ReplicationDriver for PostgresReplicationDriver {
    async fn probe(&mut self) -> KResult<bool> {
        let mut conn = self.control_connect().await?;
        self.slot_exists(&mut conn).await
    }

    async fn start(&mut self, start: &str) -> KResult<()> {
        let mut conn = self.control_connect().await?;

        if !self.slot_exists(&mut conn).await? {
            // slot creation deferred to bootstrap time so WAL does not
            // pile up while services are idle
            let rows = conn
                .simple_query(&format!(
                    "CREATE_REPLICATION_SLOT {} LOGICAL wal2json",
                    self.slot
                ))
                .await?;
            let consistent_point = rows
                .first()
                .and_then(|r| r.get(1).cloned().flatten())
                .unwrap_or_default();
            info!(slot = %self.slot, %consistent_point, "replication slot created");
        }

        if let Some(write_position) = conn.identify_system().await? {
            debug!(%write_position, "primary wal position");
        }

        // an explicit start wins; otherwise the slot's confirmed
        // position (restart recovery) via 0/0
        let lsn = if start.is_empty() {
            "0/0".to_string()
        } else {
            parse_lsn(start)
                .ok_or_else(|| KashoError::InvalidPosition(start.to_string()))?;
            start.to_string()
        };

        conn.start_replication(
            &self.slot,
            &lsn,
            &[("format-version", "2"), ("include-transaction", "false")],
        )
        .await?;
        self.conn = Some(conn);
        info!(slot = %self.slot, from = %lsn, "logical replication started");
        Ok(())
    }

    async fn next_changes(&mut self) -> KResult<Vec<Change>> {
        if self.reply_pending {
            let flushed = self.flushed_lsn;
            self.conn()?.standby_status_update(flushed).await?;
            self.reply_pending = false;
        }
        let frame = self.conn()?.read_copy_frame().await?;
        match frame {
            CopyFrame::XLogData { start, payload } => self.decode_payload(start, &payload),
            CopyFrame::Keepalive { end, must_reply } => {
                self.current_lsn = self.current_lsn.max(end);
                if must_reply {
                    self.reply_pending = true;
                }
                Ok(vec![])
            }
        }
    }

    async fn ack(&mut self, position: &str) -> KResult<()> {
        let lsn = parse_lsn(position)
            .ok_or_else(|| KashoError::InvalidPosition(position.to_string()))?;
        if lsn > self.flushed_lsn {
            self.flushed_lsn = lsn;
            self.conn()?.standby_status_update(lsn).await?;
        }
        Ok(())
    }

    fn current_position(&self) -> String {
        if self.current_lsn == 0 {
            String::new()
        } else {
            format_lsn(self.current_lsn)
        }
    }
}

#[derive(Debug, Deserialize)]
struct Wal2JsonMessage {
    action: String,
    #[allow(dead_code)]
    schema: Option<String>,
    table: Option<String>,
    columns: Option<Vec<Wal2JsonColumn>>,
    identity: Option<Vec<Wal2JsonColumn>>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(rename = "type")]
    ty: Option<String>,
    value: Option<serde_json::Value>,
}

impl Wal2JsonMessage {
    fn into_dml(self, kind: DmlKind) -> KResult<DmlEvent> {
        let table = self.table.unwrap_or_default();
        let (columnnames, columnvalues) = split_columns(self.columns.unwrap_or_default());
        let oldkeys = match kind {
            DmlKind::Insert => None,
            DmlKind::Update | DmlKind::Delete => {
                let identity = self.identity.ok_or_else(|| {
                    KashoError::Protocol(format!(
                        "wal2json {:?} without identity for {}; REPLICA IDENTITY missing?",
                        kind, table
                    ))
                })?;
                let (keynames, keyvalues) = split_columns(identity);
                Some(OldKeys { keynames, keyvalues })
            }
        };
        // deletes replicate the key image only
        let event = if kind == DmlKind::Delete {
            DmlEvent {
                table,
                columnnames: Vec::new(),
                columnvalues: Vec::new(),
                kind,
                oldkeys,
            }
        } else {
            DmlEvent {
                table,
                columnnames,
                columnvalues,
                kind,
                oldkeys,
            }
        };
        Ok(event)
    }
}

fn split_columns(columns: Vec<Wal2JsonColumn>) -> (Vec<String>, Vec<ColumnValue>) {
    let mut names = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len());
    for col in columns {
        values.push(typed_value(col.value, col.ty.as_deref()));
        names.push(col.name);
    }
    (names, values)
}

/// JSON scalar -> column value, with the declared column type promoting
/// strings to timestamps.
fn typed_value(value: Option<serde_json::Value>, ty: Option<&str>) -> ColumnValue {
    let value = match value {
        None | Some(serde_json::Value::Null) => return ColumnValue::Null,
        Some(v) => v,
    };
    match value {
        serde_json::Value::Bool(b) => ColumnValue::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ColumnValue::Int(i)
            } else {
                ColumnValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => {
            let is_temporal = ty
                .map(|t| t.contains("timestamp") || t == "date")
                .unwrap_or(false);
            if is_temporal {
                ColumnValue::Timestamp(s)
            } else {
                ColumnValue::String(s)
            }
        }
        other => {
            // arrays/objects (json columns) are forwarded as their JSON text
            warn!("non-scalar wal2json value, forwarding as text");
            ColumnValue::String(other.to_string())
        }
    }
}

/// An insert into the trigger log carries the DDL event fields as
/// columns.
fn ddl_from_log_row(msg: &Wal2JsonMessage) -> KResult<DdlEvent> {
    let mut event = DdlEvent {
        id: 0,
        time: String::new(),
        username: String::new(),
        database: String::new(),
        ddl: String::new(),
    };
    for col in msg.columns.as_deref().unwrap_or_default() {
        let value = typed_value(col.value.clone(), col.ty.as_deref());
        match col.name.as_str() {
            "id" => {
                if let ColumnValue::Int(i) = value {
                    event.id = i;
                }
            }
            "time" => event.time = value.as_text(),
            "username" => event.username = value.as_text(),
            "database" => event.database = value.as_text(),
            "ddl" => event.ddl = value.as_text(),
            other => {
                debug!(column = other, "ignoring unknown trigger-log column");
            }
        }
    }
    if event.ddl.is_empty() {
        return Err(KashoError::Protocol(
            "trigger-log row without ddl column".into(),
        ));
    }
    Ok(event)
}
