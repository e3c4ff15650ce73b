//! MySQL binlog capture over mysql_async. Row events carry no column
//! names unless the server is told to log full metadata, so names and
//! key columns come from an information_schema cache that every captured
//! DDL invalidates.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use mysql_async::binlog::EventType;
use mysql_async::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, Value};
use tracing::{debug, info, warn};

use common::change::{Change, ColumnValue, DdlEvent, DmlEvent, DmlKind, OldKeys};
use common::err::{KResult, KashoError};
use common::position::parse_binlog;
use common::KASHO_PREFIX;

use super::ReplicationDriver;

#[derive(Debug, Clone)]
struct TableSchema {
    columns: Vec<String>,
    key_columns: Vec<String>,
}

pub struct MySqlReplicationDriver {
    url: String,
    server_id: u32,
    stream: Option<BinlogStream>,
    /// separate connection for schema lookups
    control: Option<Conn>,
    schema_cache: HashMap<(String, String), TableSchema>,
    current_file: String,
    current_pos: u64,
    ddl_seq: i64,
}

impl MySqlReplicationDriver {
    pub fn new(primary_url: &str, server_id: u32) -> Self {
        MySqlReplicationDriver {
            url: primary_url.to_string(),
            server_id,
            stream: None,
            control: None,
            schema_cache: HashMap::new(),
            current_file: String::new(),
            current_pos: 4,
            ddl_seq: 0,
        }
    }

    async fn control(&mut self) -> KResult<&mut Conn> {
        if self.control.is_none() {
            let opts = Opts::from_url(&self.url)
                .map_err(|e| KashoError::Config(format!("{}: {}", self.url, e)))?;
            let conn = Conn::new(opts)
                .await
                .map_err(|e| KashoError::Connection(format!("mysql control: {}", e)))?;
            self.control = Some(conn);
        }
        match self.control.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(KashoError::Connection("mysql control connection unavailable".into())),
        }
    }

    async fn master_position(&mut self) -> KResult<(String, u64)> {
        let conn = self.control().await?;
        let row: Option<mysql_async::Row> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| KashoError::TransientIo(format!("SHOW MASTER STATUS: {}", e)))?;
        let row = row.ok_or_else(|| {
            KashoError::Connection("binary logging is not enabled on the primary".into())
        })?;
        let file: Option<String> = row.get(0);
        let pos: Option<u64> = row.get(1);
        match (file, pos) {
            (Some(file), Some(pos)) => Ok((file, pos)),
            _ => Err(KashoError::Protocol("malformed SHOW MASTER STATUS row".into())),
        }
    }

    async fn table_schema(&mut self, database: &str, table: &str) -> KResult<TableSchema> {
        let key = (database.to_string(), table.to_string());
        if let Some(schema) = self.schema_cache.get(&key) {
            return Ok(schema.clone());
        }
        let conn = self.control().await?;
        let rows: Vec<(String, String)> = conn
            .exec(
                "SELECT column_name, column_key FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                (database, table),
            )
            .await
            .map_err(|e| KashoError::TransientIo(format!("schema lookup: {}", e)))?;
        if rows.is_empty() {
            return Err(KashoError::Protocol(format!(
                "no schema for {}.{} on the primary",
                database, table
            )));
        }
        let schema = TableSchema {
            columns: rows.iter().map(|(name, _)| name.clone()).collect(),
            key_columns: rows
                .iter()
                .filter(|(_, key)| key == "PRI")
                .map(|(name, _)| name.clone())
                .collect(),
        };
        self.schema_cache.insert(key, schema.clone());
        Ok(schema)
    }

    fn position_string(&self) -> String {
        format!("{}:{}", self.current_file, self.current_pos)
    }

    async fn rows_to_changes(
        &mut self,
        tme: &TableMapEvent<'static>,
        rows: Vec<(Option<BinlogRow>, Option<BinlogRow>)>,
        kind: DmlKind,
    ) -> KResult<Vec<Change>> {
        let database = tme.database_name().to_string();
        let table = tme.table_name().to_string();
        if table.starts_with(KASHO_PREFIX) {
            debug!(%table, "dropping change on reserved-prefix table");
            return Ok(vec![]);
        }
        let schema = self.table_schema(&database, &table).await?;
        let position = self.position_string();

        let mut changes = Vec::with_capacity(rows.len());
        for (before, after) in rows {
            let event = match kind {
                DmlKind::Insert => {
                    let after = after.ok_or_else(|| {
                        KashoError::Protocol("write rows event without after-image".into())
                    })?;
                    DmlEvent {
                        table: table.clone(),
                        columnnames: schema.columns.clone(),
                        columnvalues: row_values(&after),
                        kind: DmlKind::Insert,
                        oldkeys: None,
                    }
                }
                DmlKind::Update => {
                    let before = before.ok_or_else(|| {
                        KashoError::Protocol("update rows event without before-image".into())
                    })?;
                    let after = after.ok_or_else(|| {
                        KashoError::Protocol("update rows event without after-image".into())
                    })?;
                    DmlEvent {
                        table: table.clone(),
                        columnnames: schema.columns.clone(),
                        columnvalues: row_values(&after),
                        kind: DmlKind::Update,
                        oldkeys: Some(old_keys(&schema, &row_values(&before))),
                    }
                }
                DmlKind::Delete => {
                    let before = before.ok_or_else(|| {
                        KashoError::Protocol("delete rows event without before-image".into())
                    })?;
                    DmlEvent {
                        table: table.clone(),
                        columnnames: Vec::new(),
                        columnvalues: Vec::new(),
                        kind: DmlKind::Delete,
                        oldkeys: Some(old_keys(&schema, &row_values(&before))),
                    }
                }
            };
            changes.push(Change::dml(position.clone(), event));
        }
        Ok(changes)
    }
}

/// Key-column subset of a full row image.
fn old_keys(schema: &TableSchema, row: &[ColumnValue]) -> OldKeys {
    let mut keynames = Vec::new();
    let mut keyvalues = Vec::new();
    for (idx, name) in schema.columns.iter().enumerate() {
        if schema.key_columns.contains(name) {
            keynames.push(name.clone());
            keyvalues.push(row.get(idx).cloned().unwrap_or(ColumnValue::Null));
        }
    }
    if keynames.is_empty() {
        // no primary key; fall back to the full before-image
        OldKeys {
            keynames: schema.columns.clone(),
            keyvalues: row.to_vec(),
        }
    } else {
        OldKeys { keynames, keyvalues }
    }
}

fn row_values(row: &BinlogRow) -> Vec<ColumnValue> {
    (0..row.len())
        .map(|idx| match row.as_ref(idx) {
            Some(BinlogValue::Value(value)) => native_value(value),
            Some(other) => {
                // JSON columns arrive as jsonb diffs; forward as text
                warn!("non-scalar binlog value, forwarding as text");
                ColumnValue::String(format!("{:?}", other))
            }
            None => ColumnValue::Null,
        })
        .collect()
}

fn native_value(value: &Value) -> ColumnValue {
    match value {
        Value::NULL => ColumnValue::Null,
        Value::Int(i) => ColumnValue::Int(*i),
        Value::UInt(u) => {
            if *u <= i64::MAX as u64 {
                ColumnValue::Int(*u as i64)
            } else {
                ColumnValue::String(u.to_string())
            }
        }
        Value::Float(f) => ColumnValue::Float(*f as f64),
        Value::Double(d) => ColumnValue::Float(*d),
        Value::Bytes(bytes) => ColumnValue::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::Date(y, m, d, hh, mm, ss, _us) => ColumnValue::Timestamp(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            y, m, d, hh, mm, ss
        )),
        Value::Time(neg, days, hours, minutes, seconds, _us) => {
            let sign = if *neg { "-" } else { "" };
            ColumnValue::String(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                (*days as u32) * 24 + *hours as u32,
                minutes,
                seconds
            ))
        }
    }
}

/// Transaction control and other non-DDL statements that query events
/// carry but the pipeline must not forward.
fn is_skippable_query(query: &str) -> bool {
    let upper = query.trim_start().to_uppercase();
    upper.starts_with("BEGIN")
        || upper.starts_with("COMMIT")
        || upper.starts_with("ROLLBACK")
        || upper.starts_with("SAVEPOINT")
        || upper.starts_with("SET ")
        || upper.starts_with("FLUSH ")
        || upper.starts_with("GRANT ")
        || upper.starts_with("ANALYZE ")
}

#[async_trait]
impl ReplicationDriver for MySqlReplicationDriver {
    async fn probe(&mut self) -> KResult<bool> {
        match self.master_position().await {
            Ok(_) => Ok(true),
            Err(KashoError::Connection(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start(&mut self, start: &str) -> KResult<()> {
        let (file, pos) = if start.is_empty() {
            self.master_position().await?
        } else {
            let (_filenum, offset) = parse_binlog(start)
                .ok_or_else(|| KashoError::InvalidPosition(start.to_string()))?;
            let file = start
                .rsplit_once(':')
                .map(|(f, _)| f.to_string())
                .unwrap_or_default();
            (file, offset as u64)
        };

        let opts = Opts::from_url(&self.url)
            .map_err(|e| KashoError::Config(format!("{}: {}", self.url, e)))?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| KashoError::Connection(format!("mysql primary: {}", e)))?;
        let stream = conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.server_id)
                    .with_filename(file.as_bytes())
                    .with_pos(pos),
            )
            .await
            .map_err(|e| KashoError::Connection(format!("binlog stream: {}", e)))?;

        self.current_file = file;
        self.current_pos = pos;
        self.stream = Some(stream);
        info!(file = %self.current_file, pos = self.current_pos, server_id = self.server_id,
            "binlog replication started");
        Ok(())
    }

    async fn next_changes(&mut self) -> KResult<Vec<Change>> {
        let event = {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| KashoError::Connection("binlog stream not started".into()))?;
            match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(KashoError::TransientIo(format!("binlog read: {}", e)))
                }
                None => return Err(KashoError::TransientIo("binlog stream closed".into())),
            }
        };

        let event_type = event
            .header()
            .event_type()
            .map_err(|e| KashoError::Protocol(format!("unknown binlog event type: {:?}", e)))?;
        if event.header().log_pos() > 0 {
            self.current_pos = event.header().log_pos() as u64;
        }

        match event_type {
            EventType::ROTATE_EVENT => {
                if let Some(EventData::RotateEvent(rotate)) = event
                    .read_data()
                    .map_err(|e| KashoError::Protocol(format!("rotate event: {}", e)))?
                {
                    self.current_file = rotate.name().to_string();
                    self.current_pos = rotate.position();
                    debug!(file = %self.current_file, "binlog rotated");
                }
                Ok(vec![])
            }
            EventType::QUERY_EVENT => {
                let query = match event
                    .read_data()
                    .map_err(|e| KashoError::Protocol(format!("query event: {}", e)))?
                {
                    Some(EventData::QueryEvent(qe)) => qe.query().into_owned(),
                    _ => return Ok(vec![]),
                };
                if is_skippable_query(&query) {
                    return Ok(vec![]);
                }
                if let Some(object) = bootstrap_ddl_object(&query) {
                    if object.starts_with(KASHO_PREFIX) {
                        return Ok(vec![]);
                    }
                }
                // captured DDL invalidates every cached schema
                self.schema_cache.clear();
                self.ddl_seq += 1;
                let change = Change::ddl(
                    self.position_string(),
                    DdlEvent {
                        id: self.ddl_seq,
                        time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                        username: String::new(),
                        database: String::new(),
                        ddl: query,
                    },
                );
                Ok(vec![change])
            }
            EventType::WRITE_ROWS_EVENT
            | EventType::UPDATE_ROWS_EVENT
            | EventType::DELETE_ROWS_EVENT
            | EventType::WRITE_ROWS_EVENT_V1
            | EventType::UPDATE_ROWS_EVENT_V1
            | EventType::DELETE_ROWS_EVENT_V1 => {
                let data = event
                    .read_data()
                    .map_err(|e| KashoError::Protocol(format!("rows event: {}", e)))?;
                let rows_data = match data {
                    Some(EventData::RowsEvent(rows_data)) => rows_data,
                    _ => return Ok(vec![]),
                };
                let tme = self
                    .stream
                    .as_ref()
                    .and_then(|stream| stream.get_tme(rows_data.table_id()))
                    .ok_or_else(|| {
                        KashoError::Protocol("rows event without table map event".into())
                    })?
                    .clone()
                    .into_owned();

                let kind = match &rows_data {
                    RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                        DmlKind::Insert
                    }
                    RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                        DmlKind::Update
                    }
                    RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                        DmlKind::Delete
                    }
                    _ => return Ok(vec![]),
                };

                let mut rows = Vec::new();
                for row in rows_data.rows(&tme) {
                    let (before, after) = row.map_err(|e| {
                        KashoError::Protocol(format!("binlog row decode: {}", e))
                    })?;
                    rows.push((before, after));
                }
                self.rows_to_changes(&tme, rows, kind).await
            }
            _ => Ok(vec![]),
        }
    }

    async fn ack(&mut self, _position: &str) -> KResult<()> {
        // the binlog protocol has no consumer acknowledgement; durability
        // gating happens in the capture loop ordering alone
        Ok(())
    }

    fn current_position(&self) -> String {
        if self.current_file.is_empty() {
            String::new()
        } else {
            self.position_string()
        }
    }
}

/// First object name in a DDL statement, for the reserved-prefix check.
fn bootstrap_ddl_object(query: &str) -> Option<String> {
    let mut words = query.split_whitespace();
    let verb = words.next()?.to_uppercase();
    if !matches!(verb.as_str(), "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME") {
        return None;
    }
    query
        .split_whitespace()
        .map(|w| w.trim_matches(|c| c == '`' || c == '(' || c == ';'))
        .find(|w| w.starts_with(KASHO_PREFIX))
        .map(|w| w.to_string())
}
