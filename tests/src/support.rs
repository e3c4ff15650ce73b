use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use common::change::{Change, ColumnValue, DmlEvent, DmlKind, OldKeys};
use common::err::KResult;
use translicator::replica::{ReplicaWriter, WriteError};

/// Records every executed statement; query results are canned.
#[derive(Clone, Default)]
pub struct MockReplicaWriter {
    pub executed: Arc<Mutex<Vec<String>>>,
    /// rows returned for the resync discovery query
    pub discovery_rows: Vec<Vec<Option<String>>>,
    /// MAX(column) per table for the resync max queries
    pub max_values: HashMap<String, i64>,
    /// transient failures to inject before writes succeed again
    pub transient_failures: Arc<Mutex<u32>>,
}

impl MockReplicaWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed.lock().expect("mock lock").clone()
    }

    pub fn inject_transient_failures(&self, count: u32) {
        *self.transient_failures.lock().expect("mock lock") = count;
    }
}

#[async_trait]
impl ReplicaWriter for MockReplicaWriter {
    async fn execute(&mut self, sql: &str) -> Result<u64, WriteError> {
        {
            let mut failures = self.transient_failures.lock().expect("mock lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(WriteError::Transient("injected".into()));
            }
        }
        self.executed.lock().expect("mock lock").push(sql.to_string());
        Ok(1)
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>, WriteError> {
        if sql.contains("MAX(") {
            for (table, max) in &self.max_values {
                if sql.contains(table.as_str()) {
                    return Ok(vec![vec![Some(max.to_string())]]);
                }
            }
            return Ok(vec![vec![Some("0".to_string())]]);
        }
        Ok(self.discovery_rows.clone())
    }

    async fn close(&mut self) -> KResult<()> {
        Ok(())
    }
}

pub fn insert_change(position: &str, table: &str, id: i64, name: &str) -> Change {
    Change::dml(
        position,
        DmlEvent {
            table: table.into(),
            columnnames: vec!["id".into(), "name".into()],
            columnvalues: vec![ColumnValue::Int(id), ColumnValue::String(name.into())],
            kind: DmlKind::Insert,
            oldkeys: None,
        },
    )
}

pub fn update_change(position: &str, table: &str, id: i64, name: &str) -> Change {
    Change::dml(
        position,
        DmlEvent {
            table: table.into(),
            columnnames: vec!["id".into(), "name".into()],
            columnvalues: vec![ColumnValue::Int(id), ColumnValue::String(name.into())],
            kind: DmlKind::Update,
            oldkeys: Some(OldKeys {
                keynames: vec!["id".into()],
                keyvalues: vec![ColumnValue::Int(id)],
            }),
        },
    )
}
