//! Dialect-neutral representation of one captured change and its wire
//! format. Buffer values are the JSON serialization of
//! `{type, position, data}`; DML data keeps the wal2json field names
//! (`columnnames`, `columnvalues`, `oldkeys`).

mod column_value;

pub use column_value::ColumnValue;

use serde::{Deserialize, Serialize};

use crate::err::KResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

/// Primary-key pre-image carried by updates and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldKeys {
    pub keynames: Vec<String>,
    pub keyvalues: Vec<ColumnValue>,
}

/// One row-level change. `columnnames` and `columnvalues` are
/// index-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmlEvent {
    pub table: String,
    pub columnnames: Vec<String>,
    pub columnvalues: Vec<ColumnValue>,
    pub kind: DmlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldkeys: Option<OldKeys>,
}

/// One schema-level change, captured from the primary-side trigger log
/// (Postgres) or binlog query events (MySQL). The SQL is forwarded
/// verbatim; the applier never rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlEvent {
    pub id: i64,
    pub time: String,
    pub username: String,
    pub database: String,
    pub ddl: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ChangeData {
    Ddl(DdlEvent),
    Dml(DmlEvent),
}

/// `{type, position, data}` — the unit stored in the ordered buffer and
/// streamed over the RPC surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub position: String,
    #[serde(flatten)]
    pub data: ChangeData,
}

impl Change {
    pub fn dml(position: impl Into<String>, event: DmlEvent) -> Self {
        Change {
            position: position.into(),
            data: ChangeData::Dml(event),
        }
    }

    pub fn ddl(position: impl Into<String>, event: DdlEvent) -> Self {
        Change {
            position: position.into(),
            data: ChangeData::Ddl(event),
        }
    }

    pub fn to_json(&self) -> KResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> KResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn is_dml(&self) -> bool {
        matches!(self.data, ChangeData::Dml(_))
    }
}

impl DmlEvent {
    /// Model invariants: aligned name/value lengths, `oldkeys` present
    /// iff the kind is update or delete.
    pub fn validate(&self) -> bool {
        if self.columnnames.len() != self.columnvalues.len() {
            return false;
        }
        match self.kind {
            DmlKind::Insert => self.oldkeys.is_none(),
            DmlKind::Update | DmlKind::Delete => match &self.oldkeys {
                Some(keys) => keys.keynames.len() == keys.keyvalues.len(),
                None => false,
            },
        }
    }
}
