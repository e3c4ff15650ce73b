use serde::{Deserialize, Serialize};

/// One cell of a replicated row.
///
/// Serializes as the bare JSON scalar (null for `Null`); the variant tag
/// never reaches the wire. `Timestamp` carries its source rendering as a
/// string and is only distinguished from `String` at creation time (by
/// column type on capture, by the typing heuristic on bootstrap); readers
/// of the wire format see both as JSON strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Plain-text rendering used by the transform engine (template
    /// substitution, hash seeding). No SQL quoting.
    pub fn as_text(&self) -> String {
        match self {
            ColumnValue::Null => String::new(),
            ColumnValue::Bool(b) => b.to_string(),
            ColumnValue::Int(i) => i.to_string(),
            ColumnValue::Float(f) => f.to_string(),
            ColumnValue::String(s) | ColumnValue::Timestamp(s) => s.clone(),
        }
    }
}

/// `Timestamp` and `String` compare equal on content: the distinction is
/// an application-side hint, not part of the wire format.
impl PartialEq for ColumnValue {
    fn eq(&self, other: &Self) -> bool {
        use ColumnValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (String(a) | Timestamp(a), String(b) | Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(s: &str) -> Self {
        ColumnValue::String(s.to_string())
    }
}

impl From<i64> for ColumnValue {
    fn from(i: i64) -> Self {
        ColumnValue::Int(i)
    }
}
