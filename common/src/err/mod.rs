use std::io;

use thiserror::Error;

pub type KResult<T> = Result<T, KashoError>;

/// Workspace-wide error type. Variants mirror the pipeline's failure
/// policy: transient kinds are retried with backoff, everything else
/// surfaces to the operator.
#[derive(Debug, Error)]
pub enum KashoError {
    /// Connection drop or timeout against primary, replica or buffer
    /// store. Retried; state and checkpoint are preserved.
    #[error("transient io: {0}")]
    TransientIo(String),

    /// RPC invoked while the state machine is in the wrong state. No
    /// transition happens.
    #[error("wrong state: expected {expected}, currently {actual}")]
    WrongState { expected: String, actual: String },

    /// Dump parser hit an unknown statement type or a malformed line.
    /// Fatal to the bootstrap job.
    #[error("parse error: {0}")]
    Parse(String),

    /// Position string does not match any recognized syntax. The buffer
    /// rejects the write.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("ddl apply failed at {position}: {cause}; sql: {sql}")]
    ApplyDdl {
        sql: String,
        position: String,
        cause: String,
    },

    #[error("dml apply failed on {table} at {position}: {cause}")]
    ApplyDml {
        table: String,
        position: String,
        cause: String,
    },

    #[error("transform rule {rule} failed on column {column}: {cause}")]
    Transform {
        rule: String,
        column: String,
        cause: String,
    },

    #[error("unparseable timestamp in column {column}: {value:?}")]
    TimestampParse { column: String, value: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("config error: {0}")]
    Config(String),

    /// Malformed frame or unexpected message on the wire (RPC or
    /// replication protocol).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("buffer error: {0}")]
    Buffer(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KashoError {
    /// Whether the retry-with-backoff policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KashoError::TransientIo(_) | KashoError::Connection(_) | KashoError::Io(_)
        )
    }

    pub fn wrong_state(expected: &str, actual: impl ToString) -> Self {
        KashoError::WrongState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
