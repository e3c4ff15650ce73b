//! Bootstrap path: stream a native dump file (plain `pg_dump` or
//! `mysqldump` output) into the same change events the live stream
//! produces, on synthetic positions that sort strictly before any real
//! replication position. Bootstrap is a one-shot batch; unknown
//! statement types fail loudly rather than corrupt silently.

mod converter;
mod mysql_dump;
mod pg_dump;
mod table_name;
mod value_infer;

pub use converter::{BootstrapConverter, BootstrapPositionGen, ConversionReport};
pub use mysql_dump::MySqlDumpParser;
pub use pg_dump::PgDumpParser;
pub use table_name::ddl_object_name;
pub use value_infer::infer_value;

use common::change::ColumnValue;

/// One unit produced by a dump parser: a DDL statement to forward
/// verbatim, or a single decoded row.
#[derive(Debug, Clone, PartialEq)]
pub enum DumpEvent {
    Ddl {
        /// Normalized object name when one could be extracted; logging
        /// only — the SQL itself is the payload.
        object: Option<String>,
        sql: String,
    },
    Row {
        table: String,
        columns: Vec<String>,
        values: Vec<ColumnValue>,
    },
}
