use common::change::ColumnValue;
use common::err::{KResult, KashoError};

use crate::dsn::{split_url, Dsn};
use crate::timestamp::parse_timestamp;
use crate::{DdlType, Dialect};

pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn format_value(&self, column: &str, value: &ColumnValue) -> KResult<String> {
        match value {
            ColumnValue::Null => Ok("NULL".to_string()),
            ColumnValue::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
            ColumnValue::Int(i) => Ok(i.to_string()),
            ColumnValue::Float(f) => Ok(f.to_string()),
            ColumnValue::String(s) => Ok(quote_string(s)),
            ColumnValue::Timestamp(s) => {
                let parsed =
                    parse_timestamp(s).ok_or_else(|| KashoError::TimestampParse {
                        column: column.to_string(),
                        value: s.clone(),
                    })?;
                Ok(format!("'{}'", parsed.naive_utc.format("%Y-%m-%d %H:%M:%S")))
            }
        }
    }

    fn shape_dsn(&self, url: &str) -> KResult<Dsn> {
        split_url(url, 3306)
    }

    fn connection_string(&self, dsn: &Dsn) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            dsn.user, dsn.password, dsn.host, dsn.port, dsn.database
        )
    }

    fn session_setup(&self) -> Vec<&'static str> {
        vec!["SET FOREIGN_KEY_CHECKS = 0"]
    }

    fn resync_discovery_sql(&self) -> &'static str {
        "SELECT table_name, column_name, '' AS seq_name \
         FROM information_schema.columns \
         WHERE table_schema = DATABASE() \
           AND extra LIKE '%auto_increment%' \
           AND table_name NOT LIKE 'kasho\\_%'"
    }

    fn max_value_sql(&self, table: &str, column: &str) -> String {
        format!(
            "SELECT COALESCE(MAX({}), 0) FROM {}",
            self.quote_ident(column),
            self.quote_ident(table)
        )
    }

    fn resync_statement(&self, table: &str, _aux: &str, max: i64) -> String {
        format!("ALTER TABLE {} AUTO_INCREMENT = {}", self.quote_ident(table), max + 1)
    }

    fn type_name(&self, ty: &DdlType) -> String {
        match ty {
            DdlType::Uuid => "CHAR(36)".to_string(),
            DdlType::Text => "TEXT".to_string(),
            DdlType::Timestamp => "DATETIME(6)".to_string(),
            DdlType::Decimal(p, s) => format!("DECIMAL({},{})", p, s),
            DdlType::Integer => "INT".to_string(),
        }
    }

    fn list_user_tables_sql(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema NOT IN ('mysql', 'sys', 'performance_schema', 'information_schema') \
           AND table_name NOT LIKE 'kasho\\_%' \
           AND table_type = 'BASE TABLE'"
    }
}

fn quote_string(s: &str) -> String {
    // MySQL treats backslash as an escape inside string literals
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}
