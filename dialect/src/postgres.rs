use common::change::ColumnValue;
use common::err::{KResult, KashoError};

use crate::dsn::{split_url, Dsn};
use crate::timestamp::parse_timestamp;
use crate::{DdlType, Dialect};

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn format_value(&self, column: &str, value: &ColumnValue) -> KResult<String> {
        match value {
            ColumnValue::Null => Ok("NULL".to_string()),
            ColumnValue::Bool(b) => Ok(if *b { "true" } else { "false" }.to_string()),
            ColumnValue::Int(i) => Ok(i.to_string()),
            ColumnValue::Float(f) => Ok(f.to_string()),
            ColumnValue::String(s) => Ok(quote_string(s)),
            ColumnValue::Timestamp(s) => {
                let parsed =
                    parse_timestamp(s).ok_or_else(|| KashoError::TimestampParse {
                        column: column.to_string(),
                        value: s.clone(),
                    })?;
                // RFC3339 sources keep their T separator
                let sep = if parsed.had_t_separator { "T" } else { " " };
                Ok(format!(
                    "'{}'",
                    parsed.naive_utc.format(&format!("%Y-%m-%d{}%H:%M:%S", sep))
                ))
            }
        }
    }

    fn shape_dsn(&self, url: &str) -> KResult<Dsn> {
        split_url(url, 5432)
    }

    fn connection_string(&self, dsn: &Dsn) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            dsn.host, dsn.port, dsn.user, dsn.password, dsn.database
        )
    }

    fn session_setup(&self) -> Vec<&'static str> {
        vec!["SET session_replication_role = 'replica'"]
    }

    fn resync_discovery_sql(&self) -> &'static str {
        // every serial/identity counter owned by a user-table column
        "SELECT t.relname AS table_name, a.attname AS column_name, s.relname AS seq_name \
         FROM pg_class s \
         JOIN pg_depend d ON d.objid = s.oid AND d.deptype IN ('a', 'i') \
         JOIN pg_class t ON d.refobjid = t.oid \
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid \
         JOIN pg_namespace n ON n.oid = t.relnamespace \
         WHERE s.relkind = 'S' \
           AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
           AND t.relname NOT LIKE 'kasho\\_%'"
    }

    fn max_value_sql(&self, table: &str, column: &str) -> String {
        format!(
            "SELECT COALESCE(MAX({}), 0) FROM {}",
            self.quote_ident(column),
            self.quote_ident(table)
        )
    }

    fn resync_statement(&self, _table: &str, aux: &str, max: i64) -> String {
        format!("SELECT setval('{}', {}, false)", quote_string_inner(aux), max + 1)
    }

    fn type_name(&self, ty: &DdlType) -> String {
        match ty {
            DdlType::Uuid => "UUID".to_string(),
            DdlType::Text => "TEXT".to_string(),
            DdlType::Timestamp => "TIMESTAMP WITH TIME ZONE".to_string(),
            DdlType::Decimal(p, s) => format!("DECIMAL({},{})", p, s),
            DdlType::Integer => "INTEGER".to_string(),
        }
    }

    fn list_user_tables_sql(&self) -> &'static str {
        "SELECT tablename FROM pg_tables \
         WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
           AND tablename NOT LIKE 'kasho\\_%'"
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote_string_inner(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ident_quoting_doubles_embedded_quotes() {
        let d = PostgresDialect;
        assert_eq!(d.quote_ident("users"), "\"users\"");
        assert_eq!(d.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn string_literals_double_single_quotes_only() {
        let d = PostgresDialect;
        assert_eq!(
            d.format_value("c", &ColumnValue::String("O'Brien \\ co".into())).unwrap(),
            "'O''Brien \\ co'"
        );
    }

    #[test]
    fn booleans_render_as_keywords() {
        let d = PostgresDialect;
        assert_eq!(d.format_value("c", &ColumnValue::Bool(true)).unwrap(), "true");
        assert_eq!(d.format_value("c", &ColumnValue::Bool(false)).unwrap(), "false");
    }

    #[test]
    fn int_extremes() {
        let d = PostgresDialect;
        assert_eq!(
            d.format_value("c", &ColumnValue::Int(i64::MAX)).unwrap(),
            "9223372036854775807"
        );
        assert_eq!(
            d.format_value("c", &ColumnValue::Int(i64::MIN)).unwrap(),
            "-9223372036854775808"
        );
        assert_eq!(d.format_value("c", &ColumnValue::Int(0)).unwrap(), "0");
    }

    #[test]
    fn rfc3339_timestamp_keeps_t_separator() {
        let d = PostgresDialect;
        assert_eq!(
            d.format_value("c", &ColumnValue::Timestamp("2024-05-01T10:00:00+02:00".into()))
                .unwrap(),
            "'2024-05-01T08:00:00'"
        );
        assert_eq!(
            d.format_value("c", &ColumnValue::Timestamp("2024-05-01 10:00:00".into()))
                .unwrap(),
            "'2024-05-01 10:00:00'"
        );
    }

    #[test]
    fn invalid_timestamp_names_the_column() {
        let d = PostgresDialect;
        match d.format_value("created_at", &ColumnValue::Timestamp("soon".into())) {
            Err(KashoError::TimestampParse { column, .. }) => assert_eq!(column, "created_at"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn ddl_type_names() {
        let d = PostgresDialect;
        assert_eq!(d.type_name(&DdlType::Uuid), "UUID");
        assert_eq!(d.type_name(&DdlType::Timestamp), "TIMESTAMP WITH TIME ZONE");
        assert_eq!(d.type_name(&DdlType::Decimal(10, 2)), "DECIMAL(10,2)");
    }

    #[test]
    fn user_table_query_excludes_system_and_reserved() {
        let sql = PostgresDialect.list_user_tables_sql();
        assert!(sql.contains("pg_catalog"));
        assert!(sql.contains("kasho\\_%"));
    }

    #[test]
    fn dsn_native_form() {
        let d = PostgresDialect;
        let dsn = d.shape_dsn("postgres://app:pw@db:6432/shop").unwrap();
        assert_eq!(
            d.connection_string(&dsn),
            "host=db port=6432 user=app password=pw dbname=shop"
        );
    }
}
