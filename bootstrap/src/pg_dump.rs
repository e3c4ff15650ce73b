use std::collections::HashMap;
use std::io::BufRead;

use tracing::{debug, warn};

use common::change::ColumnValue;
use common::err::{KResult, KashoError};
use common::KASHO_PREFIX;

use crate::table_name::ddl_object_name;
use crate::value_infer::infer_value;
use crate::DumpEvent;

/// Streaming parser for plain `pg_dump` output. Yields one event per
/// DDL statement or data row; `COPY … FROM stdin;` blocks are decoded
/// with the four standard backslash escapes and `\N` nulls.
pub struct PgDumpParser<R: BufRead> {
    reader: R,
    /// pending rows decoded from the current COPY block
    copy: Option<CopyBlock>,
    stmt: StatementAccumulator,
    row_cap: Option<usize>,
    rows_per_table: HashMap<String, usize>,
    done: bool,
}

struct CopyBlock {
    table: String,
    columns: Vec<String>,
    skip: bool,
}

impl<R: BufRead> PgDumpParser<R> {
    pub fn new(reader: R, row_cap: Option<usize>) -> Self {
        PgDumpParser {
            reader,
            copy: None,
            stmt: StatementAccumulator::default(),
            row_cap,
            rows_per_table: HashMap::new(),
            done: false,
        }
    }

    fn next_event(&mut self) -> KResult<Option<DumpEvent>> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                if self.copy.is_some() {
                    return Err(KashoError::Parse("dump truncated inside COPY block".into()));
                }
                if !self.stmt.is_empty() {
                    return Err(KashoError::Parse(format!(
                        "dump truncated inside statement: {:?}",
                        self.stmt.preview()
                    )));
                }
                return Ok(None);
            }
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(block) = self.copy.take() {
                if line == "\\." {
                    continue;
                }
                if block.skip {
                    self.copy = Some(block);
                    continue;
                }
                let seen = self.rows_per_table.entry(block.table.clone()).or_insert(0);
                *seen += 1;
                let over_cap = self.row_cap.map_or(false, |cap| *seen > cap);
                if over_cap {
                    self.copy = Some(block);
                    continue;
                }
                let values = decode_copy_row(line, block.columns.len(), &block.table)?;
                let event = DumpEvent::Row {
                    table: block.table.clone(),
                    columns: block.columns.clone(),
                    values,
                };
                self.copy = Some(block);
                return Ok(Some(event));
            }

            if self.stmt.is_empty() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    continue;
                }
                if let Some(block) = parse_copy_header(trimmed) {
                    let mut block = block;
                    if block.table.starts_with(KASHO_PREFIX) {
                        debug!(table = %block.table, "skipping reserved-prefix COPY block");
                        block.skip = true;
                    }
                    self.copy = Some(block);
                    continue;
                }
            }

            self.stmt.push_line(line);
            if let Some(sql) = self.stmt.take_if_complete() {
                match classify_statement(&sql)? {
                    Classified::Skip => continue,
                    Classified::Ddl { object } => {
                        return Ok(Some(DumpEvent::Ddl { object, sql }));
                    }
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for PgDumpParser<R> {
    type Item = KResult<DumpEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// `COPY <table> (<cols>) FROM stdin;`
fn parse_copy_header(line: &str) -> Option<CopyBlock> {
    let rest = line.strip_prefix("COPY ")?;
    let rest = rest.strip_suffix("FROM stdin;")?.trim_end();
    let open = rest.find('(')?;
    let close = rest.rfind(')')?;
    let table = normalize_ident(rest[..open].trim());
    let columns = rest[open + 1..close]
        .split(',')
        .map(|c| normalize_ident(c.trim()))
        .collect();
    Some(CopyBlock {
        table,
        columns,
        skip: false,
    })
}

fn normalize_ident(ident: &str) -> String {
    let unqualified = ident.rsplit('.').next().unwrap_or(ident);
    unqualified.trim_matches('"').to_string()
}

fn decode_copy_row(line: &str, expected: usize, table: &str) -> KResult<Vec<ColumnValue>> {
    let mut values = Vec::with_capacity(expected);
    for field in line.split('\t') {
        if field == "\\N" {
            values.push(ColumnValue::Null);
            continue;
        }
        values.push(infer_value(&unescape_copy(field)?));
    }
    if values.len() != expected {
        return Err(KashoError::Parse(format!(
            "COPY row for {} has {} fields, expected {}",
            table,
            values.len(),
            expected
        )));
    }
    Ok(values)
}

fn unescape_copy(field: &str) -> KResult<String> {
    if !field.contains('\\') {
        return Ok(field.to_string());
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            other => {
                return Err(KashoError::Parse(format!(
                    "unsupported COPY escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Multi-line statement accumulator, aware of single quotes and
/// dollar-quoted function bodies so embedded semicolons don't split.
#[derive(Default)]
struct StatementAccumulator {
    buf: String,
    in_single_quote: bool,
    dollar_tag: Option<String>,
}

impl StatementAccumulator {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn preview(&self) -> String {
        self.buf.chars().take(60).collect()
    }

    fn push_line(&mut self, line: &str) {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(line);
    }

    fn take_if_complete(&mut self) -> Option<String> {
        self.rescan();
        if !self.in_single_quote && self.dollar_tag.is_none() && self.buf.trim_end().ends_with(';')
        {
            self.in_single_quote = false;
            self.dollar_tag = None;
            let sql = std::mem::take(&mut self.buf);
            Some(sql.trim().to_string())
        } else {
            None
        }
    }

    fn rescan(&mut self) {
        self.in_single_quote = false;
        self.dollar_tag = None;
        let bytes: Vec<char> = self.buf.chars().collect();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if let Some(tag) = &self.dollar_tag {
                if c == '$' {
                    let rest: String = bytes[i..].iter().collect();
                    if rest.starts_with(tag.as_str()) {
                        i += tag.chars().count();
                        self.dollar_tag = None;
                        continue;
                    }
                }
                i += 1;
                continue;
            }
            if self.in_single_quote {
                if c == '\'' {
                    // '' is an escaped quote
                    if bytes.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    self.in_single_quote = false;
                }
                i += 1;
                continue;
            }
            match c {
                '\'' => self.in_single_quote = true,
                '$' => {
                    let rest: String = bytes[i..].iter().collect();
                    if let Some(tag) = dollar_tag_at(&rest) {
                        i += tag.chars().count();
                        self.dollar_tag = Some(tag);
                        continue;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
}

// `$$` or `$tag$` at the start of the given slice
fn dollar_tag_at(s: &str) -> Option<String> {
    let mut chars = s.chars();
    if chars.next() != Some('$') {
        return None;
    }
    let mut tag = String::from("$");
    for c in chars {
        tag.push(c);
        if c == '$' {
            return Some(tag);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
    }
    None
}

enum Classified {
    Skip,
    Ddl { object: Option<String> },
}

fn classify_statement(sql: &str) -> KResult<Classified> {
    let upper = sql.trim_start().to_uppercase();

    const SKIP_PREFIXES: &[&str] = &[
        "SET ",
        "BEGIN",
        "COMMIT",
        "START TRANSACTION",
        "LOCK ",
        "UNLOCK ",
        "CREATE PUBLICATION",
        "ALTER PUBLICATION",
        "DROP PUBLICATION",
        "CREATE SUBSCRIPTION",
        "ALTER SUBSCRIPTION",
        "DROP SUBSCRIPTION",
        "SELECT PG_CATALOG.SET_CONFIG",
    ];
    if SKIP_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        return Ok(Classified::Skip);
    }

    const DDL_PREFIXES: &[&str] = &[
        "CREATE TABLE",
        "CREATE UNLOGGED TABLE",
        "CREATE INDEX",
        "CREATE UNIQUE INDEX",
        "ALTER TABLE",
        "ALTER INDEX",
        "CREATE SEQUENCE",
        "ALTER SEQUENCE",
        "CREATE FUNCTION",
        "CREATE OR REPLACE FUNCTION",
        "CREATE TRIGGER",
        "CREATE CONSTRAINT TRIGGER",
        "CREATE EVENT TRIGGER",
        "CREATE SCHEMA",
        "CREATE EXTENSION",
        "CREATE TYPE",
        "CREATE VIEW",
        "CREATE OR REPLACE VIEW",
        "DROP ",
        "COMMENT ",
        "GRANT ",
        "REVOKE ",
        "TRUNCATE",
        "ALTER FUNCTION",
        "ALTER TYPE",
        "ALTER SCHEMA",
        "ALTER DEFAULT PRIVILEGES",
    ];
    let is_setval = upper.starts_with("SELECT") && upper.contains("SETVAL");
    if is_setval || DDL_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        let object = ddl_object_name(sql);
        if let Some(name) = &object {
            if name.starts_with(KASHO_PREFIX) {
                debug!(object = %name, "skipping reserved-prefix statement");
                return Ok(Classified::Skip);
            }
        }
        return Ok(Classified::Ddl { object });
    }

    warn!("unsupported dump statement: {:?}", first_words(sql));
    Err(KashoError::Parse(format!(
        "unsupported statement in dump: {}",
        first_words(sql)
    )))
}

fn first_words(sql: &str) -> String {
    sql.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_all(dump: &str) -> Vec<DumpEvent> {
        PgDumpParser::new(dump.as_bytes(), None)
            .collect::<KResult<Vec<_>>>()
            .unwrap()
    }

    const SMALL_DUMP: &str = "\
--
-- PostgreSQL database dump
--

SET statement_timeout = 0;
SELECT pg_catalog.set_config('search_path', '', false);

CREATE TABLE public.users (
    id integer NOT NULL,
    name text,
    joined timestamp with time zone
);

COPY public.users (id, name, joined) FROM stdin;
1\tAlice\t2024-05-01 10:00:00
2\t\\N\t\\N
3\tTab\\there\t2024-05-02 09:30:00
\\.

SELECT pg_catalog.setval('public.users_id_seq', 3, true);
";

    #[test]
    fn copy_blocks_decode_rows() {
        let events = parse_all(SMALL_DUMP);
        assert_eq!(events.len(), 5); // create + 3 rows + setval

        match &events[1] {
            DumpEvent::Row { table, columns, values } => {
                assert_eq!(table, "users");
                assert_eq!(columns, &["id", "name", "joined"]);
                assert_eq!(values[0], ColumnValue::Int(1));
                assert_eq!(values[1], ColumnValue::String("Alice".into()));
                assert_eq!(values[2], ColumnValue::Timestamp("2024-05-01 10:00:00".into()));
            }
            other => panic!("expected row, got {:?}", other),
        }
        match &events[2] {
            DumpEvent::Row { values, .. } => {
                assert!(values[1].is_null());
                assert!(values[2].is_null());
            }
            other => panic!("expected row, got {:?}", other),
        }
        match &events[3] {
            DumpEvent::Row { values, .. } => {
                assert_eq!(values[1], ColumnValue::String("Tab\there".into()));
            }
            other => panic!("expected row, got {:?}", other),
        }
        match &events[4] {
            DumpEvent::Ddl { object, sql } => {
                assert_eq!(object.as_deref(), Some("users_id_seq"));
                assert!(sql.contains("setval"));
            }
            other => panic!("expected ddl, got {:?}", other),
        }
    }

    #[test]
    fn kasho_objects_are_invisible() {
        let dump = "\
CREATE TABLE public.kasho_ddl_log (id bigint, ddl text);

COPY public.kasho_ddl_log (id, ddl) FROM stdin;
1\tCREATE TABLE x (y int)
\\.

CREATE TABLE public.real_table (id int);
";
        let events = parse_all(dump);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DumpEvent::Ddl { object, .. } => assert_eq!(object.as_deref(), Some("real_table")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn row_cap_limits_each_table() {
        let dump = "\
COPY public.users (id) FROM stdin;
1
2
3
\\.
";
        let events = PgDumpParser::new(dump.as_bytes(), Some(2))
            .collect::<KResult<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn dollar_quoted_bodies_keep_semicolons() {
        let dump = "\
CREATE FUNCTION public.touch() RETURNS trigger AS $$
BEGIN
  NEW.updated := now();
  RETURN NEW;
END;
$$ LANGUAGE plpgsql;
";
        let events = parse_all(dump);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DumpEvent::Ddl { sql, .. } => assert!(sql.contains("RETURN NEW;")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_statements_are_fatal() {
        let err = PgDumpParser::new("VACUUM FULL;\n".as_bytes(), None)
            .collect::<KResult<Vec<_>>>()
            .unwrap_err();
        assert!(matches!(err, KashoError::Parse(_)));
    }

    #[test]
    fn truncated_copy_is_fatal() {
        let dump = "COPY public.users (id) FROM stdin;\n1\n";
        let err = PgDumpParser::new(dump.as_bytes(), None)
            .collect::<KResult<Vec<_>>>()
            .unwrap_err();
        assert!(matches!(err, KashoError::Parse(_)));
    }
}
