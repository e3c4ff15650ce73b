use std::collections::HashMap;
use std::io::BufRead;

use tracing::debug;

use common::change::ColumnValue;
use common::err::{KResult, KashoError};
use common::KASHO_PREFIX;

use crate::table_name::ddl_object_name;
use crate::value_infer::infer_value;
use crate::DumpEvent;

/// Streaming parser for `mysqldump` output. Extended
/// `INSERT INTO t VALUES (…),(…);` lists may span physical lines; the
/// tokenizer is quote-aware, so embedded `),(` text never splits a row.
pub struct MySqlDumpParser<R: BufRead> {
    reader: R,
    stmt: StatementAccumulator,
    row_cap: Option<usize>,
    rows_per_table: HashMap<String, usize>,
    pending: Vec<DumpEvent>,
    in_comment: bool,
    done: bool,
}

impl<R: BufRead> MySqlDumpParser<R> {
    pub fn new(reader: R, row_cap: Option<usize>) -> Self {
        MySqlDumpParser {
            reader,
            stmt: StatementAccumulator::default(),
            row_cap,
            rows_per_table: HashMap::new(),
            pending: Vec::new(),
            in_comment: false,
            done: false,
        }
    }

    fn next_event(&mut self) -> KResult<Option<DumpEvent>> {
        loop {
            if !self.pending.is_empty() {
                return Ok(Some(self.pending.remove(0)));
            }

            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                if !self.stmt.is_empty() {
                    return Err(KashoError::Parse(format!(
                        "dump truncated inside statement: {:?}",
                        self.stmt.preview()
                    )));
                }
                return Ok(None);
            }
            let line = line.trim_end_matches(['\n', '\r']);

            if self.in_comment {
                let trimmed = line.trim_end();
                if trimmed.ends_with("*/;") || trimmed.ends_with("*/") {
                    self.in_comment = false;
                }
                continue;
            }

            if self.stmt.is_empty() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    continue;
                }
                // /*!40101 SET ... */; conditional comments, possibly
                // spanning lines (trigger and routine sections do)
                if trimmed.starts_with("/*") {
                    if !(trimmed.ends_with("*/;") || trimmed.ends_with("*/")) {
                        self.in_comment = true;
                    }
                    continue;
                }
            }

            self.stmt.push_line(line);
            if let Some(sql) = self.stmt.take_if_complete() {
                self.classify(&sql)?;
            }
        }
    }

    fn classify(&mut self, sql: &str) -> KResult<()> {
        let upper = sql.trim_start().to_uppercase();

        const SKIP_PREFIXES: &[&str] = &[
            "SET ",
            "BEGIN",
            "COMMIT",
            "START TRANSACTION",
            "LOCK TABLES",
            "UNLOCK TABLES",
            "USE ",
        ];
        if SKIP_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            return Ok(());
        }

        if upper.starts_with("INSERT INTO") {
            return self.decode_insert(sql);
        }

        const DDL_PREFIXES: &[&str] = &[
            "CREATE TABLE",
            "CREATE INDEX",
            "CREATE UNIQUE INDEX",
            "ALTER TABLE",
            "DROP ",
            "TRUNCATE",
            "CREATE TRIGGER",
            "CREATE EVENT",
            "CREATE FUNCTION",
            "CREATE PROCEDURE",
            "CREATE VIEW",
            "CREATE OR REPLACE VIEW",
            "CREATE DATABASE",
            "GRANT ",
            "REVOKE ",
            "COMMENT ",
        ];
        if DDL_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            let object = ddl_object_name(sql);
            if let Some(name) = &object {
                if name.starts_with(KASHO_PREFIX) {
                    debug!(object = %name, "skipping reserved-prefix statement");
                    return Ok(());
                }
            }
            self.pending.push(DumpEvent::Ddl {
                object,
                sql: sql.to_string(),
            });
            return Ok(());
        }

        Err(KashoError::Parse(format!(
            "unsupported statement in dump: {}",
            sql.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
        )))
    }

    /// `INSERT INTO t (a, b) VALUES (1, 'x'), (2, 'y');`
    fn decode_insert(&mut self, sql: &str) -> KResult<()> {
        let (table, columns, values_part) = split_insert(sql)?;
        if table.starts_with(KASHO_PREFIX) {
            return Ok(());
        }
        let tuples = tokenize_tuples(values_part)?;
        for tuple in tuples {
            let seen = self.rows_per_table.entry(table.clone()).or_insert(0);
            *seen += 1;
            if let Some(cap) = self.row_cap {
                if *seen > cap {
                    continue;
                }
            }
            if !columns.is_empty() && tuple.len() != columns.len() {
                return Err(KashoError::Parse(format!(
                    "INSERT row for {} has {} values, expected {}",
                    table,
                    tuple.len(),
                    columns.len()
                )));
            }
            self.pending.push(DumpEvent::Row {
                table: table.clone(),
                columns: columns.clone(),
                values: tuple,
            });
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for MySqlDumpParser<R> {
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

fn split_insert(sql: &str) -> KResult<(String, Vec<String>, &str)> {
    let at = find_ci(sql, "INSERT INTO")
        .ok_or_else(|| KashoError::Parse("malformed INSERT".into()))?;
    let rest = &sql[at + "INSERT INTO".len()..];
    let rest = rest.trim_start();

    // table name, optionally backtick-quoted
    let (table_raw, rest) = if let Some(stripped) = rest.strip_prefix('`') {
        let end = stripped
            .find('`')
            .ok_or_else(|| KashoError::Parse("unterminated identifier in INSERT".into()))?;
        (&stripped[..end], &stripped[end + 1..])
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '(')
            .ok_or_else(|| KashoError::Parse("malformed INSERT".into()))?;
        (&rest[..end], &rest[end..])
    };
    let table = table_raw.to_string();
    let rest = rest.trim_start();

    // optional column list before VALUES
    let values_at = find_ci(rest, "VALUES")
        .ok_or_else(|| KashoError::Parse(format!("INSERT without VALUES for {}", table)))?;
    let before = &rest[..values_at];
    let columns = match (before.find('('), before.rfind(')')) {
        (Some(open), Some(close)) if close > open => before[open + 1..close]
            .split(',')
            .map(|c| c.trim().trim_matches('`').to_string())
            .collect(),
        _ => Vec::new(),
    };
    let values_part = rest[values_at + "VALUES".len()..].trim_start();
    Ok((table, columns, values_part))
}

/// Case-insensitive substring search returning a byte offset into the
/// original string (ASCII needles only, so offsets stay valid).
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Decode `(v, v), (v, v);` into rows of typed values.
fn tokenize_tuples(input: &str) -> KResult<Vec<Vec<ColumnValue>>> {
    let mut tuples = Vec::new();
    let mut current: Vec<ColumnValue> = Vec::new();
    let mut chars = input.chars().peekable();

    #[derive(PartialEq)]
    enum Where {
        BetweenTuples,
        InTuple,
    }
    let mut state = Where::BetweenTuples;

    while let Some(&c) = chars.peek() {
        match state {
            Where::BetweenTuples => match c {
                '(' => {
                    chars.next();
                    state = Where::InTuple;
                    current = Vec::new();
                }
                ',' | ';' => {
                    chars.next();
                }
                c if c.is_whitespace() => {
                    chars.next();
                }
                other => {
                    return Err(KashoError::Parse(format!(
                        "unexpected {:?} between INSERT tuples",
                        other
                    )))
                }
            },
            Where::InTuple => match c {
                c if c.is_whitespace() || c == ',' => {
                    chars.next();
                }
                ')' => {
                    chars.next();
                    tuples.push(std::mem::take(&mut current));
                    state = Where::BetweenTuples;
                }
                '\'' => {
                    chars.next();
                    current.push(read_quoted(&mut chars)?);
                }
                _ => {
                    current.push(read_bare(&mut chars)?);
                }
            },
        }
    }
    if state == Where::InTuple {
        return Err(KashoError::Parse("unterminated INSERT tuple".into()));
    }
    Ok(tuples)
}

/// A single-quoted literal; `\x` escapes and doubled quotes both occur
/// in mysqldump output.
fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> KResult<ColumnValue> {
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some('Z') => out.push('\u{1a}'),
                Some(other) => out.push(other),
                None => return Err(KashoError::Parse("unterminated string literal".into())),
            },
            '\'' => {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push('\'');
                    continue;
                }
                // quoted strings are strings or timestamps, never numbers
                let inferred = infer_value(&out);
                return Ok(match inferred {
                    ColumnValue::Timestamp(_) => inferred,
                    _ => ColumnValue::String(out),
                });
            }
            other => out.push(other),
        }
    }
    Err(KashoError::Parse("unterminated string literal".into()))
}

fn read_bare(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> KResult<ColumnValue> {
    let mut raw = String::new();
    while let Some(&c) = chars.peek() {
        if c == ',' || c == ')' || c.is_whitespace() {
            break;
        }
        raw.push(c);
        chars.next();
    }
    if raw.eq_ignore_ascii_case("NULL") {
        return Ok(ColumnValue::Null);
    }
    Ok(infer_value(&raw))
}

/// Statement accumulator aware of single-quoted literals (with backslash
/// escapes, MySQL-style) so `;` inside data never terminates early.
#[derive(Default)]
struct StatementAccumulator {
    buf: String,
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
        if ends_outside_quotes(&self.buf) {
            let sql = std::mem::take(&mut self.buf);
            Some(sql.trim().to_string())
        } else {
            None
        }
    }
}

fn ends_outside_quotes(buf: &str) -> bool {
    let mut in_quote = false;
    let mut last_significant = ' ';
    let mut chars = buf.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quote {
            match c {
                '\\' => {
                    chars.next();
                }
                '\'' => {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                    } else {
                        in_quote = false;
                    }
                }
                _ => {}
            }
        } else {
            if c == '\'' {
                in_quote = true;
            }
            if !c.is_whitespace() {
                last_significant = c;
            }
        }
    }
    !in_quote && last_significant == ';'
}
