use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{ObjectName, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// Extract the primary object name a DDL statement touches, normalized
/// (quotes stripped, schema qualifier dropped). A real SQL parser first;
/// keyword patterns for the statement shapes it does not model (pg_dump
/// emits plenty). `None` for statements without a usable name.
pub fn ddl_object_name(sql: &str) -> Option<String> {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(stmts) => match stmts.first().and_then(from_statement) {
            Some(name) => Some(name),
            None => fallback_name(sql),
        },
        Err(e) => {
            debug!("sql parser fell back on {:?}: {}", first_words(sql), e);
            fallback_name(sql)
        }
    }
}

fn from_statement(stmt: &Statement) -> Option<String> {
    match stmt {
        Statement::CreateTable(ct) => last_ident(&ct.name),
        Statement::AlterTable { name, .. } => last_ident(name),
        Statement::Drop { names, .. } => names.first().and_then(last_ident),
        Statement::Truncate { table_names, .. } => {
            table_names.first().and_then(|t| last_ident(&t.name))
        }
        Statement::CreateIndex(ci) => last_ident(&ci.table_name),
        Statement::CreateSequence { name, .. } => last_ident(name),
        _ => None,
    }
}

fn last_ident(name: &ObjectName) -> Option<String> {
    name.0.last().map(|ident| ident.value.clone())
}

static FALLBACK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    const IDENT: &str = r#"([A-Za-z_][A-Za-z0-9_$]*|"[^"]+"|`[^`]+`)"#;
    [
        format!(r#"(?i)^CREATE\s+(?:UNLOGGED\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^ALTER\s+TABLE\s+(?:ONLY\s+)?(?:IF\s+EXISTS\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^TRUNCATE\s+(?:TABLE\s+)?(?:ONLY\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^DROP\s+\w+(?:\s+IF\s+EXISTS)?\s+(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^COMMENT\s+ON\s+\w+\s+(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^CREATE\s+(?:UNIQUE\s+)?INDEX\s+\S+\s+ON\s+(?:ONLY\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^CREATE\s+(?:CONSTRAINT\s+)?TRIGGER\s+(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^CREATE\s+EVENT\s+TRIGGER\s+(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^CREATE\s+(?:OR\s+REPLACE\s+)?FUNCTION\s+(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^(?:CREATE|ALTER)\s+SEQUENCE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^GRANT\s+.*?\s+ON\s+(?:TABLE\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)^REVOKE\s+.*?\s+ON\s+(?:TABLE\s+)?(?:{id}\.)?{id}"#, id = IDENT),
        format!(r#"(?i)setval\s*\(\s*'(?:([A-Za-z0-9_$]+)\.)?([A-Za-z0-9_$"]+)'"#),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("fallback pattern compiles"))
    .collect()
});

fn fallback_name(sql: &str) -> Option<String> {
    let sql = sql.trim_start();
    for re in FALLBACK_PATTERNS.iter() {
        if let Some(caps) = re.captures(sql) {
            // last capture group that matched is the unqualified name
            let name = caps
                .iter()
                .skip(1)
                .flatten()
                .last()
                .map(|m| m.as_str())?;
            return Some(unquote(name));
        }
    }
    None
}

fn unquote(ident: &str) -> String {
    let ident = ident.trim();
    if (ident.starts_with('"') && ident.ends_with('"'))
        || (ident.starts_with('`') && ident.ends_with('`'))
    {
        ident[1..ident.len() - 1].to_string()
    } else {
        ident.to_string()
    }
}

fn first_words(sql: &str) -> String {
    sql.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parser_backed_names() {
        assert_eq!(
            ddl_object_name("CREATE TABLE public.users (id int PRIMARY KEY)"),
            Some("users".into())
        );
        assert_eq!(
            ddl_object_name("ALTER TABLE orders ADD COLUMN total numeric(10,2)"),
            Some("orders".into())
        );
        assert_eq!(ddl_object_name("DROP TABLE IF EXISTS old_stuff"), Some("old_stuff".into()));
        assert_eq!(ddl_object_name("TRUNCATE TABLE audit"), Some("audit".into()));
    }

    #[test]
    fn fallback_names() {
        assert_eq!(
            ddl_object_name("CREATE UNIQUE INDEX users_email_key ON public.users USING btree (email)"),
            Some("users".into())
        );
        assert_eq!(
            ddl_object_name("CREATE TRIGGER kasho_ddl_trigger AFTER INSERT ON t EXECUTE FUNCTION f()"),
            Some("kasho_ddl_trigger".into())
        );
        assert_eq!(
            ddl_object_name("SELECT pg_catalog.setval('public.users_id_seq', 5, true);"),
            Some("users_id_seq".into())
        );
        assert_eq!(
            ddl_object_name("COMMENT ON TABLE public.users IS 'people'"),
            Some("users".into())
        );
    }

    #[test]
    fn quoted_and_qualified_names_normalize() {
        assert_eq!(
            ddl_object_name(r#"ALTER TABLE ONLY public."Weird Name" ADD PRIMARY KEY (id)"#),
            Some("Weird Name".into())
        );
    }

    #[test]
    fn nameless_statements_yield_none() {
        assert_eq!(ddl_object_name("SET search_path = public"), None);
    }
}
