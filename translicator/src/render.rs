//! Render one DML event as flavor-correct SQL text. All quoting and
//! literal formatting goes through the dialect; nothing here knows about
//! flavors.

use common::change::{ColumnValue, DmlEvent, DmlKind, OldKeys};
use common::err::{KResult, KashoError};
use dialect::Dialect;

pub fn render_dml(dialect: &dyn Dialect, event: &DmlEvent) -> KResult<String> {
    if !event.validate() {
        return Err(KashoError::ApplyDml {
            table: event.table.clone(),
            position: String::new(),
            cause: "malformed dml event (misaligned columns or oldkeys)".to_string(),
        });
    }
    match event.kind {
        DmlKind::Insert => render_insert(dialect, event),
        DmlKind::Update => render_update(dialect, event),
        DmlKind::Delete => render_delete(dialect, event),
    }
}

fn render_insert(dialect: &dyn Dialect, event: &DmlEvent) -> KResult<String> {
    let table = dialect.quote_ident(&event.table);
    let columns = event
        .columnnames
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let values = format_values(dialect, &event.columnnames, &event.columnvalues)?.join(", ");
    Ok(format!("INSERT INTO {} ({}) VALUES ({})", table, columns, values))
}

fn render_update(dialect: &dyn Dialect, event: &DmlEvent) -> KResult<String> {
    let table = dialect.quote_ident(&event.table);
    let values = format_values(dialect, &event.columnnames, &event.columnvalues)?;
    let assignments = event
        .columnnames
        .iter()
        .zip(values.iter())
        .map(|(c, v)| format!("{} = {}", dialect.quote_ident(c), v))
        .collect::<Vec<_>>()
        .join(", ");
    let keys = event.oldkeys.as_ref().ok_or_else(|| missing_keys(event))?;
    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments,
        where_clause(dialect, keys)?
    ))
}

fn render_delete(dialect: &dyn Dialect, event: &DmlEvent) -> KResult<String> {
    let table = dialect.quote_ident(&event.table);
    let keys = event.oldkeys.as_ref().ok_or_else(|| missing_keys(event))?;
    Ok(format!("DELETE FROM {} WHERE {}", table, where_clause(dialect, keys)?))
}

fn where_clause(dialect: &dyn Dialect, keys: &OldKeys) -> KResult<String> {
    let mut parts = Vec::with_capacity(keys.keynames.len());
    for (name, value) in keys.keynames.iter().zip(keys.keyvalues.iter()) {
        let ident = dialect.quote_ident(name);
        if value.is_null() {
            parts.push(format!("{} IS NULL", ident));
        } else {
            parts.push(format!("{} = {}", ident, dialect.format_value(name, value)?));
        }
    }
    Ok(parts.join(" AND "))
}

fn format_values(
    dialect: &dyn Dialect,
    names: &[String],
    values: &[ColumnValue],
) -> KResult<Vec<String>> {
    names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| dialect.format_value(name, value))
        .collect()
}

fn missing_keys(event: &DmlEvent) -> KashoError {
    KashoError::ApplyDml {
        table: event.table.clone(),
        position: String::new(),
        cause: format!("{:?} without oldkeys", event.kind),
    }
}

#[cfg(test)]
mod test {
    use common::change::OldKeys;
    use dialect::{MySqlDialect, PostgresDialect};

    use super::*;

    fn insert() -> DmlEvent {
        DmlEvent {
            table: "users".into(),
            columnnames: vec!["id".into(), "name".into(), "bio".into()],
            columnvalues: vec![
                ColumnValue::Int(1),
                ColumnValue::String("O'Brien".into()),
                ColumnValue::Null,
            ],
            kind: DmlKind::Insert,
            oldkeys: None,
        }
    }

    #[test]
    fn insert_renders_per_dialect() {
        let e = insert();
        assert_eq!(
            render_dml(&PostgresDialect, &e).unwrap(),
            r#"INSERT INTO "users" ("id", "name", "bio") VALUES (1, 'O''Brien', NULL)"#
        );
        assert_eq!(
            render_dml(&MySqlDialect, &e).unwrap(),
            "INSERT INTO `users` (`id`, `name`, `bio`) VALUES (1, 'O''Brien', NULL)"
        );
    }

    #[test]
    fn update_pins_the_old_keys() {
        let e = DmlEvent {
            table: "users".into(),
            columnnames: vec!["id".into(), "name".into()],
            columnvalues: vec![ColumnValue::Int(1), ColumnValue::String("Bob".into())],
            kind: DmlKind::Update,
            oldkeys: Some(OldKeys {
                keynames: vec!["id".into()],
                keyvalues: vec![ColumnValue::Int(1)],
            }),
        };
        assert_eq!(
            render_dml(&PostgresDialect, &e).unwrap(),
            r#"UPDATE "users" SET "id" = 1, "name" = 'Bob' WHERE "id" = 1"#
        );
    }

    #[test]
    fn delete_by_null_key_uses_is_null() {
        let e = DmlEvent {
            table: "t".into(),
            columnnames: vec![],
            columnvalues: vec![],
            kind: DmlKind::Delete,
            oldkeys: Some(OldKeys {
                keynames: vec!["k".into()],
                keyvalues: vec![ColumnValue::Null],
            }),
        };
        assert_eq!(
            render_dml(&PostgresDialect, &e).unwrap(),
            r#"DELETE FROM "t" WHERE "k" IS NULL"#
        );
    }

    #[test]
    fn misaligned_event_is_rejected() {
        let mut e = insert();
        e.columnvalues.pop();
        assert!(matches!(
            render_dml(&PostgresDialect, &e),
            Err(KashoError::ApplyDml { .. })
        ));
    }
}
