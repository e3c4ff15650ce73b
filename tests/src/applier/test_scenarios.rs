use std::sync::Arc;

use buffer::mem::{MemoryBuffer, MemoryStateStore};
use buffer::{ChangeSink, StateStore};
use common::cancel::cancel_pair;
use common::change::{Change, ColumnValue, DdlEvent, DmlEvent, DmlKind};
use common::config::RetryConfig;
use common::err::KashoError;
use common::position::bootstrap_position;
use dialect::PostgresDialect;
use translicator::applier::{ApplierOptions, Translicator};
use translicator::TransformEngine;

use crate::support::{insert_change, update_change, MockReplicaWriter};

fn options() -> ApplierOptions {
    ApplierOptions {
        batch_size: 16,
        flush_interval: std::time::Duration::from_secs(3600),
        skip_transform_errors: false,
        retry: RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_retries: 3,
        },
    }
}

fn translicator(
    buffer: MemoryBuffer,
    state: MemoryStateStore,
    writer: MockReplicaWriter,
    transforms: TransformEngine,
) -> Translicator<MemoryBuffer, MemoryStateStore, MockReplicaWriter> {
    Translicator::new(
        buffer,
        state,
        writer,
        Arc::new(PostgresDialect),
        transforms,
        options(),
    )
}

// Single insert lands on the replica with the exact wire shape intact.
#[tokio::test]
async fn single_insert_replicates() {
    let mut buffer = MemoryBuffer::new();
    buffer
        .publish(&insert_change("0/16", "users", 1, "Alice"))
        .await
        .unwrap();

    // the buffered payload has the documented shape
    let payloads = buffer.payloads().await;
    let v: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(v["type"], "dml");
    assert_eq!(v["position"], "0/16");
    assert_eq!(v["data"]["columnnames"][0], "id");
    assert_eq!(v["data"]["columnvalues"][1], "Alice");

    let writer = MockReplicaWriter::new();
    let mut applier = translicator(
        buffer,
        MemoryStateStore::new(),
        writer.clone(),
        TransformEngine::empty(),
    );
    let (_handle, mut token) = cancel_pair();
    applier.drain(&mut token).await.unwrap();

    assert_eq!(
        writer.statements(),
        vec![r#"INSERT INTO "users" ("id", "name") VALUES (1, 'Alice')"#]
    );
    assert_eq!(applier.checkpoint(), Some("0/16"));
}

// Insert then update: the update pins the old key image.
#[tokio::test]
async fn update_after_insert() {
    let mut buffer = MemoryBuffer::new();
    buffer
        .publish(&insert_change("0/16", "users", 1, "Alice"))
        .await
        .unwrap();
    buffer
        .publish(&update_change("0/20", "users", 1, "Bob"))
        .await
        .unwrap();

    let writer = MockReplicaWriter::new();
    let mut applier = translicator(
        buffer,
        MemoryStateStore::new(),
        writer.clone(),
        TransformEngine::empty(),
    );
    let (_handle, mut token) = cancel_pair();
    applier.drain(&mut token).await.unwrap();

    let statements = writer.statements();
    assert_eq!(statements.len(), 2);
    assert_eq!(
        statements[1],
        r#"UPDATE "users" SET "id" = 1, "name" = 'Bob' WHERE "id" = 1"#
    );
}

// Bootstrap prefix then live events: everything applies in score order
// and the sequence resync runs exactly at the boundary.
#[tokio::test]
async fn bootstrap_then_live_with_resync() {
    let mut buffer = MemoryBuffer::new();
    // deliberately publish live events first; score order must win
    buffer
        .publish(&insert_change("0/104", "users", 4, "Dave"))
        .await
        .unwrap();
    buffer
        .publish(&insert_change("0/108", "users", 5, "Erin"))
        .await
        .unwrap();
    for (seq, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
        buffer
            .publish(&insert_change(
                &bootstrap_position(seq as u64),
                "users",
                seq,
                name,
            ))
            .await
            .unwrap();
    }

    let mut writer = MockReplicaWriter::new();
    writer.discovery_rows = vec![vec![
        Some("users".to_string()),
        Some("id".to_string()),
        Some("users_id_seq".to_string()),
    ]];
    writer.max_values.insert("users".to_string(), 3);

    let mut applier = translicator(
        buffer,
        MemoryStateStore::new(),
        writer.clone(),
        TransformEngine::empty(),
    );
    let (_handle, mut token) = cancel_pair();
    applier.drain(&mut token).await.unwrap();

    let statements = writer.statements();
    assert_eq!(statements.len(), 6); // 3 bootstrap + resync + 2 live
    assert!(statements[0].contains("'Alice'"));
    assert!(statements[1].contains("'Bob'"));
    assert!(statements[2].contains("'Carol'"));
    assert_eq!(statements[3], "SELECT setval('users_id_seq', 4, false)");
    assert!(statements[4].contains("'Dave'"));
    assert!(statements[5].contains("'Erin'"));
    assert_eq!(applier.applied(), 5);
}

// Declared password transform reaches the replica, deterministically.
#[tokio::test]
async fn password_transform_applies() {
    let rules = "rules:\n\
                 - table: users\n\
                   column: password\n\
                   kind: PasswordArgon2id\n\
                   memory_kib: 64\n\
                   time_cost: 1\n";
    let transforms = TransformEngine::from_yaml(rules).unwrap();

    let event = DmlEvent {
        table: "users".into(),
        columnnames: vec!["id".into(), "password".into()],
        columnvalues: vec![ColumnValue::Int(1), ColumnValue::String("s3cret".into())],
        kind: DmlKind::Insert,
        oldkeys: None,
    };

    let run = |transforms: TransformEngine| async {
        let mut buffer = MemoryBuffer::new();
        buffer
            .publish(&Change::dml("0/16", event.clone()))
            .await
            .unwrap();
        let writer = MockReplicaWriter::new();
        let mut applier = translicator(buffer, MemoryStateStore::new(), writer.clone(), transforms);
        let (_handle, mut token) = cancel_pair();
        applier.drain(&mut token).await.unwrap();
        writer.statements()[0].clone()
    };

    let first = run(transforms.clone()).await;
    let second = run(transforms).await;
    // same source row, same hash; the cleartext never reaches the replica
    assert_eq!(first, second);
    assert!(!first.contains("s3cret"));
    // hex(salt)$hex(hash)
    assert!(first.contains('$'));
}

// A DDL failure is fatal and surfaces the offending SQL and position.
#[tokio::test]
async fn ddl_failures_are_fatal() {
    #[derive(Clone, Default)]
    struct FailingWriter;

    #[async_trait::async_trait]
    impl translicator::replica::ReplicaWriter for FailingWriter {
        async fn execute(
            &mut self,
            _sql: &str,
        ) -> Result<u64, translicator::replica::WriteError> {
            Err(translicator::replica::WriteError::Sql("table exists".into()))
        }
        async fn query_rows(
            &mut self,
            _sql: &str,
        ) -> Result<Vec<Vec<Option<String>>>, translicator::replica::WriteError> {
            Ok(vec![])
        }
        async fn close(&mut self) -> common::err::KResult<()> {
            Ok(())
        }
    }

    let mut buffer = MemoryBuffer::new();
    buffer
        .publish(&Change::ddl(
            "0/30",
            DdlEvent {
                id: 1,
                time: String::new(),
                username: String::new(),
                database: String::new(),
                ddl: "CREATE TABLE t (id int)".into(),
            },
        ))
        .await
        .unwrap();

    let mut applier = Translicator::new(
        buffer,
        MemoryStateStore::new(),
        FailingWriter,
        Arc::new(PostgresDialect),
        TransformEngine::empty(),
        options(),
    );
    let (_handle, mut token) = cancel_pair();
    let err = applier.drain(&mut token).await.unwrap_err();
    match err {
        KashoError::ApplyDdl { sql, position, .. } => {
            assert_eq!(sql, "CREATE TABLE t (id int)");
            assert_eq!(position, "0/30");
        }
        other => panic!("unexpected {:?}", other),
    }
    // the failed change is not checkpointed
    assert_eq!(applier.checkpoint(), None);
}

// Transient replica failures retry and then succeed without losing
// ordering or duplicating work.
#[tokio::test]
async fn transient_write_failures_retry() {
    let mut buffer = MemoryBuffer::new();
    buffer
        .publish(&insert_change("0/16", "users", 1, "Alice"))
        .await
        .unwrap();

    let writer = MockReplicaWriter::new();
    writer.inject_transient_failures(2);
    let mut applier = translicator(
        buffer,
        MemoryStateStore::new(),
        writer.clone(),
        TransformEngine::empty(),
    );
    let (_handle, mut token) = cancel_pair();
    applier.drain(&mut token).await.unwrap();
    assert_eq!(writer.statements().len(), 1);
    assert_eq!(applier.checkpoint(), Some("0/16"));
}

// The durable checkpoint only moves on flush, and flushes trim nothing
// above it.
#[tokio::test]
async fn checkpoint_flush_is_explicit() {
    let mut buffer = MemoryBuffer::new();
    buffer
        .publish(&insert_change("0/16", "users", 1, "Alice"))
        .await
        .unwrap();

    let mut state = MemoryStateStore::new();
    let writer = MockReplicaWriter::new();
    let mut applier = translicator(
        buffer,
        state.clone(),
        writer,
        TransformEngine::empty(),
    );
    let (_handle, mut token) = cancel_pair();
    applier.drain(&mut token).await.unwrap();

    assert_eq!(state.load_checkpoint().await.unwrap(), None);
    applier.flush_checkpoint().await.unwrap();
    assert_eq!(state.load_checkpoint().await.unwrap().as_deref(), Some("0/16"));
}
