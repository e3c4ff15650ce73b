use std::sync::Arc;

use buffer::mem::{MemoryBuffer, MemoryStateStore};
use buffer::{ChangeSink, StateStore};
use common::cancel::cancel_pair;
use common::config::RetryConfig;
use common::position::score;
use dialect::PostgresDialect;
use translicator::applier::{ApplierOptions, Translicator};
use translicator::TransformEngine;

use crate::support::{insert_change, MockReplicaWriter};

fn options() -> ApplierOptions {
    ApplierOptions {
        batch_size: 4,
        flush_interval: std::time::Duration::from_secs(3600),
        skip_transform_errors: false,
        retry: RetryConfig::default(),
    }
}

// Crash with checkpoint at 0/30 while the primary has advanced to 0/50:
// the restarted applier resumes strictly after the checkpoint and ends
// at 0/50 with no re-applied rows.
#[tokio::test]
async fn restart_resumes_from_checkpoint() {
    let mut buffer = MemoryBuffer::new();
    let state = MemoryStateStore::new();

    for (pos, id) in [("0/10", 1), ("0/20", 2), ("0/30", 3)] {
        buffer.publish(&insert_change(pos, "users", id, "x")).await.unwrap();
    }

    // first run applies everything so far and flushes
    {
        let writer = MockReplicaWriter::new();
        let mut applier = Translicator::new(
            buffer.clone(),
            state.clone(),
            writer,
            Arc::new(PostgresDialect),
            TransformEngine::empty(),
            options(),
        );
        let (_handle, mut token) = cancel_pair();
        applier.drain(&mut token).await.unwrap();
        applier.flush_checkpoint().await.unwrap();
        assert_eq!(applier.checkpoint(), Some("0/30"));
    }

    // primary advances while the applier is down
    for (pos, id) in [("0/40", 4), ("0/50", 5)] {
        buffer.publish(&insert_change(pos, "users", id, "y")).await.unwrap();
    }

    // restarted applier reads the durable checkpoint and continues
    let writer = MockReplicaWriter::new();
    let mut applier = Translicator::new(
        buffer,
        state.clone(),
        writer.clone(),
        Arc::new(PostgresDialect),
        TransformEngine::empty(),
        options(),
    );
    applier.init().await.unwrap();
    assert_eq!(applier.checkpoint(), Some("0/30"));
    let (_handle, mut token) = cancel_pair();
    applier.drain(&mut token).await.unwrap();
    applier.flush_checkpoint().await.unwrap();

    let statements = writer.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].contains("VALUES (4"));
    assert!(statements[1].contains("VALUES (5"));

    let mut state = state;
    assert_eq!(state.load_checkpoint().await.unwrap().as_deref(), Some("0/50"));
}

// The flushed checkpoint never regresses across runs.
#[tokio::test]
async fn checkpoint_is_monotonic_across_restarts() {
    let mut buffer = MemoryBuffer::new();
    let state = MemoryStateStore::new();

    buffer.publish(&insert_change("0/10", "t", 1, "a")).await.unwrap();
    let mut checkpoints = Vec::new();
    for _ in 0..3 {
        let writer = MockReplicaWriter::new();
        let mut applier = Translicator::new(
            buffer.clone(),
            state.clone(),
            writer,
            Arc::new(PostgresDialect),
            TransformEngine::empty(),
            options(),
        );
        applier.init().await.unwrap();
        let (_handle, mut token) = cancel_pair();
        applier.drain(&mut token).await.unwrap();
        applier.flush_checkpoint().await.unwrap();
        let mut state = state.clone();
        if let Some(cp) = state.load_checkpoint().await.unwrap() {
            checkpoints.push(score(&cp).unwrap());
        }
    }
    for pair in checkpoints.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
}
