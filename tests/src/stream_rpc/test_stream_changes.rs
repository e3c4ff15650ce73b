use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use buffer::mem::{MemoryBuffer, MemoryStateStore};
use buffer::{ChangeSink, StreamPhase};
use common::cancel::{cancel_pair, CancelHandle};
use common::position::score;
use stream::machine::StreamStateMachine;
use stream::rpc::{RpcClient, RpcServer};
use stream::service::{PhaseSignal, ServerShared};

use crate::support::insert_change;

struct Harness {
    addr: SocketAddr,
    #[allow(dead_code)]
    machine: Arc<StreamStateMachine<MemoryStateStore>>,
    _cancel: CancelHandle,
}

async fn spawn_server(buffer: MemoryBuffer) -> Harness {
    let machine = Arc::new(
        StreamStateMachine::load_or_init(MemoryStateStore::new())
            .await
            .unwrap(),
    );
    let (phase_tx, _phase_rx) = watch::channel(PhaseSignal {
        phase: StreamPhase::Waiting,
        start: None,
    });
    let server = RpcServer::new(
        machine.clone(),
        buffer,
        Arc::new(ServerShared::new()),
        phase_tx,
        16,
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (cancel, token) = cancel_pair();
    tokio::spawn(server.serve_on(listener, token));
    Harness {
        addr,
        machine,
        _cancel: cancel,
    }
}

#[tokio::test]
async fn transitions_gate_by_state() {
    let harness = spawn_server(MemoryBuffer::new()).await;
    let addr = harness.addr.to_string();

    let mut client = RpcClient::connect(&addr).await.unwrap();

    // CompleteBootstrap in WAITING is rejected without a transition
    assert!(client.complete_bootstrap().await.is_err());

    let reply = client.start_bootstrap("0/100").await.unwrap();
    assert_eq!(reply.prev, "WAITING");
    assert_eq!(reply.curr, "ACCUMULATING");
    assert!(!reply.ready_to_stream);

    // a second StartBootstrap is rejected
    assert!(client.start_bootstrap("0/200").await.is_err());

    let reply = client.complete_bootstrap().await.unwrap();
    assert_eq!(reply.curr, "STREAMING");
    assert!(reply.ready_to_stream);

    // operator reset returns to WAITING from anywhere
    let reply = client.reset().await.unwrap();
    assert_eq!(reply.prev, "STREAMING");
    assert_eq!(reply.curr, "WAITING");
}

#[tokio::test]
async fn status_reports_the_surface_fields() {
    let harness = spawn_server(MemoryBuffer::new()).await;
    let mut client = RpcClient::connect(&harness.addr.to_string()).await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.state, "WAITING");
    assert_eq!(status.start_position, "");
    assert_eq!(status.connected_clients, 0);

    client.start_bootstrap("0/100").await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.state, "ACCUMULATING");
    assert_eq!(status.start_position, "0/100");
}

#[tokio::test]
async fn stream_changes_blocks_until_streaming() {
    let mut buffer = MemoryBuffer::new();
    buffer
        .publish(&insert_change("0/10", "users", 1, "Alice"))
        .await
        .unwrap();
    let harness = spawn_server(buffer).await;
    let addr = harness.addr.to_string();

    let subscriber = RpcClient::connect(&addr).await.unwrap();
    let mut changes = subscriber.stream_changes("").await.unwrap();

    // nothing flows while the machine is WAITING
    let blocked =
        tokio::time::timeout(Duration::from_millis(200), changes.next_change()).await;
    assert!(blocked.is_err());

    let mut operator = RpcClient::connect(&addr).await.unwrap();
    operator.start_bootstrap("0/100").await.unwrap();
    operator.complete_bootstrap().await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), changes.next_change())
        .await
        .expect("stream unblocked after STREAMING")
        .unwrap()
        .expect("one change");
    assert_eq!(change.position, "0/10");
}

#[tokio::test]
async fn stream_changes_is_strictly_ordered_and_exclusive() {
    let mut buffer = MemoryBuffer::new();
    // publish out of order; the stream must come back score-ordered
    for pos in ["0/30", "0/10", "0/50", "0/20", "0/40"] {
        buffer
            .publish(&insert_change(pos, "users", 1, "x"))
            .await
            .unwrap();
    }
    let harness = spawn_server(buffer.clone()).await;
    let addr = harness.addr.to_string();

    let mut operator = RpcClient::connect(&addr).await.unwrap();
    operator.start_bootstrap("0/100").await.unwrap();
    operator.complete_bootstrap().await.unwrap();

    let subscriber = RpcClient::connect(&addr).await.unwrap();
    let mut changes = subscriber.stream_changes("0/20").await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let change = tokio::time::timeout(Duration::from_secs(2), changes.next_change())
            .await
            .expect("change within deadline")
            .unwrap()
            .expect("change");
        seen.push(change.position);
    }
    assert_eq!(seen, vec!["0/30", "0/40", "0/50"]);

    // a late publish still arrives, in order, after the catch-up
    let mut buffer = buffer;
    buffer
        .publish(&insert_change("0/60", "users", 9, "late"))
        .await
        .unwrap();
    let change = tokio::time::timeout(Duration::from_secs(2), changes.next_change())
        .await
        .expect("live change")
        .unwrap()
        .expect("change");
    assert_eq!(change.position, "0/60");

    // nothing emitted was <= from_position or out of order
    let mut last = score("0/20").unwrap();
    for pos in seen.iter().chain(std::iter::once(&change.position)) {
        let s = score(pos).unwrap();
        assert!(s > last);
        last = s;
    }
}
