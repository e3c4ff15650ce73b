//! The change-stream service: one capture loop owning the replication
//! driver, one RPC listener fanning out to clients. The two halves share
//! the state machine, the buffer and a phase watch channel; nothing else.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use buffer::{ChangeSink, ChangeSource, StateStore, StreamPhase};
use common::cancel::CancelToken;
use common::config::RetryConfig;
use common::err::KResult;
use common::retry::Backoff;

use crate::capture::ReplicationDriver;
use crate::machine::StreamStateMachine;
use crate::rpc::RpcServer;

/// How often WAITING probes the primary for its slot / binlog.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind: String,
    pub batch_size: usize,
    pub retry: RetryConfig,
}

/// Phase changes pushed from the RPC half to the capture half. `start`
/// carries the operator-provided position on a fresh StartBootstrap;
/// restart recovery leaves it empty so the driver resumes from the
/// slot's own confirmed position.
#[derive(Debug, Clone)]
pub struct PhaseSignal {
    pub phase: StreamPhase,
    pub start: Option<String>,
}

/// Counters surfaced by GetStatus.
pub struct ServerShared {
    pub started_at: Instant,
    pub accumulated: AtomicU64,
    pub connected: AtomicU32,
    pub current_position: std::sync::RwLock<String>,
}

impl ServerShared {
    pub fn new() -> Self {
        ServerShared {
            started_at: Instant::now(),
            accumulated: AtomicU64::new(0),
            connected: AtomicU32::new(0),
            current_position: std::sync::RwLock::new(String::new()),
        }
    }

    pub fn set_position(&self, position: &str) {
        if let Ok(mut p) = self.current_position.write() {
            *p = position.to_string();
        }
    }

    pub fn position(&self) -> String {
        self.current_position
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl Default for ServerShared {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChangeStreamServer<S, B, D>
where
    S: StateStore + Send + 'static,
    B: ChangeSink + ChangeSource + Clone + Send + Sync + 'static,
    D: ReplicationDriver,
{
    machine: Arc<StreamStateMachine<S>>,
    buffer: B,
    driver: D,
    options: ServerOptions,
    shared: Arc<ServerShared>,
    phase_tx: watch::Sender<PhaseSignal>,
    phase_rx: watch::Receiver<PhaseSignal>,
}

impl<S, B, D> ChangeStreamServer<S, B, D>
where
    S: StateStore + Send + 'static,
    B: ChangeSink + ChangeSource + Clone + Send + Sync + 'static,
    D: ReplicationDriver,
{
    pub async fn new(store: S, buffer: B, driver: D, options: ServerOptions) -> KResult<Self> {
        let machine = Arc::new(StreamStateMachine::load_or_init(store).await?);
        let initial = machine.current().await;
        let (phase_tx, phase_rx) = watch::channel(PhaseSignal {
            phase: initial.state,
            start: None,
        });
        Ok(ChangeStreamServer {
            machine,
            buffer,
            driver,
            options,
            shared: Arc::new(ServerShared::new()),
            phase_tx,
            phase_rx,
        })
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        self.shared.clone()
    }

    /// Serve until cancelled: RPC listener in a task, capture loop here.
    pub async fn run(mut self, mut cancel: CancelToken) -> KResult<()> {
        let rpc = RpcServer::new(
            self.machine.clone(),
            self.buffer.clone(),
            self.shared.clone(),
            self.phase_tx.clone(),
            self.options.batch_size,
        );
        let bind = self.options.bind.clone();
        let rpc_cancel = cancel.clone();
        let rpc_task = tokio::spawn(async move { rpc.serve(&bind, rpc_cancel).await });

        let result = self.capture_loop(&mut cancel).await;

        rpc_task.abort();
        let _ = rpc_task.await;
        result
    }

    async fn capture_loop(&mut self, cancel: &mut CancelToken) -> KResult<()> {
        let mut driver_running = false;
        let mut backoff = Backoff::new(&self.options.retry);
        let mut phase_rx = self.phase_rx.clone();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let signal = phase_rx.borrow_and_update().clone();
            match signal.phase {
                StreamPhase::Waiting => {
                    driver_running = false;
                    match self.driver.probe().await {
                        Ok(found) => {
                            if found {
                                info!("replication source provisioned, awaiting StartBootstrap");
                            }
                            backoff.reset();
                        }
                        Err(e) => warn!("primary probe failed: {}", e),
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = phase_rx.changed() => {}
                        _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                    }
                }
                StreamPhase::Accumulating | StreamPhase::Streaming => {
                    if !driver_running {
                        // a reconnect resumes from wherever this driver
                        // already got to; only a fresh bootstrap uses the
                        // operator-provided position
                        let resume = self.driver.current_position();
                        let start = if resume.is_empty() {
                            signal.start.clone().unwrap_or_default()
                        } else {
                            resume
                        };
                        match self.driver.start(&start).await {
                            Ok(()) => {
                                driver_running = true;
                                backoff.reset();
                            }
                            Err(e) if e.is_transient() => {
                                warn!("replication connect failed, backing off: {}", e);
                                if !backoff.sleep_or_give_up(cancel).await {
                                    return Err(e);
                                }
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    let changes = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        changes = self.driver.next_changes() => changes,
                    };
                    match changes {
                        Ok(changes) => {
                            backoff.reset();
                            let mut last_position = None;
                            for change in &changes {
                                self.buffer.publish(change).await?;
                                self.shared.accumulated.fetch_add(1, Ordering::Relaxed);
                                last_position = Some(change.position.clone());
                            }
                            // ack only after everything is in the buffer
                            if let Some(position) = last_position {
                                self.driver.ack(&position).await?;
                            }
                            self.shared.set_position(&self.driver.current_position());
                        }
                        Err(e) if e.is_transient() => {
                            warn!("capture interrupted, reconnecting: {}", e);
                            driver_running = false;
                            if !backoff.sleep_or_give_up(cancel).await {
                                return Err(e);
                            }
                        }
                        Err(e) => {
                            error!("capture failed: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

