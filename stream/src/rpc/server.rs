use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use buffer::{ChangeSource, StateStore, StreamPhase};
use common::cancel::CancelToken;
use common::change::Change;
use common::err::{KResult, KashoError};
use common::position::score;

use crate::machine::{StreamStateMachine, Transition};
use crate::rpc::{read_frame, write_frame, Request, Response, StatusReply, TransitionReply};
use crate::service::{PhaseSignal, ServerShared};

/// Fallback poll cadence for stream tails; the pub/sub wakeup makes this
/// a rarity.
const TAIL_POLL: std::time::Duration = std::time::Duration::from_millis(500);

pub struct RpcServer<S: StateStore, B> {
    machine: Arc<StreamStateMachine<S>>,
    buffer: B,
    shared: Arc<ServerShared>,
    phase_tx: watch::Sender<PhaseSignal>,
    batch_size: usize,
}

impl<S, B> RpcServer<S, B>
where
    S: StateStore + Send + 'static,
    B: ChangeSource + Clone + Send + Sync + 'static,
{
    pub fn new(
        machine: Arc<StreamStateMachine<S>>,
        buffer: B,
        shared: Arc<ServerShared>,
        phase_tx: watch::Sender<PhaseSignal>,
        batch_size: usize,
    ) -> Self {
        RpcServer {
            machine,
            buffer,
            shared,
            phase_tx,
            batch_size,
        }
    }

    pub async fn serve(self, bind: &str, cancel: CancelToken) -> KResult<()> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| KashoError::Connection(format!("rpc bind {}: {}", bind, e)))?;
        info!(%bind, "rpc listening");
        self.serve_on(listener, cancel).await
    }

    pub async fn serve_on(self, listener: TcpListener, mut cancel: CancelToken) -> KResult<()> {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (socket, peer) = accepted
                        .map_err(|e| KashoError::TransientIo(format!("rpc accept: {}", e)))?;
                    debug!(%peer, "rpc client connected");
                    let this = this.clone();
                    let client_cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(socket, client_cancel).await {
                            warn!(%peer, "rpc client failed: {}", e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_client(&self, socket: TcpStream, mut cancel: CancelToken) -> KResult<()> {
        socket.set_nodelay(true).ok();
        let mut stream = BufStream::new(socket);
        loop {
            let request: Option<Request> = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = read_frame(&mut stream) => r?,
            };
            let request = match request {
                Some(request) => request,
                None => return Ok(()), // client hung up
            };

            match request {
                Request::StartBootstrap { start_position } => {
                    let reply = match self.machine.start_bootstrap(&start_position).await {
                        Ok(t) => {
                            self.signal(&t, Some(start_position));
                            Response::Transition(transition_reply(&t))
                        }
                        Err(e) => Response::error(&e),
                    };
                    write_frame(&mut stream, &reply).await?;
                }
                Request::CompleteBootstrap => {
                    let reply = match self.machine.complete_bootstrap().await {
                        Ok(t) => {
                            self.signal(&t, None);
                            Response::Transition(transition_reply(&t))
                        }
                        Err(e) => Response::error(&e),
                    };
                    write_frame(&mut stream, &reply).await?;
                }
                Request::Reset => {
                    let reply = match self.machine.reset().await {
                        Ok(t) => {
                            self.signal(&t, None);
                            Response::Transition(transition_reply(&t))
                        }
                        Err(e) => Response::error(&e),
                    };
                    write_frame(&mut stream, &reply).await?;
                }
                Request::GetStatus => {
                    let state = self.machine.current().await;
                    let reply = Response::Status(StatusReply {
                        state: state.state.to_string(),
                        start_position: state.start_position,
                        current_position: self.shared.position(),
                        accumulated_count: self.shared.accumulated.load(Ordering::Relaxed),
                        connected_clients: self.shared.connected.load(Ordering::Relaxed),
                        uptime_seconds: self.shared.started_at.elapsed().as_secs(),
                    });
                    write_frame(&mut stream, &reply).await?;
                }
                Request::StreamChanges { from_position } => {
                    // streaming takes over the connection until the
                    // client disconnects
                    self.shared.connected.fetch_add(1, Ordering::Relaxed);
                    let result = self
                        .stream_changes(&mut stream, &from_position, &mut cancel)
                        .await;
                    self.shared.connected.fetch_sub(1, Ordering::Relaxed);
                    return result;
                }
            }
        }
    }

    fn signal(&self, transition: &Transition, start: Option<String>) {
        let _ = self.phase_tx.send(PhaseSignal {
            phase: transition.curr,
            start,
        });
    }

    /// Emit every buffered change strictly after `from_position`, in
    /// score order, forever. Blocks while the machine is not STREAMING.
    /// The subscription is only a wakeup; ordering always comes from
    /// `range_after`.
    async fn stream_changes(
        &self,
        stream: &mut BufStream<TcpStream>,
        from_position: &str,
        cancel: &mut CancelToken,
    ) -> KResult<()> {
        if !from_position.is_empty() {
            // positions are opaque to clients but must be scoreable here
            score(from_position)?;
        }

        self.wait_until_streaming(cancel).await?;

        let mut buffer = self.buffer.clone();
        let mut wakeup = buffer.subscribe().await?;
        let mut cursor = from_position.to_string();

        loop {
            // catch-up: drain everything currently above the cursor
            loop {
                let batch = buffer.range_after(&cursor, self.batch_size).await?;
                if batch.is_empty() {
                    break;
                }
                for payload in batch {
                    let change = Change::from_json(&payload)?;
                    cursor = change.position.clone();
                    write_frame(stream, &Response::Change { change }).await?;
                }
            }

            // wait for the next publish (or poll as a safety net)
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = futures_util::StreamExt::next(&mut wakeup) => {}
                _ = tokio::time::sleep(TAIL_POLL) => {}
            }
        }
    }

    async fn wait_until_streaming(&self, cancel: &mut CancelToken) -> KResult<()> {
        let mut phase_rx = self.phase_tx.subscribe();
        loop {
            if phase_rx.borrow_and_update().phase == StreamPhase::Streaming {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(KashoError::TransientIo("server shutting down".into()))
                }
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        return Err(KashoError::TransientIo("server shutting down".into()));
                    }
                }
            }
        }
    }
}

fn transition_reply(t: &Transition) -> TransitionReply {
    TransitionReply {
        prev: t.prev.to_string(),
        curr: t.curr.to_string(),
        ready_to_stream: t.ready_to_stream(),
    }
}
