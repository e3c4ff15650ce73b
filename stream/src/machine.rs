//! The three-state bootstrap/stream machine.
//!
//! ```text
//!         StartBootstrap                  CompleteBootstrap
//!   WAITING ───────────► ACCUMULATING ───────────► STREAMING
//!      ▲                      │                         │
//!      └──────── reset ───────┴─────────────────────────┘
//! ```
//!
//! Transitions are serialized by a mutex and the new record is written
//! durably before the caller gets an answer; anything else is WrongState.

use tokio::sync::Mutex;
use tracing::info;

use buffer::{StateStore, StreamPhase, StreamState};
use common::err::{KResult, KashoError};

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub prev: StreamPhase,
    pub curr: StreamPhase,
}

impl Transition {
    pub fn ready_to_stream(&self) -> bool {
        self.curr == StreamPhase::Streaming
    }
}

pub struct StreamStateMachine<S: StateStore> {
    inner: Mutex<Inner<S>>,
}

struct Inner<S: StateStore> {
    store: S,
    state: StreamState,
}

impl<S: StateStore> StreamStateMachine<S> {
    /// Load the persisted record, initializing `{WAITING, ""}` on first
    /// boot.
    pub async fn load_or_init(mut store: S) -> KResult<Self> {
        let state = match store.load_state().await? {
            Some(state) => state,
            None => {
                let state = StreamState::initial();
                store.save_state(&state).await?;
                state
            }
        };
        info!(state = %state.state, start_position = %state.start_position, "stream state loaded");
        Ok(StreamStateMachine {
            inner: Mutex::new(Inner { store, state }),
        })
    }

    pub async fn current(&self) -> StreamState {
        self.inner.lock().await.state.clone()
    }

    /// WAITING -> ACCUMULATING, recording where the replication stream
    /// starts.
    pub async fn start_bootstrap(&self, start_position: &str) -> KResult<Transition> {
        let mut inner = self.inner.lock().await;
        if inner.state.state != StreamPhase::Waiting {
            return Err(KashoError::wrong_state("WAITING", inner.state.state));
        }
        let prev = inner.state.state;
        let next = StreamState {
            state: StreamPhase::Accumulating,
            start_position: start_position.to_string(),
        };
        inner.store.save_state(&next).await?;
        inner.state = next;
        info!(start_position, "bootstrap started");
        Ok(Transition {
            prev,
            curr: StreamPhase::Accumulating,
        })
    }

    /// ACCUMULATING -> STREAMING.
    pub async fn complete_bootstrap(&self) -> KResult<Transition> {
        let mut inner = self.inner.lock().await;
        if inner.state.state != StreamPhase::Accumulating {
            return Err(KashoError::wrong_state("ACCUMULATING", inner.state.state));
        }
        let prev = inner.state.state;
        let next = StreamState {
            state: StreamPhase::Streaming,
            start_position: inner.state.start_position.clone(),
        };
        inner.store.save_state(&next).await?;
        inner.state = next;
        info!("bootstrap complete, streaming to subscribers");
        Ok(Transition {
            prev,
            curr: StreamPhase::Streaming,
        })
    }

    /// Any state -> WAITING; operator reset or unrecoverable failure.
    pub async fn reset(&self) -> KResult<Transition> {
        let mut inner = self.inner.lock().await;
        let prev = inner.state.state;
        let next = StreamState::initial();
        inner.store.save_state(&next).await?;
        inner.state = next;
        info!(from = %prev, "state reset to WAITING");
        Ok(Transition {
            prev,
            curr: StreamPhase::Waiting,
        })
    }
}
