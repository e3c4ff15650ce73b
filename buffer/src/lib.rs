//! Ordered change buffer. A Redis sorted set under a single well-known
//! key maps monotonic scores (from `common::position::score`) to
//! serialized changes; a companion pub/sub channel carries the same
//! payloads for low-latency wakeup. The stream-state record and the
//! applier checkpoint are colocated in the same store, so a store loss
//! resets the pipeline to WAITING instead of silently misordering.

mod change_buffer;
pub mod mem;
mod state_store;

pub use change_buffer::{BufferKeys, ChangeBuffer};
pub use state_store::{RedisStateStore, StateStore, StreamPhase, StreamState};

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use common::change::Change;
use common::err::KResult;

pub type PayloadStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Producer seam. The capture service and the bootstrap converter write
/// through this; tests collect into memory.
#[async_trait]
pub trait ChangeSink: Send {
    /// Score, serialize, insert, refresh TTL, publish. Returns the score
    /// assigned to the change.
    async fn publish(&mut self, change: &Change) -> KResult<f64>;
}

/// Consumer seam for the applier and the streaming RPC.
#[async_trait]
pub trait ChangeSource: Send {
    /// Serialized entries with score strictly greater than the given
    /// position's, ascending, at most `limit`. An empty position means
    /// "from the beginning".
    async fn range_after(&mut self, position: &str, limit: usize) -> KResult<Vec<String>>;

    /// Payloads published after subscription; no replay. Consumers pair
    /// this with `range_after` catch-up and order by score, not arrival.
    async fn subscribe(&mut self) -> KResult<PayloadStream>;

    /// Evict entries strictly below the given position. Only the
    /// applier calls this, and only for its durably flushed checkpoint;
    /// stores without eviction ignore it.
    async fn trim_below(&mut self, _position: &str) -> KResult<usize> {
        Ok(0)
    }
}
