//! Cooperative cancellation. Every long-running loop holds a
//! `CancelToken` and selects on `cancelled()`; owners signal through the
//! `CancelHandle`. Connections close under their scoped-release paths
//! when the loop unwinds.

use tokio::sync::watch;

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the owning handle cancels or drops.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A token that never fires; for tests and fire-and-forget tools.
    pub fn detached() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        // keep the sender alive forever so the token stays pending
        std::mem::forget(tx);
        CancelToken { rx }
    }
}
