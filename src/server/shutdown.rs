//! Process shutdown signalling
//!
//! One `ShutdownHandle` fans out to any number of `ShutdownSignal`s. Dropping
//! the handle counts as a shutdown.

use tokio::sync::watch;

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Ask every signal holder to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&mut self) {
        // Err means the handle is gone
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
