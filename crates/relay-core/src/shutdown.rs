//! Node-wide shutdown signal
//!
//! One signal fans out to every receive loop, keeper and background worker.

use tokio::sync::watch;

/// The triggering side of the shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a fresh, untriggered signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Trigger shutdown; all listeners wake promptly
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// True once shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A listener handle for a loop or worker
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// The listening side of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once shutdown is triggered
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True once shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}
