use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

/// Cooperative shutdown signal. Clones observe the same state.
///
/// Cancelling closes an internal channel, which wakes every thread parked in
/// [`CancelToken::sleep`] immediately.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    closer: Arc<Mutex<Option<Sender<()>>>>,
    wake: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            closer: Arc::new(Mutex::new(Some(tx))),
            wake: rx,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns false if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => true,
            _ => !self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
