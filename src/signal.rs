use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One-shot signal that wakes every waiter when fired.
///
/// Firing drops the only sender, so pending and future `wait` calls on the
/// receiver return immediately with a disconnect.
#[derive(Debug)]
pub struct CloseSignal {
    fired: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            fired: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Fire the signal; returns false if it had already fired
    pub fn fire(&self) -> bool {
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        self.fired.store(true, Ordering::SeqCst);
        sender.take().is_some()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` or until fired; returns true if the signal fired
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_fired() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_fired(),
        }
    }

    /// Block until fired
    pub fn wait(&self) {
        while !self.is_fired() {
            if self.receiver.recv().is_err() {
                break;
            }
        }
    }
}
