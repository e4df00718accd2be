//! Run/stop flag and reconnect state machine shared by every adapter loop.
//!
//! Loops hold a [`StopWatcher`]: they check it at the top of each iteration and race it
//! against every sleep and blocking read, so `stop()` takes effect at the next await.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    BackingOff,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established,
    Failed,
    BackoffElapsed,
    StopRequested,
}

impl ConnectionState {
    /// Transition table. Events that make no sense in the current state leave it unchanged.
    pub fn next(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;
        match (self, event) {
            (_, StopRequested) => Stopped,
            (Stopped, _) => Stopped,
            (Connecting, Established) => Connected,
            (Connecting | Connected, Failed) => BackingOff,
            (BackingOff, BackoffElapsed) => Connecting,
            (state, _) => state,
        }
    }
}

struct Inner {
    name: String,
    running: watch::Sender<bool>,
    state: Mutex<ConnectionState>,
}

/// Per-channel lifecycle: the running flag plus the current connection state.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                running,
                state: Mutex::new(ConnectionState::Stopped),
            }),
        }
    }

    /// Mark running. Returns false when it already was, so callers can make `start` a no-op.
    pub fn begin(&self) -> bool {
        if self.inner.running.send_replace(true) {
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        true
    }

    /// Clear the running flag and wake every watcher. Returns whether it was running.
    pub fn stop(&self) -> bool {
        let was_running = self.inner.running.send_replace(false);
        self.transition(ConnectionEvent::StopRequested);
        was_running
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = state.next(event);
        if next != *state {
            log::debug!("{}: {:?} -> {:?}", self.inner.name, *state, next);
        }
        *state = next;
        next
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn watcher(&self) -> StopWatcher {
        StopWatcher {
            rx: self.inner.running.subscribe(),
        }
    }
}

/// Receiver side of the running flag, owned by a loop task.
pub struct StopWatcher {
    rx: watch::Receiver<bool>,
}

impl StopWatcher {
    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the channel is stopped (immediately if it already is).
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|running| !*running).await;
    }

    /// Sleep for `dur` unless stopped first. Returns true when the loop should continue.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_running(),
            _ = self.stopped() => false,
        }
    }
}
