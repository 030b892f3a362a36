//! Playback gate: lets an external controller pause and resume the poll loop.
//!
//! The gate is a binary switch checked once per loop iteration. Closing it
//! never interrupts a dispatch pass or a backoff sleep already in progress;
//! the loop blocks at its next acquisition instead.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// State of the playback gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Open,
}

/// Pause/resume switch shared between the controller and the poll worker.
#[derive(Debug, Clone)]
pub struct PlaybackGate {
    state: Arc<watch::Sender<GateState>>,
}

impl PlaybackGate {
    /// Create a gate in the closed state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Closed);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }

    /// Open the gate. Opening an open gate is a no-op.
    pub fn begin(&self) {
        if self.transition(GateState::Open) {
            debug!("Playback gate opened");
        } else {
            trace!("Playback gate already open");
        }
    }

    /// Close the gate. Closing a closed gate is a no-op.
    pub fn end(&self) {
        if self.transition(GateState::Closed) {
            debug!("Playback gate closed");
        } else {
            trace!("Playback gate already closed");
        }
    }

    /// Wait until the gate is open.
    pub async fn acquire(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == GateState::Open).await;
    }

    fn transition(&self, to: GateState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == to {
                false
            } else {
                *state = to;
                true
            }
        })
    }
}

impl Default for PlaybackGate {
    fn default() -> Self {
        Self::new()
    }
}
