//! Server lifecycle state machine.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Where the server is in its life.
///
/// States only move forward: `Starting → Ready → Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Configuration is being validated and the route table compiled.
    Starting,
    /// Accepting connections and serving requests.
    Ready,
    /// No longer accepting; in-flight requests are finishing.
    Draining,
    /// Every connection is closed.
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        }
    }

    fn can_become(self, next: ServerState) -> bool {
        matches!(
            (self, next),
            (ServerState::Starting, ServerState::Ready)
                | (ServerState::Ready, ServerState::Draining)
                | (ServerState::Draining, ServerState::Stopped)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable lifecycle state.
///
/// Cloning gives another handle on the same state. Connection tasks
/// subscribe to learn when draining begins.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<ServerState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServerState::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Moves to `next` if that is the legal successor of the current state.
    /// Returns whether the transition happened.
    pub fn advance(&self, next: ServerState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.can_become(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            info!(from = %from, to = %next, "server state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }
}

/// Resolves once `rx` reports draining (or later), or its sender is gone.
pub(crate) async fn draining(rx: &mut watch::Receiver<ServerState>) {
    let _ = rx.wait_for(|state| *state >= ServerState::Draining).await;
}
