//! Signals emitted by the client.
//!
//! Uses a tokio broadcast channel so any number of observers can watch for
//! readiness and asynchronous faults.

use std::fmt;

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 256;

/// Observable client signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Topology is declared and buffered operations have been dispatched.
    Ready,
    /// A fault with no caller to return it to.
    Error(Fault),
}

/// Where an asynchronous fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Connection,
    Channel,
    Ack,
    Decode,
    /// A buffered operation failed while being flushed.
    Dispatch,
}

impl FaultKind {
    pub fn reason(&self) -> &'static str {
        match self {
            FaultKind::Connection => "connection error",
            FaultKind::Channel => "channel error",
            FaultKind::Ack => "ack error",
            FaultKind::Decode => "decode error",
            FaultKind::Dispatch => "dispatch error",
        }
    }
}

/// An asynchronous fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.reason(), self.message)
    }
}

/// Sending half shared by the client, its listeners and ack handles.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<ClientEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn ready(&self) {
        debug!("Client ready");
        self.send(ClientEvent::Ready);
    }

    pub fn fault(&self, kind: FaultKind, message: impl Into<String>) {
        let fault = Fault {
            kind,
            message: message.into(),
        };
        warn!(reason = kind.reason(), error = %fault.message, "Client fault");
        self.send(ClientEvent::Error(fault));
    }

    fn send(&self, event: ClientEvent) {
        // No receivers is fine; the fault was already logged.
        let _ = self.sender.send(event);
    }
}
