//! Connection state machine: public surface.
//!
//! The state machine itself runs inside the client's event loop
//! ([`manager`]). This module defines its states and events, the snapshot
//! the loop publishes after every transition, and the [`Connection`] handle
//! applications use to observe and drive it.
//!
//! # States
//!
//! ```text
//! INITIALIZED -> CONNECTING -> CONNECTED <-> DISCONNECTED -> SUSPENDED
//!                     any -> CLOSING -> CLOSED        any -> FAILED
//! ```
//!
//! CONNECTED is the only state in which frames are transmitted.

pub(crate) mod manager;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ErrorInfo, Result};
use crate::events::{EmitterOptions, EventEmitter, ListenerId, Subjects};
use crate::protocol::ConnectionDetails;

pub(crate) use manager::{request, Command};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, never connected.
    #[default]
    Initialized,
    /// Obtaining credentials or opening a transport.
    Connecting,
    /// Transport open and accepted. Frames flow.
    Connected,
    /// Transport lost; a retry is scheduled.
    Disconnected,
    /// Retries exhausted; retrying at the longer suspended interval.
    Suspended,
    /// Close requested, waiting for the service to confirm.
    Closing,
    /// Closed on request. No further retries.
    Closed,
    /// Unrecoverable error. Terminal.
    Failed,
}

impl ConnectionState {
    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject of connection events: one per state, plus `Update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Entered INITIALIZED.
    Initialized,
    /// Entered CONNECTING.
    Connecting,
    /// Entered CONNECTED.
    Connected,
    /// Entered DISCONNECTED.
    Disconnected,
    /// Entered SUSPENDED.
    Suspended,
    /// Entered CLOSING.
    Closing,
    /// Entered CLOSED.
    Closed,
    /// Entered FAILED.
    Failed,
    /// Connection details changed while CONNECTED (e.g. after re-authentication).
    Update,
}

impl ConnectionEvent {
    /// Parse a lower-case event name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "initialized" => Self::Initialized,
            "connecting" => Self::Connecting,
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "suspended" => Self::Suspended,
            "closing" => Self::Closing,
            "closed" => Self::Closed,
            "failed" => Self::Failed,
            "update" => Self::Update,
            _ => return None,
        })
    }
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => Self::Initialized,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Disconnected => Self::Disconnected,
            ConnectionState::Suspended => Self::Suspended,
            ConnectionState::Closing => Self::Closing,
            ConnectionState::Closed => Self::Closed,
            ConnectionState::Failed => Self::Failed,
        }
    }
}

/// Payload of every connection event.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    /// State before the change.
    pub previous: ConnectionState,
    /// State after the change.
    pub current: ConnectionState,
    /// Event emitted.
    pub event: ConnectionEvent,
    /// Why the change happened.
    pub reason: Option<ErrorInfo>,
    /// Delay before the next connection attempt, when one is scheduled.
    pub retry_in: Option<Duration>,
}

/// What the event loop publishes after every transition.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionSnapshot {
    pub(crate) state: ConnectionState,
    pub(crate) id: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) details: Option<ConnectionDetails>,
}

/// State shared between the event loop and [`Connection`] handles.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    snapshot: Mutex<ConnectionSnapshot>,
    pub(crate) emitter: EventEmitter<ConnectionEvent, ConnectionStateChange>,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: Mutex::new(ConnectionSnapshot::default()),
            emitter: EventEmitter::with_options(EmitterOptions {
                coerce: Some(ConnectionEvent::from_name),
                safe_by_default: true,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> MutexGuard<'_, ConnectionSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the client's connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) shared: Arc<ConnectionShared>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot().state
    }

    /// Service-assigned connection id, once connected.
    pub fn id(&self) -> Option<String> {
        self.shared.snapshot().id.clone()
    }

    /// Resume key, once connected.
    pub fn key(&self) -> Option<String> {
        self.shared.snapshot().key.clone()
    }

    /// Reason for the last failure or disconnection.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot().error_reason.clone()
    }

    /// Parameters announced by the service in the last CONNECTED frame.
    pub fn details(&self) -> Option<ConnectionDetails> {
        self.shared.snapshot().details.clone()
    }

    /// Start connecting now. Ignored while CONNECTING, CONNECTED or FAILED.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the connection and wait for the service to confirm.
    ///
    /// Queued publishes fail. Further retries are cancelled.
    pub async fn close(&self) -> Result<()> {
        request(&self.commands, |reply| Command::Close { reply }).await
    }

    /// Round-trip a heartbeat. Requires CONNECTED.
    pub async fn ping(&self) -> Result<Duration> {
        request(&self.commands, |reply| Command::Ping { reply }).await
    }

    /// Register a persistent listener.
    pub fn on<F>(&self, events: impl Into<Subjects<ConnectionEvent>>, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared.emitter.on(events, handler)
    }

    /// Register a one-shot listener.
    pub fn once<F>(&self, events: impl Into<Subjects<ConnectionEvent>>, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared.emitter.once(events, handler)
    }

    /// Remove listeners; see [`EventEmitter::off`].
    pub fn off(&self, events: Option<Subjects<ConnectionEvent>>, listener: Option<ListenerId>) {
        self.shared.emitter.off(events, listener);
    }

    /// Event emitter, for the full registration API.
    pub fn emitter(&self) -> &EventEmitter<ConnectionEvent, ConnectionStateChange> {
        &self.shared.emitter
    }

    /// Wait until the connection is in `target`.
    ///
    /// Returns immediately if it already is. Fails with the reason if the
    /// connection reaches FAILED first (unless FAILED is the target).
    pub async fn when_state(&self, target: ConnectionState) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.shared.emitter.on(Subjects::All, move |change: &ConnectionStateChange| {
            if change.current == target || change.current == ConnectionState::Failed {
                let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(change.clone());
                }
            }
        });

        let current = self.shared.snapshot().clone();
        let outcome = if current.state == target {
            Ok(())
        } else if current.state == ConnectionState::Failed {
            Err(failed_error(current.error_reason))
        } else {
            match rx.await {
                Ok(change) if change.current == target => Ok(()),
                Ok(change) => Err(failed_error(change.reason)),
                Err(_) => Err(Error::Closed),
            }
        };
        self.shared.emitter.off_listener(id);
        outcome
    }
}

fn failed_error(reason: Option<ErrorInfo>) -> Error {
    Error::Connection(reason.unwrap_or_else(|| {
        ErrorInfo::new(crate::error::codes::CONNECTION_FAILED, Some(400), "connection failed")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_state_and_name() {
        assert_eq!(
            ConnectionEvent::from(ConnectionState::Suspended),
            ConnectionEvent::Suspended
        );
        assert_eq!(ConnectionEvent::from_name("update"), Some(ConnectionEvent::Update));
        assert_eq!(ConnectionEvent::from_name("bogus"), None);
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }

    #[test]
    fn test_named_listener_registration() {
        let shared = ConnectionShared::new();
        shared.emitter.on_named(&["connected", "failed"], |_| {}).unwrap();
        assert_eq!(shared.emitter.listener_count(&ConnectionEvent::Connected), 1);
        assert_eq!(shared.emitter.listener_count(&ConnectionEvent::Closed), 0);
    }
}
