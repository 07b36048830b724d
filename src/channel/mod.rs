//! Channel state machine: public surface.
//!
//! A channel is created lazily by [`Channels::get`](crate::Channels::get)
//! and lives in the client's event loop as a [`machine::ChannelMachine`].
//! The [`Channel`] handle sends it commands and reads the snapshot it
//! publishes after every transition.
//!
//! # States
//!
//! ```text
//! INITIALIZED -> ATTACHING -> ATTACHED <-> DETACHING -> DETACHED
//!                    SUSPENDED (connection suspended, attach timeout)
//!                    FAILED    (denied, retries exhausted, connection failed)
//! ```
//!
//! A channel is never ATTACHED unless the connection is CONNECTED.
//!
//! Rust guideline compliant 2026-02

pub(crate) mod machine;
pub mod presence;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::config::ChannelOptions;
use crate::connection::{request, Command};
use crate::error::{codes, Error, ErrorInfo, Result};
use crate::events::{EmitterOptions, EventEmitter, ListenerId, Subjects};
use crate::message::{Message, Publishable};
use crate::rest::{HistoryParams, Rest};

pub use self::presence::Presence;
use self::presence::PresenceShared;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Created, never attached.
    #[default]
    Initialized,
    /// ATTACH requested or pending a connection.
    Attaching,
    /// Attached; messages flow.
    Attached,
    /// DETACH sent.
    Detaching,
    /// Detached.
    Detached,
    /// Connection suspended or attach timed out; re-attaches automatically.
    Suspended,
    /// Denied or unrecoverable. Re-attach explicitly to recover.
    Failed,
}

impl ChannelState {
    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject of channel events: one per state, plus `Update` and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// Entered INITIALIZED.
    Initialized,
    /// Entered ATTACHING.
    Attaching,
    /// Entered ATTACHED.
    Attached,
    /// Entered DETACHING.
    Detaching,
    /// Entered DETACHED.
    Detached,
    /// Entered SUSPENDED.
    Suspended,
    /// Entered FAILED.
    Failed,
    /// Attachment changed without a state change (e.g. continuity lost).
    Update,
    /// Non-fatal error, such as a message that failed to decode.
    Error,
}

impl ChannelEvent {
    /// Parse a lower-case event name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "initialized" => Self::Initialized,
            "attaching" => Self::Attaching,
            "attached" => Self::Attached,
            "detaching" => Self::Detaching,
            "detached" => Self::Detached,
            "suspended" => Self::Suspended,
            "failed" => Self::Failed,
            "update" => Self::Update,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

impl From<ChannelState> for ChannelEvent {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Initialized => Self::Initialized,
            ChannelState::Attaching => Self::Attaching,
            ChannelState::Attached => Self::Attached,
            ChannelState::Detaching => Self::Detaching,
            ChannelState::Detached => Self::Detached,
            ChannelState::Suspended => Self::Suspended,
            ChannelState::Failed => Self::Failed,
        }
    }
}

/// Payload of every channel event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    /// State before the change.
    pub previous: ChannelState,
    /// State after the change.
    pub current: ChannelState,
    /// Event emitted.
    pub event: ChannelEvent,
    /// Why the change happened.
    pub reason: Option<ErrorInfo>,
    /// Whether message continuity survived a re-attach.
    pub resumed: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelSnapshot {
    pub(crate) state: ChannelState,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) options: ChannelOptions,
}

/// State shared between the event loop and [`Channel`] handles.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    pub(crate) name: String,
    snapshot: Mutex<ChannelSnapshot>,
    pub(crate) emitter: EventEmitter<ChannelEvent, ChannelStateChange>,
    /// Messages keyed by message name.
    pub(crate) messages: EventEmitter<String, Message>,
    pub(crate) presence: PresenceShared,
}

impl ChannelShared {
    pub(crate) fn new(name: &str, options: ChannelOptions) -> Self {
        Self {
            name: name.to_string(),
            snapshot: Mutex::new(ChannelSnapshot {
                options,
                ..ChannelSnapshot::default()
            }),
            emitter: EventEmitter::with_options(EmitterOptions {
                coerce: Some(ChannelEvent::from_name),
                safe_by_default: true,
            }),
            messages: EventEmitter::with_options(EmitterOptions {
                coerce: Some(|name| Some(name.to_string())),
                safe_by_default: true,
            }),
            presence: PresenceShared::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> MutexGuard<'_, ChannelSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn options(&self) -> ChannelOptions {
        self.snapshot().options.clone()
    }
}

/// Handle to one channel. Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    commands: mpsc::UnboundedSender<Command>,
    rest: Rest,
    presence: Presence,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        commands: mpsc::UnboundedSender<Command>,
        rest: Rest,
    ) -> Self {
        let presence = Presence::new(Arc::clone(&shared), commands.clone());
        Self {
            shared,
            commands,
            rest,
            presence,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.shared.snapshot().state
    }

    /// Reason for the last failure or detachment.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot().error_reason.clone()
    }

    /// Current options snapshot.
    pub fn options(&self) -> ChannelOptions {
        self.shared.options()
    }

    /// Replace the options used to encode and decode subsequent messages.
    pub fn set_options(&self, options: ChannelOptions) {
        self.shared.snapshot().options = options;
    }

    /// Presence on this channel.
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Attach, or join the attach already in flight.
    pub async fn attach(&self) -> Result<()> {
        let channel = self.shared.name.clone();
        request(&self.commands, |reply| Command::Attach { channel, reply }).await
    }

    /// Detach, or join the detach already in flight.
    pub async fn detach(&self) -> Result<()> {
        let channel = self.shared.name.clone();
        request(&self.commands, |reply| Command::Detach { channel, reply }).await
    }

    /// Publish one message or a batch. Resolves when the service acknowledges.
    pub async fn publish(&self, messages: impl Into<Publishable>) -> Result<()> {
        let channel = self.shared.name.clone();
        let messages = messages.into().into_messages();
        request(&self.commands, |reply| Command::Publish {
            channel,
            messages,
            reply,
        })
        .await
    }

    /// Subscribe to every message and attach.
    pub async fn subscribe<F>(&self, handler: F) -> Result<ListenerId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.shared.messages.on(Subjects::All, handler);
        self.attach_for_listener(id).await
    }

    /// Subscribe to messages named `name` and attach.
    pub async fn subscribe_to<F>(&self, name: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.shared.messages.on(name.to_string(), handler);
        self.attach_for_listener(id).await
    }

    async fn attach_for_listener(&self, id: ListenerId) -> Result<ListenerId> {
        if let Err(e) = self.attach().await {
            self.shared.messages.off_listener(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Remove one message listener.
    pub fn unsubscribe(&self, listener: ListenerId) {
        self.shared.messages.off_listener(listener);
    }

    /// Remove every message listener.
    pub fn unsubscribe_all(&self) {
        self.shared.messages.off(None, None);
    }

    /// Query message history through the REST client.
    pub async fn history(&self, params: HistoryParams) -> Result<Vec<Message>> {
        self.rest
            .channel_with_options(&self.shared.name, self.options())
            .history(params)
            .await
    }

    /// Register a persistent state listener.
    pub fn on<F>(&self, events: impl Into<Subjects<ChannelEvent>>, handler: F) -> ListenerId
    where
        F: Fn(&ChannelStateChange) + Send + Sync + 'static,
    {
        self.shared.emitter.on(events, handler)
    }

    /// Register a one-shot state listener.
    pub fn once<F>(&self, events: impl Into<Subjects<ChannelEvent>>, handler: F) -> ListenerId
    where
        F: Fn(&ChannelStateChange) + Send + Sync + 'static,
    {
        self.shared.emitter.once(events, handler)
    }

    /// Remove state listeners; see [`EventEmitter::off`].
    pub fn off(&self, events: Option<Subjects<ChannelEvent>>, listener: Option<ListenerId>) {
        self.shared.emitter.off(events, listener);
    }

    /// State event emitter, for the full registration API.
    pub fn emitter(&self) -> &EventEmitter<ChannelEvent, ChannelStateChange> {
        &self.shared.emitter
    }

    /// Wait until the channel is in `target`.
    ///
    /// Fails with the reason if the channel reaches FAILED first (unless
    /// FAILED is the target).
    pub async fn when_state(&self, target: ChannelState) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.shared.emitter.on(Subjects::All, move |change: &ChannelStateChange| {
            if change.current == target || change.current == ChannelState::Failed {
                let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(change.clone());
                }
            }
        });

        let current = self.shared.snapshot().clone();
        let outcome = if current.state == target {
            Ok(())
        } else if current.state == ChannelState::Failed {
            Err(self.failed_error(current.error_reason))
        } else {
            match rx.await {
                Ok(change) if change.current == target => Ok(()),
                Ok(change) => Err(self.failed_error(change.reason)),
                Err(_) => Err(Error::Closed),
            }
        };
        self.shared.emitter.off_listener(id);
        outcome
    }

    fn failed_error(&self, reason: Option<ErrorInfo>) -> Error {
        Error::Channel {
            channel: self.shared.name.clone(),
            info: reason.unwrap_or_else(|| {
                ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), "channel failed")
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(ChannelEvent::from_name("attached"), Some(ChannelEvent::Attached));
        assert_eq!(ChannelEvent::from_name("error"), Some(ChannelEvent::Error));
        assert_eq!(ChannelEvent::from(ChannelState::Failed), ChannelEvent::Failed);
        assert_eq!(ChannelState::Detaching.to_string(), "detaching");
    }

    #[test]
    fn test_shared_snapshot_options() {
        let shared = ChannelShared::new("foo", ChannelOptions::default());
        assert_eq!(shared.snapshot().state, ChannelState::Initialized);
        assert!(shared.options().cipher.is_none());
        shared
            .messages
            .on_named(&["click"], |_| {})
            .unwrap();
        assert_eq!(shared.messages.listener_count(&"click".to_string()), 1);
    }
}
