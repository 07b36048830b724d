//! In-process stand-in for the realtime service.
//!
//! [`MockService`] implements [`Transport`]: every `connect` opens a pair of
//! channels and spawns a task that answers client frames the way the
//! service would (CONNECTED, ATTACHED, ACK, message echo, CLOSED...).
//! Tests tweak its behaviour and inject frames through the shared handle.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tether::error::codes;
use tether::protocol::{flags, Action, ConnectionDetails, ProtocolMessage};
use tether::transport::{ConnectParams, TransportEvent, TransportLink};
use tether::{ClientOptions, ErrorInfo, PresenceMessage, Realtime, Result, Transport};
use tokio::sync::mpsc;

/// Token the mock treats as lacking permission on restricted channels.
pub const RESTRICTED_TOKEN: &str = "restricted-token";

#[derive(Debug, Default)]
pub struct ServiceState {
    /// Parameters of every connection attempt.
    pub connects: Vec<ConnectParams>,
    /// Every frame received from the client.
    pub received: Vec<ProtocolMessage>,
    /// Attempts to refuse at the transport level before accepting again.
    pub refuse_connects: u32,
    /// Error sent instead of CONNECTED on the next attempt.
    pub reject_next: Option<ErrorInfo>,
    /// Accept transports but never answer CONNECT.
    pub silent: bool,
    /// Client id announced in CONNECTED.
    pub client_id: Option<String>,
    /// Channels a restricted token may not attach to.
    pub restricted_channels: HashSet<String>,
    /// Channels that refuse every attach with a capability error.
    pub forbidden_channels: HashSet<String>,
    /// Channels whose ATTACH goes unanswered.
    pub ignore_attach: HashSet<String>,
    /// Members reported in the SYNC following ATTACHED, per channel.
    pub presence_members: HashMap<String, Vec<PresenceMessage>>,
    /// Withhold ACKs.
    pub hold_acks: bool,
    /// Echo published messages back to the channel.
    pub echo: bool,
    connection_count: u32,
    current_token: Option<String>,
    link: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Shared handle to the mock service.
#[derive(Debug, Clone)]
pub struct MockService {
    state: Arc<Mutex<ServiceState>>,
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockService {
    pub fn new() -> Self {
        let state = ServiceState {
            echo: true,
            ..ServiceState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }

    /// Client frames with `action`, optionally for one channel.
    pub fn received(&self, action: Action, channel: Option<&str>) -> Vec<ProtocolMessage> {
        self.state()
            .received
            .iter()
            .filter(|f| f.action == action)
            .filter(|f| channel.is_none() || f.channel.as_deref() == channel)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects.len()
    }

    /// Push a frame to the client on the current transport.
    pub fn inject(&self, frame: ProtocolMessage) {
        if let Some(link) = &self.state().link {
            let _ = link.send(TransportEvent::Frame(frame));
        }
    }

    /// Simulate network loss.
    pub fn drop_transport(&self) {
        if let Some(link) = self.state().link.take() {
            let _ = link.send(TransportEvent::Closed { reason: None });
        }
    }

    /// ACK every publish received so far.
    pub fn ack_all(&self) {
        let serials: Vec<u64> = self
            .state()
            .received
            .iter()
            .filter(|f| f.ack_required())
            .filter_map(|f| f.msg_serial)
            .collect();
        for serial in serials {
            let mut ack = ProtocolMessage::new(Action::Ack);
            ack.msg_serial = Some(serial);
            ack.count = Some(1);
            self.inject(ack);
        }
    }

    /// Build a client on this service with `auto_connect` off.
    pub fn client(&self, options: ClientOptions) -> Realtime {
        Realtime::with_transport(options, Arc::new(self.clone())).unwrap()
    }
}

/// Key-authenticated options with short timeouts, not auto-connecting.
pub fn options() -> ClientOptions {
    ClientOptions {
        auto_connect: false,
        disconnected_retry_timeout: Duration::from_millis(200),
        suspended_retry_timeout: Duration::from_millis(500),
        channel_retry_timeout: Duration::from_millis(200),
        realtime_request_timeout: Duration::from_millis(500),
        ..ClientOptions::with_key("app.key:secret")
    }
}

#[async_trait]
impl Transport for MockService {
    async fn connect(&self, params: &ConnectParams) -> Result<TransportLink> {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let first = {
            let mut state = self.state();
            state.connects.push(params.clone());
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(tether::Error::Transport("connection refused".to_string()));
            }
            state.current_token = params.param("access_token").map(str::to_string);
            state.link = Some(server_tx.clone());
            if state.silent {
                None
            } else if let Some(error) = state.reject_next.take() {
                let mut frame = ProtocolMessage::new(Action::Error);
                frame.error = Some(error);
                Some(frame)
            } else {
                Some(connected_frame(&mut state, params))
            }
        };
        if let Some(frame) = first {
            let _ = server_tx.send(TransportEvent::Frame(frame));
        }

        tokio::spawn(serve(self.clone(), client_rx, server_tx));
        Ok(TransportLink {
            sender: client_tx,
            events: server_rx,
        })
    }
}

fn connected_frame(state: &mut ServiceState, params: &ConnectParams) -> ProtocolMessage {
    let resumed = params
        .param("resume")
        .and_then(|key| key.strip_prefix("key-"))
        .map(str::to_string);
    let id = match resumed {
        Some(id) => id,
        None => {
            state.connection_count += 1;
            format!("conn-{}", state.connection_count)
        }
    };
    let mut frame = ProtocolMessage::new(Action::Connected);
    frame.connection_id = Some(id.clone());
    frame.connection_details = Some(ConnectionDetails {
        client_id: state.client_id.clone(),
        connection_key: Some(format!("key-{id}")),
        ..ConnectionDetails::default()
    });
    frame
}

async fn serve(
    service: MockService,
    mut frames: mpsc::UnboundedReceiver<ProtocolMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(frame) = frames.recv().await {
        let replies = {
            let mut state = service.state();
            // Frames on a superseded transport are never answered.
            if !state.link.as_ref().is_some_and(|l| l.same_channel(&events)) {
                return;
            }
            state.received.push(frame.clone());
            respond(&mut state, &frame)
        };
        for reply in replies {
            let _ = events.send(TransportEvent::Frame(reply));
        }
    }
}

fn respond(state: &mut ServiceState, frame: &ProtocolMessage) -> Vec<ProtocolMessage> {
    let channel = frame.channel.clone().unwrap_or_default();
    match frame.action {
        Action::Attach => {
            let restricted = state.current_token.as_deref() == Some(RESTRICTED_TOKEN)
                && state.restricted_channels.contains(&channel);
            if restricted || state.forbidden_channels.contains(&channel) {
                let mut error = ProtocolMessage::for_channel(Action::Error, &channel);
                error.error = Some(ErrorInfo::new(
                    codes::OPERATION_NOT_PERMITTED,
                    Some(401),
                    format!("channel {channel} denied by capability"),
                ));
                return vec![error];
            }
            if state.ignore_attach.contains(&channel) {
                return Vec::new();
            }
            let mut attached = ProtocolMessage::for_channel(Action::Attached, &channel);
            match state.presence_members.get(&channel) {
                Some(members) => {
                    attached.flags = Some(flags::HAS_PRESENCE);
                    let mut sync = ProtocolMessage::for_channel(Action::Sync, &channel);
                    sync.channel_serial = Some("sync-1:".to_string());
                    sync.presence = Some(members.clone());
                    vec![attached, sync]
                }
                None => vec![attached],
            }
        }
        Action::Detach => vec![ProtocolMessage::for_channel(Action::Detached, &channel)],
        Action::Message | Action::Presence => {
            let mut replies = Vec::new();
            if !state.hold_acks {
                let mut ack = ProtocolMessage::new(Action::Ack);
                ack.msg_serial = frame.msg_serial;
                ack.count = Some(1);
                replies.push(ack);
            }
            if state.echo {
                let mut echo = frame.clone();
                let connection = format!("conn-{}", state.connection_count);
                echo.id = Some(format!("{connection}:{}", frame.msg_serial.unwrap_or(0)));
                echo.connection_id = Some(connection);
                echo.msg_serial = None;
                echo.timestamp = Some(1_700_000_000_000);
                replies.push(echo);
            }
            replies
        }
        Action::Heartbeat => vec![frame.clone()],
        Action::Close => vec![ProtocolMessage::new(Action::Closed)],
        Action::Auth => {
            state.current_token = frame.auth.as_ref().map(|a| a.access_token.clone());
            let mut connected = ProtocolMessage::new(Action::Connected);
            let id = format!("conn-{}", state.connection_count);
            connected.connection_id = Some(id.clone());
            connected.connection_details = Some(ConnectionDetails {
                client_id: state.client_id.clone(),
                connection_key: Some(format!("key-{id}")),
                ..ConnectionDetails::default()
            });
            vec![connected]
        }
        _ => Vec::new(),
    }
}
