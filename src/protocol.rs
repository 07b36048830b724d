//! Realtime protocol frames.
//!
//! Every frame is a [`ProtocolMessage`] tagged with a numeric [`Action`].
//! Frames that carry a `channel` are routed to that channel; the rest drive
//! the connection.

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::message::{Message, PresenceMessage};

/// Frame action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    /// Keepalive, or the reply to a ping.
    Heartbeat,
    /// Publishes up to `msg_serial + count - 1` accepted.
    Ack,
    /// Publishes up to `msg_serial + count - 1` rejected.
    Nack,
    /// Client asks to connect (binary transports only).
    Connect,
    /// Connection established, or updated after re-authentication.
    Connected,
    /// Client asks the service to drop the transport.
    Disconnect,
    /// Service is dropping the transport; the client should reconnect.
    Disconnected,
    /// Client asks to close the connection.
    Close,
    /// Connection closed.
    Closed,
    /// Connection-scope error, or channel-scope if `channel` is set.
    Error,
    /// Attach request.
    Attach,
    /// Attach confirmed, or unsolicited re-attach.
    Attached,
    /// Detach request.
    Detach,
    /// Detach confirmed, or unsolicited detach.
    Detached,
    /// Presence events.
    Presence,
    /// Application messages.
    Message,
    /// Presence sync batch.
    Sync,
    /// In-band token update, in either direction.
    Auth,
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        Ok(match value {
            0 => Self::Heartbeat,
            1 => Self::Ack,
            2 => Self::Nack,
            3 => Self::Connect,
            4 => Self::Connected,
            5 => Self::Disconnect,
            6 => Self::Disconnected,
            7 => Self::Close,
            8 => Self::Closed,
            9 => Self::Error,
            10 => Self::Attach,
            11 => Self::Attached,
            12 => Self::Detach,
            13 => Self::Detached,
            14 => Self::Presence,
            15 => Self::Message,
            16 => Self::Sync,
            17 => Self::Auth,
            other => return Err(format!("unknown protocol action {other}")),
        })
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action as u8
    }
}

/// Bits of [`ProtocolMessage::flags`].
pub mod flags {
    /// ATTACHED: the channel has members, a SYNC follows.
    pub const HAS_PRESENCE: u32 = 1 << 0;
    /// ATTACHED: messages published while detached follow.
    pub const HAS_BACKLOG: u32 = 1 << 1;
    /// ATTACHED: continuity with the previous attachment was preserved.
    pub const RESUMED: u32 = 1 << 2;
}

/// Connection parameters announced by the service in CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Identity the connection is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Key used to resume this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Longest gap between frames, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    /// How long the service keeps connection state after a drop, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Largest accepted message, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
}

/// Token carried by an AUTH frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    /// Token string.
    pub access_token: String,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// Frame action.
    pub action: Action,
    /// Frame id; message ids derive from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Channel position; for SYNC it is `<sync id>:<cursor>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    /// Connection id (CONNECTED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Publish serial (MESSAGE/PRESENCE out, ACK/NACK in).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,
    /// Number of publishes covered by ACK/NACK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// See [`flags`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    /// Service timestamp, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Application messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    /// Presence messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    /// Connection parameters (CONNECTED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    /// Token (AUTH).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

impl ProtocolMessage {
    /// Bare frame.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            msg_serial: None,
            count: None,
            flags: None,
            timestamp: None,
            error: None,
            messages: None,
            presence: None,
            connection_details: None,
            auth: None,
        }
    }

    /// Frame addressed to `channel`.
    pub fn for_channel(action: Action, channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..Self::new(action)
        }
    }

    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }

    /// Whether the frame requires an ACK.
    pub fn ack_required(&self) -> bool {
        matches!(self.action, Action::Message | Action::Presence)
    }

    /// Sync cursor from `channel_serial`. `None` when the sync is complete.
    pub fn sync_cursor(&self) -> Option<&str> {
        let serial = self.channel_serial.as_deref()?;
        let (_, cursor) = serial.split_once(':')?;
        (!cursor.is_empty()).then_some(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_numbering() {
        assert_eq!(u8::from(Action::Heartbeat), 0);
        assert_eq!(u8::from(Action::Connected), 4);
        assert_eq!(u8::from(Action::Attached), 11);
        assert_eq!(u8::from(Action::Auth), 17);
        for n in 0..=17u8 {
            assert_eq!(u8::from(Action::try_from(n).unwrap()), n);
        }
        assert!(Action::try_from(18).is_err());
        assert_eq!(Action::try_from(9), Ok(Action::Error));
    }

    #[test]
    fn test_parse_connected_frame() {
        let json = r#"{
            "action": 4,
            "connectionId": "abc",
            "connectionDetails": {"clientId": "alice", "connectionKey": "abc!key", "maxIdleInterval": 15000}
        }"#;
        let frame: ProtocolMessage = serde_json::from_str(json).unwrap();
        assert_eq!(frame.action, Action::Connected);
        let details = frame.connection_details.unwrap();
        assert_eq!(details.connection_key.as_deref(), Some("abc!key"));
        assert_eq!(details.max_idle_interval, Some(15000));
    }

    #[test]
    fn test_parse_channel_error() {
        let json = r#"{"action": 9, "channel": "foo", "error": {"code": 40160, "statusCode": 401, "message": "denied"}}"#;
        let frame: ProtocolMessage = serde_json::from_str(json).unwrap();
        assert_eq!(frame.channel.as_deref(), Some("foo"));
        assert!(frame.error.unwrap().is_capability_error());
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let frame = ProtocolMessage::for_channel(Action::Attach, "foo");
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"action":10,"channel":"foo"}"#);
    }

    #[test]
    fn test_flags_and_sync_cursor() {
        let mut frame = ProtocolMessage::new(Action::Attached);
        frame.flags = Some(flags::HAS_PRESENCE | flags::RESUMED);
        assert!(frame.has_flag(flags::HAS_PRESENCE));
        assert!(!frame.has_flag(flags::HAS_BACKLOG));

        frame.channel_serial = Some("sync1:cursor2".into());
        assert_eq!(frame.sync_cursor(), Some("cursor2"));
        frame.channel_serial = Some("sync1:".into());
        assert_eq!(frame.sync_cursor(), None);
    }
}
