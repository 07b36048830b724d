//! Application messages and presence messages.
//!
//! Both carry an opaque [`Data`] body plus the `encoding` tag describing the
//! transforms applied to it. Encoding and decoding only ever touch `data`
//! and `encoding`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ChannelOptions;
use crate::encoding::{EncoderPipeline, EncodingError, Payload};

/// Message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Data {
    /// No body.
    #[default]
    Null,
    /// UTF-8 text.
    String(String),
    /// Raw bytes. Base64-wrapped by the encoder chain before transmission.
    Binary(Vec<u8>),
    /// Structured value. Serialised to text by the encoder chain.
    Json(Value),
}

impl Data {
    /// Short description of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Json(_) => "json",
        }
    }

    /// Whether there is no body.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text body, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl From<Data> for Value {
    fn from(data: Data) -> Self {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        match data {
            Data::Null => Value::Null,
            Data::String(s) => Value::String(s),
            // Only reached when serialising an unencoded message.
            Data::Binary(bytes) => Value::String(BASE64.encode(bytes)),
            Data::Json(v) => v,
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

fn transform(
    data: &mut Data,
    encoding: &mut Option<String>,
    apply: impl FnOnce(&mut Payload) -> Result<(), EncodingError>,
) -> Result<(), EncodingError> {
    let mut payload = Payload::new(std::mem::take(data), encoding.take());
    let result = apply(&mut payload);
    *data = payload.data;
    *encoding = payload.encoding;
    result
}

/// Application message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id assigned by the service (`connectionId:msgSerial:index`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Publisher identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Publishing connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Body.
    #[serde(default, skip_serializing_if = "Data::is_null")]
    pub data: Data,
    /// Applied transforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Service timestamp, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Opaque metadata passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl Message {
    /// Named message with a body.
    pub fn new(name: impl Into<String>, data: impl Into<Data>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Assert a publisher identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Apply the encoder chain before transmission.
    pub fn encode(&mut self, pipeline: &EncoderPipeline, options: &ChannelOptions) -> Result<(), EncodingError> {
        transform(&mut self.data, &mut self.encoding, |p| pipeline.encode(p, options))
    }

    /// Reverse the encoder chain after receipt. Keeps the partial decode on failure.
    pub fn decode(&mut self, pipeline: &EncoderPipeline, options: &ChannelOptions) -> Result<(), EncodingError> {
        transform(&mut self.data, &mut self.encoding, |p| pipeline.decode(p, options))
    }
}

/// Presence action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PresenceAction {
    /// Member left during a sync; kept until the sync ends.
    Absent,
    /// Member reported by a sync.
    Present,
    /// Member entered.
    Enter,
    /// Member left.
    Leave,
    /// Member updated its data.
    Update,
}

impl TryFrom<u8> for PresenceAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Absent),
            1 => Ok(Self::Present),
            2 => Ok(Self::Enter),
            3 => Ok(Self::Leave),
            4 => Ok(Self::Update),
            other => Err(format!("unknown presence action {other}")),
        }
    }
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> Self {
        match action {
            PresenceAction::Absent => 0,
            PresenceAction::Present => 1,
            PresenceAction::Enter => 2,
            PresenceAction::Leave => 3,
            PresenceAction::Update => 4,
        }
    }
}

impl PresenceAction {
    /// Lower-case name, as accepted by subscription name coercion.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Update => "update",
        }
    }

    /// Parse a lower-case action name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "absent" => Some(Self::Absent),
            "present" => Some(Self::Present),
            "enter" => Some(Self::Enter),
            "leave" => Some(Self::Leave),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

/// Presence event for one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    /// What happened.
    pub action: PresenceAction,
    /// Unique id assigned by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Member identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Member's connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Member data.
    #[serde(default, skip_serializing_if = "Data::is_null")]
    pub data: Data,
    /// Applied transforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Service timestamp, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    /// Outbound presence action for `client_id`.
    pub fn new(action: PresenceAction, client_id: impl Into<String>, data: impl Into<Data>) -> Self {
        Self {
            action,
            id: None,
            client_id: Some(client_id.into()),
            connection_id: None,
            data: data.into(),
            encoding: None,
            timestamp: None,
        }
    }

    /// Presence set key: `connection_id:client_id`.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.connection_id.as_deref().unwrap_or_default(),
            self.client_id.as_deref().unwrap_or_default()
        )
    }

    /// `(msgSerial, index)` from an id of the form `connectionId:msgSerial:index`,
    /// when the id belongs to this message's connection.
    fn serial_position(&self) -> Option<(u64, u64)> {
        let id = self.id.as_deref()?;
        let connection_id = self.connection_id.as_deref()?;
        let rest = id.strip_prefix(connection_id)?.strip_prefix(':')?;
        let (serial, index) = rest.split_once(':')?;
        Some((serial.parse().ok()?, index.parse().ok()?))
    }

    /// Whether this message supersedes `existing` for the same member.
    ///
    /// Messages from the same connection are ordered by serial and index.
    /// Otherwise (including service-synthesised leaves) the later timestamp
    /// wins, with ties going to this message.
    pub fn is_newer_than(&self, existing: &Self) -> bool {
        if let (Some(mine), Some(theirs)) = (self.serial_position(), existing.serial_position()) {
            return mine > theirs;
        }
        self.timestamp.unwrap_or(0) >= existing.timestamp.unwrap_or(0)
    }

    /// Apply the encoder chain before transmission.
    pub fn encode(&mut self, pipeline: &EncoderPipeline, options: &ChannelOptions) -> Result<(), EncodingError> {
        transform(&mut self.data, &mut self.encoding, |p| pipeline.encode(p, options))
    }

    /// Reverse the encoder chain after receipt. Keeps the partial decode on failure.
    pub fn decode(&mut self, pipeline: &EncoderPipeline, options: &ChannelOptions) -> Result<(), EncodingError> {
        transform(&mut self.data, &mut self.encoding, |p| pipeline.decode(p, options))
    }
}

/// Argument to `publish`: one message or an ordered batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Publishable {
    /// Single message.
    One(Message),
    /// Ordered batch, sent in one frame.
    Many(Vec<Message>),
}

impl Publishable {
    /// Messages in publish order.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::One(m) => vec![m],
            Self::Many(ms) => ms,
        }
    }
}

impl From<Message> for Publishable {
    fn from(message: Message) -> Self {
        Self::One(message)
    }
}

impl From<Vec<Message>> for Publishable {
    fn from(messages: Vec<Message>) -> Self {
        Self::Many(messages)
    }
}

impl<N, D> From<(N, D)> for Publishable
where
    N: Into<String>,
    D: Into<Data>,
{
    fn from((name, data): (N, D)) -> Self {
        Self::One(Message::new(name, data))
    }
}
