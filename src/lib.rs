//! Tether - realtime publish/subscribe client.
//!
//! A [`Realtime`] client keeps one connection to the service alive across
//! network loss and hands out named [`Channel`]s for publishing, subscribing
//! and presence.
//!
//! # Architecture
//!
//! The crate follows a single-owner event loop pattern:
//!
//! - **Connection manager** - owns connection state, every channel state
//!   machine, publish queues and timers; runs as one tokio task
//! - **Handles** - [`Realtime`], [`Connection`], [`Channel`], [`Presence`]
//!   send commands to the loop and observe published snapshots
//! - **Transport** - the wire seam ([`Transport`]), WebSocket by default
//! - **Auth** - token acquisition and renewal, shared with the REST
//!   collaborator
//! - **Encoding** - reversible payload transforms applied on publish and
//!   undone on receipt
//!
//! # Modules
//!
//! - [`events`] - typed event emitter used for every observable state
//! - [`connection`] - connection states and handle
//! - [`channel`] - channel states, handle and presence
//! - [`auth`] - token manager
//! - [`encoding`] - encoder pipeline
//! - [`rest`] - HTTP collaborator (history, token exchange)
//! - [`config`] - client options

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod events;
pub mod message;
pub mod protocol;
pub mod realtime;
pub mod rest;
pub mod transport;

// Re-export commonly used types
pub use auth::{Auth, AuthCallback, AuthCallbackResult, AuthMethod, TokenDetails, TokenParams, TokenRequest};
pub use channel::{Channel, ChannelEvent, ChannelState, ChannelStateChange, Presence};
pub use config::{ChannelOptions, ClientOptions};
pub use connection::{Connection, ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use encoding::{CipherParams, EncoderPipeline, EncodingError};
pub use error::{Error, ErrorInfo, Result};
pub use events::{EventEmitter, ListenerId, Subjects};
pub use message::{Data, Message, PresenceAction, PresenceMessage, Publishable};
pub use realtime::{Channels, Realtime};
pub use rest::{Direction, HistoryParams, Rest, RestChannel};
pub use transport::{Transport, WebSocketTransport};
