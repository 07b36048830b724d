//! Realtime client instance.
//!
//! [`Realtime`] validates options, spawns the event loop on the current
//! tokio runtime and hands out [`Connection`] and [`Channel`] handles. The
//! event loop stops once the client and every handle derived from it are
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::auth::{Auth, TokenDetails, TokenParams};
use crate::channel::{Channel, ChannelShared};
use crate::config::{ChannelOptions, ClientOptions};
use crate::connection::manager::ConnectionManager;
use crate::connection::{request, Command, Connection, ConnectionShared};
use crate::error::{Error, Result};
use crate::rest::Rest;
use crate::transport::{Transport, WebSocketTransport};

/// Realtime client. Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct Realtime {
    options: Arc<ClientOptions>,
    auth: Auth,
    rest: Rest,
    connection: Connection,
    channels: Channels,
}

impl Realtime {
    /// Create a client using the WebSocket transport.
    ///
    /// Must be called inside a tokio runtime. Connects immediately unless
    /// `auto_connect` is off.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_transport(options, Arc::new(WebSocketTransport))
    }

    /// Create a client with a custom transport.
    pub fn with_transport(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::InvalidState {
            operation: "create client",
            state: "outside a tokio runtime".to_string(),
        })?;

        let auth = Auth::new(&options)?;
        let rest = Rest::with_auth(&options, auth.clone())?;
        let shared = Arc::new(ConnectionShared::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(
            options.clone(),
            auth.clone(),
            transport,
            Arc::clone(&shared),
            commands_rx,
        );
        runtime.spawn(manager.run());

        let connection = Connection {
            shared,
            commands: commands_tx.clone(),
        };
        if options.auto_connect {
            connection.connect();
        }
        log::info!(
            "[Realtime] Client created (host: {}, auto_connect: {})",
            options.realtime_host,
            options.auto_connect
        );

        Ok(Self {
            options: Arc::new(options),
            auth,
            channels: Channels {
                inner: Arc::new(ChannelsInner {
                    cache: Mutex::new(HashMap::new()),
                    commands: commands_tx,
                    rest: rest.clone(),
                }),
            },
            rest,
            connection,
        })
    }

    /// The connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The channel collection.
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Token manager shared with the REST collaborator.
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// REST collaborator using the same credentials.
    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    /// Options the client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Identity of this client: configured, from the token, or assigned by
    /// the service on connect.
    pub fn client_id(&self) -> Option<String> {
        self.auth
            .client_id()
            .or_else(|| self.connection.details().and_then(|d| d.client_id))
    }

    /// Obtain a new token and apply it to the live connection.
    ///
    /// While connected the token is sent in-band and the call resolves on the
    /// service's confirmation. With `force`, or while not connected, the
    /// client reconnects with the new token. Fails if the token's client id
    /// contradicts the established identity; the connection then FAILS too.
    pub async fn authorise(&self, params: Option<TokenParams>, force: bool) -> Result<TokenDetails> {
        request(&self.connection.commands, |reply| Command::Authorise {
            params,
            force,
            reply,
        })
        .await
    }

    /// Start connecting. See [`Connection::connect`].
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Close the connection. See [`Connection::close`].
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    /// Service time in milliseconds since the epoch.
    pub async fn time(&self) -> Result<i64> {
        self.rest.time().await
    }
}

/// Channels of one client, by name.
#[derive(Debug, Clone)]
pub struct Channels {
    inner: Arc<ChannelsInner>,
}

#[derive(Debug)]
struct ChannelsInner {
    cache: Mutex<HashMap<String, Channel>>,
    commands: mpsc::UnboundedSender<Command>,
    rest: Rest,
}

impl Channels {
    fn cache(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get or create a channel.
    pub fn get(&self, name: &str) -> Channel {
        self.get_or_create(name, None)
    }

    /// Get or create a channel. Options replace any existing ones.
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> Channel {
        self.get_or_create(name, Some(options))
    }

    fn get_or_create(&self, name: &str, options: Option<ChannelOptions>) -> Channel {
        let mut cache = self.cache();
        if let Some(channel) = cache.get(name) {
            if let Some(options) = options {
                channel.set_options(options);
            }
            return channel.clone();
        }

        let shared = Arc::new(ChannelShared::new(name, options.unwrap_or_default()));
        let _ = self.inner.commands.send(Command::RegisterChannel {
            shared: Arc::clone(&shared),
        });
        let channel = Channel::new(shared, self.inner.commands.clone(), self.inner.rest.clone());
        cache.insert(name.to_string(), channel.clone());
        channel
    }

    /// Detach a channel and drop it. Existing handles stop working.
    pub async fn release(&self, name: &str) -> Result<()> {
        let Some(channel) = self.cache().remove(name) else {
            return Ok(());
        };
        if let Err(e) = channel.detach().await {
            log::debug!("[Realtime] Detach before release of '{}' failed: {}", name, e);
        }
        let shared = Arc::clone(channel.shared());
        request(&self.inner.commands, |reply| Command::ReleaseChannel { shared, reply }).await
    }

    /// Whether a channel with this name exists.
    pub fn exists(&self, name: &str) -> bool {
        self.cache().contains_key(name)
    }

    /// Names of all channels, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ClientOptions {
        ClientOptions {
            auto_connect: false,
            ..ClientOptions::with_key("app.key:secret")
        }
    }

    #[test]
    fn test_requires_runtime() {
        let err = Realtime::new(options()).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_rejects_invalid_options() {
        let err = Realtime::new(ClientOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_channels_cache() {
        let client = Realtime::new(options()).unwrap();
        let a = client.channels().get("alpha");
        let again = client.channels().get("alpha");
        client.channels().get("beta");

        assert_eq!(a.name(), again.name());
        assert!(client.channels().exists("alpha"));
        assert_eq!(client.channels().names(), vec!["alpha", "beta"]);

        client.channels().release("alpha").await.unwrap();
        assert_eq!(client.channels().names(), vec!["beta"]);
        assert!(a.attach().await.is_err());
    }

    #[tokio::test]
    async fn test_get_with_options_replaces_options() {
        let client = Realtime::new(options()).unwrap();
        let channel = client.channels().get("alpha");
        assert!(channel.options().cipher.is_none());

        let cipher = crate::encoding::CipherParams::new(&[7u8; 16]).unwrap();
        client
            .channels()
            .get_with_options("alpha", ChannelOptions::encrypted(cipher));
        assert!(channel.options().cipher.is_some());
    }
}
