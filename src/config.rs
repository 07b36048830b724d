//! Client configuration.
//!
//! [`ClientOptions`] is plain data: it can be built in code, loaded from a
//! JSON file, and overridden from `TETHER_*` environment variables. Durations
//! are written as integer milliseconds in JSON. The auth callback is never
//! serialised.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthCallback, AuthMethod, TokenDetails, TokenParams};
use crate::constants::{
    CHANNEL_RETRY_LIMIT, CHANNEL_RETRY_TIMEOUT, DEFAULT_MAX_ENCODING_LENGTH, DEFAULT_PORT,
    DEFAULT_REALTIME_HOST, DEFAULT_REST_HOST, DEFAULT_TLS_PORT, DISCONNECTED_RETRY_LIMIT,
    DISCONNECTED_RETRY_TIMEOUT, HTTP_REQUEST_TIMEOUT, REALTIME_REQUEST_TIMEOUT,
    SUSPENDED_RETRY_TIMEOUT,
};
use crate::encoding::CipherParams;
use crate::error::{Error, Result};

/// Shared handle to a user-supplied token callback.
#[derive(Clone)]
pub struct AuthCallbackHandle(pub Arc<dyn AuthCallback>);

impl std::fmt::Debug for AuthCallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthCallbackHandle(..)")
    }
}

/// Configuration for a [`Realtime`](crate::Realtime) or [`Rest`](crate::Rest) client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// API key, `keyName:keySecret`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Literal token string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Literal token with metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_details: Option<TokenDetails>,
    /// Callback producing tokens.
    #[serde(skip)]
    pub auth_callback: Option<AuthCallbackHandle>,
    /// URL producing tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    /// HTTP method for `auth_url`.
    pub auth_method: AuthMethod,
    /// Extra headers for `auth_url`.
    pub auth_headers: HashMap<String, String>,
    /// Extra query/form parameters for `auth_url`.
    pub auth_params: HashMap<String, String>,
    /// Identity of this client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Use token auth even when a key is present.
    pub use_token_auth: bool,
    /// Defaults for token requests.
    pub default_token_params: TokenParams,
    /// Connect on construction and on first attach/publish.
    pub auto_connect: bool,
    /// Use `wss`/`https`.
    pub use_tls: bool,
    /// Realtime endpoint host.
    pub realtime_host: String,
    /// REST endpoint host.
    pub rest_host: String,
    /// Plain-text port.
    pub port: u16,
    /// TLS port.
    pub tls_port: u16,
    /// Receive our own publishes.
    pub echo_messages: bool,
    /// Queue publishes while not connected.
    pub queue_messages: bool,
    /// Base retry delay while DISCONNECTED.
    #[serde(with = "duration_ms")]
    pub disconnected_retry_timeout: Duration,
    /// Failed attempts before SUSPENDED.
    pub disconnected_retry_limit: u32,
    /// Retry delay while SUSPENDED.
    #[serde(with = "duration_ms")]
    pub suspended_retry_timeout: Duration,
    /// Delay before re-attaching a SUSPENDED channel.
    #[serde(with = "duration_ms")]
    pub channel_retry_timeout: Duration,
    /// Consecutive attach timeouts before a channel FAILS.
    pub channel_retry_limit: u32,
    /// Bound on connect, attach, detach, close and token requests.
    #[serde(with = "duration_ms")]
    pub realtime_request_timeout: Duration,
    /// Bound on REST requests.
    #[serde(with = "duration_ms")]
    pub http_request_timeout: Duration,
    /// Cap on a message's `encoding` tag.
    pub max_encoding_length: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            token_details: None,
            auth_callback: None,
            auth_url: None,
            auth_method: AuthMethod::default(),
            auth_headers: HashMap::new(),
            auth_params: HashMap::new(),
            client_id: None,
            use_token_auth: false,
            default_token_params: TokenParams::default(),
            auto_connect: true,
            use_tls: true,
            realtime_host: DEFAULT_REALTIME_HOST.to_string(),
            rest_host: DEFAULT_REST_HOST.to_string(),
            port: DEFAULT_PORT,
            tls_port: DEFAULT_TLS_PORT,
            echo_messages: true,
            queue_messages: true,
            disconnected_retry_timeout: DISCONNECTED_RETRY_TIMEOUT,
            disconnected_retry_limit: DISCONNECTED_RETRY_LIMIT,
            suspended_retry_timeout: SUSPENDED_RETRY_TIMEOUT,
            channel_retry_timeout: CHANNEL_RETRY_TIMEOUT,
            channel_retry_limit: CHANNEL_RETRY_LIMIT,
            realtime_request_timeout: REALTIME_REQUEST_TIMEOUT,
            http_request_timeout: HTTP_REQUEST_TIMEOUT,
            max_encoding_length: DEFAULT_MAX_ENCODING_LENGTH,
        }
    }
}

impl ClientOptions {
    /// Options authenticating with an API key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Options authenticating with a literal token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Install a token callback.
    pub fn auth_callback(mut self, callback: impl AuthCallback + 'static) -> Self {
        self.auth_callback = Some(AuthCallbackHandle(Arc::new(callback)));
        self
    }

    /// Defaults with `TETHER_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.apply_env_overrides();
        options
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read config {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `TETHER_KEY`, `TETHER_TOKEN`, `TETHER_CLIENT_ID`,
    /// `TETHER_REALTIME_HOST`, `TETHER_REST_HOST` and `TETHER_USE_TLS`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TETHER_KEY") {
            self.key = Some(key);
        }

        if let Some(token) = lookup("TETHER_TOKEN") {
            self.token = Some(token);
        }

        if let Some(client_id) = lookup("TETHER_CLIENT_ID") {
            self.client_id = Some(client_id);
        }

        if let Some(host) = lookup("TETHER_REALTIME_HOST") {
            self.realtime_host = host;
        }

        if let Some(host) = lookup("TETHER_REST_HOST") {
            self.rest_host = host;
        }

        if let Some(use_tls) = lookup("TETHER_USE_TLS") {
            if let Ok(flag) = use_tls.parse::<bool>() {
                self.use_tls = flag;
            }
        }
    }

    /// Reject configurations that can never authenticate or never time out.
    pub fn validate(&self) -> Result<()> {
        let has_credentials = self.key.is_some()
            || self.token.is_some()
            || self.token_details.is_some()
            || self.auth_callback.is_some()
            || self.auth_url.is_some();
        if !has_credentials {
            return Err(Error::InvalidArgument(
                "no means to authenticate: set key, token, token_details, auth_callback or auth_url"
                    .to_string(),
            ));
        }

        if let Some(key) = &self.key {
            match key.split_once(':') {
                Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {}
                _ => {
                    return Err(Error::InvalidArgument(
                        "key must have the form keyName:keySecret".to_string(),
                    ))
                }
            }
        }

        if self.client_id.as_deref() == Some("*") {
            return Err(Error::InvalidArgument(
                "client_id '*' cannot be configured; use a wildcard token instead".to_string(),
            ));
        }

        let timeouts = [
            ("disconnected_retry_timeout", self.disconnected_retry_timeout),
            ("suspended_retry_timeout", self.suspended_retry_timeout),
            ("channel_retry_timeout", self.channel_retry_timeout),
            ("realtime_request_timeout", self.realtime_request_timeout),
            ("http_request_timeout", self.http_request_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::InvalidArgument(format!("{name} must be non-zero")));
        }

        Ok(())
    }

    /// Base URL of the realtime endpoint.
    pub fn realtime_url(&self) -> String {
        if self.use_tls {
            format!("wss://{}:{}", self.realtime_host, self.tls_port)
        } else {
            format!("ws://{}:{}", self.realtime_host, self.port)
        }
    }

    /// Base URL of the REST endpoint.
    pub fn rest_url(&self) -> String {
        if self.use_tls {
            format!("https://{}:{}", self.rest_host, self.tls_port)
        } else {
            format!("http://{}:{}", self.rest_host, self.port)
        }
    }
}

/// Per-channel options. Replaced as a whole by `Channel::set_options`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Encrypt payloads with this key.
    pub cipher: Option<CipherParams>,
}

impl ChannelOptions {
    /// Options for an encrypted channel.
    pub fn encrypted(cipher: CipherParams) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert!(options.auto_connect);
        assert!(options.use_tls);
        assert!(options.queue_messages);
        assert_eq!(options.disconnected_retry_timeout, Duration::from_secs(15));
        assert_eq!(options.suspended_retry_timeout, Duration::from_secs(30));
        assert_eq!(options.max_encoding_length, 512);
        assert_eq!(options.realtime_url(), "wss://realtime.tether.dev:443");
    }

    #[test]
    fn test_validate_requires_credentials() {
        let err = ClientOptions::default().validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(ClientOptions::with_key("app.key:secret").validate().is_ok());
        assert!(ClientOptions::with_token("tok").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_key() {
        assert!(ClientOptions::with_key("no-secret").validate().is_err());
        assert!(ClientOptions::with_key(":secret").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wildcard_client_id() {
        let options = ClientOptions {
            client_id: Some("*".into()),
            ..ClientOptions::with_key("a:b")
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let options = ClientOptions {
            realtime_request_timeout: Duration::ZERO,
            ..ClientOptions::with_key("a:b")
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("realtime_request_timeout"));
    }

    #[test]
    fn test_load_from_file_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"key": "app.key:secret", "use_tls": false, "disconnected_retry_timeout": 2500}}"#
        )
        .unwrap();

        let options = ClientOptions::load_from_file(file.path()).unwrap();
        assert_eq!(options.key.as_deref(), Some("app.key:secret"));
        assert!(!options.use_tls);
        assert_eq!(options.disconnected_retry_timeout, Duration::from_millis(2500));
        assert_eq!(options.channel_retry_limit, 3);
        assert_eq!(options.realtime_url(), "ws://realtime.tether.dev:80");
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = ClientOptions::load_from_file("/nonexistent/tether.json").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TETHER_KEY", "env.key:secret"),
            ("TETHER_CLIENT_ID", "alice"),
            ("TETHER_USE_TLS", "false"),
            ("TETHER_REALTIME_HOST", "localhost"),
        ]
        .into_iter()
        .collect();

        let mut options = ClientOptions::default();
        options.apply_overrides_from(|name| env.get(name).map(ToString::to_string));

        assert_eq!(options.key.as_deref(), Some("env.key:secret"));
        assert_eq!(options.client_id.as_deref(), Some("alice"));
        assert!(!options.use_tls);
        assert_eq!(options.realtime_host, "localhost");
        assert_eq!(options.rest_host, DEFAULT_REST_HOST);
    }

    #[test]
    fn test_serialization_skips_callback() {
        let options = ClientOptions::with_key("a:b");
        let json = serde_json::to_string(&options).unwrap();
        assert!(!json.contains("auth_callback"));
        assert!(json.contains("\"realtime_request_timeout\":10000"));
    }
}
