//! Token acquisition and validation.
//!
//! [`Auth`] holds the most recently accepted [`TokenDetails`] and knows how
//! to get a new one, in order of preference:
//!
//! 1. the configured [`AuthCallback`],
//! 2. the configured `auth_url`,
//! 3. a [`TokenRequest`] signed locally with the API key.
//!
//! Whatever the source, a `TokenRequest` result is exchanged for a token at
//! `POST /keys/{keyName}/requestToken`. Renewal is never scheduled here: the
//! connection manager decides when to renew.
//!
//! # Identity
//!
//! A token's `client_id` must match the configured one unless the token is
//! a wildcard (`*`). A mismatch is an [`Error::IncompatibleClientId`], never
//! silently accepted.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::{AuthCallbackHandle, ClientOptions};
use crate::constants::{AGENT, DEFAULT_TOKEN_TTL, TOKEN_EXPIRY_MARGIN};
use crate::error::{codes, Error, ErrorInfo, Result};

type HmacSha256 = Hmac<Sha256>;

/// Wildcard identity: may act as any client id.
pub const WILDCARD_CLIENT_ID: &str = "*";

const NONCE_LENGTH: usize = 16;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// HTTP method used for `auth_url`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthMethod {
    /// Parameters in the query string.
    #[default]
    Get,
    /// Parameters as a form body.
    Post,
}

/// Parameters for a new token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenParams {
    /// Requested lifetime in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// JSON-encoded capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Identity to bind the token to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Request time, milliseconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl TokenParams {
    /// `self` with unset fields filled from `defaults`.
    fn merged_with(self, defaults: &TokenParams) -> Self {
        Self {
            ttl: self.ttl.or(defaults.ttl),
            capability: self.capability.or_else(|| defaults.capability.clone()),
            client_id: self.client_id.or_else(|| defaults.client_id.clone()),
            timestamp: self.timestamp.or(defaults.timestamp),
        }
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(ttl) = self.ttl {
            pairs.push(("ttl".to_string(), ttl.to_string()));
        }
        if let Some(capability) = &self.capability {
            pairs.push(("capability".to_string(), capability.clone()));
        }
        if let Some(client_id) = &self.client_id {
            pairs.push(("clientId".to_string(), client_id.clone()));
        }
        if let Some(timestamp) = self.timestamp {
            pairs.push(("timestamp".to_string(), timestamp.to_string()));
        }
        pairs
    }
}

/// A time-bounded credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    /// Token string.
    pub token: String,
    /// Expiry, milliseconds since the epoch. `None` if unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    /// Issue time, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<i64>,
    /// Identity asserted by the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// JSON-encoded capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl TokenDetails {
    /// Opaque token with no metadata.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
            issued: None,
            client_id: None,
            capability: None,
        }
    }

    /// Whether the token expires within the safety margin of `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        let margin = TOKEN_EXPIRY_MARGIN.as_millis() as i64;
        self.expires
            .is_some_and(|expires| expires.saturating_sub(margin) <= now_ms)
    }

    /// Whether the token is expired now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Time left before the token should be treated as expired.
    pub fn remaining_at(&self, now_ms: i64) -> Option<Duration> {
        let margin = TOKEN_EXPIRY_MARGIN.as_millis() as i64;
        let expires = self.expires?;
        let left = expires.saturating_sub(margin).saturating_sub(now_ms);
        Some(Duration::from_millis(left.max(0) as u64))
    }
}

/// Signed request a token endpoint exchanges for a [`TokenDetails`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    /// Name part of the signing key.
    pub key_name: String,
    /// Requested lifetime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// JSON-encoded capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Identity to bind the token to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Request time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Random nonce.
    pub nonce: String,
    /// Base64 HMAC-SHA256 over the other fields.
    pub mac: String,
}

impl TokenRequest {
    /// Sign `params` with a key secret.
    pub fn sign(key_name: &str, key_secret: &str, params: &TokenParams) -> Result<Self> {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        let mut request = Self {
            key_name: key_name.to_string(),
            ttl: params.ttl,
            capability: params.capability.clone(),
            client_id: params.client_id.clone(),
            timestamp: params.timestamp.unwrap_or_else(now_ms),
            nonce,
            mac: String::new(),
        };
        request.mac = request.compute_mac(key_secret)?;
        Ok(request)
    }

    fn signing_text(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.key_name,
            self.ttl.map(|t| t.to_string()).unwrap_or_default(),
            self.capability.as_deref().unwrap_or_default(),
            self.client_id.as_deref().unwrap_or_default(),
            self.timestamp,
            self.nonce
        )
    }

    fn compute_mac(&self, key_secret: &str) -> Result<String> {
        let mut hmac = HmacSha256::new_from_slice(key_secret.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("invalid key secret: {e}")))?;
        hmac.update(self.signing_text().as_bytes());
        Ok(BASE64.encode(hmac.finalize().into_bytes()))
    }

    /// Whether `mac` matches the fields under `key_secret`.
    pub fn verify(&self, key_secret: &str) -> bool {
        self.compute_mac(key_secret).is_ok_and(|mac| mac == self.mac)
    }
}

/// What an [`AuthCallback`] may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCallbackResult {
    /// Opaque token string.
    Token(String),
    /// Token with metadata.
    TokenDetails(TokenDetails),
    /// Signed request, exchanged with the token endpoint.
    TokenRequest(TokenRequest),
}

/// Application-supplied token source.
#[async_trait]
pub trait AuthCallback: Send + Sync {
    /// Produce a token for `params`.
    async fn token(&self, params: &TokenParams) -> Result<AuthCallbackResult>;
}

#[async_trait]
impl<F, Fut> AuthCallback for F
where
    F: Fn(TokenParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AuthCallbackResult>> + Send + 'static,
{
    async fn token(&self, params: &TokenParams) -> Result<AuthCallbackResult> {
        (self)(params.clone()).await
    }
}

/// Whether `identity` may publish a message asserting `asserted`.
///
/// `*` is never a valid message client id. A concrete identity may only
/// assert itself; a wildcard or anonymous identity may assert anything.
pub fn check_asserted_client_id(identity: Option<&str>, asserted: Option<&str>) -> Result<()> {
    let Some(asserted) = asserted else {
        return Ok(());
    };
    let incompatible = || Error::IncompatibleClientId {
        expected: identity.unwrap_or_default().to_string(),
        actual: asserted.to_string(),
    };
    if asserted == WILDCARD_CLIENT_ID {
        return Err(incompatible());
    }
    match identity {
        Some(id) if id != WILDCARD_CLIENT_ID && id != asserted => Err(incompatible()),
        _ => Ok(()),
    }
}

fn token_request_failed(message: impl Into<String>) -> Error {
    Error::Auth(ErrorInfo::new(codes::TOKEN_REQUEST_FAILED, Some(401), message))
}

#[derive(Debug, Default)]
struct AuthState {
    token: Option<TokenDetails>,
    /// Key sent directly. Cleared by the first explicit `authorise`.
    basic: bool,
}

#[derive(Debug)]
struct AuthInner {
    key: Option<(String, String)>,
    client_id: Option<String>,
    callback: Option<AuthCallbackHandle>,
    auth_url: Option<String>,
    auth_method: AuthMethod,
    auth_headers: Vec<(String, String)>,
    auth_params: Vec<(String, String)>,
    default_params: TokenParams,
    rest_url: String,
    request_timeout: Duration,
    http: reqwest::Client,
    state: Mutex<AuthState>,
}

/// Token manager. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Auth {
    inner: Arc<AuthInner>,
}

impl Auth {
    /// Build from validated options.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let key = options
            .key
            .as_deref()
            .and_then(|k| k.split_once(':'))
            .map(|(name, secret)| (name.to_string(), secret.to_string()));

        let token = options
            .token_details
            .clone()
            .or_else(|| options.token.clone().map(TokenDetails::from_token));

        let basic = key.is_some()
            && !options.use_token_auth
            && options.client_id.is_none()
            && token.is_none()
            && options.auth_callback.is_none()
            && options.auth_url.is_none();

        let http = reqwest::Client::builder()
            .timeout(options.http_request_timeout)
            .user_agent(AGENT)
            .build()?;

        let mut default_params = options.default_token_params.clone();
        if default_params.ttl.is_none() {
            default_params.ttl = Some(DEFAULT_TOKEN_TTL.as_millis() as u64);
        }

        Ok(Self {
            inner: Arc::new(AuthInner {
                key,
                client_id: options.client_id.clone(),
                callback: options.auth_callback.clone(),
                auth_url: options.auth_url.clone(),
                auth_method: options.auth_method,
                auth_headers: options.auth_headers.clone().into_iter().collect(),
                auth_params: options.auth_params.clone().into_iter().collect(),
                default_params,
                rest_url: options.rest_url(),
                request_timeout: options.realtime_request_timeout,
                http,
                state: Mutex::new(AuthState { token, basic }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether requests authenticate with the key directly.
    pub fn uses_basic_auth(&self) -> bool {
        self.lock().basic
    }

    /// Whether a new token can be obtained without user intervention.
    pub fn can_renew(&self) -> bool {
        self.inner.callback.is_some() || self.inner.auth_url.is_some() || self.inner.key.is_some()
    }

    /// API key as configured, for basic auth.
    pub fn key(&self) -> Option<String> {
        self.inner
            .key
            .as_ref()
            .map(|(name, secret)| format!("{name}:{secret}"))
    }

    /// Most recently accepted token.
    pub fn current_token(&self) -> Option<TokenDetails> {
        self.lock().token.clone()
    }

    /// Time left on the current token, `None` without a token or expiry.
    pub fn token_remaining(&self) -> Option<Duration> {
        self.lock().token.as_ref()?.remaining_at(now_ms())
    }

    /// Drop the current token so the next use fetches a fresh one.
    pub fn invalidate_token(&self) {
        self.lock().token = None;
    }

    /// Configured identity, or the identity of the current token.
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.clone().or_else(|| {
            self.lock()
                .token
                .as_ref()
                .and_then(|t| t.client_id.clone())
        })
    }

    /// Reject a token asserting an identity other than the configured one.
    pub fn check_client_id(&self, token: &TokenDetails) -> Result<()> {
        match (&self.inner.client_id, &token.client_id) {
            (Some(expected), Some(actual)) if actual != WILDCARD_CLIENT_ID && actual != expected => {
                Err(Error::IncompatibleClientId {
                    expected: expected.clone(),
                    actual: actual.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Reject a message asserting a client id this identity cannot publish as.
    pub fn check_message_client_id(&self, asserted: Option<&str>) -> Result<()> {
        check_asserted_client_id(self.client_id().as_deref(), asserted)
    }

    /// Sign a token request locally with the configured key.
    pub fn create_token_request(&self, params: Option<TokenParams>) -> Result<TokenRequest> {
        let Some((name, secret)) = &self.inner.key else {
            return Err(Error::Auth(ErrorInfo::new(
                codes::INVALID_CREDENTIALS,
                Some(401),
                "a key is required to sign token requests",
            )));
        };
        let params = self.effective_params(params);
        TokenRequest::sign(name, secret, &params)
    }

    fn effective_params(&self, params: Option<TokenParams>) -> TokenParams {
        let mut params = params.unwrap_or_default().merged_with(&self.inner.default_params);
        if params.client_id.is_none() {
            params.client_id.clone_from(&self.inner.client_id);
        }
        params
    }

    /// Obtain a new token without storing it.
    ///
    /// Bounded by the realtime request timeout.
    pub async fn request_token(&self, params: Option<TokenParams>) -> Result<TokenDetails> {
        let params = self.effective_params(params);
        let timeout = self.inner.request_timeout;
        let token = tokio::time::timeout(timeout, self.fetch_token(&params))
            .await
            .map_err(|_elapsed| Error::Timeout(format!("token request exceeded {timeout:?}")))??;
        self.check_client_id(&token)?;
        Ok(token)
    }

    /// Obtain a new token and make it current.
    pub async fn authorise(&self, params: Option<TokenParams>) -> Result<TokenDetails> {
        let token = self.request_token(params).await?;
        {
            let mut state = self.lock();
            state.token = Some(token.clone());
            state.basic = false;
        }
        log::info!("[Auth] Token renewed (client_id: {:?})", token.client_id);
        Ok(token)
    }

    /// Current token if still valid, otherwise a fresh one. `None` under basic auth.
    pub async fn ensure_token(&self) -> Result<Option<TokenDetails>> {
        if self.uses_basic_auth() {
            return Ok(None);
        }
        if let Some(token) = self.current_token() {
            if !token.is_expired() {
                return Ok(Some(token));
            }
            log::debug!("[Auth] Current token expired");
        }
        if !self.can_renew() {
            return Err(Error::Auth(ErrorInfo::new(
                codes::NO_MEANS_TO_RENEW,
                Some(401),
                "token expired or missing and no means to renew it",
            )));
        }
        self.authorise(None).await.map(Some)
    }

    /// Value of the `Authorization` header for REST requests.
    pub async fn authorization_header(&self) -> Result<String> {
        match self.ensure_token().await? {
            Some(token) => Ok(format!("Bearer {}", BASE64.encode(token.token))),
            None => {
                let key = self.key().unwrap_or_default();
                Ok(format!("Basic {}", BASE64.encode(key)))
            }
        }
    }

    async fn fetch_token(&self, params: &TokenParams) -> Result<TokenDetails> {
        let result = if let Some(callback) = &self.inner.callback {
            log::debug!("[Auth] Requesting token from callback");
            callback.0.token(params).await.map_err(|e| match e {
                Error::Auth(_) | Error::IncompatibleClientId { .. } | Error::Timeout(_) => e,
                other => token_request_failed(format!("auth callback failed: {other}")),
            })?
        } else if let Some(url) = &self.inner.auth_url {
            log::debug!("[Auth] Requesting token from auth URL");
            self.fetch_from_url(url, params).await?
        } else if let Some((name, secret)) = &self.inner.key {
            log::debug!("[Auth] Signing token request locally");
            AuthCallbackResult::TokenRequest(TokenRequest::sign(name, secret, params)?)
        } else {
            return Err(Error::Auth(ErrorInfo::new(
                codes::NO_MEANS_TO_RENEW,
                Some(401),
                "no key, auth_callback or auth_url to obtain a token",
            )));
        };

        match result {
            AuthCallbackResult::Token(token) => Ok(TokenDetails::from_token(token)),
            AuthCallbackResult::TokenDetails(details) => Ok(details),
            AuthCallbackResult::TokenRequest(request) => self.exchange_token_request(&request).await,
        }
    }

    async fn fetch_from_url(&self, url: &str, params: &TokenParams) -> Result<AuthCallbackResult> {
        let mut fields = self.inner.auth_params.clone();
        fields.extend(params.to_pairs());

        let mut request = match self.inner.auth_method {
            AuthMethod::Get => self.inner.http.get(url).query(&fields),
            AuthMethod::Post => self.inner.http.post(url).form(&fields),
        };
        for (name, value) in &self.inner.auth_headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| token_request_failed(format!("auth URL request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(token_request_failed(format!(
                "auth URL returned {status}: {body}"
            )));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let body = response
            .text()
            .await
            .map_err(|e| token_request_failed(format!("auth URL body unreadable: {e}")))?;

        if !is_json {
            let token = body.trim();
            if token.is_empty() {
                return Err(token_request_failed("auth URL returned an empty token"));
            }
            return Ok(AuthCallbackResult::Token(token.to_string()));
        }

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| token_request_failed(format!("auth URL returned invalid JSON: {e}")))?;
        if value.get("keyName").is_some() && value.get("mac").is_some() {
            let request = serde_json::from_value(value)
                .map_err(|e| token_request_failed(format!("invalid token request: {e}")))?;
            Ok(AuthCallbackResult::TokenRequest(request))
        } else {
            let details = serde_json::from_value(value)
                .map_err(|e| token_request_failed(format!("invalid token details: {e}")))?;
            Ok(AuthCallbackResult::TokenDetails(details))
        }
    }

    /// Exchange a signed request for a token.
    pub async fn exchange_token_request(&self, request: &TokenRequest) -> Result<TokenDetails> {
        let url = format!("{}/keys/{}/requestToken", self.inner.rest_url, request.key_name);
        let response = self
            .inner
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| token_request_failed(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let info = crate::rest::error_from_body(status.as_u16(), response.text().await.ok());
            return Err(Error::Auth(info));
        }
        response
            .json::<TokenDetails>()
            .await
            .map_err(|e| token_request_failed(format!("invalid token response: {e}")))
    }
}
