//! Request/response client for one-shot operations.
//!
//! Used directly by applications and by the realtime client for channel
//! history. Every request authenticates with [`Auth`]: basic auth with the
//! key, or a bearer token.

use std::sync::Arc;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::auth::{Auth, TokenDetails, TokenRequest};
use crate::config::{ChannelOptions, ClientOptions};
use crate::constants::{AGENT, PROTOCOL_VERSION};
use crate::encoding::EncoderPipeline;
use crate::error::{Error, ErrorInfo, Result};
use crate::message::{Message, Publishable};

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Largest page size the service accepts.
pub const MAX_HISTORY_LIMIT: u32 = 1000;

/// Build an [`ErrorInfo`] from an error response body.
///
/// Accepts `{"error": {...}}` or a bare error object. Anything else becomes
/// a synthetic error with code `status * 100`.
pub(crate) fn error_from_body(status: u16, body: Option<String>) -> ErrorInfo {
    #[derive(Deserialize)]
    struct Wrapped {
        error: ErrorInfo,
    }

    let body = body.unwrap_or_default();
    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(&body) {
        return wrapped.error;
    }
    if let Ok(info) = serde_json::from_str::<ErrorInfo>(&body) {
        if info.code != 0 {
            return info;
        }
    }
    ErrorInfo::new(u32::from(status) * 100, Some(status), body)
}

/// Query order for history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Oldest first.
    Forwards,
    /// Newest first.
    #[default]
    Backwards,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Forwards => "forwards",
            Self::Backwards => "backwards",
        }
    }
}

/// History query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryParams {
    /// Earliest time, milliseconds since the epoch.
    pub start: Option<i64>,
    /// Latest time, milliseconds since the epoch.
    pub end: Option<i64>,
    /// Result order.
    pub direction: Direction,
    /// Page size, 1 to 1000.
    pub limit: u32,
}

impl Default for HistoryParams {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            direction: Direction::Backwards,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl HistoryParams {
    /// Reject queries the service would refuse.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(Error::InvalidArgument(format!(
                    "history end ({end}) is before start ({start})"
                )));
            }
        }
        if self.limit == 0 || self.limit > MAX_HISTORY_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "history limit must be between 1 and {MAX_HISTORY_LIMIT}, got {}",
                self.limit
            )));
        }
        Ok(())
    }

    fn to_query(self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("direction", self.direction.as_str().to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(start) = self.start {
            query.push(("start", start.to_string()));
        }
        if let Some(end) = self.end {
            query.push(("end", end.to_string()));
        }
        query
    }
}

#[derive(Debug)]
struct RestInner {
    base_url: String,
    http: reqwest::Client,
    auth: Auth,
    pipeline: EncoderPipeline,
}

/// REST client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Rest {
    inner: Arc<RestInner>,
}

impl Rest {
    /// Build a client. Fails on invalid options.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        options.validate()?;
        let auth = Auth::new(options)?;
        Self::with_auth(options, auth)
    }

    /// Build a client sharing an existing [`Auth`].
    pub(crate) fn with_auth(options: &ClientOptions, auth: Auth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.http_request_timeout)
            .user_agent(AGENT)
            .build()?;
        Ok(Self {
            inner: Arc::new(RestInner {
                base_url: options.rest_url(),
                http,
                auth,
                pipeline: EncoderPipeline::standard(options.max_encoding_length),
            }),
        })
    }

    /// Token manager used by this client.
    pub fn auth(&self) -> &Auth {
        &self.inner.auth
    }

    /// Handle for a channel with default options.
    pub fn channel(&self, name: &str) -> RestChannel {
        self.channel_with_options(name, ChannelOptions::default())
    }

    /// Handle for a channel with explicit options.
    pub fn channel_with_options(&self, name: &str, options: ChannelOptions) -> RestChannel {
        RestChannel {
            rest: self.clone(),
            name: name.to_string(),
            options,
        }
    }

    /// Exchange a signed token request for a token.
    pub async fn request_token(&self, request: &TokenRequest) -> Result<TokenDetails> {
        self.inner.auth.exchange_token_request(request).await
    }

    /// Service time, milliseconds since the epoch.
    pub async fn time(&self) -> Result<i64> {
        let url = self.url(&["time"])?;
        let response = self.inner.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(rest_error(status, response.text().await.ok()));
        }
        let times: Vec<i64> = response.json().await?;
        times
            .first()
            .copied()
            .ok_or_else(|| Error::Http("empty time response".to_string()))
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.inner.base_url)
            .map_err(|e| Error::InvalidArgument(format!("invalid REST URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidArgument("REST URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn publish_encoded(&self, channel: &str, body: serde_json::Value) -> Result<()> {
        let url = self.url(&["channels", channel, "publish"])?;
        let response = self
            .inner
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.inner.auth.authorization_header().await?)
            .header("X-Tether-Version", PROTOCOL_VERSION)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(rest_error(status, response.text().await.ok())),
        }
    }

    async fn history_raw(&self, channel: &str, params: HistoryParams) -> Result<Vec<Message>> {
        params.validate()?;
        let url = self.url(&["channels", channel, "messages"])?;
        let response = self
            .inner
            .http
            .get(url)
            .query(&params.to_query())
            .header(reqwest::header::AUTHORIZATION, self.inner.auth.authorization_header().await?)
            .header("X-Tether-Version", PROTOCOL_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(rest_error(status, response.text().await.ok()));
        }
        Ok(response.json().await?)
    }
}

fn rest_error(status: StatusCode, body: Option<String>) -> Error {
    Error::Rest {
        status: status.as_u16(),
        info: error_from_body(status.as_u16(), body),
    }
}

/// Channel handle on a [`Rest`] client.
#[derive(Debug, Clone)]
pub struct RestChannel {
    rest: Rest,
    name: String,
    options: ChannelOptions,
}

impl RestChannel {
    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish one message or a batch. Succeeds on 201 or 204.
    pub async fn publish(&self, messages: impl Into<Publishable>) -> Result<()> {
        let publishable = messages.into();
        let single = matches!(publishable, Publishable::One(_));

        let mut encoded = Vec::new();
        for mut message in publishable.into_messages() {
            self.rest
                .inner
                .auth
                .check_message_client_id(message.client_id.as_deref())?;
            message.encode(&self.rest.inner.pipeline, &self.options)?;
            encoded.push(message);
        }

        let body = match encoded.as_slice() {
            [one] if single => serde_json::to_value(one)?,
            many => serde_json::to_value(many)?,
        };
        self.rest.publish_encoded(&self.name, body).await
    }

    /// Query message history. Messages that fail to decode are returned
    /// partially decoded, with the failure logged.
    pub async fn history(&self, params: HistoryParams) -> Result<Vec<Message>> {
        let mut messages = self.rest.history_raw(&self.name, params).await?;
        for message in &mut messages {
            if let Err(e) = message.decode(&self.rest.inner.pipeline, &self.options) {
                log::warn!("[Rest] Failed to decode history message on '{}': {}", self.name, e);
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_params_validation() {
        let reversed = HistoryParams {
            start: Some(200),
            end: Some(100),
            ..HistoryParams::default()
        };
        assert!(matches!(reversed.validate(), Err(Error::InvalidArgument(_))));

        let too_many = HistoryParams {
            limit: 1001,
            ..HistoryParams::default()
        };
        assert!(too_many.validate().is_err());

        let zero = HistoryParams {
            limit: 0,
            ..HistoryParams::default()
        };
        assert!(zero.validate().is_err());

        assert!(HistoryParams::default().validate().is_ok());
    }

    #[test]
    fn test_history_defaults() {
        let params = HistoryParams::default();
        assert_eq!(params.direction, Direction::Backwards);
        assert_eq!(params.limit, 100);
        let query = params.to_query();
        assert!(query.contains(&("direction", "backwards".to_string())));
        assert!(query.contains(&("limit", "100".to_string())));
    }

    #[test]
    fn test_error_from_body_variants() {
        let wrapped = error_from_body(
            401,
            Some(r#"{"error":{"code":40160,"statusCode":401,"message":"no"}}"#.into()),
        );
        assert_eq!(wrapped.code, 40160);

        let bare = error_from_body(400, Some(r#"{"code":40003,"message":"bad"}"#.into()));
        assert_eq!(bare.code, 40003);

        let text = error_from_body(503, Some("upstream down".into()));
        assert_eq!(text.code, 50300);
        assert_eq!(text.message, "upstream down");
    }

    #[test]
    fn test_channel_url_is_escaped() {
        let rest = Rest::new(&ClientOptions::with_key("a:b")).unwrap();
        let url = rest.url(&["channels", "room 1/a", "messages"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://rest.tether.dev/channels/room%201%2Fa/messages"
        );
    }
}
