//! Protocol and client-wide constants.
//!
//! Default hosts, protocol version, and the default timeouts used when a
//! [`ClientOptions`](crate::ClientOptions) field is left unset. Grouped by
//! domain.

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Wire protocol version sent as the `v` query parameter.
pub const PROTOCOL_VERSION: &str = "1.2";

/// Agent string sent on every realtime and REST request.
pub const AGENT: &str = concat!("tether-rs/", env!("CARGO_PKG_VERSION"));

/// Default realtime endpoint host.
pub const DEFAULT_REALTIME_HOST: &str = "realtime.tether.dev";

/// Default REST endpoint host.
pub const DEFAULT_REST_HOST: &str = "rest.tether.dev";

/// Default plain-text port.
pub const DEFAULT_PORT: u16 = 80;

/// Default TLS port.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Upper bound on the length of a message `encoding` tag after encoding.
pub const DEFAULT_MAX_ENCODING_LENGTH: usize = 512;

/// Upper bound on encoder passes before the pipeline gives up.
///
/// Independent of [`DEFAULT_MAX_ENCODING_LENGTH`]: a misbehaving encoder that
/// keeps reporting changes without growing the tag must still terminate.
pub const MAX_ENCODER_PASSES: usize = 16;

// ============================================================================
// Timeouts
// ============================================================================

/// Delay before retrying after the connection enters DISCONNECTED.
pub const DISCONNECTED_RETRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive failed attempts tolerated before the connection is SUSPENDED.
pub const DISCONNECTED_RETRY_LIMIT: u32 = 8;

/// Delay between connection attempts while SUSPENDED.
pub const SUSPENDED_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before re-attaching a channel that became SUSPENDED after a timeout.
pub const CHANNEL_RETRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive attach timeouts tolerated before a channel FAILS.
pub const CHANNEL_RETRY_LIMIT: u32 = 3;

/// Bound on every realtime request: connect, attach, detach, close, token.
pub const REALTIME_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP request timeout for the REST collaborator and auth URL.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle interval assumed until the service announces its own.
pub const DEFAULT_MAX_IDLE_INTERVAL: Duration = Duration::from_secs(15);

/// Tokens are treated as expired this long before their `expires` time.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(15);

/// Default TTL requested for new tokens (60 minutes).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
