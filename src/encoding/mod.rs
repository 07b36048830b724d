//! Reversible payload transform chain.
//!
//! A message body travels as a [`Payload`]: the data plus an `encoding` tag
//! listing, left to right, the transforms already applied. Encoders are
//! registered in a fixed order:
//!
//! | Stage | Tag | Encode | Decode |
//! |---|---|---|---|
//! | [`JsonEncoder`] | `json` | structured value to text | text to value |
//! | [`Utf8Encoder`] | `utf-8` | text to bytes, only ahead of a cipher | bytes to text |
//! | [`CipherEncoder`] | `cipher+aes-<bits>-gcm` | encrypt bytes | decrypt bytes |
//! | [`Base64Encoder`] | `base64` | bytes to text | text to bytes |
//!
//! Encoding repeats passes over the chain until a pass changes nothing, so
//! dependent transforms compose (a JSON value on an encrypted channel ends
//! up `json/utf-8/cipher+aes-256-gcm/base64`). Decoding walks the tags right
//! to left and stops at the first tag no encoder recognises, leaving the
//! partially decoded payload and the residual tag in place.
//!
//! Rust guideline compliant 2026-02

mod base64;
mod cipher;
mod json;
mod utf8;

pub use self::base64::Base64Encoder;
pub use self::cipher::{CipherEncoder, CipherParams};
pub use self::json::JsonEncoder;
pub use self::utf8::Utf8Encoder;

use std::fmt::Debug;

use crate::config::ChannelOptions;
use crate::constants::{DEFAULT_MAX_ENCODING_LENGTH, MAX_ENCODER_PASSES};
use crate::error::codes;
use crate::message::Data;

/// Separator between tags in an `encoding` string.
pub const TAG_SEPARATOR: char = '/';

/// Errors raised by the encoder chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    /// A tag no registered encoder can reverse. Carries the residual encoding.
    #[error("unsupported encoding '{0}'")]
    UnsupportedEncoding(String),

    /// Encryption or decryption failed, or the channel has no cipher.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// Data did not have the shape its tag promised.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Encoding tag grew beyond the configured cap.
    #[error("encoding tag is {len} characters, limit is {max}")]
    EncodingTooLong {
        /// Length of the offending tag.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// Encoders kept reporting changes past the pass limit.
    #[error("encoders did not converge after {MAX_ENCODER_PASSES} passes")]
    TooManyPasses,
}

impl EncodingError {
    /// Service error code for this failure.
    pub fn code(&self) -> u32 {
        match self {
            Self::UnsupportedEncoding(_) | Self::Cipher(_) => codes::DECODE_FAILED,
            Self::InvalidPayload(_) | Self::EncodingTooLong { .. } | Self::TooManyPasses => {
                codes::INVALID_MESSAGE_DATA
            }
        }
    }
}

/// Message body and its transform history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    /// Body in its current form.
    pub data: Data,
    /// Applied transforms, `/`-separated, oldest first.
    pub encoding: Option<String>,
}

impl Payload {
    /// Wrap data with an optional existing encoding.
    pub fn new(data: Data, encoding: Option<String>) -> Self {
        Self { data, encoding }
    }

    /// Tags in application order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.encoding
            .as_deref()
            .into_iter()
            .flat_map(|e| e.split(TAG_SEPARATOR))
            .filter(|t| !t.is_empty())
    }

    /// Most recently applied tag.
    pub fn last_tag(&self) -> Option<&str> {
        self.encoding
            .as_deref()
            .and_then(|e| e.rsplit(TAG_SEPARATOR).next())
            .filter(|t| !t.is_empty())
    }

    /// Whether any applied tag satisfies `pred`.
    pub fn has_tag(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.tags().any(pred)
    }

    /// Record a newly applied transform.
    pub fn push_tag(&mut self, tag: &str) {
        match &mut self.encoding {
            Some(e) if !e.is_empty() => {
                e.push(TAG_SEPARATOR);
                e.push_str(tag);
            }
            _ => self.encoding = Some(tag.to_string()),
        }
    }

    /// Remove the most recent tag after reversing it. Empty encoding becomes `None`.
    pub fn pop_tag(&mut self) {
        let Some(e) = &mut self.encoding else { return };
        match e.rfind(TAG_SEPARATOR) {
            Some(idx) => e.truncate(idx),
            None => e.clear(),
        }
        if e.is_empty() {
            self.encoding = None;
        }
    }
}

/// One reversible stage of the chain.
pub trait Encoder: Send + Sync + Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this encoder reverses `tag`.
    fn handles(&self, tag: &str) -> bool;

    /// Apply the transform if it is due. Returns whether the payload changed.
    fn encode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<bool, EncodingError>;

    /// Reverse the most recent tag, which [`Encoder::handles`] accepted, and
    /// pop it. On error the payload is left untouched.
    fn decode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<(), EncodingError>;
}

/// Ordered encoder chain.
#[derive(Debug)]
pub struct EncoderPipeline {
    encoders: Vec<Box<dyn Encoder>>,
    max_encoding_length: usize,
}

impl Default for EncoderPipeline {
    fn default() -> Self {
        Self::standard(DEFAULT_MAX_ENCODING_LENGTH)
    }
}

impl EncoderPipeline {
    /// JSON, UTF-8, cipher, base64, in that order.
    pub fn standard(max_encoding_length: usize) -> Self {
        Self::new(
            vec![
                Box::new(JsonEncoder),
                Box::new(Utf8Encoder),
                Box::new(CipherEncoder),
                Box::new(Base64Encoder),
            ],
            max_encoding_length,
        )
    }

    /// Chain with a custom encoder list, applied in the given order.
    pub fn new(encoders: Vec<Box<dyn Encoder>>, max_encoding_length: usize) -> Self {
        Self {
            encoders,
            max_encoding_length,
        }
    }

    /// Apply every due transform until the payload stops changing.
    pub fn encode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<(), EncodingError> {
        for _ in 0..MAX_ENCODER_PASSES {
            let mut changed = false;
            for encoder in &self.encoders {
                changed |= encoder.encode(payload, options)?;
            }

            let len = payload.encoding.as_deref().map_or(0, str::len);
            if len > self.max_encoding_length {
                return Err(EncodingError::EncodingTooLong {
                    len,
                    max: self.max_encoding_length,
                });
            }
            if !changed {
                return Ok(());
            }
        }
        Err(EncodingError::TooManyPasses)
    }

    /// Reverse the tags right to left.
    ///
    /// On failure `payload` holds whatever decoded before the failing tag,
    /// and its `encoding` still lists the tags not reversed.
    pub fn decode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<(), EncodingError> {
        while let Some(tag) = payload.last_tag() {
            let Some(encoder) = self.encoders.iter().find(|e| e.handles(tag)) else {
                return Err(EncodingError::UnsupportedEncoding(
                    payload.encoding.clone().unwrap_or_default(),
                ));
            };
            log::trace!("[Encoding] {} decoding '{}'", encoder.name(), tag);
            encoder.decode(payload, options)?;
        }
        // An empty segment stops the loop early; whatever is left is residual.
        if let Some(residual) = payload.encoding.as_deref().filter(|e| !e.is_empty()) {
            return Err(EncodingError::UnsupportedEncoding(residual.to_string()));
        }
        payload.encoding = None;
        Ok(())
    }
}
