//! Text-to-bytes stage, used only ahead of the cipher.

use super::{cipher, Encoder, EncodingError, Payload};
use crate::config::ChannelOptions;
use crate::message::Data;

const TAG: &str = "utf-8";

/// Converts text to UTF-8 bytes so the cipher always sees bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Encoder;

impl Encoder for Utf8Encoder {
    fn name(&self) -> &'static str {
        "utf-8"
    }

    fn handles(&self, tag: &str) -> bool {
        tag == TAG
    }

    fn encode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<bool, EncodingError> {
        if options.cipher.is_none() || payload.has_tag(cipher::is_cipher_tag) {
            return Ok(false);
        }
        let Data::String(text) = &mut payload.data else {
            return Ok(false);
        };
        let bytes = std::mem::take(text).into_bytes();
        payload.data = Data::Binary(bytes);
        payload.push_tag(TAG);
        Ok(true)
    }

    fn decode(&self, payload: &mut Payload, _options: &ChannelOptions) -> Result<(), EncodingError> {
        match &payload.data {
            Data::Binary(bytes) => {
                let text = String::from_utf8(bytes.clone())
                    .map_err(|e| EncodingError::InvalidPayload(format!("invalid UTF-8: {e}")))?;
                payload.data = Data::String(text);
            }
            Data::String(_) => {}
            other => {
                return Err(EncodingError::InvalidPayload(format!(
                    "'utf-8' tag on {} data",
                    other.kind()
                )))
            }
        }
        payload.pop_tag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_without_cipher() {
        let mut payload = Payload::new(Data::String("x".into()), None);
        assert!(!Utf8Encoder.encode(&mut payload, &ChannelOptions::default()).unwrap());
        assert_eq!(payload.encoding, None);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut payload = Payload::new(Data::Binary(vec![0xff, 0xfe]), Some("utf-8".into()));
        let err = Utf8Encoder.decode(&mut payload, &ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidPayload(_)));
        assert_eq!(payload.data, Data::Binary(vec![0xff, 0xfe]));
    }
}
