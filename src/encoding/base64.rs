//! Binary-safe wrapping for text transports.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::{Encoder, EncodingError, Payload};
use crate::config::ChannelOptions;
use crate::message::Data;

const TAG: &str = "base64";

/// Wraps raw bytes as base64 text. Always the last stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Encoder;

impl Encoder for Base64Encoder {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn handles(&self, tag: &str) -> bool {
        tag == TAG
    }

    fn encode(&self, payload: &mut Payload, _options: &ChannelOptions) -> Result<bool, EncodingError> {
        let Data::Binary(bytes) = &payload.data else {
            return Ok(false);
        };
        payload.data = Data::String(BASE64.encode(bytes));
        payload.push_tag(TAG);
        Ok(true)
    }

    fn decode(&self, payload: &mut Payload, _options: &ChannelOptions) -> Result<(), EncodingError> {
        match &payload.data {
            Data::String(text) => {
                let bytes = BASE64
                    .decode(text)
                    .map_err(|e| EncodingError::InvalidPayload(format!("invalid base64: {e}")))?;
                payload.data = Data::Binary(bytes);
            }
            // Binary transports deliver bytes already.
            Data::Binary(_) => {}
            other => {
                return Err(EncodingError::InvalidPayload(format!(
                    "'base64' tag on {} data",
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
    fn test_invalid_base64_rejected() {
        let mut payload = Payload::new(Data::String("***".into()), Some("base64".into()));
        let err = Base64Encoder.decode(&mut payload, &ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidPayload(_)));
        assert_eq!(payload.encoding.as_deref(), Some("base64"));
    }

    #[test]
    fn test_binary_data_already_decoded() {
        let mut payload = Payload::new(Data::Binary(vec![1]), Some("base64".into()));
        Base64Encoder.decode(&mut payload, &ChannelOptions::default()).unwrap();
        assert_eq!(payload.data, Data::Binary(vec![1]));
        assert_eq!(payload.encoding, None);
    }
}
