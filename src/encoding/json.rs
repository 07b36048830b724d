//! Structured value stage.

use super::{Encoder, EncodingError, Payload};
use crate::config::ChannelOptions;
use crate::message::Data;

const TAG: &str = "json";

/// Serialises [`Data::Json`] values to text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn handles(&self, tag: &str) -> bool {
        tag == TAG
    }

    fn encode(&self, payload: &mut Payload, _options: &ChannelOptions) -> Result<bool, EncodingError> {
        let Data::Json(value) = &payload.data else {
            return Ok(false);
        };
        let text = serde_json::to_string(value)
            .map_err(|e| EncodingError::InvalidPayload(format!("JSON serialisation failed: {e}")))?;
        payload.data = Data::String(text);
        payload.push_tag(TAG);
        Ok(true)
    }

    fn decode(&self, payload: &mut Payload, _options: &ChannelOptions) -> Result<(), EncodingError> {
        let value = match &payload.data {
            Data::String(text) => serde_json::from_str(text),
            Data::Binary(bytes) => serde_json::from_slice(bytes),
            other => {
                return Err(EncodingError::InvalidPayload(format!(
                    "'json' tag on non-text data ({})",
                    other.kind()
                )))
            }
        }
        .map_err(|e| EncodingError::InvalidPayload(format!("invalid JSON: {e}")))?;
        payload.data = Data::Json(value);
        payload.pop_tag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_json_leaves_payload() {
        let mut payload = Payload::new(Data::String("{nope".into()), Some("json".into()));
        let err = JsonEncoder.decode(&mut payload, &ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidPayload(_)));
        assert_eq!(payload.data, Data::String("{nope".into()));
        assert_eq!(payload.encoding.as_deref(), Some("json"));
    }

    #[test]
    fn test_plain_string_not_encoded() {
        let mut payload = Payload::new(Data::String("x".into()), None);
        assert!(!JsonEncoder.encode(&mut payload, &ChannelOptions::default()).unwrap());
    }
}
