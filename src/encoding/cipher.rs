//! Channel encryption stage (AES-GCM).
//!
//! Ciphertext layout: 12-byte random nonce followed by the AES-GCM output
//! (ciphertext plus 16-byte tag). The encoding tag names the key size, e.g.
//! `cipher+aes-256-gcm`, so a receiver configured with a different key size
//! fails fast instead of attempting the wrong algorithm.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use super::{Encoder, EncodingError, Payload};
use crate::config::ChannelOptions;
use crate::error::{Error, Result};
use crate::message::Data;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

const TAG_PREFIX: &str = "cipher+";

pub(super) fn is_cipher_tag(tag: &str) -> bool {
    tag.starts_with(TAG_PREFIX)
}

/// Channel encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherParams {
    key: Vec<u8>,
}

impl std::fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherParams")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl CipherParams {
    /// Key must be 16 or 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 | 32 => Ok(Self { key: key.to_vec() }),
            n => Err(Error::InvalidArgument(format!(
                "cipher key must be 128 or 256 bits, got {} bits",
                n * 8
            ))),
        }
    }

    /// Key supplied as base64 text.
    pub fn from_base64(key: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| Error::InvalidArgument(format!("cipher key is not base64: {e}")))?;
        Self::new(&bytes)
    }

    /// Fresh random key of `bits` (128 or 256).
    pub fn generate(bits: usize) -> Result<Self> {
        if bits != 128 && bits != 256 {
            return Err(Error::InvalidArgument(format!(
                "cipher key must be 128 or 256 bits, got {bits}"
            )));
        }
        let mut key = vec![0u8; bits / 8];
        rand::rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    /// Key length in bits.
    pub fn key_length(&self) -> usize {
        self.key.len() * 8
    }

    /// Algorithm part of the encoding tag, e.g. `aes-256-gcm`.
    pub fn algorithm(&self) -> String {
        format!("aes-{}-gcm", self.key_length())
    }

    fn tag(&self) -> String {
        format!("{TAG_PREFIX}{}", self.algorithm())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncodingError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match self.key.len() {
            16 => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|e| EncodingError::Cipher(e.to_string()))?
                .encrypt(nonce, plaintext),
            _ => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| EncodingError::Cipher(e.to_string()))?
                .encrypt(nonce, plaintext),
        }
        .map_err(|e| EncodingError::Cipher(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncodingError> {
        if data.len() < NONCE_SIZE {
            return Err(EncodingError::Cipher(format!(
                "ciphertext too short ({} bytes)",
                data.len()
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        match self.key.len() {
            16 => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|e| EncodingError::Cipher(e.to_string()))?
                .decrypt(nonce, ciphertext),
            _ => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| EncodingError::Cipher(e.to_string()))?
                .decrypt(nonce, ciphertext),
        }
        .map_err(|e| EncodingError::Cipher(format!("decryption failed: {e}")))
    }
}

/// Encrypts bytes on channels configured with [`CipherParams`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CipherEncoder;

impl Encoder for CipherEncoder {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn handles(&self, tag: &str) -> bool {
        is_cipher_tag(tag)
    }

    fn encode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<bool, EncodingError> {
        let Some(params) = &options.cipher else {
            return Ok(false);
        };
        if payload.has_tag(is_cipher_tag) {
            return Ok(false);
        }
        let Data::Binary(bytes) = &payload.data else {
            return Ok(false);
        };
        payload.data = Data::Binary(params.encrypt(bytes)?);
        payload.push_tag(&params.tag());
        Ok(true)
    }

    fn decode(&self, payload: &mut Payload, options: &ChannelOptions) -> Result<(), EncodingError> {
        let Some(params) = &options.cipher else {
            return Err(EncodingError::Cipher(
                "message is encrypted but the channel has no cipher".to_string(),
            ));
        };
        let expected = params.tag();
        if payload.last_tag() != Some(expected.as_str()) {
            return Err(EncodingError::Cipher(format!(
                "channel cipher is {expected}, message uses {}",
                payload.last_tag().unwrap_or_default()
            )));
        }
        let Data::Binary(bytes) = &payload.data else {
            return Err(EncodingError::InvalidPayload(format!(
                "cipher tag on {} data",
                payload.data.kind()
            )));
        };
        payload.data = Data::Binary(params.decrypt(bytes)?);
        payload.pop_tag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(key: &[u8]) -> ChannelOptions {
        ChannelOptions {
            cipher: Some(CipherParams::new(key).unwrap()),
        }
    }

    #[test]
    fn test_aes128_tag_and_roundtrip() {
        let opts = options(&[3u8; 16]);
        let mut payload = Payload::new(Data::Binary(b"secret".to_vec()), None);
        assert!(CipherEncoder.encode(&mut payload, &opts).unwrap());
        assert_eq!(payload.encoding.as_deref(), Some("cipher+aes-128-gcm"));
        assert_ne!(payload.data, Data::Binary(b"secret".to_vec()));

        CipherEncoder.decode(&mut payload, &opts).unwrap();
        assert_eq!(payload.data, Data::Binary(b"secret".to_vec()));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut payload = Payload::new(Data::Binary(b"secret".to_vec()), None);
        CipherEncoder.encode(&mut payload, &options(&[1u8; 32])).unwrap();
        let err = CipherEncoder
            .decode(&mut payload, &options(&[2u8; 32]))
            .unwrap_err();
        assert!(matches!(err, EncodingError::Cipher(_)));
    }

    #[test]
    fn test_key_size_mismatch_fails() {
        let mut payload = Payload::new(Data::Binary(b"secret".to_vec()), None);
        CipherEncoder.encode(&mut payload, &options(&[1u8; 32])).unwrap();
        let err = CipherEncoder
            .decode(&mut payload, &options(&[1u8; 16]))
            .unwrap_err();
        assert!(err.to_string().contains("aes-128-gcm"));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(CipherParams::new(&[0u8; 24]).is_err());
        assert!(CipherParams::generate(192).is_err());
        assert_eq!(CipherParams::generate(128).unwrap().key_length(), 128);
    }

    #[test]
    fn test_from_base64() {
        let key = BASE64.encode([5u8; 32]);
        let params = CipherParams::from_base64(&key).unwrap();
        assert_eq!(params.algorithm(), "aes-256-gcm");
        assert!(CipherParams::from_base64("!!").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let params = CipherParams::new(&[0xAB; 16]).unwrap();
        let debug = format!("{params:?}");
        assert!(!debug.contains("171"));
        assert!(debug.contains("aes-128-gcm"));
    }
}
