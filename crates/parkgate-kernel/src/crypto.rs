//! Envelope codec for the messaging platform callback protocol.
//!
//! Plaintext layout: 16 random bytes, a 4-byte big-endian content length,
//! the content, then the receiver (corp) id. The whole buffer is padded
//! PKCS7-style to a 32-byte multiple and encrypted with AES-256-CBC using
//! the first 16 key bytes as IV.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX: usize = 16;

// Platform keys are not canonical base64: the last symbol may carry non-zero trailing bits.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signature verification failed")]
    AuthenticationFailed,
    #[error("envelope corrupt: {0}")]
    EnvelopeCorrupt(String),
    #[error("invalid encoding key: {0}")]
    InvalidKey(String),
}

/// Hex SHA-1 over the lexicographically sorted concatenation of the four inputs.
pub fn signature(token: &str, timestamp: &str, nonce: &str, payload: &str) -> String {
    let mut parts = [token, timestamp, nonce, payload];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn verify_signature(
    token: &str,
    expected: &str,
    timestamp: &str,
    nonce: &str,
    payload: &str,
) -> Result<(), CryptoError> {
    let actual = signature(token, timestamp, nonce, payload);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(CryptoError::AuthenticationFailed)
    }
}

#[derive(Clone)]
pub struct MsgCrypt {
    key: [u8; 32],
    corp_id: String,
}

impl std::fmt::Debug for MsgCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgCrypt")
            .field("corp_id", &self.corp_id)
            .finish_non_exhaustive()
    }
}

impl MsgCrypt {
    pub fn new(encoding_aes_key: &str, corp_id: &str) -> Result<Self, CryptoError> {
        if encoding_aes_key.len() != 43 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 43 characters, got {}",
                encoding_aes_key.len()
            )));
        }
        let raw = LENIENT
            .decode(format!("{encoding_aes_key}="))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("decoded key is not 32 bytes".to_string()))?;
        Ok(Self {
            key,
            corp_id: corp_id.to_string(),
        })
    }

    pub fn corp_id(&self) -> &str {
        &self.corp_id
    }

    fn iv(&self) -> &[u8] {
        &self.key[..16]
    }

    /// Decrypts a base64 envelope and returns the embedded content bytes.
    pub fn decrypt(&self, encrypted_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let cipher_bytes = STANDARD
            .decode(encrypted_b64.trim())
            .map_err(|e| CryptoError::EnvelopeCorrupt(format!("base64: {e}")))?;
        if cipher_bytes.is_empty() || cipher_bytes.len() % 16 != 0 {
            return Err(CryptoError::EnvelopeCorrupt(
                "ciphertext is not a whole number of blocks".to_string(),
            ));
        }
        let dec = Aes256CbcDec::new_from_slices(&self.key, self.iv())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let plain = dec
            .decrypt_padded_vec_mut::<NoPadding>(&cipher_bytes)
            .map_err(|e| CryptoError::EnvelopeCorrupt(e.to_string()))?;

        let plain = strip_padding(&plain)?;
        if plain.len() < RANDOM_PREFIX + 4 {
            return Err(CryptoError::EnvelopeCorrupt("plaintext too short".to_string()));
        }
        let body = &plain[RANDOM_PREFIX..];
        let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let rest = &body[4..];
        if len > rest.len() {
            return Err(CryptoError::EnvelopeCorrupt(format!(
                "length prefix {len} exceeds payload of {} bytes",
                rest.len()
            )));
        }
        let (content, receiver) = rest.split_at(len);
        if receiver != self.corp_id.as_bytes() {
            return Err(CryptoError::EnvelopeCorrupt(
                "receiver id does not match corp id".to_string(),
            ));
        }
        Ok(content.to_vec())
    }

    pub fn encrypt(&self, reply: &[u8]) -> Result<String, CryptoError> {
        let prefix: Vec<u8> = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_PREFIX)
            .collect();
        self.encrypt_with_prefix(&prefix, reply)
    }

    fn encrypt_with_prefix(&self, prefix: &[u8], reply: &[u8]) -> Result<String, CryptoError> {
        let len = u32::try_from(reply.len())
            .map_err(|_| CryptoError::EnvelopeCorrupt("reply too large".to_string()))?;
        let mut plain = Vec::with_capacity(prefix.len() + 4 + reply.len() + self.corp_id.len() + PAD_BLOCK);
        plain.extend_from_slice(prefix);
        plain.extend_from_slice(&len.to_be_bytes());
        plain.extend_from_slice(reply);
        plain.extend_from_slice(self.corp_id.as_bytes());
        let pad = PAD_BLOCK - plain.len() % PAD_BLOCK;
        plain.extend(std::iter::repeat(pad as u8).take(pad));

        let enc = Aes256CbcEnc::new_from_slices(&self.key, self.iv())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let cipher_bytes = enc.encrypt_padded_vec_mut::<NoPadding>(&plain);
        Ok(STANDARD.encode(cipher_bytes))
    }
}

fn strip_padding(plain: &[u8]) -> Result<&[u8], CryptoError> {
    let pad = *plain
        .last()
        .ok_or_else(|| CryptoError::EnvelopeCorrupt("empty plaintext".to_string()))?
        as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > plain.len() {
        return Err(CryptoError::EnvelopeCorrupt(format!(
            "pad length {pad} out of range"
        )));
    }
    Ok(&plain[..plain.len() - pad])
}
