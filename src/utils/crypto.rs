//! # Cipher Provider
//!
//! AES-128 in CFB mode with a fresh random IV per call.
//!
//! Ciphertext layout: `[IV (16 bytes)][CFB output]`.
//!
//! There is no authentication tag. A truncated ciphertext decrypts to a truncated
//! plaintext and a flipped bit decrypts to garbage; neither is reported as an error.
//! Callers that need integrity must get it from the layer above (JSON parsing
//! rejects most corrupted frames) or from TLS.

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use std::fmt;
use zeroize::Zeroize;

use crate::error::{constants, ChannelError, Result};

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

/// AES block size, also the IV length
pub const IV_SIZE: usize = 16;

/// Length of the AES-128 key material
pub const KEY_SIZE: usize = 16;

/// Number of random bytes behind a session key (hex-encoded to 32 chars)
pub const SESSION_KEY_BYTES: usize = 16;

/// Symmetric cipher bound to one key
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_SIZE],
}

impl Cipher {
    /// Build a cipher from raw key material. Only the first 16 bytes are used.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() < KEY_SIZE {
            return Err(ChannelError::Crypto(
                constants::ERR_INVALID_KEY_LENGTH.into(),
            ));
        }
        let mut material = [0u8; KEY_SIZE];
        material.copy_from_slice(&key[..KEY_SIZE]);
        Ok(Self { key: material })
    }

    /// Build a cipher from a hex session key as issued during the handshake.
    ///
    /// The first 16 characters of the key string are the AES key material.
    pub fn from_session_key(key: &str) -> Result<Self> {
        Self::new(key.as_bytes())
    }

    /// Encrypt `plaintext`, prepending a freshly generated IV
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        getrandom::fill(&mut iv)
            .map_err(|_| ChannelError::Crypto(constants::ERR_RANDOM_SOURCE.into()))?;

        let mut out = Vec::with_capacity(IV_SIZE + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);

        Aes128CfbEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| ChannelError::Crypto(e.to_string()))?
            .encrypt(&mut out[IV_SIZE..]);
        Ok(out)
    }

    /// Split the IV off `ciphertext` and decrypt the remainder
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < IV_SIZE {
            return Err(ChannelError::Crypto(
                constants::ERR_CIPHERTEXT_TOO_SHORT.into(),
            ));
        }
        let (iv, body) = ciphertext.split_at(IV_SIZE);
        let mut out = body.to_vec();

        Aes128CfbDec::new_from_slices(&self.key, iv)
            .map_err(|e| ChannelError::Crypto(e.to_string()))?
            .decrypt(&mut out);
        Ok(out)
    }

    /// Encrypt a string field and encode it as standard base64
    pub fn encrypt_field(&self, plaintext: &str) -> Result<String> {
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Decode a base64 field and decrypt it back to a string
    pub fn decrypt_field(&self, field: &str) -> Result<String> {
        let raw = STANDARD
            .decode(field)
            .map_err(|_| ChannelError::Crypto(constants::ERR_INVALID_BASE64.into()))?;
        let plain = self.decrypt(&raw)?;
        String::from_utf8(plain).map_err(|e| ChannelError::Crypto(e.to_string()))
    }
}

impl Drop for Cipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

/// One-shot encryption with raw key material
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    Cipher::new(key)?.encrypt(plaintext)
}

/// One-shot decryption with raw key material
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    Cipher::new(key)?.decrypt(ciphertext)
}

/// Generate a session key: 16 random bytes, lowercase hex
pub fn generate_session_key() -> Result<String> {
    let mut raw = [0u8; SESSION_KEY_BYTES];
    getrandom::fill(&mut raw)
        .map_err(|_| ChannelError::Crypto(constants::ERR_RANDOM_SOURCE.into()))?;
    let key = hex::encode(raw);
    raw.zeroize();
    Ok(key)
}
