//! Legacy stream mode.
//!
//! JSON objects written back to back on the raw stream, with no length prefix.
//! Message boundaries come from the JSON decoder itself, so a peer that writes a
//! malformed object desynchronizes the whole stream; the connection is closed when
//! that happens.
//!
//! With per-field encryption on, only `content` and `key` are encrypted, each as
//! `base64(IV || AES-128-CFB(field))` under the client's session key.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ChannelError, Result};
use crate::utils::crypto::Cipher;

/// Legacy message discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LegacyKind {
    Hello,
    Auth,
    Msg,
    Cmd,
}

/// One legacy wire object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMessage {
    #[serde(rename = "type")]
    pub kind: LegacyKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(
        rename = "clientID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_id: Option<String>,
}

impl LegacyMessage {
    pub fn new(kind: LegacyKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            key: None,
            client_id: None,
        }
    }

    pub fn hello(client_id: &str) -> Self {
        Self::new(LegacyKind::Hello, "").with_client_id(client_id)
    }

    pub fn auth(client_id: &str, key: &str) -> Self {
        Self::new(LegacyKind::Auth, "")
            .with_client_id(client_id)
            .with_key(key)
    }

    pub fn msg(client_id: &str, content: &str) -> Self {
        Self::new(LegacyKind::Msg, content).with_client_id(client_id)
    }

    pub fn cmd(content: &str) -> Self {
        Self::new(LegacyKind::Cmd, content)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Per-field encryption for legacy messages
#[derive(Debug, Clone)]
pub struct FieldCipher {
    cipher: Cipher,
}

impl FieldCipher {
    /// Bind to a client's session key (first 16 bytes are the AES key)
    pub fn new(session_key: &str) -> Result<Self> {
        Ok(Self {
            cipher: Cipher::from_session_key(session_key)?,
        })
    }

    /// Encrypt `content` (when non-empty) and `key` in place
    pub fn seal(&self, msg: &mut LegacyMessage) -> Result<()> {
        if !msg.content.is_empty() {
            msg.content = self.cipher.encrypt_field(&msg.content)?;
        }
        if let Some(key) = msg.key.as_mut() {
            *key = self.cipher.encrypt_field(key)?;
        }
        Ok(())
    }

    /// Decrypt `content` (when non-empty) and `key` in place
    pub fn open(&self, msg: &mut LegacyMessage) -> Result<()> {
        if !msg.content.is_empty() {
            msg.content = self.cipher.decrypt_field(&msg.content)?;
        }
        if let Some(key) = msg.key.as_mut() {
            *key = self.cipher.decrypt_field(key)?;
        }
        Ok(())
    }

    /// Decrypt each field on its own. A field that fails stays as it arrived.
    ///
    /// Returns false when any field could not be decrypted.
    pub fn open_each(&self, msg: &mut LegacyMessage) -> bool {
        let mut intact = true;
        if !msg.content.is_empty() {
            match self.cipher.decrypt_field(&msg.content) {
                Ok(plain) => msg.content = plain,
                Err(_) => intact = false,
            }
        }
        if let Some(key) = msg.key.as_mut() {
            match self.cipher.decrypt_field(key) {
                Ok(plain) => *key = plain,
                Err(_) => intact = false,
            }
        }
        intact
    }
}

/// Stream codec for concatenated legacy JSON objects
#[derive(Debug, Clone)]
pub struct LegacyCodec {
    max_message_size: usize,
}

impl LegacyCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for LegacyCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LegacyCodec {
    type Item = LegacyMessage;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let (parsed, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&src[..]).into_iter::<LegacyMessage>();
            let parsed = stream.next();
            (parsed, stream.byte_offset())
        };

        match parsed {
            Some(Ok(msg)) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_message_size {
                    return Err(ChannelError::OversizedFrame(src.len()));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(ChannelError::Protocol(format!(
                "Malformed legacy message: {e}"
            ))),
            None => {
                // only whitespace buffered
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<LegacyMessage> for LegacyCodec {
    type Error = ChannelError;

    fn encode(&mut self, msg: LegacyMessage, dst: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(&msg)?;
        if bytes.len() > self.max_message_size {
            return Err(ChannelError::OversizedFrame(bytes.len()));
        }
        dst.reserve(bytes.len() + 1);
        dst.extend_from_slice(&bytes);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
