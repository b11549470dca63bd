//! Control-channel message model
//!
//! Every frame carries one [`Envelope`]: an optional request id plus a [`Message`]
//! whose `data` shape is fixed by its `type`:
//!
//! ```json
//! {"id": 7, "type": "hello", "data": {"identity": "0f6c..."}}
//! {"id": null, "type": "command", "data": {"text": "PING"}}
//! ```
//!
//! Replies echo the id of the request they answer. Server pushes carry `id: null`,
//! which is how the agent tells them apart from replies.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Hardware description sent with `Register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "ipAddress", default)]
    pub ip_address: String,
    #[serde(rename = "macAddress", default)]
    pub mac_address: String,
    #[serde(rename = "hardwareID")]
    pub hardware_id: String,
}

/// Category of an `Error` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handshake incomplete or credentials rejected
    Auth,
    /// Identity unknown to the controller
    NotRegistered,
    /// Message not valid in this state
    Protocol,
    /// Controller-side failure
    Internal,
}

/// Closed set of control-channel messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Register(DeviceInfo),
    RegisterAck { identity: String, code: String },
    Hello { identity: String },
    /// Reply to the first `Hello`; `key` is present only when a key was just issued
    KeyIssued { key: Option<String> },
    Auth { identity: String, key: String },
    AuthResult { success: bool, message: String },
    RequestOtp { identity: String },
    /// `ttl` in seconds
    OtpResult { value: String, ttl: u64 },
    Log { identity: String, line: String },
    Command { text: String },
    Ack,
    Error { kind: ErrorKind, message: String },
}

impl Message {
    /// Stable name of the variant, as it appears in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register(_) => "register",
            Message::RegisterAck { .. } => "register_ack",
            Message::Hello { .. } => "hello",
            Message::KeyIssued { .. } => "key_issued",
            Message::Auth { .. } => "auth",
            Message::AuthResult { .. } => "auth_result",
            Message::RequestOtp { .. } => "request_otp",
            Message::OtpResult { .. } => "otp_result",
            Message::Log { .. } => "log",
            Message::Command { .. } => "command",
            Message::Ack => "ack",
            Message::Error { .. } => "error",
        }
    }

    /// Messages accepted before the connection is authenticated
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::Register(_) | Message::Hello { .. } | Message::Auth { .. }
        )
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Message::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn command(text: impl Into<String>) -> Self {
        Message::Command { text: text.into() }
    }
}

/// Wire unit: request id plus message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// A request or reply carrying `id`
    pub fn with_id(id: u64, message: Message) -> Self {
        Self {
            id: Some(id),
            message,
        }
    }

    /// An unsolicited server push
    pub fn push(message: Message) -> Self {
        Self { id: None, message }
    }

    /// Reply to this envelope, echoing its id
    pub fn reply(&self, message: Message) -> Self {
        Self {
            id: self.id,
            message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
