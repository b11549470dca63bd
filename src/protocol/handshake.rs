//! Registration and authentication handshake
//!
//! Server side, per connection:
//!
//! ```text
//! Unregistered --Register--> Registered --Hello--> AwaitingAuth --Auth(ok)--> Authenticated
//!                                  ^                    |
//!                                  +----Auth(bad)-------+ (stays AwaitingAuth)
//! ```
//!
//! A connection for an identity the agent already holds skips `Register` and starts
//! with `Hello`. State lives in a [`ServerHandshake`] owned by the connection, so
//! concurrent handshakes never share anything but the identity store.
//!
//! The client side is [`client_handshake`], which runs the same exchange over the
//! two framed halves of a fresh connection before the request dispatcher takes them.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::RegistrationPolicy;
use crate::error::{constants, ChannelError, Result};
use crate::protocol::message::{DeviceInfo, Envelope, ErrorKind, Message};
use crate::store::IdentityStore;
use crate::utils::timeout::with_timeout_error;

/// Server-side state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Unregistered,
    Registered { identity: String },
    AwaitingAuth { identity: String },
    Authenticated { identity: String },
}

/// Per-connection handshake driver
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    store: Arc<IdentityStore>,
    policy: RegistrationPolicy,
}

impl ServerHandshake {
    pub fn new(store: Arc<IdentityStore>, policy: RegistrationPolicy) -> Self {
        Self {
            state: HandshakeState::Unregistered,
            store,
            policy,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, HandshakeState::Authenticated { .. })
    }

    /// Identity the connection is bound to, once known
    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            HandshakeState::Unregistered => None,
            HandshakeState::Registered { identity }
            | HandshakeState::AwaitingAuth { identity }
            | HandshakeState::Authenticated { identity } => Some(identity),
        }
    }

    /// Process one message received before authentication and produce the reply.
    ///
    /// Non-handshake messages are answered with `Error{auth}` and leave the state
    /// unchanged. Store failures other than an unknown identity propagate.
    #[instrument(level = "debug", skip(self, msg), fields(kind = msg.kind()))]
    pub async fn handle(&mut self, msg: Message) -> Result<Message> {
        if self.is_authenticated() {
            return Ok(Message::error(
                ErrorKind::Protocol,
                constants::ERR_ALREADY_AUTHENTICATED,
            ));
        }

        match msg {
            Message::Register(device) => self.on_register(device).await,
            Message::Hello { identity } => self.on_hello(identity).await,
            Message::Auth { identity, key } => self.on_auth(identity, key).await,
            other => {
                debug!(kind = other.kind(), "Rejected before authentication");
                Ok(Message::error(
                    ErrorKind::Auth,
                    constants::ERR_NOT_AUTHENTICATED,
                ))
            }
        }
    }

    async fn on_register(&mut self, device: DeviceInfo) -> Result<Message> {
        let record = self.store.register(device, self.policy).await?;
        self.state = HandshakeState::Registered {
            identity: record.id.clone(),
        };
        Ok(Message::RegisterAck {
            identity: record.id,
            code: record.code,
        })
    }

    async fn on_hello(&mut self, identity: String) -> Result<Message> {
        let key = match self.store.issue_key_if_absent(&identity).await {
            Ok(key) => key,
            Err(ChannelError::NotRegistered) => {
                debug!(%identity, "Hello from unknown identity");
                return Ok(Message::error(
                    ErrorKind::NotRegistered,
                    constants::ERR_UNKNOWN_IDENTITY,
                ));
            }
            Err(e) => return Err(e),
        };
        if key.is_some() {
            info!(%identity, "Session key issued");
        }
        self.state = HandshakeState::AwaitingAuth { identity };
        Ok(Message::KeyIssued { key })
    }

    async fn on_auth(&mut self, identity: String, key: String) -> Result<Message> {
        let bound = match &self.state {
            HandshakeState::AwaitingAuth { identity } => identity.clone(),
            _ => {
                return Ok(Message::AuthResult {
                    success: false,
                    message: constants::ERR_NOT_AUTHENTICATED.to_string(),
                })
            }
        };
        if bound != identity {
            warn!(%bound, presented = %identity, "Auth for a different identity");
            return Ok(Message::AuthResult {
                success: false,
                message: constants::ERR_IDENTITY_MISMATCH.to_string(),
            });
        }

        match self.store.verify_key(&identity, &key) {
            Ok(true) => {}
            Ok(false) => {
                warn!(%identity, "Auth failed: key mismatch");
                return Ok(Message::AuthResult {
                    success: false,
                    message: "Auth failed".to_string(),
                });
            }
            Err(ChannelError::NotRegistered) => {
                return Ok(Message::error(
                    ErrorKind::NotRegistered,
                    constants::ERR_UNKNOWN_IDENTITY,
                ))
            }
            Err(e) => return Err(e),
        }

        self.store.mark_authenticated(&identity).await?;
        info!(%identity, "Identity authenticated");
        self.state = HandshakeState::Authenticated { identity };
        Ok(Message::AuthResult {
            success: true,
            message: "Auth success".to_string(),
        })
    }
}

/// What an agent keeps between connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub identity: String,
    pub code: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// Monotonic request ids for the handshake exchange
#[derive(Debug)]
struct Exchange<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
    next_id: u64,
    timeout: Duration,
}

impl<R, W> Exchange<'_, R, W>
where
    R: Stream<Item = Result<Vec<u8>>> + Unpin,
    W: Sink<Vec<u8>, Error = ChannelError> + Unpin,
{
    async fn call(&mut self, msg: Message) -> Result<Message> {
        let id = self.next_id;
        self.next_id += 1;
        self.writer.send(Envelope::with_id(id, msg).to_bytes()?).await?;

        let reader = &mut *self.reader;
        with_timeout_error(
            async move {
                loop {
                    let frame = reader.next().await.ok_or(ChannelError::ConnectionClosed)??;
                    let env = Envelope::from_bytes(&frame)?;
                    if env.id == Some(id) {
                        return Ok::<_, ChannelError>(env.message);
                    }
                    debug!(id = ?env.id, "Ignoring frame during handshake");
                }
            },
            self.timeout,
        )
        .await
    }
}

/// Run Register/Hello/Auth from the agent side.
///
/// `cached` is whatever the agent remembered from a previous session. `Register` is
/// sent only when nothing is cached or the server no longer knows the identity. A
/// lost or rejected key triggers exactly one re-registration. Returns the
/// credentials to cache, with the key that authenticated this connection.
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    cached: Option<ClientCredentials>,
    device: &DeviceInfo,
    timeout: Duration,
) -> Result<ClientCredentials>
where
    R: Stream<Item = Result<Vec<u8>>> + Unpin,
    W: Sink<Vec<u8>, Error = ChannelError> + Unpin,
{
    let mut io = Exchange {
        reader,
        writer,
        next_id: 1,
        timeout,
    };
    let mut creds = cached;
    let mut registered_now = false;

    loop {
        let mut current = match creds.take() {
            Some(c) => c,
            None => {
                registered_now = true;
                match io.call(Message::Register(device.clone())).await? {
                    Message::RegisterAck { identity, code } => {
                        info!(%identity, %code, "Registered with controller");
                        ClientCredentials {
                            identity,
                            code,
                            key: None,
                        }
                    }
                    other => return Err(unexpected(&other)),
                }
            }
        };

        let hello = Message::Hello {
            identity: current.identity.clone(),
        };
        match io.call(hello).await? {
            Message::KeyIssued { key: Some(key) } => current.key = Some(key),
            Message::KeyIssued { key: None } if current.key.is_some() => {}
            Message::KeyIssued { key: None } => {
                if registered_now {
                    return Err(ChannelError::Auth(constants::ERR_NO_KEY.into()));
                }
                warn!(identity = %current.identity, "Key lost locally, registering again");
                continue;
            }
            Message::Error {
                kind: ErrorKind::NotRegistered,
                ..
            } => {
                if registered_now {
                    return Err(ChannelError::NotRegistered);
                }
                warn!(identity = %current.identity, "Controller does not know this identity");
                continue;
            }
            other => return Err(unexpected(&other)),
        }

        let auth = Message::Auth {
            identity: current.identity.clone(),
            key: current.key.clone().unwrap_or_default(),
        };
        match io.call(auth).await? {
            Message::AuthResult { success: true, .. } => {
                info!(identity = %current.identity, "Authenticated");
                return Ok(current);
            }
            Message::AuthResult {
                success: false,
                message,
            } => {
                if registered_now {
                    return Err(ChannelError::Auth(message));
                }
                warn!(identity = %current.identity, %message, "Key rejected, registering again");
            }
            other => return Err(unexpected(&other)),
        }
    }
}

fn unexpected(msg: &Message) -> ChannelError {
    match msg {
        Message::Error { kind, message } => {
            ChannelError::Protocol(format!("Controller error ({kind:?}): {message}"))
        }
        other => ChannelError::Protocol(format!(
            "{}: {}",
            constants::ERR_UNEXPECTED_REPLY,
            other.kind()
        )),
    }
}
