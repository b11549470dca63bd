//! Legacy wire mode, server and client side.
//!
//! Same structure as the framed supervisor: ordered reads, one writer task, pending
//! commands pushed from the shared [`CommandQueue`](crate::store::CommandQueue). What
//! differs is the vocabulary:
//!
//! | client sends | server replies |
//! |---|---|
//! | `HELLO` + clientID | `HELLO` "Key registered" with a fresh key, in clear |
//! | `AUTH` + key | `AUTH` "Auth success" / "Auth failed" |
//! | `MSG` | `MSG` "Received: ..." once authenticated |
//!
//! A field that does not decrypt under the stored key is kept as sent: on `AUTH` it
//! counts as a key mismatch, on `MSG` the reply is "Decrypt failed". Neither closes
//! the connection.
//!
//! With encryption on, `content` and `key` travel encrypted under the client's key
//! except in the HELLO reply, which is how the client learns that key. Replies carry
//! no correlation id, so a pushed `CMD` may arrive between a request and its reply.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::legacy::{FieldCipher, LegacyCodec, LegacyKind, LegacyMessage};
use crate::error::{constants, ChannelError, Result};
use crate::protocol::message::Message;
use crate::protocol::router::RequestContext;
use crate::service::supervisor::{
    finish_connection, record_activity, wait_for, ServerContext, OUTBOUND_QUEUE, WRITER_DRAIN,
};
use crate::utils::crypto::generate_session_key;
use crate::utils::time::now_millis;

pub const KEY_REGISTERED: &str = "Key registered";
pub const AUTH_SUCCESS: &str = "Auth success";
pub const AUTH_FAILED: &str = "Auth failed";
pub const NOT_AUTHENTICATED: &str = "Not authed or no key";
pub const DECRYPT_FAILED: &str = "Decrypt failed";
pub const UNKNOWN_TYPE: &str = "Unknown message type";

/// Per-connection actor for the legacy wire mode
pub struct LegacySupervisor<S> {
    ctx: ServerContext,
    connection: u64,
    peer: String,
    reader: FramedRead<ReadHalf<S>, LegacyCodec>,
    outbound: mpsc::Sender<LegacyMessage>,
    client_id: Option<String>,
    authenticated: bool,
    notify: Option<Arc<Notify>>,
    cancel: CancellationToken,
}

impl<S> LegacySupervisor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    #[instrument(skip(ctx, stream, peer, shutdown), fields(peer = %peer))]
    pub async fn run(
        ctx: ServerContext,
        stream: S,
        peer: String,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let codec = LegacyCodec::with_max_message_size(ctx.settings.max_frame_size);
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = shutdown.child_token();
        let metrics = ctx.metrics.clone();
        let mut writer_task = tokio::spawn(write_loop(writer, queue, cancel.clone(), metrics));

        let connection = ctx.sessions.next_connection_id();
        ctx.metrics.connection_established();
        info!(connection, "Legacy connection accepted");

        let mut supervisor = LegacySupervisor {
            ctx,
            connection,
            peer,
            reader,
            outbound,
            client_id: None,
            authenticated: false,
            notify: None,
            cancel,
        };
        let result = supervisor.serve().await;

        let LegacySupervisor {
            ctx,
            peer,
            outbound,
            client_id,
            authenticated,
            cancel,
            notify,
            ..
        } = supervisor;
        drop(notify);
        drop(outbound);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }
        cancel.cancel();

        let identity = client_id.as_deref().filter(|_| authenticated);
        finish_connection(&ctx, identity, connection, &peer, &result).await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let deadline = tokio::time::sleep(self.ctx.settings.handshake_timeout);
        tokio::pin!(deadline);

        let mut poll = tokio::time::interval(self.ctx.settings.command_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let authenticated = self.authenticated;
            let notify = self.notify.clone();

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = self.outbound.closed() => {
                    return Err(ChannelError::Transport(constants::ERR_WRITER_STOPPED.into()))
                }
                _ = &mut deadline, if !authenticated => {
                    warn!(peer = %self.peer, "Legacy handshake not completed in time");
                    return Err(ChannelError::Timeout);
                }
                _ = poll.tick(), if authenticated => self.push_pending().await?,
                _ = wait_for(notify), if authenticated => self.push_pending().await?,
                msg = self.reader.next() => match msg {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(msg)) => {
                        self.ctx.metrics.frame_received();
                        self.on_message(msg).await?;
                    }
                },
            }
        }
    }

    fn encryption(&self) -> bool {
        self.ctx.settings.cipher.is_some()
    }

    /// Field cipher for the stored key of `client_id`
    fn field_cipher(&self, client_id: &str) -> Result<Option<FieldCipher>> {
        if !self.encryption() {
            return Ok(None);
        }
        match self.ctx.store.lookup(client_id).and_then(|r| r.key) {
            Some(key) => FieldCipher::new(&key).map(Some),
            None => Ok(None),
        }
    }

    async fn on_message(&mut self, mut msg: LegacyMessage) -> Result<()> {
        let client_id = msg.client_id.clone().or_else(|| self.client_id.clone());

        let mut undecryptable = false;
        if msg.kind != LegacyKind::Hello {
            let cipher = match client_id.as_deref() {
                Some(id) => self.field_cipher(id)?,
                None => None,
            };
            if let Some(cipher) = cipher {
                undecryptable = !cipher.open_each(&mut msg);
                if undecryptable {
                    debug!(client_id = ?client_id, kind = ?msg.kind, "Field not sealed under the stored key");
                }
            }
        }

        match msg.kind {
            LegacyKind::Hello => {
                let Some(client_id) = client_id else {
                    return self
                        .reply(LegacyMessage::new(LegacyKind::Hello, "Missing clientID"), None)
                        .await;
                };
                self.ctx.store.ensure_identity(&client_id).await?;
                let key = generate_session_key()?;
                self.ctx.store.upsert_key(&client_id, &key).await?;
                if self.authenticated {
                    if let Some(previous) = &self.client_id {
                        self.ctx.sessions.release(previous, self.connection);
                    }
                    self.notify = None;
                }
                self.authenticated = false;
                self.client_id = Some(client_id.clone());
                info!(%client_id, "Legacy key issued");

                let reply = LegacyMessage::new(LegacyKind::Hello, KEY_REGISTERED).with_key(key);
                self.reply(reply, None).await
            }
            LegacyKind::Auth => {
                let Some(client_id) = client_id else {
                    self.ctx.metrics.auth_failure();
                    return self
                        .reply(LegacyMessage::new(LegacyKind::Auth, AUTH_FAILED), None)
                        .await;
                };
                let presented = msg.key.unwrap_or_default();
                let ok = !undecryptable
                    && self.ctx.store.verify_key(&client_id, &presented).unwrap_or(false);
                if !ok {
                    warn!(%client_id, "Legacy auth failed");
                    self.ctx.metrics.auth_failure();
                    let cipher = self.field_cipher(&client_id)?;
                    return self
                        .reply(LegacyMessage::new(LegacyKind::Auth, AUTH_FAILED), cipher)
                        .await;
                }

                self.ctx.store.mark_authenticated(&client_id).await?;
                self.ctx
                    .store
                    .mark_online(&client_id, true, now_millis())
                    .await?;
                if self
                    .ctx
                    .sessions
                    .claim(&client_id, self.connection, self.cancel.clone())
                {
                    info!(%client_id, "Superseded an older connection for this identity");
                }
                self.authenticated = true;
                self.client_id = Some(client_id.clone());
                self.ctx.metrics.handshake_success();
                info!(%client_id, "Legacy client authenticated");

                let cipher = self.field_cipher(&client_id)?;
                self.reply(LegacyMessage::new(LegacyKind::Auth, AUTH_SUCCESS), cipher)
                    .await?;
                self.notify = Some(self.ctx.commands.notifier(&client_id));
                self.push_pending().await
            }
            LegacyKind::Msg => {
                let identity = match (&self.client_id, client_id) {
                    (Some(own), Some(claimed)) if self.authenticated && *own == claimed => claimed,
                    _ => {
                        self.ctx.metrics.unauthenticated_rejection();
                        return self
                            .reply(LegacyMessage::new(LegacyKind::Msg, NOT_AUTHENTICATED), None)
                            .await;
                    }
                };

                let cipher = self.field_cipher(&identity)?;
                if undecryptable {
                    warn!(%identity, "Legacy MSG could not be decrypted");
                    return self
                        .reply(LegacyMessage::new(LegacyKind::Msg, DECRYPT_FAILED), cipher)
                        .await;
                }
                record_activity(&self.ctx, &identity).await;

                let log = Message::Log {
                    identity: identity.clone(),
                    line: msg.content.clone(),
                };
                let ctx = RequestContext {
                    identity: identity.clone(),
                };
                if let Err(e) = self.ctx.router.dispatch(ctx, log).await {
                    warn!(%identity, error = %e, "Log handler failed");
                }

                let reply =
                    LegacyMessage::new(LegacyKind::Msg, format!("Received: {}", msg.content));
                self.reply(reply, cipher).await
            }
            LegacyKind::Cmd => {
                debug!(peer = %self.peer, "Client sent CMD");
                self.reply(LegacyMessage::new(LegacyKind::Msg, UNKNOWN_TYPE), None)
                    .await
            }
        }
    }

    async fn push_pending(&mut self) -> Result<()> {
        let Some(client_id) = self.client_id.clone().filter(|_| self.authenticated) else {
            return Ok(());
        };
        if let Some(command) = self.ctx.commands.take(&client_id) {
            info!(%client_id, %command, "Delivering command");
            let cipher = self.field_cipher(&client_id)?;
            self.reply(LegacyMessage::cmd(&command), cipher).await?;
            self.ctx.metrics.command_delivered();
        }
        Ok(())
    }

    async fn reply(&self, mut msg: LegacyMessage, cipher: Option<FieldCipher>) -> Result<()> {
        if let Some(cipher) = cipher {
            cipher.seal(&mut msg)?;
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ChannelError::Transport(constants::ERR_WRITER_STOPPED.into()))
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, LegacyCodec>,
    mut queue: mpsc::Receiver<LegacyMessage>,
    cancel: CancellationToken,
    metrics: Arc<crate::utils::metrics::Metrics>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = queue.recv() => msg,
        };
        let Some(msg) = msg else { break };
        writer.send(msg).await?;
        metrics.frame_sent();
    }
    writer.close().await.ok();
    Ok(())
}

/// Agent side of the legacy mode
pub struct LegacyClient<S> {
    framed: Framed<S, LegacyCodec>,
    client_id: String,
    encryption: bool,
    cipher: Option<FieldCipher>,
}

impl<S> LegacyClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, client_id: impl Into<String>, encryption: bool) -> Self {
        Self {
            framed: Framed::new(stream, LegacyCodec::new()),
            client_id: client_id.into(),
            encryption,
            cipher: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// HELLO then AUTH. Returns the key the server issued.
    pub async fn handshake(&mut self) -> Result<String> {
        self.framed
            .send(LegacyMessage::hello(&self.client_id))
            .await?;
        let hello = self.recv_raw().await?;
        let key = match (hello.kind, hello.key) {
            (LegacyKind::Hello, Some(key)) => key,
            (kind, _) => {
                return Err(ChannelError::Protocol(format!(
                    "{}: {kind:?}",
                    constants::ERR_UNEXPECTED_REPLY
                )))
            }
        };
        if self.encryption {
            self.cipher = Some(FieldCipher::new(&key)?);
        }

        let auth = LegacyMessage::auth(&self.client_id, &key);
        self.send(auth).await?;
        let reply = self.recv().await?;
        if reply.kind == LegacyKind::Auth && reply.content == AUTH_SUCCESS {
            info!(client_id = %self.client_id, "Legacy handshake complete");
            Ok(key)
        } else {
            Err(ChannelError::Auth(reply.content))
        }
    }

    /// Send a MSG line
    pub async fn send_msg(&mut self, content: &str) -> Result<()> {
        let msg = LegacyMessage::msg(&self.client_id, content);
        self.send(msg).await
    }

    /// Seal and send any message
    pub async fn send(&mut self, mut msg: LegacyMessage) -> Result<()> {
        if let Some(cipher) = &self.cipher {
            cipher.seal(&mut msg)?;
        }
        self.framed.send(msg).await
    }

    /// Next message from the server with its fields decrypted
    pub async fn recv(&mut self) -> Result<LegacyMessage> {
        let mut msg = self.recv_raw().await?;
        if let Some(cipher) = &self.cipher {
            if msg.kind != LegacyKind::Hello {
                cipher.open(&mut msg)?;
            }
        }
        Ok(msg)
    }

    async fn recv_raw(&mut self) -> Result<LegacyMessage> {
        self.framed
            .next()
            .await
            .ok_or(ChannelError::ConnectionClosed)?
    }
}
