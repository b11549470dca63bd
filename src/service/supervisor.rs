//! Per-connection supervisor for the framed wire mode.
//!
//! One supervisor owns one accepted connection:
//! - the read side is consumed strictly in order by the supervisor itself
//! - the write side belongs to a single writer task fed through an mpsc queue;
//!   replies and pushed commands both go through it, so frames never interleave
//! - after authentication the identity's pending command is drained on every poll
//!   tick and whenever the command queue signals an enqueue
//!
//! Any read error, malformed frame or cancellation ends the connection. Teardown
//! cancels the writer, marks the identity offline (unless a newer connection took it
//! over) and waits for the writer to finish, so nothing outlives the connection.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ControlConfig, KeyMode, RegistrationPolicy};
use crate::core::codec::FrameCodec;
use crate::error::{constants, ChannelError, Result};
use crate::protocol::handshake::ServerHandshake;
use crate::protocol::message::{Envelope, ErrorKind, Message};
use crate::protocol::router::{MessageRouter, RequestContext};
use crate::service::sessions::SessionRegistry;
use crate::store::{CommandQueue, IdentityStore};
use crate::utils::crypto::Cipher;
use crate::utils::metrics::Metrics;
use crate::utils::time::now_millis;

/// Depth of the per-connection outbound queue
pub(crate) const OUTBOUND_QUEUE: usize = 64;

/// Grace period for the writer to flush queued frames on teardown
pub(crate) const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Work item for the connection's writer task
#[derive(Debug)]
pub enum Outbound {
    Frame(Envelope),
    /// Replace the writer's cipher; frames queued after this use the new key
    Rekey(Option<Cipher>),
}

/// Connection-independent settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub cipher: Option<Cipher>,
    pub key_mode: KeyMode,
    pub registration_policy: RegistrationPolicy,
    pub command_poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &ControlConfig) -> Result<Self> {
        Ok(Self {
            cipher: config.transport.shared_cipher()?,
            key_mode: config.transport.key_mode,
            registration_policy: config.server.registration_policy,
            command_poll_interval: config.server.command_poll_interval,
            handshake_timeout: config.server.connection_timeout,
            max_frame_size: config.transport.max_frame_size,
        })
    }
}

/// State shared by every connection of one server
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub store: Arc<IdentityStore>,
    pub commands: Arc<CommandQueue>,
    pub router: Arc<MessageRouter>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
    pub settings: SupervisorSettings,
}

enum Event {
    Frame(Option<Result<Vec<u8>>>),
    PollCommands,
    HandshakeTimeout,
    WriterClosed,
    Cancelled,
}

/// Actor owning one framed connection
pub struct ConnectionSupervisor<S> {
    ctx: ServerContext,
    connection: u64,
    peer: String,
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    outbound: mpsc::Sender<Outbound>,
    handshake: ServerHandshake,
    notify: Option<Arc<Notify>>,
    cancel: CancellationToken,
}

impl<S> ConnectionSupervisor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Drive `stream` until it closes, fails or `shutdown` fires.
    #[instrument(skip(ctx, stream, peer, shutdown), fields(peer = %peer))]
    pub async fn run(
        ctx: ServerContext,
        stream: S,
        peer: String,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let codec = FrameCodec::with_max_frame_size(
            ctx.settings.cipher.clone(),
            ctx.settings.max_frame_size,
        );
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = shutdown.child_token();
        let mut writer_task = tokio::spawn(write_loop(
            writer,
            queue,
            cancel.clone(),
            ctx.metrics.clone(),
        ));

        let connection = ctx.sessions.next_connection_id();
        let handshake = ServerHandshake::new(ctx.store.clone(), ctx.settings.registration_policy);
        ctx.metrics.connection_established();
        info!(connection, "Connection accepted");

        let mut supervisor = ConnectionSupervisor {
            ctx,
            connection,
            peer,
            reader,
            outbound,
            handshake,
            notify: None,
            cancel,
        };
        let result = supervisor.serve().await;

        // teardown: writer drains what is queued, then stops
        let ConnectionSupervisor {
            ctx,
            handshake,
            outbound,
            cancel,
            peer,
            notify,
            ..
        } = supervisor;
        drop(notify);
        drop(outbound);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer_task)
            .await
            .is_err()
        {
            cancel.cancel();
            writer_task.abort();
        }
        cancel.cancel();

        let identity = handshake
            .is_authenticated()
            .then(|| handshake.identity())
            .flatten();
        finish_connection(&ctx, identity, connection, &peer, &result).await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let deadline = tokio::time::sleep(self.ctx.settings.handshake_timeout);
        tokio::pin!(deadline);

        let mut poll = tokio::time::interval(self.ctx.settings.command_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let authenticated = self.handshake.is_authenticated();
            let notify = self.notify.clone();

            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Cancelled,
                _ = self.outbound.closed() => Event::WriterClosed,
                _ = &mut deadline, if !authenticated => Event::HandshakeTimeout,
                frame = self.reader.next() => Event::Frame(frame),
                _ = poll.tick(), if authenticated => Event::PollCommands,
                _ = wait_for(notify), if authenticated => Event::PollCommands,
            };

            match event {
                Event::Cancelled => {
                    debug!(connection = self.connection, "Connection cancelled");
                    return Ok(());
                }
                Event::WriterClosed => {
                    return Err(ChannelError::Transport(constants::ERR_WRITER_STOPPED.into()))
                }
                Event::HandshakeTimeout => {
                    warn!(peer = %self.peer, "Handshake not completed in time");
                    return Err(ChannelError::Timeout);
                }
                Event::PollCommands => self.push_pending().await?,
                Event::Frame(None) => return Ok(()),
                Event::Frame(Some(Err(e))) => return Err(e),
                Event::Frame(Some(Ok(bytes))) => {
                    self.ctx.metrics.frame_received();
                    let envelope = Envelope::from_bytes(&bytes)
                        .map_err(|e| ChannelError::Protocol(format!("Malformed message: {e}")))?;
                    self.on_envelope(envelope).await?;
                }
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        if !self.handshake.is_authenticated() {
            return self.on_handshake_message(envelope).await;
        }

        let identity = self.handshake.identity().unwrap_or_default().to_string();
        let Envelope { id, message } = envelope;
        let reply = match message {
            Message::Hello { identity: ref claimed } if *claimed == identity => {
                self.ctx
                    .store
                    .mark_online(&identity, true, now_millis())
                    .await?;
                debug!(%identity, "Heartbeat");
                Message::Ack
            }
            Message::Hello { .. } => {
                Message::error(ErrorKind::Auth, constants::ERR_IDENTITY_MISMATCH)
            }
            Message::Register(_) | Message::Auth { .. } => Message::error(
                ErrorKind::Protocol,
                constants::ERR_ALREADY_AUTHENTICATED,
            ),
            other => {
                if matches!(other, Message::Log { .. }) {
                    record_activity(&self.ctx, &identity).await;
                }
                let ctx = RequestContext {
                    identity: identity.clone(),
                };
                match self.ctx.router.dispatch(ctx, other).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(%identity, error = %e, "Handler failed");
                        Message::error(ErrorKind::Internal, e.to_string())
                    }
                }
            }
        };
        self.send(Envelope { id, message: reply }).await
    }

    async fn on_handshake_message(&mut self, envelope: Envelope) -> Result<()> {
        let is_auth = matches!(envelope.message, Message::Auth { .. });
        if !envelope.message.is_handshake() {
            self.ctx.metrics.unauthenticated_rejection();
        }

        let Envelope { id, message } = envelope;
        let reply = match self.handshake.handle(message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Handshake step failed");
                Message::error(ErrorKind::Internal, e.to_string())
            }
        };
        if is_auth && matches!(reply, Message::AuthResult { success: false, .. }) {
            self.ctx.metrics.auth_failure();
        }
        self.send(Envelope { id, message: reply }).await?;

        if self.handshake.is_authenticated() {
            self.on_authenticated().await?;
        }
        Ok(())
    }

    async fn on_authenticated(&mut self) -> Result<()> {
        let identity = self.handshake.identity().unwrap_or_default().to_string();
        self.ctx.metrics.handshake_success();

        if self
            .ctx
            .sessions
            .claim(&identity, self.connection, self.cancel.clone())
        {
            info!(%identity, "Superseded an older connection for this identity");
        }
        self.ctx
            .store
            .mark_online(&identity, true, now_millis())
            .await?;

        let per_identity = self.ctx.settings.key_mode == KeyMode::PerIdentity;
        if per_identity && self.ctx.settings.cipher.is_some() {
            let key = self
                .ctx
                .store
                .lookup(&identity)
                .and_then(|r| r.key)
                .ok_or_else(|| ChannelError::Auth(constants::ERR_NO_KEY.into()))?;
            let cipher = Cipher::from_session_key(&key)?;
            self.reader.decoder_mut().set_cipher(Some(cipher.clone()));
            self.outbound
                .send(Outbound::Rekey(Some(cipher)))
                .await
                .map_err(|_| ChannelError::Transport(constants::ERR_WRITER_STOPPED.into()))?;
            debug!(%identity, "Switched to per-identity key");
        }

        self.notify = Some(self.ctx.commands.notifier(&identity));
        self.push_pending().await
    }

    async fn push_pending(&mut self) -> Result<()> {
        if !self.handshake.is_authenticated() {
            return Ok(());
        }
        let identity = self.handshake.identity().unwrap_or_default().to_string();
        if let Some(command) = self.ctx.commands.take(&identity) {
            info!(%identity, %command, "Delivering command");
            self.send(Envelope::push(Message::command(command))).await?;
            self.ctx.metrics.command_delivered();
        }
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(envelope))
            .await
            .map_err(|_| ChannelError::Transport(constants::ERR_WRITER_STOPPED.into()))
    }
}

/// Release the identity (if this connection still owns it) and record the outcome
pub(crate) async fn finish_connection(
    ctx: &ServerContext,
    identity: Option<&str>,
    connection: u64,
    peer: &str,
    result: &Result<()>,
) {
    if let Some(identity) = identity {
        ctx.commands.release(identity);
        if ctx.sessions.release(identity, connection) {
            if let Err(e) = ctx.store.mark_online(identity, false, now_millis()).await {
                warn!(%identity, error = %e, "Failed to mark identity offline");
            }
        }
    }
    ctx.metrics.connection_closed();

    match result {
        Ok(()) => info!(%peer, connection, "Connection closed"),
        Err(e) => {
            if matches!(
                e,
                ChannelError::Protocol(_) | ChannelError::Json(_) | ChannelError::OversizedFrame(_)
            ) {
                ctx.metrics.protocol_error();
            } else {
                ctx.metrics.connection_error();
            }
            warn!(%peer, connection, error = %e, "Connection terminated");
        }
    }
}

/// Refresh liveness on traffic other than a heartbeat. Store failures are only logged.
pub(crate) async fn record_activity(ctx: &ServerContext, identity: &str) {
    if let Err(e) = ctx.store.mark_online(identity, true, now_millis()).await {
        warn!(%identity, error = %e, "Failed to record activity");
    }
}

pub(crate) async fn wait_for(notify: Option<Arc<Notify>>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => futures::future::pending().await,
    }
}

/// The only task that writes to the connection
async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec>,
    mut queue: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.recv() => item,
        };
        let Some(item) = item else { break };

        match item {
            Outbound::Frame(envelope) => {
                let bytes = envelope.to_bytes()?;
                if let Err(e) = writer.send(bytes).await {
                    debug!(error = %e, "Write failed");
                    return Err(e);
                }
                metrics.frame_sent();
            }
            Outbound::Rekey(cipher) => writer.encoder_mut().set_cipher(cipher),
        }
    }
    writer.close().await.ok();
    Ok(())
}
