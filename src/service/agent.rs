//! Agent runtime: reconnect supervisor plus the calls an agent makes.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--------------+-------------+   (any failure, after reconnect_delay)
//! ```
//!
//! Connecting means TCP (and TLS when enabled), then the handshake from cached
//! credentials. Once connected, a [`RequestDispatcher`] owns the connection and
//! every call goes through its handle. Retries never stop until [`Agent::shutdown`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ControlConfig, KeyMode, WireMode};
use crate::core::codec::FrameCodec;
use crate::error::{constants, ChannelError, Result};
use crate::protocol::handshake::client_handshake;
use crate::protocol::message::{DeviceInfo, Message};
use crate::protocol::router::Otp;
use crate::service::dispatcher::{DispatcherHandle, RequestDispatcher};
use crate::service::identity_cache::IdentityCache;
use crate::transport::tls::{self, TlsClientConfig};
use crate::utils::crypto::Cipher;

/// Capacity of the pushed-command channel handed to the caller
const PUSH_QUEUE: usize = 32;

/// Connection state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
struct Link {
    handle: DispatcherHandle,
    identity: String,
}

#[derive(Debug)]
struct Inner {
    config: ControlConfig,
    device: DeviceInfo,
    cache: IdentityCache,
    tls: Option<TlsClientConfig>,
    state: watch::Sender<LinkState>,
    link: Mutex<Option<Link>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }
}

/// Handle to a running agent. Clones share the same connection.
#[derive(Debug, Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    /// Start connecting in the background.
    ///
    /// Returns the agent and the receiver of commands pushed by the controller.
    pub async fn spawn(
        config: ControlConfig,
        device: DeviceInfo,
    ) -> Result<(Self, mpsc::Receiver<String>)> {
        let cache = IdentityCache::from_config(&config.client).await;
        Self::spawn_with_cache(config, device, cache)
    }

    /// Start with an explicit identity cache
    pub fn spawn_with_cache(
        config: ControlConfig,
        device: DeviceInfo,
        cache: IdentityCache,
    ) -> Result<(Self, mpsc::Receiver<String>)> {
        if config.transport.wire_mode == WireMode::Legacy {
            return Err(ChannelError::Config(
                "Agent speaks the framed wire mode; use LegacyClient for legacy".into(),
            ));
        }
        // fail fast on an unusable key
        config.transport.shared_cipher()?;

        let (state, _) = watch::channel(LinkState::Disconnected);
        let inner = Arc::new(Inner {
            tls: TlsClientConfig::from_config(&config.transport),
            config,
            device,
            cache,
            state,
            link: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let (pushes, commands) = mpsc::channel(PUSH_QUEUE);
        tokio::spawn(supervise(inner.clone(), pushes));
        Ok((Self { inner }, commands))
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Wait until connected, or fail after `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == LinkState::Connected))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|_| ChannelError::Transport(constants::ERR_NOT_CONNECTED.into()))?;
        Ok(())
    }

    /// Identity of the current session, if connected
    pub fn identity(&self) -> Option<String> {
        self.inner.link().as_ref().map(|l| l.identity.clone())
    }

    fn current(&self) -> Result<Link> {
        self.inner
            .link()
            .clone()
            .ok_or_else(|| ChannelError::Transport(constants::ERR_NOT_CONNECTED.into()))
    }

    /// Send a request and wait for its reply within the configured request timeout
    pub async fn request(&self, message: Message) -> Result<Message> {
        let link = self.current()?;
        link.handle
            .request(message, self.inner.config.client.request_timeout)
            .await
    }

    /// Hello on an authenticated connection marks the identity alive
    pub async fn heartbeat(&self) -> Result<()> {
        let identity = self.current()?.identity;
        expect_ack(self.request(Message::Hello { identity }).await?)
    }

    /// Forward one log line to the controller
    pub async fn send_log(&self, line: impl Into<String>) -> Result<()> {
        let identity = self.current()?.identity;
        let msg = Message::Log {
            identity,
            line: line.into(),
        };
        expect_ack(self.request(msg).await?)
    }

    pub async fn request_otp(&self) -> Result<Otp> {
        let identity = self.current()?.identity;
        match self.request(Message::RequestOtp { identity }).await? {
            Message::OtpResult { value, ttl } => Ok(Otp {
                value,
                ttl: Duration::from_secs(ttl),
            }),
            other => Err(reply_error(other)),
        }
    }

    /// Send a heartbeat every `client.heartbeat_interval` while connected
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let agent = self.clone();
        let period = self.inner.config.client.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = agent.inner.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if agent.state() != LinkState::Connected {
                            continue;
                        }
                        if let Err(e) = agent.heartbeat().await {
                            warn!(error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    /// Send every line from `lines` as a log message. Lines arriving while
    /// disconnected are dropped.
    pub fn forward_logs(&self, mut lines: mpsc::Receiver<String>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = agent.inner.shutdown.cancelled() => return,
                    line = lines.recv() => line,
                };
                let Some(line) = line else { return };
                if let Err(e) = agent.send_log(line).await {
                    debug!(error = %e, "Dropped log line");
                }
            }
        })
    }

    /// Stop reconnecting and close the connection
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn expect_ack(reply: Message) -> Result<()> {
    match reply {
        Message::Ack => Ok(()),
        other => Err(reply_error(other)),
    }
}

fn reply_error(reply: Message) -> ChannelError {
    match reply {
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

/// Reconnect loop. Ends only on shutdown.
async fn supervise(inner: Arc<Inner>, pushes: mpsc::Sender<String>) {
    let delay = inner.config.client.reconnect_delay;
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        inner.set_state(LinkState::Connecting);

        match connect(&inner, pushes.clone()).await {
            Ok((link, task)) => {
                info!(identity = %link.identity, "Connected to controller");
                *inner.link() = Some(link);
                inner.set_state(LinkState::Connected);

                let outcome = task.await;
                *inner.link() = None;
                match outcome {
                    Ok(Ok(())) => info!("Connection closed"),
                    Ok(Err(e)) => warn!(error = %e, "Connection lost"),
                    Err(e) => warn!(error = %e, "Dispatcher task failed"),
                }
            }
            Err(e) => warn!(error = %e, "Failed to connect"),
        }
        inner.set_state(LinkState::Disconnected);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => debug!("Retrying connection"),
        }
    }
    inner.set_state(LinkState::Disconnected);
}

#[instrument(skip(inner, pushes), fields(address = %inner.config.client.address))]
async fn connect(
    inner: &Inner,
    pushes: mpsc::Sender<String>,
) -> Result<(Link, JoinHandle<Result<()>>)> {
    let client = &inner.config.client;
    let stream = tokio::time::timeout(
        client.connection_timeout,
        TcpStream::connect(&client.address),
    )
    .await
    .map_err(|_| ChannelError::Timeout)?
    .map_err(|e| ChannelError::Transport(format!("Connect to {} failed: {e}", client.address)))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    match &inner.tls {
        Some(tls_config) => {
            let stream = tls::connect(stream, tls_config).await?;
            attach(inner, stream, pushes).await
        }
        None => attach(inner, stream, pushes).await,
    }
}

/// Handshake over `stream`, then hand it to a dispatcher
async fn attach<S>(
    inner: &Inner,
    stream: S,
    pushes: mpsc::Sender<String>,
) -> Result<(Link, JoinHandle<Result<()>>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let transport = &inner.config.transport;
    let shared = transport.shared_cipher()?;
    let codec = FrameCodec::with_max_frame_size(shared.clone(), transport.max_frame_size);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);

    let creds = client_handshake(
        &mut reader,
        &mut writer,
        inner.cache.get(),
        &inner.device,
        inner.config.client.request_timeout,
    )
    .await?;
    if let Err(e) = inner.cache.save(&creds).await {
        warn!(error = %e, "Failed to persist identity cache");
    }

    if transport.key_mode == KeyMode::PerIdentity && shared.is_some() {
        let key = creds
            .key
            .as_deref()
            .ok_or_else(|| ChannelError::Auth(constants::ERR_NO_KEY.into()))?;
        let cipher = Cipher::from_session_key(key)?;
        reader.decoder_mut().set_cipher(Some(cipher.clone()));
        writer.encoder_mut().set_cipher(Some(cipher));
        debug!(identity = %creds.identity, "Switched to per-identity key");
    }

    let (handle, task) =
        RequestDispatcher::spawn(reader, writer, pushes, inner.shutdown.child_token());
    Ok((
        Link {
            handle,
            identity: creds.identity,
        },
        task,
    ))
}
