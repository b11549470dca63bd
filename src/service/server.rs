//! Controller listener.
//!
//! Accepts TCP connections (optionally wrapped in TLS) and hands each one to a
//! supervisor for the configured wire mode. Connections beyond `max_connections`
//! are closed right after accept.
//!
//! Shutdown: the accept loop stops, every connection is cancelled through a child
//! token, and the server waits up to `shutdown_timeout` for them to finish before
//! flushing the identity store.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ControlConfig, WireMode, MAX_CONNECTIONS_LIMIT};
use crate::error::{ChannelError, Result};
use crate::protocol::router::{ArchiveSink, LogSink, MessageRouter, RandomOtp, TracingSink};
use crate::service::legacy::LegacySupervisor;
use crate::service::sessions::SessionRegistry;
use crate::service::supervisor::{ConnectionSupervisor, ServerContext, SupervisorSettings};
use crate::store::{CommandQueue, IdentityStore};
use crate::transport::admin::AdminChannel;
use crate::transport::tls::TlsServerConfig;
use crate::utils::metrics::Metrics;

/// Command broadcast to every online identity when pinging is enabled
pub const PING_COMMAND: &str = "PING";

/// The controller
#[derive(Debug)]
pub struct ControlServer {
    config: ControlConfig,
    ctx: ServerContext,
}

impl ControlServer {
    /// Open the identity store and build the default handlers
    pub async fn new(config: ControlConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(
            IdentityStore::open(&config.store)
                .await?
                .with_metrics(metrics.clone()),
        );

        let mut sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(TracingSink)];
        if let Some(path) = &config.server.log_archive_path {
            sinks.push(Arc::new(ArchiveSink::new(path)));
        }
        let router = MessageRouter::with_defaults(
            Arc::new(RandomOtp::new(config.server.otp_ttl)),
            sinks,
        )?;

        Self::with_parts(config, store, Arc::new(router), metrics)
    }

    /// Assemble a server from pre-built parts
    pub fn with_parts(
        config: ControlConfig,
        store: Arc<IdentityStore>,
        router: Arc<MessageRouter>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let settings = SupervisorSettings::from_config(&config)?;
        let ctx = ServerContext {
            store,
            commands: Arc::new(CommandQueue::new()),
            router,
            sessions: Arc::new(SessionRegistry::new()),
            metrics,
            settings,
        };
        Ok(Self { config, ctx })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Shared state handed to every connection
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn store(&self) -> Arc<IdentityStore> {
        self.ctx.store.clone()
    }

    pub fn commands(&self) -> Arc<CommandQueue> {
        self.ctx.commands.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    /// Admin channel bound to this server's store and queue
    pub fn admin_channel(&self) -> AdminChannel {
        AdminChannel::new(
            self.ctx.store.clone(),
            self.ctx.commands.clone(),
            self.ctx.metrics.clone(),
        )
    }

    /// Queue a command for a registered identity
    pub fn enqueue_command(&self, identity: &str, command: &str) -> Result<()> {
        self.admin_channel().enqueue(identity, command)
    }

    /// Bind the configured controller address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.server.address)
            .await
            .map_err(|e| {
                ChannelError::Transport(format!(
                    "Failed to bind {}: {e}",
                    self.config.server.address
                ))
            })?;
        Ok(listener)
    }

    /// Run until ctrl-c, together with the admin channel when enabled
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                signal.cancel();
            }
        });

        if self.config.admin.enabled {
            let admin = self.admin_channel();
            let address = self.config.admin.address.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = admin.serve(&address, token).await {
                    error!(error = %e, %address, "Admin channel failed");
                }
            });
        }

        self.run_with_shutdown(listener, shutdown).await
    }

    /// Serve `listener` until `shutdown` is cancelled
    #[instrument(skip(self, listener, shutdown), fields(address = ?listener.local_addr().ok()))]
    pub async fn run_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let tls = TlsServerConfig::from_config(&self.config.transport)?
            .map(|tls| tls.acceptor())
            .transpose()?;
        let max_connections = self
            .config
            .server
            .max_connections
            .clamp(1, MAX_CONNECTIONS_LIMIT);
        let permits = Arc::new(Semaphore::new(max_connections));
        let connections = shutdown.child_token();

        info!(
            wire_mode = ?self.config.transport.wire_mode,
            tls = tls.is_some(),
            "Controller listening"
        );

        if self.config.server.ping_enabled {
            tokio::spawn(ping_loop(
                self.ctx.clone(),
                self.config.server.ping_interval,
                connections.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            continue;
                        }
                    };
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        warn!(%peer, max_connections, "Connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }

                    let ctx = self.ctx.clone();
                    let tls = tls.clone();
                    let token = connections.child_token();
                    let wire_mode = self.config.transport.wire_mode;
                    let handshake_timeout = self.config.server.connection_timeout;
                    tokio::spawn(async move {
                        let _permit = permit;
                        let peer = peer.to_string();
                        let result = match tls {
                            Some(acceptor) => {
                                match accept_tls(&acceptor, stream, handshake_timeout).await {
                                    Ok(stream) => serve(wire_mode, ctx, stream, peer, token).await,
                                    Err(e) => Err(e),
                                }
                            }
                            None => serve(wire_mode, ctx, stream, peer, token).await,
                        };
                        if let Err(e) = result {
                            debug!(error = %e, "Connection handler returned error");
                        }
                    });
                }
            }
        }

        info!("Shutting down controller. Waiting for connections to close...");
        connections.cancel();
        let drained = tokio::time::timeout(
            self.config.server.shutdown_timeout,
            permits.acquire_many(u32::try_from(max_connections).unwrap_or(u32::MAX)),
        )
        .await;
        match drained {
            Ok(_) => info!("All connections closed"),
            Err(_) => warn!("Shutdown timeout reached, forcing exit"),
        }

        if let Err(e) = self.ctx.store.flush().await {
            error!(error = %e, "Failed to flush identity store");
        }
        self.ctx.metrics.log_metrics();
        Ok(())
    }
}

async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: tokio::net::TcpStream,
    deadline: Duration,
) -> Result<tokio_rustls::server::TlsStream<tokio::net::TcpStream>> {
    match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ChannelError::Tls(format!("TLS accept failed: {e}"))),
        Err(_) => Err(ChannelError::Timeout),
    }
}

async fn serve<S>(
    wire_mode: WireMode,
    ctx: ServerContext,
    stream: S,
    peer: String,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    match wire_mode {
        WireMode::Framed => ConnectionSupervisor::run(ctx, stream, peer, shutdown).await,
        WireMode::Legacy => LegacySupervisor::run(ctx, stream, peer, shutdown).await,
    }
}

/// Periodically queue PING for every authenticated, online identity
async fn ping_loop(ctx: ServerContext, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let targets = ctx.store.online_authenticated();
                debug!(count = targets.len(), "Broadcasting PING");
                for identity in targets {
                    ctx.commands.enqueue(&identity, PING_COMMAND);
                    ctx.metrics.command_enqueued();
                }
            }
        }
    }
}
