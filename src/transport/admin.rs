//! Loopback admin channel
//!
//! Other local processes queue commands for an identity by writing one JSON object
//! per line:
//!
//! ```text
//! -> {"identity": "0f6c...", "command": "PING"}
//! <- OK
//! ```
//!
//! Listens on a loopback TCP port or, on unix, a domain socket given as
//! `unix:<path>`. Non-loopback TCP addresses are refused at bind time.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{constants, ChannelError, Result};
use crate::store::{CommandQueue, IdentityStore};
use crate::utils::metrics::Metrics;

/// One admin request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRequest {
    #[serde(alias = "clientID")]
    pub identity: String,
    #[serde(alias = "cmd")]
    pub command: String,
}

/// Accepts admin requests and feeds the command queue
#[derive(Debug, Clone)]
pub struct AdminChannel {
    store: Arc<IdentityStore>,
    commands: Arc<CommandQueue>,
    metrics: Arc<Metrics>,
}

impl AdminChannel {
    pub fn new(store: Arc<IdentityStore>, commands: Arc<CommandQueue>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            commands,
            metrics,
        }
    }

    /// Queue `command` for a known identity, replacing any undelivered one
    pub fn enqueue(&self, identity: &str, command: &str) -> Result<()> {
        if !self.store.contains(identity) {
            return Err(ChannelError::NotRegistered);
        }
        if let Some(replaced) = self.commands.enqueue(identity, command) {
            debug!(%identity, %replaced, "Replaced pending command");
        }
        self.metrics.command_enqueued();
        info!(%identity, %command, "Command queued");
        Ok(())
    }

    /// Bind `address` and serve until `shutdown` fires
    pub async fn serve(self, address: &str, shutdown: CancellationToken) -> Result<()> {
        if let Some(path) = address.strip_prefix("unix:") {
            return self.serve_unix_path(path, shutdown).await;
        }

        let addr: SocketAddr = address
            .parse()
            .map_err(|_| ChannelError::Config(format!("Invalid admin address: {address}")))?;
        if !addr.ip().is_loopback() {
            return Err(ChannelError::Config(format!(
                "Admin address must be loopback: {address}"
            )));
        }
        let listener = TcpListener::bind(addr).await?;
        self.serve_tcp(listener, shutdown).await
    }

    /// Serve on an already bound loopback listener
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve_tcp(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(address = ?listener.local_addr().ok(), "Admin channel listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Admin channel stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) if peer.ip().is_loopback() => {
                        let channel = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = channel.handle(stream).await {
                                debug!(error = %e, "Admin connection ended with error");
                            }
                        });
                    }
                    Ok((_, peer)) => warn!(%peer, "Rejected non-loopback admin connection"),
                    Err(e) => error!(error = %e, "Error accepting admin connection"),
                }
            }
        }
    }

    #[cfg(unix)]
    async fn serve_unix_path(self, path: &str, shutdown: CancellationToken) -> Result<()> {
        use std::path::Path;
        use tokio::net::UnixListener;

        if Path::new(path).exists() {
            tokio::fs::remove_file(path).await.ok();
        }
        let listener = UnixListener::bind(path)?;
        info!(%path, "Admin channel listening on unix socket");

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let channel = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = channel.handle(stream).await {
                                debug!(error = %e, "Admin connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Error accepting admin connection"),
                }
            }
        };

        if let Err(e) = tokio::fs::remove_file(path).await {
            error!(error = %e, %path, "Failed to remove socket file");
        }
        result
    }

    #[cfg(not(unix))]
    async fn serve_unix_path(self, path: &str, _shutdown: CancellationToken) -> Result<()> {
        Err(ChannelError::Config(format!(
            "Unix sockets are not available on this platform: {path}"
        )))
    }

    async fn handle<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<AdminRequest>(&line) {
                Ok(req) => match self.enqueue(&req.identity, &req.command) {
                    Ok(()) => "OK\n".to_string(),
                    Err(ChannelError::NotRegistered) => {
                        format!("ERR {}\n", constants::ERR_UNKNOWN_IDENTITY)
                    }
                    Err(e) => format!("ERR {e}\n"),
                },
                Err(e) => {
                    warn!(error = %e, "Malformed admin request");
                    format!("ERR malformed request: {e}\n")
                }
            };
            write.write_all(reply.as_bytes()).await?;
            write.flush().await?;
        }
        Ok(())
    }
}

/// Send one admin request over TCP and return the reply line without its newline
pub async fn send_admin_command(address: &str, identity: &str, command: &str) -> Result<String> {
    let stream = TcpStream::connect(address).await?;
    exchange(stream, identity, command).await
}

/// Send one admin request over a unix socket
#[cfg(unix)]
pub async fn send_admin_command_unix(path: &str, identity: &str, command: &str) -> Result<String> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    exchange(stream, identity, command).await
}

async fn exchange<S>(stream: S, identity: &str, command: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut request = serde_json::to_vec(&AdminRequest {
        identity: identity.to_string(),
        command: command.to_string(),
    })?;
    request.push(b'\n');
    write.write_all(&request).await?;
    write.flush().await?;

    let mut lines = BufReader::new(read).lines();
    lines
        .next_line()
        .await?
        .ok_or(ChannelError::ConnectionClosed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RegistrationPolicy;
    use crate::protocol::message::DeviceInfo;

    async fn channel() -> (AdminChannel, String) {
        let store = Arc::new(IdentityStore::in_memory());
        let record = store
            .register(
                DeviceInfo {
                    hardware_id: "hw".into(),
                    ..Default::default()
                },
                RegistrationPolicy::ReuseExisting,
            )
            .await
            .unwrap();
        let channel = AdminChannel::new(store, Arc::new(CommandQueue::new()), Arc::new(Metrics::new()));
        (channel, record.id)
    }

    #[tokio::test]
    async fn test_tcp_enqueue() {
        let (channel, id) = channel().await;
        let commands = channel.commands.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(channel.serve_tcp(listener, shutdown.clone()));

        assert_eq!(send_admin_command(&addr, &id, "PING").await.unwrap(), "OK");
        assert_eq!(commands.peek(&id).as_deref(), Some("PING"));

        let reply = send_admin_command(&addr, "ghost", "PING").await.unwrap();
        assert!(reply.starts_with("ERR"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_legacy_field_names_accepted() {
        let req: AdminRequest = serde_json::from_str(r#"{"clientID":"c1","cmd":"PING"}"#).unwrap();
        assert_eq!(req.identity, "c1");
        assert_eq!(req.command, "PING");
    }

    #[tokio::test]
    async fn test_non_loopback_refused() {
        let (channel, _) = channel().await;
        let result = channel
            .serve("0.0.0.0:0", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ChannelError::Config(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket() {
        let (channel, id) = channel().await;
        let commands = channel.commands.clone();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.sock");
        let address = format!("unix:{}", path.display());
        let shutdown = CancellationToken::new();

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { channel.serve(&address, shutdown).await })
        };
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let reply = send_admin_command_unix(path.to_str().unwrap(), &id, "REBOOT")
            .await
            .unwrap();
        assert_eq!(reply, "OK");
        assert_eq!(commands.take(&id).as_deref(), Some("REBOOT"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
