//! Post-authentication message routing
//!
//! Handlers are registered per message kind and run inside the connection's
//! supervisor, one message at a time. Each handler gets the identity the connection
//! authenticated as and returns the reply to send back.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{constants, ChannelError, Result};
use crate::protocol::message::{ErrorKind, Message};
use crate::utils::time::now_millis;

/// Who sent the message being handled
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: String,
}

type HandlerFn =
    dyn Fn(RequestContext, Message) -> BoxFuture<'static, Result<Message>> + Send + Sync + 'static;

/// Kind -> handler registry
pub struct MessageRouter {
    handlers: RwLock<HashMap<Cow<'static, str>, Arc<HandlerFn>>>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().map(|k| k.to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("MessageRouter").field("kinds", &kinds).finish()
    }
}

impl MessageRouter {
    /// Router with no handlers
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Router answering `request_otp` and `log`
    pub fn with_defaults(otp: Arc<dyn OtpProvider>, sinks: Vec<Arc<dyn LogSink>>) -> Result<Self> {
        let router = Self::new();

        router.register("request_otp", move |ctx, msg| {
            let otp = otp.clone();
            async move {
                match msg {
                    Message::RequestOtp { identity } if identity == ctx.identity => {
                        let issued = otp.issue(&identity)?;
                        info!(%identity, "OTP issued");
                        Ok(Message::OtpResult {
                            value: issued.value,
                            ttl: issued.ttl.as_secs(),
                        })
                    }
                    _ => Ok(identity_mismatch()),
                }
            }
            .boxed()
        })?;

        let sinks = Arc::new(sinks);
        router.register("log", move |ctx, msg| {
            let sinks = sinks.clone();
            async move {
                match msg {
                    Message::Log { identity, line } if identity == ctx.identity => {
                        for sink in sinks.iter() {
                            if let Err(e) = sink.record(&identity, &line).await {
                                warn!(%identity, error = %e, "Log sink failed");
                            }
                        }
                        Ok(Message::Ack)
                    }
                    _ => Ok(identity_mismatch()),
                }
            }
            .boxed()
        })?;

        Ok(router)
    }

    pub fn register<F>(&self, kind: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Message) -> BoxFuture<'static, Result<Message>>
            + Send
            + Sync
            + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ChannelError::Protocol(constants::ERR_LOCK_POISONED.to_string()))?;
        handlers.insert(Cow::Owned(kind.to_string()), Arc::new(handler));
        Ok(())
    }

    /// Run the handler for `msg`. Kinds without a handler get `Error{protocol}`.
    pub async fn dispatch(&self, ctx: RequestContext, msg: Message) -> Result<Message> {
        let handler = {
            let handlers = self
                .handlers
                .read()
                .map_err(|_| ChannelError::Protocol(constants::ERR_LOCK_POISONED.to_string()))?;
            handlers.get(msg.kind()).cloned()
        };

        match handler {
            Some(handler) => handler(ctx, msg).await,
            None => Ok(Message::error(
                ErrorKind::Protocol,
                format!("Unexpected message type: {}", msg.kind()),
            )),
        }
    }
}

fn identity_mismatch() -> Message {
    Message::error(ErrorKind::Auth, constants::ERR_IDENTITY_MISMATCH)
}

/// One issued one-time password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Otp {
    pub value: String,
    pub ttl: Duration,
}

/// Source of one-time passwords
pub trait OtpProvider: Send + Sync {
    fn issue(&self, identity: &str) -> Result<Otp>;
}

/// Six random decimal digits with a fixed validity
#[derive(Debug, Clone)]
pub struct RandomOtp {
    ttl: Duration,
}

impl RandomOtp {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl OtpProvider for RandomOtp {
    fn issue(&self, _identity: &str) -> Result<Otp> {
        let mut rng = rand::rng();
        let value: String = (0..6)
            .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
            .collect();
        Ok(Otp {
            value,
            ttl: self.ttl,
        })
    }
}

/// Destination for agent log lines
pub trait LogSink: Send + Sync {
    fn record<'a>(&'a self, identity: &'a str, line: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Emits each line as a tracing event
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record<'a>(&'a self, identity: &'a str, line: &'a str) -> BoxFuture<'a, Result<()>> {
        info!(target: "agent_log", identity, line);
        futures::future::ready(Ok(())).boxed()
    }
}

#[derive(Serialize)]
struct ArchiveEntry<'a> {
    time: u64,
    identity: &'a str,
    message: &'a str,
}

/// Appends `{time, identity, message}` JSON lines to a file
#[derive(Debug)]
pub struct ArchiveSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl ArchiveSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for ArchiveSink {
    fn record<'a>(&'a self, identity: &'a str, line: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut entry = serde_json::to_vec(&ArchiveEntry {
                time: now_millis(),
                identity,
                message: line,
            })?;
            entry.push(b'\n');

            let mut guard = self.file.lock().await;
            if guard.is_none() {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                *guard = Some(file);
            }
            if let Some(file) = guard.as_mut() {
                file.write_all(&entry).await?;
                file.flush().await?;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ctx(id: &str) -> RequestContext {
        RequestContext {
            identity: id.to_string(),
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::with_defaults(
            Arc::new(RandomOtp::new(Duration::from_secs(30))),
            vec![Arc::new(TracingSink)],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_otp_six_digits() {
        let reply = router()
            .dispatch(
                ctx("a"),
                Message::RequestOtp {
                    identity: "a".into(),
                },
            )
            .await
            .unwrap();
        match reply {
            Message::OtpResult { value, ttl } => {
                assert_eq!(value.len(), 6);
                assert!(value.chars().all(|c| c.is_ascii_digit()));
                assert_eq!(ttl, 30);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_for_other_identity_rejected() {
        let reply = router()
            .dispatch(
                ctx("a"),
                Message::Log {
                    identity: "b".into(),
                    line: "x".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::Error {
                kind: ErrorKind::Auth,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unrouted_kind() {
        let reply = router()
            .dispatch(ctx("a"), Message::command("PING"))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::Error {
                kind: ErrorKind::Protocol,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_custom_handler_replaces_default() {
        let router = router();
        router
            .register("request_otp", |_, _| {
                async {
                    Ok(Message::OtpResult {
                        value: "000000".into(),
                        ttl: 1,
                    })
                }
                .boxed()
            })
            .unwrap();
        let reply = router
            .dispatch(
                ctx("a"),
                Message::RequestOtp {
                    identity: "a".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Message::OtpResult {
                value: "000000".into(),
                ttl: 1
            }
        );
    }

    #[tokio::test]
    async fn test_archive_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_logs.jsonl");
        let sink = ArchiveSink::new(&path);
        sink.record("id-1", "first").await.unwrap();
        sink.record("id-1", "second").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["identity"], "id-1");
        assert_eq!(lines[1]["message"], "second");
        assert!(lines[0]["time"].as_u64().unwrap() > 0);
    }
}
