//! Shared helpers for integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use control_channel::config::ControlConfig;
use control_channel::core::codec::FrameCodec;
use control_channel::error::Result;
use control_channel::protocol::message::{DeviceInfo, Envelope, Message};
use control_channel::protocol::router::{MessageRouter, RandomOtp, TracingSink};
use control_channel::service::ControlServer;
use control_channel::store::{CommandQueue, IdentityStore};
use control_channel::transport::admin::AdminChannel;
use control_channel::utils::metrics::Metrics;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Controller config suited to fast tests: memory-only store, short intervals
pub fn server_config() -> ControlConfig {
    ControlConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.command_poll_interval = Duration::from_millis(50);
        c.server.connection_timeout = Duration::from_secs(5);
        c.server.shutdown_timeout = Duration::from_secs(2);
        c.store.path = None;
        c.admin.enabled = false;
    })
}

/// Agent config pointing at `addr`
pub fn agent_config(addr: SocketAddr) -> ControlConfig {
    ControlConfig::default_with_overrides(|c| {
        c.client.address = addr.to_string();
        c.client.identity_cache_path = None;
        c.client.reconnect_delay = Duration::from_millis(100);
        c.client.request_timeout = Duration::from_secs(2);
        c.client.connection_timeout = Duration::from_secs(2);
        c.client.heartbeat_interval = Duration::from_millis(200);
    })
}

pub fn device(hwid: &str) -> DeviceInfo {
    DeviceInfo {
        host_name: "h".into(),
        ip_address: "127.0.0.1".into(),
        mac_address: "00:11:22:33:44:55".into(),
        hardware_id: hwid.into(),
    }
}

/// A controller running on a loopback port
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<IdentityStore>,
    pub commands: Arc<CommandQueue>,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<()>>,
    pub admin: AdminChannel,
}

impl TestServer {
    pub async fn start(config: ControlConfig) -> Self {
        let store = Arc::new(IdentityStore::in_memory());
        Self::start_with_store(config, store).await
    }

    pub async fn start_with_store(config: ControlConfig, store: Arc<IdentityStore>) -> Self {
        let listener = TcpListener::bind(&config.server.address).await.unwrap();
        Self::start_on(config, store, listener).await
    }

    pub async fn start_on(
        config: ControlConfig,
        store: Arc<IdentityStore>,
        listener: TcpListener,
    ) -> Self {
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new());
        let router = MessageRouter::with_defaults(
            Arc::new(RandomOtp::new(Duration::from_secs(60))),
            vec![Arc::new(TracingSink)],
        )
        .unwrap();
        let server =
            ControlServer::with_parts(config, store.clone(), Arc::new(router), metrics.clone())
                .unwrap();

        let commands = server.commands();
        let admin = server.admin_channel();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run_with_shutdown(listener, shutdown.clone()));
        Self {
            addr,
            store,
            commands,
            metrics,
            shutdown,
            task,
            admin,
        }
    }

    pub fn enqueue(&self, identity: &str, command: &str) -> Result<()> {
        self.admin.enqueue(identity, command)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

/// A bare framed connection for driving the protocol by hand
pub struct RawClient {
    pub reader: FramedRead<tokio::io::ReadHalf<TcpStream>, FrameCodec>,
    pub writer: FramedWrite<tokio::io::WriteHalf<TcpStream>, FrameCodec>,
    next_id: u64,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr, config: &ControlConfig) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let cipher = config.transport.shared_cipher().unwrap();
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(r, FrameCodec::new(cipher.clone())),
            writer: FramedWrite::new(w, FrameCodec::new(cipher)),
            next_id: 1,
        }
    }

    /// Send `msg` with a fresh id and return the reply carrying that id
    pub async fn call(&mut self, msg: Message) -> Message {
        let id = self.next_id;
        self.next_id += 1;
        self.writer
            .send(Envelope::with_id(id, msg).to_bytes().unwrap())
            .await
            .unwrap();
        loop {
            let env = self.next().await.expect("connection closed");
            if env.id == Some(id) {
                return env.message;
            }
        }
    }

    /// Next envelope, None once the connection is closed
    pub async fn next(&mut self) -> Option<Envelope> {
        match tokio::time::timeout(Duration::from_secs(3), self.reader.next()).await {
            Ok(Some(Ok(bytes))) => Some(Envelope::from_bytes(&bytes).unwrap()),
            Ok(_) => None,
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }

    /// Register, Hello, Auth. Returns the identity.
    pub async fn authenticate(&mut self, hwid: &str) -> String {
        let identity = match self.call(Message::Register(device(hwid))).await {
            Message::RegisterAck { identity, .. } => identity,
            other => panic!("unexpected reply: {other:?}"),
        };
        let key = match self
            .call(Message::Hello {
                identity: identity.clone(),
            })
            .await
        {
            Message::KeyIssued { key: Some(key) } => key,
            other => panic!("unexpected reply: {other:?}"),
        };
        match self
            .call(Message::Auth {
                identity: identity.clone(),
                key,
            })
            .await
        {
            Message::AuthResult { success: true, .. } => identity,
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}

/// Wait until `cond` holds or fail after two seconds
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
