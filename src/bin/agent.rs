//! Agent daemon.
//!
//! Connects to the controller, forwards every stdin line as a log line, logs the
//! commands it receives and answers `PING` with a `PONG` log line.
//!
//! ```text
//! agent [--config <path>]
//! ```

use std::env;
use std::path::Path;

use control_channel::config::{ControlConfig, WireMode};
use control_channel::core::legacy::LegacyKind;
use control_channel::error::Result;
use control_channel::protocol::message::DeviceInfo;
use control_channel::service::{Agent, LegacyClient};
use control_channel::utils::logging::init_logging;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "agent.toml";

fn config_path() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    if args.len() > 1 && !args[1].starts_with('-') {
        return Some(args[1].clone());
    }
    None
}

/// Best-effort description of this machine
fn device_info() -> DeviceInfo {
    let host_name = env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let hardware_id = std::fs::read_to_string("/etc/machine-id")
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|_| host_name.clone());
    DeviceInfo {
        host_name,
        hardware_id,
        ..Default::default()
    }
}

fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_framed(config: ControlConfig) -> Result<()> {
    let (agent, mut commands) = Agent::spawn(config, device_info()).await?;
    agent.spawn_heartbeat();
    agent.forward_logs(stdin_lines());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                info!(%command, "Command received");
                if command == "PING" {
                    if let Err(e) = agent.send_log("PONG").await {
                        warn!(error = %e, "Failed to answer PING");
                    }
                }
            }
        }
    }
    agent.shutdown();
    Ok(())
}

async fn legacy_session(
    config: &ControlConfig,
    client_id: &str,
    lines: &mut mpsc::Receiver<String>,
) -> Result<()> {
    let stream = TcpStream::connect(&config.client.address).await?;
    let mut client = LegacyClient::new(stream, client_id, config.transport.encryption_enabled);
    client.handshake().await?;
    info!(%client_id, "Connected to controller (legacy)");

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => client.send_msg(&line).await?,
                None => return Ok(()),
            },
            msg = client.recv() => {
                let msg = msg?;
                match msg.kind {
                    LegacyKind::Cmd => {
                        info!(command = %msg.content, "Command received");
                        if msg.content == "PING" {
                            client.send_msg("PONG").await?;
                        }
                    }
                    _ => info!(reply = %msg.content, "Controller replied"),
                }
            }
        }
    }
}

async fn run_legacy(config: ControlConfig) -> Result<()> {
    let client_id = device_info().hardware_id;
    let mut lines = stdin_lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            result = legacy_session(&config, &client_id, &mut lines) => match result {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Connection lost"),
            },
        }
        tokio::time::sleep(config.client.reconnect_delay).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = match config_path() {
        Some(path) => ControlConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => ControlConfig::from_file(DEFAULT_CONFIG)?,
        None => ControlConfig::default(),
    };
    config.apply_env();
    init_logging(&config.logging)?;
    for issue in config.validate() {
        warn!("{issue}");
    }

    info!(address = %config.client.address, "Starting agent");
    match config.transport.wire_mode {
        WireMode::Framed => run_framed(config).await,
        WireMode::Legacy => run_legacy(config).await,
    }
}
