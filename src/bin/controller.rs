//! Controller daemon.
//!
//! ```text
//! controller [--config <path>]                          run the controller
//! controller [--config <path>] send <identity> <cmd>    queue a command via the admin channel
//! ```

use std::env;
use std::path::Path;

use control_channel::config::ControlConfig;
use control_channel::error::Result;
use control_channel::service::ControlServer;
use control_channel::transport::admin::send_admin_command;
use control_channel::utils::logging::init_logging;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "controller.toml";

/// Pull `--config <path>` / `-c <path>` out of `args`
fn take_config_path(args: &mut Vec<String>) -> Option<String> {
    let pos = args.iter().position(|a| a == "--config" || a == "-c")?;
    if pos + 1 >= args.len() {
        return None;
    }
    let path = args.remove(pos + 1);
    args.remove(pos);
    Some(path)
}

fn load_config(path: Option<String>) -> Result<ControlConfig> {
    let mut config = match path {
        Some(path) => ControlConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => ControlConfig::from_file(DEFAULT_CONFIG)?,
        None => ControlConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config = load_config(take_config_path(&mut args))?;
    init_logging(&config.logging)?;

    for issue in config.validate() {
        warn!("{issue}");
    }
    config.validate_strict()?;

    if args.first().map(String::as_str) == Some("send") {
        let (Some(identity), Some(command)) = (args.get(1), args.get(2)) else {
            error!("usage: controller send <identity> <command>");
            return Ok(());
        };
        let address = config.admin.address.clone();
        let reply = match address.strip_prefix("unix:") {
            #[cfg(unix)]
            Some(path) => {
                control_channel::transport::admin::send_admin_command_unix(path, identity, command)
                    .await?
            }
            _ => send_admin_command(&address, identity, command).await?,
        };
        println!("{reply}");
        return Ok(());
    }

    info!(address = %config.server.address, "Starting controller");
    ControlServer::new(config).await?.run().await
}
