//! TinyBMS to Victron VE.Can bridge — process entry point.

use bridge::config::BridgeConfig;
use bridge::error::BridgeError;
use bridge::orchestrator::Orchestrator;
use bridge::serial_channel::{HardwareSerialChannel, SerialChannel};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1);
    let config = match &config_path {
        Some(path) => BridgeConfig::load_from_file(std::path::Path::new(path)),
        None => Ok(BridgeConfig::default()),
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            log::error!("fatal error during startup: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.logging.level);
    match config_path {
        Some(path) => log::info!("loaded configuration from {path}"),
        None => log::info!("no configuration path given, using compiled-in defaults"),
    }

    if let Err(e) = run(config).await {
        log::error!("fatal error during startup: {e}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` always wins; otherwise the config file's `logging.level`
/// seeds the default filter, per §6.4.
fn init_logging(config_level: &str) {
    let env = env_logger::Env::default().default_filter_or(config_level.to_string());
    env_logger::Builder::from_env(env).init();
}

async fn run(config: BridgeConfig) -> Result<(), BridgeError> {
    let serial: Box<dyn SerialChannel> = Box::new(HardwareSerialChannel::open(
        &config.hardware.uart_device,
        config.hardware.uart_baud,
        config.hardware.uart_timeout_ms,
    )?);

    let can = open_can_channel(&config.hardware.can_interface)?;

    let orchestrator = Arc::new(Orchestrator::new(config));
    let handles = orchestrator.spawn_tasks(serial, can);

    log::info!("bridge running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| BridgeError::Init(format!("failed to install signal handler: {e}")))?;

    log::info!("shutdown requested");
    orchestrator.request_shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    log::info!("bridge stopped");
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_can_channel(interface: &str) -> Result<Box<dyn bridge::can_channel::CanChannel>, BridgeError> {
    use bridge::can_channel::SocketCanChannel;
    Ok(Box::new(
        SocketCanChannel::open(interface).map_err(BridgeError::from)?,
    ))
}

#[cfg(not(target_os = "linux"))]
fn open_can_channel(_interface: &str) -> Result<Box<dyn bridge::can_channel::CanChannel>, BridgeError> {
    Err(BridgeError::Init(
        "SocketCAN is only available on Linux targets".to_string(),
    ))
}
