//! # FlightLink
//!
//! Communication core host process: runs the packet queue and manager over
//! the configured UART and UDP links.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use flightlink::comm::manager::{CommManager, ManagerTask};
use flightlink::comm::protocol::PacketType;
use flightlink::config::{Config, InterfaceConfig, LoggingConfig};
use flightlink::interface::uart::{self, UartInterface};
use flightlink::interface::udp::UdpInterface;
use flightlink::telemetry::PacketLogger;

/// Configuration file used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix for daily rolling logs
const LOG_FILE_PREFIX: &str = "flightlink.log";

/// Main entry point for FlightLink
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up logging with tracing subscriber
///    - Create the communication manager and open every configured interface
///    - Spawn one receive task per interface and the manager task
///
/// 2. **Main Loop**
///    - Queue a heartbeat on every interface each `heartbeat_interval_ms`
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Stop the manager task after it drains the queue
///    - Stop receive tasks
///    - Log final counters
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded or the packet log
/// directory cannot be created. Interfaces that fail to open are skipped.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);

    info!("FlightLink v{} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Loaded configuration from {}", config_path);

    let (manager, consumer) = CommManager::init(config.queue.buffer_size, config.manager.max_interfaces);

    let mut receivers = Vec::new();
    for interface in &config.interfaces {
        match open_interface(interface, &manager).await {
            Ok(receiver) => receivers.push(receiver),
            Err(e) => warn!("Skipping interface {}: {:#}", interface.name(), e),
        }
    }

    if receivers.is_empty() {
        warn!("No interfaces available, only local traffic will be processed");
    }

    let mut task = ManagerTask::new(Arc::clone(&manager), consumer);
    if config.telemetry.enabled {
        let logger = PacketLogger::new(&config.telemetry).context("Failed to start packet logger")?;
        task.register_handler(Box::new(logger));
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let manager_task = tokio::spawn(task.run(async {
        let _ = shutdown_rx.await;
    }));

    let heartbeat_enabled = config.manager.heartbeat_interval_ms > 0;
    let mut heartbeat = interval(Duration::from_millis(config.manager.heartbeat_interval_ms.max(1)));
    let started = Instant::now();

    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = heartbeat.tick(), if heartbeat_enabled => {
                send_heartbeat(&manager, started);
            }

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = manager_task.await {
        warn!("Manager task ended abnormally: {}", e);
    }

    for receiver in receivers {
        receiver.abort();
    }

    info!("Queue: {:?}", manager.queue().stats());
    info!("Manager: {:?}", manager.stats());
    Ok(())
}

/// Install the tracing subscriber
///
/// Level comes from `RUST_LOG` when set, otherwise from the configuration.
/// The returned guard must be held for the file writer to flush.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// Open one configured interface, register it and start its receive task
async fn open_interface(config: &InterfaceConfig, manager: &Arc<CommManager>) -> Result<JoinHandle<()>> {
    let name = config.name();

    match config {
        InterfaceConfig::Uart { port, baud_rate, .. } => {
            let (link, reader) = UartInterface::open(port, *baud_rate)?;
            let index = manager.add_interface(name, Arc::new(link))?;
            Ok(uart::spawn_receiver(reader, Arc::clone(manager), index))
        }
        InterfaceConfig::Udp { bind, remote, .. } => {
            let remote = remote
                .as_deref()
                .map(str::parse::<SocketAddr>)
                .transpose()
                .context("Invalid remote address")?;
            let link = Arc::new(UdpInterface::bind(bind, remote).await?);
            let index = manager.add_interface(name, link.clone())?;
            Ok(link.spawn_receiver(Arc::clone(manager), index))
        }
    }
}

/// Queue a heartbeat on every registered interface that can send
///
/// Payload is the process uptime in milliseconds, little-endian. Links still
/// waiting to learn their peer are skipped.
fn send_heartbeat(manager: &CommManager, started: Instant) {
    let uptime_ms = started.elapsed().as_millis() as u32;
    let payload = heartbeat_payload(uptime_ms);

    for index in manager.interface_indices() {
        let ready = manager.interface(index).is_some_and(|d| d.link.is_ready());
        if !ready {
            debug!("Skipping heartbeat on interface {}: link not ready", index);
            continue;
        }

        if let Err(e) = manager.transmit_packet(index, PacketType::Heartbeat, &payload) {
            debug!("Heartbeat on interface {} not queued: {}", index, e);
        }
    }
}

fn heartbeat_payload(uptime_ms: u32) -> [u8; 4] {
    uptime_ms.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        assert_eq!(DEFAULT_CONFIG_PATH, "config/default.toml");
    }

    #[test]
    fn test_heartbeat_payload_little_endian() {
        assert_eq!(heartbeat_payload(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
    }

    #[tokio::test]
    async fn test_heartbeat_skips_links_without_peer() {
        let (manager, _consumer) = CommManager::init(1024, 2);
        let learning = Arc::new(UdpInterface::bind("127.0.0.1:0", None).await.unwrap());
        manager.add_interface("udp-learning", learning).unwrap();

        send_heartbeat(&manager, Instant::now());
        assert!(manager.queue().is_empty());
        assert_eq!(manager.queue().stats().pushed, 0);

        let remote: SocketAddr = "127.0.0.1:14550".parse().unwrap();
        let fixed = Arc::new(UdpInterface::bind("127.0.0.1:0", Some(remote)).await.unwrap());
        manager.add_interface("udp-fixed", fixed).unwrap();

        send_heartbeat(&manager, Instant::now());
        assert_eq!(manager.queue().stats().pushed, 1);
    }

    #[test]
    fn test_default_config_file_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        assert!(Config::load(path).is_ok());
    }
}
