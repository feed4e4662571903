//! Inverter bridge service (`invsrv`)

use std::net::SocketAddr;

use axum::serve;
use clap::Parser;
use common::shutdown::wait_for_shutdown;
use errors::{BridgeError, BridgeResult};
use inverter_modbus::{Client, SerialTransport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use invsrv::api::create_router;
use invsrv::bootstrap::{self, Args, Bridge, Command};
use invsrv::config::AppConfig;

#[tokio::main]
async fn main() -> BridgeResult<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref())?;
    bootstrap::initialize_logging(&args, &config)?;
    config.validate()?;

    if let Some(Command::Probe { addresses }) = &args.command {
        return run_probe(&config, addresses).await;
    }

    let map = bootstrap::load_register_map(&config)?;
    if args.validate {
        info!(
            "Validation completed successfully: {} registers, {} derived values",
            map.len(),
            map.derived().len()
        );
        return Ok(());
    }

    let bind_address = bootstrap::determine_bind_address(args.bind.as_deref(), &config);
    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        BridgeError::Configuration(format!("Invalid bind address '{}': {}", bind_address, e))
    })?;

    let link = config.serial.link();
    info!(
        "Starting {} on {} ({} baud, unit {})",
        bootstrap::SERVICE_NAME,
        link.port,
        link.baud_rate,
        config.serial.unit_id
    );
    let transport = SerialTransport::new(link.clone()).map_err(|e| BridgeError::Serial {
        port: link.port.clone(),
        reason: e.to_string(),
    })?;

    let shutdown_token = CancellationToken::new();
    let bridge = Bridge::start(transport, &config, map, shutdown_token.clone());
    let app = create_router(bridge.state.clone());

    let socket = tokio::net::TcpSocket::new_v4()
        .map_err(|e| BridgeError::StartupFailed(format!("Failed to create socket: {}", e)))?;
    socket
        .set_reuseaddr(true)
        .map_err(|e| BridgeError::StartupFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    socket
        .bind(addr)
        .map_err(|e| BridgeError::StartupFailed(format!("Failed to bind to {}: {}", addr, e)))?;
    let listener = socket
        .listen(1024)
        .map_err(|e| BridgeError::StartupFailed(format!("Failed to listen: {}", e)))?;

    info!("API server listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let server = serve(listener, app);
    let server_token = shutdown_token.clone();
    let server_handle = tokio::spawn(async move {
        let shutdown = async move { server_token.cancelled().await };
        if let Err(e) = server.with_graceful_shutdown(shutdown).await {
            error!("Server error: {}", e);
        }
    });

    wait_for_shutdown().await;
    info!("Shutting down");
    shutdown_token.cancel();

    for task in bridge.tasks.into_iter().chain(std::iter::once(server_handle)) {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn run_probe(config: &AppConfig, addresses: &[u16]) -> BridgeResult<()> {
    let link = config.serial.link();
    let transport = SerialTransport::new(link.clone()).map_err(|e| BridgeError::Serial {
        port: link.port.clone(),
        reason: e.to_string(),
    })?;
    let mut client = Client::new(
        transport,
        config.serial.reply_timeout(),
        config.client.retry_policy(),
    );

    let results = bootstrap::probe(&mut client, config.serial.unit_id, addresses).await;
    let mut failed = 0usize;
    for (address, result) in results {
        match result {
            Ok(word) => println!("Register {address}: {word} (0x{word:04X}, signed {})", word as i16),
            Err(e) => {
                failed += 1;
                println!("Register {address}: {e}");
            },
        }
    }

    if failed == addresses.len() {
        return Err(BridgeError::Unreachable(format!(
            "no register could be read on {}",
            link.port
        )));
    }
    Ok(())
}
