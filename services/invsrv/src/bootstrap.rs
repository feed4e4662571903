//! Service bootstrap: CLI arguments, logging, register map and task wiring

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use common::logging::LogConfig;
use errors::{BridgeError, BridgeResult};
use inverter_modbus::{Client, ClientError, ModbusWorker, Request, Response, Transport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::AppState;
use crate::cache::Cache;
use crate::config::AppConfig;
use crate::gateway::WriteGateway;
use crate::poller::Poller;
use crate::register_map::RegisterMap;

pub const SERVICE_NAME: &str = "invsrv";

/// Command-line arguments for invsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "invsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus RTU inverter bridge",
    long_about = None
)]
pub struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long, env = "INVSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Bind address for the API server, overrides api.host/api.port
    #[arg(short = 'b', long)]
    pub bind: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validate configuration and register map, then exit
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read raw holding registers and print them
    Probe {
        /// Register addresses
        #[arg(required = true, num_args = 1..)]
        addresses: Vec<u16>,
    },
}

pub fn initialize_logging(args: &Args, config: &AppConfig) -> BridgeResult<()> {
    let log_config = LogConfig {
        service_name: SERVICE_NAME.to_string(),
        level: args.log_level.clone().or_else(|| config.logging.level.clone()),
        log_dir: config
            .logging
            .dir
            .clone()
            .filter(|_| config.logging.file),
        ansi: !args.no_color,
        enable_json: false,
    };
    common::logging::init_with_config(log_config)
        .map_err(|e| BridgeError::Configuration(format!("Failed to init logging: {}", e)))
}

/// CLI bind address wins over the config file
pub fn determine_bind_address(cli: Option<&str>, config: &AppConfig) -> String {
    match cli {
        Some(addr) => addr.to_string(),
        None => config.api.bind_address(),
    }
}

pub fn load_register_map(config: &AppConfig) -> BridgeResult<RegisterMap> {
    let map = match &config.register_file {
        Some(path) => {
            info!("Loading register map from {}", path.display());
            RegisterMap::from_yaml_file(path)
        },
        None => RegisterMap::sunsynk(),
    }
    .map_err(|e| BridgeError::RegisterMap(e.to_string()))?;

    if map.is_empty() {
        return Err(BridgeError::RegisterMap("register map is empty".to_string()));
    }
    Ok(map)
}

/// Running bus worker, poller and the state the API serves from
pub struct Bridge {
    pub state: AppState,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Spawn the worker and poller on `transport`. Both stop when `cancel` fires.
    pub fn start<T: Transport>(
        transport: T,
        config: &AppConfig,
        map: RegisterMap,
        cancel: CancellationToken,
    ) -> Self {
        let map = Arc::new(map);
        let cache = Arc::new(Cache::for_map(&map));

        let client = Client::new(
            transport,
            config.serial.reply_timeout(),
            config.client.retry_policy(),
        );
        let (worker, handle) = ModbusWorker::new(
            client,
            config.serial.unit_id,
            config.client.queue_depth,
            cancel.clone(),
        );

        let poller = Poller::new(
            Arc::clone(&map),
            Arc::clone(&cache),
            handle.clone(),
            config.poller.interval(),
            config.poller.max_block,
            config.poller.max_gap,
        );
        info!(
            "Bridge wired: unit {}, {} registers, {} derived, {} read blocks",
            config.serial.unit_id,
            map.len(),
            map.derived().len(),
            poller.blocks().len()
        );

        let gateway = WriteGateway::new(Arc::clone(&map), Arc::clone(&cache), handle);
        let tasks = vec![tokio::spawn(worker.run()), tokio::spawn(poller.run(cancel))];

        Self {
            state: AppState {
                cache,
                gateway,
                registers: map,
                started_at: Utc::now(),
            },
            tasks,
        }
    }
}

/// Read each address as a single register
pub async fn probe<T: Transport>(
    client: &mut Client<T>,
    unit_id: u8,
    addresses: &[u16],
) -> Vec<(u16, Result<u16, ClientError>)> {
    let mut results = Vec::with_capacity(addresses.len());
    for &address in addresses {
        let request = Request::ReadHolding {
            unit_id,
            start: address,
            count: 1,
        };
        let result = match client.execute(&request).await {
            Ok(Response::Registers(words)) => words.first().copied().ok_or_else(|| {
                ClientError::TransportUnavailable("empty register reply".to_string())
            }),
            Ok(other) => Err(ClientError::TransportUnavailable(format!(
                "unexpected response: {other:?}"
            ))),
            Err(e) => Err(e),
        };
        results.push((address, result));
    }
    client.close().await;
    results
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use inverter_modbus::mock::{MockTransport, SimulatedDevice};
    use inverter_modbus::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "invsrv",
            "--config",
            "/etc/invsrv.yaml",
            "-l",
            "debug",
            "--no-color",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/invsrv.yaml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.no_color);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_probe_subcommand() {
        let args = Args::parse_from(["invsrv", "probe", "184", "603"]);
        assert_eq!(
            args.command,
            Some(Command::Probe {
                addresses: vec![184, 603]
            })
        );
        assert!(Args::try_parse_from(["invsrv", "probe"]).is_err());
    }

    #[test]
    fn test_bind_address_priority() {
        let config = AppConfig::default();
        assert_eq!(determine_bind_address(None, &config), "0.0.0.0:6010");
        assert_eq!(
            determine_bind_address(Some("127.0.0.1:9000"), &config),
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn test_default_register_map_loads() {
        let map = load_register_map(&AppConfig::default()).unwrap();
        assert!(map.get("battery_soc").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_each_address() {
        let mut device = SimulatedDevice::new(1);
        device.registers.insert(184, 87);
        device.silent.push(999..=999);
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let mut client = Client::new(
            MockTransport::with_device(device),
            Duration::from_millis(200),
            policy,
        );

        let results = probe(&mut client, 1, &[184, 999]).await;

        assert_eq!(results[0], (184, Ok(87)));
        assert!(matches!(
            results[1],
            (999, Err(ClientError::Unreachable { attempts: 1, .. }))
        ));
    }
}
