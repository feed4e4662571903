//! Service configuration
//!
//! Sources, lowest to highest priority:
//! 1. built-in defaults
//! 2. YAML config file (optional)
//! 3. `INVSRV_` environment variables, `__` separating sections
//!    (e.g. `INVSRV_SERIAL__PORT=/dev/ttyS1`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{config_error, invalid_config, BridgeError, BridgeResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use inverter_modbus::{constants::MAX_READ_REGISTERS, Parity, RetryPolicy, SerialConfig};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "INVSRV_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialSection,
    pub client: ClientSection,
    pub poller: PollerSection,
    pub api: ApiSection,
    pub logging: LoggingSection,
    /// YAML register map replacing the built-in Sunsynk table
    pub register_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub unit_id: u8,
    pub reply_timeout_ms: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        let link = SerialConfig::default();
        Self {
            port: link.port,
            baud_rate: link.baud_rate,
            data_bits: link.data_bits,
            stop_bits: link.stop_bits,
            parity: link.parity,
            unit_id: 1,
            reply_timeout_ms: 1000,
        }
    }
}

impl SerialSection {
    pub fn link(&self) -> SerialConfig {
        SerialConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Total attempts per request, first try included
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Requests waiting for the bus before submitters block
    pub queue_depth: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter: policy.jitter,
            queue_depth: 32,
        }
    }
}

impl ClientSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    pub interval_ms: u64,
    /// Largest single read, in registers
    pub max_block: u16,
    /// Unmapped registers a block may read through
    pub max_gap: u16,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            max_block: 64,
            max_gap: 8,
        }
    }
}

impl PollerSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub host: String,
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6010,
        }
    }
}

impl ApiSection {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter directive; `RUST_LOG` applies when unset
    pub level: Option<String>,
    pub dir: Option<PathBuf>,
    /// Also write a daily rolling file under `dir`
    pub file: bool,
}

impl AppConfig {
    /// Load from defaults, the optional file and the environment
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        Self::extract(Self::figment(path, ENV_PREFIX), path)
    }

    pub fn figment(path: Option<&Path>, env_prefix: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(env_prefix).split("__"))
    }

    fn extract(figment: Figment, path: Option<&Path>) -> BridgeResult<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(config_error!("config file not found: {}", path.display()));
            }
        }
        figment.extract().map_err(|e| BridgeError::ParseError {
            file: path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string()),
            error: e.to_string(),
        })
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.serial
            .link()
            .validate()
            .map_err(|e| invalid_config!("serial", e))?;
        if self.serial.unit_id == 0 || self.serial.unit_id > 247 {
            return Err(invalid_config!("serial.unit_id", "must be 1-247"));
        }
        if self.serial.reply_timeout_ms == 0 {
            return Err(invalid_config!("serial.reply_timeout_ms", "must be greater than 0"));
        }

        if self.client.max_retries == 0 {
            return Err(invalid_config!("client.max_retries", "must be at least 1"));
        }
        if !self.client.backoff_multiplier.is_finite() || self.client.backoff_multiplier < 1.0 {
            return Err(invalid_config!("client.backoff_multiplier", "must be at least 1.0"));
        }
        if self.client.max_backoff_ms < self.client.initial_backoff_ms {
            return Err(invalid_config!(
                "client.max_backoff_ms",
                "must not be below initial_backoff_ms"
            ));
        }
        if self.client.queue_depth == 0 {
            return Err(invalid_config!("client.queue_depth", "must be greater than 0"));
        }

        if self.poller.interval_ms == 0 {
            return Err(invalid_config!("poller.interval_ms", "must be greater than 0"));
        }
        if self.poller.max_block < 2 || self.poller.max_block > MAX_READ_REGISTERS {
            return Err(invalid_config!(
                "poller.max_block",
                format!("must be 2-{MAX_READ_REGISTERS}")
            ));
        }
        if self.poller.max_gap >= self.poller.max_block {
            return Err(invalid_config!(
                "poller.max_gap",
                "must be less than poller.max_block"
            ));
        }

        if self.api.host.trim().is_empty() {
            return Err(invalid_config!("api.host", "cannot be empty"));
        }
        if self.logging.file && self.logging.dir.is_none() {
            return Err(invalid_config!("logging.dir", "required when logging.file is set"));
        }
        Ok(())
    }
}
