use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    #[serde(default)]
    pub server: ServerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub register_server: RegisterServerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub control: ControlConfig,

    #[validate(nested)]
    #[serde(default)]
    pub fcrn: FcrnConfig,

    #[validate(nested)]
    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub bms: Vec<DeviceEndpoint>,

    #[serde(default)]
    pub pcs: Vec<DeviceEndpoint>,

    #[serde(default)]
    pub plc: Option<DeviceEndpoint>,

    #[serde(default)]
    pub windfarm: Vec<DeviceEndpoint>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    #[serde(default = "default_host")]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse HTTP socket address")
    }
}

/// External register (Modbus-TCP) server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RegisterServerConfig {
    #[validate(length(min = 1))]
    #[serde(default = "default_host")]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_register_port")]
    pub port: u16,
}

impl Default for RegisterServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_register_port(),
        }
    }
}

impl RegisterServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse register server socket address")
    }
}

/// One polled field device endpoint. Shared by BMS, PCS, protection
/// equipment and wind farm units; per-class extras carry defaults that only
/// matter for the classes using them.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeviceEndpoint {
    #[validate(range(min = 1))]
    pub id: u16,

    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    #[validate(range(min = 1, max = 247))]
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    #[validate(range(min = 50, max = 60000))]
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[validate(range(min = 100, max = 60000))]
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_persist_interval_s")]
    pub persist_interval_s: u64,

    #[validate(range(min = 100, max = 600000))]
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[validate(range(min = 100, max = 30000))]
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Number of battery racks behind a BMS unit.
    #[validate(range(min = 1, max = 32))]
    #[serde(default = "default_rack_count")]
    pub rack_count: u16,
}

impl DeviceEndpoint {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse device socket address")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_s)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Control logic limits and loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_control_config"))]
pub struct ControlConfig {
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_min_soc")]
    pub min_soc_percent: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_max_soc")]
    pub max_soc_percent: f64,

    #[validate(range(min = 0.1, max = 1500.0))]
    #[serde(default = "default_max_power_kw")]
    pub max_charge_power_kw: f64,

    #[validate(range(min = 0.1, max = 1500.0))]
    #[serde(default = "default_max_power_kw")]
    pub max_discharge_power_kw: f64,

    #[validate(range(min = 20, max = 5000))]
    #[serde(default = "default_control_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            min_soc_percent: default_min_soc(),
            max_soc_percent: default_max_soc(),
            max_charge_power_kw: default_max_power_kw(),
            max_discharge_power_kw: default_max_power_kw(),
            tick_ms: default_control_tick_ms(),
        }
    }
}

fn validate_control_config(config: &ControlConfig) -> Result<(), validator::ValidationError> {
    if config.min_soc_percent >= config.max_soc_percent {
        return Err(validator::ValidationError::new(
            "min_soc must be less than max_soc",
        ));
    }
    Ok(())
}

/// FCR-N controller and service configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_fcrn_config"))]
pub struct FcrnConfig {
    #[validate(range(min = 0.0))]
    #[serde(default = "default_fcrn_capacity_kw")]
    pub capacity_kw: f64,

    #[serde(default = "default_droop_percent")]
    pub droop_percent: f64,

    #[validate(range(min = 100, max = 60000))]
    #[serde(default = "default_fcrn_update_interval_ms")]
    pub update_interval_ms: u64,

    #[serde(default = "default_true")]
    pub enable_energy_management: bool,

    #[validate(range(min = 0.1))]
    #[serde(default = "default_reservoir_kwh")]
    pub reservoir_capacity_kwh: f64,

    #[serde(default = "default_fcrn_min_power_kw")]
    pub min_power_kw: f64,

    #[serde(default = "default_fcrn_capacity_kw")]
    pub max_power_kw: f64,

    /// Battery unit whose SOC drives the energy-management overlays.
    #[validate(range(min = 1))]
    #[serde(default = "default_unit_one")]
    pub pcs_number: u16,

    #[validate(range(min = 100, max = 60000))]
    #[serde(default = "default_frequency_update_rate_ms")]
    pub frequency_update_rate_ms: u64,

    /// Optional periodic state logging; absent disables the loop.
    #[serde(default)]
    pub telemetry_interval_s: Option<u64>,

    /// Clamp SOC readings outside [40, 60] to 50 before feeding the
    /// controller. Kept for parity with commissioning rigs; leave off in
    /// production.
    #[serde(default)]
    pub soc_debug_clamp: bool,
}

impl Default for FcrnConfig {
    fn default() -> Self {
        Self {
            capacity_kw: default_fcrn_capacity_kw(),
            droop_percent: default_droop_percent(),
            update_interval_ms: default_fcrn_update_interval_ms(),
            enable_energy_management: true,
            reservoir_capacity_kwh: default_reservoir_kwh(),
            min_power_kw: default_fcrn_min_power_kw(),
            max_power_kw: default_fcrn_capacity_kw(),
            pcs_number: 1,
            frequency_update_rate_ms: default_frequency_update_rate_ms(),
            telemetry_interval_s: None,
            soc_debug_clamp: false,
        }
    }
}

fn validate_fcrn_config(config: &FcrnConfig) -> Result<(), validator::ValidationError> {
    if !(config.droop_percent > 0.0 && config.droop_percent <= 100.0) {
        return Err(validator::ValidationError::new(
            "droop_percent must be in (0, 100]",
        ));
    }
    if config.min_power_kw > config.max_power_kw {
        return Err(validator::ValidationError::new(
            "min_power_kw must not exceed max_power_kw",
        ));
    }
    Ok(())
}

/// Persistence hand-off configuration (sink interface only; no database)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PersistenceConfig {
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_persistence_queue_depth")]
    pub queue_depth: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_persistence_queue_depth(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_http_port() -> u16 { 8080 }
fn default_register_port() -> u16 { 1502 }
fn default_modbus_port() -> u16 { 502 }
fn default_unit_id() -> u8 { 1 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_heartbeat_interval_ms() -> u64 { 1000 }
fn default_persist_interval_s() -> u64 { 60 }
fn default_reconnect_delay_ms() -> u64 { 5000 }
fn default_request_timeout_ms() -> u64 { 2000 }
fn default_rack_count() -> u16 { 8 }
fn default_min_soc() -> f64 { 10.0 }
fn default_max_soc() -> f64 { 90.0 }
fn default_max_power_kw() -> f64 { 300.0 }
fn default_control_tick_ms() -> u64 { 100 }
fn default_fcrn_capacity_kw() -> f64 { 1000.0 }
fn default_droop_percent() -> f64 { 4.0 }
fn default_fcrn_update_interval_ms() -> u64 { 1000 }
fn default_reservoir_kwh() -> f64 { 1000.0 }
fn default_fcrn_min_power_kw() -> f64 { -1000.0 }
fn default_frequency_update_rate_ms() -> u64 { 1000 }
fn default_persistence_queue_depth() -> usize { 1000 }
fn default_true() -> bool { true }
fn default_unit_one() -> u16 { 1 }

impl AppConfig {
    /// Load configuration from `config/default.toml` overridden by
    /// environment variables with the `EMS__` prefix
    /// (`EMS__SERVER__PORT` -> `server.port`).
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    /// Load configuration with a specific environment override file
    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            let env_file = format!("config/{}.toml", env);
            figment = figment.merge(Toml::file(env_file));
        }

        figment = figment.merge(Env::prefixed("EMS__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;
        for endpoint in config
            .bms
            .iter()
            .chain(config.pcs.iter())
            .chain(config.plc.iter())
            .chain(config.windfarm.iter())
        {
            endpoint
                .validate()
                .with_context(|| format!("Invalid device endpoint {}", endpoint.id))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: u16) -> DeviceEndpoint {
        DeviceEndpoint {
            id,
            host: "127.0.0.1".to_string(),
            port: 1502,
            unit_id: 1,
            poll_interval_ms: 500,
            heartbeat_interval_ms: 1000,
            persist_interval_s: 60,
            reconnect_delay_ms: 5000,
            request_timeout_ms: 2000,
            rack_count: 8,
        }
    }

    #[test]
    fn server_config_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        };
        let addr = config.socket_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn device_endpoint_durations() {
        let e = endpoint(1);
        assert_eq!(e.poll_interval(), Duration::from_millis(500));
        assert_eq!(e.request_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn control_config_rejects_inverted_soc_band() {
        let config = ControlConfig {
            min_soc_percent: 95.0,
            max_soc_percent: 90.0,
            ..ControlConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fcrn_config_rejects_bad_droop() {
        let config = FcrnConfig {
            droop_percent: 0.0,
            ..FcrnConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FcrnConfig {
            droop_percent: 150.0,
            ..FcrnConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fcrn_config_defaults_disable_soc_clamp() {
        assert!(!FcrnConfig::default().soc_debug_clamp);
    }

    #[test]
    fn endpoint_validation_rejects_zero_id() {
        let mut e = endpoint(1);
        e.id = 0;
        assert!(e.validate().is_err());
    }
}
