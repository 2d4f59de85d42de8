use anyhow::{Context, Result};
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

use crate::controller::calls::Graph;
use crate::controller::scheduler::JitterPolicy;
use crate::domain::Location;
use crate::hardware::HardwareMode;
use crate::power_flow::AttributionConstraints;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub polling: PollingConfig,
    #[validate(nested)]
    pub site: SiteConfig,
    #[validate(nested)]
    pub flow: FlowConfig,
    #[validate(nested)]
    pub dashboard: DashboardConfig,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PollingConfig {
    #[validate(range(min = 1000))]
    pub local_update_interval_ms: u64,
    #[validate(range(min = 1000))]
    pub cloud_update_interval_ms: u64,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
    #[validate(range(min = 1))]
    pub rotation_interval_secs: u64,
    pub jitter_spread_ms: u64,
    pub jitter_floor_ms: u64,
    pub overdue_grace_secs: u64,
    #[validate(range(min = 1))]
    pub vehicle_defer_minutes: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            local_update_interval_ms: 10_000,
            cloud_update_interval_ms: 300_000,
            sweep_interval_secs: 20,
            rotation_interval_secs: 20,
            jitter_spread_ms: 1500,
            jitter_floor_ms: 500,
            overdue_grace_secs: 5,
            vehicle_defer_minutes: 30,
        }
    }
}

impl PollingConfig {
    pub fn local_interval(&self) -> Duration {
        Duration::from_millis(self.local_update_interval_ms)
    }

    pub fn cloud_interval(&self) -> Duration {
        Duration::from_millis(self.cloud_update_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn overdue_grace(&self) -> Duration {
        Duration::from_secs(self.overdue_grace_secs)
    }

    pub fn vehicle_defer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.vehicle_defer_minutes as i64)
    }

    pub fn jitter(&self) -> JitterPolicy {
        JitterPolicy {
            spread: Duration::from_millis(self.jitter_spread_ms),
            floor: Duration::from_millis(self.jitter_floor_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SiteConfig {
    pub powerwall_ip: Option<String>,
    pub twc_manager_ip: Option<String>,
    #[validate(range(min = 1))]
    pub twc_manager_port: u16,
    pub account: Option<String>,
    pub site_id: Option<String>,
    /// `[latitude, longitude]`
    pub home: Option<[f64; 2]>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            powerwall_ip: None,
            twc_manager_ip: None,
            twc_manager_port: 8080,
            account: None,
            site_id: None,
            home: None,
        }
    }
}

impl SiteConfig {
    pub fn home_location(&self) -> Option<Location> {
        self.home.map(|[lat, lon]| Location::new(lat, lon))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FlowConfig {
    #[validate(range(min = 0))]
    pub solar_noise_floor_w: i64,
    #[validate(range(min = 0))]
    pub battery_noise_floor_w: i64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        let defaults = AttributionConstraints::default();
        Self {
            solar_noise_floor_w: defaults.solar_noise_floor_w,
            battery_noise_floor_w: defaults.battery_noise_floor_w,
        }
    }
}

impl FlowConfig {
    pub fn constraints(&self) -> AttributionConstraints {
        AttributionConstraints {
            solar_noise_floor_w: self.solar_noise_floor_w,
            battery_noise_floor_w: self.battery_noise_floor_w,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DashboardConfig {
    #[validate(length(min = 1))]
    pub graphs: Vec<Graph>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        use strum::IntoEnumIterator;
        Self {
            graphs: Graph::iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub mode: HardwareMode,
}

impl Config {
    /// Defaults, then `config/default.toml`, then `EFD__`-prefixed
    /// environment variables (`EFD__POLLING__LOCAL_UPDATE_INTERVAL_MS=5000`).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("EFD__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate().context("configuration out of range")?;
        config
            .flow
            .constraints()
            .validate()
            .map_err(|e| anyhow::anyhow!("flow constraints: {e}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::from_figment(Figment::from(Serialized::defaults(Config::default()))).unwrap();
        assert_eq!(config.polling.local_interval(), Duration::from_secs(10));
        assert_eq!(config.polling.cloud_interval(), Duration::from_secs(300));
        assert_eq!(config.site.twc_manager_port, 8080);
        assert_eq!(config.dashboard.graphs.len(), 7);
        assert_eq!(config.hardware.mode, HardwareMode::Simulated);
    }

    #[test]
    fn test_toml_overrides() {
        let toml = r#"
            [polling]
            local_update_interval_ms = 5000

            [site]
            twc_manager_ip = "192.168.1.40"
            home = [59.33, 18.06]

            [dashboard]
            graphs = ["PowerLine", "Grid"]

            [hardware]
            mode = "offline"
        "#;
        let config = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)),
        )
        .unwrap();
        assert_eq!(config.polling.local_interval(), Duration::from_secs(5));
        assert_eq!(config.polling.cloud_update_interval_ms, 300_000);
        assert_eq!(config.dashboard.graphs, vec![Graph::PowerLine, Graph::Grid]);
        assert_eq!(config.hardware.mode, HardwareMode::Offline);
        assert!(config.site.home_location().is_some());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let toml = r#"
            [polling]
            local_update_interval_ms = 10
        "#;
        let result = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)),
        );
        assert!(result.is_err());

        let empty_graphs = r#"
            [dashboard]
            graphs = []
        "#;
        let result = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(empty_graphs)),
        );
        assert!(result.is_err());
    }
}
