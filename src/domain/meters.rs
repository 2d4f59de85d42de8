use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ensure_finite, SourceResult};
use crate::power_flow::MeterSnapshot;

/// One meter as reported by the local gateway's aggregates endpoint.
///
/// `instant_power` follows the gateway convention: positive means the meter
/// is supplying (solar producing, battery discharging, grid importing).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub instant_power: f64,
    /// Lifetime energy counter (Wh)
    #[serde(default)]
    pub energy_exported: f64,
    /// Lifetime energy counter (Wh)
    #[serde(default)]
    pub energy_imported: f64,
}

/// A simultaneous set of readings from the local gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub site: MeterReading,
    pub battery: MeterReading,
    pub load: MeterReading,
    pub solar: MeterReading,
    #[serde(default = "Utc::now")]
    pub read_at: DateTime<Utc>,
}

impl Aggregates {
    /// Instantaneous power view used by the flow attribution engine
    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            solar_power: self.solar.instant_power,
            battery_power: self.battery.instant_power,
            grid_power: self.site.instant_power,
            load_power: self.load.instant_power,
        }
    }

    /// Cumulative lifetime counters used by the day accumulator
    pub fn counters(&self) -> EnergyCounters {
        EnergyCounters {
            solar_exported: self.solar.energy_exported,
            grid_exported: self.site.energy_exported,
            grid_imported: self.site.energy_imported,
            battery_exported: self.battery.energy_exported,
            battery_imported: self.battery.energy_imported,
            load_imported: self.load.energy_imported,
        }
    }

    pub fn load_power(&self) -> f64 {
        self.load.instant_power
    }

    pub fn validate(&self) -> SourceResult<()> {
        for (name, meter) in [
            ("site", &self.site),
            ("battery", &self.battery),
            ("load", &self.load),
            ("solar", &self.solar),
        ] {
            ensure_finite(&format!("{name}.instant_power"), meter.instant_power)?;
            ensure_finite(&format!("{name}.energy_exported"), meter.energy_exported)?;
            ensure_finite(&format!("{name}.energy_imported"), meter.energy_imported)?;
        }
        Ok(())
    }
}

/// Cumulative lifetime energy counters (Wh) at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyCounters {
    pub solar_exported: f64,
    pub grid_exported: f64,
    pub grid_imported: f64,
    pub battery_exported: f64,
    pub battery_imported: f64,
    pub load_imported: f64,
}

/// Grid connection state reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridStatus {
    #[serde(rename = "SystemGridConnected")]
    Connected,
    #[serde(rename = "SystemIslandedActive")]
    IslandedActive,
    #[serde(rename = "SystemTransitionToGrid")]
    TransitionToGrid,
}

impl GridStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, GridStatus::Connected)
    }
}

impl Default for GridStatus {
    fn default() -> Self {
        GridStatus::Connected
    }
}

impl fmt::Display for GridStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::IslandedActive => write!(f, "islanded"),
            Self::TransitionToGrid => write!(f, "transitioning to grid"),
        }
    }
}

/// Convert the gateway's raw state-of-energy reading into the percentage
/// shown to the user. The gateway keeps a 5% reserve it never reports as
/// usable.
pub fn usable_state_of_energy(raw_percentage: f64) -> f64 {
    ((raw_percentage - 5.0) / 0.95).clamp(0.0, 100.0)
}
