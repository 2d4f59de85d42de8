use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ensure_finite, SourceResult};

/// One coherent instant of meter truth
///
/// Sign convention: positive solar/battery/grid means that meter is
/// supplying power (producing, discharging, importing). `load_power` is the
/// combined house and car consumption magnitude.
///
/// The four readings come from different meters sampled at slightly
/// different instants, so `solar + battery + grid` only approximately
/// equals `load`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub solar_power: f64,
    pub battery_power: f64,
    pub grid_power: f64,
    pub load_power: f64,
}

impl MeterSnapshot {
    pub fn new(solar_power: f64, battery_power: f64, grid_power: f64, load_power: f64) -> Self {
        Self {
            solar_power,
            battery_power,
            grid_power,
            load_power,
        }
    }

    /// Supply minus demand as measured (W). Non-zero is normal.
    pub fn imbalance(&self) -> f64 {
        self.solar_power + self.battery_power + self.grid_power - self.load_power
    }

    /// Within `tolerance_w` of balancing
    pub fn is_balanced(&self, tolerance_w: f64) -> bool {
        self.imbalance().abs() <= tolerance_w
    }

    pub fn grid_import(&self) -> f64 {
        self.grid_power.max(0.0)
    }

    pub fn grid_export(&self) -> f64 {
        (-self.grid_power).max(0.0)
    }

    pub fn validate(&self) -> SourceResult<()> {
        ensure_finite("solar_power", self.solar_power)?;
        ensure_finite("battery_power", self.battery_power)?;
        ensure_finite("grid_power", self.grid_power)?;
        ensure_finite("load_power", self.load_power)
    }
}

impl fmt::Display for MeterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MeterSnapshot {{ Solar: {:.0}W, Battery: {:.0}W, Grid: {:.0}W, Load: {:.0}W, Imbalance: {:.0}W }}",
            self.solar_power,
            self.battery_power,
            self.grid_power,
            self.load_power,
            self.imbalance()
        )
    }
}
