use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::{ensure_finite, SourceError, SourceResult};

/// One day of the cloud API's day-granularity energy history (Wh)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyDay {
    pub solar_energy_exported: f64,
    pub grid_energy_imported: f64,
    pub grid_energy_exported_from_solar: f64,
    pub grid_energy_exported_from_battery: f64,
    pub grid_energy_exported_from_generator: f64,
    pub battery_energy_exported: f64,
    pub battery_energy_imported_from_grid: f64,
    pub battery_energy_imported_from_solar: f64,
    pub battery_energy_imported_from_generator: f64,
    pub consumer_energy_imported_from_grid: f64,
    pub consumer_energy_imported_from_solar: f64,
    pub consumer_energy_imported_from_battery: f64,
}

impl EnergyDay {
    pub fn solar(&self) -> f64 {
        self.solar_energy_exported
    }

    pub fn grid_imported(&self) -> f64 {
        self.grid_energy_imported
    }

    pub fn grid_exported(&self) -> f64 {
        self.grid_energy_exported_from_solar
            + self.grid_energy_exported_from_battery
            + self.grid_energy_exported_from_generator
    }

    pub fn battery_exported(&self) -> f64 {
        self.battery_energy_exported
    }

    pub fn battery_imported(&self) -> f64 {
        self.battery_energy_imported_from_grid
            + self.battery_energy_imported_from_solar
            + self.battery_energy_imported_from_generator
    }

    pub fn consumption(&self) -> f64 {
        self.consumer_energy_imported_from_grid
            + self.consumer_energy_imported_from_solar
            + self.consumer_energy_imported_from_battery
    }

    fn validate(&self) -> SourceResult<()> {
        for (name, value) in [
            ("solar", self.solar()),
            ("grid_imported", self.grid_imported()),
            ("grid_exported", self.grid_exported()),
            ("battery_exported", self.battery_exported()),
            ("battery_imported", self.battery_imported()),
            ("consumption", self.consumption()),
        ] {
            ensure_finite(name, value)?;
        }
        Ok(())
    }
}

/// Yesterday and today-so-far, in that order on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyHistory {
    pub yesterday: EnergyDay,
    pub today: EnergyDay,
}

impl EnergyHistory {
    /// Build from the API's two-entry array, validating its shape
    pub fn from_days(days: Vec<EnergyDay>) -> SourceResult<Self> {
        let [yesterday, today]: [EnergyDay; 2] = days.try_into().map_err(|v: Vec<EnergyDay>| {
            SourceError::Payload(format!("expected 2 energy days, got {}", v.len()))
        })?;
        yesterday.validate()?;
        today.validate()?;
        Ok(Self { yesterday, today })
    }
}

/// Share of consumption covered by solar and battery for one day (percent)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfConsumptionDay {
    pub solar: f64,
    pub battery: f64,
}

impl SelfConsumptionDay {
    /// `[solar, battery, grid]` percentages; grid is the remainder
    pub fn breakdown(&self) -> [f64; 3] {
        [self.solar, self.battery, 100.0 - self.solar - self.battery]
    }

    pub fn self_powered_percent(&self) -> f64 {
        self.solar.round() + self.battery.round()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelfConsumptionHistory {
    pub yesterday: SelfConsumptionDay,
    pub today: SelfConsumptionDay,
}

impl SelfConsumptionHistory {
    pub fn from_days(days: Vec<SelfConsumptionDay>) -> SourceResult<Self> {
        let [yesterday, today]: [SelfConsumptionDay; 2] =
            days.try_into().map_err(|v: Vec<SelfConsumptionDay>| {
                SourceError::Payload(format!("expected 2 self-consumption days, got {}", v.len()))
            })?;
        Ok(Self { yesterday, today })
    }
}

/// One sample of the cloud's same-day power history (W). Positive values
/// mean the category is supplying power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub solar_power: f64,
    #[serde(default)]
    pub battery_power: f64,
    #[serde(default)]
    pub grid_power: f64,
}

/// A grid outage recorded by the cloud backup log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub timestamp: DateTime<FixedOffset>,
    /// Outage duration in milliseconds
    pub duration: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_history_requires_two_days() {
        let err = EnergyHistory::from_days(vec![EnergyDay::default()]).unwrap_err();
        assert!(matches!(err, SourceError::Payload(_)));
        assert!(EnergyHistory::from_days(vec![EnergyDay::default(), EnergyDay::default()]).is_ok());
    }

    #[test]
    fn test_energy_day_sums() {
        let day = EnergyDay {
            grid_energy_exported_from_solar: 100.0,
            grid_energy_exported_from_battery: 20.0,
            grid_energy_exported_from_generator: 1.0,
            battery_energy_imported_from_grid: 5.0,
            battery_energy_imported_from_solar: 300.0,
            consumer_energy_imported_from_grid: 1000.0,
            consumer_energy_imported_from_solar: 2000.0,
            consumer_energy_imported_from_battery: 500.0,
            ..Default::default()
        };
        assert_eq!(day.grid_exported(), 121.0);
        assert_eq!(day.battery_imported(), 305.0);
        assert_eq!(day.consumption(), 3500.0);
    }

    #[test]
    fn test_self_consumption_breakdown() {
        let day = SelfConsumptionDay {
            solar: 40.4,
            battery: 35.6,
        };
        let [solar, battery, grid] = day.breakdown();
        assert_eq!(solar, 40.4);
        assert_eq!(battery, 35.6);
        assert!((grid - 24.0).abs() < 1e-9);
        assert_eq!(day.self_powered_percent(), 76.0);
    }

    #[test]
    fn test_power_sample_defaults_missing_categories() {
        let sample: PowerSample =
            serde_json::from_str(r#"{"timestamp": "2024-05-01T10:05:00-07:00", "solar_power": 2500}"#)
                .unwrap();
        assert_eq!(sample.solar_power, 2500.0);
        assert_eq!(sample.grid_power, 0.0);
    }
}
