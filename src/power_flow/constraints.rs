use serde::{Deserialize, Serialize};

/// Noise floors applied to meter readings before attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionConstraints {
    /// Solar readings below this are treated as zero (W)
    pub solar_noise_floor_w: i64,

    /// Battery readings with magnitude at or below this are treated as
    /// idle (W). Meter jitter at idle otherwise flickers the battery in
    /// and out of the graph.
    pub battery_noise_floor_w: i64,
}

impl Default for AttributionConstraints {
    fn default() -> Self {
        Self {
            solar_noise_floor_w: 5,
            battery_noise_floor_w: 20,
        }
    }
}

impl AttributionConstraints {
    pub fn validate(&self) -> Result<(), String> {
        if self.solar_noise_floor_w < 0 {
            return Err("solar_noise_floor_w must be >= 0".to_string());
        }
        if self.battery_noise_floor_w < 0 {
            return Err("battery_noise_floor_w must be >= 0".to_string());
        }
        Ok(())
    }

    /// Truncated solar wattage with the floor applied
    pub fn solar(&self, solar_power: f64) -> i64 {
        let solar = solar_power.trunc() as i64;
        if solar < self.solar_noise_floor_w {
            0
        } else {
            solar
        }
    }

    /// Truncated battery wattage with the floor applied
    pub fn battery(&self, battery_power: f64) -> i64 {
        let battery = battery_power.trunc() as i64;
        if battery.abs() <= self.battery_noise_floor_w {
            0
        } else {
            battery
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_floors() {
        let c = AttributionConstraints::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.solar(4.9), 0);
        assert_eq!(c.solar(5.7), 5);
        assert_eq!(c.solar(-30.0), 0);
        assert_eq!(c.battery(20.9), 0);
        assert_eq!(c.battery(-20.0), 0);
        assert_eq!(c.battery(21.0), 21);
        assert_eq!(c.battery(-21.5), -21);
    }

    #[test]
    fn test_negative_floor_rejected() {
        let c = AttributionConstraints {
            solar_noise_floor_w: -1,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
