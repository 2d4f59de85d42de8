use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ensure_finite, SourceResult};

/// Charger manager status (TWC-like)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerStatus {
    pub cars_charging: u32,
    /// Some charger managers report this as a string
    #[serde(deserialize_with = "number_or_string")]
    pub charger_load_watts: f64,
    #[serde(default)]
    pub vins: Vec<String>,
}

impl ChargerStatus {
    /// Charger load rounded to whole watts, as used for flow attribution
    pub fn load_w(&self) -> i64 {
        self.charger_load_watts.round() as i64
    }

    pub fn validate(&self) -> SourceResult<()> {
        ensure_finite("chargerLoadWatts", self.charger_load_watts)
    }
}

/// One entry of the charger's instantaneous power log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSample {
    pub timestamp: DateTime<FixedOffset>,
    pub charger_power: f64,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
