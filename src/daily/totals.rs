use chrono::{DateTime, Duration, TimeZone};
use serde::Serialize;

use super::{TodayTotals, YesterdayTotals};
use crate::domain::{ChargeSample, SelfConsumptionHistory};

/// Samples in the charger's power log are five minutes apart
const SAMPLES_PER_HOUR: f64 = 12.0;

/// Energy delivered by the home charger (Wh)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CarEnergy {
    pub today: f64,
    pub yesterday: f64,
}

impl CarEnergy {
    pub fn from_samples<Tz: TimeZone>(samples: &[ChargeSample], midnight: &DateTime<Tz>) -> Self {
        let midnight = midnight.fixed_offset();
        let previous = midnight - Duration::days(1);
        let mut energy = CarEnergy::default();
        for sample in samples {
            let wh = sample.charger_power / SAMPLES_PER_HOUR;
            if sample.timestamp >= midnight {
                energy.today += wh;
            } else if sample.timestamp >= previous {
                energy.yesterday += wh;
            }
        }
        energy
    }
}

/// Figures shown on the energy tiles
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnergyTotals {
    pub today: Option<TodayTotals>,
    pub yesterday: Option<YesterdayTotals>,
    /// House usage net of car charging
    pub house_today: Option<f64>,
    pub house_yesterday: Option<f64>,
    pub car: CarEnergy,
    pub any_production_today: bool,
    pub bars: Vec<EnergyBar>,
}

/// One category of the energy bar chart: `out` is drawn below the axis
/// (negative), `into` above it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyBar {
    pub category: &'static str,
    pub out: f64,
    pub into: f64,
}

impl EnergyTotals {
    pub fn compute(
        today: Option<TodayTotals>,
        yesterday: Option<YesterdayTotals>,
        car: CarEnergy,
        charger_present: bool,
    ) -> Self {
        let house_today = today.map(|t| (t.usage - car.today).max(0.0));
        let house_yesterday = yesterday.map(|y| (y.usage - car.yesterday).max(0.0));
        let bars = today
            .map(|t| {
                let mut bars = vec![
                    EnergyBar {
                        category: "grid",
                        out: -t.grid_export,
                        into: t.grid_import,
                    },
                    EnergyBar {
                        category: "battery",
                        out: -t.battery_import,
                        into: t.battery_export,
                    },
                    EnergyBar {
                        category: "house",
                        out: car.today - t.usage,
                        into: 0.0,
                    },
                ];
                if charger_present {
                    bars.push(EnergyBar {
                        category: "car",
                        out: -car.today,
                        into: 0.0,
                    });
                }
                bars.push(EnergyBar {
                    category: "solar",
                    out: 0.0,
                    into: t.solar,
                });
                bars
            })
            .unwrap_or_default();

        Self {
            today,
            yesterday,
            house_today,
            house_yesterday,
            car,
            any_production_today: today.map_or(false, |t| t.solar > 0.0),
            bars,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelfPowered {
    /// `[solar, battery, grid]` percent
    pub breakdown: [f64; 3],
    pub self_powered: f64,
}

/// Self-consumption doughnut data for today and yesterday
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelfConsumptionSummary {
    pub today: SelfPowered,
    pub yesterday: SelfPowered,
}

impl From<&SelfConsumptionHistory> for SelfConsumptionSummary {
    fn from(history: &SelfConsumptionHistory) -> Self {
        let summarize = |day: &crate::domain::SelfConsumptionDay| SelfPowered {
            breakdown: day.breakdown(),
            self_powered: day.self_powered_percent(),
        };
        Self {
            today: summarize(&history.today),
            yesterday: summarize(&history.yesterday),
        }
    }
}
