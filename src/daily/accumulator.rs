use chrono::{DateTime, Local, NaiveDate, Timelike};
use serde::Serialize;
use tracing::info;

use crate::domain::{EnergyCounters, EnergyDay, EnergyHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStartOrigin {
    /// Captured from live counters at midnight
    Midnight,
    /// Reconstructed from the cloud's day history
    Backfilled,
}

/// Lifetime counters as they stood at local midnight
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DayStart {
    pub counters: EnergyCounters,
    pub origin: DayStartOrigin,
}

/// Energy since midnight per category (Wh)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TodayTotals {
    pub solar: f64,
    pub usage: f64,
    pub grid_import: f64,
    pub grid_export: f64,
    pub battery_import: f64,
    pub battery_export: f64,
}

/// Yesterday's totals (Wh)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct YesterdayTotals {
    pub solar: f64,
    pub usage: f64,
    pub grid_import: f64,
    pub grid_export: f64,
}

impl From<&EnergyDay> for YesterdayTotals {
    fn from(day: &EnergyDay) -> Self {
        Self {
            solar: day.solar(),
            usage: day.consumption(),
            grid_import: day.grid_imported(),
            grid_export: day.grid_exported(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayTransition {
    SameDay,
    /// Rollover seen within the first minute of the day
    Midnight,
    /// Rollover seen late; the day start must be rebuilt from history
    MissedMidnight,
}

/// Turns lifetime energy counters into "since midnight" figures
///
/// The day start is only ever replaced whole, never patched field by field.
#[derive(Debug, Clone, Default)]
pub struct DayAccumulator {
    day: Option<NaiveDate>,
    day_start: Option<DayStart>,
    yesterday: Option<YesterdayTotals>,
}

impl DayAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check for a day rollover. Called on every data refresh.
    pub fn observe(&mut self, now: DateTime<Local>, counters: Option<&EnergyCounters>) -> DayTransition {
        let today = now.date_naive();
        if self.day == Some(today) {
            return DayTransition::SameDay;
        }
        self.day = Some(today);

        match counters {
            Some(current) if now.hour() == 0 && now.minute() == 0 => {
                if let Some(start) = self.day_start {
                    self.yesterday = Some(since(&start.counters, current).into());
                }
                self.day_start = Some(DayStart {
                    counters: *current,
                    origin: DayStartOrigin::Midnight,
                });
                info!(day = %today, "day rollover at midnight");
                DayTransition::Midnight
            }
            _ => {
                self.day_start = None;
                info!(day = %today, "day rollover missed, day start needs backfill");
                DayTransition::MissedMidnight
            }
        }
    }

    /// Apply the cloud's two-day history. Yesterday's figures always come
    /// from it; the day start is reconstructed only when none is held.
    /// Returns true if the day start was rebuilt.
    pub fn backfill(&mut self, history: &EnergyHistory, counters: &EnergyCounters) -> bool {
        self.yesterday = Some(YesterdayTotals::from(&history.yesterday));
        if self.day_start.is_some() {
            return false;
        }
        let today = &history.today;
        self.day_start = Some(DayStart {
            counters: EnergyCounters {
                solar_exported: counters.solar_exported - today.solar(),
                grid_exported: counters.grid_exported - today.grid_exported(),
                grid_imported: counters.grid_imported - today.grid_imported(),
                battery_exported: counters.battery_exported - today.battery_exported(),
                battery_imported: counters.battery_imported - today.battery_imported(),
                load_imported: counters.load_imported - today.consumption(),
            },
            origin: DayStartOrigin::Backfilled,
        });
        true
    }

    pub fn day_start(&self) -> Option<&DayStart> {
        self.day_start.as_ref()
    }

    pub fn yesterday(&self) -> Option<&YesterdayTotals> {
        self.yesterday.as_ref()
    }

    pub fn needs_backfill(&self) -> bool {
        self.day_start.is_none()
    }

    pub fn today(&self, counters: &EnergyCounters) -> Option<TodayTotals> {
        self.day_start.map(|start| since(&start.counters, counters))
    }
}

fn since(start: &EnergyCounters, now: &EnergyCounters) -> TodayTotals {
    TodayTotals {
        solar: now.solar_exported - start.solar_exported,
        usage: now.load_imported - start.load_imported,
        grid_import: now.grid_imported - start.grid_imported,
        grid_export: now.grid_exported - start.grid_exported,
        battery_import: now.battery_imported - start.battery_imported,
        battery_export: now.battery_exported - start.battery_exported,
    }
}

impl From<TodayTotals> for YesterdayTotals {
    fn from(t: TodayTotals) -> Self {
        Self {
            solar: t.solar,
            usage: t.usage,
            grid_import: t.grid_import,
            grid_export: t.grid_export,
        }
    }
}
