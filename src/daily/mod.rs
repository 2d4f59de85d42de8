//! Since-midnight energy accounting

pub mod accumulator;
pub mod totals;

pub use accumulator::{DayAccumulator, DayStart, DayStartOrigin, DayTransition, TodayTotals, YesterdayTotals};
pub use totals::{CarEnergy, EnergyBar, EnergyTotals, SelfConsumptionSummary, SelfPowered};

use chrono::{DateTime, Local};

/// Start of the local calendar day containing `now`. Falls back to `now`
/// itself if midnight does not exist on that day (DST gap).
pub fn local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|t| t.and_local_timezone(Local).earliest())
        .unwrap_or(now)
}
