use chrono::{DateTime, FixedOffset, TimeZone};
use itertools::{EitherOrBoth, Itertools};
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::warn;

use crate::domain::{ChargeSample, PowerSample};
use crate::power_flow::{Sink, Source};

/// Magnitude drawn for a category that is active next to a near-zero point,
/// so the filled area stays visually connected
const TRACE: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "role", content = "category", rename_all = "lowercase")]
pub enum SeriesKey {
    Source(Source),
    Sink(Sink),
}

impl SeriesKey {
    /// Stacking order for the chart, lowest drawn first
    pub fn draw_order(&self) -> u8 {
        match self {
            SeriesKey::Sink(Sink::House) => 1,
            SeriesKey::Sink(Sink::Car) => 2,
            SeriesKey::Source(Source::Solar) => 3,
            SeriesKey::Source(Source::Battery) | SeriesKey::Sink(Sink::Battery) => 4,
            SeriesKey::Source(Source::Grid) | SeriesKey::Sink(Sink::Grid) => 5,
        }
    }

    fn keep(&self, value: f64) -> f64 {
        match self {
            SeriesKey::Source(_) if value > 0.0 => value,
            SeriesKey::Sink(_) if value < 0.0 => value,
            _ => 0.0,
        }
    }

    fn trace(&self) -> f64 {
        match self {
            SeriesKey::Source(_) => TRACE,
            SeriesKey::Sink(_) => -TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySeries {
    pub key: SeriesKey,
    pub draw_order: u8,
    /// `None` marks a gap in the chart
    pub points: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistorySeries {
    pub timestamps: Vec<DateTime<FixedOffset>>,
    pub series: Vec<CategorySeries>,
}

/// One power sample paired with the charger sample at the same index
#[derive(Debug, Clone, Copy)]
struct Aligned {
    solar: f64,
    battery: f64,
    grid: f64,
    /// Negative while the car is drawing power
    car: f64,
}

impl Aligned {
    /// House and car demand as signed sink values.
    ///
    /// When the charger claims more than the meters say house and car used
    /// together, everything is booked to the car. This is known to
    /// misattribute some samples.
    fn house_and_car(&self) -> (f64, f64) {
        let house_plus_car = self.solar + self.battery + self.grid;
        if self.car.abs() > house_plus_car {
            (0.0, -house_plus_car)
        } else {
            (-(house_plus_car + self.car), self.car)
        }
    }

    fn value(&self, key: SeriesKey) -> f64 {
        let raw = match key {
            SeriesKey::Source(Source::Solar) => self.solar,
            SeriesKey::Source(Source::Battery) | SeriesKey::Sink(Sink::Battery) => self.battery,
            SeriesKey::Source(Source::Grid) | SeriesKey::Sink(Sink::Grid) => self.grid,
            SeriesKey::Sink(Sink::House) => self.house_and_car().0,
            SeriesKey::Sink(Sink::Car) => self.house_and_car().1,
        };
        key.keep(raw)
    }
}

/// Build the same-day power chart series.
///
/// Both logs are cut to samples at or after `midnight` and then paired by
/// index, not by timestamp; mismatched timestamps are logged and tolerated.
pub fn build_series<Tz: TimeZone>(
    power: &[PowerSample],
    charge: &[ChargeSample],
    midnight: &DateTime<Tz>,
) -> HistorySeries {
    let midnight = midnight.fixed_offset();
    let power: Vec<&PowerSample> = power.iter().filter(|s| s.timestamp >= midnight).collect();
    let charge: Vec<&ChargeSample> = charge.iter().filter(|s| s.timestamp >= midnight).collect();

    let mut mismatched = 0usize;
    let samples: Vec<Aligned> = power
        .iter()
        .zip_longest(charge.iter())
        .filter_map(|pair| {
            let (sample, car) = match pair {
                EitherOrBoth::Both(sample, c) => {
                    if c.timestamp != sample.timestamp {
                        mismatched += 1;
                    }
                    (sample, -c.charger_power)
                }
                EitherOrBoth::Left(sample) => (sample, 0.0),
                // Charger samples past the end of the power log have nothing to pair with
                EitherOrBoth::Right(_) => return None,
            };
            Some(Aligned {
                solar: sample.solar_power,
                battery: sample.battery_power,
                grid: sample.grid_power,
                car,
            })
        })
        .collect();
    if mismatched > 0 {
        warn!(mismatched, samples = samples.len(), "power and charger history timestamps disagree");
    }

    let keys = Source::iter()
        .map(SeriesKey::Source)
        .chain(Sink::iter().map(SeriesKey::Sink));
    let series = keys
        .map(|key| {
            let values: Vec<f64> = samples.iter().map(|s| s.value(key)).collect();
            CategorySeries {
                key,
                draw_order: key.draw_order(),
                points: with_gaps(&values, key),
            }
        })
        .collect();

    HistorySeries {
        timestamps: power.iter().map(|s| s.timestamp).collect(),
        series,
    }
}

/// A point is a gap only when it and both neighbours are exactly zero.
/// Otherwise values under 1 W are replaced by a signed trace.
fn with_gaps(values: &[f64], key: SeriesKey) -> Vec<Option<f64>> {
    let nonzero = |i: Option<usize>| i.and_then(|i| values.get(i)).map_or(false, |v| *v != 0.0);
    (0..values.len())
        .map(|i| {
            if nonzero(Some(i)) || nonzero(i.checked_sub(1)) || nonzero(Some(i + 1)) {
                let v = values[i];
                Some(if v.abs() >= 1.0 { v } else { key.trace() })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn midnight() -> DateTime<FixedOffset> {
        FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
            .unwrap()
    }

    fn power(minutes: i64, solar: f64, battery: f64, grid: f64) -> PowerSample {
        PowerSample {
            timestamp: midnight() + Duration::minutes(minutes),
            solar_power: solar,
            battery_power: battery,
            grid_power: grid,
        }
    }

    fn charge(minutes: i64, watts: f64) -> ChargeSample {
        ChargeSample {
            timestamp: midnight() + Duration::minutes(minutes),
            charger_power: watts,
        }
    }

    fn points(history: &HistorySeries, key: SeriesKey) -> Vec<Option<f64>> {
        history
            .series
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.points.clone())
            .unwrap()
    }

    #[test]
    fn test_series_layout() {
        let history = build_series(&[power(0, 100.0, 0.0, 0.0)], &[], &midnight());
        let keys: Vec<SeriesKey> = history.series.iter().map(|s| s.key).collect();
        assert_eq!(
            keys,
            vec![
                SeriesKey::Source(Source::Solar),
                SeriesKey::Source(Source::Battery),
                SeriesKey::Source(Source::Grid),
                SeriesKey::Sink(Sink::Battery),
                SeriesKey::Sink(Sink::Car),
                SeriesKey::Sink(Sink::House),
                SeriesKey::Sink(Sink::Grid),
            ]
        );
        assert_eq!(history.timestamps.len(), 1);
    }

    #[test]
    fn test_samples_before_midnight_are_dropped() {
        let history = build_series(
            &[power(-5, 100.0, 0.0, 0.0), power(0, 200.0, 0.0, 0.0)],
            &[charge(-5, 1000.0)],
            &midnight(),
        );
        assert_eq!(history.timestamps, vec![midnight()]);
        assert_eq!(points(&history, SeriesKey::Source(Source::Solar)), vec![Some(200.0)]);
        // The pre-midnight charger sample must not pair with index 0
        assert_eq!(points(&history, SeriesKey::Sink(Sink::Car)), vec![None]);
    }

    #[test]
    fn test_house_and_car_split() {
        // 3kW supplied, car drew 1kW
        let history = build_series(&[power(0, 2000.0, 0.0, 1000.0)], &[charge(0, 1000.0)], &midnight());
        assert_eq!(points(&history, SeriesKey::Sink(Sink::Car)), vec![Some(-1000.0)]);
        assert_eq!(points(&history, SeriesKey::Sink(Sink::House)), vec![Some(-2000.0)]);
    }

    #[test]
    fn test_charger_overclaim_books_everything_to_car() {
        let history = build_series(&[power(0, 0.0, 0.0, 1500.0)], &[charge(0, 7000.0)], &midnight());
        assert_eq!(points(&history, SeriesKey::Sink(Sink::Car)), vec![Some(-1500.0)]);
        assert_eq!(points(&history, SeriesKey::Sink(Sink::House)), vec![None]);
    }

    #[test]
    fn test_signed_filters() {
        let history = build_series(&[power(0, 0.0, -800.0, -400.0)], &[], &midnight());
        assert_eq!(points(&history, SeriesKey::Source(Source::Battery)), vec![None]);
        assert_eq!(points(&history, SeriesKey::Sink(Sink::Battery)), vec![Some(-800.0)]);
        assert_eq!(points(&history, SeriesKey::Sink(Sink::Grid)), vec![Some(-400.0)]);
    }

    #[test]
    fn test_gap_rule() {
        let key = SeriesKey::Source(Source::Solar);
        assert_eq!(
            with_gaps(&[5.0, 0.0, 5.0], key),
            vec![Some(5.0), Some(TRACE), Some(5.0)]
        );
        assert_eq!(
            with_gaps(&[0.0, 0.0, 0.0, 5.0], key),
            vec![None, None, Some(TRACE), Some(5.0)]
        );
        assert_eq!(
            with_gaps(&[0.0, 0.5, 0.0, 0.0], SeriesKey::Sink(Sink::Grid)),
            vec![Some(-TRACE), Some(-TRACE), Some(-TRACE), None]
        );
    }

    #[test]
    fn test_misaligned_logs_still_pair_by_index() {
        let history = build_series(
            &[power(0, 0.0, 0.0, 2000.0), power(5, 0.0, 0.0, 2000.0)],
            &[charge(1, 1000.0), charge(6, 1500.0)],
            &midnight(),
        );
        assert_eq!(
            points(&history, SeriesKey::Sink(Sink::Car)),
            vec![Some(-1000.0), Some(-1500.0)]
        );
    }

    #[test]
    fn test_logs_of_unequal_length() {
        let history = build_series(
            &[power(0, 0.0, 0.0, 2000.0), power(5, 0.0, 0.0, 2000.0), power(10, 0.0, 0.0, 2000.0)],
            &[charge(0, 1000.0)],
            &midnight(),
        );
        assert_eq!(history.timestamps.len(), 3);
        assert_eq!(
            points(&history, SeriesKey::Sink(Sink::Car)),
            vec![Some(-1000.0), Some(-TRACE), None]
        );

        let history = build_series(&[power(0, 0.0, 0.0, 2000.0)], &[charge(0, 1000.0), charge(5, 1000.0)], &midnight());
        assert_eq!(history.timestamps.len(), 1);
        assert_eq!(points(&history, SeriesKey::Sink(Sink::Car)), vec![Some(-1000.0)]);
    }
}
