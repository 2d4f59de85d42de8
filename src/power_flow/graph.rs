use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, IntoEnumIterator};

/// Categories that can supply power, in attribution priority order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumIter, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Source {
    Solar,
    Battery,
    Grid,
}

/// Categories that can consume power, in attribution priority order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumIter, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Sink {
    Battery,
    Car,
    House,
    Grid,
}

impl Source {
    /// A source never supplies its own sink category
    pub fn feeds(&self, sink: Sink) -> bool {
        !matches!(
            (self, sink),
            (Source::Battery, Sink::Battery) | (Source::Grid, Sink::Grid)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlow {
    pub total: i64,
    pub distribution: BTreeMap<Sink, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkFlow {
    pub total: i64,
    pub sources: BTreeMap<Source, i64>,
}

/// Source to sink wattage decomposition of one meter snapshot
///
/// Every source and sink category is always present; only edges that
/// carry power appear in the per-category maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub sources: BTreeMap<Source, SourceFlow>,
    pub sinks: BTreeMap<Sink, SinkFlow>,
}

impl Default for FlowGraph {
    fn default() -> Self {
        Self {
            sources: Source::iter().map(|s| (s, SourceFlow::default())).collect(),
            sinks: Sink::iter().map(|k| (k, SinkFlow::default())).collect(),
        }
    }
}

impl FlowGraph {
    /// Record `watts` flowing from `source` to `sink`
    pub(crate) fn add_edge(&mut self, source: Source, sink: Sink, watts: i64) {
        if watts <= 0 {
            return;
        }
        let from = self.sources.entry(source).or_default();
        from.total += watts;
        *from.distribution.entry(sink).or_default() += watts;

        let to = self.sinks.entry(sink).or_default();
        to.total += watts;
        *to.sources.entry(source).or_default() += watts;
    }

    pub fn source_total(&self, source: Source) -> i64 {
        self.sources.get(&source).map_or(0, |s| s.total)
    }

    pub fn sink_total(&self, sink: Sink) -> i64 {
        self.sinks.get(&sink).map_or(0, |s| s.total)
    }

    pub fn edge(&self, source: Source, sink: Sink) -> i64 {
        self.sources
            .get(&source)
            .and_then(|s| s.distribution.get(&sink))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_sourced(&self) -> i64 {
        self.sources.values().map(|s| s.total).sum()
    }

    pub fn total_sunk(&self) -> i64 {
        self.sinks.values().map(|s| s.total).sum()
    }

    /// Per-category totals add up on both sides of the graph
    pub fn is_consistent(&self) -> bool {
        self.sources
            .values()
            .all(|s| s.distribution.values().sum::<i64>() == s.total)
            && self
                .sinks
                .values()
                .all(|k| k.sources.values().sum::<i64>() == k.total)
            && self.total_sourced() == self.total_sunk()
    }

    /// Totals are whole watts, so `>= 1` is the half-watt threshold
    pub fn grid_direction(&self) -> GridDirection {
        if self.source_total(Source::Grid) >= 1 {
            GridDirection::Importing
        } else if self.sink_total(Sink::Grid) >= 1 {
            GridDirection::Exporting
        } else {
            GridDirection::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GridDirection {
    Importing,
    Exporting,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BatteryActivity {
    Supplying,
    Charging,
    Standby,
}

impl BatteryActivity {
    pub fn from_power(battery_power: f64, noise_floor_w: i64) -> Self {
        let floor = noise_floor_w as f64;
        if battery_power > floor {
            BatteryActivity::Supplying
        } else if battery_power < -floor {
            BatteryActivity::Charging
        } else {
            BatteryActivity::Standby
        }
    }
}
