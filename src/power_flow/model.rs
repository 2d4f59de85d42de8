use strum::IntoEnumIterator;
use tracing::warn;

use super::{AttributionConstraints, FlowGraph, MeterSnapshot, Sink, Source};

/// Flow attribution engine
///
/// Decomposes a meter snapshot into a source to sink flow graph. Demand is
/// satisfied greedily in a fixed priority order: sources are visited
/// solar, battery, grid and within each source the sinks are visited
/// battery, car, house, grid. The order is the tie-break whenever several
/// sources could cover the same sink, so it must not change.
///
/// Readings are not required to balance. Whatever supply or demand is left
/// over after the greedy pass is dropped.
#[derive(Debug, Clone, Default)]
pub struct FlowAttributor {
    constraints: AttributionConstraints,
}

impl FlowAttributor {
    pub fn new(constraints: AttributionConstraints) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &AttributionConstraints {
        &self.constraints
    }

    /// `None` meters means there is nothing to attribute yet, which is not
    /// the same as zero flow.
    pub fn attribute(&self, meters: Option<&MeterSnapshot>, car_load_w: i64) -> Option<FlowGraph> {
        let meters = meters?;

        let solar = self.constraints.solar(meters.solar_power);
        let battery = self.constraints.battery(meters.battery_power);
        let grid = meters.grid_power.trunc() as i64;
        let mut house = meters.load_power.trunc() as i64;

        let car = if car_load_w > 0 && car_load_w <= house {
            house -= car_load_w;
            car_load_w
        } else {
            if car_load_w > 0 {
                warn!(car_load_w, house_w = house, "car load exceeds house load, ignoring estimate");
            }
            0
        };

        let mut supply = [
            (Source::Solar, solar.max(0)),
            (Source::Battery, battery.max(0)),
            (Source::Grid, grid.max(0)),
        ];
        let mut demand = [
            (Sink::Battery, (-battery).max(0)),
            (Sink::Car, car),
            (Sink::House, house.max(0)),
            (Sink::Grid, (-grid).max(0)),
        ];
        debug_assert!(supply.iter().map(|(s, _)| *s).eq(Source::iter()));
        debug_assert!(demand.iter().map(|(k, _)| *k).eq(Sink::iter()));

        let mut graph = FlowGraph::default();
        for (source, available) in supply.iter_mut() {
            for (sink, required) in demand.iter_mut() {
                if !source.feeds(*sink) {
                    continue;
                }
                let claimed = (*available).min(*required);
                if claimed > 0 {
                    *available -= claimed;
                    *required -= claimed;
                    graph.add_edge(*source, *sink, claimed);
                }
            }
        }

        Some(graph)
    }
}

/// Attribute with the default noise floors
pub fn attribute_flows(meters: Option<&MeterSnapshot>, car_load_w: i64) -> Option<FlowGraph> {
    FlowAttributor::default().attribute(meters, car_load_w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn attribute(solar: f64, battery: f64, grid: f64, load: f64, car: i64) -> FlowGraph {
        attribute_flows(Some(&MeterSnapshot::new(solar, battery, grid, load)), car).unwrap()
    }

    #[test]
    fn test_no_meters_no_graph() {
        assert!(attribute_flows(None, 0).is_none());
        assert!(attribute_flows(None, 7200).is_none());
    }

    #[test]
    fn test_solar_charges_battery_feeds_house_and_exports() {
        let graph = attribute(3000.0, -1000.0, -500.0, 1500.0, 0);

        assert_eq!(graph.source_total(Source::Solar), 3000);
        assert_eq!(graph.edge(Source::Solar, Sink::Battery), 1000);
        assert_eq!(graph.edge(Source::Solar, Sink::House), 1500);
        assert_eq!(graph.edge(Source::Solar, Sink::Grid), 500);
        assert_eq!(graph.sink_total(Sink::Grid), 500);
        assert_eq!(graph.sink_total(Sink::Battery), 1000);
        assert!(graph.is_consistent());
    }

    #[test]
    fn test_solar_preferred_over_battery() {
        // Both solar and battery could cover the house; solar goes first
        let graph = attribute(1000.0, 1000.0, 0.0, 1500.0, 0);
        assert_eq!(graph.edge(Source::Solar, Sink::House), 1000);
        assert_eq!(graph.edge(Source::Battery, Sink::House), 500);
        assert_eq!(graph.source_total(Source::Battery), 500);
    }

    #[test]
    fn test_car_served_before_house() {
        let graph = attribute(2000.0, 0.0, 3000.0, 5000.0, 2500);
        assert_eq!(graph.edge(Source::Solar, Sink::Car), 2000);
        assert_eq!(graph.edge(Source::Grid, Sink::Car), 500);
        assert_eq!(graph.edge(Source::Grid, Sink::House), 2500);
        assert_eq!(graph.sink_total(Sink::Car), 2500);
        assert_eq!(graph.sink_total(Sink::House), 2500);
    }

    #[test]
    fn test_grid_charges_battery_when_no_solar() {
        let graph = attribute(0.0, -2000.0, 2800.0, 800.0, 0);
        assert_eq!(graph.edge(Source::Grid, Sink::Battery), 2000);
        assert_eq!(graph.edge(Source::Grid, Sink::House), 800);
        assert_eq!(graph.source_total(Source::Battery), 0);
    }

    #[rstest]
    #[case::just_below(4.9)]
    #[case::tiny(1.0)]
    #[case::negative_night_draw(-12.0)]
    fn test_solar_noise_floor(#[case] solar: f64) {
        let graph = attribute(solar, 0.0, 500.0, 500.0, 0);
        assert_eq!(graph.source_total(Source::Solar), 0);
        assert!(graph.sources[&Source::Solar].distribution.is_empty());
    }

    #[rstest]
    #[case(19.9)]
    #[case(-19.9)]
    #[case(20.0)]
    #[case(-20.0)]
    fn test_battery_noise_floor(#[case] battery: f64) {
        let graph = attribute(1000.0, battery, -500.0, 500.0, 0);
        assert_eq!(graph.source_total(Source::Battery), 0);
        assert_eq!(graph.sink_total(Sink::Battery), 0);
        assert!(graph.sinks[&Sink::Battery].sources.is_empty());
    }

    #[test]
    fn test_oversized_car_estimate_is_rejected() {
        let graph = attribute(0.0, 0.0, 1500.0, 1500.0, 7200);
        assert_eq!(graph.sink_total(Sink::Car), 0);
        assert_eq!(graph.sink_total(Sink::House), 1500);
    }

    #[test]
    fn test_car_equal_to_load_is_accepted() {
        let graph = attribute(0.0, 0.0, 7200.0, 7200.0, 7200);
        assert_eq!(graph.sink_total(Sink::Car), 7200);
        assert_eq!(graph.sink_total(Sink::House), 0);
    }

    #[test]
    fn test_unbalanced_residual_is_dropped() {
        // Meters claim 500W more supply than load
        let graph = attribute(2000.0, 0.0, 0.0, 1500.0, 0);
        assert_eq!(graph.source_total(Source::Solar), 1500);
        assert_eq!(graph.total_sourced(), graph.total_sunk());

        // And here 400W more load than supply
        let graph = attribute(1000.0, 0.0, 100.0, 1500.0, 0);
        assert_eq!(graph.sink_total(Sink::House), 1100);
        assert!(graph.is_consistent());
    }

    #[test]
    fn test_readings_truncate_toward_zero() {
        let graph = attribute(1000.9, 0.0, -0.9, 1000.9, 0);
        assert_eq!(graph.edge(Source::Solar, Sink::House), 1000);
        assert_eq!(graph.sink_total(Sink::Grid), 0);
    }

    #[test]
    fn test_custom_floors() {
        let attributor = FlowAttributor::new(AttributionConstraints {
            solar_noise_floor_w: 50,
            battery_noise_floor_w: 100,
        });
        let meters = MeterSnapshot::new(40.0, 90.0, 200.0, 200.0);
        let graph = attributor.attribute(Some(&meters), 0).unwrap();
        assert_eq!(graph.total_sourced(), 200);
        assert_eq!(graph.edge(Source::Grid, Sink::House), 200);
    }
}
