/// Energy flow attribution
///
/// Turns simultaneous, possibly unbalanced meter readings into a
/// deterministic "who powered what" graph.

pub mod constraints;
pub mod graph;
pub mod model;
pub mod snapshot;

pub use constraints::AttributionConstraints;
pub use graph::{BatteryActivity, FlowGraph, GridDirection, Sink, SinkFlow, Source, SourceFlow};
pub use model::{attribute_flows, FlowAttributor};
pub use snapshot::MeterSnapshot;
