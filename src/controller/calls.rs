use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumIter, EnumString};

/// Dashboard tiles that can be configured
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString, EnumIter, Display,
)]
pub enum Graph {
    CarCharging,
    Grid,
    PowerwallSelfPowered,
    SolarProduction,
    HouseConsumption,
    EnergyBar,
    PowerLine,
}

/// Kinds of upstream calls a tile depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Call {
    Local,
    Energy,
    SelfConsumption,
    Vehicle,
    /// Vehicle data only when there is no charger manager to ask
    VehicleIfNoCharger,
    Power,
    Storm,
}

impl Graph {
    pub fn required_calls(&self) -> &'static [Call] {
        match self {
            Graph::CarCharging => &[Call::Local, Call::Vehicle],
            Graph::PowerwallSelfPowered => &[Call::Local, Call::Energy, Call::SelfConsumption],
            Graph::SolarProduction | Graph::HouseConsumption => {
                &[Call::Local, Call::Energy, Call::VehicleIfNoCharger]
            }
            Graph::EnergyBar => &[Call::Local, Call::Energy],
            Graph::PowerLine => &[Call::Power],
            Graph::Grid => &[Call::Local, Call::Energy, Call::Storm],
        }
    }
}

/// The set of calls the configured tiles need; nothing else is requested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnabledCalls(BTreeSet<Call>);

impl EnabledCalls {
    pub fn for_graphs(graphs: &[Graph], charger_present: bool) -> Self {
        let mut calls: BTreeSet<Call> = graphs
            .iter()
            .flat_map(|g| g.required_calls().iter().copied())
            .collect();
        if calls.contains(&Call::VehicleIfNoCharger) && !charger_present {
            calls.insert(Call::Vehicle);
        }
        Self(calls)
    }

    pub fn all(charger_present: bool) -> Self {
        use strum::IntoEnumIterator;
        let graphs: Vec<Graph> = Graph::iter().collect();
        Self::for_graphs(&graphs, charger_present)
    }

    pub fn contains(&self, call: Call) -> bool {
        self.0.contains(&call)
    }
}
