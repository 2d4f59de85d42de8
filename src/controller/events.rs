use std::time::Duration;

use crate::domain::{
    Aggregates, BackupEvent, ChargeSample, ChargerStatus, EnergyHistory, GridStatus, Location, PowerSample,
    SelfConsumptionHistory, VehicleId, VehicleIdentity, VehicleTelemetry,
};

/// Everything the dashboard can be told
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Aggregates(Aggregates),
    /// Raw gateway state of energy (percent)
    StateOfEnergy(f64),
    GridStatus(GridStatus),
    ChargeStatus(ChargerStatus),
    ChargeHistory(Vec<ChargeSample>),
    EnergyHistory(EnergyHistory),
    SelfConsumption(SelfConsumptionHistory),
    PowerHistory(Vec<PowerSample>),
    BackupHistory(Vec<BackupEvent>),
    StormWatch(bool),
    VehicleList(Vec<VehicleIdentity>),
    VehicleData(VehicleTelemetry),
    LocationLabel {
        vehicle_id: VehicleId,
        location: Location,
        label: Option<String>,
    },
    AuthRequired {
        account: String,
    },
    AuthRestored {
        account: String,
    },
    /// A viewer is (or is no longer) looking at the dashboard
    Presence(bool),
}

/// Outbound data requests. `max_age` is the freshness window: a cached
/// response younger than this is replayed instead of fetching again.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Local { max_age: Duration },
    ChargeHistory { max_age: Duration },
    Energy { max_age: Duration },
    SelfConsumption { max_age: Duration },
    PowerHistory { max_age: Duration },
    StormWatch { max_age: Duration },
    VehicleList { max_age: Duration },
    VehicleData { vehicle_id: VehicleId, max_age: Duration },
    Geocode { vehicle_id: VehicleId, location: Location },
    ClearAuth { account: String },
}

impl Request {
    pub fn max_age(&self) -> Option<Duration> {
        match self {
            Request::Local { max_age }
            | Request::ChargeHistory { max_age }
            | Request::Energy { max_age }
            | Request::SelfConsumption { max_age }
            | Request::PowerHistory { max_age }
            | Request::StormWatch { max_age }
            | Request::VehicleList { max_age }
            | Request::VehicleData { max_age, .. } => Some(*max_age),
            Request::Geocode { .. } | Request::ClearAuth { .. } => None,
        }
    }

    /// Served by the cloud API rather than a device on the local network
    pub fn is_cloud(&self) -> bool {
        !matches!(
            self,
            Request::Local { .. } | Request::ChargeHistory { .. } | Request::Geocode { .. }
        )
    }
}

/// Names of the registry timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTask {
    Local,
    Cloud,
    Vehicle,
    Midnight,
}
