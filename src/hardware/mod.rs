//! Data collaborators the dashboard polls
//!
//! Real HTTP clients for the gateway, charger manager and cloud API live
//! outside this crate; the binary runs against [`SimulatedSite`].

pub mod factory;
#[cfg(feature = "sim")]
pub mod sim;

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{
    Aggregates, BackupEvent, ChargeSample, ChargerStatus, EnergyHistory, GridStatus, Location, PowerSample,
    SelfConsumptionHistory, VehicleId, VehicleIdentity, VehicleTelemetry,
};
use crate::error::SourceResult;

pub use factory::{HardwareMode, SourceFactory};
#[cfg(feature = "sim")]
pub use sim::SimulatedSite;

/// Battery gateway on the local network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalGateway: Send + Sync {
    async fn aggregates(&self) -> SourceResult<Aggregates>;
    /// Raw state of energy in percent, including the reserve
    async fn state_of_energy(&self) -> SourceResult<f64>;
    async fn grid_status(&self) -> SourceResult<GridStatus>;
}

/// Wall charger manager on the local network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChargerManager: Send + Sync {
    async fn status(&self) -> SourceResult<ChargerStatus>;
    /// Today's and yesterday's charger power log, 5-minute samples
    async fn charge_history(&self) -> SourceResult<Vec<ChargeSample>>;
}

/// Authenticated cloud account for energy site and vehicle data
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn account(&self) -> String;
    async fn energy_history(&self) -> SourceResult<EnergyHistory>;
    async fn self_consumption(&self) -> SourceResult<SelfConsumptionHistory>;
    async fn power_history(&self) -> SourceResult<Vec<PowerSample>>;
    async fn backup_history(&self) -> SourceResult<Vec<BackupEvent>>;
    async fn storm_watch(&self) -> SourceResult<bool>;
    async fn vehicles(&self) -> SourceResult<Vec<VehicleIdentity>>;
    async fn vehicle_data(&self, vehicle_id: VehicleId) -> SourceResult<VehicleTelemetry>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    /// Town or suburb name for a coordinate, if any
    async fn locality(&self, location: Location) -> SourceResult<Option<String>>;
}

/// The collaborators available at this site. Anything missing is simply
/// never polled.
#[derive(Clone, Default)]
pub struct Sources {
    pub gateway: Option<Arc<dyn LocalGateway>>,
    pub charger: Option<Arc<dyn ChargerManager>>,
    pub cloud: Option<Arc<dyn CloudApi>>,
    pub geocoder: Option<Arc<dyn ReverseGeocoder>>,
}

impl Sources {
    pub fn has_charger(&self) -> bool {
        self.charger.is_some()
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }
}

impl std::fmt::Debug for Sources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sources")
            .field("gateway", &self.gateway.is_some())
            .field("charger", &self.charger.is_some())
            .field("cloud", &self.cloud.is_some())
            .field("geocoder", &self.geocoder.is_some())
            .finish()
    }
}
