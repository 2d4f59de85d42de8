use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use crate::error::{ensure_finite, SourceResult};

pub type VehicleId = u64;

const MI_KM_FACTOR: f64 = 1.609344;

/// Coordinates closer than this (degrees, per axis) count as the same place
const SAME_LOCATION_DEGREES: f64 = 0.0289;

/// Identity as listed by the cloud API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleIdentity {
    pub id: VehicleId,
    pub vin: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_same_as(&self, other: &Location) -> bool {
        (self.latitude - other.latitude).abs() < SAME_LOCATION_DEGREES
            && (self.longitude - other.longitude).abs() < SAME_LOCATION_DEGREES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gear {
    #[serde(rename = "D")]
    Drive,
    #[serde(rename = "R")]
    Reverse,
    #[serde(rename = "N")]
    Neutral,
    #[serde(rename = "P")]
    Park,
}

impl Gear {
    pub fn is_moving(&self) -> bool {
        matches!(self, Gear::Drive | Gear::Reverse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceUnits {
    #[serde(rename = "mi/hr")]
    Miles,
    #[serde(rename = "km/hr")]
    Kilometres,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveState {
    /// Always reported in mph by the API
    pub speed: Option<f64>,
    pub units: Option<DistanceUnits>,
    pub gear: Option<Gear>,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingState {
    Charging,
    Disconnected,
    Stopped,
    Complete,
    Starting,
    #[serde(rename = "Not Charging")]
    NotCharging,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeState {
    pub state: Option<ChargingState>,
    pub soc: Option<f64>,
    pub usable_soc: Option<f64>,
    pub limit: Option<f64>,
    /// Charger power in watts
    pub power: f64,
    /// Hours until the charge limit is reached
    pub time_to_full: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Online,
    Asleep,
    Offline,
    Cached,
    Error,
}

/// Vehicle telemetry as delivered by the cloud collaborator. When the car
/// is asleep and nothing is cached the drive and charge blocks are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleTelemetry {
    pub vehicle_id: VehicleId,
    pub state: LinkState,
    #[serde(default)]
    pub sentry: Option<bool>,
    #[serde(default)]
    pub drive: DriveState,
    #[serde(default)]
    pub charge: ChargeState,
    #[serde(default)]
    pub geofence: Option<String>,
}

impl VehicleTelemetry {
    pub fn validate(&self) -> SourceResult<()> {
        ensure_finite("charge.power", self.charge.power)?;
        if let Some(speed) = self.drive.speed {
            ensure_finite("drive.speed", speed)?;
        }
        if let Some(location) = &self.drive.location {
            ensure_finite("drive.latitude", location.latitude)?;
            ensure_finite("drive.longitude", location.longitude)?;
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.state == LinkState::Online
    }

    /// Idle enough to let the car fall asleep
    pub fn is_idle(&self) -> bool {
        self.is_online()
            && self.drive.gear.is_none()
            && !self.sentry.unwrap_or(false)
            && self.charge.power == 0.0
    }

    /// Activity that must never be deferred
    pub fn is_active(&self) -> bool {
        self.drive.gear.map_or(false, |g| g.is_moving())
            || self.sentry.unwrap_or(false)
            || self.charge.power > 0.0
    }

    /// Next poll interval for this vehicle. A car being driven is polled
    /// closer to the local cadence so location and speed stay fresh.
    pub fn poll_interval(&self, local: StdDuration, cloud: StdDuration) -> StdDuration {
        if self.is_online() && self.drive.gear == Some(Gear::Drive) {
            (local * 2 + cloud) / 3
        } else {
            cloud
        }
    }
}

/// Per-vehicle state cached for the whole session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleRecord {
    pub identity: VehicleIdentity,
    pub drive: Option<DriveState>,
    pub charge: Option<ChargeState>,
    pub geofence: Option<String>,
    pub defer_until: Option<DateTime<Utc>>,
    /// Reverse-geocoded label and the coordinates it was looked up for
    pub named_location: Option<(Location, String)>,
}

impl VehicleRecord {
    pub fn new(identity: VehicleIdentity) -> Self {
        Self {
            identity,
            drive: None,
            charge: None,
            geofence: None,
            defer_until: None,
            named_location: None,
        }
    }

    pub fn id(&self) -> VehicleId {
        self.identity.id
    }

    /// Fold inbound telemetry into the record, updating the poll deferral
    pub fn apply(&mut self, telemetry: &VehicleTelemetry, now: DateTime<Utc>, defer_for: Duration) {
        if telemetry.is_idle() {
            self.defer_until = Some(now + defer_for);
        } else if telemetry.is_active() {
            self.defer_until = None;
        }
        self.drive = Some(telemetry.drive.clone());
        self.charge = Some(telemetry.charge.clone());
        self.geofence = telemetry.geofence.clone();
    }

    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.defer_until.map_or(false, |until| now < until)
    }

    pub fn charging_state(&self) -> Option<ChargingState> {
        self.charge.as_ref().and_then(|c| c.state)
    }

    pub fn is_charging(&self) -> bool {
        self.charging_state() == Some(ChargingState::Charging)
    }

    pub fn charge_power(&self) -> f64 {
        self.charge.as_ref().map_or(0.0, |c| c.power)
    }

    pub fn soc(&self) -> Option<f64> {
        self.charge.as_ref().and_then(|c| c.soc)
    }

    pub fn location(&self) -> Option<Location> {
        self.drive.as_ref().and_then(|d| d.location)
    }

    pub fn is_at(&self, place: Option<Location>) -> bool {
        match (place, self.location()) {
            (Some(place), Some(here)) => place.is_same_as(&here),
            _ => false,
        }
    }

    pub fn is_charging_at_home(&self, home: Option<Location>) -> bool {
        self.is_charging() && self.is_at(home)
    }

    pub fn location_label(&self, home: Option<Location>) -> LocationLabel {
        let Some(here) = self.location() else {
            return LocationLabel::Unknown;
        };
        if self.is_at(home) {
            return LocationLabel::Home;
        }
        if let Some(fence) = &self.geofence {
            return LocationLabel::Geofence(fence.clone());
        }
        match &self.named_location {
            Some((at, label)) if at.is_same_as(&here) => LocationLabel::Elsewhere(label.clone()),
            _ => LocationLabel::LookupNeeded(here),
        }
    }

    /// Cache a geocoded label; `None` clears a stale label
    pub fn set_location_label(&mut self, location: Location, label: Option<String>) {
        self.named_location = label.map(|l| (location, l));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum LocationLabel {
    Home,
    Geofence(String),
    Elsewhere(String),
    LookupNeeded(Location),
    Unknown,
}

/// What the car tile should say about a vehicle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VehicleStatus {
    /// Drawing power from the home charger (this car charging, or sharing it)
    AtCharger { charging: bool, cars: u32 },
    Driving { speed: f64, units: DistanceUnits },
    Parked,
    Charging,
    NotCharging,
    Unavailable,
}

impl VehicleStatus {
    pub fn derive(record: &VehicleRecord, cars_charging: u32) -> Self {
        let Some(charge) = record.charge.as_ref() else {
            return VehicleStatus::Unavailable;
        };
        if cars_charging > 0 {
            return VehicleStatus::AtCharger {
                charging: record.is_charging(),
                cars: cars_charging,
            };
        }
        let Some(state) = charge.state else {
            return VehicleStatus::Unavailable;
        };
        let drive = record.drive.clone().unwrap_or_default();
        if drive.gear.map_or(false, |g| g.is_moving()) {
            let mph = drive.speed.unwrap_or(0.0);
            return match drive.units {
                Some(DistanceUnits::Miles) => VehicleStatus::Driving {
                    speed: mph,
                    units: DistanceUnits::Miles,
                },
                _ => VehicleStatus::Driving {
                    speed: mph * MI_KM_FACTOR,
                    units: DistanceUnits::Kilometres,
                },
            };
        }
        match state {
            ChargingState::Disconnected => VehicleStatus::Parked,
            ChargingState::Charging => VehicleStatus::Charging,
            _ => VehicleStatus::NotCharging,
        }
    }
}

/// Time to full charge, split for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChargeEta {
    pub days: u32,
    pub hours: u32,
    /// Rounded to 5 minutes
    pub minutes: u32,
}

impl ChargeEta {
    pub fn from_hours(hours_to_full: f64) -> Option<Self> {
        if hours_to_full.is_nan() || hours_to_full <= 0.0 {
            return None;
        }
        let days = (hours_to_full / 24.0).trunc();
        let mut hours = hours_to_full.trunc();
        let mut minutes = ((hours_to_full - hours) * 12.0).round() * 5.0;
        if days > 0.0 {
            hours = (hours_to_full - days * 24.0).round();
            minutes = 0.0;
        }
        Some(Self {
            days: days as u32,
            hours: hours as u32,
            minutes: minutes as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocBand {
    Normal,
    Warn,
    Critical,
}

/// Battery meter shown on the car tile
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SocMeter {
    pub soc: f64,
    pub usable: f64,
    /// Charge present but unavailable because the pack is cold
    pub locked: f64,
    pub band: SocBand,
}

impl SocMeter {
    pub fn from_charge(charge: &ChargeState) -> Option<Self> {
        let soc = charge.soc?;
        let usable = charge.usable_soc.filter(|u| *u > 0.0).unwrap_or(soc);
        let band = if soc > 99.5 || soc < 7.5 {
            SocBand::Critical
        } else if soc > 90.5 || soc < 19.5 {
            SocBand::Warn
        } else {
            SocBand::Normal
        };
        Some(Self {
            soc,
            usable,
            locked: soc - usable,
            band,
        })
    }

    pub fn is_cold(&self) -> bool {
        self.locked >= 2.0
    }
}
