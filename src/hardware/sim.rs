use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Timelike, Utc};
use rand::Rng;
use std::f64::consts::PI;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ChargerManager, CloudApi, LocalGateway, ReverseGeocoder};
use crate::daily::local_midnight;
use crate::domain::{
    Aggregates, BackupEvent, ChargeSample, ChargeState, ChargerStatus, ChargingState, DriveState, EnergyCounters,
    EnergyDay, EnergyHistory, GridStatus, LinkState, Location, MeterReading, PowerSample, SelfConsumptionDay,
    SelfConsumptionHistory, VehicleId, VehicleIdentity, VehicleTelemetry,
};
use crate::error::{SourceError, SourceResult};
use crate::power_flow::{attribute_flows, MeterSnapshot, Sink, Source};

const SIM_VEHICLE_ID: VehicleId = 1;
const SIM_VIN: &str = "5YJ3E7EB0SIM00001";
const SAMPLE_STEP_MINUTES: i64 = 5;

/// Shape of the simulated site
#[derive(Debug, Clone, Copy)]
pub struct SiteProfile {
    pub solar_peak_w: f64,
    pub house_base_w: f64,
    pub battery_capacity_wh: f64,
    pub battery_max_w: f64,
    /// Off-peak car charging runs from midnight until this hour
    pub car_charge_until_hour: f64,
    pub car_charge_w: f64,
    /// Error on the site meter, uniformly within +/- this
    pub grid_meter_error_w: f64,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            solar_peak_w: 6000.0,
            house_base_w: 450.0,
            battery_capacity_wh: 13_500.0,
            battery_max_w: 5000.0,
            car_charge_until_hour: 4.0,
            car_charge_w: 7200.0,
            grid_meter_error_w: 15.0,
        }
    }
}

/// Instantaneous site state (W, positive = supplying for sources)
#[derive(Debug, Clone, Copy, PartialEq)]
struct SiteSample {
    solar: f64,
    house: f64,
    car: f64,
    battery: f64,
    grid: f64,
}

impl SiteSample {
    fn load(&self) -> f64 {
        self.house + self.car
    }

    fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot::new(self.solar, self.battery, self.grid, self.load())
    }
}

fn hour_of_day(t: DateTime<Local>) -> f64 {
    t.hour() as f64 + t.minute() as f64 / 60.0 + t.second() as f64 / 3600.0
}

impl SiteProfile {
    fn sample(&self, hour: f64, battery_soc: f64) -> SiteSample {
        let solar = if (6.0..18.0).contains(&hour) {
            self.solar_peak_w * (PI * (hour - 6.0) / 12.0).sin()
        } else {
            0.0
        };
        let house = self.house_base_w
            + 900.0 * (-(hour - 19.0).powi(2) / 4.0).exp()
            + 300.0 * (-(hour - 7.5).powi(2) / 2.0).exp();
        let car = if hour < self.car_charge_until_hour {
            self.car_charge_w
        } else {
            0.0
        };

        // Battery covers the house but never charges the car from storage
        let surplus = solar - house;
        let battery = if surplus >= 0.0 {
            if battery_soc < 100.0 {
                -surplus.min(self.battery_max_w)
            } else {
                0.0
            }
        } else if battery_soc > 10.0 {
            (-surplus).min(self.battery_max_w)
        } else {
            0.0
        };
        let grid = house + car - solar - battery;
        SiteSample {
            solar,
            house,
            car,
            battery,
            grid,
        }
    }

    fn vehicle_soc(&self, hour: f64) -> f64 {
        if hour < self.car_charge_until_hour {
            40.0 + 40.0 * hour / self.car_charge_until_hour
        } else {
            80.0
        }
    }
}

#[derive(Debug)]
struct LiveState {
    last_tick: DateTime<Utc>,
    battery_soc: f64,
    counters: EnergyCounters,
    last: SiteSample,
}

/// A whole site in one object: gateway, charger manager, cloud account and
/// geocoder, all driven by the same solar/load model.
#[derive(Debug)]
pub struct SimulatedSite {
    profile: SiteProfile,
    home: Location,
    account: String,
    state: RwLock<LiveState>,
}

impl SimulatedSite {
    pub fn new(profile: SiteProfile, home: Location, account: impl Into<String>) -> Self {
        let now = Utc::now();
        let last = profile.sample(hour_of_day(now.with_timezone(&Local)), 60.0);
        Self {
            profile,
            home,
            account: account.into(),
            state: RwLock::new(LiveState {
                last_tick: now,
                battery_soc: 60.0,
                counters: EnergyCounters {
                    solar_exported: 12_400_000.0,
                    grid_exported: 3_100_000.0,
                    grid_imported: 5_800_000.0,
                    battery_exported: 2_900_000.0,
                    battery_imported: 3_200_000.0,
                    load_imported: 15_000_000.0,
                },
                last,
            }),
        }
    }

    pub fn home(&self) -> Location {
        self.home
    }

    /// Integrate the model up to `now` and return the current sample
    async fn advance(&self, now: DateTime<Utc>) -> (SiteSample, EnergyCounters, f64) {
        let mut state = self.state.write().await;
        let hours = (now - state.last_tick).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let sample = self.profile.sample(hour_of_day(now.with_timezone(&Local)), state.battery_soc);

        let c = &mut state.counters;
        c.solar_exported += sample.solar * hours;
        c.grid_imported += sample.grid.max(0.0) * hours;
        c.grid_exported += (-sample.grid).max(0.0) * hours;
        c.battery_exported += sample.battery.max(0.0) * hours;
        c.battery_imported += (-sample.battery).max(0.0) * hours;
        c.load_imported += sample.load() * hours;

        let soc_delta = -sample.battery * hours / self.profile.battery_capacity_wh * 100.0;
        state.battery_soc = (state.battery_soc + soc_delta).clamp(0.0, 100.0);
        state.last_tick = now;
        state.last = sample;
        (sample, state.counters, state.battery_soc)
    }

    /// Five-minute samples of the model from `from` up to `until`
    fn samples(&self, from: DateTime<Local>, until: DateTime<Local>) -> Vec<(DateTime<Local>, SiteSample)> {
        let mut out = Vec::new();
        let mut t = from;
        while t <= until {
            out.push((t, self.profile.sample(hour_of_day(t), 50.0)));
            t += Duration::minutes(SAMPLE_STEP_MINUTES);
        }
        out
    }

    fn energy_day(&self, from: DateTime<Local>, until: DateTime<Local>) -> EnergyDay {
        let mut day = EnergyDay::default();
        let step_hours = SAMPLE_STEP_MINUTES as f64 / 60.0;
        for (_, sample) in self.samples(from, until) {
            let Some(flows) = attribute_flows(Some(&sample.snapshot()), sample.car.round() as i64) else {
                continue;
            };
            let wh = |source, sink| flows.edge(source, sink) as f64 * step_hours;
            let consumer = |source| wh(source, Sink::House) + wh(source, Sink::Car);
            day.solar_energy_exported += flows.source_total(Source::Solar) as f64 * step_hours;
            day.grid_energy_imported += flows.source_total(Source::Grid) as f64 * step_hours;
            day.grid_energy_exported_from_solar += wh(Source::Solar, Sink::Grid);
            day.grid_energy_exported_from_battery += wh(Source::Battery, Sink::Grid);
            day.battery_energy_exported += flows.source_total(Source::Battery) as f64 * step_hours;
            day.battery_energy_imported_from_grid += wh(Source::Grid, Sink::Battery);
            day.battery_energy_imported_from_solar += wh(Source::Solar, Sink::Battery);
            day.consumer_energy_imported_from_grid += consumer(Source::Grid);
            day.consumer_energy_imported_from_solar += consumer(Source::Solar);
            day.consumer_energy_imported_from_battery += consumer(Source::Battery);
        }
        day
    }

    fn history_window(&self) -> (DateTime<Local>, DateTime<Local>, DateTime<Local>) {
        let now = Local::now();
        let midnight = local_midnight(now);
        (midnight - Duration::days(1), midnight, now)
    }
}

#[async_trait]
impl LocalGateway for SimulatedSite {
    async fn aggregates(&self) -> SourceResult<Aggregates> {
        let now = Utc::now();
        let (sample, counters, _) = self.advance(now).await;
        let error = self.profile.grid_meter_error_w;
        let noise = if error > 0.0 {
            rand::thread_rng().gen_range(-error..=error)
        } else {
            0.0
        };
        debug!(solar = sample.solar, load = sample.load(), "simulated aggregates");
        Ok(Aggregates {
            site: MeterReading {
                instant_power: sample.grid + noise,
                energy_exported: counters.grid_exported,
                energy_imported: counters.grid_imported,
            },
            battery: MeterReading {
                instant_power: sample.battery,
                energy_exported: counters.battery_exported,
                energy_imported: counters.battery_imported,
            },
            load: MeterReading {
                instant_power: sample.load(),
                energy_exported: 0.0,
                energy_imported: counters.load_imported,
            },
            solar: MeterReading {
                instant_power: sample.solar,
                energy_exported: counters.solar_exported,
                energy_imported: 0.0,
            },
            read_at: now,
        })
    }

    async fn state_of_energy(&self) -> SourceResult<f64> {
        let soc = self.state.read().await.battery_soc;
        // Report on the raw scale that includes the 5% reserve
        Ok(5.0 + soc * 0.95)
    }

    async fn grid_status(&self) -> SourceResult<GridStatus> {
        Ok(GridStatus::Connected)
    }
}

#[async_trait]
impl ChargerManager for SimulatedSite {
    async fn status(&self) -> SourceResult<ChargerStatus> {
        let car = self.state.read().await.last.car;
        let charging = car > 0.0;
        Ok(ChargerStatus {
            cars_charging: u32::from(charging),
            charger_load_watts: car,
            vins: if charging { vec![SIM_VIN.to_string()] } else { Vec::new() },
        })
    }

    async fn charge_history(&self) -> SourceResult<Vec<ChargeSample>> {
        let (from, _, now) = self.history_window();
        Ok(self
            .samples(from, now)
            .into_iter()
            .map(|(t, s)| ChargeSample {
                timestamp: t.fixed_offset(),
                charger_power: s.car,
            })
            .collect())
    }
}

#[async_trait]
impl CloudApi for SimulatedSite {
    fn account(&self) -> String {
        self.account.clone()
    }

    async fn energy_history(&self) -> SourceResult<EnergyHistory> {
        let (yesterday, midnight, now) = self.history_window();
        let last_of_yesterday = midnight - Duration::minutes(SAMPLE_STEP_MINUTES);
        EnergyHistory::from_days(vec![
            self.energy_day(yesterday, last_of_yesterday),
            self.energy_day(midnight, now),
        ])
    }

    async fn self_consumption(&self) -> SourceResult<SelfConsumptionHistory> {
        let history = self.energy_history().await?;
        let percent = |day: &EnergyDay| {
            let consumption = day.consumption();
            if consumption <= 0.0 {
                return SelfConsumptionDay::default();
            }
            SelfConsumptionDay {
                solar: day.consumer_energy_imported_from_solar / consumption * 100.0,
                battery: day.consumer_energy_imported_from_battery / consumption * 100.0,
            }
        };
        SelfConsumptionHistory::from_days(vec![percent(&history.yesterday), percent(&history.today)])
    }

    async fn power_history(&self) -> SourceResult<Vec<PowerSample>> {
        let (_, midnight, now) = self.history_window();
        Ok(self
            .samples(midnight, now)
            .into_iter()
            .map(|(t, s)| PowerSample {
                timestamp: t.fixed_offset(),
                solar_power: s.solar,
                battery_power: s.battery,
                grid_power: s.grid,
            })
            .collect())
    }

    async fn backup_history(&self) -> SourceResult<Vec<BackupEvent>> {
        // One short outage yesterday evening
        let (yesterday, _, _) = self.history_window();
        Ok(vec![BackupEvent {
            timestamp: (yesterday + Duration::hours(18)).fixed_offset(),
            duration: 4 * 60 * 1000,
        }])
    }

    async fn storm_watch(&self) -> SourceResult<bool> {
        Ok(false)
    }

    async fn vehicles(&self) -> SourceResult<Vec<VehicleIdentity>> {
        Ok(vec![VehicleIdentity {
            id: SIM_VEHICLE_ID,
            vin: SIM_VIN.to_string(),
            display_name: "Simulated Model 3".to_string(),
        }])
    }

    async fn vehicle_data(&self, vehicle_id: VehicleId) -> SourceResult<VehicleTelemetry> {
        if vehicle_id != SIM_VEHICLE_ID {
            return Err(SourceError::Status(404));
        }
        let hour = hour_of_day(Local::now());
        let car = self.state.read().await.last.car;
        let soc = self.profile.vehicle_soc(hour);
        let (state, time_to_full) = if car > 0.0 {
            (ChargingState::Charging, Some(self.profile.car_charge_until_hour - hour))
        } else {
            (ChargingState::Complete, None)
        };
        Ok(VehicleTelemetry {
            vehicle_id,
            state: LinkState::Online,
            sentry: Some(false),
            drive: DriveState {
                speed: None,
                units: None,
                gear: None,
                location: Some(self.home),
            },
            charge: ChargeState {
                state: Some(state),
                soc: Some(soc),
                usable_soc: Some(soc),
                limit: Some(80.0),
                power: car,
                time_to_full,
            },
            geofence: None,
        })
    }
}

#[async_trait]
impl ReverseGeocoder for SimulatedSite {
    async fn locality(&self, location: Location) -> SourceResult<Option<String>> {
        if location.is_same_as(&self.home) {
            Ok(Some("Home Town".to_string()))
        } else {
            Ok(None)
        }
    }
}
