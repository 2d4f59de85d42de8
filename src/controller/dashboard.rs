use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::calls::{Call, EnabledCalls};
use super::events::{Event, Request, TimerTask};
use super::scheduler::{FiredTimer, JitterPolicy, TimerRegistry};
use super::vehicle_focus::{charging_candidates, FocusChange, VehicleFocus};
use crate::config::Config;
use crate::daily::{local_midnight, CarEnergy, DayAccumulator, DayTransition, EnergyTotals, SelfConsumptionSummary};
use crate::domain::{
    usable_state_of_energy, Aggregates, BackupEvent, ChargeEta, ChargeSample, ChargerStatus, EnergyHistory,
    GridStatus, Location, LocationLabel, PowerSample, SelfConsumptionHistory, SocMeter, VehicleId,
    VehicleIdentity, VehicleRecord, VehicleStatus, VehicleTelemetry,
};
use crate::hardware::Sources;
use crate::history::{build_series, outage_spans, HistorySeries, OutageSpan};
use crate::power_flow::{
    AttributionConstraints, BatteryActivity, FlowAttributor, FlowGraph, GridDirection, Sink,
};

/// Requests go out slightly younger than the poll interval so the response
/// cached by the previous tick counts as stale.
const MAX_AGE_SLACK: Duration = Duration::from_millis(500);
/// Household load change that may mean a car started or stopped charging
const LOAD_SWING_W: f64 = 1250.0;
const VEHICLE_REFRESH: Duration = Duration::from_secs(30);
const URGENT_VEHICLE_REFRESH: Duration = Duration::from_secs(5);
/// Acceptable ratio of charger-attributed power to the car's own report
const CHARGE_AGREEMENT: RangeInclusive<f64> = 0.75..=1.25;
const DEFER_SLACK: Duration = Duration::from_secs(1);
const AFTER_MIDNIGHT: Duration = Duration::from_secs(5);

fn max_age(interval: Duration) -> Duration {
    interval.saturating_sub(MAX_AGE_SLACK)
}

#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub local_interval: Duration,
    pub cloud_interval: Duration,
    pub vehicle_defer: chrono::Duration,
    pub overdue_grace: Duration,
    pub jitter: JitterPolicy,
    pub home: Option<Location>,
    pub charger_present: bool,
    /// Cloud account, if one is configured
    pub account: Option<String>,
    pub calls: EnabledCalls,
    pub constraints: AttributionConstraints,
}

impl DashboardSettings {
    pub fn new(config: &Config, sources: &Sources) -> Self {
        let charger_present = sources.has_charger();
        Self {
            local_interval: config.polling.local_interval(),
            cloud_interval: config.polling.cloud_interval(),
            vehicle_defer: config.polling.vehicle_defer(),
            overdue_grace: config.polling.overdue_grace(),
            jitter: config.polling.jitter(),
            home: config.site.home_location(),
            charger_present,
            account: sources.cloud.as_ref().map(|c| c.account()),
            calls: EnabledCalls::for_graphs(&config.dashboard.graphs, charger_present),
            constraints: config.flow.constraints(),
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            local_interval: Duration::from_secs(10),
            cloud_interval: Duration::from_secs(300),
            vehicle_defer: chrono::Duration::minutes(30),
            overdue_grace: Duration::from_secs(5),
            jitter: JitterPolicy::default(),
            home: None,
            charger_present: true,
            account: None,
            calls: EnabledCalls::all(true),
            constraints: AttributionConstraints::default(),
        }
    }
}

/// The focused vehicle as the car tile shows it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleView {
    pub id: VehicleId,
    pub name: String,
    pub status: VehicleStatus,
    pub location: LocationLabel,
    pub soc: Option<SocMeter>,
    pub eta: Option<ChargeEta>,
}

/// Everything the presentation layer needs for one render
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub updated_at: Option<DateTime<Utc>>,
    pub flows: Option<FlowGraph>,
    pub grid_direction: Option<GridDirection>,
    pub battery: Option<BatteryActivity>,
    /// Usable state of energy (percent)
    pub state_of_energy: Option<f64>,
    pub grid_status: GridStatus,
    pub grid_outage_start: Option<DateTime<Utc>>,
    pub storm_watch: bool,
    pub energy: EnergyTotals,
    pub self_consumption: Option<SelfConsumptionSummary>,
    pub history: Option<HistorySeries>,
    pub outages: Vec<OutageSpan>,
    pub vehicle: Option<VehicleView>,
    pub vehicles_shown: Vec<VehicleId>,
    pub cars_charging: u32,
    pub needs_auth: Vec<String>,
    pub suspended: bool,
}

/// Receives a fresh view after every state change
pub trait Presenter: Send + Sync {
    fn present(&self, view: DashboardView);
}

/// Publishes views on a watch channel; readers always see the latest one
pub struct WatchPresenter {
    tx: watch::Sender<Arc<DashboardView>>,
}

impl WatchPresenter {
    pub fn channel() -> (Self, watch::Receiver<Arc<DashboardView>>) {
        let (tx, rx) = watch::channel(Arc::new(DashboardView::default()));
        (Self { tx }, rx)
    }
}

impl Presenter for WatchPresenter {
    fn present(&self, view: DashboardView) {
        self.tx.send_replace(Arc::new(view));
    }
}

/// All dashboard state and the rules that react to incoming data
///
/// Every entry point takes the current time and returns the requests to
/// dispatch. Timers are armed on the owned [`TimerRegistry`]; their
/// deliveries come back through [`Dashboard::on_fired`].
pub struct Dashboard {
    settings: DashboardSettings,
    attributor: FlowAttributor,
    timers: TimerRegistry<TimerTask>,
    presenter: Box<dyn Presenter>,

    aggregates: Option<Aggregates>,
    car_load_w: i64,
    flows: Option<FlowGraph>,
    day: DayAccumulator,
    /// Energy history that arrived before any counters to backfill from
    energy_pending: Option<EnergyHistory>,
    state_of_energy: Option<f64>,
    grid_status: GridStatus,
    grid_outage_start: Option<DateTime<Utc>>,
    storm_watch: bool,
    self_consumption: Option<SelfConsumptionHistory>,
    power_history: Vec<PowerSample>,
    charge_history: Vec<ChargeSample>,
    backup_events: Vec<BackupEvent>,
    history: Option<HistorySeries>,
    charger: Option<ChargerStatus>,
    vehicles: Vec<VehicleRecord>,
    focus: VehicleFocus,
    last_geocode: Option<(VehicleId, Location)>,
    needs_auth: BTreeSet<String>,
}

impl Dashboard {
    pub fn new(
        settings: DashboardSettings,
        presenter: Box<dyn Presenter>,
        fired_tx: mpsc::UnboundedSender<FiredTimer<TimerTask>>,
    ) -> Self {
        let timers = TimerRegistry::new(settings.jitter, settings.overdue_grace, fired_tx);
        Self {
            attributor: FlowAttributor::new(settings.constraints),
            settings,
            timers,
            presenter,
            aggregates: None,
            car_load_w: 0,
            flows: None,
            day: DayAccumulator::new(),
            energy_pending: None,
            state_of_energy: None,
            grid_status: GridStatus::Connected,
            grid_outage_start: None,
            storm_watch: false,
            self_consumption: None,
            power_history: Vec::new(),
            charge_history: Vec::new(),
            backup_events: Vec::new(),
            history: None,
            charger: None,
            vehicles: Vec::new(),
            focus: VehicleFocus::new(),
            last_geocode: None,
            needs_auth: BTreeSet::new(),
        }
    }

    pub fn flows(&self) -> Option<&FlowGraph> {
        self.flows.as_ref()
    }

    pub fn car_load_w(&self) -> i64 {
        self.car_load_w
    }

    pub fn focus(&self) -> &VehicleFocus {
        &self.focus
    }

    pub fn day(&self) -> &DayAccumulator {
        &self.day
    }

    pub fn is_suspended(&self) -> bool {
        self.timers.is_suspended()
    }

    pub fn is_timer_pending(&self, task: TimerTask) -> bool {
        self.timers.is_pending(task)
    }

    /// Kick off polling: clear any stale auth state, request everything the
    /// configured tiles need and arm the local and midnight timers.
    pub fn start(&mut self, now: DateTime<Utc>) -> Vec<Request> {
        let mut out = Vec::new();
        if let Some(account) = self.settings.account.clone() {
            out.push(Request::ClearAuth { account });
            self.update_all_cloud(&mut out);
            self.schedule_cloud();
            if self.enabled(Call::Vehicle) {
                out.push(Request::VehicleList {
                    max_age: max_age(self.settings.cloud_interval),
                });
            }
        }
        self.update_local(&mut out);
        self.advance_day(now, &mut out);
        self.schedule_midnight(now);
        info!(requests = out.len(), charger = self.settings.charger_present, "dashboard started");
        self.publish(now);
        out
    }

    pub fn handle_at(&mut self, event: Event, now: DateTime<Utc>) -> Vec<Request> {
        let mut out = Vec::new();
        match event {
            Event::Aggregates(aggregates) => self.on_aggregates(aggregates, now, &mut out),
            Event::StateOfEnergy(raw) => self.state_of_energy = Some(usable_state_of_energy(raw)),
            Event::GridStatus(status) => {
                if !status.is_connected() && self.grid_outage_start.is_none() {
                    warn!(%status, "grid outage");
                    self.grid_outage_start = Some(now);
                }
                self.grid_status = status;
            }
            Event::ChargeStatus(status) => self.on_charge_status(status, now, &mut out),
            Event::ChargeHistory(samples) => {
                self.charge_history = samples;
                self.rebuild_history(now);
            }
            Event::EnergyHistory(history) => {
                self.energy_pending = Some(history);
                self.generate_day_start();
            }
            Event::SelfConsumption(history) => {
                self.self_consumption = Some(history);
                self.schedule_cloud();
            }
            Event::PowerHistory(samples) => {
                self.power_history = samples;
                self.rebuild_history(now);
                self.schedule_cloud();
            }
            Event::BackupHistory(events) => {
                let midnight = local_midnight(now.with_timezone(&Local)).fixed_offset();
                self.backup_events = events.into_iter().filter(|e| e.timestamp > midnight).collect();
                if self.grid_status.is_connected() {
                    self.grid_outage_start = None;
                }
            }
            Event::StormWatch(active) => self.storm_watch = active,
            Event::VehicleList(list) => self.on_vehicle_list(list, now, &mut out),
            Event::VehicleData(telemetry) => self.on_vehicle_data(telemetry, now, &mut out),
            Event::LocationLabel {
                vehicle_id,
                location,
                label,
            } => {
                if let Some(record) = self.vehicle_mut(vehicle_id) {
                    record.set_location_label(location, label);
                }
            }
            Event::AuthRequired { account } => {
                self.needs_auth.insert(account);
            }
            Event::AuthRestored { account } => {
                self.needs_auth.remove(&account);
                self.retry_backfill(&mut out);
            }
            Event::Presence(true) => {
                debug!("viewer present, resuming polling");
                self.timers.resume();
            }
            Event::Presence(false) => {
                debug!("no viewer, suspending polling");
                self.timers.suspend();
            }
        }
        self.publish(now);
        out
    }

    /// Act on a timer delivery, ignoring ones superseded since they were armed
    pub fn on_fired(&mut self, fired: FiredTimer<TimerTask>, now: DateTime<Utc>) -> Vec<Request> {
        if !self.timers.claim(&fired) {
            return Vec::new();
        }
        self.on_timer_at(fired.name, now)
    }

    pub fn on_timer_at(&mut self, task: TimerTask, now: DateTime<Utc>) -> Vec<Request> {
        let mut out = Vec::new();
        self.run_task(task, now, &mut out);
        self.publish(now);
        out
    }

    /// Liveness sweep: run anything overdue, e.g. after a resume
    pub fn on_sweep_at(&mut self, now: DateTime<Utc>) -> Vec<Request> {
        let mut out = Vec::new();
        self.run_overdue(now, &mut out);
        if !out.is_empty() {
            self.publish(now);
        }
        out
    }

    /// Rotate the car tile to the next vehicle of interest
    pub fn on_rotate_at(&mut self, now: DateTime<Utc>) -> Vec<Request> {
        let mut out = Vec::new();
        let change = self.focus.tick();
        self.after_focus_change(change, now, &mut out);
        self.publish(now);
        out
    }

    fn enabled(&self, call: Call) -> bool {
        self.settings.calls.contains(call)
    }

    fn run_task(&mut self, task: TimerTask, now: DateTime<Utc>, out: &mut Vec<Request>) {
        debug!(?task, "timer");
        match task {
            TimerTask::Local => self.update_local(out),
            TimerTask::Cloud => {
                self.update_all_cloud(out);
                self.retry_backfill(out);
                self.schedule_cloud();
            }
            TimerTask::Vehicle => self.update_vehicle_data(None, now, out),
            TimerTask::Midnight => {
                self.advance_day(now, out);
                self.schedule_midnight(now);
            }
        }
    }

    fn run_overdue(&mut self, now: DateTime<Utc>, out: &mut Vec<Request>) {
        for task in self.timers.check_timeouts() {
            info!(?task, "running overdue timer");
            self.run_task(task, now, out);
        }
    }

    fn update_local(&mut self, out: &mut Vec<Request>) {
        if !self.enabled(Call::Local) {
            return;
        }
        out.push(Request::Local {
            max_age: max_age(self.settings.local_interval),
        });
        self.timers.schedule(TimerTask::Local, self.settings.local_interval, false);
    }

    fn update_energy(&mut self, window: Duration, out: &mut Vec<Request>) {
        if self.enabled(Call::Energy) && self.settings.account.is_some() {
            out.push(Request::Energy { max_age: window });
        }
    }

    fn update_power_history(&mut self, out: &mut Vec<Request>) {
        if !self.enabled(Call::Power) {
            return;
        }
        out.push(Request::PowerHistory {
            max_age: max_age(self.settings.cloud_interval),
        });
        if self.settings.charger_present {
            out.push(Request::ChargeHistory {
                max_age: max_age(self.settings.local_interval),
            });
        }
    }

    fn update_all_cloud(&mut self, out: &mut Vec<Request>) {
        if self.settings.account.is_none() {
            return;
        }
        let window = max_age(self.settings.cloud_interval);
        if self.enabled(Call::SelfConsumption) {
            out.push(Request::SelfConsumption { max_age: window });
        }
        self.update_power_history(out);
        if self.enabled(Call::Storm) {
            out.push(Request::StormWatch { max_age: window });
        }
    }

    fn schedule_cloud(&mut self) {
        self.timers.schedule(TimerTask::Cloud, self.settings.cloud_interval, false);
    }

    fn schedule_midnight(&mut self, now: DateTime<Utc>) {
        let local = now.with_timezone(&Local);
        let next = local_midnight(local) + chrono::Duration::days(1);
        let wait = (next - local).to_std().unwrap_or(Duration::ZERO) + AFTER_MIDNIGHT;
        self.timers.schedule(TimerTask::Midnight, wait, true);
    }

    /// Request telemetry for every vehicle. With no explicit `timeout` the
    /// cloud interval applies and sleeping vehicles are left alone until
    /// their deferral runs out.
    fn update_vehicle_data(&mut self, timeout: Option<Duration>, now: DateTime<Utc>, out: &mut Vec<Request>) {
        if !self.enabled(Call::Vehicle) {
            return;
        }
        let (window, allow_defer) = match timeout {
            Some(t) => (t, false),
            None => (self.settings.cloud_interval, true),
        };
        for vehicle in &self.vehicles {
            if allow_defer && vehicle.is_deferred(now) {
                if let Some(until) = vehicle.defer_until {
                    let wait = (until - now).to_std().unwrap_or(Duration::ZERO) + DEFER_SLACK;
                    debug!(vehicle_id = vehicle.id(), ?wait, "vehicle polling deferred");
                    self.timers.schedule(TimerTask::Vehicle, wait, true);
                }
                continue;
            }
            out.push(Request::VehicleData {
                vehicle_id: vehicle.id(),
                max_age: max_age(window),
            });
        }
    }

    fn advance_day(&mut self, now: DateTime<Utc>, out: &mut Vec<Request>) {
        let counters = self.aggregates.as_ref().map(Aggregates::counters);
        match self.day.observe(now.with_timezone(&Local), counters.as_ref()) {
            DayTransition::SameDay => self.retry_backfill(out),
            DayTransition::Midnight => {
                if self.enabled(Call::SelfConsumption) && self.settings.account.is_some() {
                    out.push(Request::SelfConsumption { max_age: Duration::ZERO });
                }
            }
            DayTransition::MissedMidnight => self.update_energy(Duration::ZERO, out),
        }
    }

    /// Keep asking for the energy history until a day start is held
    fn retry_backfill(&mut self, out: &mut Vec<Request>) {
        if self.day.needs_backfill() && self.energy_pending.is_none() {
            self.update_energy(max_age(self.settings.cloud_interval), out);
        }
    }

    fn generate_day_start(&mut self) {
        let Some(counters) = self.aggregates.as_ref().map(Aggregates::counters) else {
            return;
        };
        if let Some(history) = self.energy_pending.take() {
            if self.day.backfill(&history, &counters) {
                info!("day start rebuilt from energy history");
            }
        }
    }

    fn recompute_flows(&mut self) {
        let snapshot = self.aggregates.as_ref().map(Aggregates::snapshot);
        self.flows = self.attributor.attribute(snapshot.as_ref(), self.car_load_w);
    }

    fn load_power(&self) -> f64 {
        self.aggregates.as_ref().map_or(0.0, Aggregates::load_power)
    }

    fn on_aggregates(&mut self, aggregates: Aggregates, now: DateTime<Utc>, out: &mut Vec<Request>) {
        self.timers.schedule(TimerTask::Local, self.settings.local_interval, false);

        let load = aggregates.load_power();
        if !self.settings.charger_present {
            let swing = self
                .aggregates
                .as_ref()
                .map_or(false, |previous| (previous.load_power() - load).abs() > LOAD_SWING_W);
            if swing || load < self.car_load_w as f64 {
                self.update_vehicle_data(Some(self.settings.local_interval), now, out);
            }
        }

        self.aggregates = Some(aggregates);
        if self.car_load_w as f64 <= load {
            self.recompute_flows();
        }

        // A rollover clears the day start, so it must precede the backfill
        self.advance_day(now, out);
        self.generate_day_start();
        self.run_overdue(now, out);
    }

    fn on_charge_status(&mut self, status: ChargerStatus, now: DateTime<Utc>, out: &mut Vec<Request>) {
        let charger_w = status.load_w();
        if charger_w != self.car_load_w {
            self.car_load_w = charger_w;
            if charger_w as f64 <= self.load_power() {
                self.recompute_flows();
            }
        }

        if status.cars_charging > 0 {
            let candidates = charging_candidates(&self.vehicles, &status.vins);
            if self.charge_disagrees(&candidates, status.cars_charging) {
                self.update_vehicle_data(Some(VEHICLE_REFRESH), now, out);
            }
            let cars = status.cars_charging;
            self.charger = Some(status);
            self.focus_on(candidates, cars, now, out);
        } else {
            self.charger = Some(status);
            let all = self.vehicles.iter().map(VehicleRecord::id).collect();
            self.focus_on(all, 0, now, out);
        }
    }

    /// Whether any candidate's reported charge power is out of line with the
    /// charger-attributed car power spread over `cars_charging` cars
    fn charge_disagrees(&self, candidates: &[VehicleId], cars_charging: u32) -> bool {
        let car_sink = self.flows.as_ref().map_or(0, |f| f.sink_total(Sink::Car)) as f64;
        candidates.iter().filter_map(|id| self.vehicle(*id)).any(|vehicle| {
            let ratio = match vehicle.charge.as_ref() {
                None => 1.0,
                Some(c) if c.power <= 0.0 => 2.0,
                Some(c) => car_sink / (c.power * cars_charging as f64),
            };
            let disagrees = !CHARGE_AGREEMENT.contains(&ratio);
            if disagrees {
                debug!(vehicle_id = vehicle.id(), ratio, "charger and vehicle disagree on charge power");
            }
            disagrees
        })
    }

    fn focus_on(&mut self, candidates: Vec<VehicleId>, num_charging: u32, now: DateTime<Utc>, out: &mut Vec<Request>) {
        let home = self.settings.home;
        let at_home = self.vehicles.iter().filter(|v| v.is_charging_at_home(home)).count() as u32;
        if num_charging != self.focus.num_charging() || at_home != num_charging {
            self.update_vehicle_data(Some(VEHICLE_REFRESH), now, out);
        }
        if let Some(change) = self.focus.update(candidates, num_charging) {
            self.after_focus_change(change, now, out);
        }
    }

    fn after_focus_change(&mut self, change: FocusChange, now: DateTime<Utc>, out: &mut Vec<Request>) {
        match change {
            FocusChange::RefreshNeeded => self.update_vehicle_data(Some(VEHICLE_REFRESH), now, out),
            FocusChange::Moved { to, .. } | FocusChange::Kept(to) => self.inspect_focused(to, now, out),
            FocusChange::Cleared => {}
        }
    }

    /// Follow-up requests for the vehicle now on screen
    fn inspect_focused(&mut self, id: VehicleId, now: DateTime<Utc>, out: &mut Vec<Request>) {
        let Some(record) = self.vehicle(id) else {
            return;
        };
        let unavailable = VehicleStatus::derive(record, self.focus.num_charging()) == VehicleStatus::Unavailable;
        let lookup = match record.location_label(self.settings.home) {
            LocationLabel::LookupNeeded(location) => Some(location),
            _ => None,
        };

        if unavailable {
            self.update_vehicle_data(Some(VEHICLE_REFRESH), now, out);
        }
        if let Some(location) = lookup {
            let already = self
                .last_geocode
                .map_or(false, |(v, at)| v == id && at.is_same_as(&location));
            if !already {
                self.last_geocode = Some((id, location));
                out.push(Request::Geocode {
                    vehicle_id: id,
                    location,
                });
            }
        }
    }

    fn on_vehicle_list(&mut self, list: Vec<VehicleIdentity>, now: DateTime<Utc>, out: &mut Vec<Request>) {
        let previous = std::mem::take(&mut self.vehicles);
        self.vehicles = list
            .into_iter()
            .map(|identity| match previous.iter().find(|v| v.id() == identity.id) {
                Some(existing) => VehicleRecord {
                    identity,
                    ..existing.clone()
                },
                None => VehicleRecord::new(identity),
            })
            .collect();
        info!(vehicles = self.vehicles.len(), "vehicle list updated");
        self.update_vehicle_data(None, now, out);
        let all = self.vehicles.iter().map(VehicleRecord::id).collect();
        self.focus_on(all, 0, now, out);
    }

    fn on_vehicle_data(&mut self, telemetry: VehicleTelemetry, now: DateTime<Utc>, out: &mut Vec<Request>) {
        let poll = telemetry.poll_interval(self.settings.local_interval, self.settings.cloud_interval);
        let defer_for = self.settings.vehicle_defer;
        let Some(record) = self.vehicle_mut(telemetry.vehicle_id) else {
            debug!(vehicle_id = telemetry.vehicle_id, "telemetry for unknown vehicle");
            return;
        };
        record.apply(&telemetry, now, defer_for);
        self.timers.schedule(TimerTask::Vehicle, poll, true);

        self.infer_car_load(now, out);

        if self.focus.focused().is_none() {
            if let Some(change) = self.focus.ensure_focus() {
                self.after_focus_change(change, now, out);
            }
        } else if self.focus.focused() == Some(telemetry.vehicle_id) {
            self.inspect_focused(telemetry.vehicle_id, now, out);
        }
    }

    /// Without a charger manager the car load is whatever the vehicles
    /// charging at home report.
    fn infer_car_load(&mut self, now: DateTime<Utc>, out: &mut Vec<Request>) {
        if self.settings.charger_present {
            return;
        }
        let home = self.settings.home;
        let charging: Vec<&VehicleRecord> = self.vehicles.iter().filter(|v| v.is_charging_at_home(home)).collect();
        let num_charging = charging.len() as u32;
        let inferred = charging.iter().map(|v| v.charge_power()).sum::<f64>().round() as i64;
        let candidates: Vec<VehicleId> = if num_charging > 0 {
            charging.iter().map(|v| v.id()).collect()
        } else {
            self.vehicles.iter().map(VehicleRecord::id).collect()
        };

        if inferred != self.car_load_w {
            self.car_load_w = inferred;
            if inferred as f64 <= self.load_power() {
                self.recompute_flows();
            } else {
                warn!(inferred, load = self.load_power(), "inferred car load exceeds household load");
                self.update_vehicle_data(Some(URGENT_VEHICLE_REFRESH), now, out);
            }
        }
        self.focus_on(candidates, num_charging, now, out);
    }

    fn rebuild_history(&mut self, now: DateTime<Utc>) {
        if self.power_history.is_empty() {
            self.history = None;
            return;
        }
        let midnight = local_midnight(now.with_timezone(&Local));
        self.history = Some(build_series(&self.power_history, &self.charge_history, &midnight));
    }

    fn vehicle(&self, id: VehicleId) -> Option<&VehicleRecord> {
        self.vehicles.iter().find(|v| v.id() == id)
    }

    fn vehicle_mut(&mut self, id: VehicleId) -> Option<&mut VehicleRecord> {
        self.vehicles.iter_mut().find(|v| v.id() == id)
    }

    pub fn view(&self, now: DateTime<Utc>) -> DashboardView {
        let midnight = local_midnight(now.with_timezone(&Local));
        let today = self.aggregates.as_ref().and_then(|a| self.day.today(&a.counters()));
        let car = CarEnergy::from_samples(&self.charge_history, &midnight);
        let energy = EnergyTotals::compute(today, self.day.yesterday().copied(), car, self.settings.charger_present);

        let vehicle = self.focus.focused().and_then(|id| self.vehicle(id)).map(|record| VehicleView {
            id: record.id(),
            name: record.identity.display_name.clone(),
            status: VehicleStatus::derive(record, self.focus.num_charging()),
            location: record.location_label(self.settings.home),
            soc: record.charge.as_ref().and_then(SocMeter::from_charge),
            eta: record
                .charge
                .as_ref()
                .and_then(|c| c.time_to_full)
                .and_then(ChargeEta::from_hours),
        });

        let battery_floor = self.attributor.constraints().battery_noise_floor_w;
        DashboardView {
            updated_at: Some(now),
            grid_direction: self.flows.as_ref().map(FlowGraph::grid_direction),
            battery: self
                .aggregates
                .as_ref()
                .map(|a| BatteryActivity::from_power(a.battery.instant_power, battery_floor)),
            flows: self.flows.clone(),
            state_of_energy: self.state_of_energy,
            grid_status: self.grid_status,
            grid_outage_start: self.grid_outage_start,
            storm_watch: self.storm_watch,
            energy,
            self_consumption: self.self_consumption.as_ref().map(SelfConsumptionSummary::from),
            history: self.history.clone(),
            outages: outage_spans(&self.backup_events, self.grid_outage_start, now, &midnight),
            vehicle,
            vehicles_shown: self.focus.displayed().to_vec(),
            cars_charging: self.charger.as_ref().map_or(self.focus.num_charging(), |c| c.cars_charging),
            needs_auth: self.needs_auth.iter().cloned().collect(),
            suspended: self.timers.is_suspended(),
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        self.presenter.present(self.view(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChargeState, ChargingState, DriveState, LinkState, MeterReading};
    use crate::power_flow::Source;
    use chrono::TimeZone;

    const CAR: VehicleId = 7;

    struct Harness {
        dashboard: Dashboard,
        view: watch::Receiver<Arc<DashboardView>>,
        _fired: mpsc::UnboundedReceiver<FiredTimer<TimerTask>>,
    }

    fn harness(settings: DashboardSettings) -> Harness {
        let (presenter, view) = WatchPresenter::channel();
        let (fired_tx, fired) = mpsc::unbounded_channel();
        Harness {
            dashboard: Dashboard::new(settings, Box::new(presenter), fired_tx),
            view,
            _fired: fired,
        }
    }

    fn settings() -> DashboardSettings {
        DashboardSettings {
            account: Some("me@example.com".into()),
            jitter: JitterPolicy {
                spread: Duration::ZERO,
                floor: Duration::ZERO,
            },
            home: Some(Location::new(59.33, 18.06)),
            ..DashboardSettings::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 7, 0).unwrap()
    }

    fn meter(power: f64, exported: f64, imported: f64) -> MeterReading {
        MeterReading {
            instant_power: power,
            energy_exported: exported,
            energy_imported: imported,
        }
    }

    fn aggregates(solar: f64, battery: f64, grid: f64, load: f64) -> Aggregates {
        Aggregates {
            site: meter(grid, 1000.0, 2000.0),
            battery: meter(battery, 500.0, 600.0),
            load: meter(load, 0.0, 9000.0),
            solar: meter(solar, 7000.0, 0.0),
            read_at: t0(),
        }
    }

    fn charging_car(power: f64, at: Location) -> VehicleTelemetry {
        VehicleTelemetry {
            vehicle_id: CAR,
            state: LinkState::Online,
            sentry: Some(false),
            drive: DriveState {
                location: Some(at),
                ..Default::default()
            },
            charge: ChargeState {
                state: Some(ChargingState::Charging),
                soc: Some(55.0),
                power,
                ..Default::default()
            },
            geofence: None,
        }
    }

    fn identity(id: VehicleId) -> VehicleIdentity {
        VehicleIdentity {
            id,
            vin: format!("VIN{id}"),
            display_name: format!("Car {id}"),
        }
    }

    fn vehicle_requests(requests: &[Request]) -> Vec<Duration> {
        requests
            .iter()
            .filter_map(|r| match r {
                Request::VehicleData { max_age, .. } => Some(*max_age),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requests_enabled_calls() {
        let mut h = harness(settings());
        let requests = h.dashboard.start(t0());

        assert_eq!(
            requests[0],
            Request::ClearAuth {
                account: "me@example.com".into()
            }
        );
        assert!(requests.contains(&Request::Local {
            max_age: Duration::from_millis(9500)
        }));
        assert!(requests.contains(&Request::Energy { max_age: Duration::ZERO }));
        assert!(requests.contains(&Request::VehicleList {
            max_age: Duration::from_millis(299_500)
        }));
        assert!(requests.iter().any(|r| matches!(r, Request::PowerHistory { .. })));
        assert!(requests.iter().any(|r| matches!(r, Request::ChargeHistory { .. })));
        assert!(h.dashboard.is_timer_pending(TimerTask::Local));
        assert!(h.dashboard.is_timer_pending(TimerTask::Midnight));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_line_only_polls_power_history() {
        let mut h = harness(DashboardSettings {
            calls: EnabledCalls::for_graphs(&[crate::controller::calls::Graph::PowerLine], true),
            ..settings()
        });
        let requests = h.dashboard.start(t0());
        assert!(requests.iter().all(|r| matches!(
            r,
            Request::ClearAuth { .. } | Request::PowerHistory { .. } | Request::ChargeHistory { .. }
        )));
        assert!(!h.dashboard.is_timer_pending(TimerTask::Local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregates_publish_flows() {
        let mut h = harness(settings());
        h.dashboard.start(t0());
        h.dashboard
            .handle_at(Event::Aggregates(aggregates(3000.0, -1000.0, -500.0, 1500.0)), t0());

        let view = h.view.borrow().clone();
        let flows = view.flows.as_ref().unwrap();
        assert_eq!(flows.source_total(Source::Solar), 3000);
        assert_eq!(flows.sink_total(Sink::Battery), 1000);
        assert_eq!(flows.sink_total(Sink::House), 1500);
        assert_eq!(flows.sink_total(Sink::Grid), 500);
        assert_eq!(view.grid_direction, Some(GridDirection::Exporting));
        assert_eq!(view.battery, Some(BatteryActivity::Charging));
    }

    #[tokio::test(start_paused = true)]
    async fn test_implausible_charger_load_keeps_previous_graph() {
        let mut h = harness(settings());
        h.dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 2000.0, 2000.0)), t0());
        h.dashboard.handle_at(
            Event::ChargeStatus(ChargerStatus {
                cars_charging: 1,
                charger_load_watts: 1500.0,
                vins: vec![],
            }),
            t0(),
        );
        assert_eq!(h.dashboard.flows().unwrap().sink_total(Sink::Car), 1500);

        h.dashboard.handle_at(
            Event::ChargeStatus(ChargerStatus {
                cars_charging: 1,
                charger_load_watts: 7000.0,
                vins: vec![],
            }),
            t0(),
        );
        assert_eq!(h.dashboard.car_load_w(), 7000);
        assert_eq!(h.dashboard.flows().unwrap().sink_total(Sink::Car), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charger_vehicle_disagreement_requests_refresh() {
        let mut h = harness(settings());
        h.dashboard.handle_at(Event::VehicleList(vec![identity(CAR)]), t0());
        let home = settings().home.unwrap();
        h.dashboard.handle_at(Event::VehicleData(charging_car(7000.0, home)), t0());
        h.dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 9000.0, 9000.0)), t0());

        // Charger attributes 3 kW while the car reports 7 kW
        let requests = h.dashboard.handle_at(
            Event::ChargeStatus(ChargerStatus {
                cars_charging: 1,
                charger_load_watts: 3000.0,
                vins: vec![format!("VIN{CAR}")],
            }),
            t0(),
        );
        assert!(vehicle_requests(&requests).contains(&Duration::from_millis(29_500)));

        // In agreement: no refresh
        let requests = h.dashboard.handle_at(
            Event::ChargeStatus(ChargerStatus {
                cars_charging: 1,
                charger_load_watts: 7100.0,
                vins: vec![format!("VIN{CAR}")],
            }),
            t0(),
        );
        assert!(vehicle_requests(&requests).is_empty());
        assert_eq!(h.dashboard.focus().focused(), Some(CAR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_car_load_inferred_without_charger() {
        let mut h = harness(DashboardSettings {
            charger_present: false,
            calls: EnabledCalls::all(false),
            ..settings()
        });
        let home = settings().home.unwrap();
        h.dashboard.handle_at(Event::VehicleList(vec![identity(CAR)]), t0());
        h.dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 8000.0, 8000.0)), t0());

        h.dashboard.handle_at(Event::VehicleData(charging_car(7000.0, home)), t0());
        assert_eq!(h.dashboard.car_load_w(), 7000);
        assert_eq!(h.dashboard.flows().unwrap().sink_total(Sink::Car), 7000);
        assert_eq!(h.dashboard.focus().num_charging(), 1);

        // More than the whole house draws: ask the car again soon
        let requests = h.dashboard.handle_at(Event::VehicleData(charging_car(9000.0, home)), t0());
        assert!(vehicle_requests(&requests).contains(&Duration::from_millis(4500)));
        assert_eq!(h.dashboard.flows().unwrap().sink_total(Sink::Car), 7000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_swing_polls_vehicles_without_charger() {
        let mut h = harness(DashboardSettings {
            charger_present: false,
            calls: EnabledCalls::all(false),
            ..settings()
        });
        h.dashboard.handle_at(Event::VehicleList(vec![identity(CAR)]), t0());
        let requests = h
            .dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 800.0, 800.0)), t0());
        assert!(vehicle_requests(&requests).is_empty());

        let requests = h
            .dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 8000.0, 8000.0)), t0());
        assert_eq!(vehicle_requests(&requests), vec![Duration::from_millis(9500)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_vehicle_is_deferred() {
        let mut h = harness(settings());
        h.dashboard.handle_at(Event::VehicleList(vec![identity(CAR)]), t0());
        let idle = VehicleTelemetry {
            vehicle_id: CAR,
            state: LinkState::Online,
            sentry: Some(false),
            drive: DriveState::default(),
            charge: ChargeState {
                state: Some(ChargingState::Disconnected),
                soc: Some(70.0),
                ..Default::default()
            },
            geofence: None,
        };
        h.dashboard.handle_at(Event::VehicleData(idle), t0());

        let requests = h.dashboard.on_timer_at(TimerTask::Vehicle, t0() + chrono::Duration::minutes(5));
        assert!(vehicle_requests(&requests).is_empty());
        assert!(h.dashboard.is_timer_pending(TimerTask::Vehicle));

        let requests = h.dashboard.on_timer_at(TimerTask::Vehicle, t0() + chrono::Duration::minutes(31));
        assert_eq!(vehicle_requests(&requests), vec![Duration::from_millis(299_500)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_energy_history_waits_for_counters() {
        let mut h = harness(settings());
        let history = EnergyHistory {
            yesterday: Default::default(),
            today: crate::domain::EnergyDay {
                solar_energy_exported: 1500.0,
                consumer_energy_imported_from_grid: 4000.0,
                ..Default::default()
            },
        };
        h.dashboard.handle_at(Event::EnergyHistory(history), t0());
        assert!(h.dashboard.day().needs_backfill());

        h.dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 500.0, 500.0)), t0());
        assert!(!h.dashboard.day().needs_backfill());
        let view = h.view.borrow().clone();
        let today = view.energy.today.unwrap();
        assert_eq!(today.solar, 1500.0);
        assert_eq!(today.usage, 4000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_tracking() {
        let mut h = harness(settings());
        h.dashboard.handle_at(Event::GridStatus(GridStatus::IslandedActive), t0());
        let later = t0() + chrono::Duration::minutes(3);
        h.dashboard.handle_at(Event::GridStatus(GridStatus::IslandedActive), later);
        assert_eq!(h.view.borrow().grid_outage_start, Some(t0()));
        assert_eq!(h.view.borrow().outages.len(), 1);

        // A backup log while still islanded keeps the ongoing outage
        h.dashboard.handle_at(Event::BackupHistory(vec![]), later);
        assert_eq!(h.view.borrow().grid_outage_start, Some(t0()));

        h.dashboard.handle_at(Event::GridStatus(GridStatus::Connected), later);
        h.dashboard.handle_at(Event::BackupHistory(vec![]), later);
        assert_eq!(h.view.borrow().grid_outage_start, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_suspends_and_sweep_catches_up() {
        let mut h = harness(settings());
        h.dashboard.start(t0());
        h.dashboard.handle_at(Event::Presence(false), t0());
        assert!(h.view.borrow().suspended);

        tokio::time::advance(Duration::from_secs(30)).await;
        h.dashboard.handle_at(Event::Presence(true), t0());
        let requests = h.dashboard.on_sweep_at(t0());
        assert!(requests.iter().any(|r| matches!(r, Request::Local { .. })));
        // Caught up once; the re-armed timer is not overdue
        assert!(h.dashboard.on_sweep_at(t0()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_and_geocode() {
        let mut h = harness(settings());
        h.dashboard
            .handle_at(Event::VehicleList(vec![identity(1), identity(2)]), t0());
        assert_eq!(h.dashboard.focus().focused(), Some(1));

        let away = Location::new(48.85, 2.35);
        let mut parked = charging_car(0.0, away);
        parked.vehicle_id = 2;
        parked.charge.state = Some(ChargingState::Disconnected);
        h.dashboard.handle_at(Event::VehicleData(parked), t0());

        let requests = h.dashboard.on_rotate_at(t0());
        assert_eq!(h.dashboard.focus().focused(), Some(2));
        assert!(requests.contains(&Request::Geocode {
            vehicle_id: 2,
            location: away
        }));

        h.dashboard.handle_at(
            Event::LocationLabel {
                vehicle_id: 2,
                location: away,
                label: Some("Paris".into()),
            },
            t0(),
        );
        let vehicle = h.view.borrow().vehicle.clone().unwrap();
        assert_eq!(vehicle.location, LocationLabel::Elsewhere("Paris".into()));
        assert_eq!(vehicle.status, VehicleStatus::Parked);

        h.dashboard.on_rotate_at(t0());
        assert_eq!(h.dashboard.focus().focused(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_state_is_shown() {
        let mut h = harness(settings());
        h.dashboard.handle_at(
            Event::AuthRequired {
                account: "me@example.com".into(),
            },
            t0(),
        );
        assert_eq!(h.view.borrow().needs_auth, vec!["me@example.com".to_string()]);
        h.dashboard.handle_at(
            Event::AuthRestored {
                account: "me@example.com".into(),
            },
            t0(),
        );
        assert!(h.view.borrow().needs_auth.is_empty());
    }

    fn energy_requests(requests: &[Request]) -> Vec<Duration> {
        requests
            .iter()
            .filter_map(|r| match r {
                Request::Energy { max_age } => Some(*max_age),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_energy_history_retried_until_day_start_held() {
        let mut h = harness(settings());
        let requests = h.dashboard.start(t0());
        assert_eq!(energy_requests(&requests), vec![Duration::ZERO]);

        // The first fetch never answers: every later refresh asks again
        let later = t0() + chrono::Duration::minutes(1);
        let requests = h
            .dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 500.0, 500.0)), later);
        assert_eq!(energy_requests(&requests), vec![Duration::from_millis(299_500)]);
        let requests = h.dashboard.on_timer_at(TimerTask::Cloud, later);
        assert_eq!(energy_requests(&requests), vec![Duration::from_millis(299_500)]);
        let requests = h.dashboard.handle_at(
            Event::AuthRestored {
                account: "me@example.com".into(),
            },
            later,
        );
        assert_eq!(energy_requests(&requests), vec![Duration::from_millis(299_500)]);

        h.dashboard.handle_at(
            Event::EnergyHistory(EnergyHistory {
                yesterday: Default::default(),
                today: Default::default(),
            }),
            later,
        );
        assert!(!h.dashboard.day().needs_backfill());
        let requests = h
            .dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 500.0, 500.0)), later);
        assert!(energy_requests(&requests).is_empty());
        assert!(energy_requests(&h.dashboard.on_timer_at(TimerTask::Cloud, later)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_disagreeing_vehicle_requests_refresh() {
        let mut h = harness(settings());
        let home = settings().home.unwrap();
        h.dashboard
            .handle_at(Event::VehicleList(vec![identity(CAR), identity(8)]), t0());
        h.dashboard.handle_at(Event::VehicleData(charging_car(3000.0, home)), t0());
        let mut second = charging_car(3000.0, home);
        second.vehicle_id = 8;
        h.dashboard.handle_at(Event::VehicleData(second.clone()), t0());
        h.dashboard
            .handle_at(Event::Aggregates(aggregates(0.0, 0.0, 9000.0, 9000.0)), t0());

        let status = ChargerStatus {
            cars_charging: 2,
            charger_load_watts: 6000.0,
            vins: vec![format!("VIN{CAR}"), "VIN8".to_string()],
        };
        h.dashboard.handle_at(Event::ChargeStatus(status.clone()), t0());
        let requests = h.dashboard.handle_at(Event::ChargeStatus(status.clone()), t0());
        assert!(vehicle_requests(&requests).is_empty());

        // The second car now claims far more than its share of the charger
        second.charge.power = 10_000.0;
        h.dashboard.handle_at(Event::VehicleData(second), t0());
        let requests = h.dashboard.handle_at(Event::ChargeStatus(status), t0());
        assert_eq!(h.dashboard.flows().unwrap().sink_total(Sink::Car), 6000);
        assert!(vehicle_requests(&requests).contains(&Duration::from_millis(29_500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unidentified_charging_keeps_vehicle_on_screen() {
        let mut h = harness(settings());
        h.dashboard.handle_at(Event::VehicleList(vec![identity(CAR)]), t0());
        assert_eq!(h.dashboard.focus().focused(), Some(CAR));

        let requests = h.dashboard.handle_at(
            Event::ChargeStatus(ChargerStatus {
                cars_charging: 1,
                charger_load_watts: 0.0,
                vins: vec!["UNKNOWN".to_string()],
            }),
            t0(),
        );
        assert!(vehicle_requests(&requests).contains(&Duration::from_millis(29_500)));
        assert_eq!(h.dashboard.focus().focused(), Some(CAR));
        assert_eq!(h.view.borrow().vehicle.as_ref().map(|v| v.id), Some(CAR));
    }
}
