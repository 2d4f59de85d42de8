use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::cache::{ResponseCache, SingleFlight};
use super::events::{Event, Request};
use crate::domain::VehicleId;
use crate::error::{SourceError, SourceResult};
use crate::hardware::Sources;

/// Kind of upstream response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Local,
    ChargeHistory,
    Energy,
    SelfConsumption,
    PowerHistory,
    StormWatch,
    VehicleList,
    VehicleData(VehicleId),
}

impl FetchKind {
    fn from_request(request: &Request) -> Option<(Self, Duration)> {
        let key = match request {
            Request::Local { max_age } => (FetchKind::Local, *max_age),
            Request::ChargeHistory { max_age } => (FetchKind::ChargeHistory, *max_age),
            Request::Energy { max_age } => (FetchKind::Energy, *max_age),
            Request::SelfConsumption { max_age } => (FetchKind::SelfConsumption, *max_age),
            Request::PowerHistory { max_age } => (FetchKind::PowerHistory, *max_age),
            Request::StormWatch { max_age } => (FetchKind::StormWatch, *max_age),
            Request::VehicleList { max_age } => (FetchKind::VehicleList, *max_age),
            Request::VehicleData { vehicle_id, max_age } => (FetchKind::VehicleData(*vehicle_id), *max_age),
            Request::Geocode { .. } | Request::ClearAuth { .. } => return None,
        };
        Some(key)
    }

    fn is_cloud(&self) -> bool {
        !matches!(self, FetchKind::Local | FetchKind::ChargeHistory)
    }
}

/// Cache and single-flight key: the response kind, scoped to the cloud
/// account for cloud kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub kind: FetchKind,
    pub account: Option<String>,
}

impl FetchKey {
    pub fn scoped(kind: FetchKind, sources: &Sources) -> Self {
        let account = if kind.is_cloud() {
            sources.cloud.as_ref().map(|c| c.account())
        } else {
            None
        };
        Self { kind, account }
    }
}

/// Executes dashboard requests against the collaborators
///
/// Responses are cached per [`FetchKey`]; a request whose `max_age` is
/// still satisfied by the cache replays the cached events instead of going
/// upstream. Concurrent requests for the same key share one upstream call.
pub struct Fetcher {
    sources: Sources,
    events: mpsc::UnboundedSender<Event>,
    cache: RwLock<ResponseCache<FetchKey, Vec<Event>>>,
    flights: SingleFlight<FetchKey, Vec<Event>>,
    needs_auth: Mutex<HashSet<String>>,
}

impl Fetcher {
    pub fn new(sources: Sources, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            sources,
            events,
            cache: RwLock::new(ResponseCache::new()),
            flights: SingleFlight::new(),
            needs_auth: Mutex::new(HashSet::new()),
        }
    }

    pub fn needs_auth(&self, account: &str) -> bool {
        self.needs_auth.lock().contains(account)
    }

    pub async fn execute(&self, request: Request) {
        self.execute_at(request, Utc::now()).await
    }

    pub async fn execute_at(&self, request: Request, now: DateTime<Utc>) {
        match request {
            Request::ClearAuth { account } => {
                if self.needs_auth.lock().remove(&account) {
                    info!(%account, "credentials refreshed, resuming cloud requests");
                    self.emit(Event::AuthRestored { account });
                }
            }
            Request::Geocode { vehicle_id, location } => {
                let Some(geocoder) = self.sources.geocoder.clone() else {
                    return;
                };
                match geocoder.locality(location).await {
                    Ok(label) => self.emit(Event::LocationLabel {
                        vehicle_id,
                        location,
                        label,
                    }),
                    Err(e) => warn!(error = %e, vehicle_id, "reverse geocode failed"),
                }
            }
            ref other => {
                if let Some((kind, max_age)) = FetchKind::from_request(other) {
                    self.fetch(FetchKey::scoped(kind, &self.sources), max_age, now).await;
                }
            }
        }
    }

    async fn fetch(&self, key: FetchKey, max_age: Duration, now: DateTime<Utc>) {
        if let Some(account) = &key.account {
            if self.needs_auth(account) {
                debug!(?key, "account needs authentication, skipping");
                return;
            }
        }

        let window = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(events) = self.cache.write().await.fresh(&key, window, now) {
            debug!(?key, "serving cached response");
            self.emit_all(events);
            return;
        }

        let sources = self.sources.clone();
        let kind = key.kind;
        let result = self
            .flights
            .run(key.clone(), move || async move { load(&sources, kind).await }.boxed())
            .await;

        match result {
            Ok(events) => {
                self.cache.write().await.store(key, events.clone(), now);
                self.emit_all(events);
            }
            Err(SourceError::AuthRequired(account)) => {
                if self.needs_auth.lock().insert(account.clone()) {
                    warn!(%account, "cloud account needs re-authentication");
                    self.emit(Event::AuthRequired { account });
                }
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, ?key, "fetch failed, keeping stale data");
            }
            Err(e) => {
                warn!(error = %e, ?key, "dropping unusable response");
            }
        }
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("dashboard gone, dropping event");
        }
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit(event);
        }
    }
}

async fn load(sources: &Sources, kind: FetchKind) -> SourceResult<Vec<Event>> {
    match kind {
        FetchKind::Local => {
            let gateway = sources.gateway.as_ref().ok_or(SourceError::NotConfigured("local gateway"))?;
            let aggregates = gateway.aggregates().await?;
            aggregates.validate()?;
            let soe = gateway.state_of_energy().await?;
            crate::error::ensure_finite("state_of_energy", soe)?;
            let grid = gateway.grid_status().await?;
            let mut events = vec![Event::Aggregates(aggregates), Event::StateOfEnergy(soe), Event::GridStatus(grid)];
            if let Some(charger) = &sources.charger {
                match charger.status().await.and_then(|s| s.validate().map(|_| s)) {
                    Ok(status) => events.push(Event::ChargeStatus(status)),
                    // The gateway data is still good on its own
                    Err(e) => warn!(error = %e, "charger status unavailable"),
                }
            }
            Ok(events)
        }
        FetchKind::ChargeHistory => {
            let charger = sources.charger.as_ref().ok_or(SourceError::NotConfigured("charger manager"))?;
            Ok(vec![Event::ChargeHistory(charger.charge_history().await?)])
        }
        FetchKind::Energy => Ok(vec![Event::EnergyHistory(cloud(sources)?.energy_history().await?)]),
        FetchKind::SelfConsumption => Ok(vec![Event::SelfConsumption(cloud(sources)?.self_consumption().await?)]),
        FetchKind::PowerHistory => {
            let cloud = cloud(sources)?;
            let power = cloud.power_history().await?;
            let backup = cloud.backup_history().await?;
            Ok(vec![Event::PowerHistory(power), Event::BackupHistory(backup)])
        }
        FetchKind::StormWatch => Ok(vec![Event::StormWatch(cloud(sources)?.storm_watch().await?)]),
        FetchKind::VehicleList => Ok(vec![Event::VehicleList(cloud(sources)?.vehicles().await?)]),
        FetchKind::VehicleData(id) => {
            let telemetry = cloud(sources)?.vehicle_data(id).await?;
            telemetry.validate()?;
            Ok(vec![Event::VehicleData(telemetry)])
        }
    }
}

fn cloud(sources: &Sources) -> SourceResult<&Arc<dyn crate::hardware::CloudApi>> {
    sources.cloud.as_ref().ok_or(SourceError::NotConfigured("cloud account"))
}
