pub mod cache;
pub mod calls;
pub mod dashboard;
pub mod events;
pub mod fetcher;
pub mod scheduler;
pub mod vehicle_focus;

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub use dashboard::{Dashboard, DashboardSettings, DashboardView, Presenter, WatchPresenter};
pub use events::{Event, Request, TimerTask};
pub use fetcher::Fetcher;
pub use scheduler::{FiredTimer, JitterPolicy, TimerRegistry};

/// Cadence of the loop's own exempt intervals
#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    pub sweep: Duration,
    pub rotation: Duration,
}

/// Inbound channels feeding the dashboard
pub struct Inbox {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub fired: mpsc::UnboundedReceiver<FiredTimer<TimerTask>>,
}

/// Drive the dashboard until `shutdown` resolves
///
/// Handlers run one at a time on this task. Requests they return are
/// dispatched to the fetcher on their own tasks, whose results come back
/// as events.
pub async fn run<S>(
    mut dashboard: Dashboard,
    fetcher: Arc<Fetcher>,
    mut inbox: Inbox,
    intervals: LoopIntervals,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    let mut sweep = tokio::time::interval(intervals.sweep);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rotation = tokio::time::interval(intervals.rotation);
    rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both fire immediately otherwise
    sweep.tick().await;
    rotation.tick().await;

    dispatch(&fetcher, dashboard.start(Utc::now()));

    tokio::pin!(shutdown);
    loop {
        let requests = tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = inbox.events.recv() => dashboard.handle_at(event, Utc::now()),
            Some(fired) = inbox.fired.recv() => dashboard.on_fired(fired, Utc::now()),
            _ = sweep.tick() => dashboard.on_sweep_at(Utc::now()),
            _ = rotation.tick() => dashboard.on_rotate_at(Utc::now()),
        };
        dispatch(&fetcher, requests);
    }
    info!("dashboard loop stopped");
}

fn dispatch(fetcher: &Arc<Fetcher>, requests: Vec<Request>) {
    for request in requests {
        debug!(?request, "dispatch");
        let fetcher = fetcher.clone();
        tokio::spawn(async move { fetcher.execute(request).await });
    }
}
