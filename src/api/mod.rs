pub mod error;
pub mod v1;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::Config;
use crate::controller::{DashboardView, Event};

/// Hand-off between the dashboard loop and HTTP clients
#[derive(Clone)]
pub struct AppState {
    pub view: watch::Receiver<Arc<DashboardView>>,
    pub events: mpsc::UnboundedSender<Event>,
}

pub fn router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        .nest("/api/v1", v1::router(state))
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
                .layer(TimeoutLayer::new(Duration::from_secs(cfg.server.request_timeout_secs))),
        )
        .layer(TraceLayer::new_for_http())
}
