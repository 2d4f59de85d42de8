use anyhow::Result;
use energy_flow_dashboard::{api, config, controller, hardware, telemetry};
use config::Config;
use controller::{Dashboard, DashboardSettings, Fetcher, Inbox, LoopIntervals, WatchPresenter};
use std::sync::Arc;
use telemetry::init_tracing;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;

    let sources = hardware::SourceFactory::new(cfg.hardware.mode, cfg.site.clone()).build();
    let settings = DashboardSettings::new(&cfg, &sources);
    info!(
        mode = ?cfg.hardware.mode,
        charger = sources.has_charger(),
        cloud = sources.has_cloud(),
        graphs = cfg.dashboard.graphs.len(),
        "sources ready"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (fired_tx, fired_rx) = mpsc::unbounded_channel();
    let (presenter, view) = WatchPresenter::channel();

    let fetcher = Arc::new(Fetcher::new(sources, events_tx.clone()));
    let dashboard = Dashboard::new(settings, Box::new(presenter), fired_tx);
    let intervals = LoopIntervals {
        sweep: cfg.polling.sweep_interval(),
        rotation: cfg.polling.rotation_interval(),
    };

    // Flipped once the HTTP server has drained
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let loop_task = tokio::spawn(controller::run(
        dashboard,
        fetcher,
        Inbox { events: events_rx, fired: fired_rx },
        intervals,
        async move {
            let _ = stop_rx.wait_for(|stopped| *stopped).await;
        },
    ));

    let app = api::router(api::AppState { view, events: events_tx }, &cfg);
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("server binding to 0.0.0.0, dashboard is reachable from the network");
    }

    info!(%addr, "starting energy flow dashboard");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    if let Err(e) = loop_task.await {
        warn!(error = %e, "dashboard loop ended abnormally");
    }

    warn!("shutdown complete");
    Ok(())
}
