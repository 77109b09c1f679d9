mod dispatch;
mod nas;
mod problem;
mod router;
mod tap;
mod telemetry;
mod tracker;
mod webhook;

use std::net::SocketAddr;

use tracing::{error, info};

use cmx_presence_storage::Database;
use cmx_presence_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let tap_hub = tap::TapHub::new();
    if config.environment.is_development() {
        tap_hub.spawn_mock_publisher();
    }

    let sink = tracker::TrackerSink::new(database.trackers());
    let (dispatcher, dispatch_worker) =
        dispatch::PresenceDispatcher::spawn(sink, config.dispatch, tap_hub.clone());

    let state = router::AppState::new(metrics, tap_hub, &config.meraki, dispatcher);

    let nas_service = match &config.nas {
        Some(nas_config) => match nas::start(nas_config) {
            Ok(service) => Some(service),
            Err(err) => {
                error!(stage = "nas", error = %err, "failed to create NAS client");
                None
            }
        },
        None => None,
    };

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        webhook_path = %config.meraki.webhook_path,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(stage = "app", "HTTP server stopped");
    if let Some(service) = nas_service {
        service.shutdown().await;
    }
    if let Err(err) = dispatch_worker.await {
        error!(stage = "dispatch", error = %err, "presence dispatcher stopped abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
