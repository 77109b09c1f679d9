use std::{sync::Arc, time::Duration};

use metrics::counter;
use tokio::{
    sync::Mutex,
    task::{JoinHandle, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use cmx_presence_core::entry::{
    setup_entry, ConfigEntry, Coordinator, EntryData, EntryRegistry, NasApi, SetupError,
};
use cmx_presence_nas::{DsmClient, DsmError};
use cmx_presence_util::NasConfig;

const SETUP_RETRY: Duration = Duration::from_secs(60);

type Registry<A> = Arc<Mutex<EntryRegistry<A>>>;

/// Background supervisor for the configured NAS entry.
pub struct NasService<A> {
    registry: Registry<A>,
    unique_id: String,
    task: JoinHandle<()>,
}

/// Builds the DSM client for the configured entry and starts supervising it.
pub fn start(config: &NasConfig) -> Result<NasService<DsmClient>, DsmError> {
    let entry = config_entry(config);
    let api = Arc::new(DsmClient::from_entry(&entry.data)?);
    Ok(NasService::spawn(entry, api))
}

fn config_entry(config: &NasConfig) -> ConfigEntry {
    ConfigEntry {
        entry_id: config.entry_id.clone(),
        unique_id: format!("{}:{}", config.host, config.port),
        data: EntryData {
            host: config.host.clone(),
            port: config.port,
            use_https: config.use_https,
            username: config.username.clone(),
            password: config.password.expose().to_string(),
            verify_ssl: config.verify_ssl,
            macs: config.macs.clone(),
        },
        devices: Vec::new(),
    }
}

impl<A: NasApi> NasService<A> {
    /// Sets the entry up in the background, retrying while the NAS is not
    /// ready, then polls every coordinator at its domain interval.
    pub fn spawn(entry: ConfigEntry, api: Arc<A>) -> Self {
        let registry: Registry<A> = Arc::new(Mutex::new(EntryRegistry::new()));
        let unique_id = entry.unique_id.clone();
        let task = tokio::spawn(supervise(entry, api, registry.clone()));
        Self {
            registry,
            unique_id,
            task,
        }
    }

    /// Stops polling and closes the NAS session.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;

        match self.registry.lock().await.unload(&self.unique_id).await {
            Ok(true) => info!(stage = "nas", unique_id = %self.unique_id, "NAS entry unloaded"),
            Ok(false) => {}
            Err(err) => {
                warn!(stage = "nas", unique_id = %self.unique_id, error = %err, "failed to close NAS session")
            }
        }
    }

    #[cfg(test)]
    async fn is_loaded(&self) -> bool {
        self.registry.lock().await.get(&self.unique_id).is_some()
    }
}

async fn supervise<A: NasApi>(mut entry: ConfigEntry, api: Arc<A>, registry: Registry<A>) {
    let runtime = loop {
        match setup_entry(&mut entry, api.clone()).await {
            Ok(runtime) => break runtime,
            Err(SetupError::AuthFailed(reason)) => {
                error!(stage = "nas", entry_id = %entry.entry_id, %reason, "NAS rejected the credentials");
                return;
            }
            Err(SetupError::NotReady(reason)) => {
                warn!(
                    stage = "nas",
                    entry_id = %entry.entry_id,
                    %reason,
                    retry_in_secs = SETUP_RETRY.as_secs(),
                    "NAS entry not ready"
                );
                tokio::time::sleep(SETUP_RETRY).await;
            }
        }
    };

    info!(
        stage = "nas",
        entry_id = %entry.entry_id,
        macs = ?entry.data.macs,
        cameras = runtime.cameras.is_some(),
        switches = runtime.switches.is_some(),
        "NAS entry set up"
    );

    let mut pollers = JoinSet::new();
    for coordinator in runtime.coordinators() {
        pollers.spawn(poll(coordinator.clone(), runtime.api.clone()));
    }
    registry.lock().await.insert(entry.unique_id.clone(), runtime);

    while pollers.join_next().await.is_some() {}
}

async fn poll<A: NasApi>(coordinator: Arc<Coordinator>, api: Arc<A>) {
    let domain = coordinator.domain();
    let period = domain.default_interval();
    // The first refresh already ran during setup.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match coordinator.refresh(api.as_ref()).await {
            Ok(()) => {
                counter!("nas_refresh_total", "domain" => domain.as_str(), "result" => "ok")
                    .increment(1);
            }
            Err(err) => {
                counter!("nas_refresh_total", "domain" => domain.as_str(), "result" => "error")
                    .increment(1);
                warn!(stage = "nas", domain = domain.as_str(), error = %err, "NAS refresh failed");
            }
        }
    }
}
