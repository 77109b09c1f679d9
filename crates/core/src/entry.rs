//! Lifecycle of a Synology DSM config entry.
//!
//! Setting up an entry rewrites legacy device identifiers, logs in to the
//! NAS, backfills entry data, and creates the polling coordinators for the data domains the NAS actually exposes.
//! Scheduling the periodic refreshes is left to the caller.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CAMERA_API_KEY: &str = "SYNO.SurveillanceStation.Camera";
pub const INFO_API_KEY: &str = "SYNO.SurveillanceStation.Info";
pub const HOME_MODE_API_KEY: &str = "SYNO.SurveillanceStation.HomeMode";

pub const DEFAULT_VERIFY_SSL: bool = false;
pub const EXCEPTION_UNKNOWN: &str = "Unknown";

/// Failures reported by a NAS API implementation.
#[derive(Debug, Error)]
pub enum NasError {
    #[error("authentication failed: {details}")]
    Auth { details: String },
    #[error("connection failed: {details}")]
    Connection { details: String },
    #[error("{api} returned error code {code}")]
    Api { api: String, code: i64 },
}

impl NasError {
    pub fn auth(details: Option<String>) -> Self {
        Self::Auth {
            details: details.unwrap_or_else(|| EXCEPTION_UNKNOWN.to_string()),
        }
    }

    pub fn connection(details: Option<String>) -> Self {
        Self::Connection {
            details: details.unwrap_or_else(|| EXCEPTION_UNKNOWN.to_string()),
        }
    }
}

/// Why an entry could not be set up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    /// Credentials were refused; retrying without user action is pointless.
    #[error("reason: {0}")]
    AuthFailed(String),
    /// The NAS could not be reached or answered with an error; retry later.
    #[error("entry not ready: {0}")]
    NotReady(String),
}

impl From<NasError> for SetupError {
    fn from(err: NasError) -> Self {
        match err {
            NasError::Auth { details } => Self::AuthFailed(details),
            NasError::Connection { details } => Self::NotReady(details),
            other @ NasError::Api { .. } => Self::NotReady(other.to_string()),
        }
    }
}

/// Polled data domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataDomain {
    /// System information, utilisation and storage.
    Central,
    Cameras,
    /// Surveillance Station home mode.
    Switches,
}

impl DataDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Central => "central",
            Self::Cameras => "cameras",
            Self::Switches => "switches",
        }
    }

    pub fn default_interval(self) -> Duration {
        match self {
            Self::Central => Duration::from_secs(15 * 60),
            Self::Cameras | Self::Switches => Duration::from_secs(30),
        }
    }
}

/// Operations the lifecycle needs from a NAS client.
pub trait NasApi: Send + Sync + 'static {
    /// Discovers the available APIs and opens a session.
    fn setup(&self) -> impl Future<Output = Result<(), NasError>> + Send;

    /// API names discovered by [`NasApi::setup`].
    fn available_apis(&self) -> HashSet<String>;

    fn network_macs(&self) -> impl Future<Output = Result<Vec<String>, NasError>> + Send;

    fn fetch(&self, domain: DataDomain) -> impl Future<Output = Result<Value, NasError>> + Send;

    /// Extra initialisation required before switch data can be used.
    fn setup_switches(&self) -> impl Future<Output = Result<(), NasError>> + Send;

    /// Closes the session.
    fn unload(&self) -> impl Future<Output = Result<(), NasError>> + Send;
}

/// Persisted entry as created by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub unique_id: String,
    pub data: EntryData,
    /// Devices registered for this entry.
    pub devices: Vec<DeviceEntry>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct EntryData {
    pub host: String,
    pub port: u16,
    pub use_https: bool,
    pub username: String,
    pub password: String,
    pub verify_ssl: Option<bool>,
    pub macs: Vec<String>,
}

impl fmt::Debug for EntryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryData")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_https", &self.use_https)
            .field("username", &self.username)
            .field("password", &"***")
            .field("verify_ssl", &self.verify_ssl)
            .field("macs", &self.macs)
            .finish()
    }
}

/// Entries created before `verify_ssl` was recorded get the default pinned.
///
/// Returns `true` when the data changed.
pub fn migrate_entry_data(data: &mut EntryData) -> bool {
    if data.verify_ssl.is_some() {
        return false;
    }
    data.verify_ssl = Some(DEFAULT_VERIFY_SSL);
    true
}

/// Device registered for an entry. Each identifier is a tuple of parts, the
/// first part being the integration domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: String,
    pub identifiers: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierMigration {
    pub device_id: String,
    pub from: Vec<String>,
    pub to: (String, String),
}

/// Finds devices still using the old multi-part identifier layout and plans
/// their rewrite to `(domain, "part1_part2_...")`.
pub fn plan_identifier_migrations(devices: &[DeviceEntry]) -> Vec<IdentifierMigration> {
    devices
        .iter()
        .filter_map(|device| {
            let first = device.identifiers.first()?;
            if first.len() <= 2 {
                return None;
            }
            let (domain, rest) = first.split_first()?;
            Some(IdentifierMigration {
                device_id: device.id.clone(),
                from: first.clone(),
                to: (domain.clone(), rest.join("_")),
            })
        })
        .collect()
}

/// Plans and applies identifier migrations in place.
pub fn migrate_device_identifiers(devices: &mut [DeviceEntry]) -> Vec<IdentifierMigration> {
    let migrations = plan_identifier_migrations(devices);
    for migration in &migrations {
        if let Some(device) = devices
            .iter_mut()
            .find(|device| device.id == migration.device_id)
        {
            let (domain, id) = migration.to.clone();
            device.identifiers = vec![vec![domain, id]];
        }
    }
    migrations
}

/// Latest data fetched for a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub data: Value,
    pub refreshed_at: DateTime<Utc>,
}

/// Holds the most recent snapshot of one data domain.
#[derive(Debug)]
pub struct Coordinator {
    domain: DataDomain,
    snapshot: RwLock<Option<Snapshot>>,
}

impl Coordinator {
    pub fn new(domain: DataDomain) -> Self {
        Self {
            domain,
            snapshot: RwLock::new(None),
        }
    }

    pub fn domain(&self) -> DataDomain {
        self.domain
    }

    /// Fetches the domain and replaces the stored snapshot. On failure the
    /// previous snapshot is kept.
    pub async fn refresh<A: NasApi>(&self, api: &A) -> Result<(), NasError> {
        let data = api.fetch(self.domain).await?;
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Snapshot {
            data,
            refreshed_at: Utc::now(),
        });
        Ok(())
    }

    /// Initial refresh performed during setup.
    pub async fn first_refresh<A: NasApi>(&self, api: &A) -> Result<(), SetupError> {
        self.refresh(api).await.map_err(SetupError::from)
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Data of the latest snapshot, if any refresh succeeded yet.
    pub fn data(&self) -> Option<Value> {
        self.snapshot().map(|snapshot| snapshot.data)
    }
}

/// Everything created for a successfully set up entry.
pub struct EntryRuntime<A> {
    pub api: Arc<A>,
    pub central: Arc<Coordinator>,
    pub cameras: Option<Arc<Coordinator>>,
    pub switches: Option<Arc<Coordinator>>,
}

impl<A> EntryRuntime<A> {
    pub fn coordinators(&self) -> impl Iterator<Item = &Arc<Coordinator>> {
        std::iter::once(&self.central)
            .chain(self.cameras.as_ref())
            .chain(self.switches.as_ref())
    }
}

/// Sets up an entry against the NAS.
///
/// Legacy device identifiers are migrated before the NAS is contacted.
/// The central coordinator is refreshed first; the camera and switch
/// coordinators are only created when the NAS exposes their APIs.
pub async fn setup_entry<A: NasApi>(
    entry: &mut ConfigEntry,
    api: Arc<A>,
) -> Result<EntryRuntime<A>, SetupError> {
    for migration in migrate_device_identifiers(&mut entry.devices) {
        debug!(
            entry_id = %entry.entry_id,
            device_id = %migration.device_id,
            from = ?migration.from,
            to = ?migration.to,
            "migrated device identifier"
        );
    }
    migrate_entry_data(&mut entry.data);

    api.setup().await?;

    if entry.data.macs.is_empty() {
        entry.data.macs = api.network_macs().await?;
    }

    let central = Arc::new(Coordinator::new(DataDomain::Central));
    central.first_refresh(api.as_ref()).await?;

    let available = api.available_apis();

    let cameras = if available.contains(CAMERA_API_KEY) {
        let coordinator = Arc::new(Coordinator::new(DataDomain::Cameras));
        coordinator.first_refresh(api.as_ref()).await?;
        Some(coordinator)
    } else {
        None
    };

    let switches =
        if available.contains(INFO_API_KEY) && available.contains(HOME_MODE_API_KEY) {
            let coordinator = Arc::new(Coordinator::new(DataDomain::Switches));
            coordinator.first_refresh(api.as_ref()).await?;
            api.setup_switches().await?;
            Some(coordinator)
        } else {
            None
        };

    Ok(EntryRuntime {
        api,
        central,
        cameras,
        switches,
    })
}

/// Set-up entries keyed by their unique id.
pub struct EntryRegistry<A> {
    entries: HashMap<String, EntryRuntime<A>>,
}

impl<A> Default for EntryRegistry<A> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<A: NasApi> EntryRegistry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a runtime, returning the one it replaced.
    pub fn insert(
        &mut self,
        unique_id: impl Into<String>,
        runtime: EntryRuntime<A>,
    ) -> Option<EntryRuntime<A>> {
        self.entries.insert(unique_id.into(), runtime)
    }

    pub fn get(&self, unique_id: &str) -> Option<&EntryRuntime<A>> {
        self.entries.get(unique_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unique_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Removes the entry and closes its session.
    ///
    /// Returns `Ok(false)` for unknown ids. The entry is removed even when
    /// closing the session fails.
    pub async fn unload(&mut self, unique_id: &str) -> Result<bool, NasError> {
        let Some(runtime) = self.entries.remove(unique_id) else {
            return Ok(false);
        };
        runtime.api.unload().await?;
        Ok(true)
    }

    /// Unloads the current runtime for the entry, then sets it up again.
    pub async fn reload(&mut self, entry: &mut ConfigEntry, api: Arc<A>) -> Result<(), SetupError> {
        if let Err(err) = self.unload(&entry.unique_id).await {
            warn!(unique_id = %entry.unique_id, error = %err, "failed to close NAS session before reload");
        }
        let runtime = setup_entry(entry, api).await?;
        self.insert(entry.unique_id.clone(), runtime);
        Ok(())
    }
}
