use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use cmx_presence_core::types::SourceType;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the device tracker registry.
    pub fn trackers(&self) -> DeviceTrackerRepository {
        DeviceTrackerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A sighting to record against a tracked device.
#[derive(Debug, Clone)]
pub struct DeviceSighting<'a> {
    pub dev_id: &'a str,
    pub mac: &'a str,
    pub host_name: &'a str,
    pub source_type: SourceType,
    /// Textual `(latitude, longitude)`.
    pub gps: Option<(String, String)>,
    pub gps_accuracy: Option<u32>,
    pub attributes: &'a BTreeMap<String, Value>,
    pub seen_at: DateTime<Utc>,
}

/// Current state of a tracked device.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedDevice {
    pub dev_id: String,
    pub mac: String,
    pub host_name: String,
    pub source_type: SourceType,
    pub gps: Option<(String, String)>,
    pub gps_accuracy: Option<u32>,
    pub attributes: BTreeMap<String, Value>,
    pub last_seen_at: DateTime<Utc>,
}

/// Errors raised by the tracker registry.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to decode attributes json: {0}")]
    Attributes(#[from] serde_json::Error),
    #[error("invalid stored value for {field}: {value}")]
    Corrupt { field: &'static str, value: String },
}

/// Repository backing the `tracked_devices` table.
#[derive(Clone)]
pub struct DeviceTrackerRepository {
    pool: SqlitePool,
}

impl DeviceTrackerRepository {
    /// Records a sighting.
    ///
    /// Identity, name, source and location are replaced (a sighting without
    /// gps clears the stored location). Attributes are applied to the stored
    /// mapping as a JSON merge patch, so new values win and keys absent from
    /// the sighting are kept. The upsert is a single statement so concurrent
    /// sightings only wait on the write lock.
    pub async fn see(&self, sighting: DeviceSighting<'_>) -> Result<(), TrackerError> {
        let attributes_json = serde_json::to_string(sighting.attributes)?;

        let (latitude, longitude) = match sighting.gps {
            Some((lat, lng)) => (Some(lat), Some(lng)),
            None => (None, None),
        };
        let gps_accuracy = latitude
            .as_ref()
            .map(|_| i64::from(sighting.gps_accuracy.unwrap_or(0)));

        sqlx::query(
            "INSERT INTO tracked_devices \
             (dev_id, mac, host_name, source_type, latitude, longitude, gps_accuracy, attributes_json, last_seen_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(dev_id) DO UPDATE SET \
                 mac = excluded.mac, \
                 host_name = excluded.host_name, \
                 source_type = excluded.source_type, \
                 latitude = excluded.latitude, \
                 longitude = excluded.longitude, \
                 gps_accuracy = excluded.gps_accuracy, \
                 attributes_json = json_patch(tracked_devices.attributes_json, excluded.attributes_json), \
                 last_seen_at = excluded.last_seen_at",
        )
        .bind(sighting.dev_id)
        .bind(sighting.mac)
        .bind(sighting.host_name)
        .bind(sighting.source_type.as_str())
        .bind(latitude)
        .bind(longitude)
        .bind(gps_accuracy)
        .bind(attributes_json)
        .bind(to_rfc3339(sighting.seen_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads a single device.
    pub async fn get(&self, dev_id: &str) -> Result<Option<TrackedDevice>, TrackerError> {
        let row = sqlx::query(
            "SELECT dev_id, mac, host_name, source_type, latitude, longitude, gps_accuracy, attributes_json, last_seen_at \
             FROM tracked_devices WHERE dev_id = ?",
        )
        .bind(dev_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_device(&row)).transpose()
    }

    /// Lists devices, most recently seen first.
    pub async fn list(&self) -> Result<Vec<TrackedDevice>, TrackerError> {
        let rows = sqlx::query(
            "SELECT dev_id, mac, host_name, source_type, latitude, longitude, gps_accuracy, attributes_json, last_seen_at \
             FROM tracked_devices ORDER BY last_seen_at DESC, dev_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_device).collect()
    }
}

fn decode_device(row: &SqliteRow) -> Result<TrackedDevice, TrackerError> {
    let source_raw: String = row.get("source_type");
    let source_type = SourceType::parse(&source_raw).ok_or_else(|| TrackerError::Corrupt {
        field: "source_type",
        value: source_raw.clone(),
    })?;

    let latitude: Option<String> = row.get("latitude");
    let longitude: Option<String> = row.get("longitude");
    let gps = latitude.zip(longitude);

    let accuracy: Option<i64> = row.get("gps_accuracy");
    let gps_accuracy = accuracy
        .map(|value| {
            u32::try_from(value).map_err(|_| TrackerError::Corrupt {
                field: "gps_accuracy",
                value: value.to_string(),
            })
        })
        .transpose()?;

    let attributes_json: String = row.get("attributes_json");
    let attributes = serde_json::from_str(&attributes_json)?;

    let seen_raw: String = row.get("last_seen_at");
    let last_seen_at = DateTime::parse_from_rfc3339(&seen_raw)
        .map_err(|_| TrackerError::Corrupt {
            field: "last_seen_at",
            value: seen_raw.clone(),
        })?
        .with_timezone(&Utc);

    Ok(TrackedDevice {
        dev_id: row.get("dev_id"),
        mac: row.get("mac"),
        host_name: row.get("host_name"),
        source_type,
        gps,
        gps_accuracy,
        attributes,
        last_seen_at,
    })
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
