use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use cmx_presence_core::{
    sink::{PresenceSink, SinkError},
    types::PresenceUpdate,
};
use cmx_presence_storage::{DeviceSighting, DeviceTrackerRepository, TrackerError};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Presence sink backed by the SQLite device registry.
#[derive(Clone)]
pub struct TrackerSink {
    repository: DeviceTrackerRepository,
    clock: Clock,
}

impl TrackerSink {
    pub fn new(repository: DeviceTrackerRepository) -> Self {
        Self {
            repository,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl PresenceSink for TrackerSink {
    async fn see(&self, update: PresenceUpdate) -> Result<(), SinkError> {
        let sighting = DeviceSighting {
            dev_id: &update.dev_id,
            mac: &update.mac,
            host_name: &update.host_name,
            source_type: update.source_type,
            gps: update
                .gps
                .as_ref()
                .map(|(lat, lng)| (lat.to_string(), lng.to_string())),
            gps_accuracy: update.gps_accuracy,
            attributes: &update.attributes,
            seen_at: (self.clock)(),
        };

        match self.repository.see(sighting).await {
            Ok(()) => {
                debug!(stage = "tracker", dev_id = %update.dev_id, has_gps = update.gps.is_some(), "device seen");
                Ok(())
            }
            Err(TrackerError::Database(err)) => {
                error!(stage = "tracker", dev_id = %update.dev_id, error = %err, "failed to record sighting");
                Err(SinkError::Unavailable(err.to_string()))
            }
            Err(err) => {
                error!(stage = "tracker", dev_id = %update.dev_id, error = %err, "stored device record is unreadable");
                Err(SinkError::Rejected {
                    dev_id: update.dev_id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }
}
