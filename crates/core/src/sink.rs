use std::{future::Future, sync::Arc};

use thiserror::Error;

use crate::types::PresenceUpdate;

/// Errors surfaced by a presence sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("presence update for {dev_id} rejected: {reason}")]
    Rejected { dev_id: String, reason: String },
    #[error("presence sink unavailable: {0}")]
    Unavailable(String),
}

/// Receiver of "device seen" updates; the tracker registry sits behind it.
///
/// Calls for the same device may run concurrently. Implementations that care
/// about ordering must serialize internally.
pub trait PresenceSink: Send + Sync + 'static {
    fn see(&self, update: PresenceUpdate) -> impl Future<Output = Result<(), SinkError>> + Send;
}

impl<S: PresenceSink> PresenceSink for Arc<S> {
    fn see(&self, update: PresenceUpdate) -> impl Future<Output = Result<(), SinkError>> + Send {
        (**self).see(update)
    }
}
