use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, warn};

use cmx_presence_core::{
    sink::{PresenceSink, SinkError},
    types::PresenceUpdate,
};
use cmx_presence_util::DispatchConfig;

use crate::tap::{StageEvent, StageKind, StagePayload, TapHub};

struct DispatchJob {
    update: PresenceUpdate,
    trace_id: String,
}

/// Why an update could not be queued.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("presence queue is full")]
    QueueFull,
    #[error("presence dispatcher has shut down")]
    Closed,
}

/// Handle used by request handlers to hand updates to the sink without
/// waiting for it.
#[derive(Clone)]
pub struct PresenceDispatcher {
    sender: mpsc::Sender<DispatchJob>,
}

impl PresenceDispatcher {
    /// Starts the worker that drains the queue into `sink`.
    ///
    /// The worker exits once every dispatcher handle is dropped and all
    /// in-flight sink calls have finished.
    pub fn spawn<S: PresenceSink>(
        sink: S,
        config: DispatchConfig,
        tap: TapHub,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let worker = tokio::spawn(run_worker(
            Arc::new(sink),
            receiver,
            config.max_in_flight,
            tap,
        ));
        (Self { sender }, worker)
    }

    /// Queues an update. Never waits: a full queue drops the update.
    pub fn submit(&self, update: PresenceUpdate, trace_id: &str) -> Result<(), DispatchError> {
        let job = DispatchJob {
            update,
            trace_id: trace_id.to_string(),
        };
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                counter!("presence_dispatch_total", "result" => "dropped").increment(1);
                warn!(
                    stage = "dispatch",
                    trace_id = %job.trace_id,
                    dev_id = %job.update.dev_id,
                    "presence queue full, update dropped"
                );
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

async fn run_worker<S: PresenceSink>(
    sink: Arc<S>,
    mut receiver: mpsc::Receiver<DispatchJob>,
    max_in_flight: usize,
    tap: TapHub,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));

    while let Some(job) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let sink = sink.clone();
        let tap = tap.clone();
        tokio::spawn(async move {
            let DispatchJob { update, trace_id } = job;
            let summary = update.redacted();
            let dev_id = update.dev_id.clone();
            let result = sink.see(update).await;
            drop(permit);
            record_outcome(&tap, &trace_id, dev_id, summary, result);
        });
    }

    // Wait for the remaining sink calls before reporting shutdown.
    let total = u32::try_from(max_in_flight).unwrap_or(u32::MAX);
    if permits.acquire_many(total).await.is_ok() {
        debug!(stage = "dispatch", "presence dispatcher drained");
    }
}

fn record_outcome(
    tap: &TapHub,
    trace_id: &str,
    dev_id: String,
    summary: serde_json::Value,
    result: Result<(), SinkError>,
) {
    let label = match &result {
        Ok(()) => "ok",
        Err(SinkError::Rejected { .. }) => "rejected",
        Err(SinkError::Unavailable(_)) => "unavailable",
    };
    counter!("presence_dispatch_total", "result" => label).increment(1);

    if let Err(err) = &result {
        warn!(stage = "dispatch", %trace_id, %dev_id, error = %err, "presence sink failed");
    }

    let mut event = StageEvent::new(StageKind::Dispatch, Some(trace_id));
    event.dev_id = Some(dev_id);
    event.meta.message = Some(label.to_string());
    event.r#in = StagePayload::redacted(summary);
    event.out = StagePayload::redacted(match result {
        Ok(()) => json!({ "result": label }),
        Err(err) => json!({ "result": label, "error": err.to_string() }),
    });
    tap.publish(event);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{collections::BTreeMap, sync::Mutex, time::Duration};

    use cmx_presence_core::types::SourceType;
    use tokio::sync::Notify;

    /// Sink that records every update it sees.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        seen: Arc<Mutex<Vec<PresenceUpdate>>>,
        notify: Arc<Notify>,
    }

    impl RecordingSink {
        pub(crate) fn seen(&self) -> Vec<PresenceUpdate> {
            self.seen.lock().expect("seen").clone()
        }

        /// Waits until at least `count` updates arrived.
        pub(crate) async fn wait_for(&self, count: usize) -> Vec<PresenceUpdate> {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let notified = self.notify.notified();
                    let seen = self.seen();
                    if seen.len() >= count {
                        return seen;
                    }
                    notified.await;
                }
            })
            .await
            .expect("sink received updates in time")
        }
    }

    impl PresenceSink for RecordingSink {
        async fn see(&self, update: PresenceUpdate) -> Result<(), SinkError> {
            self.seen.lock().expect("seen").push(update);
            self.notify.notify_waiters();
            Ok(())
        }
    }

    /// Sink that parks every call until released.
    #[derive(Clone, Default)]
    struct GatedSink {
        gate: Arc<Notify>,
        started: Arc<Mutex<usize>>,
    }

    impl PresenceSink for GatedSink {
        async fn see(&self, _update: PresenceUpdate) -> Result<(), SinkError> {
            *self.started.lock().expect("started") += 1;
            self.gate.notified().await;
            Ok(())
        }
    }

    struct FailingSink;

    impl PresenceSink for FailingSink {
        async fn see(&self, update: PresenceUpdate) -> Result<(), SinkError> {
            Err(SinkError::Rejected {
                dev_id: update.dev_id,
                reason: "nope".to_string(),
            })
        }
    }

    pub(crate) fn update(mac: &str) -> PresenceUpdate {
        PresenceUpdate {
            mac: mac.to_string(),
            dev_id: mac.to_string(),
            host_name: mac.to_string(),
            source_type: SourceType::Router,
            gps: None,
            gps_accuracy: None,
            attributes: BTreeMap::new(),
        }
    }

    fn config(queue_capacity: usize, max_in_flight: usize) -> DispatchConfig {
        DispatchConfig {
            queue_capacity,
            max_in_flight,
        }
    }

    #[tokio::test]
    async fn delivers_every_update() {
        let sink = RecordingSink::default();
        let (dispatcher, worker) =
            PresenceDispatcher::spawn(sink.clone(), config(8, 2), TapHub::new());

        for mac in ["aa", "bb", "cc"] {
            dispatcher.submit(update(mac), "trace").expect("queued");
        }
        let seen = sink.wait_for(3).await;
        let mut macs: Vec<_> = seen.iter().map(|u| u.mac.clone()).collect();
        macs.sort();
        assert_eq!(macs, vec!["aa", "bb", "cc"]);

        drop(dispatcher);
        worker.await.expect("worker exits");
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        let sink = GatedSink::default();
        let (dispatcher, _worker) =
            PresenceDispatcher::spawn(sink.clone(), config(1, 1), TapHub::new());

        dispatcher.submit(update("aa"), "trace").expect("first queued");
        // Let the worker pick up the first job and park in the sink.
        tokio::time::timeout(Duration::from_secs(2), async {
            while *sink.started.lock().expect("started") == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sink started");

        dispatcher.submit(update("bb"), "trace").expect("second queued");
        // The worker holds "bb" waiting for a permit or it still sits in the
        // queue; either way at most one more fits before the queue is full.
        let mut dropped = 0;
        for mac in ["cc", "dd", "ee"] {
            if matches!(
                dispatcher.submit(update(mac), "trace"),
                Err(DispatchError::QueueFull)
            ) {
                dropped += 1;
            }
        }
        assert!(dropped >= 2);
        sink.gate.notify_waiters();
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_worker() {
        let (dispatcher, worker) =
            PresenceDispatcher::spawn(FailingSink, config(4, 1), TapHub::new());
        dispatcher.submit(update("aa"), "trace").expect("queued");
        dispatcher.submit(update("bb"), "trace").expect("queued");
        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker drains")
            .expect("worker joins");
    }
}
