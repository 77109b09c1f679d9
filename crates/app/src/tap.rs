use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ingress,
    Normalizer,
    Dispatch,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Ingress => "ingress",
            StageKind::Normalizer => "normalizer",
            StageKind::Dispatch => "dispatch",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "ingress" => Some(StageKind::Ingress),
            "normalizer" => Some(StageKind::Normalizer),
            "dispatch" => Some(StageKind::Dispatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct StageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageMetadata {
    fn is_empty(&self) -> bool {
        self.observation_type.is_none()
            && self.size_bytes.is_none()
            && self.count.is_none()
            && self.latency_ms.is_none()
            && self.message.is_none()
    }
}

/// Payload snapshot attached to a stage event. Never carries the raw body.
#[derive(Debug, Clone, Serialize)]
pub struct StagePayload {
    pub redacted: bool,
    pub payload: Value,
}

impl Default for StagePayload {
    fn default() -> Self {
        Self {
            redacted: false,
            payload: Value::Null,
        }
    }
}

impl StagePayload {
    pub fn redacted(payload: Value) -> Self {
        Self {
            redacted: true,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: DateTime<Utc>,
    pub stage: StageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<String>,
    #[serde(default, skip_serializing_if = "StageMetadata::is_empty")]
    pub meta: StageMetadata,
    pub r#in: StagePayload,
    pub out: StagePayload,
}

impl StageEvent {
    pub fn new(stage: StageKind, trace_id: Option<&str>) -> Self {
        Self {
            ts: Utc::now(),
            stage,
            trace_id: trace_id.map(str::to_string),
            dev_id: None,
            meta: StageMetadata::default(),
            r#in: StagePayload::default(),
            out: StagePayload::default(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.stage.as_str()
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let event = Event::default().event(self.event_name());
        let data = serde_json::to_string(&self)?;
        Ok(event.data(data))
    }

    pub fn mock(message: &str) -> Self {
        let mut event = Self::new(StageKind::Ingress, None);
        event.meta.message = Some(message.to_string());
        event.out.payload = json!({ "message": message });
        event
    }
}

#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl Default for TapHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    /// Broadcasts to current subscribers; events are discarded when nobody listens.
    pub fn publish(&self, event: StageEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(err) = self.sender.send(event) {
            debug!(stage = "app", error = %err, "failed to broadcast tap event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    pub fn spawn_mock_publisher(&self) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                hub.publish(StageEvent::mock("tap.dev.heartbeat"));
            }
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let name = item.trim().to_lowercase();
        let stage = StageKind::parse(&name).ok_or_else(|| format!("unknown stage '{name}'"))?;
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_stages() {
        let stages = parse_stage_list(Some("ingress, Dispatch".to_string()))
            .expect("valid list")
            .expect("non-empty");
        assert!(stages.contains(&StageKind::Ingress));
        assert!(stages.contains(&StageKind::Dispatch));
        assert!(!stages.contains(&StageKind::Normalizer));

        assert!(parse_stage_list(Some(",".to_string()))
            .expect("empty list")
            .is_none());
        assert!(parse_stage_list(None).expect("absent").is_none());
    }

    #[test]
    fn rejects_unknown_stage() {
        let err = parse_stage_list(Some("ingress,policy".to_string())).expect_err("unknown");
        assert_eq!(err, "unknown stage 'policy'");
    }

    #[test]
    fn filter_matches_selected_stages() {
        let filter = TapFilter::from_stages(Some(HashSet::from([StageKind::Dispatch])));
        assert!(filter.matches(&StageEvent::new(StageKind::Dispatch, None)));
        assert!(!filter.matches(&StageEvent::new(StageKind::Ingress, None)));
        assert!(TapFilter::default().matches(&StageEvent::mock("x")));
    }
}
