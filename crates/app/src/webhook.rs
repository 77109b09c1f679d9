use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cmx_presence_core::{
    types::IngestRequest,
    validator::{redact_secret, IngestError, PayloadValidator, Validated},
};

use crate::dispatch::DispatchError;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StagePayload};

/// Answers the vendor's URL ownership check with the validator token.
pub async fn validator_echo(State(state): State<AppState>) -> Response {
    let start = Instant::now();
    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        Body::from(state.validator_token().to_string()),
    )
        .into_response();
    histogram!("webhook_ack_latency_seconds", "method" => "get")
        .record(start.elapsed().as_secs_f64());
    response
}

/// Validates a location payload and queues one presence update per
/// observation. Returns before any sink call completes.
pub async fn ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let trace_id = Uuid::new_v4().to_string();
    let body_len = body.len() as u64;

    let result = PayloadValidator::parse(&body).and_then(|payload| {
        debug!(
            stage = "ingress",
            %trace_id,
            payload = %redact_secret(&payload),
            "location payload received"
        );
        state.validator().validate_value(payload)
    });

    let response = match result {
        Ok(Validated::Empty(request)) => {
            counter!("meraki_ingress_total", "result" => "empty").increment(1);
            info!(
                stage = "ingress",
                %trace_id,
                observation_type = request.observation_type.as_str(),
                "payload without observations"
            );
            emit_ingress(&state, &trace_id, body_len, start, &request, "empty");
            Ok(StatusCode::OK.into_response())
        }
        Ok(Validated::Ready(request)) => {
            counter!("meraki_ingress_total", "result" => "accepted").increment(1);
            counter!(
                "meraki_observations_total",
                "type" => request.observation_type.metric_label()
            )
            .increment(request.observations.len() as u64);
            emit_ingress(&state, &trace_id, body_len, start, &request, "accepted");
            dispatch_updates(&state, &trace_id, &request);
            Ok(StatusCode::OK.into_response())
        }
        Err(err) => Err(reject(&state, &trace_id, body_len, &err)),
    };

    histogram!("webhook_ack_latency_seconds", "method" => "post")
        .record(start.elapsed().as_secs_f64());
    response
}

fn dispatch_updates(state: &AppState, trace_id: &str, request: &IngestRequest) {
    let start = Instant::now();
    let mut queued = 0usize;
    let mut dropped = 0usize;
    let mut summaries = Vec::with_capacity(request.observations.len());

    for update in state.normalizer().normalize(request) {
        summaries.push(update.redacted());
        match state.dispatcher().submit(update, trace_id) {
            Ok(()) => queued += 1,
            Err(DispatchError::QueueFull) => dropped += 1,
            Err(DispatchError::Closed) => {
                dropped += 1;
                error!(stage = "dispatch", %trace_id, "presence dispatcher is gone");
            }
        }
    }

    debug!(
        stage = "normalizer",
        %trace_id,
        queued,
        dropped,
        "observations normalized"
    );

    let mut event = StageEvent::new(StageKind::Normalizer, Some(trace_id));
    event.meta.observation_type = Some(request.observation_type.as_str().to_string());
    event.meta.count = Some(summaries.len());
    event.meta.latency_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
    event.out = StagePayload::redacted(json!({
        "updates": summaries,
        "queued": queued,
        "dropped": dropped,
    }));
    state.tap().publish(event);
}

fn reject(state: &AppState, trace_id: &str, body_len: u64, err: &IngestError) -> ProblemResponse {
    counter!("meraki_ingress_total", "result" => "rejected").increment(1);
    counter!("meraki_rejected_total", "reason" => err.code()).increment(1);

    match err {
        IngestError::MissingSecret | IngestError::InvalidSecret => {
            error!(stage = "validator", %trace_id, reason = err.code(), "{}", err.message());
        }
        _ => {
            warn!(stage = "validator", %trace_id, reason = err.code(), error = %err, "payload rejected");
        }
    }

    let problem = ProblemResponse::from(err);

    let mut event = StageEvent::new(StageKind::Ingress, Some(trace_id));
    event.meta.size_bytes = Some(body_len);
    event.meta.message = Some(err.code().to_string());
    event.out = StagePayload {
        redacted: false,
        payload: json!({ "status": problem.status().as_u16(), "reason": err.code() }),
    };
    state.tap().publish(event);

    problem
}

fn emit_ingress(
    state: &AppState,
    trace_id: &str,
    body_len: u64,
    start: Instant,
    request: &IngestRequest,
    result: &'static str,
) {
    let mut event = StageEvent::new(StageKind::Ingress, Some(trace_id));
    event.meta.observation_type = Some(request.observation_type.as_str().to_string());
    event.meta.size_bytes = Some(body_len);
    event.meta.count = Some(request.observations.len());
    event.meta.latency_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
    event.r#in = StagePayload::redacted(json!({
        "version": request.version.as_str(),
        "ap_mac": request.ap_mac.clone().unwrap_or(Value::Null),
    }));
    event.out = StagePayload {
        redacted: false,
        payload: json!({ "status": StatusCode::OK.as_u16(), "result": result }),
    };
    state.tap().publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::{collections::BTreeMap, time::Duration};
    use tower::ServiceExt;

    use cmx_presence_core::types::{Coordinate, PresenceUpdate, SourceType};
    use cmx_presence_util::{DispatchConfig, EmptyAttributes, MerakiConfig, SecretString};

    use crate::dispatch::{tests::RecordingSink, PresenceDispatcher};
    use crate::router::app_router;
    use crate::tap::TapHub;
    use crate::telemetry;

    const PATH: &str = "/api/meraki";

    fn setup() -> (AppState, RecordingSink) {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let tap = TapHub::new();
        let sink = RecordingSink::default();
        let (dispatcher, _worker) =
            PresenceDispatcher::spawn(sink.clone(), DispatchConfig::default(), tap.clone());
        let config = MerakiConfig {
            validator: "v-token".to_string(),
            secret: SecretString::new("s1"),
            webhook_path: PATH.to_string(),
            empty_attributes: EmptyAttributes::Omit,
        };
        (AppState::new(metrics, tap, &config, dispatcher), sink)
    }

    fn post(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .expect("request")
    }

    async fn body_string(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf-8")
    }

    fn scenario_body(lat: &str) -> String {
        json!({
            "secret": "s1",
            "version": "2.0",
            "type": "DevicesSeen",
            "data": {
                "apMac": "AA:BB",
                "observations": [{
                    "clientMac": "11:22",
                    "location": {"lat": lat, "lng": "-3.7", "unc": "5.0"},
                    "ssid": "Guest"
                }]
            }
        })
        .to_string()
    }

    /// Gives the dispatcher a chance to run; used where no update is expected.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn get_echoes_validator_token() {
        let (state, sink) = setup();
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri(PATH)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("type"),
            "text/plain"
        );
        assert_eq!(body_string(response).await, "v-token");
        settle().await;
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn documented_post_reaches_sink() {
        let (state, sink) = setup();
        let response = app_router(state)
            .oneshot(post(scenario_body("40.1")))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());

        let seen = sink.wait_for(1).await;
        assert_eq!(
            seen,
            vec![PresenceUpdate {
                mac: "11:22".to_string(),
                dev_id: "11:22".to_string(),
                host_name: "11:22".to_string(),
                source_type: SourceType::Router,
                gps: Some((Coordinate::from("40.1"), Coordinate::from("-3.7"))),
                gps_accuracy: Some(5),
                attributes: BTreeMap::from([
                    ("ssid".to_string(), json!("Guest")),
                    ("ap_mac".to_string(), json!("AA:BB")),
                ]),
            }]
        );
    }

    #[tokio::test]
    async fn nan_latitude_drops_gps() {
        let (state, sink) = setup();
        let response = app_router(state)
            .oneshot(post(scenario_body("NaN")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let seen = sink.wait_for(1).await;
        assert_eq!(seen[0].gps, None);
        assert_eq!(seen[0].gps_accuracy, None);
        assert_eq!(seen[0].host_name, "11:22");
        assert_eq!(seen[0].attributes.len(), 2);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_without_dispatch() {
        let (state, sink) = setup();
        let body = scenario_body("40.1").replace("\"s1\"", "\"s2\"");
        let response = app_router(state)
            .oneshot(post(body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("type"),
            "application/json"
        );
        let problem: Value =
            serde_json::from_str(&body_string(response).await).expect("json body");
        assert_eq!(problem["type"], json!("invalid_secret"));
        assert_eq!(problem["message"], json!("Invalid secret"));
        assert_eq!(problem["title"], json!("Unprocessable Entity"));

        settle().await;
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_rejected() {
        let (state, sink) = setup();
        let body = json!({"version": "2.0", "type": "DevicesSeen", "data": {}}).to_string();
        let response = app_router(state)
            .oneshot(post(body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let problem: Value =
            serde_json::from_str(&body_string(response).await).expect("json body");
        assert_eq!(problem["message"], json!("No secret"));
        settle().await;
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn bad_version_and_type_are_rejected() {
        for (needle, replacement, message) in [
            ("\"2.0\"", "\"3.0\"", "Invalid version"),
            ("\"DevicesSeen\"", "\"Wifi\"", "Invalid device type"),
        ] {
            let (state, sink) = setup();
            let body = scenario_body("40.1").replace(needle, replacement);
            let response = app_router(state)
                .oneshot(post(body))
                .await
                .expect("response");

            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
            let problem: Value =
                serde_json::from_str(&body_string(response).await).expect("json body");
            assert_eq!(problem["message"], json!(message));
            settle().await;
            assert!(sink.seen().is_empty());
        }
    }

    #[tokio::test]
    async fn invalid_json_is_bad_request() {
        let (state, _sink) = setup();
        let response = app_router(state)
            .oneshot(post("{\"secret\": "))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let problem: Value =
            serde_json::from_str(&body_string(response).await).expect("json body");
        assert_eq!(problem["type"], json!("malformed_payload"));
        assert_eq!(problem["message"], json!("Invalid JSON"));
    }

    #[tokio::test]
    async fn empty_observations_do_not_touch_sink() {
        let (state, sink) = setup();
        let body = json!({
            "secret": "s1",
            "version": "2.1",
            "type": "BluetoothDevicesSeen",
            "data": {"apMac": "AA:BB", "observations": []}
        })
        .to_string();
        let response = app_router(state)
            .oneshot(post(body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());
        settle().await;
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn batch_with_invalid_observation_dispatches_nothing() {
        let (state, sink) = setup();
        let body = json!({
            "secret": "s1",
            "version": "2.0",
            "type": "DevicesSeen",
            "data": {"observations": [
                {"clientMac": "aa", "location": {"lat": "1", "lng": "2"}},
                {"location": {"lat": "1", "lng": "2"}}
            ]}
        })
        .to_string();
        let response = app_router(state)
            .oneshot(post(body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        settle().await;
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn every_observation_is_dispatched() {
        let (state, sink) = setup();
        let body = json!({
            "secret": "s1",
            "version": "2.0",
            "type": "DevicesSeen",
            "data": {"observations": [
                {"clientMac": "aa", "location": {"lat": "1", "lng": "2", "unc": "abc"}},
                {"clientMac": "bb", "location": {"lat": "3", "lng": "4", "unc": "12.7"}, "name": "Phone"},
                {"clientMac": "cc", "location": {"lat": "5", "lng": "NaN"}}
            ]}
        })
        .to_string();
        let response = app_router(state)
            .oneshot(post(body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let mut seen = sink.wait_for(3).await;
        seen.sort_by(|a, b| a.mac.cmp(&b.mac));
        assert_eq!(seen[0].gps_accuracy, Some(0));
        assert_eq!(seen[1].gps_accuracy, Some(12));
        assert_eq!(seen[1].host_name, "Phone");
        assert_eq!(seen[2].gps, None);
        assert!(seen.iter().all(|update| update.attributes.is_empty()));
    }
}
