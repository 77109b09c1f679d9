use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use cmx_presence_core::{
    normalizer::{AttributePolicy, Normalizer},
    validator::PayloadValidator,
};
use cmx_presence_util::{EmptyAttributes, MerakiConfig};

use crate::dispatch::PresenceDispatcher;
use crate::tap::{parse_stage_list, tap_keep_alive, tap_stream, TapFilter, TapHub};
use crate::{telemetry, webhook};

/// Shared, immutable request handling state.
#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    validator: Arc<PayloadValidator>,
    validator_token: Arc<str>,
    webhook_path: Arc<str>,
    normalizer: Normalizer,
    dispatcher: PresenceDispatcher,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tap: TapHub,
        config: &MerakiConfig,
        dispatcher: PresenceDispatcher,
    ) -> Self {
        let policy = match config.empty_attributes {
            EmptyAttributes::Omit => AttributePolicy::OmitEmpty,
            EmptyAttributes::Preserve => AttributePolicy::PreserveEmpty,
        };
        Self {
            metrics,
            tap,
            validator: Arc::new(PayloadValidator::new(config.secret.expose())),
            validator_token: Arc::from(config.validator.as_str()),
            webhook_path: Arc::from(config.webhook_path.as_str()),
            normalizer: Normalizer::new(policy),
            dispatcher,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn validator(&self) -> &PayloadValidator {
        &self.validator
    }

    pub fn validator_token(&self) -> &str {
        &self.validator_token
    }

    pub fn webhook_path(&self) -> &str {
        &self.webhook_path
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn dispatcher(&self) -> &PresenceDispatcher {
        &self.dispatcher
    }
}

pub fn app_router(state: AppState) -> Router {
    let webhook_path = state.webhook_path().to_string();
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/tap", get(debug_tap))
        .route(
            &webhook_path,
            get(webhook::validator_echo).post(webhook::ingest),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let filter = TapFilter::from_stages(stages);
    let stream = tap_stream(state.tap().clone(), filter);

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}
