use serde_json::Value;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::types::{is_truthy, ApiVersion, IngestRequest, ObservationRecord, ObservationType};

/// Placeholder written over the shared secret before a payload is logged.
pub const REDACTED_SECRET: &str = "hidden";

/// Terminal rejections of a webhook body.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("payload carries no secret")]
    MissingSecret,
    #[error("payload secret does not match")]
    InvalidSecret,
    #[error("unsupported API version: {0}")]
    InvalidVersion(String),
    #[error("unsupported observation type: {0}")]
    InvalidType(String),
    #[error("observation {index} is invalid: {reason}")]
    InvalidObservation { index: usize, reason: String },
}

impl IngestError {
    /// HTTP status the endpoint answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedPayload(_) => 400,
            _ => 422,
        }
    }

    /// Stable machine-readable code, also used as the metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::MissingSecret => "missing_secret",
            Self::InvalidSecret => "invalid_secret",
            Self::InvalidVersion(_) => "invalid_version",
            Self::InvalidType(_) => "invalid_type",
            Self::InvalidObservation { .. } => "invalid_observation",
        }
    }

    /// Short human readable message returned to the caller.
    pub fn message(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "Invalid JSON",
            Self::MissingSecret => "No secret",
            Self::InvalidSecret => "Invalid secret",
            Self::InvalidVersion(_) => "Invalid version",
            Self::InvalidType(_) => "Invalid device type",
            Self::InvalidObservation { .. } => "Invalid observation",
        }
    }
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// Well-formed request without observations; nothing to dispatch.
    Empty(IngestRequest),
    Ready(IngestRequest),
}

impl Validated {
    pub fn request(&self) -> &IngestRequest {
        match self {
            Self::Empty(request) | Self::Ready(request) => request,
        }
    }

    pub fn into_request(self) -> IngestRequest {
        match self {
            Self::Empty(request) | Self::Ready(request) => request,
        }
    }
}

/// Checks webhook bodies against the configured shared secret and the
/// location API schema.
#[derive(Clone)]
pub struct PayloadValidator {
    secret: Vec<u8>,
}

impl PayloadValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().into_bytes(),
        }
    }

    /// Parses a raw body into a JSON object.
    pub fn parse(body: &[u8]) -> Result<Value, IngestError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| IngestError::MalformedPayload(err.to_string()))?;
        if !value.is_object() {
            return Err(IngestError::MalformedPayload(
                "payload must be a JSON object".to_string(),
            ));
        }
        Ok(value)
    }

    /// Parses and validates a raw body in one step.
    pub fn validate(&self, body: &[u8]) -> Result<Validated, IngestError> {
        self.validate_value(Self::parse(body)?)
    }

    /// Validates an already parsed payload.
    ///
    /// The secret is checked before any other field is looked at.
    pub fn validate_value(&self, payload: Value) -> Result<Validated, IngestError> {
        let Value::Object(mut root) = payload else {
            return Err(IngestError::MalformedPayload(
                "payload must be a JSON object".to_string(),
            ));
        };

        let secret = self.check_secret(root.remove("secret"))?;

        let version = match root.get("version") {
            Some(Value::String(raw)) => {
                ApiVersion::parse(raw).ok_or_else(|| IngestError::InvalidVersion(raw.clone()))?
            }
            other => return Err(IngestError::InvalidVersion(describe(other))),
        };

        let observation_type = match root.get("type") {
            Some(Value::String(raw)) => {
                ObservationType::parse(raw).ok_or_else(|| IngestError::InvalidType(raw.clone()))?
            }
            other => return Err(IngestError::InvalidType(describe(other))),
        };

        let mut data = match root.remove("data") {
            Some(Value::Object(data)) => data,
            _ => {
                return Err(IngestError::MalformedPayload(
                    "data must be an object".to_string(),
                ))
            }
        };

        let raw_observations = match data.remove("observations") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(IngestError::MalformedPayload(
                    "data.observations must be an array".to_string(),
                ))
            }
        };
        let ap_mac = data.remove("apMac").filter(|value| !value.is_null());

        let observations = decode_observations(raw_observations)?;
        let request = IngestRequest {
            secret,
            version,
            observation_type,
            ap_mac,
            observations,
        };

        if request.observations.is_empty() {
            Ok(Validated::Empty(request))
        } else {
            Ok(Validated::Ready(request))
        }
    }

    fn check_secret(&self, provided: Option<Value>) -> Result<String, IngestError> {
        let provided = provided
            .filter(is_truthy)
            .ok_or(IngestError::MissingSecret)?;
        let Value::String(provided) = provided else {
            return Err(IngestError::InvalidSecret);
        };

        if provided.as_bytes().ct_eq(self.secret.as_slice()).into() {
            Ok(provided)
        } else {
            Err(IngestError::InvalidSecret)
        }
    }
}

fn decode_observations(items: Vec<Value>) -> Result<Vec<ObservationRecord>, IngestError> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<ObservationRecord>(item).map_err(|err| {
                IngestError::InvalidObservation {
                    index,
                    reason: err.to_string(),
                }
            })
        })
        .collect()
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => "<missing>".to_string(),
        Some(value) => value.to_string(),
    }
}

/// Returns a copy of the payload with the top-level secret replaced by
/// [`REDACTED_SECRET`], safe for debug logging.
pub fn redact_secret(payload: &Value) -> Value {
    let mut redacted = payload.clone();
    if let Some(secret) = redacted
        .as_object_mut()
        .and_then(|map| map.get_mut("secret"))
    {
        *secret = Value::String(REDACTED_SECRET.to_string());
    }
    redacted
}
