use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{is_truthy, IngestRequest, ObservationRecord, PresenceUpdate, SourceType};

/// Which attribute values survive normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributePolicy {
    /// Drop null, `false`, `0`, `""` and empty containers.
    #[default]
    OmitEmpty,
    /// Drop only null values; empty strings and zeroes are kept.
    PreserveEmpty,
}

impl AttributePolicy {
    fn keep(self, value: &Value) -> bool {
        match self {
            Self::OmitEmpty => is_truthy(value),
            Self::PreserveEmpty => !value.is_null(),
        }
    }
}

/// Deterministic mapping from observations to [`PresenceUpdate`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: AttributePolicy,
}

impl Normalizer {
    pub fn new(policy: AttributePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> AttributePolicy {
        self.policy
    }

    /// Lazily yields one update per observation, in payload order.
    pub fn normalize<'a>(
        &self,
        request: &'a IngestRequest,
    ) -> impl Iterator<Item = PresenceUpdate> + 'a {
        let normalizer = *self;
        let ap_mac = request.ap_mac.as_ref();
        request
            .observations
            .iter()
            .map(move |observation| normalizer.normalize_observation(observation, ap_mac))
    }

    /// Maps a single observation; `ap_mac` comes from the enclosing request.
    pub fn normalize_observation(
        &self,
        observation: &ObservationRecord,
        ap_mac: Option<&Value>,
    ) -> PresenceUpdate {
        let mac = observation.client_mac.clone();
        let location = &observation.location;

        let (gps, gps_accuracy) = if location.lat.is_unknown() || location.lng.is_unknown() {
            (None, None)
        } else {
            (
                Some((location.lat.clone(), location.lng.clone())),
                Some(parse_accuracy(location.unc.as_ref())),
            )
        };

        let host_name = match &observation.name {
            Some(Value::String(name)) => name.clone(),
            _ => mac.clone(),
        };

        let mut attributes = BTreeMap::new();
        for (key, value) in observation.metadata() {
            if let Some(value) = value.filter(|value| self.policy.keep(value)) {
                attributes.insert(key.to_string(), value.clone());
            }
        }
        if let Some(ap_mac) = ap_mac.filter(|value| self.policy.keep(value)) {
            attributes.insert("ap_mac".to_string(), ap_mac.clone());
        }

        PresenceUpdate {
            dev_id: mac.clone(),
            mac,
            host_name,
            source_type: SourceType::Router,
            gps,
            gps_accuracy,
            attributes,
        }
    }
}

/// Converts an uncertainty radius to whole meters.
///
/// Truncates toward zero. Missing, non-numeric and non-finite inputs yield 0,
/// negative values clamp to 0 and oversized values saturate.
pub fn parse_accuracy(unc: Option<&Value>) -> u32 {
    let parsed = match unc {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(value) if value.is_finite() => value as u32,
        _ => 0,
    }
}
