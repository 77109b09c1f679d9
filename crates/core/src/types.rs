use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

/// Literal the location service sends when a coordinate is unknown.
pub const UNKNOWN_COORDINATE: &str = "NaN";

/// Location API versions accepted on the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVersion {
    #[serde(rename = "2.0")]
    V2_0,
    #[serde(rename = "2.1")]
    V2_1,
}

impl ApiVersion {
    /// Matches the exact wire literal; no trimming or case folding.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "2.0" => Some(Self::V2_0),
            "2.1" => Some(Self::V2_1),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V2_0 => "2.0",
            Self::V2_1 => "2.1",
        }
    }
}

/// Kind of sighting batch pushed by the location service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationType {
    DevicesSeen,
    BluetoothDevicesSeen,
}

impl ObservationType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DevicesSeen" => Some(Self::DevicesSeen),
            "BluetoothDevicesSeen" => Some(Self::BluetoothDevicesSeen),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DevicesSeen => "DevicesSeen",
            Self::BluetoothDevicesSeen => "BluetoothDevicesSeen",
        }
    }

    /// Returns the label used for metrics and tap output.
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::DevicesSeen => "wifi",
            Self::BluetoothDevicesSeen => "bluetooth",
        }
    }
}

/// A coordinate exactly as the payload carried it.
///
/// Values are passed through untouched; the only interpretation applied is the
/// [`UNKNOWN_COORDINATE`] sentinel check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
    Number(Number),
    Text(String),
}

impl Coordinate {
    /// Returns `true` for the literal `"NaN"` string. Numbers never match.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Text(value) if value == UNKNOWN_COORDINATE)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for Coordinate {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObservationLocation {
    pub lat: Coordinate,
    pub lng: Coordinate,
    /// Uncertainty radius in meters; any JSON shape is tolerated.
    #[serde(default)]
    pub unc: Option<Value>,
}

/// One device sighting inside a webhook batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObservationRecord {
    #[serde(rename = "clientMac")]
    pub client_mac: String,
    pub location: ObservationLocation,
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(default)]
    pub os: Option<Value>,
    #[serde(default)]
    pub manufacturer: Option<Value>,
    #[serde(default)]
    pub ipv4: Option<Value>,
    #[serde(default)]
    pub ipv6: Option<Value>,
    #[serde(default, rename = "seenTime")]
    pub seen_time: Option<Value>,
    #[serde(default)]
    pub ssid: Option<Value>,
}

impl ObservationRecord {
    /// Optional metadata fields in the order they are copied into attributes.
    pub fn metadata(&self) -> [(&'static str, Option<&Value>); 6] {
        [
            ("os", self.os.as_ref()),
            ("manufacturer", self.manufacturer.as_ref()),
            ("ipv4", self.ipv4.as_ref()),
            ("ipv6", self.ipv6.as_ref()),
            ("seenTime", self.seen_time.as_ref()),
            ("ssid", self.ssid.as_ref()),
        ]
    }
}

/// Webhook body that passed validation.
#[derive(Clone, PartialEq)]
pub struct IngestRequest {
    pub secret: String,
    pub version: ApiVersion,
    pub observation_type: ObservationType,
    pub ap_mac: Option<Value>,
    pub observations: Vec<ObservationRecord>,
}

impl fmt::Debug for IngestRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestRequest")
            .field("secret", &"hidden")
            .field("version", &self.version)
            .field("observation_type", &self.observation_type)
            .field("ap_mac", &self.ap_mac)
            .field("observations", &self.observations)
            .finish()
    }
}

/// Origin of a presence reading, as understood by the tracker registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Gps,
    Router,
    Bluetooth,
    BluetoothLe,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gps => "gps",
            Self::Router => "router",
            Self::Bluetooth => "bluetooth",
            Self::BluetoothLe => "bluetooth_le",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gps" => Some(Self::Gps),
            "router" => Some(Self::Router),
            "bluetooth" => Some(Self::Bluetooth),
            "bluetooth_le" => Some(Self::BluetoothLe),
            _ => None,
        }
    }
}

/// Canonical "device seen" message handed to the presence sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub mac: String,
    pub dev_id: String,
    pub host_name: String,
    pub source_type: SourceType,
    /// `(lat, lng)`; absent when the location service did not know the position.
    pub gps: Option<(Coordinate, Coordinate)>,
    /// Present exactly when `gps` is present.
    pub gps_accuracy: Option<u32>,
    pub attributes: BTreeMap<String, Value>,
}

impl PresenceUpdate {
    /// Produces a redacted JSON representation suitable for Tap output.
    pub fn redacted(&self) -> Value {
        json!({
            "dev_id": self.dev_id,
            "source_type": self.source_type,
            "has_gps": self.gps.is_some(),
            "gps_accuracy": self.gps_accuracy,
            "attributes": self.attributes.keys().collect::<Vec<_>>(),
        })
    }
}

/// Loose truthiness used by the vendor protocol for "field is set".
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
