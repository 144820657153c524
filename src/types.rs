use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Value type of a state as declared by its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Free-form text
    #[default]
    String,
    /// Numeric; `normalized_value` is coerced to a number
    Number,
    /// Boolean, carried as text on the wire
    Boolean,
    /// Any other declared type; treated as text
    #[serde(other)]
    Other,
}

/// A state value after normalisation.
///
/// Everything is a string on the wire; states declared `type="number"` are
/// coerced to a number, everything else passes through as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NormalizedValue {
    /// Coerced numeric value
    Number(f64),
    /// Pass-through text value
    Text(String),
}

impl NormalizedValue {
    /// The value as text, regardless of coercion.
    pub fn as_text(&self) -> String {
        match self {
            Self::Number(n) => {
                // Render whole numbers without a trailing ".0"
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Self::Text(s) => s.clone(),
        }
    }

    /// The numeric value, if coerced.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

/// Coerce a raw wire value according to the state's declared kind.
pub(crate) fn normalize_value(kind: StateKind, raw: &str) -> NormalizedValue {
    if kind == StateKind::Number {
        if let Ok(n) = raw.trim().parse::<f64>() {
            return NormalizedValue::Number(n);
        }
    }
    NormalizedValue::Text(raw.to_string())
}

/// A named, typed observable value on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Stable reference id, unique within the device
    pub id: String,
    /// Human-readable name from the driver
    pub name: String,
    /// Declared value type
    #[serde(rename = "type", default)]
    pub kind: StateKind,
    /// Raw value as delivered by the brain (always a string)
    #[serde(default)]
    pub value: String,
    /// Coerced value (numeric for `type="number"`)
    pub normalized_value: NormalizedValue,
    /// Reference id of the owning driver category
    #[serde(default)]
    pub category: String,
    /// Whether this is a space-author-defined custom state
    #[serde(default)]
    pub is_custom_state: bool,
    /// Opaque authoring-tool payload on custom states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Value>,
}

impl State {
    /// Apply an inbound change, re-running coercion.
    pub(crate) fn apply(&mut self, value: &str) {
        self.value = value.to_string();
        self.normalized_value = normalize_value(self.kind, value);
    }
}

/// One parameter of a [`Command`].
///
/// Dynamic parameters point at a state record (sending the command changes
/// the referenced state); static parameters carry a declared type and
/// constraints only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandParam {
    /// Referenced state id for dynamic parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Declared primitive type for static parameters
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Declared constraints for static parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

/// An invocable action on a device. Immutable once enumerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Stable reference id (one per driver code)
    pub id: String,
    /// Command name, used for name-based lookup
    pub name: String,
    /// Reference id of the owning category
    pub category: String,
    /// Reference id of the owning capability
    pub capability: String,
    /// Parameters by name
    #[serde(default)]
    pub params: BTreeMap<String, CommandParam>,
    /// Snapshot of the state records referenced by dynamic parameters
    #[serde(default)]
    pub states: BTreeMap<String, State>,
}

impl Command {
    /// Ids of the states this command's dynamic parameters reference.
    pub fn referenced_state_ids(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }
}

/// Identity of a logical device as listed by the brain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id, unique on the brain
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Id of the attached driver
    #[serde(default)]
    pub driver_id: String,
    /// Version of the attached driver
    #[serde(default)]
    pub driver_version: i64,
    /// Device kind; the synthetic system device is `"system"`
    #[serde(default)]
    pub device_type: Option<String>,
    /// Creation metadata as delivered
    #[serde(default)]
    pub created: Option<String>,
    /// Everything else the brain sends
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// Controller info record from the `general` bootstrap endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerInfo {
    /// Brain display name
    #[serde(default)]
    pub name: Option<String>,
    /// Firmware version string
    #[serde(default)]
    pub version: Option<String>,
    /// Whether a space is provisioned
    #[serde(default)]
    pub provisioned: Option<bool>,
    /// Everything else the brain sends
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// Session authorization record stored after `authorized_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAuth {
    /// Id of the brain that granted the session
    #[serde(default)]
    pub brain_id: String,
    /// Session id
    #[serde(default)]
    pub session_id: String,
    /// Bearer token for subsequent REST calls
    #[serde(default)]
    pub token: String,
}

/// Source of the PIN used during authorization.
#[derive(Clone)]
pub enum PinProvider {
    /// A fixed PIN
    Static(String),
    /// An async supplier, invoked only when the brain rejects the empty PIN
    Supplier(Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>),
}

impl PinProvider {
    pub(crate) async fn pin(&self) -> String {
        match self {
            Self::Static(pin) => pin.clone(),
            Self::Supplier(f) => f().await,
        }
    }
}

impl fmt::Debug for PinProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("PinProvider::Static(..)"),
            Self::Supplier(_) => f.write_str("PinProvider::Supplier(..)"),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct BrainOptions {
    /// Delay before re-opening the channel after an unexpected close
    pub reconnect_wait_time: Duration,
    /// Per-call REST deadline
    pub http_request_timeout: Duration,
    /// Recognized for compatibility; the usage reporter is an external
    /// collaborator and not part of this crate
    pub disable_analytics: bool,
    /// Opaque pre-auth payload; when present it replaces the PIN flow and
    /// enforces a hard authorize deadline
    pub remote_authorization: Option<serde_json::Value>,
    /// PIN source, used when the brain rejects the default empty PIN
    pub pin: Option<PinProvider>,
    /// Watchdog deadline; a restart is requested when no system-device
    /// state change arrives within this window
    pub watchdog_timeout: Duration,
}

impl Default for BrainOptions {
    fn default() -> Self {
        Self {
            reconnect_wait_time: Duration::from_millis(1000),
            http_request_timeout: Duration::from_millis(1000),
            disable_analytics: false,
            remote_authorization: None,
            pin: None,
            watchdog_timeout: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_states_are_coerced() {
        assert_eq!(
            normalize_value(StateKind::Number, "42"),
            NormalizedValue::Number(42.0)
        );
        assert_eq!(
            normalize_value(StateKind::Number, "-3.5"),
            NormalizedValue::Number(-3.5)
        );
        // Unparseable numbers pass through as text
        assert_eq!(
            normalize_value(StateKind::Number, "n/a"),
            NormalizedValue::Text("n/a".into())
        );
    }

    #[test]
    fn non_number_states_pass_through() {
        assert_eq!(
            normalize_value(StateKind::String, "42"),
            NormalizedValue::Text("42".into())
        );
        assert_eq!(
            normalize_value(StateKind::Boolean, "true"),
            NormalizedValue::Text("true".into())
        );
    }

    #[test]
    fn apply_reruns_coercion() {
        let mut state = State {
            id: "VOLUME".into(),
            name: "Volume".into(),
            kind: StateKind::Number,
            value: "0".into(),
            normalized_value: NormalizedValue::Number(0.0),
            category: "CAT".into(),
            is_custom_state: false,
            custom_data: None,
        };
        state.apply("55");
        assert_eq!(state.value, "55");
        assert_eq!(state.normalized_value, NormalizedValue::Number(55.0));
    }

    #[test]
    fn unknown_state_kind_deserializes_as_other() {
        let kind: StateKind = serde_json::from_str("\"duration\"").unwrap();
        assert_eq!(kind, StateKind::Other);
    }

    #[test]
    fn device_info_keeps_extra_fields() {
        let info: DeviceInfo = serde_json::from_value(serde_json::json!({
            "id": "dev-1",
            "name": "Projector",
            "driver_id": "drv-9",
            "driver_version": 3,
            "rack_position": "A4"
        }))
        .unwrap();
        assert_eq!(info.id, "dev-1");
        assert_eq!(info.driver_version, 3);
        assert_eq!(info.extra["rack_position"], "A4");
    }
}
