//! Wire messages for the brain's bidirectional channel.
//!
//! Every frame is a JSON object with a mandatory `type` tag. Outbound
//! messages are built through the constructors here so the tag strings live
//! in one place; inbound frames are discriminated on the tag and parsed into
//! typed structs, with unknown types preserved raw so the client can emit
//! them generically.

use crate::error::Result;
use crate::types::SessionAuth;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Outbound ─────────────────────────────────────────────────────────

/// One action inside a `send_macro_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroAction {
    pub command_id: String,
    pub category_id: String,
    pub capability_id: String,
    pub device_id: String,
    pub device_driver_id: String,
    /// Static parameters: names uppercased, values stringified
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Build a `send_macro_message` wrapping the given actions.
pub fn macro_message(actions: Vec<MacroAction>) -> Value {
    json!({
        "type": "send_macro_message",
        "macro": { "actions": actions },
    })
}

/// Build a `watch_states_message`.
///
/// The `watched_states` field is always present and always empty; the brain
/// ignores it but older firmware rejects frames without it.
pub fn watch_states_message(device_id: &str, watch: bool) -> Value {
    json!({
        "type": "watch_states_message",
        "device_id": device_id,
        "watch": watch,
        "watched_states": [],
    })
}

/// Build a `passcode_auth_msg` carrying the given PIN.
pub fn passcode_auth_message(pin: &str) -> Value {
    json!({
        "type": "passcode_auth_msg",
        "passcode": pin,
    })
}

/// Build the provisioned/status query.
pub fn brain_status_query() -> Value {
    json!({ "type": "get_brain_stat_message" })
}

/// Build the express-mode query.
pub fn express_mode_query() -> Value {
    json!({ "type": "get_express_mode_flag_msg" })
}

/// Build a `remote_auth_msg` carrying an opaque pre-auth payload.
pub fn remote_auth_message(payload: &Value) -> Value {
    json!({
        "type": "remote_auth_msg",
        "payload": payload,
    })
}

/// Build a `ui_message` carrying a UI action.
pub fn ui_message(action: Value) -> Value {
    json!({
        "type": "ui_message",
        "action": action,
    })
}

/// Build a `set_handset_message`.
pub fn set_handset_message(handset_id: &str, config: Value) -> Value {
    json!({
        "type": "set_handset_message",
        "handset_id": handset_id,
        "config": config,
    })
}

/// Build a `ws_message_wrapper` envelope: a REST-shaped call carried over
/// the channel. The response comes back as a routed event, not a reply.
pub fn wrapper_message(method: &str, path: &str, body: Value) -> Value {
    json!({
        "id": Uuid::new_v4(),
        "method": method,
        "path": path,
        "body": body,
        "type": "ws_message_wrapper",
    })
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Status record from a `brain_status_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainStatus {
    #[serde(default)]
    pub provisioned: bool,
    #[serde(flatten)]
    pub extra: Value,
}

/// One state change inside a `state_change_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state_id: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub state_name: Option<String>,
    #[serde(default)]
    pub state_value: String,
    #[serde(default)]
    pub state_normalized_value: Option<String>,
}

/// A `state_change_message`: changes routed to one device.
#[derive(Debug, Clone, Deserialize)]
pub struct StateChangeMessage {
    pub device_id: String,
    #[serde(default)]
    pub state_changes: Vec<StateChange>,
}

/// System lifecycle states reported by `system_state_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    BrainSync,
    SpaceSync,
    ParseSpace,
    Upgrading,
    ResourcesSync,
    Activating,
    Initializing,
    ActiveOnline,
    ActiveOffline,
    Inactive,
    Error,
    #[serde(other)]
    Unknown,
}

impl SystemState {
    /// States during which the brain is rebuilding its space.
    pub fn is_synchronizing(&self) -> bool {
        matches!(
            self,
            Self::BrainSync
                | Self::SpaceSync
                | Self::ParseSpace
                | Self::Upgrading
                | Self::ResourcesSync
                | Self::Activating
                | Self::Initializing
        )
    }

    /// States in which the brain serves traffic normally.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::ActiveOnline | Self::ActiveOffline)
    }

    /// Fatal states.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Inactive | Self::Error)
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// `brain_status_message`
    Status(BrainStatus),
    /// `brain_status_color_msg`
    StatusColor(Value),
    /// `express_mode_flag_msg`
    ExpressMode { enabled: bool },
    /// `unauthorized_message`
    Unauthorized,
    /// `authorized_message`
    Authorized(SessionAuth),
    /// `state_change_message`
    StateChanges(StateChangeMessage),
    /// `system_state_message`
    SystemState(SystemState),
    /// Any `handset_*` message
    Handset { kind: String, raw: Value },
    /// Everything else
    Unknown { kind: String, raw: Value },
}

/// Parse an inbound text frame.
///
/// Returns the typed message and the raw JSON (the raw form is emitted as a
/// `WS_MESSAGE` event regardless of kind).
pub fn parse_inbound(text: &str) -> Result<(Inbound, Value)> {
    let raw: Value = serde_json::from_str(text)?;
    let kind = raw
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let inbound = match kind.as_str() {
        "brain_status_message" => Inbound::Status(serde_json::from_value(raw.clone())?),
        "brain_status_color_msg" => Inbound::StatusColor(raw.clone()),
        "express_mode_flag_msg" => Inbound::ExpressMode {
            enabled: express_enabled(&raw),
        },
        "unauthorized_message" => Inbound::Unauthorized,
        "authorized_message" => Inbound::Authorized(serde_json::from_value(raw.clone())?),
        "state_change_message" => Inbound::StateChanges(serde_json::from_value(raw.clone())?),
        "system_state_message" => {
            let state = raw
                .get("state")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or(SystemState::Unknown);
            Inbound::SystemState(state)
        }
        k if k.starts_with("handset_") => Inbound::Handset {
            kind,
            raw: raw.clone(),
        },
        _ => Inbound::Unknown {
            kind,
            raw: raw.clone(),
        },
    };

    Ok((inbound, raw))
}

// Some firmware sends the flag as the string "true" rather than a bool.
fn express_enabled(raw: &Value) -> bool {
    match raw.get("enabled") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}
