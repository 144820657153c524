//! Logical devices and their state/command surface.
//!
//! A `Device` owns the normalised catalog for one logical endpoint on the
//! brain: states by id and name, commands by id and name. State records are
//! mutated only by the controller's dispatcher as `state_change_message`s
//! arrive; commands go the other way, wrapped into macro messages and sent
//! through the owning controller.

use crate::controller::ControllerShared;
use crate::deferred::Deferred;
use crate::driver::NormalizedDriver;
use crate::error::{BrainError, Result};
use crate::protocol::{self, MacroAction, StateChange};
use crate::types::{Command, DeviceInfo, NormalizedValue, State};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const STATE_CHANNEL_CAPACITY: usize = 128;

/// Payload of a per-device `STATE_CHANGED` event.
#[derive(Debug, Clone)]
pub struct StateChanged {
    /// State reference id
    pub id: String,
    /// Wire key, when the brain sends one
    pub key: Option<String>,
    /// State name
    pub name: String,
    /// New raw value
    pub value: String,
    /// New coerced value
    pub normalized_value: NormalizedValue,
}

#[derive(Default)]
struct Catalog {
    states_by_id: BTreeMap<String, State>,
    state_ids_by_name: BTreeMap<String, String>,
    custom_state_ids: BTreeSet<String>,
    commands_by_id: BTreeMap<String, Command>,
    command_ids_by_name: BTreeMap<String, String>,
}

impl Catalog {
    fn from_driver(driver: &NormalizedDriver) -> Self {
        let mut catalog = Self::default();
        for category in &driver.categories {
            for (id, state) in &category.states {
                catalog.state_ids_by_name.insert(state.name.clone(), id.clone());
                if state.is_custom_state {
                    catalog.custom_state_ids.insert(id.clone());
                }
                catalog.states_by_id.insert(id.clone(), state.clone());
            }
            for command in &category.commands {
                catalog
                    .command_ids_by_name
                    .insert(command.name.clone(), command.id.clone());
                catalog.commands_by_id.insert(command.id.clone(), command.clone());
            }
        }
        catalog
    }

    fn state_id(&self, key: &str) -> Option<String> {
        if self.states_by_id.contains_key(key) {
            Some(key.to_string())
        } else {
            self.state_ids_by_name.get(key).cloned()
        }
    }

    fn command(&self, key: &str) -> Option<&Command> {
        self.commands_by_id.get(key).or_else(|| {
            self.command_ids_by_name
                .get(key)
                .and_then(|id| self.commands_by_id.get(id))
        })
    }
}

/// A waiter blocked until a specific set of states has updated.
struct PendingWait {
    expected: BTreeSet<String>,
    seen: BTreeMap<String, String>,
    done: Deferred<BTreeMap<String, String>>,
}

/// A logical device on the brain.
///
/// Created during device enumeration and destroyed on explicit disconnect.
/// Handed out as `Arc<Device>`; object identity per device id is preserved
/// across re-enumeration.
pub struct Device {
    info: Mutex<DeviceInfo>,
    controller: Weak<ControllerShared>,
    self_ref: Weak<Device>,
    catalog: Mutex<Catalog>,
    driver_error: Mutex<Option<String>>,
    watch_requested: AtomicBool,
    watchers: AtomicUsize,
    changes_tx: broadcast::Sender<StateChanged>,
    first_change: Deferred<()>,
    pending: Mutex<Vec<PendingWait>>,
}

impl Device {
    pub(crate) fn new(info: DeviceInfo, controller: Weak<ControllerShared>) -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Arc::new_cyclic(|self_ref| Self {
            info: Mutex::new(info),
            controller,
            self_ref: self_ref.clone(),
            catalog: Mutex::new(Catalog::default()),
            driver_error: Mutex::new(None),
            watch_requested: AtomicBool::new(false),
            watchers: AtomicUsize::new(0),
            changes_tx,
            first_change: Deferred::new(),
            pending: Mutex::new(Vec::new()),
        })
    }

    // ── Identity ─────────────────────────────────────────────────────

    /// Device id.
    pub fn id(&self) -> String {
        self.info.lock().unwrap().id.clone()
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.info.lock().unwrap().name.clone()
    }

    /// Free-form description.
    pub fn description(&self) -> String {
        self.info.lock().unwrap().description.clone()
    }

    /// Id of the attached driver.
    pub fn driver_id(&self) -> String {
        self.info.lock().unwrap().driver_id.clone()
    }

    /// Version of the attached driver.
    pub fn driver_version(&self) -> i64 {
        self.info.lock().unwrap().driver_version
    }

    /// Full identity record as listed by the brain.
    pub fn info(&self) -> DeviceInfo {
        self.info.lock().unwrap().clone()
    }

    /// Whether this is the synthetic system device.
    pub fn is_system_device(&self) -> bool {
        self.info.lock().unwrap().device_type.as_deref() == Some("system")
    }

    /// The driver fetch error, if enumeration could not load this device's
    /// driver. The device stays usable for metadata.
    pub fn driver_error(&self) -> Option<String> {
        self.driver_error.lock().unwrap().clone()
    }

    // ── Enumeration plumbing (controller only) ───────────────────────

    pub(crate) fn update_info(&self, info: DeviceInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub(crate) fn set_driver(&self, driver: &NormalizedDriver) {
        *self.catalog.lock().unwrap() = Catalog::from_driver(driver);
        *self.driver_error.lock().unwrap() = None;
    }

    pub(crate) fn set_driver_error(&self, error: String) {
        *self.driver_error.lock().unwrap() = Some(error);
    }

    // ── States ───────────────────────────────────────────────────────

    /// All states by id.
    ///
    /// The first call arms the watch subscription and waits until at least
    /// one inbound state change has been applied; later calls return
    /// immediately.
    pub async fn states(&self) -> Result<BTreeMap<String, State>> {
        self.wait_for_fresh_states().await;
        Ok(self.catalog.lock().unwrap().states_by_id.clone())
    }

    /// Custom states by id. Empty unless this is the system device.
    pub async fn custom_states(&self) -> Result<BTreeMap<String, State>> {
        if !self.is_system_device() {
            return Ok(BTreeMap::new());
        }
        self.wait_for_fresh_states().await;
        let catalog = self.catalog.lock().unwrap();
        Ok(catalog
            .custom_state_ids
            .iter()
            .filter_map(|id| catalog.states_by_id.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    /// One state by reference id or name, with the same wait-once
    /// semantics as [`states`](Device::states).
    pub async fn state(&self, key: &str) -> Result<State> {
        self.wait_for_fresh_states().await;
        let catalog = self.catalog.lock().unwrap();
        catalog
            .state_id(key)
            .and_then(|id| catalog.states_by_id.get(&id).cloned())
            .ok_or_else(|| BrainError::InvalidState(key.to_string()))
    }

    /// Current state record without arming a watch or waiting.
    pub fn peek_state(&self, key: &str) -> Option<State> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .state_id(key)
            .and_then(|id| catalog.states_by_id.get(&id).cloned())
    }

    async fn wait_for_fresh_states(&self) {
        if self.first_change.is_settled() {
            return;
        }
        self.ensure_watching();
        self.first_change.wait().await;
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// All commands by id. Synchronous catalog lookup.
    pub fn commands(&self) -> BTreeMap<String, Command> {
        self.catalog.lock().unwrap().commands_by_id.clone()
    }

    /// One command by reference id or name.
    pub fn command(&self, key: &str) -> Result<Command> {
        self.catalog
            .lock()
            .unwrap()
            .command(key)
            .cloned()
            .ok_or_else(|| BrainError::InvalidCommand(key.to_string()))
    }

    /// Send a command and wait for its referenced states to update.
    ///
    /// Builds a macro with one action carrying the command's reference ids
    /// and the given static parameters (names uppercased, values
    /// stringified). Resolves once every state referenced by the command's
    /// dynamic parameters has received a subsequent inbound update, with a
    /// map of state id → new value.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use brainlink::BrainClient;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let client = BrainClient::new("127.0.0.1:8000", Default::default())?;
    /// let system = client.system_device().await?;
    /// let result = system.send_command("QUERY_SYSTEM_USE", None).await?;
    /// println!("system use: {:?}", result.get("SYSTEM_STATE"));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send_command(
        &self,
        key: &str,
        params: Option<&BTreeMap<String, Value>>,
    ) -> Result<BTreeMap<String, String>> {
        let (action, expected) = {
            let info = self.info.lock().unwrap().clone();
            let catalog = self.catalog.lock().unwrap();
            let command = catalog
                .command(key)
                .ok_or_else(|| BrainError::InvalidCommand(key.to_string()))?;

            let mut parameters = BTreeMap::new();
            if let Some(params) = params {
                for (name, value) in params {
                    parameters.insert(name.to_uppercase(), stringify(value));
                }
            }

            let expected: BTreeSet<String> =
                command.referenced_state_ids().into_iter().collect();
            let action = MacroAction {
                command_id: command.id.clone(),
                category_id: command.category.clone(),
                capability_id: command.capability.clone(),
                device_id: info.id.clone(),
                device_driver_id: info.driver_id.clone(),
                parameters,
            };
            (action, expected)
        };

        // State updates only flow while the device is watched.
        self.ensure_watching();
        let done = self.register_wait(expected);
        self.send(&protocol::macro_message(vec![action]))?;
        Ok(done.wait().await)
    }

    /// Set a custom state on the system device and wait for the applied
    /// change.
    ///
    /// Fails with `NotSystemDevice` on any other device and with
    /// `InvalidState` when the key does not resolve to a custom state.
    pub async fn set_custom_state(&self, key: &str, value: &str) -> Result<State> {
        if !self.is_system_device() {
            return Err(BrainError::NotSystemDevice);
        }

        let (action, state_id) = {
            let info = self.info.lock().unwrap().clone();
            let catalog = self.catalog.lock().unwrap();
            let state_id = catalog
                .state_id(key)
                .filter(|id| catalog.custom_state_ids.contains(id))
                .ok_or_else(|| BrainError::InvalidState(key.to_string()))?;
            let state = &catalog.states_by_id[&state_id];

            let action = MacroAction {
                command_id: state_id.clone(),
                category_id: state.category.clone(),
                capability_id: "set_custom_state".to_string(),
                device_id: info.id.clone(),
                device_driver_id: info.driver_id.clone(),
                parameters: BTreeMap::from([("New_Value".to_string(), value.to_string())]),
            };
            (action, state_id)
        };

        self.ensure_watching();
        let done = self.register_wait(BTreeSet::from([state_id.clone()]));
        self.send(&protocol::macro_message(vec![action]))?;
        done.wait().await;

        self.peek_state(&state_id)
            .ok_or_else(|| BrainError::InvalidState(state_id))
    }

    fn register_wait(&self, expected: BTreeSet<String>) -> Deferred<BTreeMap<String, String>> {
        let done = Deferred::new();
        if expected.is_empty() {
            // Nothing to wait for; resolve right away.
            done.resolve(BTreeMap::new());
            return done;
        }
        self.pending.lock().unwrap().push(PendingWait {
            expected,
            seen: BTreeMap::new(),
            done: done.clone(),
        });
        done
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to this device's `STATE_CHANGED` events.
    ///
    /// The first live subscription sends the watch message; dropping the
    /// last one sends unwatch. Resubscription on the same device while
    /// other subscriptions are live sends nothing.
    pub fn subscribe(&self) -> StateSubscription {
        self.watchers.fetch_add(1, Ordering::SeqCst);
        self.ensure_watching();
        StateSubscription {
            rx: self.changes_tx.subscribe(),
            device: self.self_ref.clone(),
        }
    }

    /// Send the watch message once. Idempotent until unwatched.
    pub(crate) fn ensure_watching(&self) {
        if self.watch_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id();
        if self.send(&protocol::watch_states_message(&id, true)).is_err() {
            // Not connected yet; allow a later call to retry.
            self.watch_requested.store(false, Ordering::SeqCst);
            return;
        }
        if let Some(controller) = self.controller.upgrade() {
            ControllerShared::note_watch_armed(&controller);
        }
    }

    /// Whether a watch subscription is currently requested.
    pub fn watch_requested(&self) -> bool {
        self.watch_requested.load(Ordering::SeqCst)
    }

    /// Re-send the watch message after a reconnect.
    pub(crate) fn rearm_watch(&self) {
        if !self.watch_requested.load(Ordering::SeqCst) {
            return;
        }
        let id = self.id();
        debug!(device = %id, "re-arming watch after reconnect");
        let _ = self.send(&protocol::watch_states_message(&id, true));
        if let Some(controller) = self.controller.upgrade() {
            controller.note_watch_rearmed();
        }
    }

    fn unwatch(&self) {
        if !self.watch_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        let id = self.id();
        debug!(device = %id, "unwatching");
        let _ = self.send(&protocol::watch_states_message(&id, false));
        if let Some(controller) = self.controller.upgrade() {
            controller.note_watch_released();
        }
    }

    /// Drop the watch without the wire message. Used on explicit
    /// disconnect, where the channel is already gone.
    pub(crate) fn detach(&self) {
        if !self.watch_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.note_watch_released();
        }
    }

    // ── Inbound (controller dispatcher only) ─────────────────────────

    /// Apply inbound state changes, emit `STATE_CHANGED`, and release any
    /// waiters whose expected states have all updated.
    pub(crate) fn process_state_changes(&self, changes: &[StateChange]) {
        let mut applied = false;
        for change in changes {
            let event = {
                let mut catalog = self.catalog.lock().unwrap();
                match catalog.states_by_id.get_mut(&change.state_id) {
                    Some(state) => {
                        state.apply(&change.state_value);
                        StateChanged {
                            id: state.id.clone(),
                            key: change.state_key.clone(),
                            name: state.name.clone(),
                            value: state.value.clone(),
                            normalized_value: state.normalized_value.clone(),
                        }
                    }
                    None => {
                        warn!(
                            device = %self.id(),
                            state = %change.state_id,
                            "state change for unknown state"
                        );
                        continue;
                    }
                }
            };

            applied = true;
            self.settle_pending(&event.id, &event.value);
            let _ = self.changes_tx.send(event);
        }

        if applied {
            self.first_change.resolve(());
        }
    }

    fn settle_pending(&self, state_id: &str, value: &str) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain_mut(|wait| {
            if wait.expected.contains(state_id) {
                wait.seen.insert(state_id.to_string(), value.to_string());
            }
            if wait.seen.len() == wait.expected.len() {
                wait.done.resolve(std::mem::take(&mut wait.seen));
                false
            } else {
                true
            }
        });
    }

    // ── Outbound ─────────────────────────────────────────────────────

    fn send(&self, message: &Value) -> Result<()> {
        match self.controller.upgrade() {
            Some(controller) => controller.send_channel_message(message),
            None => Err(BrainError::ClientNotInitialized(
                "device has no live controller".to_string(),
            )),
        }
    }

    pub(crate) fn on_watchers_changed(&self) {
        if self.watchers.load(Ordering::SeqCst) == 0 {
            self.unwatch();
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.lock().unwrap();
        f.debug_struct("Device")
            .field("id", &info.id)
            .field("name", &info.name)
            .field("driver_id", &info.driver_id)
            .finish()
    }
}

/// Live subscription to a device's `STATE_CHANGED` events.
///
/// Dropping the last subscription for a device sends the unwatch message.
pub struct StateSubscription {
    rx: broadcast::Receiver<StateChanged>,
    device: Weak<Device>,
}

impl StateSubscription {
    /// Receive the next state change.
    pub async fn recv(&mut self) -> Result<StateChanged> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => BrainError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                BrainError::ChannelError(format!("Lagged by {n} changes"))
            }
        })
    }

    /// Receive a state change if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Result<Option<StateChanged>> {
        match self.rx.try_recv() {
            Ok(change) => Ok(Some(change)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(BrainError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(BrainError::ChannelError(format!("Lagged by {n} changes")))
            }
        }
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.watchers.fetch_sub(1, Ordering::SeqCst);
            device.on_watchers_changed();
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{normalize, DriverDescriptor};
    use serde_json::json;
    use std::sync::Arc;

    fn test_device() -> Arc<Device> {
        let descriptor: DriverDescriptor = serde_json::from_value(json!({
            "categories": [{
                "name": "System",
                "reference_id": "CAT_SYSTEM",
                "states": [
                    {
                        "reference_id": "SYSTEM_STATE",
                        "name": "SYSTEM_STATE",
                        "type": "string",
                        "value": "OFF"
                    },
                    {
                        "reference_id": "VOLUME",
                        "name": "House Volume",
                        "type": "number",
                        "value": "10"
                    },
                    {
                        "reference_id": "CS_MODE",
                        "name": "House Mode",
                        "type": "string",
                        "value": "day",
                        "is_custom_state": true
                    }
                ],
                "capabilities": [{
                    "reference_id": "CAP_SYS",
                    "commands": [{
                        "name": "QUERY_SYSTEM_USE",
                        "codes": [{
                            "reference_id": "CMD_QUERY",
                            "state_references": ["SYSTEM_STATE"]
                        }]
                    }]
                }]
            }]
        }))
        .unwrap();

        let info: DeviceInfo = serde_json::from_value(json!({
            "id": "dev-sys",
            "name": "System",
            "driver_id": "drv-sys",
            "driver_version": 1,
            "device_type": "system"
        }))
        .unwrap();

        let device = Device::new(info, Weak::new());
        device.set_driver(&normalize(&descriptor));
        device
    }

    fn change(id: &str, value: &str) -> StateChange {
        StateChange {
            state_id: id.to_string(),
            state_key: None,
            state_name: Some(id.to_string()),
            state_value: value.to_string(),
            state_normalized_value: Some(value.to_string()),
        }
    }

    #[tokio::test]
    async fn state_changes_update_records_and_coerce() {
        let device = test_device();
        device.process_state_changes(&[change("VOLUME", "42")]);

        let state = device.peek_state("VOLUME").unwrap();
        assert_eq!(state.value, "42");
        assert_eq!(state.normalized_value, NormalizedValue::Number(42.0));

        // Lookup by name resolves to the same record
        let by_name = device.peek_state("House Volume").unwrap();
        assert_eq!(by_name.id, "VOLUME");
    }

    #[tokio::test]
    async fn state_changes_are_broadcast_to_subscribers() {
        let device = test_device();
        let mut sub = device.subscribe();

        device.process_state_changes(&[change("SYSTEM_STATE", "ON")]);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.id, "SYSTEM_STATE");
        assert_eq!(event.value, "ON");
    }

    #[tokio::test]
    async fn unknown_state_is_logged_not_applied() {
        let device = test_device();
        let mut sub = device.subscribe();

        device.process_state_changes(&[change("NOPE", "1"), change("VOLUME", "5")]);

        // Only the known state reaches subscribers
        let event = sub.recv().await.unwrap();
        assert_eq!(event.id, "VOLUME");
        assert!(sub.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn first_change_releases_state_waiters() {
        let device = test_device();
        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.state("SYSTEM_STATE").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        device.process_state_changes(&[change("SYSTEM_STATE", "ON")]);

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.value, "ON");

        // Subsequent calls return immediately
        let again = device.state("SYSTEM_STATE").await.unwrap();
        assert_eq!(again.value, "ON");
    }

    #[tokio::test]
    async fn pending_wait_resolves_when_all_expected_states_update() {
        let device = test_device();
        let done = device.register_wait(BTreeSet::from([
            "SYSTEM_STATE".to_string(),
            "VOLUME".to_string(),
        ]));

        device.process_state_changes(&[change("SYSTEM_STATE", "ON")]);
        assert!(!done.is_settled());

        device.process_state_changes(&[change("VOLUME", "33")]);
        let result = done.wait().await;
        assert_eq!(result["SYSTEM_STATE"], "ON");
        assert_eq!(result["VOLUME"], "33");
    }

    #[tokio::test]
    async fn custom_state_guards() {
        let device = test_device();

        // Unknown key
        let err = device.set_custom_state("NOPE", "x").await.unwrap_err();
        assert!(matches!(err, BrainError::InvalidState(_)));

        // Known but not custom
        let err = device.set_custom_state("VOLUME", "1").await.unwrap_err();
        assert!(matches!(err, BrainError::InvalidState(_)));

        // Non-system device refuses outright
        let other: DeviceInfo = serde_json::from_value(json!({
            "id": "dev-2", "name": "Display", "driver_id": "drv-2"
        }))
        .unwrap();
        let other = Device::new(other, Weak::new());
        let err = other.set_custom_state("CS_MODE", "x").await.unwrap_err();
        assert!(matches!(err, BrainError::NotSystemDevice));
    }

    #[tokio::test]
    async fn custom_states_empty_off_the_system_device() {
        let info: DeviceInfo = serde_json::from_value(json!({
            "id": "dev-2", "name": "Display", "driver_id": "drv-2"
        }))
        .unwrap();
        let device = Device::new(info, Weak::new());
        assert!(device.custom_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_lookup_by_id_and_name() {
        let device = test_device();
        assert_eq!(device.command("CMD_QUERY").unwrap().name, "QUERY_SYSTEM_USE");
        assert_eq!(device.command("QUERY_SYSTEM_USE").unwrap().id, "CMD_QUERY");
        assert!(matches!(
            device.command("NOPE").unwrap_err(),
            BrainError::InvalidCommand(_)
        ));
    }

    #[tokio::test]
    async fn send_without_controller_fails_cleanly() {
        let device = test_device();
        let err = device.send_command("CMD_QUERY", None).await.unwrap_err();
        assert!(matches!(err, BrainError::ClientNotInitialized(_)));
    }
}
