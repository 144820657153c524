//! The controller client: connection lifecycle, handshakes, dispatch.
//!
//! One `BrainClient` owns one brain. The client couples two transports: a
//! short REST bootstrap (`general`) and the long-lived message channel at
//! `ws://{endpoint}/client`. A single dispatcher task owns the channel's
//! read side and applies inbound messages in arrival order; everything else
//! talks to the brain by queueing frames on the write side.
//!
//! The handshake sequence (provisioned → express mode → authorization) is
//! modelled as a set of deferred completions created per connection attempt
//! and re-created on reconnect. Disconnecting is the only cancellation
//! mechanism: waiters on an old attempt's deferreds must carry their own
//! timeouts.

use crate::channel::{ChannelEvent, MessageChannel};
use crate::deferred::Deferred;
use crate::device::Device;
use crate::driver::{self, DriverDescriptor};
use crate::error::{BrainError, Result};
use crate::events::{ClientEvent, EventBus, EventStream};
use crate::protocol::{self, Inbound, SystemState};
use crate::rest::{CallOptions, RestClient};
use crate::status::ConnectionStatus;
use crate::types::{BrainOptions, ControllerInfo, DeviceInfo, SessionAuth};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hard ceiling on the remote-auth authorize handshake.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake deferreds for one connection attempt.
///
/// `aborted` settles when this attempt's set is torn down (channel drop,
/// disconnect, or a newer connect) so waiters can move to the live set
/// instead of hanging on an orphan.
#[derive(Clone)]
struct Handshakes {
    provisioned: Deferred<bool>,
    express_mode: Deferred<bool>,
    login_needed: Deferred<bool>,
    auth: Deferred<SessionAuth>,
    aborted: Deferred<()>,
}

impl Handshakes {
    fn new() -> Self {
        Self {
            provisioned: Deferred::new(),
            express_mode: Deferred::new(),
            login_needed: Deferred::new(),
            auth: Deferred::new(),
            aborted: Deferred::new(),
        }
    }
}

struct ConnState {
    /// None until the first transition; reads before that report Connecting
    status: Option<ConnectionStatus>,
    auth_required: bool,
    is_authenticated: bool,
    is_connected: bool,
    is_reconnecting: bool,
    manually_disconnected: bool,
    devices_enumerated: bool,
    sync_in_progress: bool,
    info: Option<ControllerInfo>,
    session: Option<SessionAuth>,
    handshakes: Handshakes,
}

pub(crate) struct ControllerShared {
    endpoint: String,
    opts: BrainOptions,
    rest: RestClient,
    bus: EventBus,
    conn: Mutex<ConnState>,
    channel: Mutex<Option<MessageChannel>>,
    channel_task: Mutex<Option<CancellationToken>>,
    devices: Mutex<BTreeMap<String, Arc<Device>>>,
    enumeration: Mutex<Option<Deferred<std::result::Result<(), String>>>>,
    watchdog_armed: AtomicBool,
    /// Devices with an armed watch; the watchdog stands down at zero
    watch_count: AtomicUsize,
    watch_tick: Mutex<Instant>,
}

/// Client for one brain.
///
/// Cheaply cloneable; all clones share the same connection, device map, and
/// event bus.
///
/// # Example
///
/// ```no_run
/// use brainlink::{BrainClient, BrainOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = BrainClient::new("127.0.0.1:8000", BrainOptions::default())?;
///     let status = client.connect_to_controller().await?;
///     println!("connected: {status}");
///
///     let system = client.system_device().await?;
///     let states = system.states().await?;
///     println!("{} states", states.len());
///
///     client.disconnect().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct BrainClient {
    pub(crate) shared: Arc<ControllerShared>,
}

impl BrainClient {
    /// Create a client for `endpoint` (`host:port`). No traffic happens
    /// until [`connect_to_controller`](Self::connect_to_controller).
    pub fn new(endpoint: impl Into<String>, opts: BrainOptions) -> Result<Self> {
        let endpoint = endpoint.into();
        let rest = RestClient::new(&endpoint, &opts)?;
        Ok(Self {
            shared: Arc::new(ControllerShared {
                endpoint,
                opts,
                rest,
                bus: EventBus::default(),
                conn: Mutex::new(ConnState {
                    status: None,
                    auth_required: false,
                    is_authenticated: false,
                    is_connected: false,
                    is_reconnecting: false,
                    manually_disconnected: false,
                    devices_enumerated: false,
                    sync_in_progress: false,
                    info: None,
                    session: None,
                    handshakes: Handshakes::new(),
                }),
                channel: Mutex::new(None),
                channel_task: Mutex::new(None),
                devices: Mutex::new(BTreeMap::new()),
                enumeration: Mutex::new(None),
                watchdog_armed: AtomicBool::new(false),
                watch_count: AtomicUsize::new(0),
                watch_tick: Mutex::new(Instant::now()),
            }),
        })
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// The cached controller info from the last bootstrap.
    pub fn controller_info(&self) -> Option<ControllerInfo> {
        self.shared.conn.lock().unwrap().info.clone()
    }

    /// The current session authorization, if authenticated.
    pub fn session(&self) -> Option<SessionAuth> {
        self.shared.conn.lock().unwrap().session.clone()
    }

    /// Whether the session is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.shared.conn.lock().unwrap().is_authenticated
    }

    /// Whether the message channel is open.
    pub fn is_connected(&self) -> bool {
        self.shared.conn.lock().unwrap().is_connected
    }

    /// Open a reactive stream over the client's events.
    pub fn events(&self) -> EventStream {
        self.shared.bus.stream()
    }

    /// Subscribe to raw broadcast delivery of client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.bus.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect: REST bootstrap, open the channel, run the handshakes.
    ///
    /// Resolves with the resulting connection status. A bootstrap failure
    /// resolves with [`ConnectionStatus::Failure`] rather than an error;
    /// an unprovisioned brain or disabled express mode fail with
    /// `NotProvisioned` / `ExpressModeDisabled`.
    pub async fn connect_to_controller(&self) -> Result<ConnectionStatus> {
        let shared = &self.shared;
        info!(endpoint = %shared.endpoint, "connecting to brain");

        let handshakes = {
            let mut conn = shared.conn.lock().unwrap();
            conn.manually_disconnected = false;
            conn.handshakes.aborted.resolve(());
            conn.handshakes = Handshakes::new();
            conn.handshakes.clone()
        };
        shared.set_status(ConnectionStatus::Connecting);

        match shared
            .rest
            .get::<ControllerInfo>("general", None, CallOptions::default())
            .await
        {
            Ok(controller_info) => {
                shared.conn.lock().unwrap().info = Some(controller_info);
            }
            Err(e) => {
                warn!("bootstrap failed: {e}");
                shared.set_status(ConnectionStatus::Failure);
                return Ok(ConnectionStatus::Failure);
            }
        }

        ControllerShared::spawn_channel_task(shared);

        if shared.opts.remote_authorization.is_some() {
            return match tokio::time::timeout(CONNECTION_TIMEOUT, handshakes.auth.wait()).await
            {
                Ok(_) => Ok(ConnectionStatus::Active),
                Err(_) => {
                    warn!("brain never authorized the remote-auth session");
                    self.disconnect().await;
                    Ok(self.shared.status())
                }
            };
        }

        // The channel task swaps in a fresh handshake set whenever the
        // socket fails to open or drops, and the dispatcher only ever
        // settles the live set. Each wait below re-reads the live set and
        // retries when the attempt it was watching is torn down, so a
        // failed first open cannot orphan this call.
        let provisioned = loop {
            let handshakes = shared.handshakes();
            tokio::select! {
                value = handshakes.provisioned.wait() => break value,
                _ = handshakes.aborted.wait() => {
                    if shared.conn.lock().unwrap().manually_disconnected {
                        return Ok(shared.status());
                    }
                }
            }
        };
        if !provisioned {
            return Err(BrainError::NotProvisioned);
        }

        let express = loop {
            let handshakes = shared.handshakes();
            tokio::select! {
                value = handshakes.express_mode.wait() => break value,
                _ = handshakes.aborted.wait() => {
                    if shared.conn.lock().unwrap().manually_disconnected {
                        return Ok(shared.status());
                    }
                }
            }
        };
        if !express {
            return Err(BrainError::ExpressModeDisabled);
        }

        // The dispatcher already submitted the default empty PIN; wait to
        // see whether the brain accepts it.
        loop {
            let handshakes = shared.handshakes();
            tokio::select! {
                _ = handshakes.auth.wait() => return Ok(ConnectionStatus::Active),
                _ = handshakes.login_needed.wait() => {
                    let Some(provider) = shared.opts.pin.clone() else {
                        return Ok(ConnectionStatus::Unauthorized);
                    };
                    let pin = provider.pin().await;

                    // A fresh deferred so a second rejection is observable.
                    let retry = Deferred::new();
                    shared.conn.lock().unwrap().handshakes.login_needed = retry.clone();

                    self.submit_pin(&pin)?;
                    tokio::select! {
                        _ = handshakes.auth.wait() => return Ok(ConnectionStatus::Active),
                        _ = retry.wait() => return Ok(ConnectionStatus::Unauthorized),
                        _ = handshakes.aborted.wait() => {}
                    }
                }
                _ = handshakes.aborted.wait() => {
                    if shared.conn.lock().unwrap().manually_disconnected {
                        return Ok(shared.status());
                    }
                }
            }
        }
    }

    /// Disconnect and clear the device map. Terminal until the next
    /// [`connect_to_controller`](Self::connect_to_controller).
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        info!(endpoint = %shared.endpoint, "disconnecting");

        let was_connected = {
            let mut conn = shared.conn.lock().unwrap();
            conn.manually_disconnected = true;
            conn.is_authenticated = false;
            conn.devices_enumerated = false;
            conn.session = None;
            conn.handshakes.aborted.resolve(());
            std::mem::replace(&mut conn.is_connected, false)
        };

        if let Some(cancel) = shared.channel_task.lock().unwrap().take() {
            cancel.cancel();
        }
        if let Some(channel) = shared.channel.lock().unwrap().take() {
            channel.close();
        }
        let devices: Vec<_> = {
            let mut map = shared.devices.lock().unwrap();
            let devices: Vec<_> = map.values().cloned().collect();
            map.clear();
            devices
        };
        // Stand their watches down so the watchdog count stays paired
        for device in &devices {
            device.detach();
        }
        *shared.enumeration.lock().unwrap() = None;
        shared.rest.set_token(None);

        if was_connected {
            shared.bus.publish(ClientEvent::WsClosed);
        }
        shared.set_status(ConnectionStatus::Disconnected);
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// All devices, enumerating lazily on first use.
    pub async fn devices(&self) -> Result<Vec<Arc<Device>>> {
        ControllerShared::ensure_devices(&self.shared).await?;
        Ok(self.shared.devices.lock().unwrap().values().cloned().collect())
    }

    /// One device by id or name.
    pub async fn device(&self, key: &str) -> Result<Arc<Device>> {
        ControllerShared::ensure_devices(&self.shared).await?;
        let devices = self.shared.devices.lock().unwrap();
        devices
            .get(key)
            .cloned()
            .or_else(|| devices.values().find(|d| d.name() == key).cloned())
            .ok_or_else(|| BrainError::DeviceNotFound(key.to_string()))
    }

    /// The synthetic system device.
    pub async fn system_device(&self) -> Result<Arc<Device>> {
        ControllerShared::ensure_devices(&self.shared).await?;
        self.shared
            .devices
            .lock()
            .unwrap()
            .values()
            .find(|d| d.is_system_device())
            .cloned()
            .ok_or_else(|| BrainError::DeviceNotFound("system".to_string()))
    }

    // ── Auxiliary RPC (fire-and-forget over the channel) ─────────────

    /// Submit a PIN. The outcome arrives as `AUTHORIZED` or `PIN_REQUIRED`.
    pub fn submit_pin(&self, pin: &str) -> Result<()> {
        self.shared.set_status(ConnectionStatus::Authorizing);
        self.shared
            .send_channel_message(&protocol::passcode_auth_message(pin))
    }

    /// Query the brain's provisioned/status record.
    pub fn query_status(&self) -> Result<()> {
        self.shared.send_channel_message(&protocol::brain_status_query())
    }

    /// Query the express-mode flag.
    pub fn query_express_mode(&self) -> Result<()> {
        self.shared.send_channel_message(&protocol::express_mode_query())
    }

    /// Query the handset list. The reply arrives as a handset event.
    pub fn query_handsets(&self) -> Result<()> {
        self.shared.send_channel_message(&protocol::wrapper_message(
            "GET",
            "handsets",
            Value::Null,
        ))
    }

    /// Query one handset's layout. The reply arrives as a handset event.
    pub fn query_handset_layout(&self, handset_id: &str) -> Result<()> {
        self.shared.send_channel_message(&protocol::wrapper_message(
            "GET",
            &format!("handsets/{handset_id}/layout"),
            Value::Null,
        ))
    }

    /// Reconfigure a handset.
    pub fn set_handset(&self, handset_id: &str, config: Value) -> Result<()> {
        self.shared
            .send_channel_message(&protocol::set_handset_message(handset_id, config))
    }

    /// Send a UI action.
    pub fn send_action(&self, action: Value) -> Result<()> {
        self.shared.send_channel_message(&protocol::ui_message(action))
    }

    /// Send a one-shot remote-authorization payload.
    pub fn send_remote_auth(&self, payload: &Value) -> Result<()> {
        self.shared
            .send_channel_message(&protocol::remote_auth_message(payload))
    }

    /// Subscribe or unsubscribe a device's state stream directly.
    ///
    /// Device-level subscription arbitration normally takes care of this;
    /// the raw form exists for tooling.
    pub fn watch_states(&self, device_id: &str, watch: bool) -> Result<()> {
        self.shared
            .send_channel_message(&protocol::watch_states_message(device_id, watch))
    }

    // ── REST conveniences ────────────────────────────────────────────

    /// Fetch the brain's status record over REST.
    pub async fn controller_status(&self) -> Result<Value> {
        self.shared
            .rest
            .get("status", None, CallOptions::default())
            .await
    }

    /// Ask the brain to restart its state machine (not the process).
    pub async fn restart(&self) -> Result<Value> {
        self.shared
            .rest
            .post("restart", None, CallOptions::default())
            .await
    }
}

impl ControllerShared {
    fn status(&self) -> ConnectionStatus {
        self.conn
            .lock()
            .unwrap()
            .status
            .unwrap_or(ConnectionStatus::Connecting)
    }

    /// Transition the connection state, emitting exactly one status event.
    /// A transition to the current state emits nothing.
    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        {
            let mut conn = self.conn.lock().unwrap();
            if conn.status == Some(status) {
                return;
            }
            conn.status = Some(status);
        }
        debug!(status = %status, "connection status changed");
        self.bus.publish(ClientEvent::ConnectionStatusChanged(status));
    }

    fn handshakes(&self) -> Handshakes {
        self.conn.lock().unwrap().handshakes.clone()
    }

    /// Queue a frame on the channel.
    pub(crate) fn send_channel_message(&self, message: &Value) -> Result<()> {
        match self.channel.lock().unwrap().as_ref() {
            Some(channel) => {
                channel.send_json(message);
                Ok(())
            }
            None => Err(BrainError::ClientNotInitialized(
                "message channel is not open".to_string(),
            )),
        }
    }

    // ── Channel task ─────────────────────────────────────────────────

    fn spawn_channel_task(this: &Arc<Self>) {
        let mut guard = this.channel_task.lock().unwrap();
        if guard.as_ref().is_some_and(|c| !c.is_cancelled()) {
            return;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        let shared = this.clone();
        tokio::spawn(async move {
            shared.channel_loop(cancel).await;
        });
    }

    /// Own the channel for the life of the connection: open → dispatch →
    /// on unexpected close, debounce and reconnect. This loop is the only
    /// pending reconnect timer; re-entering it replaces the previous wait.
    async fn channel_loop(self: Arc<Self>, cancel: CancellationToken) {
        let url = format!("ws://{}/client", self.endpoint);

        loop {
            match MessageChannel::open(&url).await {
                Ok((channel, mut events)) => {
                    if cancel.is_cancelled() {
                        // Disconnected while opening; disconnect owns cleanup
                        return;
                    }
                    *self.channel.lock().unwrap() = Some(channel);
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            event = events.recv() => match event {
                                Some(ChannelEvent::Open) => self.on_channel_open(),
                                Some(ChannelEvent::Message(text)) => Self::dispatch(&self, &text),
                                Some(ChannelEvent::Error(e)) => {
                                    error!("channel error: {e}");
                                }
                                Some(ChannelEvent::Closed) | None => break,
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("failed to open message channel: {e}");
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            self.channel.lock().unwrap().take();
            let was_connected = {
                let mut conn = self.conn.lock().unwrap();
                std::mem::replace(&mut conn.is_connected, false)
            };
            if was_connected {
                self.bus.publish(ClientEvent::WsClosed);
            }

            if cancel.is_cancelled() || self.conn.lock().unwrap().manually_disconnected {
                return;
            }

            {
                let mut conn = self.conn.lock().unwrap();
                conn.is_reconnecting = true;
                conn.is_authenticated = false;
                // Unblock waiters on this attempt before swapping it out
                conn.handshakes.aborted.resolve(());
                conn.handshakes = Handshakes::new();
            }
            self.set_status(ConnectionStatus::Reconnecting);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.opts.reconnect_wait_time) => {}
            }
            self.set_status(ConnectionStatus::Connecting);
        }
    }

    fn on_channel_open(&self) {
        self.conn.lock().unwrap().is_connected = true;
        self.bus.publish(ClientEvent::WsConnected);

        if let Some(payload) = self.opts.remote_authorization.clone() {
            let _ = self.send_channel_message(&protocol::remote_auth_message(&payload));
        } else {
            let _ = self.send_channel_message(&protocol::brain_status_query());
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn dispatch(this: &Arc<Self>, text: &str) {
        let (inbound, raw) = match protocol::parse_inbound(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping unparseable frame: {e}");
                return;
            }
        };
        this.bus.publish(ClientEvent::WsMessage(raw));

        match inbound {
            Inbound::Status(status) => {
                this.bus.publish(ClientEvent::StatusMessage(status.clone()));
                if this.opts.remote_authorization.is_some() {
                    // Status handling under remote auth is deliberately inert
                    return;
                }
                let handshakes = this.handshakes();
                handshakes.provisioned.resolve(status.provisioned);
                if status.provisioned {
                    let _ = this.send_channel_message(&protocol::express_mode_query());
                }
            }
            Inbound::StatusColor(raw) => {
                this.bus.publish(ClientEvent::ColorMessage(raw));
            }
            Inbound::ExpressMode { enabled } => {
                this.handshakes().express_mode.resolve(enabled);
                this.bus.publish(ClientEvent::ExpressMode { enabled });
                if enabled {
                    // Try the default empty PIN first; a rejection surfaces
                    // as PIN_REQUIRED.
                    this.set_status(ConnectionStatus::Authorizing);
                    let _ =
                        this.send_channel_message(&protocol::passcode_auth_message(""));
                }
            }
            Inbound::Unauthorized => {
                {
                    let mut conn = this.conn.lock().unwrap();
                    conn.auth_required = true;
                    conn.is_authenticated = false;
                }
                this.set_status(ConnectionStatus::Unauthorized);
                this.bus.publish(ClientEvent::PinRequired);
                this.handshakes().login_needed.resolve(true);
            }
            Inbound::Authorized(auth) => {
                this.rest.set_token(Some(auth.token.clone()));
                let was_reconnecting = {
                    let mut conn = this.conn.lock().unwrap();
                    conn.session = Some(auth.clone());
                    conn.is_authenticated = true;
                    conn.auth_required = false;
                    std::mem::replace(&mut conn.is_reconnecting, false)
                };
                this.set_status(ConnectionStatus::Active);
                this.bus.publish(ClientEvent::Authorized(auth.clone()));
                this.handshakes().auth.resolve(auth);

                if was_reconnecting {
                    let devices: Vec<_> =
                        this.devices.lock().unwrap().values().cloned().collect();
                    for device in devices {
                        device.rearm_watch();
                    }
                }
            }
            Inbound::StateChanges(msg) => {
                let device = this.devices.lock().unwrap().get(&msg.device_id).cloned();
                match device {
                    Some(device) => {
                        if device.is_system_device() {
                            *this.watch_tick.lock().unwrap() = Instant::now();
                        }
                        device.process_state_changes(&msg.state_changes);
                    }
                    None => {
                        debug!(device = %msg.device_id, "state change for unknown device");
                    }
                }
            }
            Inbound::SystemState(state) => Self::on_system_state(this, state),
            Inbound::Handset { kind, raw } => {
                this.bus.publish(ClientEvent::HandsetMessage { kind, raw });
            }
            Inbound::Unknown { kind, raw } => {
                this.bus.publish(ClientEvent::BrainEvent { kind, raw });
            }
        }
    }

    fn on_system_state(this: &Arc<Self>, state: SystemState) {
        if state.is_synchronizing() {
            this.conn.lock().unwrap().sync_in_progress = true;
            this.set_status(ConnectionStatus::Synchronizing);
        } else if state.is_active() {
            let re_enumerate = {
                let mut conn = this.conn.lock().unwrap();
                if conn.status != Some(ConnectionStatus::Synchronizing) {
                    return;
                }
                conn.sync_in_progress = false;
                conn.devices_enumerated
            };
            this.set_status(ConnectionStatus::Active);
            if re_enumerate {
                let shared = this.clone();
                tokio::spawn(async move {
                    if let Err(e) = ControllerShared::enumerate_devices(&shared).await {
                        warn!("re-enumeration after sync failed: {e}");
                    }
                });
            }
        } else if state.is_failed() {
            this.set_status(ConnectionStatus::Failure);
        } else {
            debug!(?state, "ignoring unrecognised system state");
        }
    }

    // ── Enumeration ──────────────────────────────────────────────────

    /// Run device enumeration once; concurrent callers share the attempt.
    async fn ensure_devices(this: &Arc<Self>) -> Result<()> {
        let (deferred, runner) = {
            let mut guard = this.enumeration.lock().unwrap();
            match guard.as_ref() {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fresh = Deferred::new();
                    *guard = Some(fresh.clone());
                    (fresh, true)
                }
            }
        };

        if !runner {
            return deferred.wait().await.map_err(BrainError::ChannelError);
        }

        match Self::enumerate_devices(this).await {
            Ok(()) => {
                this.conn.lock().unwrap().devices_enumerated = true;
                deferred.resolve(Ok(()));
                Ok(())
            }
            Err(e) => {
                deferred.resolve(Err(e.to_string()));
                // Allow a later request to retry from scratch.
                *this.enumeration.lock().unwrap() = None;
                Err(e)
            }
        }
    }

    /// Fetch the device list and each device's driver. Driver failures are
    /// per-device; the device stays usable for metadata.
    async fn enumerate_devices(this: &Arc<Self>) -> Result<()> {
        debug!("enumerating devices");
        let infos: Vec<DeviceInfo> = this.rest
            .get(
                "devices",
                None,
                CallOptions {
                    auto_retry: true,
                    ..Default::default()
                },
            )
            .await?;

        info!(count = infos.len(), "devices listed");

        for device_info in infos {
            let device = {
                let mut devices = this.devices.lock().unwrap();
                match devices.get(&device_info.id) {
                    Some(existing) => {
                        existing.update_info(device_info.clone());
                        existing.clone()
                    }
                    None => {
                        let device =
                            Device::new(device_info.clone(), Arc::downgrade(this));
                        devices.insert(device_info.id.clone(), device.clone());
                        device
                    }
                }
            };

            let path = format!("device-drivers/{}", device_info.driver_id);
            let args = json!({ "version": device_info.driver_version });
            match this.rest
                .get::<DriverDescriptor>(&path, Some(&args), CallOptions::default())
                .await
            {
                Ok(descriptor) => device.set_driver(&driver::normalize(&descriptor)),
                Err(e) => {
                    warn!(device = %device_info.id, "driver fetch failed: {e}");
                    device.set_driver_error(e.to_string());
                }
            }
        }

        Ok(())
    }

    // ── Watchdog ─────────────────────────────────────────────────────

    /// Called by a device when its watch transitions to armed. Starts the
    /// watchdog when the first device subscribes.
    pub(crate) fn note_watch_armed(this: &Arc<Self>) {
        *this.watch_tick.lock().unwrap() = Instant::now();
        this.watch_count.fetch_add(1, Ordering::SeqCst);
        if this.watchdog_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("watchdog armed");
        let shared = this.clone();
        tokio::spawn(async move {
            shared.watchdog_loop().await;
        });
    }

    /// Called by a device when its watch transitions to released. The
    /// watchdog stands down once no device is watched.
    pub(crate) fn note_watch_released(&self) {
        self.watch_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Called by a device re-sending its watch after a reconnect; the
    /// watch never transitioned, only the tick needs resetting.
    pub(crate) fn note_watch_rearmed(&self) {
        *self.watch_tick.lock().unwrap() = Instant::now();
    }

    /// Some brain states stop emitting state changes without closing the
    /// channel. When the system device's once-per-second tick goes quiet
    /// for the full window, a REST `restart` kicks the pipeline without
    /// tearing down the session. An unwatched brain legitimately goes
    /// quiet, so the loop stands down whenever no device holds a watch.
    async fn watchdog_loop(self: Arc<Self>) {
        let window = self.opts.watchdog_timeout;
        loop {
            if self.conn.lock().unwrap().manually_disconnected {
                self.watchdog_armed.store(false, Ordering::SeqCst);
                return;
            }

            if self.watch_count.load(Ordering::SeqCst) == 0 {
                debug!("no watched devices; watchdog standing down");
                self.watchdog_armed.store(false, Ordering::SeqCst);
                // A subscribe can race the stand-down; take the arm back
                // rather than leaving two loops running.
                if self.watch_count.load(Ordering::SeqCst) > 0
                    && !self.watchdog_armed.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                return;
            }

            let elapsed = self.watch_tick.lock().unwrap().elapsed();
            if elapsed >= window {
                warn!(?elapsed, "system device went quiet; requesting restart");
                if let Err(e) = self
                    .rest
                    .post::<Value>("restart", None, CallOptions::default())
                    .await
                {
                    warn!("restart request failed: {e}");
                }
                *self.watch_tick.lock().unwrap() = Instant::now();
            } else {
                tokio::time::sleep(window - elapsed).await;
            }
        }
    }
}
