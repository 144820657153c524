#![allow(dead_code)]
//! Mock brain for integration testing.
//!
//! Serves the REST surface (`/api/v1/...`) with minimal hand-rolled HTTP
//! and upgrades `/client` to a WebSocket speaking the brain's message
//! protocol. Scenario knobs (express mode, accepted PIN, restart-driven
//! sync) live on the shared state so tests can script behavior.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const SYSTEM_DEVICE_ID: &str = "device-system";
pub const AVR_DEVICE_ID: &str = "device-avr";

const TICK_INTERVAL: Duration = Duration::from_millis(200);
const CLOSE_SENTINEL: &str = "__close__";

/// Scenario configuration.
#[derive(Debug, Clone)]
pub struct MockBrainConfig {
    pub provisioned: bool,
    pub express_enabled: bool,
    /// `None` accepts any PIN including the empty default
    pub accepted_pin: Option<String>,
    /// Push a `brain_sync` → `active_online` sequence after POST restart
    pub sync_on_restart: bool,
}

impl Default for MockBrainConfig {
    fn default() -> Self {
        Self {
            provisioned: true,
            express_enabled: true,
            accepted_pin: None,
            sync_on_restart: true,
        }
    }
}

pub struct BrainState {
    config: MockBrainConfig,
    pub restart_hits: AtomicUsize,
    pub device_list_hits: AtomicUsize,
    pub watch_msgs: AtomicUsize,
    pub unwatch_msgs: AtomicUsize,
    ticking: AtomicBool,
    ws_enabled: AtomicBool,
    seconds: AtomicU64,
    system_state_value: Mutex<String>,
    custom_values: Mutex<HashMap<String, String>>,
    watched: Mutex<HashSet<String>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    devices: Mutex<Value>,
    drivers: Mutex<HashMap<String, Value>>,
}

pub struct MockBrain {
    addr: SocketAddr,
    pub state: Arc<BrainState>,
    accept_handle: JoinHandle<()>,
    tick_handle: JoinHandle<()>,
}

impl MockBrain {
    pub async fn start(config: MockBrainConfig) -> Self {
        let state = Arc::new(BrainState {
            config,
            restart_hits: AtomicUsize::new(0),
            device_list_hits: AtomicUsize::new(0),
            watch_msgs: AtomicUsize::new(0),
            unwatch_msgs: AtomicUsize::new(0),
            ticking: AtomicBool::new(true),
            ws_enabled: AtomicBool::new(true),
            seconds: AtomicU64::new(0),
            system_state_value: Mutex::new("OFF".to_string()),
            custom_values: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashSet::new()),
            sessions: Mutex::new(Vec::new()),
            devices: Mutex::new(default_devices()),
            drivers: Mutex::new(default_drivers()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_state = state.clone();
        let accept_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        // The system device's once-per-second tick, sped up for tests.
        let tick_state = state.clone();
        let tick_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                if !tick_state.ticking.load(Ordering::SeqCst) {
                    continue;
                }
                if !tick_state
                    .watched
                    .lock()
                    .unwrap()
                    .contains(SYSTEM_DEVICE_ID)
                {
                    continue;
                }
                let n = tick_state.seconds.fetch_add(1, Ordering::SeqCst) + 1;
                tick_state.push_state_change(SYSTEM_DEVICE_ID, "SECOND_STATE", &n.to_string());
            }
        });

        Self {
            addr,
            state,
            accept_handle,
            tick_handle,
        }
    }

    /// `host:port` endpoint string for the client.
    pub fn endpoint(&self) -> String {
        format!("{}", self.addr)
    }

    /// Force-close every open WebSocket session.
    pub fn drop_connections(&self) {
        let sessions = self.state.sessions.lock().unwrap();
        for tx in sessions.iter() {
            let _ = tx.send(CLOSE_SENTINEL.to_string());
        }
    }

    /// Pause or resume the system device's tick stream.
    pub fn set_ticking(&self, on: bool) {
        self.state.ticking.store(on, Ordering::SeqCst);
    }

    /// Accept or reject WebSocket upgrades on `/client`. While rejected,
    /// upgrade attempts get their connection dropped.
    pub fn set_ws_enabled(&self, on: bool) {
        self.state.ws_enabled.store(on, Ordering::SeqCst);
    }

    /// Replace a driver descriptor (takes effect on the next enumeration).
    pub fn set_driver(&self, driver_id: &str, descriptor: Value) {
        self.state
            .drivers
            .lock()
            .unwrap()
            .insert(driver_id.to_string(), descriptor);
    }

    pub fn restart_hits(&self) -> usize {
        self.state.restart_hits.load(Ordering::SeqCst)
    }

    pub fn device_list_hits(&self) -> usize {
        self.state.device_list_hits.load(Ordering::SeqCst)
    }

    pub fn watch_msgs(&self) -> usize {
        self.state.watch_msgs.load(Ordering::SeqCst)
    }

    pub fn unwatch_msgs(&self) -> usize {
        self.state.unwatch_msgs.load(Ordering::SeqCst)
    }

    pub fn stop(self) {
        self.accept_handle.abort();
        self.tick_handle.abort();
    }
}

impl BrainState {
    fn push_all(&self, message: &Value) {
        let text = message.to_string();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|tx| tx.send(text.clone()).is_ok());
    }

    fn push_state_change(&self, device_id: &str, state_id: &str, value: &str) {
        self.push_all(&json!({
            "type": "state_change_message",
            "device_id": device_id,
            "state_changes": [{
                "state_id": state_id,
                "state_name": state_id,
                "state_value": value,
                "state_normalized_value": value,
            }],
        }));
    }

    fn push_system_state(&self, state: &str) {
        self.push_all(&json!({
            "type": "system_state_message",
            "state": state,
        }));
    }
}

// ── Connection handling ──────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, state: Arc<BrainState>) {
    let mut head = [0u8; 512];
    let n = match stream.peek(&mut head).await {
        Ok(n) => n,
        Err(_) => return,
    };
    let head = String::from_utf8_lossy(&head[..n]);

    if head.starts_with("GET /client") {
        if !state.ws_enabled.load(Ordering::SeqCst) {
            return;
        }
        handle_ws(stream, state).await;
    } else {
        handle_http(stream, state).await;
    }
}

async fn handle_ws(stream: TcpStream, state: Arc<BrainState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.sessions.lock().unwrap().push(tx);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if text == CLOSE_SENTINEL {
                break;
            }
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(Ok(msg)) = read.next().await {
        match msg {
            Message::Text(text) => handle_client_message(&text, &state),
            Message::Close(_) => break,
            _ => {}
        }
    }
    // Watches are per-session on a real brain; losing the socket loses them.
    state.watched.lock().unwrap().clear();
    writer.abort();
}

fn handle_client_message(text: &str, state: &Arc<BrainState>) {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return,
    };
    match msg["type"].as_str().unwrap_or("") {
        "get_brain_stat_message" => {
            state.push_all(&json!({
                "type": "brain_status_message",
                "provisioned": state.config.provisioned,
            }));
        }
        "get_express_mode_flag_msg" => {
            state.push_all(&json!({
                "type": "express_mode_flag_msg",
                "enabled": state.config.express_enabled,
            }));
        }
        "passcode_auth_msg" => {
            let pin = msg["passcode"].as_str().unwrap_or("");
            let accepted = match &state.config.accepted_pin {
                None => true,
                Some(expected) => pin == expected,
            };
            if accepted {
                state.push_all(&json!({
                    "type": "authorized_message",
                    "brain_id": "mock-brain",
                    "session_id": "sess-1",
                    "token": "tok-1",
                }));
            } else {
                state.push_all(&json!({ "type": "unauthorized_message" }));
            }
        }
        "watch_states_message" => {
            let device_id = msg["device_id"].as_str().unwrap_or("").to_string();
            if msg["watch"].as_bool().unwrap_or(false) {
                state.watched.lock().unwrap().insert(device_id);
                state.watch_msgs.fetch_add(1, Ordering::SeqCst);
            } else {
                state.watched.lock().unwrap().remove(&device_id);
                state.unwatch_msgs.fetch_add(1, Ordering::SeqCst);
            }
        }
        "send_macro_message" => {
            let actions = msg["macro"]["actions"].as_array().cloned().unwrap_or_default();
            for action in actions {
                handle_macro_action(&action, state);
            }
        }
        _ => {}
    }
}

fn handle_macro_action(action: &Value, state: &Arc<BrainState>) {
    let device_id = action["device_id"].as_str().unwrap_or(SYSTEM_DEVICE_ID);
    let params = &action["parameters"];

    if let Some(new_value) = params["New_Value"].as_str() {
        // Custom state set: the action's command id is the state id
        let state_id = action["command_id"].as_str().unwrap_or("").to_string();
        state
            .custom_values
            .lock()
            .unwrap()
            .insert(state_id.clone(), new_value.to_string());
        state.push_state_change(device_id, &state_id, new_value);
        return;
    }

    match action["command_id"].as_str().unwrap_or("") {
        "CMD_QUERY_SYSTEM_USE" => {
            let value = state.system_state_value.lock().unwrap().clone();
            state.push_state_change(device_id, "SYSTEM_STATE", &value);
        }
        "CMD_SET_SYSTEM_USE" => {
            let value = params["SYSTEM_STATE"].as_str().unwrap_or("OFF").to_string();
            *state.system_state_value.lock().unwrap() = value.clone();
            state.push_state_change(device_id, "SYSTEM_STATE", &value);
        }
        // Unknown commands are acknowledged with no state change
        _ => {}
    }
}

// ── Minimal HTTP ─────────────────────────────────────────────────────

async fn handle_http(mut stream: TcpStream, state: Arc<BrainState>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    // Read until the end of headers; bodies are ignored (no REST endpoint
    // the client uses carries a meaningful request body).
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => return,
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let line = request.lines().next().unwrap_or("");
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let path = target.split('?').next().unwrap_or("");

    let (status, body) = route(method, path, &state);
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn route(method: &str, path: &str, state: &Arc<BrainState>) -> (&'static str, String) {
    match (method, path) {
        ("GET", "/api/v1/general") => (
            "200 OK",
            json!({
                "name": "Mock Brain",
                "version": "1.0.0",
                "provisioned": state.config.provisioned,
            })
            .to_string(),
        ),
        ("GET", "/api/v1/devices") => {
            state.device_list_hits.fetch_add(1, Ordering::SeqCst);
            (
                "200 OK",
                state.devices.lock().unwrap().to_string(),
            )
        }
        ("GET", "/api/v1/status") => ("200 OK", json!({ "status": "ok" }).to_string()),
        ("POST", "/api/v1/restart") => {
            state.restart_hits.fetch_add(1, Ordering::SeqCst);
            if state.config.sync_on_restart {
                let state = state.clone();
                tokio::spawn(async move {
                    state.push_system_state("brain_sync");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    state.push_system_state("active_online");
                });
            }
            ("200 OK", json!({}).to_string())
        }
        ("GET", p) if p.starts_with("/api/v1/device-drivers/") => {
            let id = p.trim_start_matches("/api/v1/device-drivers/");
            match state.drivers.lock().unwrap().get(id) {
                Some(descriptor) => ("200 OK", descriptor.to_string()),
                None => ("404 Not Found", json!({"error": "no such driver"}).to_string()),
            }
        }
        _ => ("404 Not Found", json!({"error": "no such endpoint"}).to_string()),
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

fn default_devices() -> Value {
    json!([
        {
            "id": SYSTEM_DEVICE_ID,
            "name": "System",
            "description": "Synthetic system device",
            "driver_id": "driver-system",
            "driver_version": 1,
            "device_type": "system",
            "created": "2024-03-01T00:00:00Z",
        },
        {
            "id": AVR_DEVICE_ID,
            "name": "Receiver",
            "description": "Rack AV receiver",
            "driver_id": "driver-avr",
            "driver_version": 2,
            "created": "2024-03-01T00:00:00Z",
        }
    ])
}

pub fn system_driver() -> Value {
    json!({
        "categories": [{
            "name": "System",
            "reference_id": "CAT_SYSTEM",
            "states": [
                {
                    "reference_id": "SECOND_STATE",
                    "name": "SECOND_STATE",
                    "type": "number",
                    "value": "0"
                },
                {
                    "reference_id": "SYSTEM_STATE",
                    "name": "SYSTEM_STATE",
                    "type": "string",
                    "value": "OFF"
                },
                {
                    "reference_id": "CS_HOUSE_MODE",
                    "name": "House Mode",
                    "type": "string",
                    "value": "day",
                    "is_custom_state": true
                }
            ],
            "capabilities": [{
                "name": "System Use",
                "reference_id": "CAP_SYSTEM_USE",
                "commands": [
                    {
                        "name": "QUERY_SYSTEM_USE",
                        "codes": [{
                            "reference_id": "CMD_QUERY_SYSTEM_USE",
                            "state_references": ["SYSTEM_STATE"]
                        }]
                    },
                    {
                        "name": "SET_SYSTEM_USE",
                        "codes": [{
                            "reference_id": "CMD_SET_SYSTEM_USE",
                            "state_references": ["SYSTEM_STATE"],
                            "parameters": [{
                                "name": "system_state",
                                "type": "string",
                                "constraints": { "enum": ["ON", "OFF"] }
                            }]
                        }]
                    }
                ]
            }],
            "macros": []
        }]
    })
}

fn avr_driver() -> Value {
    json!({
        "categories": [{
            "name": "Audio",
            "reference_id": "CAT_AUDIO",
            "states": [
                {
                    "reference_id": "VOLUME",
                    "name": "Volume",
                    "type": "number",
                    "value": "20"
                },
                {
                    "reference_id": "MUTE",
                    "name": "Mute",
                    "type": "boolean",
                    "value": "false"
                }
            ],
            "capabilities": [{
                "name": "Volume",
                "reference_id": "CAP_VOLUME",
                "commands": [{
                    "name": "SET_VOLUME",
                    "codes": [{
                        "reference_id": "CMD_SET_VOLUME",
                        "state_references": ["VOLUME"],
                        "parameters": [{ "name": "level", "type": "number" }]
                    }]
                }]
            }],
            "macros": []
        }]
    })
}

fn default_drivers() -> HashMap<String, Value> {
    HashMap::from([
        ("driver-system".to_string(), system_driver()),
        ("driver-avr".to_string(), avr_driver()),
    ])
}
