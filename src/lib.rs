//! Rust client library for networked AV control processors ("brains")
//!
//! A brain fronts a room full of physical AV devices behind two transports:
//! a short REST surface for bootstrap and info, and a long-lived
//! bidirectional message channel for live interaction. This library folds
//! both into one object model:
//!
//! - A connection with a well-defined lifecycle (bootstrap, express-mode
//!   handshake, PIN authorization, reconnect, watchdog)
//! - A catalogue of logical devices enumerated from the brain
//! - Per-device state and command APIs with live state-change subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use brainlink::{BrainClient, BrainOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BrainClient::new("127.0.0.1:8000", BrainOptions::default())?;
//!     let status = client.connect_to_controller().await?;
//!     println!("status: {status}");
//!
//!     // The synthetic system device carries the space's custom states
//!     let system = client.system_device().await?;
//!     println!("system device: {}", system.name());
//!
//!     // Subscribe to live state changes
//!     let mut changes = system.subscribe();
//!     while let Ok(change) = changes.recv().await {
//!         println!("{} = {}", change.name, change.value);
//!         break;
//!     }
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Shared clients
//!
//! The process-wide [`registry`] hands out one client per endpoint, with
//! the connect scheduled in the background so listeners can attach first:
//!
//! ```no_run
//! use brainlink::{registry, BrainOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = registry().get_or_create("127.0.0.1:8000", BrainOptions::default())?;
//!     let mut events = client.events();
//!     while let Ok(event) = events.next().await {
//!         println!("{}: {event:?}", event.name());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Controller client**: connection state machine, handshake
//!   sequencing, message dispatch, reconnect, watchdog
//! - **Device**: normalised state/command catalog, subscriptions, macros
//! - **Driver**: descriptor normalisation into flat catalogs
//! - **Channel / REST**: the two transports
//! - **Events**: the client-wide bus and its reactive stream view
//! - **Observe**: observable cells for reactive UIs

mod channel;
mod controller;
mod deferred;
mod device;
mod driver;
mod error;
mod events;
mod observe;
mod protocol;
mod registry;
mod rest;
mod status;
mod types;

// Public exports
pub use channel::{ChannelEvent, MessageChannel};
pub use controller::BrainClient;
pub use deferred::Deferred;
pub use device::{Device, StateChanged, StateSubscription};
pub use driver::{
    normalize, CategoryCatalog, DriverCapability, DriverCategory, DriverCode, DriverCommand,
    DriverDescriptor, DriverParameter, DriverState, NormalizedDriver,
};
pub use error::{BrainError, Result};
pub use events::{ClientEvent, EventBus, EventStream};
pub use observe::{observe_connection_status, observe_state, resolve_device, Cell};
pub use protocol::{BrainStatus, MacroAction, StateChange, SystemState};
pub use registry::{registry, Endpoint, Registry};
pub use rest::{CallOptions, PendingCallback, RestClient};
pub use status::ConnectionStatus;
pub use types::{
    BrainOptions, Command, CommandParam, ControllerInfo, DeviceInfo, NormalizedValue,
    PinProvider, SessionAuth, State, StateKind,
};
