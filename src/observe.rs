//! Observable cells for reactive UIs.
//!
//! Thin adapters so a reactive frontend can track a device, a single state,
//! or the connection status without touching the event bus directly. Each
//! cell is a current-value view fed by a background task; dropping the cell
//! tears the task (and any watch subscription it holds) down with it.

use crate::controller::BrainClient;
use crate::device::Device;
use crate::error::Result;
use crate::events::ClientEvent;
use crate::status::ConnectionStatus;
use crate::types::State;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A current-value view that updates in the background.
///
/// Dropping the cell aborts its feeder task, releasing whatever
/// subscription kept it fed.
pub struct Cell<T> {
    rx: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Clone> Cell<T> {
    /// The current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next update and return the new value.
    ///
    /// Returns `None` once the feeder task has ended (client dropped or
    /// stream closed).
    pub async fn changed(&mut self) -> Option<T> {
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolve a live device by id or name, enumerating if needed.
pub async fn resolve_device(client: &BrainClient, key: &str) -> Result<Arc<Device>> {
    client.device(key).await
}

/// Observe one state on a device.
///
/// The cell holds the current record and re-emits it whenever the device's
/// `STATE_CHANGED` fires for that state. Creating the cell arms the
/// device's watch subscription; dropping it releases that subscription.
pub async fn observe_state(device: &Arc<Device>, key: &str) -> Result<Cell<State>> {
    let initial = device.state(key).await?;
    let state_id = initial.id.clone();

    let (tx, rx) = watch::channel(initial);
    let mut subscription = device.subscribe();
    let device = device.clone();

    let task = tokio::spawn(async move {
        // The subscription guard lives here, so the watch stays armed for
        // exactly as long as the cell does.
        while let Ok(change) = subscription.recv().await {
            if change.id != state_id {
                continue;
            }
            let Some(record) = device.peek_state(&state_id) else {
                continue;
            };
            if tx.send(record).is_err() {
                break;
            }
        }
    });

    Ok(Cell { rx, task })
}

/// Observe the client's connection status.
pub fn observe_connection_status(client: &BrainClient) -> Cell<ConnectionStatus> {
    let (tx, rx) = watch::channel(client.connection_status());
    let mut events = client.events();

    let task = tokio::spawn(async move {
        while let Ok(event) = events.next().await {
            if let ClientEvent::ConnectionStatusChanged(status) = event {
                if tx.send(status).is_err() {
                    break;
                }
            }
        }
    });

    Cell { rx, task }
}
