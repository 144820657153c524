use std::sync::Arc;
use tokio::sync::watch;

/// A one-shot awaitable that is resolvable from the outside.
///
/// The connection handshake is sequenced by awaiting values that arrive on
/// the message channel (provisioned flag, express-mode flag, authorization).
/// Each of those is a `Deferred`: the dispatcher resolves it when the
/// matching inbound message shows up, and any number of waiters observe the
/// settled value. Settling is first-write-wins; awaits after settlement
/// return immediately.
///
/// There is no separate rejection path: a fallible completion carries its
/// failure in the value type, e.g. `Deferred<Result<T, E>>` settled with
/// either variant.
///
/// There is no built-in timeout. Callers that need one wrap
/// [`wait`](Deferred::wait) in `tokio::time::timeout`.
#[derive(Clone)]
pub struct Deferred<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> Deferred<T> {
    /// Create an unsettled deferred.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Settle with `value`. A second call is a no-op.
    pub fn resolve(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        });
    }

    /// Whether the deferred has been settled.
    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The settled value, if any, without waiting.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the settled value. Returns immediately once settled.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, which the future borrows, so
            // `changed` cannot fail while anyone is waiting.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.tx.borrow().is_some())
            .finish()
    }
}
