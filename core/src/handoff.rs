//! Single-slot, back-pressured rendezvous channel.
//!
//! A producer publishes one item at a time and waits until the previous item
//! has been consumed before the next `send` completes, which serializes
//! bursty push callbacks instead of buffering unbounded memory. The consumer
//! sees a finite, non-restartable sequence that ends cleanly on `close`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::Notify;

struct State<T> {
    slot: Option<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    item_ready: Notify,
    slot_free: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.item_ready.notify_waiters();
        self.slot_free.notify_waiters();
    }
}

/// Producer half. Cloneable; sends from multiple producers serialize on the
/// single slot.
pub struct HandoffSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consumer half.
pub struct HandoffReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Returned by `send` when the channel has been closed; carries the item back.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

/// Create a new single-slot channel.
pub fn channel<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            slot: None,
            closed: false,
        }),
        item_ready: Notify::new(),
        slot_free: Notify::new(),
    });
    (
        HandoffSender {
            shared: Arc::clone(&shared),
        },
        HandoffReceiver { shared },
    )
}

impl<T> HandoffSender<T> {
    /// Publish one item, waiting until the slot is free.
    pub async fn send(&self, item: T) -> Result<(), SendError<T>> {
        loop {
            let notified = self.shared.slot_free.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(SendError(item));
                }
                if state.slot.is_none() {
                    state.slot = Some(item);
                    drop(state);
                    self.shared.item_ready.notify_one();
                    return Ok(());
                }
            }
            // Re-check after waking; another producer may have won the slot.
            notified.await;
        }
    }

    /// Close the channel. Idempotent; a mid-flight item is still delivered.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T> HandoffReceiver<T> {
    /// Receive the next item, waiting for one to be published. Returns `None`
    /// once the channel is closed and the slot has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if let Some(item) = state.slot.take() {
                    drop(state);
                    self.shared.slot_free.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the channel from the consumer side. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T> Drop for HandoffReceiver<T> {
    fn drop(&mut self) {
        // Unblock any producer still waiting for the slot.
        self.shared.close();
    }
}
