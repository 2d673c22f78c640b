//! # Lossy single-slot signals.
//!
//! A [`slot`] is a one-element channel with a non-blocking send: firing while
//! a previous signal is still pending silently drops the new one. The receiver
//! only needs to know that at least one event occurred.
//!
//! Tasks carry two of these: a stop slot (payload is the stop reason) and a
//! refresh slot (no payload). Senders live in the scheduler's task record;
//! receivers are owned by the task's supervisor worker.

use tokio::sync::mpsc;

/// Sending half of a single-slot signal. Cheap to clone.
#[derive(Clone, Debug)]
pub struct SlotSender<T>(mpsc::Sender<T>);

/// Receiving half of a single-slot signal.
#[derive(Debug)]
pub struct SlotReceiver<T>(mpsc::Receiver<T>);

/// Creates a connected single-slot signal pair.
pub fn slot<T>() -> (SlotSender<T>, SlotReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (SlotSender(tx), SlotReceiver(rx))
}

impl<T> SlotSender<T> {
    /// Fires the signal. Dropped silently if one is already pending or the
    /// receiver is gone.
    pub fn fire(&self, value: T) {
        let _ = self.0.try_send(value);
    }
}

impl<T> SlotReceiver<T> {
    /// Waits for the next signal. Returns `None` once every sender is gone
    /// and the slot is drained.
    pub async fn fired(&mut self) -> Option<T> {
        self.0.recv().await
    }
}
