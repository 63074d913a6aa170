use std::sync::Mutex;

use tokio::sync::mpsc;

/// In-process fan-out of typed events.
///
/// Each subscriber gets its own unbounded queue. A subscriber only sees
/// events published after it subscribed; dropped receivers are pruned on
/// the next publish.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: T) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
