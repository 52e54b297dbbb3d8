//! Subscriber broadcast hub.
//!
//! A single supervisor task owns the subscriber set. Attach, detach and
//! broadcast are commands on a channel, so no other context ever touches the
//! subscriber map, and the retained-state greeting is ordered before any
//! later broadcast by construction.
//!
//! Each subscriber gets a bounded outbound queue drained by its own writer
//! task. A queue that fills up means the subscriber has stopped reading; it
//! is dropped on the spot rather than allowed to block the producer.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Outbound queue depth per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 256;

enum HubCommand {
    Attach { id: u64, tx: mpsc::Sender<String> },
    Detach { id: u64 },
    Broadcast(String),
    /// Broadcast a state document and retain it as the greeting for
    /// subscribers that attach later.
    BroadcastState(String),
}

/// A subscriber's receiving half, handed out by [`Hub::attach`].
pub struct Subscriber {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

/// Cloneable handle to the hub supervisor.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
    queue_depth: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_queue_depth(SUBSCRIBER_QUEUE)
    }

    /// Hub with a custom per-subscriber queue depth.
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_supervisor(rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_depth,
        }
    }

    /// Register a new subscriber. Its first queued message is the retained
    /// state document, when one exists.
    pub fn attach(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let _ = self.tx.send(HubCommand::Attach { id, tx });
        Subscriber { id, rx }
    }

    pub fn detach(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Detach { id });
    }

    /// Queue `text` for delivery to every current subscriber. Never blocks.
    pub fn broadcast(&self, text: String) {
        let _ = self.tx.send(HubCommand::Broadcast(text));
    }

    /// Broadcast a state document and retain it for future greetings.
    pub fn broadcast_state(&self, text: String) {
        let _ = self.tx.send(HubCommand::BroadcastState(text));
    }

    /// Serialize `value` and broadcast it; serialization failures are logged
    /// and the message is dropped.
    pub fn broadcast_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(text) => self.broadcast(text),
            Err(e) => error!(error = %e, "failed to serialize broadcast"),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_supervisor(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut subscribers: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
    let mut retained_state: Option<String> = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Attach { id, tx } => {
                if let Some(state) = &retained_state {
                    // Fresh queue; this cannot fail unless the subscriber
                    // already went away.
                    let _ = tx.try_send(state.clone());
                }
                subscribers.insert(id, tx);
                debug!(id, total = subscribers.len(), "subscriber attached");
            }
            HubCommand::Detach { id } => {
                if subscribers.remove(&id).is_some() {
                    debug!(id, total = subscribers.len(), "subscriber detached");
                }
            }
            HubCommand::Broadcast(text) => {
                deliver(&mut subscribers, &text);
            }
            HubCommand::BroadcastState(text) => {
                deliver(&mut subscribers, &text);
                retained_state = Some(text);
            }
        }
    }
}

fn deliver(subscribers: &mut HashMap<u64, mpsc::Sender<String>>, text: &str) {
    subscribers.retain(|id, tx| match tx.try_send(text.to_owned()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(id = *id, "subscriber queue full, dropping subscriber");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(sub: &mut Subscriber) -> Option<String> {
        timeout(Duration::from_secs(1), sub.rx.recv())
            .await
            .expect("hub delivery timed out")
    }

    #[tokio::test]
    async fn broadcasts_are_fifo_per_subscriber() {
        let hub = Hub::new();
        let mut sub = hub.attach();
        hub.broadcast("one".to_owned());
        hub.broadcast("two".to_owned());
        hub.broadcast("three".to_owned());
        assert_eq!(recv(&mut sub).await.as_deref(), Some("one"));
        assert_eq!(recv(&mut sub).await.as_deref(), Some("two"));
        assert_eq!(recv(&mut sub).await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn attach_greets_with_retained_state_before_later_broadcasts() {
        let hub = Hub::new();
        hub.broadcast_state(r#"{"type":"state","n":1}"#.to_owned());

        let mut sub = hub.attach();
        hub.broadcast("live".to_owned());

        assert_eq!(
            recv(&mut sub).await.as_deref(),
            Some(r#"{"type":"state","n":1}"#)
        );
        assert_eq!(recv(&mut sub).await.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn attach_without_retained_state_gets_no_greeting() {
        let hub = Hub::new();
        let mut sub = hub.attach();
        hub.broadcast("first".to_owned());
        assert_eq!(recv(&mut sub).await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn newer_state_replaces_the_greeting() {
        let hub = Hub::new();
        hub.broadcast_state(r#"{"n":1}"#.to_owned());
        hub.broadcast_state(r#"{"n":2}"#.to_owned());
        let mut sub = hub.attach();
        assert_eq!(recv(&mut sub).await.as_deref(), Some(r#"{"n":2}"#));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocked() {
        let hub = Hub::with_queue_depth(1);
        let mut sub = hub.attach();

        // First fills the queue; second overflows it and evicts the
        // subscriber. Neither call blocks the producer.
        hub.broadcast("first".to_owned());
        hub.broadcast("second".to_owned());

        assert_eq!(recv(&mut sub).await.as_deref(), Some("first"));
        // Queue closed by the hub when the subscriber was dropped.
        assert_eq!(recv(&mut sub).await, None);

        // The hub is still healthy for other subscribers.
        let mut healthy = hub.attach();
        hub.broadcast("third".to_owned());
        assert_eq!(recv(&mut healthy).await.as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let hub = Hub::new();
        let mut sub = hub.attach();
        hub.detach(sub.id);
        hub.broadcast("after".to_owned());
        assert_eq!(recv(&mut sub).await, None);
    }
}
