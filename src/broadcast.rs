use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::registry::Registry;

/// Capacity of the wake channel between registry mutators and the
/// broadcaster. Sends are non-blocking; overflow drops the signal.
pub const WAKE_CHANNEL_CAPACITY: usize = 100;

/// Minimum interval between two publications to the same subscriber.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Per-subscriber queue depth. A sink that falls this far behind (~16s of
/// updates at the broadcast rate) counts as slow and is removed.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 16;

/// Create the wake channel shared by the registry and the broadcaster.
pub fn wake_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(WAKE_CHANNEL_CAPACITY)
}

/// Push-broadcast fabric: coalesces registry mutations into at most one
/// serialized snapshot per second per subscriber.
pub struct Broadcaster {
    registry: Arc<Registry>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_subscriber_id: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        })
    }

    /// Register an observer. The returned handle receives serialized
    /// snapshots and unsubscribes when dropped.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.lock_subscribers().insert(id, tx);
        Subscription {
            id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    /// Serialize one snapshot, for seeding a fresh observer.
    pub fn snapshot_json(&self) -> Option<String> {
        match serde_json::to_string(&self.registry.snapshot()) {
            Ok(json) => Some(json),
            Err(e) => {
                error!(error = %e, "failed to serialize snapshot");
                None
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Broadcaster task. Owns the wake receiver and a one-second ticker;
    /// wakes publish immediately when the last publication is old enough,
    /// otherwise they are held as pending until the next tick.
    pub async fn run(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
        let mut pending_update = false;
        let mut last_broadcast: Option<Instant> = None;

        loop {
            tokio::select! {
                signal = wake_rx.recv() => {
                    if signal.is_none() {
                        // All mutators are gone; nothing will ever wake us
                        // again.
                        return;
                    }
                    pending_update = true;
                    let due = last_broadcast
                        .map_or(true, |t| t.elapsed() >= BROADCAST_INTERVAL);
                    if due {
                        self.publish();
                        last_broadcast = Some(Instant::now());
                        pending_update = false;
                    }
                }
                _ = ticker.tick() => {
                    if pending_update {
                        self.publish();
                        last_broadcast = Some(Instant::now());
                        pending_update = false;
                    }
                }
            }
        }
    }

    /// Serialize one snapshot and deliver it to every subscriber
    /// sequentially; subscribers whose queue is full or closed are removed.
    fn publish(&self) {
        let Some(message) = self.snapshot_json() else {
            return;
        };

        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(subscriber = id, error = %e, "removing subscriber");
                false
            }
        });
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<String>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle for one observer; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<String>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    /// Wait for the next serialized snapshot. `None` means the subscription
    /// was removed by the broadcaster.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.lock_subscribers().remove(&self.id);
    }
}
