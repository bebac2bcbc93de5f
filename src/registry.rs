use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::domain;

/// A connection whose last accounting is older than this reports zero rates.
pub const IDLE_AFTER: std::time::Duration = std::time::Duration::from_secs(2);

/// Transfer direction relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Upstream to client.
    In,
    /// Client to upstream.
    Out,
}

/// Protocol spoken by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "SOCKS5")]
    Socks5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Socks5 => f.write_str("SOCKS5"),
        }
    }
}

/// Live state for one proxied connection.
#[derive(Debug, Clone)]
struct ConnectionRecord {
    id: String,
    client_ip: String,
    protocol: Protocol,
    destination: String,
    domain_name: String,
    start_time: DateTime<Utc>,
    bytes_in: u64,
    bytes_out: u64,
    // Rate window state; the window starts lazily on the first accounting.
    window_start: Option<Instant>,
    window_bytes_in: u64,
    window_bytes_out: u64,
    last_update: Option<Instant>,
    rate_in: f64,
    rate_out: f64,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<String, ConnectionRecord>,
    total_connections: u64,
    total_bytes_in: u64,
    total_bytes_out: u64,
}

/// Snapshot view of one connection, shaped for the monitoring API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionView {
    pub id: String,
    pub client_ip: String,
    pub protocol: Protocol,
    pub destination: String,
    pub domain_name: String,
    pub start_time: DateTime<Utc>,
    pub duration: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bandwidth_in: f64,
    pub bandwidth_out: f64,
}

/// Immutable, consistent view of the registry at a moment in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub total_connections: u64,
    pub active_connections: HashMap<String, ConnectionView>,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub current_bandwidth_in: f64,
    pub current_bandwidth_out: f64,
}

/// Concurrent registry of in-flight connections and byte totals.
///
/// All mutators and the snapshot reader serialize through one exclusive
/// lock; the lock is never held across an await point. Every mutation wakes
/// the broadcast fabric through a non-blocking signal.
pub struct Registry {
    state: Mutex<RegistryState>,
    wake_tx: mpsc::Sender<()>,
}

impl Registry {
    pub fn new(wake_tx: mpsc::Sender<()>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            wake_tx,
        }
    }

    /// Register a fresh connection. The destination's display name is
    /// resolved first (bounded reverse lookup for address literals) so the
    /// record is complete before any snapshot can expose it.
    pub async fn admit(&self, id: &str, client_ip: IpAddr, protocol: Protocol, destination: &str) {
        let domain_name = domain::resolve_destination(destination).await;

        {
            let mut state = self.lock_state();
            state.active.insert(
                id.to_string(),
                ConnectionRecord {
                    id: id.to_string(),
                    client_ip: client_ip.to_string(),
                    protocol,
                    destination: destination.to_string(),
                    domain_name,
                    start_time: Utc::now(),
                    bytes_in: 0,
                    bytes_out: 0,
                    window_start: None,
                    window_bytes_in: 0,
                    window_bytes_out: 0,
                    last_update: None,
                    rate_in: 0.0,
                    rate_out: 0.0,
                },
            );
            state.total_connections += 1;
        }

        self.signal();
    }

    /// Remove a connection. Unknown ids leave the state untouched.
    pub fn release(&self, id: &str) {
        self.lock_state().active.remove(id);
        self.signal();
    }

    /// Record `n` relayed bytes for a connection. Accounting against a
    /// missing id is silently dropped.
    pub fn account(&self, id: &str, direction: Direction, n: u64) {
        self.account_at(id, direction, n, Instant::now());
    }

    fn account_at(&self, id: &str, direction: Direction, n: u64, now: Instant) {
        {
            let mut state = self.lock_state();

            let Some(record) = state.active.get_mut(id) else {
                return;
            };

            match direction {
                Direction::In => record.bytes_in += n,
                Direction::Out => record.bytes_out += n,
            }

            let window_start = *record.window_start.get_or_insert(now);
            match direction {
                Direction::In => record.window_bytes_in += n,
                Direction::Out => record.window_bytes_out += n,
            }
            record.last_update = Some(now);

            let elapsed = now.saturating_duration_since(window_start).as_secs_f64();
            if elapsed >= 1.0 {
                record.rate_in = record.window_bytes_in as f64 / elapsed;
                record.rate_out = record.window_bytes_out as f64 / elapsed;
                record.window_start = Some(now);
                record.window_bytes_in = 0;
                record.window_bytes_out = 0;
            } else if elapsed > 0.0 {
                // Short window: expose the instantaneous rate without
                // resetting.
                record.rate_in = record.window_bytes_in as f64 / elapsed;
                record.rate_out = record.window_bytes_out as f64 / elapsed;
            }

            match direction {
                Direction::In => state.total_bytes_in += n,
                Direction::Out => state.total_bytes_out += n,
            }
        }

        self.signal();
    }

    /// Produce a consistent snapshot with idle-adjusted rates.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> Snapshot {
        let state = self.lock_state();

        let mut active_connections = HashMap::with_capacity(state.active.len());
        let mut current_bandwidth_in = 0.0;
        let mut current_bandwidth_out = 0.0;

        for (id, record) in &state.active {
            let idle = record
                .last_update
                .is_some_and(|t| now.saturating_duration_since(t) > IDLE_AFTER);
            let (bandwidth_in, bandwidth_out) = if idle {
                (0.0, 0.0)
            } else {
                (record.rate_in, record.rate_out)
            };

            current_bandwidth_in += bandwidth_in;
            current_bandwidth_out += bandwidth_out;

            let elapsed = Utc::now()
                .signed_duration_since(record.start_time)
                .num_seconds()
                .max(0) as u64;

            active_connections.insert(
                id.clone(),
                ConnectionView {
                    id: record.id.clone(),
                    client_ip: record.client_ip.clone(),
                    protocol: record.protocol,
                    destination: record.destination.clone(),
                    domain_name: record.domain_name.clone(),
                    start_time: record.start_time,
                    duration: format_duration(elapsed),
                    bytes_received: record.bytes_in,
                    bytes_sent: record.bytes_out,
                    bandwidth_in,
                    bandwidth_out,
                },
            );
        }

        Snapshot {
            total_connections: state.total_connections,
            active_connections,
            total_bytes_received: state.total_bytes_in,
            total_bytes_sent: state.total_bytes_out,
            current_bandwidth_in,
            current_bandwidth_out,
        }
    }

    /// Number of live connections.
    pub fn active_count(&self) -> usize {
        self.lock_state().active.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn signal(&self) {
        // Non-blocking wake; a full channel drops the signal, which is fine
        // because any later signal still carries the latest state.
        let _ = self.wake_tx.try_send(());
    }
}

/// Render a second count the way durations are usually read: "42s", "2m5s",
/// "1h3m20s".
fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
