//! Traffic accounting for the canopy stack.
//!
//! [`Counter`] is a relaxed atomic counter; [`Traffic`] groups the four
//! counters a router or websocket client keeps (bytes and messages in each
//! direction) and hands out serializable [`TrafficSnapshot`]s.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter backed by [`AtomicU64`].
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Counter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        let counter = Self::new();
        counter.inc_by(value);
        Ok(counter)
    }
}

// ── Traffic ──────────────────────────────────────────────────────────

/// Byte and message counters for one endpoint, in both directions.
#[derive(Debug, Default)]
pub struct Traffic {
    rx_bytes: Counter,
    tx_bytes: Counter,
    rx_msgs: Counter,
    tx_msgs: Counter,
}

impl Traffic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one received message of `bytes` length.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_bytes.inc_by(bytes as u64);
        self.rx_msgs.inc();
    }

    /// Account for one sent message of `bytes` length.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_bytes.inc_by(bytes as u64);
        self.tx_msgs.inc();
    }

    pub fn rx(&self) -> u64 {
        self.rx_bytes.get()
    }

    pub fn tx(&self) -> u64 {
        self.tx_bytes.get()
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            rx_bytes: self.rx_bytes.get(),
            tx_bytes: self.tx_bytes.get(),
            rx_msgs: self.rx_msgs.get(),
            tx_msgs: self.tx_msgs.get(),
        }
    }
}

/// Point-in-time copy of a [`Traffic`] block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_msgs: u64,
    pub tx_msgs: u64,
}

impl TrafficSnapshot {
    /// Difference between two snapshots, saturating at zero.
    pub fn since(&self, earlier: &TrafficSnapshot) -> TrafficSnapshot {
        TrafficSnapshot {
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            tx_bytes: self.tx_bytes.saturating_sub(earlier.tx_bytes),
            rx_msgs: self.rx_msgs.saturating_sub(earlier.rx_msgs),
            tx_msgs: self.tx_msgs.saturating_sub(earlier.tx_msgs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic_operations() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc_by(10);
        assert_eq!(c.get(), 11);
    }

    #[test]
    fn counter_serde_roundtrip() {
        let c = Counter::new();
        c.inc_by(99);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "99");
        let c2: Counter = serde_json::from_str(&json).unwrap();
        assert_eq!(c2.get(), 99);
    }

    #[test]
    fn traffic_records_both_directions() {
        let t = Traffic::new();
        t.record_tx(100);
        t.record_tx(20);
        t.record_rx(7);
        assert_eq!(t.tx(), 120);
        assert_eq!(t.rx(), 7);

        let snap = t.snapshot();
        assert_eq!(snap.tx_msgs, 2);
        assert_eq!(snap.rx_msgs, 1);
    }

    #[test]
    fn snapshot_delta() {
        let t = Traffic::new();
        t.record_rx(10);
        let before = t.snapshot();
        t.record_rx(5);
        t.record_tx(3);
        let delta = t.snapshot().since(&before);
        assert_eq!(delta.rx_bytes, 5);
        assert_eq!(delta.rx_msgs, 1);
        assert_eq!(delta.tx_bytes, 3);
    }
}
