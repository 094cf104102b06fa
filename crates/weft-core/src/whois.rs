//! The WHOIS pending queue.
//!
//! Packets from unknown senders cannot be authenticated until the
//! sender's identity is learned from the root. They are parked here,
//! keyed by source address, while WHOIS requests go out; learning the
//! peer drains the entry and the parked packets re-enter the ordinary
//! ingress path. An address entry never outlives a learned peer.
//!
//! All state sits behind one mutex taken only for short critical
//! sections; request transmission happens outside the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::buf::Slice;
use crate::path::Path;

/// Minimum delay between WHOIS retries for one address, milliseconds.
pub const WHOIS_RETRY_DELAY: i64 = 500;

/// Retries before an address is abandoned.
pub const WHOIS_MAX_RETRIES: u16 = 4;

/// Parked packets kept per address; the oldest is discarded beyond this.
pub const WHOIS_MAX_PENDING_PACKETS: usize = 4;

struct QueueItem {
    packets: VecDeque<(Slice, Arc<Path>)>,
    last_retry: i64,
    retries: u16,
}

/// Pending identity lookups, keyed by the unknown source address.
pub struct WhoisQueue {
    entries: Mutex<HashMap<Address, QueueItem>>,
}

impl WhoisQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Park an assembled packet from `source` together with its arrival
    /// path, creating the entry if absent.
    pub fn enqueue(&self, source: Address, packet: Slice, path: Arc<Path>) {
        let mut entries = self.entries.lock().expect("whois queue lock poisoned");
        let item = entries.entry(source).or_insert_with(|| QueueItem {
            packets: VecDeque::new(),
            last_retry: 0,
            retries: 0,
        });
        if item.packets.len() >= WHOIS_MAX_PENDING_PACKETS {
            item.packets.pop_front();
        }
        item.packets.push_back((packet, path));
    }

    /// Addresses whose retry delay has elapsed. Stamps `last_retry` and
    /// counts the retry for each returned address; entries past the
    /// retry cap are dropped instead.
    #[must_use]
    pub fn flush_ready(&self, now: i64) -> Vec<Address> {
        let mut entries = self.entries.lock().expect("whois queue lock poisoned");
        let mut ready = Vec::new();
        entries.retain(|&address, item| {
            if now - item.last_retry < WHOIS_RETRY_DELAY {
                return true;
            }
            if item.retries >= WHOIS_MAX_RETRIES {
                tracing::debug!(%address, "abandoning identity lookup after retry cap");
                return false;
            }
            item.last_retry = now;
            item.retries += 1;
            ready.push(address);
            true
        });
        ready
    }

    /// Remove and return everything parked for `address`.
    ///
    /// Called when the address's identity is learned; the caller feeds
    /// the packets back through the ingress path.
    #[must_use]
    pub fn drain(&self, address: Address) -> Vec<(Slice, Arc<Path>)> {
        let mut entries = self.entries.lock().expect("whois queue lock poisoned");
        entries
            .remove(&address)
            .map(|item| item.packets.into())
            .unwrap_or_default()
    }

    /// Whether an entry exists for `address`.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool {
        self.entries
            .lock()
            .expect("whois queue lock poisoned")
            .contains_key(&address)
    }
}

impl Default for WhoisQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufPool;

    fn slice(pool: &BufPool, byte: u8) -> Slice {
        let mut buf = pool.get();
        buf[0] = byte;
        Slice::new(Arc::new(buf), 0, 1)
    }

    fn path() -> Arc<Path> {
        Arc::new(Path::new(1, "192.0.2.1:9993".parse().unwrap()))
    }

    #[test]
    fn enqueue_bounds_parked_packets() {
        let pool = BufPool::new();
        let q = WhoisQueue::new();
        let a = Address::from_u64(0x1111111111);

        for i in 0..6u8 {
            q.enqueue(a, slice(&pool, i), path());
        }
        let drained = q.drain(a);
        assert_eq!(drained.len(), WHOIS_MAX_PENDING_PACKETS);
        // Oldest two were discarded.
        assert_eq!(drained[0].0.as_bytes(), &[2]);
        assert!(!q.contains(a));
    }

    #[test]
    fn flush_gates_on_retry_delay() {
        let pool = BufPool::new();
        let q = WhoisQueue::new();
        let a = Address::from_u64(0x2222222222);
        q.enqueue(a, slice(&pool, 0), path());

        assert_eq!(q.flush_ready(1000), vec![a]);
        // Within the delay window nothing is ready.
        assert!(q.flush_ready(1000 + WHOIS_RETRY_DELAY - 1).is_empty());
        assert_eq!(q.flush_ready(1000 + WHOIS_RETRY_DELAY), vec![a]);
    }

    #[test]
    fn retry_cap_drops_entry() {
        let pool = BufPool::new();
        let q = WhoisQueue::new();
        let a = Address::from_u64(0x3333333333);
        q.enqueue(a, slice(&pool, 0), path());

        let mut now = 0;
        for _ in 0..WHOIS_MAX_RETRIES {
            now += WHOIS_RETRY_DELAY;
            assert_eq!(q.flush_ready(now), vec![a]);
        }
        now += WHOIS_RETRY_DELAY;
        assert!(q.flush_ready(now).is_empty());
        assert!(!q.contains(a));
    }

    #[test]
    fn drain_empties_entry() {
        let pool = BufPool::new();
        let q = WhoisQueue::new();
        let a = Address::from_u64(0x4444444444);
        q.enqueue(a, slice(&pool, 7), path());

        let drained = q.drain(a);
        assert_eq!(drained.len(), 1);
        assert!(q.drain(a).is_empty());
    }
}
