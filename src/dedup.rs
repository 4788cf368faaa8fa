// ===============================
// src/dedup.rs
// ===============================
use std::collections::VecDeque;

use ahash::AHashMap as HashMap;

/// Bounded LRU of payload hashes with a rolling window.
///
/// A hash counts as seen while `now - first_seen < window`. Capacity
/// evicts the least recently touched hash. Owned by the detector task;
/// nothing else mutates it.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    window_ms: i64,
    entries: HashMap<String, Entry>,
    // recency log; entries whose seq no longer matches are stale
    order: VecDeque<(u64, String)>,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    first_seen: i64,
    seq: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, window_ms: i64) -> Self {
        DedupCache {
            capacity: capacity.max(1),
            window_ms,
            entries: HashMap::with_capacity(capacity.min(1 << 16)),
            order: VecDeque::new(),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// True when `hash` was first seen inside the window ending at `now`.
    pub fn contains(&self, hash: &str, now: i64) -> bool {
        self.entries
            .get(hash)
            .map_or(false, |e| now - e.first_seen < self.window_ms)
    }

    /// Records a sighting. Returns true if it is new (or its previous
    /// sighting aged out of the window), false for a duplicate.
    pub fn check_and_insert(&mut self, hash: &str, now: i64) -> bool {
        if self.contains(hash, now) {
            self.touch(hash);
            return false;
        }
        self.insert(hash.to_string(), now);
        true
    }

    /// Inserts or resets `first_seen`. Used for snapshot restore too.
    pub fn insert(&mut self, hash: String, first_seen: i64) {
        self.seq += 1;
        let seq = self.seq;
        self.entries.insert(hash.clone(), Entry { first_seen, seq });
        self.order.push_back((seq, hash));
        self.evict();
    }

    fn touch(&mut self, hash: &str) {
        self.seq += 1;
        let seq = self.seq;
        if let Some(e) = self.entries.get_mut(hash) {
            e.seq = seq;
            self.order.push_back((seq, hash.to_string()));
        }
        self.compact();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((seq, hash)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&hash).map_or(false, |e| e.seq == seq) {
                self.entries.remove(&hash);
            }
        }
        self.compact();
    }

    // keep the recency log from growing without bound on repeated touches
    fn compact(&mut self) {
        if self.order.len() <= self.capacity.saturating_mul(2) {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(seq, hash)| entries.get(hash).map_or(false, |e| e.seq == *seq));
    }

    /// Drops everything first seen before `now - window`.
    pub fn purge_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let window = self.window_ms;
        self.entries.retain(|_, e| now - e.first_seen < window);
        let removed = before - self.entries.len();
        if removed > 0 {
            let entries = &self.entries;
            self.order
                .retain(|(seq, hash)| entries.get(hash).map_or(false, |e| e.seq == *seq));
        }
        removed
    }

    /// Live entries, oldest sighting first.
    pub fn snapshot(&self, now: i64) -> Vec<(String, i64)> {
        let mut out: Vec<(String, i64)> = self
            .entries
            .iter()
            .filter(|(_, e)| now - e.first_seen < self.window_ms)
            .map(|(h, e)| (h.clone(), e.first_seen))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub fn restore(&mut self, entries: Vec<(String, i64)>) {
        for (hash, first_seen) in entries {
            self.insert(hash, first_seen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    #[test]
    fn duplicates_inside_window_are_suppressed() {
        let mut c = DedupCache::new(10_000, 24 * HOUR);
        assert!(c.check_and_insert("a", 0));
        assert!(!c.check_and_insert("a", 50));
        assert!(!c.check_and_insert("a", 24 * HOUR - 1));
        // window is measured from the first sighting
        assert!(c.check_and_insert("a", 24 * HOUR));
        assert!(!c.check_and_insert("a", 24 * HOUR + 1));
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let mut c = DedupCache::new(3, 24 * HOUR);
        for h in ["a", "b", "c"] {
            c.check_and_insert(h, 0);
        }
        // touch a so b becomes the oldest
        assert!(!c.check_and_insert("a", 1));
        c.check_and_insert("d", 2);
        assert_eq!(c.len(), 3);
        assert!(c.contains("a", 3));
        assert!(!c.contains("b", 3));
        assert!(c.contains("c", 3));
        assert!(c.contains("d", 3));
    }

    #[test]
    fn recency_log_stays_bounded() {
        let mut c = DedupCache::new(4, 24 * HOUR);
        c.check_and_insert("a", 0);
        for t in 1..1_000 {
            c.check_and_insert("a", t);
        }
        assert!(c.order.len() <= 8);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn snapshot_restore_keeps_first_seen() {
        let mut c = DedupCache::new(100, HOUR);
        c.check_and_insert("old", 0);
        c.check_and_insert("new", HOUR / 2);
        let snap = c.snapshot(HOUR + 1);
        assert_eq!(snap, vec![("new".to_string(), HOUR / 2)]);

        let mut d = DedupCache::new(100, HOUR);
        d.restore(snap);
        assert!(!d.check_and_insert("new", HOUR));
        assert_eq!(d.purge_expired(2 * HOUR), 1);
        assert!(d.is_empty());
    }
}
