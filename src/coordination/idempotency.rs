//! Bounded TTL cache of event idempotency keys

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    InFlight,
    Applied,
}

/// Result of trying to claim a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Acquired,
    InFlight,
    Applied,
}

#[derive(Debug)]
struct Entry {
    state: KeyState,
    generation: u64,
    touched: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Insertion order for expiry and eviction; stale generations are skipped
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

/// Remembers which events are being applied or were applied recently.
///
/// Applied keys expire after `ttl` and the oldest applied keys are evicted
/// beyond `capacity`. In-flight keys are never evicted.
#[derive(Debug)]
pub struct IdempotencyCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `key` for processing unless it is in flight or already applied
    pub fn try_acquire(&self, key: &str) -> Claim {
        let now = Instant::now();
        let mut inner = self.lock();
        self.expire(&mut inner, now);

        if let Some(entry) = inner.entries.get(key) {
            return match entry.state {
                KeyState::InFlight => Claim::InFlight,
                KeyState::Applied => Claim::Applied,
            };
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.entries.insert(
            key.to_string(),
            Entry {
                state: KeyState::InFlight,
                generation,
                touched: now,
            },
        );
        inner.order.push_back((key.to_string(), generation));
        self.evict(&mut inner);
        Claim::Acquired
    }

    /// Mark a claimed key as applied; it now suppresses re-delivery until it expires
    pub fn mark_applied(&self, key: &str) {
        let now = Instant::now();
        let mut inner = self.lock();
        let generation = inner.next_generation;
        let refreshed = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.state = KeyState::Applied;
                entry.touched = now;
                entry.generation = generation;
                true
            }
            None => false,
        };
        if refreshed {
            inner.next_generation += 1;
            inner.order.push_back((key.to_string(), generation));
        }
    }

    /// Forget a key so a later delivery is processed again
    pub fn release(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.state == KeyState::InFlight)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, inner: &mut Inner, now: Instant) {
        while let Some((key, generation)) = inner.order.front().cloned() {
            let Some(entry) = inner.entries.get(&key) else {
                inner.order.pop_front();
                continue;
            };
            if entry.generation != generation {
                inner.order.pop_front();
                continue;
            }
            if entry.state == KeyState::Applied && now.duration_since(entry.touched) >= self.ttl {
                inner.entries.remove(&key);
                inner.order.pop_front();
                continue;
            }
            break;
        }
    }

    fn evict(&self, inner: &mut Inner) {
        let mut scanned = 0;
        let limit = inner.order.len();
        while inner.entries.len() > self.capacity && scanned < limit {
            scanned += 1;
            let Some((key, generation)) = inner.order.pop_front() else {
                break;
            };
            match inner.entries.get(&key) {
                Some(entry) if entry.generation == generation => {
                    if entry.state == KeyState::Applied {
                        inner.entries.remove(&key);
                    } else {
                        inner.order.push_back((key, generation));
                    }
                }
                _ => {}
            }
        }
    }
}
