//! Bounded recency set of seen event ids.

use std::collections::{HashMap, VecDeque};

/// Default number of ids remembered.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Least-recently-used set of event ids.
///
/// `order` may hold stale entries for ids that were touched again later;
/// an entry is live only while its stamp matches the one in `seen`.
#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    tick: u64,
    seen: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tick: 0,
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id` as seen. Returns `true` the first time, `false` for repeats.
    pub fn insert(&mut self, id: &str) -> bool {
        self.tick += 1;
        let tick = self.tick;

        if let Some(stamp) = self.seen.get_mut(id) {
            *stamp = tick;
            self.order.push_back((id.to_string(), tick));
            self.compact();
            return false;
        }

        self.seen.insert(id.to_string(), tick);
        self.order.push_back((id.to_string(), tick));

        while self.seen.len() > self.capacity {
            let Some((oldest, stamp)) = self.order.pop_front() else {
                break;
            };
            if self.seen.get(&oldest) == Some(&stamp) {
                self.seen.remove(&oldest);
            }
        }
        self.compact();
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn compact(&mut self) {
        if self.order.len() > self.capacity * 2 {
            let seen = &self.seen;
            self.order
                .retain(|(id, stamp)| seen.get(id) == Some(stamp));
        }
    }
}
