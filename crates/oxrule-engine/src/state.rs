use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Outcome of one rule evaluation, kept for the status API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateEntry {
    /// Wall-clock time the evaluation started.
    pub time: Option<DateTime<Utc>>,
    /// Timestamp the query was evaluated at.
    pub at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub err: Option<String>,
    /// Number of rows returned by the query.
    pub samples: usize,
    pub series_fetched: Option<usize>,
    /// Request rendered as a curl command, when the querier reports it.
    pub curl: String,
}

impl StateEntry {
    fn is_zero(&self) -> bool {
        self == &StateEntry::default()
    }
}

struct Ring {
    entries: Vec<StateEntry>,
    cur: usize,
}

/// Fixed-size history of evaluation results; the oldest entry is
/// overwritten once capacity is reached.
pub struct RuleState {
    ring: Mutex<Ring>,
}

impl RuleState {
    /// Creates a history of `size` entries (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                entries: vec![StateEntry::default(); size.max(1)],
                cur: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn add(&self, entry: StateEntry) {
        let mut ring = self.lock();
        let cap = ring.entries.len();
        let next = (ring.cur + 1) % cap;
        ring.entries[next] = entry;
        ring.cur = next;
    }

    /// Most recent entry, or an empty one before the first evaluation.
    pub fn get_last(&self) -> StateEntry {
        let ring = self.lock();
        ring.entries[ring.cur].clone()
    }

    /// All recorded entries, newest first.
    pub fn get_all(&self) -> Vec<StateEntry> {
        let ring = self.lock();
        let cap = ring.entries.len();
        let mut out = Vec::with_capacity(cap);
        let mut idx = ring.cur;
        for _ in 0..cap {
            let e = &ring.entries[idx];
            if !e.is_zero() {
                out.push(e.clone());
            }
            idx = (idx + cap - 1) % cap;
        }
        out
    }
}
