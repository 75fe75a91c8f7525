//! Lamport clocks for the query and user-event paths.
//!
//! Remote timestamps are merged with [`LamportClock::witness`]; new local
//! timestamps are produced with [`LamportClock::increment`]. The counter is a
//! single atomic shared behind an `Arc` by any number of tasks.
//!
//! Remote peers choose the times we witness, so the counter saturates at
//! `u64::MAX` instead of wrapping.
//!
//! [`LamportBuffer`] uses these timestamps to suppress duplicate deliveries.

use std::sync::atomic::{AtomicU64, Ordering};

pub type LamportTime = u64;

#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value without advancing.
    pub fn time(&self) -> LamportTime {
        self.counter.load(Ordering::SeqCst)
    }

    /// Advances the clock and returns the new timestamp.
    pub fn increment(&self) -> LamportTime {
        self.advance(|cur| cur.saturating_add(1))
    }

    /// Merges an observed remote time: local becomes `max(local, observed)`.
    pub fn witness(&self, observed: LamportTime) {
        self.counter.fetch_max(observed, Ordering::SeqCst);
    }

    /// Merges an observed time and stamps a new event after it,
    /// yielding `max(local, observed) + 1`.
    pub fn witness_and_increment(&self, observed: LamportTime) -> LamportTime {
        self.advance(|cur| cur.max(observed).saturating_add(1))
    }

    fn advance(&self, next: impl Fn(LamportTime) -> LamportTime) -> LamportTime {
        let prev = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(next(cur)))
            .unwrap_or_else(|prev| prev);
        next(prev)
    }
}

/// Outcome of offering a stamped message to a [`LamportBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    Duplicate,
    /// Older than the window the buffer remembers.
    TooOld,
}

/// Remembers which messages were seen for the last `size` Lamport times.
///
/// Slot `ltime % size` holds the keys seen at that time; a newer time reusing
/// the slot evicts them.
#[derive(Debug)]
pub struct LamportBuffer<K> {
    slots: Vec<(LamportTime, Vec<K>)>,
}

impl<K: PartialEq> LamportBuffer<K> {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| (0, Vec::new())).collect(),
        }
    }

    /// Records `key` at `ltime` given the current clock value.
    pub fn admit(&mut self, current: LamportTime, ltime: LamportTime, key: K) -> Admission {
        let size = self.slots.len() as u64;
        if current > size && ltime < current - size {
            return Admission::TooOld;
        }

        let (slot_time, seen) = &mut self.slots[(ltime % size) as usize];
        if *slot_time == ltime {
            if seen.contains(&key) {
                return Admission::Duplicate;
            }
        } else {
            *slot_time = ltime;
            seen.clear();
        }
        seen.push(key);
        Admission::New
    }
}
