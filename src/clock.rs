//! A scalar [Lamport logical clock](https://en.wikipedia.org/wiki/Lamport_timestamp).
//!
//! Every process keeps one [`LamportClock`]. Sending a packet advances it;
//! receiving one folds in the sender's timestamp. The resulting values give
//! a total order across the whole group once ties are broken by
//! [`ProcessId`], which is exactly what [`crate::mutex_engine::MutexEngine`]
//! uses to decide who goes first.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process identifier, unique within the fixed-size peer group.
pub type ProcessId = i32;

/// A Lamport timestamp. Ordered the usual way; ties between packets from
/// different processes are broken by [`ProcessId`] wherever that matters
/// (see [`crate::packet::Packet::happens_before`]).
pub type LamportTime = u64;

/// A process's logical clock.
///
/// ```
/// use distromon::clock::LamportClock;
///
/// let clock = LamportClock::new();
/// let t1 = clock.tick();
/// let t2 = clock.tick();
/// assert!(t2 > t1);
/// ```
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
        }
    }

    /// Advance the clock for an outgoing event and return the new value.
    pub fn tick(&self) -> LamportTime {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold in a timestamp observed on an incoming packet: `max(local, remote) + 1`.
    pub fn observe(&self, remote: LamportTime) -> LamportTime {
        self.time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(remote) + 1)
            })
            .expect("fetch_update closure never returns None");
        self.time.load(Ordering::SeqCst)
    }

    /// The current value, without advancing it.
    pub fn current(&self) -> LamportTime {
        self.time.load(Ordering::SeqCst)
    }
}
