use std::sync::atomic::{AtomicU64, Ordering};

use accel_sys::ObjectKind;

/// Counters of reference-counting calls made through the public backend surface.
///
/// Internal references the runtime takes for its own bookkeeping (in-flight commands, queue
/// chaining) are not counted, so for any balanced host program
/// `created + retained == released` per kind once every host handle is gone.
#[derive(Debug, Default)]
pub struct Ledger {
    created: [AtomicU64; 6],
    retained: [AtomicU64; 6],
    released: [AtomicU64; 6],
    destroyed: [AtomicU64; 6],
}

impl Ledger {
    pub(crate) fn inc_created(&self, kind: ObjectKind) {
        self.created[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_retained(&self, kind: ObjectKind) {
        self.retained[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_released(&self, kind: ObjectKind) {
        self.released[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_destroyed(&self, kind: ObjectKind) {
        self.destroyed[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let load = |counters: &[AtomicU64; 6]| {
            let mut out = [0u64; 6];
            for (slot, counter) in out.iter_mut().zip(counters) {
                *slot = counter.load(Ordering::Relaxed);
            }
            out
        };
        LedgerSnapshot {
            created: load(&self.created),
            retained: load(&self.retained),
            released: load(&self.released),
            destroyed: load(&self.destroyed),
        }
    }
}

/// Point-in-time copy of [`Ledger`], indexed by [`ObjectKind`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    created: [u64; 6],
    retained: [u64; 6],
    released: [u64; 6],
    destroyed: [u64; 6],
}

impl LedgerSnapshot {
    pub fn created(&self, kind: ObjectKind) -> u64 {
        self.created[kind.index()]
    }

    pub fn retained(&self, kind: ObjectKind) -> u64 {
        self.retained[kind.index()]
    }

    pub fn released(&self, kind: ObjectKind) -> u64 {
        self.released[kind.index()]
    }

    pub fn destroyed(&self, kind: ObjectKind) -> u64 {
        self.destroyed[kind.index()]
    }

    /// Host references still outstanding for `kind`.
    pub fn outstanding(&self, kind: ObjectKind) -> i64 {
        (self.created(kind) + self.retained(kind)) as i64 - self.released(kind) as i64
    }

    /// True when every host reference of every kind has been released.
    pub fn is_balanced(&self) -> bool {
        ObjectKind::ALL.iter().all(|&kind| self.outstanding(kind) == 0)
    }
}
