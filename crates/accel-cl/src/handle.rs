//! Reference-counted ownership of backend objects.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use accel_sys::{
    Backend, ObjectKind, RawContext, RawEvent, RawHandle, RawKernel, RawMem, RawProgram, RawQueue,
};
use tracing::error;

use crate::error::{Result, StatusExt};

pub(crate) trait Kind: 'static {
    const KIND: ObjectKind;
    type Raw: Copy + Eq + Hash + fmt::Debug + Send + Sync;

    fn handle(raw: Self::Raw) -> RawHandle;
}

macro_rules! kinds {
    ($($name:ident => $raw:ident, $kind:ident;)*) => {
        $(
            pub(crate) enum $name {}

            impl Kind for $name {
                const KIND: ObjectKind = ObjectKind::$kind;
                type Raw = $raw;

                fn handle(raw: $raw) -> RawHandle {
                    raw.handle()
                }
            }
        )*
    };
}

kinds! {
    ContextKind => RawContext, Context;
    QueueKind => RawQueue, Queue;
    MemKind => RawMem, Mem;
    ProgramKind => RawProgram, Program;
    KernelKind => RawKernel, Kernel;
    EventKind => RawEvent, Event;
}

/// Owns exactly one native reference. Cloning retains, dropping releases.
pub(crate) struct Handle<K: Kind> {
    backend: Arc<dyn Backend>,
    raw: K::Raw,
}

impl<K: Kind> Handle<K> {
    /// Adopts the reference a `create_*` or `enqueue_*` call returned.
    pub fn adopt(backend: Arc<dyn Backend>, raw: K::Raw) -> Self {
        Self { backend, raw }
    }

    pub fn raw(&self) -> K::Raw {
        self.raw
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Native reference count. Only meaningful for diagnostics; other threads and in-flight
    /// commands change it at any time.
    pub fn reference_count(&self) -> Result<u32> {
        self.backend
            .reference_count(K::KIND, K::handle(self.raw))
            .check("reference_count")
    }
}

impl<K: Kind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        if let Err(status) = self.backend.retain(K::KIND, K::handle(self.raw)) {
            error!(kind = %K::KIND, raw = ?self.raw, %status, "retain failed");
            debug_assert!(false, "retain of live {} failed: {status}", K::KIND);
        }
        Self {
            backend: self.backend.clone(),
            raw: self.raw,
        }
    }
}

impl<K: Kind> Drop for Handle<K> {
    fn drop(&mut self) {
        if let Err(status) = self.backend.release(K::KIND, K::handle(self.raw)) {
            error!(kind = %K::KIND, raw = ?self.raw, %status, "release failed");
            debug_assert!(
                std::thread::panicking(),
                "release of {} failed: {status}",
                K::KIND
            );
        }
    }
}

impl<K: Kind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: Kind> Eq for Handle<K> {}

impl<K: Kind> Hash for Handle<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: Kind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", K::KIND, self.raw)
    }
}
