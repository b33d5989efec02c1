//! Debug-only allocation registry for leak detection at shutdown.
//!
//! Activated via `--features debug-alloc`.  Every owning [`Buffer`] and
//! owning [`SurfacePlane`] then records an `(id, size)` note in one of two
//! process-wide registries and removes it again when its memory is freed.
//!
//! # Usage
//!
//! ```rust,ignore
//! // ... application releases every buffer and surface ...
//! assert!(vframe_core::debug_alloc::check_allocation_counters());
//! ```
//!
//! Without the feature the hooks compile away and
//! [`check_allocation_counters`] always returns `true`.  The
//! [`AllocationRegistry`] type itself is always available.
//!
//! Removal is O(n) over an unordered list; this is a diagnostic path, not a
//! production one.
//!
//! [`Buffer`]: crate::buffer::Buffer
//! [`SurfacePlane`]: crate::plane::SurfacePlane

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// One outstanding allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocNote {
    pub id: u64,
    /// Last known size in bytes.  Buffers may change size during their
    /// lifetime, so notes are matched by id only.
    pub size: u64,
}

#[derive(Default)]
struct RegistryState {
    notes: Vec<AllocNote>,
    next_id: u64,
}

/// Table of outstanding allocations guarded by a single mutex.
pub struct AllocationRegistry {
    state: Mutex<RegistryState>,
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationRegistry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                notes: Vec::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new allocation and return its id.
    pub fn register(&self, size: u64) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.notes.push(AllocNote { id, size });
        id
    }

    /// Update the last known size of an outstanding allocation.
    pub fn resize(&self, id: u64, size: u64) {
        let mut state = self.lock();
        if let Some(note) = state.notes.iter_mut().find(|n| n.id == id) {
            note.size = size;
        }
    }

    /// Forget an allocation.  Returns `false` if `id` was not outstanding.
    pub fn release(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.notes.len();
        state.notes.retain(|n| n.id != id);
        state.notes.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().notes.iter().any(|n| n.id == id)
    }

    /// Snapshot of every outstanding note, in registration order.
    pub fn leaked(&self) -> Vec<AllocNote> {
        self.lock().notes.clone()
    }

    /// Log every outstanding note under `label`; returns the count.
    pub fn report(&self, label: &'static str) -> usize {
        let leaked = self.leaked();
        for note in &leaked {
            warn!(registry = label, id = note.id, size = note.size, "leaked allocation");
        }
        leaked.len()
    }
}

#[cfg(feature = "debug-alloc")]
pub use inner::*;

#[cfg(feature = "debug-alloc")]
mod inner {
    use super::AllocationRegistry;

    static BUFFERS: AllocationRegistry = AllocationRegistry::new();
    static SURFACES: AllocationRegistry = AllocationRegistry::new();

    /// Registry of owning pinned host buffers.
    pub fn buffers() -> &'static AllocationRegistry {
        &BUFFERS
    }

    /// Registry of owning device surface planes.
    pub fn surfaces() -> &'static AllocationRegistry {
        &SURFACES
    }
}

/// Call once after the application has released all memory objects.
///
/// Logs every leaked buffer and surface plane; returns `true` when none leaked.
#[cfg(feature = "debug-alloc")]
pub fn check_allocation_counters() -> bool {
    let leaked_buffers = buffers().report("buffers");
    let leaked_surfaces = surfaces().report("surfaces");
    tracing::info!(leaked_buffers, leaked_surfaces, "Allocation counters checked");
    leaked_buffers == 0 && leaked_surfaces == 0
}

#[cfg(not(feature = "debug-alloc"))]
pub fn check_allocation_counters() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_allocations_leave_no_notes() {
        let registry = AllocationRegistry::new();
        let ids: Vec<u64> = (0..8).map(|i| registry.register(i * 16)).collect();
        for id in ids {
            assert!(registry.release(id));
        }
        assert!(registry.is_empty());
        assert!(registry.leaked().is_empty());
    }

    #[test]
    fn one_missing_free_reports_exactly_that_note() {
        let registry = AllocationRegistry::new();
        let ids: Vec<u64> = (0..5).map(|i| registry.register(100 + i)).collect();
        registry.resize(ids[3], 4096);
        for (i, id) in ids.iter().enumerate() {
            if i != 3 {
                registry.release(*id);
            }
        }
        assert_eq!(
            registry.leaked(),
            vec![AllocNote {
                id: ids[3],
                size: 4096
            }]
        );
        assert_eq!(registry.report("test"), 1);
    }

    #[test]
    fn ids_are_unique_and_release_is_idempotent() {
        let registry = AllocationRegistry::new();
        let a = registry.register(1);
        let b = registry.register(1);
        assert_ne!(a, b);
        assert!(registry.release(a));
        assert!(!registry.release(a));
        assert!(registry.contains(b));
    }

    #[test]
    fn concurrent_register_release_balances() {
        let registry = std::sync::Arc::new(AllocationRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for size in 0..250 {
                        let id = registry.register(size);
                        registry.release(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert!(registry.is_empty());
    }
}
