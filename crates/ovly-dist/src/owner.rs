//! Generation-checked owner handles.
//!
//! DistMap entries and package records refer back to the package directory
//! that owns them. Instead of weak pointers the references are small
//! `(index, generation)` handles into an [`OwnerRegistry`]. A released slot
//! is reused with a bumped generation, so a stale handle can never alias the
//! next owner of that slot.

use std::fmt;
use std::sync::Mutex;

/// Handle to a registered owner (a package directory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for OwnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Identifies the in-memory package record behind a volatile DistMap entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub owner: OwnerHandle,
    /// Ebuild version string (unique within the owner)
    pub version: String,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    name: Option<String>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Arena of owner slots
#[derive(Debug, Default)]
pub struct OwnerRegistry {
    inner: Mutex<Slots>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new owner and return its handle
    pub fn register(&self, name: &str) -> OwnerHandle {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.name = Some(name.to_string());
            return OwnerHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            name: Some(name.to_string()),
        });
        OwnerHandle {
            index,
            generation: 0,
        }
    }

    /// Release a handle. Returns false if it was already stale.
    pub fn release(&self, handle: OwnerHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let live = match inner.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.name.is_some() => {
                slot.name = None;
                true
            }
            _ => false,
        };
        if live {
            inner.free.push(handle.index);
        }
        live
    }

    pub fn is_live(&self, handle: OwnerHandle) -> bool {
        self.name(handle).is_some()
    }

    /// Name the owner was registered with, if the handle is still live
    pub fn name(&self, handle: OwnerHandle) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.name.clone())
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|s| s.name.is_some()).count()
    }
}
