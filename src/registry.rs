//! A process-wide table of loaded modules addressed by opaque handles.
//!
//! Handles carry the generation of the slot they were issued for. Removing a
//! module bumps the generation, so a stale handle never reaches a module
//! loaded into the same slot later.

use crate::{LoadedModule, os::Host};
use alloc::vec::Vec;
use core::{ffi::c_void, num::NonZeroUsize};
use spin::RwLock;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// An opaque reference to a module in a [`ModuleTable`].
///
/// Never zero, so it maps onto a non-null pointer on the C side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    fn new(index: usize, generation: u32) -> Option<Self> {
        if index >= INDEX_MASK {
            return None;
        }
        NonZeroUsize::new(((generation as usize) << INDEX_BITS) | (index + 1)).map(Handle)
    }

    fn index(self) -> Option<usize> {
        (self.0.get() & INDEX_MASK).checked_sub(1)
    }

    fn generation(self) -> u32 {
        (self.0.get() >> INDEX_BITS) as u32
    }

    #[inline]
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Handle)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn from_ptr(ptr: *const c_void) -> Option<Self> {
        Self::from_raw(ptr as usize)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }
}

struct Slot<H: Host> {
    generation: u32,
    module: Option<LoadedModule<H>>,
}

struct TableInner<H: Host> {
    slots: Vec<Slot<H>>,
    free: Vec<usize>,
    /// Occupied slots in load order.
    order: Vec<usize>,
}

impl<H: Host> TableInner<H> {
    fn slot(&self, handle: Handle) -> Option<&Slot<H>> {
        let slot = self.slots.get(handle.index()?)?;
        (slot.generation == handle.generation() && slot.module.is_some()).then_some(slot)
    }
}

/// Loaded modules indexed by [`Handle`].
///
/// Lookups take the read lock; insertion and removal take the write lock.
pub struct ModuleTable<H: Host> {
    inner: RwLock<TableInner<H>>,
}

impl<H: Host> Default for ModuleTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host> ModuleTable<H> {
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                slots: Vec::new(),
                free: Vec::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Stores `module` and returns its handle.
    ///
    /// Returns the module back if the table has run out of slots.
    pub fn insert(&self, module: LoadedModule<H>) -> Result<Handle, LoadedModule<H>> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index = inner.slots.len();
                if Handle::new(index, 0).is_none() {
                    return Err(module);
                }
                inner.slots.push(Slot {
                    generation: 0,
                    module: None,
                });
                index
            }
        };
        let slot = &mut inner.slots[index];
        let Some(handle) = Handle::new(index, slot.generation) else {
            return Err(module);
        };
        #[cfg(feature = "log")]
        log::trace!(
            "[registry] {} -> slot {} generation {}",
            module.name(),
            index,
            slot.generation
        );
        slot.module = Some(module);
        inner.order.push(index);
        Ok(handle)
    }

    /// Runs `f` on the module behind `handle` under the read lock.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&LoadedModule<H>) -> R) -> Option<R> {
        let inner = self.inner.read();
        inner.slot(handle)?.module.as_ref().map(f)
    }

    /// Takes the module out of the table and invalidates `handle`.
    pub fn remove(&self, handle: Handle) -> Option<LoadedModule<H>> {
        let mut inner = self.inner.write();
        let index = handle.index()?;
        inner.slot(handle)?;
        let slot = &mut inner.slots[index];
        let module = slot.module.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.order.retain(|&idx| idx != index);
        inner.free.push(index);
        module
    }

    /// Searches every module in load order.
    pub fn find_global(&self, name: &[u8]) -> Option<*const ()> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|&idx| inner.slots[idx].module.as_ref())
            .find_map(|module| module.get_bytes(name))
    }

    /// The loaded modules, in load order.
    pub fn snapshot(&self) -> Vec<LoadedModule<H>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|&idx| inner.slots[idx].module.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_round_trip_through_pointers() {
        let handle = Handle::new(3, 7).unwrap();
        assert_eq!(handle.index(), Some(3));
        assert_eq!(handle.generation(), 7);
        assert_eq!(Handle::from_ptr(handle.as_ptr()), Some(handle));
        assert_eq!(Handle::from_raw(0), None);
    }

    #[test]
    fn first_slot_handle_is_not_null() {
        let handle = Handle::new(0, 0).unwrap();
        assert_ne!(handle.into_raw(), 0);
    }

    #[test]
    fn generation_distinguishes_reused_slots() {
        let old = Handle::new(0, 0).unwrap();
        let new = Handle::new(0, 1).unwrap();
        assert_ne!(old, new);
        assert_eq!(old.index(), new.index());
    }
}
