//! Scoped host-access guards
//!
//! [`MemoryGuard`] maps one memory for typed host access for the guard's
//! lifetime; [`SurfacesGuard`] maps a group of memories together so callers
//! never observe a partially-mapped group. Both release on every exit path
//! from their scope and are not cloneable: at most one guard instance
//! references a given acquisition.

use crate::engine::EngineKind;
use crate::memory::MemoryRef;
use crate::stream::Stream;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Typed scoped mapping of one memory region
///
/// Construction locks the memory (blocking on pending device writes) and
/// stores a pointer typed to the caller's element type. Element access is
/// bounds-checked against `size()`; an out-of-range index is a
/// precondition violation and panics. Dropping the guard invalidates the
/// stored pointer first, then unlocks exactly once.
///
/// The guard borrows its stream and every element reference borrows the
/// guard, so a mapping cannot outlive the stream and an element reference
/// cannot outlive the mapping, including through an unnamed temporary.
pub struct MemoryGuard<'s, T: bytemuck::Pod> {
    mem: MemoryRef,
    stream: &'s Stream,
    ptr: *mut T,
    len: usize,
}

impl<'s, T: bytemuck::Pod> MemoryGuard<'s, T> {
    /// Lock `mem` and expose it as elements of `T`
    ///
    /// # Panics
    ///
    /// Panics if the mapped address is not aligned for `T`.
    pub fn new(mem: &MemoryRef, stream: &'s Stream) -> Self {
        let raw = mem.lock(stream);
        assert!(
            (raw as usize) % std::mem::align_of::<T>() == 0,
            "mapped region is not aligned for the element type"
        );
        let len = mem.size() / std::mem::size_of::<T>();
        Self {
            mem: Arc::clone(mem),
            stream,
            ptr: raw.cast::<T>(),
            len,
        }
    }

    /// Number of whole elements in the mapped view
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Raw typed pointer to the mapped region
    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }
}

impl<T: bytemuck::Pod> Index<usize> for MemoryGuard<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(index < self.len, "element index {index} out of range for view of {} elements", self.len);
        unsafe { &*self.ptr.add(index) }
    }
}

impl<T: bytemuck::Pod> IndexMut<usize> for MemoryGuard<'_, T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        assert!(index < self.len, "element index {index} out of range for view of {} elements", self.len);
        unsafe { &mut *self.ptr.add(index) }
    }
}

impl<T: bytemuck::Pod> Drop for MemoryGuard<'_, T> {
    fn drop(&mut self) {
        self.ptr = std::ptr::null_mut();
        self.mem.unlock(self.stream);
    }
}

/// Scoped mapping of a group of surfaces
///
/// Shared and imported surfaces must be mapped as a unit: interleaving
/// partial mappings with an external owner can deadlock against the driver
/// or expose inconsistent state. The factory is keyed by engine category;
/// every surface is locked before `create` returns and the whole group is
/// released in reverse order on drop.
pub struct SurfacesGuard<'s> {
    surfaces: Vec<MemoryRef>,
    stream: &'s Stream,
}

impl<'s> SurfacesGuard<'s> {
    pub fn create(kind: EngineKind, surfaces: Vec<MemoryRef>, stream: &'s Stream) -> Self {
        match kind {
            EngineKind::Reference => {
                for mem in &surfaces {
                    mem.lock(stream);
                }
            }
        }
        tracing::trace!(surfaces = surfaces.len(), "surface group mapped");
        Self { surfaces, stream }
    }

    /// Number of surfaces held by this guard
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

impl Drop for SurfacesGuard<'_> {
    fn drop(&mut self) {
        for mem in self.surfaces.iter().rev() {
            mem.unlock(self.stream);
        }
        tracing::trace!(surfaces = self.surfaces.len(), "surface group released");
    }
}
