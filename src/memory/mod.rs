//! Memory abstraction over heterogeneous backing stores
//!
//! One polymorphic contract ([`Memory`]) unifies the physically different
//! regions the runtime hands out: device-dedicated allocations,
//! host-visible shared regions, imported external surfaces, and unmanaged
//! host pointers. The set of implementations is fixed and keyed by
//! [`AllocationKind`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Memory (trait)                    │
//! │  lock / unlock · fill / zero · copy_from             │
//! │  identity · reuse-reset predicate · accessors        │
//! └───────────────┬──────────────────────┬───────────────┘
//!                 ▼                      ▼
//!         ┌──────────────┐      ┌─────────────────┐
//!         │ DeviceBuffer │      │ AttachedMemory  │
//!         │ dedicated /  │      │ unmanaged host  │
//!         │ shared /     │      │ pointer view    │
//!         │ imported     │      └─────────────────┘
//!         └──────────────┘
//! ```
//!
//! Fill and copy are asynchronous: they enqueue work on a [`Stream`] and
//! return an [`Event`] immediately. `lock` is the one host-blocking
//! synchronization boundary; it waits for pending device writes before
//! exposing a host pointer.

pub mod device;
pub mod host;

use crate::engine::Engine;
use crate::error::Result;
use crate::event::Event;
use crate::layout::Layout;
use crate::stream::Stream;
use std::any::Any;
use std::sync::Arc;

/// Physical backing-store category of a memory region
///
/// Closed, purely classificatory set; a region's kind never changes after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Externally owned host pointer with no device binding
    UnmanagedHost,
    /// Device-resident allocation owned by an engine
    DeviceDedicated,
    /// Engine allocation visible to both host and device
    HostVisibleShared,
    /// Surface imported from outside the engine allocator
    ImportedExternal,
}

/// Opaque native-handle descriptor for driver-level interop
///
/// Host-pointer views report the explicit [`NativeDescriptor::Empty`]
/// variant; engine-backed regions expose their engine/buffer identity and
/// backing address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeDescriptor {
    /// No native handle backs this region
    Empty,
    /// Engine-owned linear buffer
    Buffer { engine: u64, buffer: u64, ptr: usize },
}

/// Shared handle to a memory region
///
/// A region is shared among every holder referencing the same logical
/// tensor; the backing store is released when the last holder drops.
pub type MemoryRef = Arc<dyn Memory>;

/// Polymorphic contract over one backing region
///
/// # Thread safety
///
/// Implementations keep their internal state consistent under concurrent
/// calls, but overlapping `lock`/`unlock` windows from multiple threads are
/// not given a meaning at this contract level; callers serialize host
/// access themselves.
pub trait Memory: Send + Sync {
    /// Map the region for host access
    ///
    /// Host-blocking: waits for device writes previously enqueued against
    /// this memory before returning, so reads through the pointer observe
    /// up-to-date content. Locking is reentrant; the pointer stays valid
    /// until the matching number of [`Memory::unlock`] calls.
    fn lock(&self, stream: &Stream) -> *mut u8;

    /// Release one prior [`Memory::lock`]
    ///
    /// Unbalanced unlocks are a precondition violation and panic.
    fn unlock(&self, stream: &Stream);

    /// Asynchronously set every byte to `value`
    fn fill(&self, stream: &Stream, value: u8) -> Result<Event>;

    /// Asynchronous zero fill
    fn zero(&self, stream: &Stream) -> Result<Event>;

    /// Asynchronously copy the full contents of `src` into this region
    ///
    /// Byte counts must match and `src` must not belong to a different
    /// engine; violations are reported before any work is enqueued, so no
    /// partial copy ever starts.
    fn copy_from(&self, stream: &Stream, src: &MemoryRef) -> Result<Event>;

    /// Asynchronously upload a host slice of matching byte size
    ///
    /// The slice is staged before this returns; the caller's buffer is free
    /// immediately.
    fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<Event>;

    /// Byte size of the region (cached at construction)
    fn size(&self) -> usize;

    /// Logical element count
    fn count(&self) -> usize;

    /// Shape/format descriptor
    fn layout(&self) -> &Layout;

    /// Backing-store category
    fn allocation_kind(&self) -> AllocationKind;

    /// Whether an external pool may back multiple logical tensors with this
    /// allocation over its lifetime
    fn is_reused(&self) -> bool;

    /// Identity of the owning engine, absent for host-only views
    fn engine_id(&self) -> Option<u64>;

    /// Owning engine, if it is still alive
    fn engine(&self) -> Option<Arc<Engine>>;

    /// Backend-specific native-handle descriptor
    fn internal_params(&self) -> NativeDescriptor;

    /// Downcast hook for backend-specific fast paths
    fn as_any(&self) -> &dyn Any;

    /// Identity comparison against an engine
    fn is_allocated_by(&self, engine: &Engine) -> bool {
        self.engine_id() == Some(engine.id())
    }

    /// Whether this allocation must be cleared before it is reused as
    /// output storage for `candidate`
    ///
    /// A pool may hand back a larger previously-used region for a smaller
    /// logical tensor; stale bytes beyond the new extent corrupt results
    /// for format families that assume full initialization, notably the
    /// packed binary encoding. The clauses run in this exact order; later
    /// clauses are not independently sufficient.
    fn is_memory_reset_needed(&self, candidate: &Layout) -> bool {
        // Reuse without reset requires a weight or plain data layout,
        // no winograd/image encoding, zero padding, and a full-size match.
        if (!candidate.format().is_weights() && !candidate.format().is_simple_data())
            || candidate.format().is_winograd()
            || candidate.format().is_image()
        {
            return true;
        }

        if !candidate.padding().is_zero() {
            return true;
        }

        if self.size() == candidate.bytes_count() {
            return false;
        }

        true
    }
}
