//! Engine identity and the allocation boundary
//!
//! An [`Engine`] is the device/context identity memories are created
//! against. The placement policy that picks allocation kinds and recycles
//! buffers lives outside this layer; the engine only materializes what it
//! is asked for, keeps accounting of live allocations, and answers
//! identity checks.

use crate::error::{MemoryError, Result};
use crate::layout::Layout;
use crate::memory::device::DeviceBuffer;
use crate::memory::{AllocationKind, Memory};
use crate::stream::Stream;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Backend category of an engine
///
/// Closed set, matched exhaustively wherever it keys a dispatch (e.g. the
/// surface-group lock factory), so a new backend is a compile-visible
/// event. `Reference` is the in-process software device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// In-process software device
    Reference,
}

struct AllocationRecord {
    bytes: usize,
    kind: AllocationKind,
}

/// Device/context identity and creation boundary for memory regions
pub struct Engine {
    id: u64,
    kind: EngineKind,
    allocations: DashMap<u64, AllocationRecord>,
    next_buffer_id: AtomicU64,
    total_bytes: AtomicUsize,
    // Handed to memories as their non-owning back-reference
    self_ref: Weak<Engine>,
}

impl Engine {
    pub fn new(kind: EngineKind) -> Arc<Self> {
        static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(engine = id, kind = ?kind, "engine created");
        Arc::new_cyclic(|self_ref| Self {
            id,
            kind,
            allocations: DashMap::new(),
            next_buffer_id: AtomicU64::new(1),
            total_bytes: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Open a new command stream on this engine
    pub fn create_stream(&self) -> Stream {
        Stream::new(self.id)
    }

    /// Materialize a new engine-backed region
    ///
    /// `reused` is handed in by the external pooling mechanism and marks
    /// allocations whose physical region may back multiple logical tensors
    /// over its lifetime.
    ///
    /// # Errors
    ///
    /// Unmanaged-host views are constructed through
    /// [`AttachedMemory::attach`](crate::memory::host::AttachedMemory::attach)
    /// and imported surfaces through [`Engine::import`]; asking the
    /// allocator for those kinds is rejected.
    pub fn allocate(&self, layout: Layout, kind: AllocationKind, reused: bool) -> Result<Arc<DeviceBuffer>> {
        match kind {
            AllocationKind::DeviceDedicated | AllocationKind::HostVisibleShared => {}
            AllocationKind::UnmanagedHost | AllocationKind::ImportedExternal => {
                return Err(MemoryError::UnsupportedAllocationKind(kind));
            }
        }

        let buffer_id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let memory = DeviceBuffer::new(self.self_ref.clone(), self.id, buffer_id, layout, kind, reused);
        let bytes = memory.size();

        self.allocations.insert(buffer_id, AllocationRecord { bytes, kind });
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        tracing::debug!(engine = self.id, buffer = buffer_id, bytes, kind = ?kind, "memory allocated");

        Ok(Arc::new(memory))
    }

    /// Wrap the backing store of an existing region as an imported surface
    ///
    /// The imported memory shares physical bytes with `source` but carries
    /// its own layout, identity, and lock state. The source allocation
    /// keeps ownership of the backing store.
    pub fn import(&self, source: &Arc<DeviceBuffer>, layout: Layout) -> Result<Arc<DeviceBuffer>> {
        let storage = source.storage();
        let required = layout.bytes_count();
        if required > storage.len() {
            return Err(MemoryError::ImportTooLarge {
                required,
                available: storage.len(),
            });
        }

        let buffer_id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let memory = DeviceBuffer::imported(self.self_ref.clone(), self.id, buffer_id, layout, Arc::clone(storage), false);
        tracing::debug!(engine = self.id, buffer = buffer_id, bytes = required, "surface imported");

        Ok(Arc::new(memory))
    }

    pub(crate) fn on_release(&self, buffer_id: u64) {
        if let Some((_, record)) = self.allocations.remove(&buffer_id) {
            self.total_bytes.fetch_sub(record.bytes, Ordering::Relaxed);
            tracing::debug!(
                engine = self.id,
                buffer = buffer_id,
                bytes = record.bytes,
                kind = ?record.kind,
                "memory released"
            );
        }
    }

    /// Number of live owned allocations
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Total bytes held by live owned allocations
    pub fn allocated_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("allocations", &self.allocations.len())
            .finish()
    }
}
