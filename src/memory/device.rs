//! Engine-backed memory regions
//!
//! [`DeviceBuffer`] is the leaf behind the device-dedicated,
//! host-visible-shared, and imported-external allocation kinds. The backing
//! store is an aligned fixed-address region written by stream jobs;
//! imported surfaces wrap the backing store of an existing region without
//! owning it.
//!
//! Each buffer tracks the last pending write event. `lock` takes that
//! token and waits on it before handing out the host pointer, which makes
//! the mapped view consistent with previously-enqueued fills and copies on
//! the stream.

use crate::engine::Engine;
use crate::error::{MemoryError, Result};
use crate::event::Event;
use crate::layout::Layout;
use crate::memory::{AllocationKind, Memory, MemoryRef, NativeDescriptor};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::alloc::Layout as AllocLayout;
use std::any::Any;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// Fixed-address backing region for device-side writes
///
/// The address is stable for the lifetime of the storage and aligned for
/// any element type the typed guard exposes. Stream jobs write through the
/// raw pointer; the lock/event protocol orders those writes against host
/// access, so the storage itself carries no lock.
pub(crate) struct DeviceStorage {
    ptr: NonNull<u8>,
    len: usize,
    alloc: AllocLayout,
}

// Stream workers write through the raw pointer while holders on other
// threads keep the Arc alive. Access ordering is the lock/event protocol's
// responsibility, not the storage's.
unsafe impl Send for DeviceStorage {}
unsafe impl Sync for DeviceStorage {}

impl DeviceStorage {
    /// Alignment of every backing region, wide enough for any Pod element
    const ALIGN: usize = 64;

    fn new_zeroed(len: usize) -> Self {
        let alloc = AllocLayout::from_size_align(len.max(1), Self::ALIGN).expect("invalid backing allocation size");
        let raw = unsafe { std::alloc::alloc_zeroed(alloc) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(alloc),
        };
        Self { ptr, len, alloc }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DeviceStorage {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.alloc) };
    }
}

/// Engine-backed memory region
///
/// Created through [`Engine::allocate`](crate::engine::Engine::allocate) or
/// [`Engine::import`](crate::engine::Engine::import); shared among holders
/// as `Arc<DeviceBuffer>` or type-erased [`MemoryRef`].
pub struct DeviceBuffer {
    engine: Weak<Engine>,
    engine_id: u64,
    buffer_id: u64,
    layout: Layout,
    // Cached so accessors and the reset predicate never re-derive it from
    // descriptor state after the engine is gone.
    bytes: usize,
    kind: AllocationKind,
    reused: bool,
    owns_storage: bool,
    storage: Arc<DeviceStorage>,
    lock_count: Mutex<usize>,
    pending: Mutex<Option<Event>>,
}

impl DeviceBuffer {
    pub(crate) fn new(
        engine: Weak<Engine>,
        engine_id: u64,
        buffer_id: u64,
        layout: Layout,
        kind: AllocationKind,
        reused: bool,
    ) -> Self {
        let bytes = layout.bytes_count();
        Self {
            engine,
            engine_id,
            buffer_id,
            layout,
            bytes,
            kind,
            reused,
            owns_storage: true,
            storage: Arc::new(DeviceStorage::new_zeroed(bytes)),
            lock_count: Mutex::new(0),
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn imported(
        engine: Weak<Engine>,
        engine_id: u64,
        buffer_id: u64,
        layout: Layout,
        storage: Arc<DeviceStorage>,
        reused: bool,
    ) -> Self {
        let bytes = layout.bytes_count();
        Self {
            engine,
            engine_id,
            buffer_id,
            layout,
            bytes,
            kind: AllocationKind::ImportedExternal,
            reused,
            owns_storage: false,
            storage,
            lock_count: Mutex::new(0),
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn storage(&self) -> &Arc<DeviceStorage> {
        &self.storage
    }

    /// Stable identity of this buffer within its engine
    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    /// Current depth of the reentrant lock
    pub fn lock_count(&self) -> usize {
        *self.lock_count.lock()
    }

    fn mark_pending(&self, event: &Event) {
        *self.pending.lock() = Some(event.clone());
    }

    /// Wait for the last enqueued write before exposing host content.
    /// A failed task leaves the content undefined but the mapping valid;
    /// the failure stays observable on the caller's token.
    fn wait_pending(&self) {
        let pending = self.pending.lock().take();
        if let Some(event) = pending {
            if let Err(err) = event.wait() {
                tracing::warn!(buffer = self.buffer_id, %err, "pending device write failed before host mapping");
            }
        }
    }

    fn enqueue_upload(&self, stream: &Stream, staged: Vec<u8>) -> Event {
        let storage = Arc::clone(&self.storage);
        let event = stream.enqueue(move || unsafe {
            std::ptr::copy_nonoverlapping(staged.as_ptr(), storage.as_ptr(), staged.len());
        });
        self.mark_pending(&event);
        event
    }
}

impl Memory for DeviceBuffer {
    fn lock(&self, _stream: &Stream) -> *mut u8 {
        let mut count = self.lock_count.lock();
        if *count == 0 {
            self.wait_pending();
        }
        *count += 1;
        tracing::trace!(buffer = self.buffer_id, locks = *count, "memory locked");
        self.storage.as_ptr()
    }

    fn unlock(&self, _stream: &Stream) {
        let mut count = self.lock_count.lock();
        assert!(*count > 0, "unlock without a matching lock");
        *count -= 1;
        tracing::trace!(buffer = self.buffer_id, locks = *count, "memory unlocked");
    }

    fn fill(&self, stream: &Stream, value: u8) -> Result<Event> {
        let storage = Arc::clone(&self.storage);
        let bytes = self.bytes;
        let event = stream.enqueue(move || unsafe {
            std::ptr::write_bytes(storage.as_ptr(), value, bytes);
        });
        self.mark_pending(&event);
        tracing::debug!(buffer = self.buffer_id, bytes, value, "fill enqueued");
        Ok(event)
    }

    fn zero(&self, stream: &Stream) -> Result<Event> {
        self.fill(stream, 0)
    }

    fn copy_from(&self, stream: &Stream, src: &MemoryRef) -> Result<Event> {
        if src.size() != self.bytes {
            return Err(MemoryError::SizeMismatch {
                expected: self.bytes,
                actual: src.size(),
            });
        }
        if let Some(src_engine) = src.engine_id() {
            if src_engine != self.engine_id {
                return Err(MemoryError::EngineMismatch {
                    expected: self.engine_id,
                    actual: src_engine,
                });
            }
        }

        if let Some(device_src) = src.as_any().downcast_ref::<DeviceBuffer>() {
            let src_storage = Arc::clone(&device_src.storage);
            let dst_storage = Arc::clone(&self.storage);
            let bytes = self.bytes;
            // memmove: imported surfaces may alias the source backing store
            let event = stream.enqueue(move || unsafe {
                std::ptr::copy(src_storage.as_ptr(), dst_storage.as_ptr(), bytes);
            });
            self.mark_pending(&event);
            tracing::debug!(
                buffer = self.buffer_id,
                src = device_src.buffer_id,
                bytes,
                direction = "D2D",
                "copy enqueued"
            );
            Ok(event)
        } else {
            // Host-resident source: stage through its lock so any pending
            // writes are observed, then upload asynchronously.
            let ptr = src.lock(stream);
            let staged = unsafe { std::slice::from_raw_parts(ptr.cast_const(), src.size()) }.to_vec();
            src.unlock(stream);

            let event = self.enqueue_upload(stream, staged);
            tracing::debug!(buffer = self.buffer_id, bytes = self.bytes, direction = "H2D", "copy enqueued");
            Ok(event)
        }
    }

    fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<Event> {
        if src.len() != self.bytes {
            return Err(MemoryError::SizeMismatch {
                expected: self.bytes,
                actual: src.len(),
            });
        }

        let event = self.enqueue_upload(stream, src.to_vec());
        tracing::debug!(buffer = self.buffer_id, bytes = self.bytes, direction = "H2D", "upload enqueued");
        Ok(event)
    }

    fn size(&self) -> usize {
        self.bytes
    }

    fn count(&self) -> usize {
        self.layout.count()
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn allocation_kind(&self) -> AllocationKind {
        self.kind
    }

    fn is_reused(&self) -> bool {
        self.reused
    }

    fn engine_id(&self) -> Option<u64> {
        Some(self.engine_id)
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.upgrade()
    }

    fn internal_params(&self) -> NativeDescriptor {
        NativeDescriptor::Buffer {
            engine: self.engine_id,
            buffer: self.buffer_id,
            ptr: self.storage.as_ptr() as usize,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.owns_storage {
            if let Some(engine) = self.engine.upgrade() {
                engine.on_release(self.buffer_id);
            }
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("engine", &self.engine_id)
            .field("buffer", &self.buffer_id)
            .field("bytes", &self.bytes)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::layout::{DataType, Format};

    fn setup(elements: usize) -> (Arc<Engine>, Stream, Arc<DeviceBuffer>) {
        let engine = Engine::new(EngineKind::Reference);
        let stream = engine.create_stream();
        let layout = Layout::new(DataType::F32, Format::Nchw, vec![elements]);
        let mem = engine
            .allocate(layout, AllocationKind::DeviceDedicated, false)
            .unwrap();
        (engine, stream, mem)
    }

    fn read_bytes(mem: &DeviceBuffer, stream: &Stream) -> Vec<u8> {
        let ptr = mem.lock(stream);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.cast_const(), mem.size()) }.to_vec();
        mem.unlock(stream);
        bytes
    }

    #[test]
    fn test_allocation_is_zeroed() {
        let (_engine, stream, mem) = setup(64);
        assert_eq!(mem.size(), 256);
        assert!(read_bytes(&mem, &stream).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_visible_after_lock() {
        let (_engine, stream, mem) = setup(64);

        // No explicit wait: lock must block on the pending fill
        mem.fill(&stream, 0xAB).unwrap();
        assert!(read_bytes(&mem, &stream).iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_zero_after_fill() {
        let (_engine, stream, mem) = setup(64);

        mem.fill(&stream, 0xFF).unwrap();
        let event = mem.zero(&stream).unwrap();
        event.wait().unwrap();
        assert!(read_bytes(&mem, &stream).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_from_host_roundtrip() {
        let (_engine, stream, mem) = setup(64);

        let data: Vec<u8> = (0..=255).collect();
        let event = mem.copy_from_host(&stream, &data).unwrap();
        event.wait().unwrap();
        assert_eq!(read_bytes(&mem, &stream), data);
    }

    #[test]
    fn test_copy_from_host_size_mismatch() {
        let (_engine, stream, mem) = setup(64);

        let err = mem.copy_from_host(&stream, &[0u8; 128]).unwrap_err();
        match err {
            MemoryError::SizeMismatch { expected, actual } => {
                assert_eq!(expected, 256);
                assert_eq!(actual, 128);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
        // Nothing was enqueued: content stays zeroed
        assert!(read_bytes(&mem, &stream).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device_to_device_copy() {
        let (engine, stream, src) = setup(64);
        let dst = engine
            .allocate(
                Layout::new(DataType::F32, Format::Nchw, vec![64]),
                AllocationKind::DeviceDedicated,
                false,
            )
            .unwrap();

        src.fill(&stream, 0x5A).unwrap();
        let src_ref: MemoryRef = src.clone();
        let event = dst.copy_from(&stream, &src_ref).unwrap();
        event.wait().unwrap();

        assert!(read_bytes(&dst, &stream).iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_copy_size_mismatch_rejected_before_enqueue() {
        let (engine, stream, dst) = setup(64);
        let small = engine
            .allocate(
                Layout::new(DataType::F32, Format::Nchw, vec![32]),
                AllocationKind::DeviceDedicated,
                false,
            )
            .unwrap();

        dst.fill(&stream, 0x11).unwrap().wait().unwrap();

        let small_ref: MemoryRef = small.clone();
        assert!(matches!(
            dst.copy_from(&stream, &small_ref),
            Err(MemoryError::SizeMismatch { expected: 256, actual: 128 })
        ));
        // Destination content untouched by the rejected copy
        assert!(read_bytes(&dst, &stream).iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_cross_engine_copy_rejected() {
        let (_engine_a, stream, dst) = setup(64);
        let engine_b = Engine::new(EngineKind::Reference);
        let foreign = engine_b
            .allocate(
                Layout::new(DataType::F32, Format::Nchw, vec![64]),
                AllocationKind::DeviceDedicated,
                false,
            )
            .unwrap();

        let foreign_ref: MemoryRef = foreign.clone();
        assert!(matches!(
            dst.copy_from(&stream, &foreign_ref),
            Err(MemoryError::EngineMismatch { .. })
        ));
    }

    #[test]
    fn test_copy_from_host_view_source() {
        use crate::memory::host::AttachedMemory;

        let (_engine, stream, dst) = setup(64);
        let mut backing: Vec<u8> = (0..=255).collect();
        let src = unsafe {
            AttachedMemory::attach(
                backing.as_mut_ptr(),
                Layout::new(DataType::U8, Format::Nchw, vec![256]),
            )
        };

        let src_ref: MemoryRef = src;
        let event = dst.copy_from(&stream, &src_ref).unwrap();
        event.wait().unwrap();
        assert_eq!(read_bytes(&dst, &stream), backing);
    }

    #[test]
    fn test_reentrant_lock() {
        let (_engine, stream, mem) = setup(4);

        let first = mem.lock(&stream);
        let second = mem.lock(&stream);
        assert_eq!(first, second);
        assert_eq!(mem.lock_count(), 2);

        mem.unlock(&stream);
        assert_eq!(mem.lock_count(), 1);
        mem.unlock(&stream);
        assert_eq!(mem.lock_count(), 0);
    }

    #[test]
    #[should_panic(expected = "unlock without a matching lock")]
    fn test_unbalanced_unlock_panics() {
        let (_engine, stream, mem) = setup(4);
        mem.unlock(&stream);
    }

    #[test]
    fn test_identity_and_accessors() {
        let (engine, _stream, mem) = setup(64);

        assert!(mem.is_allocated_by(&engine));
        assert_eq!(mem.engine_id(), Some(engine.id()));
        assert_eq!(mem.count(), 64);
        assert_eq!(mem.allocation_kind(), AllocationKind::DeviceDedicated);
        assert!(!mem.is_reused());

        let other = Engine::new(EngineKind::Reference);
        assert!(!mem.is_allocated_by(&other));

        match mem.internal_params() {
            NativeDescriptor::Buffer { engine: e, buffer, ptr } => {
                assert_eq!(e, engine.id());
                assert_eq!(buffer, mem.buffer_id());
                assert_ne!(ptr, 0);
            }
            other => panic!("expected Buffer descriptor, got {other:?}"),
        }
    }

    #[test]
    fn test_imported_surface_shares_backing() {
        let (engine, stream, source) = setup(64);

        let imported = engine
            .import(&source, Layout::new(DataType::F32, Format::Nchw, vec![64]))
            .unwrap();
        assert_eq!(imported.allocation_kind(), AllocationKind::ImportedExternal);

        source.fill(&stream, 0x7E).unwrap().wait().unwrap();
        assert!(read_bytes(&imported, &stream).iter().all(|&b| b == 0x7E));
    }

    #[test]
    fn test_failed_task_still_releases_lock_path() {
        let (_engine, stream, mem) = setup(4);

        // Force a failed pending event; lock must still map and warn
        let event = stream.enqueue(|| panic!("injected device fault"));
        mem.mark_pending(&event);

        let ptr = mem.lock(&stream);
        assert!(!ptr.is_null());
        mem.unlock(&stream);
    }
}
