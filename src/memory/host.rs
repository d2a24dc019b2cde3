//! Host-pointer view over externally owned memory
//!
//! [`AttachedMemory`] wraps a caller-owned host pointer behind the
//! [`Memory`] contract. The data is always host-resident, so `lock` hands
//! the wrapped pointer straight back, `unlock` discards it, and the
//! asynchronous operations are no-ops returning already-complete tokens:
//! this view does not own or manage the underlying content.

use crate::engine::Engine;
use crate::error::{MemoryError, Result};
use crate::event::Event;
use crate::layout::Layout;
use crate::memory::{AllocationKind, Memory, MemoryRef, NativeDescriptor};
use crate::stream::Stream;
use std::any::Any;
use std::sync::Arc;

/// Non-owning view of an externally managed host region
pub struct AttachedMemory {
    ptr: *mut u8,
    layout: Layout,
    bytes: usize,
}

// The wrapped pointer is only dereferenced by holders of the view, under
// the same external-synchronization contract as `attach`.
unsafe impl Send for AttachedMemory {}
unsafe impl Sync for AttachedMemory {}

impl AttachedMemory {
    /// Wrap an externally owned host region
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of
    /// `layout.bytes_count()` bytes for the whole lifetime of the returned
    /// memory and every clone of it, and the caller is responsible for
    /// synchronizing host access with any other users of the region.
    pub unsafe fn attach(ptr: *mut u8, layout: Layout) -> Arc<Self> {
        let bytes = layout.bytes_count();
        Arc::new(Self { ptr, layout, bytes })
    }
}

impl Memory for AttachedMemory {
    fn lock(&self, _stream: &Stream) -> *mut u8 {
        self.ptr
    }

    fn unlock(&self, _stream: &Stream) {}

    fn fill(&self, _stream: &Stream, _value: u8) -> Result<Event> {
        Ok(Event::completed())
    }

    fn zero(&self, _stream: &Stream) -> Result<Event> {
        Ok(Event::completed())
    }

    fn copy_from(&self, _stream: &Stream, src: &MemoryRef) -> Result<Event> {
        if src.size() != self.bytes {
            return Err(MemoryError::SizeMismatch {
                expected: self.bytes,
                actual: src.size(),
            });
        }
        Ok(Event::completed())
    }

    fn copy_from_host(&self, _stream: &Stream, src: &[u8]) -> Result<Event> {
        if src.len() != self.bytes {
            return Err(MemoryError::SizeMismatch {
                expected: self.bytes,
                actual: src.len(),
            });
        }
        Ok(Event::completed())
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
        AllocationKind::UnmanagedHost
    }

    fn is_reused(&self) -> bool {
        false
    }

    fn engine_id(&self) -> Option<u64> {
        None
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        None
    }

    fn internal_params(&self) -> NativeDescriptor {
        NativeDescriptor::Empty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for AttachedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedMemory")
            .field("bytes", &self.bytes)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::layout::{DataType, Format};

    fn view(backing: &mut [u8]) -> Arc<AttachedMemory> {
        let layout = Layout::new(DataType::U8, Format::Nchw, vec![backing.len()]);
        unsafe { AttachedMemory::attach(backing.as_mut_ptr(), layout) }
    }

    fn stream() -> Stream {
        Engine::new(EngineKind::Reference).create_stream()
    }

    #[test]
    fn test_lock_returns_wrapped_pointer() {
        let mut backing = vec![0u8; 32];
        let expected = backing.as_mut_ptr();
        let mem = view(&mut backing);
        let stream = stream();

        let ptr = mem.lock(&stream);
        assert_eq!(ptr, expected);
        mem.unlock(&stream);

        // Address unchanged across a full lock cycle
        assert_eq!(mem.lock(&stream), expected);
        mem.unlock(&stream);
    }

    #[test]
    fn test_fill_is_noop_with_completed_token() {
        let mut backing = vec![0x42u8; 32];
        let mem = view(&mut backing);
        let stream = stream();

        let event = mem.fill(&stream, 0xFF).unwrap();
        assert!(event.is_complete());
        let event = mem.zero(&stream).unwrap();
        assert!(event.is_complete());

        drop(mem);
        assert!(backing.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_copy_from_host_is_noop_with_completed_token() {
        let mut backing = vec![0x42u8; 32];
        let mem = view(&mut backing);
        let stream = stream();

        let event = mem.copy_from_host(&stream, &[0u8; 32]).unwrap();
        assert!(event.is_complete());

        assert!(matches!(
            mem.copy_from_host(&stream, &[0u8; 16]),
            Err(MemoryError::SizeMismatch { expected: 32, actual: 16 })
        ));

        drop(mem);
        assert!(backing.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_no_engine_and_empty_descriptor() {
        let mut backing = vec![0u8; 16];
        let mem = view(&mut backing);

        assert_eq!(mem.engine_id(), None);
        assert!(mem.engine().is_none());
        assert_eq!(mem.allocation_kind(), AllocationKind::UnmanagedHost);
        assert_eq!(mem.internal_params(), NativeDescriptor::Empty);

        let engine = Engine::new(EngineKind::Reference);
        assert!(!mem.is_allocated_by(&engine));
    }

    #[test]
    fn test_size_accessors() {
        let mut backing = vec![0u8; 64];
        let mem = view(&mut backing);
        assert_eq!(mem.size(), 64);
        assert_eq!(mem.count(), 64);
    }
}
