//! # tessera-memory - Device-Memory Abstraction Layer
//!
//! Memory layer of the Tessera heterogeneous compute runtime. It defines
//! how a block of memory living on a compute device (or shared between
//! host and device) is represented, host-mapped, filled, copied, and
//! synchronized against an asynchronous command stream.
//!
//! ## Architecture
//!
//! ```text
//! Engine ── allocate / import ──▶ Arc<DeviceBuffer> ─┐
//!    │                                               ├─▶ dyn Memory
//! AttachedMemory::attach ──▶ Arc<AttachedMemory> ────┘
//!    │
//! Stream (FIFO worker) ◀── fill / copy jobs ── Event tokens
//!    │
//! MemoryGuard<T> / SurfacesGuard ── lock .. unlock (RAII)
//! ```
//!
//! ## Synchronization model
//!
//! - `fill` / `copy_from` enqueue device work and return an [`Event`]
//!   without blocking; callers wait on the token when they need the result.
//! - `lock` is the single host-blocking boundary: it waits for writes
//!   previously enqueued against the memory before returning a pointer.
//! - No ordering exists between operations on different streams against
//!   the same memory; such hazards are the caller's to resolve.
//!
//! ## Example
//!
//! ```
//! use tessera_memory::{
//!     AllocationKind, DataType, Engine, EngineKind, Format, Layout, Memory, MemoryGuard, MemoryRef,
//! };
//!
//! # fn main() -> tessera_memory::Result<()> {
//! let engine = Engine::new(EngineKind::Reference);
//! let stream = engine.create_stream();
//!
//! let layout = Layout::new(DataType::F32, Format::Nchw, vec![256]);
//! let mem: MemoryRef = engine.allocate(layout, AllocationKind::DeviceDedicated, false)?;
//!
//! // Asynchronous fill; the guard's lock waits for it before mapping.
//! mem.fill(&stream, 0)?;
//! let guard: MemoryGuard<'_, f32> = MemoryGuard::new(&mem, &stream);
//! assert_eq!(guard.size(), 256);
//! assert_eq!(guard[255], 0.0);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod event;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod stream;

pub use engine::{Engine, EngineKind};
pub use error::{MemoryError, Result};
pub use event::{Event, EventStatus};
pub use layout::{DataType, Format, Layout, Padding};
pub use lock::{MemoryGuard, SurfacesGuard};
pub use memory::device::DeviceBuffer;
pub use memory::host::AttachedMemory;
pub use memory::{AllocationKind, Memory, MemoryRef, NativeDescriptor};
pub use stream::Stream;
