#[cfg(not(target_pointer_width = "64"))]
compile_error!("virtual-alloc supports only 64-bit targets.");

#[cfg(not(unix))]
compile_error!("virtual-alloc supports only unix targets.");

pub(crate) mod sync;

// public module: building blocks are crate-private, the API is re-exported
// below
pub mod memory;

// C ABI (see include/virtual_alloc.h)
pub mod ffi;

// allocator and handles
pub use memory::{Allocator, GlobalVirtualAlloc, HANDLE_WORDS, Handle, VirtualAllocConfig};

// geometry
pub use memory::{DEFAULT_CHUNK_SIZE, DEFAULT_SHARD_SIZE, MAX_CLASS_SIZE, MIN_CLASS_SIZE};

// stats/errors
pub use memory::{AllocatorStats, VmError};
