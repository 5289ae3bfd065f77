pub(crate) mod arena;
pub(crate) mod global;
pub(crate) mod handle;
pub(crate) mod large;
pub(crate) mod remote;
pub(crate) mod shard;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod vm;

pub use arena::{Allocator, DEFAULT_CHUNK_SIZE, DEFAULT_SHARD_SIZE, VirtualAllocConfig};
pub use global::GlobalVirtualAlloc;
pub use handle::{HANDLE_WORDS, Handle};
pub use size_class::{MAX_CLASS_SIZE, MIN_CLASS_SIZE};
pub use stats::AllocatorStats;
pub use vm::VmError;
