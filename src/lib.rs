//! Sub-allocating device memory manager.
//!
//! [Allocator]: crate::allocator::Allocator
//! [Pool]: crate::pool::Pool
//! [Allocation]: crate::allocation::Allocation
//! [BlockVector]: crate::vector::BlockVector
//! [MemoryDevice]: crate::device::MemoryDevice
//!
//! # Overview
//!
//! tl;dr - [Allocator] hands out sub-regions of big device memory blocks so
//! you almost never pay for a real device allocation, and it can evict or
//! compact what you let it.
//!
//! The management hierarchy is as follows:
//!
//! ## Device memory
//!
//! Real memory objects come from the host through the [MemoryDevice] trait,
//! injected once at construction together with the device's memory type and
//! heap tables. Querying the device for memory is slow (on the order of
//! milliseconds) and the object count is limited, so real allocations should
//! happen rarely.
//!
//! ## Blocks
//!
//! A block is one real memory object, owned by the block vector of its
//! memory category. Blocks are created on demand (deliberately undersized
//! at first) and freed when they drain. Each block's byte range is carved
//! up by its metadata into suballocations.
//!
//! ## Allocations
//!
//! An [Allocation] is what callers hold: either a sub-region of a shared
//! block or, for very large resources, a dedicated memory object of its
//! own. Allocations may opt into the lost-allocation protocol, letting the
//! allocator reclaim them under pressure; the [Allocator] also offers an
//! online defragmenter that repacks allocations into denser placements.
//!
//! Callers that need isolation create a [Pool]: a private block vector with
//! a fixed block size and its own eviction timing.

#[macro_use]
extern crate bitflags;

pub mod allocation;
pub mod allocator;
pub mod defrag;
pub mod device;
pub mod error;
pub mod pool;
pub mod stats;

mod block;
mod metadata;
mod vector;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::allocation::{Allocation, AllocationCreateFlags, AllocationCreateInfo,
                            MemoryUsage, UserData, FRAME_INDEX_LOST};
pub use crate::allocator::{AllocationInfo, Allocator, AllocatorCreateInfo,
                           MemoryRequirements};
pub use crate::defrag::{DefragmentationInfo, DefragmentationStats, DefragmentationStatus};
pub use crate::device::{DeviceCallbacks, DeviceMemoryHandle, MemoryDevice, MemoryHeap,
                        MemoryPropertyFlags, MemoryType, PhysicalMemoryProperties,
                        ResourceHandle};
pub use crate::error::AllocError;
pub use crate::metadata::{FitStrategy, SuballocationKind};
pub use crate::pool::{Pool, PoolCreateInfo, PoolStats};
pub use crate::stats::{StatInfo, Stats};

/// Free regions smaller than this are not worth indexing for search; they
/// only come back through coalescing.
pub const MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER: u64 = 16;

/// Default block size for memory types backed by heaps larger than
/// [SMALL_HEAP_MAX_SIZE].
pub const DEFAULT_LARGE_HEAP_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Heaps at or below this size get blocks of an eighth of the heap instead
/// of the large default.
pub const SMALL_HEAP_MAX_SIZE: u64 = 512 * 1024 * 1024;

/// How many times an eviction-based allocation retries after losing the
/// touch race before giving up with
/// [AllocError::TooManyContendingThreads].
pub(crate) const ALLOCATION_TRY_COUNT: u32 = 32;

/// How many times a new default-vector block may be halved below the
/// preferred size.
pub(crate) const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;
