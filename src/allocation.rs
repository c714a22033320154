//! The allocation handle returned to callers.
//!
//! An [Allocation] is either a sub-region of a shared [DeviceMemoryBlock]
//! or a dedicated memory object of its own. The handle carries the lock-free
//! last-use bookkeeping that drives the lost-allocation protocol: "touching"
//! an allocation and evicting it race on a single atomic word, never on a
//! mutex, so recording usage stays off every lock in the crate.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::block::DeviceMemoryBlock;
use crate::device::{DeviceMemoryHandle, MemoryPropertyFlags};
use crate::metadata::SuballocationKind;
use crate::pool::Pool;

/// Sentinel value of the last-use frame index marking an allocation as lost.
pub const FRAME_INDEX_LOST: u32 = u32::MAX;

// Configuration ///////////////////////////////////////////////////////////////////////////////////

/// Coarse intended-usage classes, translated into required/preferred
/// property flags when picking a memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// No stated preference.
    Unknown,
    /// Device-only resources: textures, attachments, static geometry.
    GpuOnly,
    /// Host-side staging memory.
    CpuOnly,
    /// Written by the host, read by the device (uploads).
    CpuToGpu,
    /// Written by the device, read by the host (readbacks).
    GpuToCpu,
}

impl Default for MemoryUsage {
    fn default() -> MemoryUsage { MemoryUsage::Unknown }
}

/// Behavior switches for one allocation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationCreateFlags {
    /// Give this allocation its own memory object, never a sub-region.
    pub dedicated: bool,
    /// Only place into existing blocks; never create a new one.
    pub never_allocate: bool,
    /// Map the memory for the whole lifetime of the allocation.
    pub persistent_map: bool,
    /// Allow the allocator to reclaim this allocation to satisfy a
    /// higher-priority request once it has gone unused long enough.
    pub can_become_lost: bool,
    /// Allow this request to evict other (willing) allocations.
    pub can_make_other_lost: bool,
}

/// Full description of one allocation request. More specific routing
/// overrides less specific: an explicit `pool` wins over `memory_type_bits`,
/// which narrows whatever the flags and `usage` select.
#[derive(Clone)]
pub struct AllocationCreateInfo {
    pub usage: MemoryUsage,
    pub flags: AllocationCreateFlags,
    /// Property flags the chosen memory type must have.
    pub required_flags: MemoryPropertyFlags,
    /// Property flags worth trading type choice for.
    pub preferred_flags: MemoryPropertyFlags,
    /// Acceptable memory types, one bit per type index. `0` means no
    /// restriction.
    pub memory_type_bits: u32,
    /// Route the allocation into a caller-created pool.
    pub pool: Option<Arc<Pool>>,
    pub user_data: UserData,
}

impl Default for AllocationCreateInfo {
    fn default() -> AllocationCreateInfo {
        AllocationCreateInfo {
            usage: MemoryUsage::Unknown,
            flags: AllocationCreateFlags::default(),
            required_flags: MemoryPropertyFlags::empty(),
            preferred_flags: MemoryPropertyFlags::empty(),
            memory_type_bits: 0,
            pool: None,
            user_data: UserData::None,
        }
    }
}

/// Host data attached to an allocation, surfaced again in snapshots and the
/// detailed statistics dump.
#[derive(Debug, Clone, PartialEq)]
pub enum UserData {
    None,
    /// An opaque value carried verbatim.
    Opaque(u64),
    /// An owned copy of a host string.
    Text(String),
}

impl Default for UserData {
    fn default() -> UserData { UserData::None }
}

// Allocation //////////////////////////////////////////////////////////////////////////////////////

/// Where an [Allocation]'s bytes actually live.
pub(crate) enum AllocationPayload {
    /// A sub-region of a shared block. Does not own the block.
    Block {
        block: Arc<DeviceMemoryBlock>,
        offset: u64,
        kind: SuballocationKind,
        /// Present when the allocation was routed into a caller pool, so
        /// freeing can find the right block vector.
        pool: Option<Arc<Pool>>,
    },
    /// A whole memory object owned outright.
    Dedicated {
        memory_type_index: u32,
        memory: DeviceMemoryHandle,
        mapped: Option<NonNull<u8>>,
    },
    /// Manufactured in the lost state; never had memory.
    Lost,
}

/// One granted region of device memory.
///
/// Handles are shared (`Arc`) between the caller and the block metadata that
/// records the region. Freeing is always explicit through
/// [Allocator::free_memory](crate::allocator::Allocator::free_memory);
/// dropping the last handle without freeing is a leak, not a free.
pub struct Allocation {
    /// Frame index of the last use, or [FRAME_INDEX_LOST]. The only
    /// lock-free mutable state in the crate.
    last_use_frame_index: AtomicU32,
    size: u64,
    alignment: u64,
    can_become_lost: bool,
    persistently_mapped: bool,
    map_ref_count: AtomicU32,
    pub(crate) payload: RwLock<AllocationPayload>,
    user_data: Mutex<UserData>,
    /// Set by the first free; catches double frees in debug builds.
    retired: AtomicBool,
}

// The raw mapped pointer inside a Dedicated payload is only handed out to
// the caller and never dereferenced by the allocator itself.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("can_become_lost", &self.can_become_lost)
            .field("persistently_mapped", &self.persistently_mapped)
            .finish_non_exhaustive()
    }
}

impl Allocation {
    pub(crate) fn new_block(current_frame_index: u32,
                            block: Arc<DeviceMemoryBlock>,
                            offset: u64,
                            alignment: u64,
                            size: u64,
                            kind: SuballocationKind,
                            pool: Option<Arc<Pool>>,
                            can_become_lost: bool,
                            persistently_mapped: bool,
                            user_data: UserData) -> Allocation {
        Allocation {
            last_use_frame_index: AtomicU32::new(current_frame_index),
            size,
            alignment,
            can_become_lost,
            persistently_mapped,
            map_ref_count: AtomicU32::new(0),
            payload: RwLock::new(AllocationPayload::Block { block, offset, kind, pool }),
            user_data: Mutex::new(user_data),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn new_dedicated(current_frame_index: u32,
                                memory_type_index: u32,
                                memory: DeviceMemoryHandle,
                                size: u64,
                                mapped: Option<NonNull<u8>>,
                                persistently_mapped: bool,
                                user_data: UserData) -> Allocation {
        Allocation {
            last_use_frame_index: AtomicU32::new(current_frame_index),
            size,
            alignment: 0,
            can_become_lost: false,
            persistently_mapped,
            map_ref_count: AtomicU32::new(0),
            payload: RwLock::new(AllocationPayload::Dedicated {
                memory_type_index, memory, mapped,
            }),
            user_data: Mutex::new(user_data),
            retired: AtomicBool::new(false),
        }
    }

    /// An allocation that starts out lost, for callers that want a uniform
    /// "check and reallocate" path.
    pub(crate) fn new_lost() -> Allocation {
        Allocation {
            last_use_frame_index: AtomicU32::new(FRAME_INDEX_LOST),
            size: 0,
            alignment: 0,
            can_become_lost: true,
            persistently_mapped: false,
            map_ref_count: AtomicU32::new(0),
            payload: RwLock::new(AllocationPayload::Lost),
            user_data: Mutex::new(UserData::None),
            retired: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 { self.size }
    #[inline]
    pub fn alignment(&self) -> u64 { self.alignment }
    #[inline]
    pub fn can_become_lost(&self) -> bool { self.can_become_lost }
    #[inline]
    pub fn persistently_mapped(&self) -> bool { self.persistently_mapped }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.last_use_frame_index.load(Ordering::Acquire) == FRAME_INDEX_LOST
    }

    #[inline]
    pub(crate) fn last_use_frame_index(&self) -> u32 {
        self.last_use_frame_index.load(Ordering::Acquire)
    }

    pub fn user_data(&self) -> UserData {
        self.user_data.lock().clone()
    }

    pub fn set_user_data(&self, user_data: UserData) {
        *self.user_data.lock() = user_data;
    }

    /// Records a use of this allocation in the given frame.
    ///
    /// Returns `false` if the allocation is lost; a lost allocation never
    /// comes back. Compare-and-swap loop so concurrent touches and a racing
    /// eviction resolve without a lock: whoever swaps first wins.
    pub fn touch(&self, current_frame_index: u32) -> bool {
        let mut last_use = self.last_use_frame_index.load(Ordering::Acquire);
        loop {
            if last_use == FRAME_INDEX_LOST {
                return false;
            }
            if last_use == current_frame_index {
                return true;
            }
            match self.last_use_frame_index.compare_exchange_weak(
                last_use, current_frame_index, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => last_use = observed,
            }
        }
    }

    /// Attempts to transition this allocation to the lost state.
    ///
    /// Fails (`false`) if the allocation was used in the current frame or
    /// within `frame_in_use_count` frames back, or if another thread touched
    /// it mid-swap. The caller must then abandon its whole eviction request.
    pub(crate) fn make_lost(&self, current_frame_index: u32, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);
        let mut last_use = self.last_use_frame_index.load(Ordering::Acquire);
        loop {
            if last_use == FRAME_INDEX_LOST {
                // another eviction won the race
                return false;
            }
            if last_use.saturating_add(frame_in_use_count) >= current_frame_index {
                return false;
            }
            match self.last_use_frame_index.compare_exchange_weak(
                last_use, FRAME_INDEX_LOST, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => last_use = observed,
            }
        }
    }

    /// Repoints a block allocation after a defragmentation move.
    pub(crate) fn change_block_allocation(&self, new_block: Arc<DeviceMemoryBlock>, new_offset: u64) {
        let mut payload = self.payload.write();
        match &mut *payload {
            AllocationPayload::Block { block, offset, .. } => {
                *block = new_block;
                *offset = new_offset;
            }
            _ => debug_assert!(false, "not a block allocation"),
        }
    }

    #[inline]
    pub(crate) fn map_ref_count(&self) -> u32 {
        self.map_ref_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn map_ref_inc(&self) {
        self.map_ref_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn map_ref_dec(&self) -> u32 {
        let prev = self.map_ref_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unmap without a matching map");
        prev - 1
    }

    /// Marks the handle as freed. Returns `false` on a repeated free, which
    /// is a programmer error (asserted in debug builds).
    pub(crate) fn retire(&self) -> bool {
        let already = self.retired.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "allocation freed twice");
        !already
    }

    /// Offset within the owning block, or the allocation's own object.
    /// Meaningless once lost.
    pub(crate) fn block_offset(&self) -> u64 {
        match &*self.payload.read() {
            AllocationPayload::Block { offset, .. } => *offset,
            _ => 0,
        }
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////


#[cfg(test)]
impl Allocation {
    /// A detached allocation handle for metadata and protocol tests.
    pub(crate) fn new_for_tests(last_use_frame: u32, size: u64, can_become_lost: bool) -> Allocation {
        Allocation {
            last_use_frame_index: AtomicU32::new(last_use_frame),
            size,
            alignment: 1,
            can_become_lost,
            persistently_mapped: false,
            map_ref_count: AtomicU32::new(0),
            payload: RwLock::new(AllocationPayload::Lost),
            user_data: Mutex::new(UserData::None),
            retired: AtomicBool::new(false),
        }
    }
}
