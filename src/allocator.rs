//! The top-level allocator.
//!
//! [Allocator] owns one default [BlockVector](crate::vector::BlockVector)
//! per memory type plus the per-type dedicated-allocation lists, and exposes
//! the public operations: allocate, free, map, bind, statistics,
//! defragmentation, and the per-frame index that drives lost-allocation
//! timing. Memory type selection layers the coarse usage enum, explicit
//! required/preferred property flags, a memory-type bitmask, and pool
//! routing; each layer is more specific than the last.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::json;

use crate::allocation::{Allocation, AllocationCreateInfo, AllocationPayload, MemoryUsage,
                        UserData};
use crate::block::DeviceMemoryBlock;
use crate::defrag::{DefragCandidate, DefragmentationInfo, DefragmentationStats,
                    DefragmentationStatus};
use crate::device::{DeviceCallbacks, DeviceContext, DeviceMemoryHandle, MemoryDevice,
                    MemoryPropertyFlags, PhysicalMemoryProperties, ResourceHandle};
use crate::error::AllocError;
use crate::metadata::{FitStrategy, SuballocationKind};
use crate::pool::{Pool, PoolCreateInfo};
use crate::stats::{StatInfo, Stats};
use crate::vector::BlockVector;
use crate::{DEFAULT_LARGE_HEAP_BLOCK_SIZE, SMALL_HEAP_MAX_SIZE};

/// Construction parameters for [Allocator].
pub struct AllocatorCreateInfo {
    /// The injected native entry points.
    pub device: Arc<dyn MemoryDevice>,
    /// The device's memory topology, queried once by the host.
    pub properties: PhysicalMemoryProperties,
    /// Preferred size for blocks from large heaps; `0` selects the default
    /// of 256 MiB. Heaps of at most 512 MiB use an eighth of the heap
    /// instead.
    pub preferred_large_heap_block_size: u64,
    /// How many frames back an allocation's last use still protects it
    /// from eviction.
    pub frame_in_use_count: u32,
    /// Optional per-heap byte ceilings, for simulating smaller memory.
    pub heap_size_limits: Option<Vec<u64>>,
    pub callbacks: Option<Box<dyn DeviceCallbacks>>,
    /// Extra free bytes kept around every allocation.
    pub debug_margin: u64,
    /// Minimum alignment applied on top of every request's own.
    pub debug_min_alignment: u64,
}

impl AllocatorCreateInfo {
    pub fn new(device: Arc<dyn MemoryDevice>, properties: PhysicalMemoryProperties)
               -> AllocatorCreateInfo {
        AllocatorCreateInfo {
            device,
            properties,
            preferred_large_heap_block_size: 0,
            frame_in_use_count: 0,
            heap_size_limits: None,
            callbacks: None,
            debug_margin: 0,
            debug_min_alignment: 1,
        }
    }
}

/// What the host needs to know about a resource before asking for memory.
/// Mirrors the native memory-requirements query plus the dedicated-
/// allocation preference bits.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Acceptable memory types reported by the device, one bit per index.
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

impl MemoryRequirements {
    pub fn new(size: u64, alignment: u64) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment,
            memory_type_bits: !0,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }
}

/// Point-in-time snapshot of one allocation, used by the host to perform
/// binds and reads. A lost allocation snapshots with no memory handle.
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    pub memory_type_index: u32,
    pub device_memory: Option<DeviceMemoryHandle>,
    pub offset: u64,
    pub size: u64,
    pub mapped_ptr: Option<NonNull<u8>>,
    pub user_data: UserData,
}

/// Owns every block vector and dedicated list; the entry point of the
/// crate.
pub struct Allocator {
    ctx: Arc<DeviceContext>,
    frame_in_use_count: u32,
    current_frame_index: AtomicU32,
    block_vectors: Vec<BlockVector>,
    dedicated: Vec<Mutex<Vec<Arc<Allocation>>>>,
    pools: Mutex<Vec<Arc<Pool>>>,
}

impl Allocator {
    pub fn new(info: AllocatorCreateInfo) -> Allocator {
        let preferred = if info.preferred_large_heap_block_size == 0 {
            DEFAULT_LARGE_HEAP_BLOCK_SIZE
        } else {
            info.preferred_large_heap_block_size
        };
        let frame_in_use_count = info.frame_in_use_count;
        let ctx = Arc::new(DeviceContext::new(
            info.device,
            info.properties,
            info.callbacks,
            info.heap_size_limits,
            info.debug_margin,
            info.debug_min_alignment.max(1),
        ));
        let type_count = ctx.properties.memory_types.len();
        let block_vectors = (0..type_count as u32).map(|index| {
            BlockVector::new(
                ctx.clone(),
                index,
                preferred_block_size_for_type(&ctx.properties, index, preferred),
                0,
                usize::max_value(),
                false,
                frame_in_use_count,
                FitStrategy::BestFit,
            )
        }).collect();
        let dedicated = (0..type_count).map(|_| Mutex::new(Vec::new())).collect();
        Allocator {
            ctx,
            frame_in_use_count,
            current_frame_index: AtomicU32::new(0),
            block_vectors,
            dedicated,
            pools: Mutex::new(Vec::new()),
        }
    }

    // Frame protocol //////////////////////////////////////////////////////////////////////////////

    /// The host must call this once per logical frame for lost-allocation
    /// timing to behave as documented.
    pub fn set_current_frame_index(&self, frame_index: u32) {
        self.current_frame_index.store(frame_index, Ordering::Release);
    }

    #[inline]
    pub fn current_frame_index(&self) -> u32 {
        self.current_frame_index.load(Ordering::Acquire)
    }

    /// The eviction window this allocator's default vectors were built
    /// with. Caller pools may override it per pool.
    #[inline]
    pub fn frame_in_use_count(&self) -> u32 {
        self.frame_in_use_count
    }

    // Memory type selection ///////////////////////////////////////////////////////////////////////

    /// Picks the cheapest memory type satisfying the request: every required
    /// flag present, and as many preferred flags as possible.
    pub fn find_memory_type_index(&self, memory_type_bits: u32,
                                  create_info: &AllocationCreateInfo)
                                  -> Result<u32, AllocError> {
        let (mut required, mut preferred) = usage_to_flags(create_info.usage);
        required |= create_info.required_flags;
        preferred |= create_info.preferred_flags;

        let restriction = if create_info.memory_type_bits == 0 {
            !0
        } else {
            create_info.memory_type_bits
        };
        let acceptable = memory_type_bits & restriction;

        let mut best: Option<(u32, u32)> = None;
        for (index, memory_type) in self.ctx.properties.memory_types.iter().enumerate() {
            if acceptable & (1 << index) == 0 {
                continue;
            }
            if !memory_type.property_flags.contains(required) {
                continue;
            }
            let missing = preferred - memory_type.property_flags;
            let cost = missing.bits().count_ones();
            if cost == 0 {
                return Ok(index as u32);
            }
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((index as u32, cost));
            }
        }
        best.map(|(index, _)| index).ok_or(AllocError::FeatureNotPresent)
    }

    // Allocation //////////////////////////////////////////////////////////////////////////////////

    /// Allocates memory for a resource of unknown kind.
    pub fn allocate_memory(&self, requirements: &MemoryRequirements,
                           create_info: &AllocationCreateInfo)
                           -> Result<Arc<Allocation>, AllocError> {
        self.allocate_memory_internal(requirements, create_info, SuballocationKind::Unknown)
    }

    /// Allocates memory that will back a buffer.
    pub fn allocate_memory_for_buffer(&self, requirements: &MemoryRequirements,
                                      create_info: &AllocationCreateInfo)
                                      -> Result<Arc<Allocation>, AllocError> {
        self.allocate_memory_internal(requirements, create_info, SuballocationKind::Buffer)
    }

    /// Allocates memory that will back an image. `optimal_tiling`
    /// distinguishes tiled images from linear ones for the granularity
    /// conflict rule.
    pub fn allocate_memory_for_image(&self, requirements: &MemoryRequirements,
                                     create_info: &AllocationCreateInfo,
                                     optimal_tiling: bool)
                                     -> Result<Arc<Allocation>, AllocError> {
        let kind = if optimal_tiling {
            SuballocationKind::ImageOptimal
        } else {
            SuballocationKind::ImageLinear
        };
        self.allocate_memory_internal(requirements, create_info, kind)
    }

    fn allocate_memory_internal(&self, requirements: &MemoryRequirements,
                                create_info: &AllocationCreateInfo,
                                kind: SuballocationKind)
                                -> Result<Arc<Allocation>, AllocError> {
        let flags = &create_info.flags;
        let invalid = (flags.dedicated && flags.never_allocate)
            || (flags.persistent_map && flags.can_become_lost)
            || (flags.dedicated && flags.can_become_lost)
            || (create_info.pool.is_some()
                && (flags.dedicated || requirements.requires_dedicated));
        if invalid {
            warn!("rejected allocation with mutually exclusive options");
            return Err(AllocError::InvalidUsage);
        }
        if requirements.size == 0 {
            return Err(AllocError::InvalidUsage);
        }

        let alignment = requirements.alignment
            .max(self.ctx.debug_min_alignment)
            .max(1);

        if let Some(pool) = &create_info.pool {
            return pool.vector().allocate(
                self.current_frame_index(), requirements.size, alignment, kind,
                create_info, Some(pool));
        }

        let mut type_bits = if requirements.memory_type_bits == 0 {
            !0
        } else {
            requirements.memory_type_bits
        };
        let mut last_error = None;
        loop {
            let index = match self.find_memory_type_index(type_bits, create_info) {
                Ok(index) => index,
                // every acceptable type was tried and failed
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            match self.allocate_memory_of_type(index, requirements, alignment,
                                               create_info, kind) {
                Ok(allocation) => return Ok(allocation),
                // transient contention is worth surfacing as-is; another
                // memory type would not help
                Err(AllocError::TooManyContendingThreads) => {
                    return Err(AllocError::TooManyContendingThreads);
                }
                Err(e) => {
                    last_error = Some(e);
                    type_bits &= !(1u32 << index);
                }
            }
        }
    }

    fn allocate_memory_of_type(&self, memory_type_index: u32,
                               requirements: &MemoryRequirements,
                               alignment: u64,
                               create_info: &AllocationCreateInfo,
                               kind: SuballocationKind)
                               -> Result<Arc<Allocation>, AllocError> {
        let flags = &create_info.flags;
        let vector = &self.block_vectors[memory_type_index as usize];
        let size = requirements.size;

        // very large or specially flagged resources get their own memory
        // object outright
        let prefer_dedicated = !flags.can_become_lost
            && (flags.dedicated
                || requirements.requires_dedicated
                || requirements.prefers_dedicated
                || size > vector.preferred_block_size() / 2);

        if prefer_dedicated {
            if flags.never_allocate {
                return Err(AllocError::OutOfDeviceMemory);
            }
            return self.allocate_dedicated(memory_type_index, size, create_info);
        }

        match vector.allocate(self.current_frame_index(), size, alignment, kind,
                              create_info, None) {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                if flags.never_allocate || flags.can_become_lost {
                    return Err(e);
                }
                // last resort: a dedicated object of exactly this size
                match self.allocate_dedicated(memory_type_index, size, create_info) {
                    Ok(allocation) => Ok(allocation),
                    Err(_) => Err(e),
                }
            }
        }
    }

    fn allocate_dedicated(&self, memory_type_index: u32, size: u64,
                          create_info: &AllocationCreateInfo)
                          -> Result<Arc<Allocation>, AllocError> {
        let memory = self.ctx.allocate(memory_type_index, size)?;
        let mapped = if create_info.flags.persistent_map {
            match self.ctx.device.map_memory(memory) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    self.ctx.free(memory_type_index, memory, size);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let allocation = Arc::new(Allocation::new_dedicated(
            self.current_frame_index(), memory_type_index, memory, size, mapped,
            create_info.flags.persistent_map, create_info.user_data.clone()));
        self.dedicated[memory_type_index as usize].lock().push(allocation.clone());
        debug!("memory type {}: dedicated allocation of {} bytes",
               memory_type_index, size);
        Ok(allocation)
    }

    // Free ////////////////////////////////////////////////////////////////////////////////////////

    /// Releases an allocation. Freeing the same allocation twice is a
    /// programmer error; the second call is a no-op.
    pub fn free_memory(&self, allocation: &Arc<Allocation>) {
        if !allocation.retire() {
            return;
        }
        enum Route {
            Block(Option<Arc<Pool>>, u32),
            Dedicated(u32, DeviceMemoryHandle, bool),
            Lost,
        }
        let route = match &*allocation.payload.read() {
            AllocationPayload::Block { block, pool, .. } => {
                Route::Block(pool.clone(), block.memory_type_index())
            }
            AllocationPayload::Dedicated { memory_type_index, memory, mapped } => {
                Route::Dedicated(*memory_type_index, *memory, mapped.is_some())
            }
            AllocationPayload::Lost => Route::Lost,
        };
        match route {
            Route::Block(pool, memory_type_index) => {
                if allocation.is_lost() {
                    // the metadata entry was reclaimed at eviction time
                    return;
                }
                match pool {
                    Some(pool) => pool.vector().free(allocation),
                    None => self.block_vectors[memory_type_index as usize].free(allocation),
                }
            }
            Route::Dedicated(memory_type_index, memory, was_mapped) => {
                {
                    let mut list = self.dedicated[memory_type_index as usize].lock();
                    match list.iter().position(|a| Arc::ptr_eq(a, allocation)) {
                        Some(pos) => { list.swap_remove(pos); }
                        None => debug_assert!(false, "dedicated allocation not tracked"),
                    }
                }
                if was_mapped {
                    self.ctx.device.unmap_memory(memory);
                }
                self.ctx.free(memory_type_index, memory, allocation.size());
            }
            Route::Lost => {}
        }
    }

    // Map & bind //////////////////////////////////////////////////////////////////////////////////

    /// Maps the allocation and returns a pointer to its first byte.
    /// Refused outright for allocations that can become lost.
    pub fn map_memory(&self, allocation: &Arc<Allocation>)
                      -> Result<NonNull<u8>, AllocError> {
        if allocation.can_become_lost() || allocation.is_lost() {
            return Err(AllocError::MapNotAllowed);
        }
        enum Route {
            Block(Arc<DeviceMemoryBlock>, u64),
            Dedicated,
        }
        let route = match &*allocation.payload.read() {
            AllocationPayload::Block { block, offset, .. } => {
                Route::Block(block.clone(), *offset)
            }
            AllocationPayload::Dedicated { .. } => Route::Dedicated,
            AllocationPayload::Lost => return Err(AllocError::MapNotAllowed),
        };
        match route {
            Route::Block(block, offset) => {
                let base = block.map(&self.ctx)?;
                allocation.map_ref_inc();
                Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
            }
            Route::Dedicated => {
                let mut payload = allocation.payload.write();
                match &mut *payload {
                    AllocationPayload::Dedicated { memory, mapped, .. } => {
                        let ptr = match *mapped {
                            Some(ptr) => ptr,
                            None => {
                                let ptr = self.ctx.device.map_memory(*memory)?;
                                *mapped = Some(ptr);
                                ptr
                            }
                        };
                        allocation.map_ref_inc();
                        Ok(ptr)
                    }
                    _ => Err(AllocError::MapFailed),
                }
            }
        }
    }

    pub fn unmap_memory(&self, allocation: &Arc<Allocation>) {
        enum Route {
            Block(Arc<DeviceMemoryBlock>),
            Dedicated,
        }
        let route = match &*allocation.payload.read() {
            AllocationPayload::Block { block, .. } => Route::Block(block.clone()),
            AllocationPayload::Dedicated { .. } => Route::Dedicated,
            AllocationPayload::Lost => return,
        };
        match route {
            Route::Block(block) => {
                allocation.map_ref_dec();
                block.unmap(&self.ctx);
            }
            Route::Dedicated => {
                let remaining = allocation.map_ref_dec();
                if remaining == 0 && !allocation.persistently_mapped() {
                    let mut payload = allocation.payload.write();
                    if let AllocationPayload::Dedicated { memory, mapped, .. } = &mut *payload {
                        if mapped.take().is_some() {
                            self.ctx.device.unmap_memory(*memory);
                        }
                    }
                }
            }
        }
    }

    /// Binds the allocation's region to a buffer object.
    pub fn bind_buffer_memory(&self, allocation: &Arc<Allocation>,
                              buffer: ResourceHandle) -> Result<(), AllocError> {
        self.bind_memory(allocation, buffer, true)
    }

    /// Binds the allocation's region to an image object.
    pub fn bind_image_memory(&self, allocation: &Arc<Allocation>,
                             image: ResourceHandle) -> Result<(), AllocError> {
        self.bind_memory(allocation, image, false)
    }

    fn bind_memory(&self, allocation: &Arc<Allocation>, resource: ResourceHandle,
                   is_buffer: bool) -> Result<(), AllocError> {
        if allocation.is_lost() {
            return Err(AllocError::InvalidUsage);
        }
        enum Route {
            Block(Arc<DeviceMemoryBlock>, u64),
            Dedicated(DeviceMemoryHandle),
        }
        let route = match &*allocation.payload.read() {
            AllocationPayload::Block { block, offset, .. } => {
                Route::Block(block.clone(), *offset)
            }
            AllocationPayload::Dedicated { memory, .. } => Route::Dedicated(*memory),
            AllocationPayload::Lost => return Err(AllocError::InvalidUsage),
        };
        match route {
            Route::Block(block, offset) => {
                if is_buffer {
                    block.bind_buffer(&self.ctx, offset, resource)
                } else {
                    block.bind_image(&self.ctx, offset, resource)
                }
            }
            Route::Dedicated(memory) => {
                if is_buffer {
                    self.ctx.device.bind_buffer(memory, 0, resource)
                } else {
                    self.ctx.device.bind_image(memory, 0, resource)
                }
            }
        }
    }

    // Introspection ///////////////////////////////////////////////////////////////////////////////

    /// Snapshot of the allocation. For evictable allocations this also
    /// counts as a use in the current frame; once lost, the snapshot
    /// carries no memory handle.
    pub fn get_allocation_info(&self, allocation: &Arc<Allocation>) -> AllocationInfo {
        if allocation.can_become_lost() && !allocation.touch(self.current_frame_index()) {
            let memory_type_index = match &*allocation.payload.read() {
                AllocationPayload::Block { block, .. } => block.memory_type_index(),
                AllocationPayload::Dedicated { memory_type_index, .. } => *memory_type_index,
                AllocationPayload::Lost => u32::max_value(),
            };
            return AllocationInfo {
                memory_type_index,
                device_memory: None,
                offset: 0,
                size: allocation.size(),
                mapped_ptr: None,
                user_data: allocation.user_data(),
            };
        }
        match &*allocation.payload.read() {
            AllocationPayload::Block { block, offset, .. } => AllocationInfo {
                memory_type_index: block.memory_type_index(),
                device_memory: Some(block.memory()),
                offset: *offset,
                size: allocation.size(),
                mapped_ptr: if allocation.map_ref_count() > 0 || allocation.persistently_mapped() {
                    block.mapped_ptr().map(|base| unsafe {
                        NonNull::new_unchecked(base.as_ptr().add(*offset as usize))
                    })
                } else {
                    None
                },
                user_data: allocation.user_data(),
            },
            AllocationPayload::Dedicated { memory_type_index, memory, mapped } => AllocationInfo {
                memory_type_index: *memory_type_index,
                device_memory: Some(*memory),
                offset: 0,
                size: allocation.size(),
                mapped_ptr: *mapped,
                user_data: allocation.user_data(),
            },
            AllocationPayload::Lost => AllocationInfo {
                memory_type_index: u32::max_value(),
                device_memory: None,
                offset: 0,
                size: allocation.size(),
                mapped_ptr: None,
                user_data: allocation.user_data(),
            },
        }
    }

    /// Records a use of the allocation in the current frame, protecting it
    /// from eviction. Returns `false` if it is already lost.
    pub fn touch_allocation(&self, allocation: &Arc<Allocation>) -> bool {
        allocation.touch(self.current_frame_index())
    }

    /// Manufactures an allocation that is already lost, so hosts can drive
    /// every resource through one "check, then reallocate" path.
    pub fn create_lost_allocation(&self) -> Arc<Allocation> {
        Arc::new(Allocation::new_lost())
    }

    // Pools ///////////////////////////////////////////////////////////////////////////////////////

    pub fn create_pool(&self, info: &PoolCreateInfo) -> Result<Arc<Pool>, AllocError> {
        let pool = Arc::new(Pool::new(self.ctx.clone(), info)?);
        self.pools.lock().push(pool.clone());
        Ok(pool)
    }

    /// Unregisters the pool. All its allocations must have been freed.
    pub fn destroy_pool(&self, pool: &Arc<Pool>) {
        let mut pools = self.pools.lock();
        match pools.iter().position(|p| Arc::ptr_eq(p, pool)) {
            Some(pos) => { pools.swap_remove(pos); }
            None => debug_assert!(false, "pool is not registered with this allocator"),
        }
    }

    /// Sweeps one pool, making every sufficiently stale evictable
    /// allocation lost. Returns the number of allocations lost.
    pub fn make_pool_allocations_lost(&self, pool: &Arc<Pool>) -> usize {
        pool.vector().make_allocations_lost(self.current_frame_index())
    }

    // Defragmentation /////////////////////////////////////////////////////////////////////////////

    /// Compacts the given allocations within their block vectors.
    ///
    /// Returns the stats, a changed flag per input allocation, and whether
    /// the run completed or stopped at the budget. Every allocation whose
    /// flag is set has moved: the host must destroy and recreate any
    /// resource object bound to it at the new location. Dedicated, lost and
    /// non-host-visible allocations are skipped.
    pub fn defragment(&self, allocations: &[Arc<Allocation>],
                      info: &DefragmentationInfo)
                      -> Result<(DefragmentationStats, Vec<bool>, DefragmentationStatus),
                                AllocError> {
        struct Group {
            pool: Option<Arc<Pool>>,
            memory_type_index: u32,
            candidates: Vec<DefragCandidate>,
        }

        let mut groups: Vec<Group> = Vec::new();
        for (input_index, allocation) in allocations.iter().enumerate() {
            if allocation.is_lost() {
                continue;
            }
            let (memory_type_index, pool) = match &*allocation.payload.read() {
                AllocationPayload::Block { block, pool, .. } => {
                    (block.memory_type_index(), pool.clone())
                }
                _ => {
                    debug_assert!(false, "only block allocations can be defragmented");
                    continue;
                }
            };
            let host_visible = self.ctx.properties
                .memory_types[memory_type_index as usize]
                .property_flags
                .is_host_visible();
            if !host_visible {
                continue;
            }
            let candidate = DefragCandidate {
                allocation: allocation.clone(),
                input_index,
            };
            let existing = groups.iter_mut().find(|g| {
                g.memory_type_index == memory_type_index
                    && match (&g.pool, &pool) {
                        (None, None) => true,
                        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                        _ => false,
                    }
            });
            match existing {
                Some(group) => group.candidates.push(candidate),
                None => groups.push(Group {
                    pool,
                    memory_type_index,
                    candidates: vec![candidate],
                }),
            }
        }

        let mut stats = DefragmentationStats::default();
        let mut changed = vec![false; allocations.len()];
        let mut status = DefragmentationStatus::Complete;
        let current_frame = self.current_frame_index();
        for group in groups {
            let vector = match &group.pool {
                Some(pool) => pool.vector(),
                None => &self.block_vectors[group.memory_type_index as usize],
            };
            let (group_status, results) = vector.defragment(
                group.candidates, current_frame,
                info.max_bytes_to_move, info.max_allocations_to_move, &mut stats)?;
            if group_status == DefragmentationStatus::Incomplete {
                status = DefragmentationStatus::Incomplete;
            }
            for (input_index, moved) in results {
                if moved {
                    changed[input_index] = true;
                }
            }
        }
        Ok((stats, changed, status))
    }

    // Statistics //////////////////////////////////////////////////////////////////////////////////

    /// Bytes currently allocated from the given heap.
    pub fn heap_usage(&self, heap_index: u32) -> u64 {
        self.ctx.heap_usage(heap_index)
    }

    pub fn calculate_stats(&self) -> Stats {
        let type_count = self.ctx.properties.memory_types.len();
        let heap_count = self.ctx.properties.memory_heaps.len();

        let mut memory_type = vec![StatInfo::new(); type_count];
        for vector in &self.block_vectors {
            memory_type[vector.memory_type_index() as usize].merge(&vector.stat_info());
        }
        for pool in self.pools.lock().iter() {
            memory_type[pool.memory_type_index() as usize]
                .merge(&pool.vector().stat_info());
        }
        for (index, list) in self.dedicated.iter().enumerate() {
            for allocation in list.lock().iter() {
                let info = &mut memory_type[index];
                // a dedicated allocation is its own fully-used block
                info.block_count += 1;
                info.add_allocation(allocation.size());
            }
        }

        let mut memory_heap = vec![StatInfo::new(); heap_count];
        let mut total = StatInfo::new();
        for (index, info) in memory_type.iter().enumerate() {
            let heap = self.ctx.properties.memory_types[index].heap_index as usize;
            memory_heap[heap].merge(info);
            total.merge(info);
        }
        for info in memory_type.iter_mut() {
            info.post_process();
        }
        for info in memory_heap.iter_mut() {
            info.post_process();
        }
        total.post_process();
        Stats { memory_type, memory_heap, total }
    }

    /// JSON report for external tooling. With `detailed`, every block's
    /// suballocation list is included.
    pub fn build_stats_string(&self, detailed: bool) -> String {
        let stats = self.calculate_stats();
        let mut memory_types = serde_json::Map::new();
        for vector in &self.block_vectors {
            let index = vector.memory_type_index();
            let dedicated_count = self.dedicated[index as usize].lock().len();
            memory_types.insert(index.to_string(), json!({
                "Blocks": vector.json_value(detailed),
                "DedicatedAllocationCount": dedicated_count,
            }));
        }
        let pools: Vec<serde_json::Value> = self.pools.lock().iter().map(|pool| {
            json!({
                "MemoryTypeIndex": pool.memory_type_index(),
                "Blocks": pool.vector().json_value(detailed),
            })
        }).collect();
        let root = json!({
            "TotalStats": stats.total,
            "MemoryTypeStats": stats.memory_type,
            "MemoryHeapStats": stats.memory_heap,
            "MemoryTypes": serde_json::Value::Object(memory_types),
            "Pools": pools,
        });
        serde_json::to_string_pretty(&root).unwrap_or_else(|_| String::from("{}"))
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        for (index, list) in self.dedicated.iter_mut().enumerate() {
            let leaked = list.get_mut().len();
            if leaked > 0 {
                warn!("memory type {}: {} dedicated allocations leaked at teardown",
                      index, leaked);
                debug_assert!(false, "dedicated allocations leaked at teardown");
            }
        }
        let pools = self.pools.get_mut();
        if !pools.is_empty() {
            warn!("{} pools still registered at teardown", pools.len());
        }
    }
}

/// Preferred block size for one memory type: an eighth of a small heap, the
/// configured value otherwise.
fn preferred_block_size_for_type(properties: &PhysicalMemoryProperties,
                                 memory_type_index: u32, preferred: u64) -> u64 {
    let heap_size = properties.heap_size_for_type(memory_type_index);
    let raw = if heap_size <= SMALL_HEAP_MAX_SIZE {
        heap_size / 8
    } else {
        preferred
    };
    crate::metadata::align_up(raw.max(32), 32)
}

/// Coarse usage classes translated into (required, preferred) property
/// flags.
fn usage_to_flags(usage: MemoryUsage) -> (MemoryPropertyFlags, MemoryPropertyFlags) {
    match usage {
        MemoryUsage::Unknown => {
            (MemoryPropertyFlags::empty(), MemoryPropertyFlags::empty())
        }
        MemoryUsage::GpuOnly => {
            (MemoryPropertyFlags::empty(), MemoryPropertyFlags::DEVICE_LOCAL)
        }
        MemoryUsage::CpuOnly => {
            (MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
             MemoryPropertyFlags::empty())
        }
        MemoryUsage::CpuToGpu => {
            (MemoryPropertyFlags::HOST_VISIBLE, MemoryPropertyFlags::DEVICE_LOCAL)
        }
        MemoryUsage::GpuToCpu => {
            (MemoryPropertyFlags::HOST_VISIBLE,
             MemoryPropertyFlags::HOST_COHERENT | MemoryPropertyFlags::HOST_CACHED)
        }
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    mod allocator {
        use crate::allocation::{AllocationCreateInfo, MemoryUsage, UserData};
        use crate::allocator::{Allocator, AllocatorCreateInfo, MemoryRequirements};
        use crate::defrag::{DefragmentationInfo, DefragmentationStatus};
        use crate::device::{DeviceCallbacks, ResourceHandle};
        use crate::error::AllocError;
        use crate::pool::PoolCreateInfo;
        use crate::test_support::{test_properties, test_properties_multi, MockDevice};
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        fn allocator(device: &Arc<MockDevice>) -> Allocator {
            let mut info = AllocatorCreateInfo::new(device.clone(), test_properties(1 << 30));
            info.preferred_large_heap_block_size = 1024;
            Allocator::new(info)
        }

        fn plain() -> AllocationCreateInfo {
            AllocationCreateInfo::default()
        }

        #[test]
        fn memory_type_selection_by_usage() {
            let device = Arc::new(MockDevice::new());
            let info = AllocatorCreateInfo::new(device, test_properties_multi());
            let a = Allocator::new(info);

            let mut gpu = plain();
            gpu.usage = MemoryUsage::GpuOnly;
            assert_eq!(a.find_memory_type_index(!0, &gpu).unwrap(), 0);

            let mut cpu = plain();
            cpu.usage = MemoryUsage::CpuOnly;
            assert_eq!(a.find_memory_type_index(!0, &cpu).unwrap(), 1);

            let mut upload = plain();
            upload.usage = MemoryUsage::CpuToGpu;
            assert_eq!(a.find_memory_type_index(!0, &upload).unwrap(), 2);

            // restricting the type bits overrides preference
            assert_eq!(a.find_memory_type_index(0b010, &upload).unwrap(), 1);

            let mut cached = plain();
            cached.required_flags = crate::device::MemoryPropertyFlags::HOST_CACHED;
            assert_eq!(a.find_memory_type_index(!0, &cached).unwrap_err(),
                       AllocError::FeatureNotPresent);
        }

        #[test]
        fn large_requests_get_dedicated_memory() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            // preferred block size is 1024; 600 > half of it
            let alloc = a.allocate_memory(&MemoryRequirements::new(600, 1), &plain())
                .unwrap();
            assert_eq!(device.allocation_sizes(), vec![600]);
            let info = a.get_allocation_info(&alloc);
            assert_eq!(info.offset, 0);
            assert_eq!(info.size, 600);
            assert!(info.device_memory.is_some());
            a.free_memory(&alloc);
            assert_eq!(device.free_calls(), 1);
        }

        #[test]
        fn small_requests_share_a_block() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let x = a.allocate_memory(&MemoryRequirements::new(100, 1), &plain()).unwrap();
            let y = a.allocate_memory(&MemoryRequirements::new(100, 1), &plain()).unwrap();
            let ix = a.get_allocation_info(&x);
            let iy = a.get_allocation_info(&y);
            assert_eq!(ix.device_memory, iy.device_memory);
            assert_ne!(ix.offset, iy.offset);
            a.free_memory(&x);
            a.free_memory(&y);
        }

        #[test]
        fn invalid_flag_combinations_are_rejected() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);

            let mut both = plain();
            both.flags.dedicated = true;
            both.flags.never_allocate = true;
            assert_eq!(a.allocate_memory(&MemoryRequirements::new(64, 1), &both)
                           .unwrap_err(),
                       AllocError::InvalidUsage);

            let mut mapped_lost = plain();
            mapped_lost.flags.persistent_map = true;
            mapped_lost.flags.can_become_lost = true;
            assert_eq!(a.allocate_memory(&MemoryRequirements::new(64, 1), &mapped_lost)
                           .unwrap_err(),
                       AllocError::InvalidUsage);
        }

        #[test]
        fn mapping_an_evictable_allocation_is_refused() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let mut lostable = plain();
            lostable.flags.can_become_lost = true;
            let alloc = a.allocate_memory(&MemoryRequirements::new(64, 1), &lostable)
                .unwrap();
            assert_eq!(a.map_memory(&alloc).unwrap_err(), AllocError::MapNotAllowed);
            assert_eq!(device.map_calls(), 0);
            a.free_memory(&alloc);
        }

        #[test]
        fn map_unmap_round_trip_block_and_dedicated() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);

            let small = a.allocate_memory(&MemoryRequirements::new(64, 1), &plain())
                .unwrap();
            let p = a.map_memory(&small).unwrap();
            let info = a.get_allocation_info(&small);
            assert_eq!(info.mapped_ptr, Some(p));
            a.unmap_memory(&small);
            assert!(a.get_allocation_info(&small).mapped_ptr.is_none());

            let mut dedicated = plain();
            dedicated.flags.dedicated = true;
            let big = a.allocate_memory(&MemoryRequirements::new(64, 1), &dedicated)
                .unwrap();
            a.map_memory(&big).unwrap();
            a.unmap_memory(&big);
            assert_eq!(device.unmap_calls(), 2);

            a.free_memory(&small);
            a.free_memory(&big);
        }

        #[test]
        fn bind_goes_through_the_device() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let alloc = a.allocate_memory_for_buffer(
                &MemoryRequirements::new(64, 1), &plain()).unwrap();
            a.bind_buffer_memory(&alloc, ResourceHandle(77)).unwrap();
            assert_eq!(device.bind_calls(), 1);
            a.free_memory(&alloc);
        }

        #[test]
        fn lost_allocation_snapshots_without_memory() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let pool = a.create_pool(&PoolCreateInfo {
                block_size: 1024,
                ..PoolCreateInfo::default()
            }).unwrap();

            let mut lostable = plain();
            lostable.flags.can_become_lost = true;
            lostable.pool = Some(pool.clone());
            lostable.user_data = UserData::Text("transient".to_string());
            let alloc = a.allocate_memory(&MemoryRequirements::new(64, 1), &lostable)
                .unwrap();

            a.set_current_frame_index(10);
            assert_eq!(a.make_pool_allocations_lost(&pool), 1);
            assert!(alloc.is_lost());
            assert!(!a.touch_allocation(&alloc));

            let info = a.get_allocation_info(&alloc);
            assert!(info.device_memory.is_none());
            assert_eq!(info.offset, 0);
            assert_eq!(info.user_data, UserData::Text("transient".to_string()));

            a.free_memory(&alloc);
            a.destroy_pool(&pool);
        }

        #[test]
        fn manufactured_lost_allocation() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let alloc = a.create_lost_allocation();
            assert!(alloc.is_lost());
            assert!(a.get_allocation_info(&alloc).device_memory.is_none());
            a.free_memory(&alloc);
        }

        #[test]
        fn defragment_end_to_end() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            // three 64-byte allocations in one block, free the middle one
            let x = a.allocate_memory(&MemoryRequirements::new(64, 1), &plain()).unwrap();
            let y = a.allocate_memory(&MemoryRequirements::new(64, 1), &plain()).unwrap();
            let z = a.allocate_memory(&MemoryRequirements::new(64, 1), &plain()).unwrap();
            let z_before = a.get_allocation_info(&z);
            a.free_memory(&y);

            let (stats, changed, status) = a.defragment(
                &[x.clone(), z.clone()], &DefragmentationInfo::default()).unwrap();
            assert_eq!(status, DefragmentationStatus::Complete);
            assert_eq!(changed, vec![false, true]);
            assert_eq!(stats.allocations_moved, 1);
            let z_after = a.get_allocation_info(&z);
            assert_ne!(z_before.offset, z_after.offset);

            a.free_memory(&x);
            a.free_memory(&z);
        }

        #[test]
        fn stats_and_json_report() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let x = a.allocate_memory(&MemoryRequirements::new(100, 1), &plain()).unwrap();
            let mut dedicated = plain();
            dedicated.flags.dedicated = true;
            let d = a.allocate_memory(&MemoryRequirements::new(700, 1), &dedicated)
                .unwrap();

            let stats = a.calculate_stats();
            assert_eq!(stats.total.allocation_count, 2);
            assert_eq!(stats.total.used_bytes, 800);
            assert_eq!(stats.total.block_count, 2);
            assert_eq!(stats.memory_type[0].allocation_count, 2);
            assert_eq!(stats.memory_heap[0].used_bytes, 800);

            let report = a.build_stats_string(true);
            assert!(report.contains("TotalStats"));
            assert!(report.contains("Suballocations"));

            a.free_memory(&x);
            a.free_memory(&d);
        }

        #[test]
        fn heap_usage_tracks_native_allocations() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            assert_eq!(a.heap_usage(0), 0);
            let x = a.allocate_memory(&MemoryRequirements::new(100, 1), &plain()).unwrap();
            assert!(a.heap_usage(0) > 0);
            a.free_memory(&x);
            assert_eq!(a.heap_usage(0), 0);
        }

        struct CountingCallbacks {
            allocs: AtomicU32,
            frees: AtomicU32,
        }
        impl DeviceCallbacks for CountingCallbacks {
            fn on_allocate(&self, _memory_type_index: u32, _size: u64) {
                self.allocs.fetch_add(1, Ordering::Relaxed);
            }
            fn on_free(&self, _memory_type_index: u32, _size: u64) {
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
        }

        #[test]
        fn instrumentation_callbacks_fire() {
            let device = Arc::new(MockDevice::new());
            let callbacks = Arc::new(CountingCallbacks {
                allocs: AtomicU32::new(0),
                frees: AtomicU32::new(0),
            });
            struct Fwd(Arc<CountingCallbacks>);
            impl DeviceCallbacks for Fwd {
                fn on_allocate(&self, t: u32, s: u64) { self.0.on_allocate(t, s) }
                fn on_free(&self, t: u32, s: u64) { self.0.on_free(t, s) }
            }
            let mut info = AllocatorCreateInfo::new(device, test_properties(1 << 30));
            info.preferred_large_heap_block_size = 1024;
            info.callbacks = Some(Box::new(Fwd(callbacks.clone())));
            let a = Allocator::new(info);

            let mut dedicated = AllocationCreateInfo::default();
            dedicated.flags.dedicated = true;
            let d = a.allocate_memory(&MemoryRequirements::new(64, 1), &dedicated)
                .unwrap();
            assert_eq!(callbacks.allocs.load(Ordering::Relaxed), 1);
            a.free_memory(&d);
            assert_eq!(callbacks.frees.load(Ordering::Relaxed), 1);
        }

        #[test]
        #[should_panic(expected = "allocation freed twice")]
        fn double_free_asserts_in_debug_builds() {
            let device = Arc::new(MockDevice::new());
            let a = allocator(&device);
            let mut dedicated = plain();
            dedicated.flags.dedicated = true;
            let d = a.allocate_memory(&MemoryRequirements::new(64, 1), &dedicated)
                .unwrap();
            a.free_memory(&d);
            a.free_memory(&d);
        }
    }
}
