//! All blocks serving one memory category.
//!
//! [BlockVector] owns the [DeviceMemoryBlock]s of one memory type (or one
//! caller pool) together with each block's [BlockMetadata], everything under
//! a single mutex. It decides when to grow, when to shrink, and when to
//! evict: allocation tries existing blocks first (least free space first, so
//! fuller blocks fill up and emptier ones drain toward being freed), then
//! creates a new block, then, if the caller allows, evicts willing
//! allocations at the lowest cost found across all blocks.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::json;

use crate::allocation::{Allocation, AllocationCreateInfo, AllocationPayload, UserData};
use crate::block::DeviceMemoryBlock;
use crate::defrag::{DefragCandidate, DefragmentationStats, DefragmentationStatus, Defragmentator};
use crate::device::DeviceContext;
use crate::error::AllocError;
use crate::metadata::{AllocationRequest, BlockMetadata, FitStrategy, SuballocationKind};
use crate::pool::{Pool, PoolStats};
use crate::stats::StatInfo;
use crate::{ALLOCATION_TRY_COUNT, NEW_BLOCK_SIZE_SHIFT_MAX};

pub(crate) struct BlockSlot {
    pub block: Arc<DeviceMemoryBlock>,
    pub meta: BlockMetadata,
}

pub(crate) struct VectorState {
    pub slots: Vec<BlockSlot>,
    /// Hysteresis: whether some block is currently entirely free. At most
    /// one such block is kept alive.
    pub has_empty_block: bool,
    next_block_id: u32,
}

/// The blocks of one memory category and their allocation policy.
pub(crate) struct BlockVector {
    ctx: Arc<DeviceContext>,
    memory_type_index: u32,
    preferred_block_size: u64,
    min_block_count: usize,
    max_block_count: usize,
    /// Caller pools fix their block size; default vectors may undersize
    /// their first blocks.
    explicit_block_size: bool,
    frame_in_use_count: u32,
    strategy: FitStrategy,
    state: Mutex<VectorState>,
}

impl BlockVector {
    pub fn new(ctx: Arc<DeviceContext>,
               memory_type_index: u32,
               preferred_block_size: u64,
               min_block_count: usize,
               max_block_count: usize,
               explicit_block_size: bool,
               frame_in_use_count: u32,
               strategy: FitStrategy) -> BlockVector {
        BlockVector {
            ctx,
            memory_type_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            explicit_block_size,
            frame_in_use_count,
            strategy,
            state: Mutex::new(VectorState {
                slots: Vec::new(),
                has_empty_block: false,
                next_block_id: 0,
            }),
        }
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 { self.memory_type_index }
    #[inline]
    pub fn preferred_block_size(&self) -> u64 { self.preferred_block_size }

    /// Creates the configured minimum number of blocks up front.
    pub fn ensure_min_blocks(&self) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        while state.slots.len() < self.min_block_count {
            self.create_block(&mut state, self.preferred_block_size)?;
            state.has_empty_block = true;
        }
        Ok(())
    }

    // Allocate ////////////////////////////////////////////////////////////////////////////////////

    pub fn allocate(&self,
                    current_frame_index: u32,
                    size: u64,
                    alignment: u64,
                    kind: SuballocationKind,
                    create_info: &AllocationCreateInfo,
                    pool: Option<&Arc<Pool>>) -> Result<Arc<Allocation>, AllocError> {
        let flags = create_info.flags;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        // 1. Existing blocks, no eviction. Blocks are kept sorted by
        // ascending free space, so the first fit is also the fullest block
        // that can take the request.
        for index in 0..state.slots.len() {
            let request = state.slots[index].meta.create_allocation_request(
                current_frame_index, self.frame_in_use_count,
                size, alignment, kind, false, self.strategy);
            if let Some(request) = request {
                return self.commit(state, index, request, kind, size, alignment,
                                   create_info, pool, current_frame_index);
            }
        }

        // 2. Grow.
        if !flags.never_allocate && state.slots.len() < self.max_block_count {
            let mut new_block_size = self.preferred_block_size;
            let mut shift = 0u32;
            if !self.explicit_block_size {
                // Undersize the first blocks (1/2, 1/4, 1/8 of preferred,
                // floor at twice the request) so a light consumer of this
                // category never pays for a full-size block.
                let max_existing = state.slots.iter()
                    .map(|s| s.block.size())
                    .max()
                    .unwrap_or(0);
                for _ in 0..NEW_BLOCK_SIZE_SHIFT_MAX {
                    let smaller = new_block_size / 2;
                    if smaller > max_existing && smaller >= size * 2 {
                        new_block_size = smaller;
                        shift += 1;
                    } else {
                        break;
                    }
                }
            }

            while new_block_size >= size {
                match self.create_block(state, new_block_size) {
                    Ok(index) => {
                        let request = state.slots[index].meta.create_allocation_request(
                            current_frame_index, self.frame_in_use_count,
                            size, alignment, kind, false, self.strategy);
                        match request {
                            Some(request) => {
                                return self.commit(state, index, request, kind, size,
                                                   alignment, create_info, pool,
                                                   current_frame_index);
                            }
                            None => {
                                // margins/alignment ate the headroom; the
                                // fresh block stays as the empty one
                                state.has_empty_block = true;
                                break;
                            }
                        }
                    }
                    Err(_) if !self.explicit_block_size && shift < NEW_BLOCK_SIZE_SHIFT_MAX
                              && new_block_size / 2 >= size * 2 => {
                        // device refused this size; retry smaller
                        new_block_size /= 2;
                        shift += 1;
                    }
                    Err(_) => break,
                }
            }
        }

        // 3. Eviction, if the caller allows it. Pick the globally cheapest
        // plan across all blocks, then race the touch protocol for its
        // victims; a lost race means searching again from scratch.
        if flags.can_make_other_lost {
            let mut tries = 0u32;
            while tries < ALLOCATION_TRY_COUNT {
                let mut best: Option<(usize, AllocationRequest)> = None;
                for index in 0..state.slots.len() {
                    let request = state.slots[index].meta.create_allocation_request(
                        current_frame_index, self.frame_in_use_count,
                        size, alignment, kind, true, self.strategy);
                    if let Some(request) = request {
                        let cheaper = best.as_ref()
                            .map_or(true, |(_, b)| request.cost() < b.cost());
                        if cheaper {
                            best = Some((index, request));
                        }
                    }
                }
                match best {
                    Some((index, mut request)) => {
                        debug!("memory type {}: eviction plan reclaims {} victim bytes ({} victims) next to {} free bytes",
                               self.memory_type_index, request.sum_item_size,
                               request.items_to_make_lost_count, request.sum_free_size);
                        let committed = state.slots[index].meta
                            .make_requested_allocations_lost(
                                current_frame_index, self.frame_in_use_count, &mut request);
                        if committed {
                            return self.commit(state, index, request, kind, size,
                                               alignment, create_info, pool,
                                               current_frame_index);
                        }
                        tries += 1;
                    }
                    None => return Err(AllocError::OutOfDeviceMemory),
                }
            }
            warn!("memory type {}: eviction retries exhausted after {} attempts",
                  self.memory_type_index, ALLOCATION_TRY_COUNT);
            return Err(AllocError::TooManyContendingThreads);
        }

        Err(AllocError::OutOfDeviceMemory)
    }

    fn commit(&self,
              state: &mut VectorState,
              index: usize,
              request: AllocationRequest,
              kind: SuballocationKind,
              size: u64,
              alignment: u64,
              create_info: &AllocationCreateInfo,
              pool: Option<&Arc<Pool>>,
              current_frame_index: u32) -> Result<Arc<Allocation>, AllocError> {
        let persistent = create_info.flags.persistent_map;
        let was_empty = state.slots[index].meta.is_empty();
        let block = state.slots[index].block.clone();
        // map before touching metadata: a failed allocate must leave the
        // block exactly as it was
        if persistent {
            block.map(&self.ctx)?;
        }
        let allocation = Arc::new(Allocation::new_block(
            current_frame_index, block, request.offset, alignment, size, kind,
            pool.cloned(), create_info.flags.can_become_lost, persistent,
            create_info.user_data.clone()));
        state.slots[index].meta.alloc(&request, kind, size, &allocation);
        if was_empty {
            state.has_empty_block = state.slots.iter().any(|s| s.meta.is_empty());
        }
        self.incrementally_sort(state);
        Ok(allocation)
    }

    fn create_block(&self, state: &mut VectorState, block_size: u64)
                    -> Result<usize, AllocError> {
        let memory = self.ctx.allocate(self.memory_type_index, block_size)?;
        let id = state.next_block_id;
        state.next_block_id += 1;
        debug!("memory type {}: created block {} ({} bytes)",
               self.memory_type_index, id, block_size);
        let block = Arc::new(DeviceMemoryBlock::new(
            id, self.memory_type_index, memory, block_size));
        let meta = BlockMetadata::new(block_size, self.ctx.granularity(),
                                      self.ctx.debug_margin);
        state.slots.push(BlockSlot { block, meta });
        Ok(state.slots.len() - 1)
    }

    /// One adjacent swap toward ascending free space. Called after every
    /// mutation; the order converges without ever paying for a full sort.
    fn incrementally_sort(&self, state: &mut VectorState) {
        for i in 1..state.slots.len() {
            if state.slots[i - 1].meta.sum_free_size() > state.slots[i].meta.sum_free_size() {
                state.slots.swap(i - 1, i);
                return;
            }
        }
    }

    // Free ////////////////////////////////////////////////////////////////////////////////////////

    pub fn free(&self, allocation: &Arc<Allocation>) {
        let mut block_to_destroy: Option<Arc<DeviceMemoryBlock>> = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let block = match &*allocation.payload.read() {
                AllocationPayload::Block { block, .. } => block.clone(),
                _ => {
                    debug_assert!(false, "not a block allocation");
                    return;
                }
            };
            if allocation.persistently_mapped() {
                block.unmap(&self.ctx);
            }
            let index = match state.slots.iter().position(|s| Arc::ptr_eq(&s.block, &block)) {
                Some(i) => i,
                None => {
                    debug_assert!(false, "allocation freed into the wrong block vector");
                    return;
                }
            };
            state.slots[index].meta.free(allocation);

            if state.slots[index].meta.is_empty() {
                // keep at most one entirely free block; a second one is
                // destroyed on the spot
                if state.has_empty_block && state.slots.len() > self.min_block_count {
                    let slot = state.slots.remove(index);
                    block_to_destroy = Some(slot.block);
                } else {
                    state.has_empty_block = true;
                }
            } else if state.has_empty_block && state.slots.len() > self.min_block_count {
                // opportunistic cleanup of a trailing empty block
                let last = state.slots.len() - 1;
                if state.slots[last].meta.is_empty() {
                    let slot = state.slots.remove(last);
                    block_to_destroy = Some(slot.block);
                    state.has_empty_block = false;
                }
            }
            self.incrementally_sort(state);
        }
        // the native free call is slow; never hold the lock through it
        if let Some(block) = block_to_destroy {
            debug!("memory type {}: destroyed block {}",
                   self.memory_type_index, block.id());
            block.destroy(&self.ctx);
        }
    }

    // Eviction sweep //////////////////////////////////////////////////////////////////////////////

    /// Makes every sufficiently stale evictable allocation in this vector
    /// lost. Returns the number of allocations lost.
    pub fn make_allocations_lost(&self, current_frame_index: u32) -> usize {
        let mut state = self.state.lock();
        let mut lost = 0;
        for slot in state.slots.iter_mut() {
            lost += slot.meta.make_allocations_lost(current_frame_index,
                                                    self.frame_in_use_count);
        }
        lost
    }

    // Defragmentation /////////////////////////////////////////////////////////////////////////////

    /// Runs the compaction mover over this vector's blocks, then frees any
    /// blocks the moves emptied. Returns the completion status and, per
    /// candidate, whether it moved.
    pub fn defragment(&self,
                      candidates: Vec<DefragCandidate>,
                      current_frame_index: u32,
                      max_bytes_to_move: u64,
                      max_allocations_to_move: u32,
                      stats: &mut DefragmentationStats)
                      -> Result<(DefragmentationStatus, Vec<(usize, bool)>), AllocError> {
        let mut destroyed: Vec<Arc<DeviceMemoryBlock>> = Vec::new();
        let result;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut mover = Defragmentator::new(self.ctx.clone(), current_frame_index,
                                                candidates);
            let status = mover.run(state, max_bytes_to_move, max_allocations_to_move)?;
            stats.bytes_moved += mover.bytes_moved();
            stats.allocations_moved += mover.allocations_moved();
            result = (status, mover.into_results());

            // moves drain source blocks; free the ones that emptied
            let mut index = state.slots.len();
            while index > 0 {
                index -= 1;
                if state.slots[index].meta.is_empty() {
                    if state.slots.len() > self.min_block_count {
                        let slot = state.slots.remove(index);
                        stats.device_memory_blocks_freed += 1;
                        stats.bytes_freed += slot.block.size();
                        destroyed.push(slot.block);
                    } else {
                        break;
                    }
                }
            }
            state.has_empty_block = state.slots.iter().any(|s| s.meta.is_empty());
        }
        for block in destroyed {
            debug!("memory type {}: defragmentation freed block {}",
                   self.memory_type_index, block.id());
            block.destroy(&self.ctx);
        }
        Ok(result)
    }

    // Statistics //////////////////////////////////////////////////////////////////////////////////

    pub fn stat_info(&self) -> StatInfo {
        let state = self.state.lock();
        let mut info = StatInfo::new();
        for slot in state.slots.iter() {
            info.merge(&slot.meta.stat_info());
        }
        info
    }

    pub fn pool_stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats::default();
        for slot in state.slots.iter() {
            stats.size += slot.meta.size();
            stats.unused_size += slot.meta.sum_free_size();
            stats.allocation_count += slot.meta.allocation_count();
            stats.unused_range_count += slot.meta.free_range_count();
            stats.unused_range_size_max =
                stats.unused_range_size_max.max(slot.meta.largest_free_size());
            stats.block_count += 1;
        }
        stats
    }

    /// JSON description of every block, with the full suballocation list
    /// when `detailed`.
    pub fn json_value(&self, detailed: bool) -> serde_json::Value {
        let state = self.state.lock();
        let blocks: Vec<serde_json::Value> = state.slots.iter().map(|slot| {
            if detailed {
                let suballocations: Vec<serde_json::Value> = slot.meta.iter().map(|sub| {
                    let mut entry = json!({
                        "Offset": sub.offset,
                        "Size": sub.size,
                        "Kind": format!("{:?}", sub.kind),
                    });
                    if let Some(alloc) = &sub.alloc {
                        match alloc.user_data() {
                            UserData::None => {}
                            UserData::Opaque(v) => { entry["UserData"] = json!(v); }
                            UserData::Text(s) => { entry["UserData"] = json!(s); }
                        }
                    }
                    entry
                }).collect();
                json!({
                    "Id": slot.block.id(),
                    "Size": slot.meta.size(),
                    "UnusedBytes": slot.meta.sum_free_size(),
                    "Suballocations": suballocations,
                })
            } else {
                json!({
                    "Id": slot.block.id(),
                    "Size": slot.meta.size(),
                    "UnusedBytes": slot.meta.sum_free_size(),
                })
            }
        }).collect();
        json!(blocks)
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().slots.len()
    }
}

impl Drop for BlockVector {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for slot in state.slots.drain(..) {
            debug_assert!(slot.meta.is_empty(),
                          "block vector torn down with live allocations");
            slot.block.destroy(&self.ctx);
        }
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    mod blockvector {
        use crate::allocation::{AllocationCreateInfo, Allocation};
        use crate::device::DeviceContext;
        use crate::error::AllocError;
        use crate::metadata::{FitStrategy, SuballocationKind};
        use crate::test_support::{test_properties, MockDevice};
        use crate::vector::BlockVector;
        use std::sync::Arc;

        fn vector(device: &Arc<MockDevice>, preferred: u64, max_blocks: usize)
                  -> BlockVector {
            let ctx = Arc::new(DeviceContext::new(
                device.clone(), test_properties(1 << 30), None, None, 0, 1));
            BlockVector::new(ctx, 0, preferred, 0, max_blocks, false, 0,
                             FitStrategy::BestFit)
        }

        fn plain() -> AllocationCreateInfo {
            AllocationCreateInfo::default()
        }

        fn evictor() -> AllocationCreateInfo {
            let mut info = AllocationCreateInfo::default();
            info.flags.can_make_other_lost = true;
            info
        }

        fn lostable() -> AllocationCreateInfo {
            let mut info = AllocationCreateInfo::default();
            info.flags.can_become_lost = true;
            info
        }

        #[test]
        fn first_blocks_are_undersized() {
            let device = Arc::new(MockDevice::new());
            let v = vector(&device, 1024, 16);
            // request of 16: first block is preferred/8 = 128
            v.allocate(1, 16, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            assert_eq!(device.allocation_sizes(), vec![128]);
            // fill past 128 and the next block doubles up toward preferred
            v.allocate(1, 128, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            assert_eq!(device.allocation_sizes(), vec![128, 256]);
        }

        #[test]
        fn oom_retries_progressively_smaller_blocks() {
            let device = Arc::new(MockDevice::new());
            let v = vector(&device, 4096, 16);
            // fill an undersized first block so the next growth starts at
            // 1024 with one halving step left
            v.allocate(1, 16, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            v.allocate(1, 496, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            assert_eq!(device.allocation_sizes(), vec![512]);

            device.fail_next_allocations(1);
            v.allocate(1, 100, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            // the refused 1024 was retried at 512
            assert_eq!(device.allocation_sizes(), vec![512, 512]);
        }

        #[test]
        fn never_allocate_fails_without_blocks() {
            let device = Arc::new(MockDevice::new());
            let v = vector(&device, 1024, 16);
            let mut info = plain();
            info.flags.never_allocate = true;
            let err = v.allocate(1, 16, 1, SuballocationKind::Buffer, &info, None)
                .unwrap_err();
            assert_eq!(err, AllocError::OutOfDeviceMemory);
            assert_eq!(device.allocation_sizes().len(), 0);
        }

        #[test]
        fn at_most_one_empty_block_is_retained() {
            let device = Arc::new(MockDevice::new());
            let v = vector(&device, 256, 16);
            // 200 bytes each: the second cannot share the first 256-byte block
            let a = v.allocate(1, 200, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            let b = v.allocate(1, 200, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            assert_eq!(v.block_count(), 2);

            // first empty block is retained
            v.free(&a);
            assert_eq!(v.block_count(), 2);
            assert_eq!(device.free_calls(), 0);

            // a second empty block triggers destruction of one of them
            v.free(&b);
            assert_eq!(v.block_count(), 1);
            assert_eq!(device.free_calls(), 1);
        }

        #[test]
        fn eviction_path_reclaims_stale_allocation() {
            let device = Arc::new(MockDevice::new());
            let ctx = Arc::new(DeviceContext::new(
                device.clone(), test_properties(1 << 20), None, None, 0, 1));
            // one fixed block of 256, no growth
            let v = BlockVector::new(ctx, 0, 256, 0, 1, true, 0, FitStrategy::BestFit);

            let victim = v.allocate(1, 200, 1, SuballocationKind::Buffer,
                                    &lostable(), None).unwrap();
            // frame advances; victim not touched since frame 1
            let err = v.allocate(2, 200, 1, SuballocationKind::Buffer, &plain(), None)
                .unwrap_err();
            assert_eq!(err, AllocError::OutOfDeviceMemory);

            let winner = v.allocate(2, 200, 1, SuballocationKind::Buffer,
                                    &evictor(), None).unwrap();
            assert!(victim.is_lost());
            assert_eq!(winner.block_offset(), 0);
            // lost allocations are freed without touching metadata again
            drop(victim);
            v.free(&winner);
        }

        #[test]
        fn eviction_respects_frame_in_use_window() {
            let device = Arc::new(MockDevice::new());
            let ctx = Arc::new(DeviceContext::new(
                device.clone(), test_properties(1 << 20), None, None, 0, 1));
            let v = BlockVector::new(ctx, 0, 256, 0, 1, true, 2, FitStrategy::BestFit);

            let victim = v.allocate(1, 200, 1, SuballocationKind::Buffer,
                                    &lostable(), None).unwrap();
            // within the 2-frame window the victim is protected
            let err = v.allocate(3, 200, 1, SuballocationKind::Buffer,
                                 &evictor(), None).unwrap_err();
            assert_eq!(err, AllocError::OutOfDeviceMemory);
            assert!(!victim.is_lost());

            v.allocate(4, 200, 1, SuballocationKind::Buffer, &evictor(), None).unwrap();
            assert!(victim.is_lost());
        }

        #[test]
        fn make_allocations_lost_sweeps_vector() {
            let device = Arc::new(MockDevice::new());
            let v = vector(&device, 256, 16);
            let a = v.allocate(1, 64, 1, SuballocationKind::Buffer,
                               &lostable(), None).unwrap();
            let b = v.allocate(1, 64, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            assert_eq!(v.make_allocations_lost(5), 1);
            assert!(a.is_lost());
            assert!(!b.is_lost());
            v.free(&b);
        }

        #[test]
        fn persistent_map_holds_block_mapping() {
            let device = Arc::new(MockDevice::new());
            let v = vector(&device, 256, 16);
            let mut info = plain();
            info.flags.persistent_map = true;
            let a = v.allocate(1, 64, 1, SuballocationKind::Buffer, &info, None).unwrap();
            assert_eq!(device.map_calls(), 1);
            v.free(&a);
            assert_eq!(device.unmap_calls(), 1);
        }

        #[test]
        fn drop_frees_remaining_blocks() {
            let device = Arc::new(MockDevice::new());
            {
                let v = vector(&device, 256, 16);
                let a = v.allocate(1, 64, 1, SuballocationKind::Buffer,
                                   &plain(), None).unwrap();
                v.free(&a);
                assert_eq!(device.free_calls(), 0);
            }
            assert_eq!(device.free_calls(), 1);
        }

        fn _assert_send_sync<T: Send + Sync>() {}

        #[test]
        fn vector_and_allocation_are_send_sync() {
            _assert_send_sync::<BlockVector>();
            _assert_send_sync::<Arc<Allocation>>();
        }
    }
}
