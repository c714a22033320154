//! Online compaction of one block vector.
//!
//! The [Defragmentator] takes the candidate allocations the caller offered
//! up, walks blocks from most fragmented to least, and re-packs candidates
//! into denser placements inside blocks the vector already owns. It never
//! allocates device memory and it never touches native resource objects:
//! the caller must rebind (destroy and recreate) every resource whose
//! allocation reports itself as moved, because only the caller knows which
//! objects reference a given region.

use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;

use crate::allocation::{Allocation, AllocationPayload};
use crate::block::DeviceMemoryBlock;
use crate::device::DeviceContext;
use crate::error::AllocError;
use crate::metadata::FitStrategy;
use crate::vector::VectorState;

/// Moves that only become possible after earlier moves vacate space are
/// caught by a second pass.
const DEFRAG_ROUND_COUNT: u32 = 2;

/// Caller-supplied budget for one defragmentation call. Applies per memory
/// category.
#[derive(Debug, Clone, Copy)]
pub struct DefragmentationInfo {
    pub max_bytes_to_move: u64,
    pub max_allocations_to_move: u32,
}

impl Default for DefragmentationInfo {
    fn default() -> DefragmentationInfo {
        DefragmentationInfo {
            max_bytes_to_move: u64::max_value(),
            max_allocations_to_move: u32::max_value(),
        }
    }
}

/// What a defragmentation call accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragmentationStats {
    pub bytes_moved: u64,
    pub bytes_freed: u64,
    pub allocations_moved: u32,
    pub device_memory_blocks_freed: u32,
}

/// Whether defragmentation ran to exhaustion or stopped at the caller's
/// budget. Stopping early is not an error; call again to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragmentationStatus {
    Complete,
    Incomplete,
}

/// One allocation offered for moving, tagged with its position in the
/// caller's slice so changed flags can be reported back in order.
pub(crate) struct DefragCandidate {
    pub allocation: Arc<Allocation>,
    pub input_index: usize,
}

struct CandidateState {
    allocation: Arc<Allocation>,
    input_index: usize,
    changed: bool,
}

/// Per-block view during one run. Blocks holding anything outside the
/// candidate set can never be emptied, which makes them pure destinations;
/// they sort first so movable content drains into them.
struct BlockInfo {
    slot_index: usize,
    has_non_movable: bool,
    sum_free_size: u64,
    /// Indices into the candidate list, largest allocation first: big
    /// regions need the scarce big gaps, small ones fit anywhere.
    candidates: Vec<usize>,
}

pub(crate) struct Defragmentator {
    ctx: Arc<DeviceContext>,
    current_frame_index: u32,
    candidates: Vec<CandidateState>,
    bytes_moved: u64,
    allocations_moved: u32,
    mapped_blocks: SmallVec<[Arc<DeviceMemoryBlock>; 8]>,
}

impl Defragmentator {
    pub fn new(ctx: Arc<DeviceContext>, current_frame_index: u32,
               candidates: Vec<DefragCandidate>) -> Defragmentator {
        Defragmentator {
            ctx,
            current_frame_index,
            candidates: candidates.into_iter().map(|c| CandidateState {
                allocation: c.allocation,
                input_index: c.input_index,
                changed: false,
            }).collect(),
            bytes_moved: 0,
            allocations_moved: 0,
            mapped_blocks: SmallVec::new(),
        }
    }

    #[inline]
    pub fn bytes_moved(&self) -> u64 { self.bytes_moved }
    #[inline]
    pub fn allocations_moved(&self) -> u32 { self.allocations_moved }

    /// Per-candidate `(input_index, moved)` pairs.
    pub fn into_results(self) -> Vec<(usize, bool)> {
        self.candidates.iter().map(|c| (c.input_index, c.changed)).collect()
    }

    /// Executes up to [DEFRAG_ROUND_COUNT] passes under the owning vector's
    /// lock.
    pub fn run(&mut self, state: &mut VectorState, max_bytes_to_move: u64,
               max_allocations_to_move: u32)
               -> Result<DefragmentationStatus, AllocError> {
        let mut infos = self.build_infos(state);
        let mut result = Ok(DefragmentationStatus::Complete);
        for round in 0..DEFRAG_ROUND_COUNT {
            match self.round(state, &mut infos, max_bytes_to_move, max_allocations_to_move) {
                Ok(DefragmentationStatus::Complete) => {
                    debug!("defragmentation round {}: {} allocations, {} bytes moved so far",
                           round, self.allocations_moved, self.bytes_moved);
                }
                other => {
                    result = other;
                    break;
                }
            }
        }
        for block in self.mapped_blocks.drain(..) {
            block.unmap(&self.ctx);
        }
        result
    }

    fn build_infos(&self, state: &VectorState) -> Vec<BlockInfo> {
        let mut infos: Vec<BlockInfo> = state.slots.iter().enumerate().map(|(i, slot)| {
            BlockInfo {
                slot_index: i,
                has_non_movable: false,
                sum_free_size: slot.meta.sum_free_size(),
                candidates: Vec::new(),
            }
        }).collect();

        for (ci, cand) in self.candidates.iter().enumerate() {
            if cand.allocation.is_lost() {
                continue;
            }
            let block = match &*cand.allocation.payload.read() {
                AllocationPayload::Block { block, .. } => block.clone(),
                _ => continue,
            };
            if let Some(info) = infos.iter_mut().find(|info| {
                Arc::ptr_eq(&state.slots[info.slot_index].block, &block)
            }) {
                info.candidates.push(ci);
            }
        }

        for info in infos.iter_mut() {
            info.has_non_movable =
                state.slots[info.slot_index].meta.allocation_count() != info.candidates.len();
            let candidates = &self.candidates;
            info.candidates.sort_by(|&a, &b| {
                candidates[b].allocation.size().cmp(&candidates[a].allocation.size())
            });
        }

        // best destinations first: blocks that can never be emptied, then
        // ascending free space
        infos.sort_by(|a, b| {
            use std::cmp::Ordering;
            match (a.has_non_movable, b.has_non_movable) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => a.sum_free_size.cmp(&b.sum_free_size),
            }
        });
        infos
    }

    fn round(&mut self, state: &mut VectorState, infos: &mut Vec<BlockInfo>,
             max_bytes_to_move: u64, max_allocations_to_move: u32)
             -> Result<DefragmentationStatus, AllocError> {
        if infos.is_empty() {
            return Ok(DefragmentationStatus::Complete);
        }

        let mut src_block = infos.len() - 1;
        let mut src_pos = 0usize;
        loop {
            while src_pos >= infos[src_block].candidates.len() {
                if src_block == 0 {
                    return Ok(DefragmentationStatus::Complete);
                }
                src_block -= 1;
                src_pos = 0;
            }

            let cand_index = infos[src_block].candidates[src_pos];
            let allocation = self.candidates[cand_index].allocation.clone();
            if allocation.is_lost() {
                src_pos += 1;
                continue;
            }
            let size = allocation.size();
            let alignment = allocation.alignment();
            let (src_block_arc, src_offset, kind) = match &*allocation.payload.read() {
                AllocationPayload::Block { block, offset, kind, .. } => {
                    (block.clone(), *offset, *kind)
                }
                _ => {
                    src_pos += 1;
                    continue;
                }
            };

            let mut moved = false;
            for dst_block in 0..=src_block {
                let dst_slot = infos[dst_block].slot_index;
                let request = state.slots[dst_slot].meta.create_allocation_request(
                    self.current_frame_index, 0, size, alignment, kind, false,
                    FitStrategy::BestFit);
                let request = match request {
                    Some(r) => r,
                    None => continue,
                };
                // forward moves only: a lower block, or a lower offset in
                // the same block; anything else would undo progress
                if dst_block == src_block && request.offset >= src_offset {
                    continue;
                }
                if self.allocations_moved + 1 > max_allocations_to_move
                    || self.bytes_moved + size > max_bytes_to_move
                {
                    return Ok(DefragmentationStatus::Incomplete);
                }

                let dst_block_arc = state.slots[dst_slot].block.clone();
                let dst_ptr = self.ensure_mapped(&dst_block_arc)?;
                let src_ptr = self.ensure_mapped(&src_block_arc)?;
                // the regions are disjoint: same-block moves only go to a
                // free region below the source
                unsafe {
                    ptr::copy_nonoverlapping(
                        src_ptr.as_ptr().add(src_offset as usize),
                        dst_ptr.as_ptr().add(request.offset as usize),
                        size as usize);
                }
                let new_offset = request.offset;
                state.slots[dst_slot].meta.alloc(&request, kind, size, &allocation);
                let src_slot = infos[src_block].slot_index;
                debug_assert!(Arc::ptr_eq(&state.slots[src_slot].block, &src_block_arc));
                state.slots[src_slot].meta.free_at_offset(src_offset);
                allocation.change_block_allocation(dst_block_arc.clone(), new_offset);
                if allocation.persistently_mapped() {
                    // the persistent mapping reference follows the payload
                    dst_block_arc.map(&self.ctx)?;
                    src_block_arc.unmap(&self.ctx);
                }

                self.candidates[cand_index].changed = true;
                self.allocations_moved += 1;
                self.bytes_moved += size;
                infos[src_block].candidates.remove(src_pos);
                moved = true;
                break;
            }
            if !moved {
                src_pos += 1;
            }
        }
    }

    /// Maps a block at most once per run, reusing any live mapping.
    fn ensure_mapped(&mut self, block: &Arc<DeviceMemoryBlock>)
                     -> Result<NonNull<u8>, AllocError> {
        if self.mapped_blocks.iter().any(|b| Arc::ptr_eq(b, block)) {
            block.mapped_ptr().ok_or(AllocError::MapFailed)
        } else {
            let ptr = block.map(&self.ctx)?;
            self.mapped_blocks.push(block.clone());
            Ok(ptr)
        }
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    mod defragmentator {
        use crate::allocation::AllocationCreateInfo;
        use crate::defrag::{DefragCandidate, DefragmentationStats, DefragmentationStatus};
        use crate::device::DeviceContext;
        use crate::metadata::{FitStrategy, SuballocationKind};
        use crate::test_support::{test_properties, MockDevice};
        use crate::vector::BlockVector;
        use std::sync::Arc;

        fn fixed_vector(device: &Arc<MockDevice>, block_size: u64,
                        max_blocks: usize) -> BlockVector {
            let ctx = Arc::new(DeviceContext::new(
                device.clone(), test_properties(1 << 20), None, None, 0, 1));
            BlockVector::new(ctx, 0, block_size, 0, max_blocks, true, 0,
                             FitStrategy::BestFit)
        }

        fn plain() -> AllocationCreateInfo {
            AllocationCreateInfo::default()
        }

        #[test]
        fn compacts_within_one_block_and_preserves_bytes() {
            let device = Arc::new(MockDevice::new());
            let v = fixed_vector(&device, 256, 1);
            let a = v.allocate(1, 64, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            let b = v.allocate(1, 64, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            let c = v.allocate(1, 64, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            v.free(&b);

            // stamp c's bytes so the move is observable
            let memory = device.only_memory();
            let pattern: Vec<u8> = (0..64u8).map(|i| i ^ 0xa5).collect();
            device.poke(memory, 128, &pattern);

            let mut stats = DefragmentationStats::default();
            let (status, results) = v.defragment(
                vec![
                    DefragCandidate { allocation: a.clone(), input_index: 0 },
                    DefragCandidate { allocation: c.clone(), input_index: 1 },
                ],
                2, u64::max_value(), u32::max_value(), &mut stats).unwrap();

            assert_eq!(status, DefragmentationStatus::Complete);
            // a stayed, c moved into b's old gap
            assert!(results.contains(&(0, false)));
            assert!(results.contains(&(1, true)));
            assert_eq!(c.block_offset(), 64);
            assert_eq!(stats.allocations_moved, 1);
            assert_eq!(stats.bytes_moved, 64);
            assert_eq!(device.peek(memory, 64, 64), pattern);

            v.free(&a);
            v.free(&c);
        }

        #[test]
        fn drains_movable_block_into_destination_and_frees_it() {
            let device = Arc::new(MockDevice::new());
            let v = fixed_vector(&device, 256, 2);
            // block 1: p (pinned outside the candidate set) + a hole
            let p = v.allocate(1, 100, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            let q = v.allocate(1, 100, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            // block 2
            let r = v.allocate(1, 100, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            v.free(&q);
            assert_eq!(v.block_count(), 2);

            let mut stats = DefragmentationStats::default();
            let (status, results) = v.defragment(
                vec![DefragCandidate { allocation: r.clone(), input_index: 0 }],
                2, u64::max_value(), u32::max_value(), &mut stats).unwrap();

            assert_eq!(status, DefragmentationStatus::Complete);
            assert_eq!(results, vec![(0, true)]);
            // r now lives next to p, and the emptied block is gone
            assert_eq!(r.block_offset(), 100);
            assert_eq!(v.block_count(), 1);
            assert_eq!(stats.device_memory_blocks_freed, 1);
            assert_eq!(stats.bytes_freed, 256);
            assert_eq!(device.free_calls(), 1);

            v.free(&p);
            v.free(&r);
        }

        #[test]
        fn zero_budget_reports_incomplete_without_moving() {
            let device = Arc::new(MockDevice::new());
            let v = fixed_vector(&device, 256, 1);
            let a = v.allocate(1, 64, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            let b = v.allocate(1, 64, 1, SuballocationKind::Buffer, &plain(), None).unwrap();
            v.free(&a);

            let mut stats = DefragmentationStats::default();
            let (status, results) = v.defragment(
                vec![DefragCandidate { allocation: b.clone(), input_index: 0 }],
                2, u64::max_value(), 0, &mut stats).unwrap();

            assert_eq!(status, DefragmentationStatus::Incomplete);
            assert_eq!(results, vec![(0, false)]);
            assert_eq!(b.block_offset(), 64);
            assert_eq!(stats.allocations_moved, 0);

            v.free(&b);
        }

        #[test]
        fn lost_candidates_are_skipped() {
            let device = Arc::new(MockDevice::new());
            let ctx = Arc::new(DeviceContext::new(
                device.clone(), test_properties(1 << 20), None, None, 0, 1));
            let v = BlockVector::new(ctx, 0, 256, 0, 1, true, 0, FitStrategy::BestFit);

            let mut lostable = AllocationCreateInfo::default();
            lostable.flags.can_become_lost = true;
            let a = v.allocate(1, 64, 1, SuballocationKind::Buffer, &lostable, None).unwrap();
            assert_eq!(v.make_allocations_lost(5), 1);
            assert!(a.is_lost());

            let mut stats = DefragmentationStats::default();
            let (status, results) = v.defragment(
                vec![DefragCandidate { allocation: a.clone(), input_index: 0 }],
                5, u64::max_value(), u32::max_value(), &mut stats).unwrap();
            assert_eq!(status, DefragmentationStatus::Complete);
            assert_eq!(results, vec![(0, false)]);
        }
    }
}
