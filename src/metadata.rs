//! Bookkeeping for the regions inside one memory block.
//!
//! [BlockMetadata] records how a block's byte range is carved up: an ordered
//! sequence of [Suballocation]s, each either free or owned by one
//! [Allocation](crate::allocation::Allocation), covering `[0, size)` with no
//! gaps, plus a size-sorted index over the free ones for fast best-fit
//! search. The sequence lives in a [generational_arena::Arena] with
//! prev/next links, so erasing and splitting regions never invalidates the
//! indices held by an in-flight [AllocationRequest].
//!
//! Invariants maintained at every public-method boundary:
//! - suballocation offsets are contiguous, start at 0 and sum to the block size;
//! - no two adjacent suballocations are both free (coalescing always fires);
//! - the tracked free-byte total equals the sum of free suballocation sizes.

use std::sync::Arc;

use generational_arena::{Arena, Index};
use smallvec::SmallVec;

use crate::allocation::Allocation;
use crate::stats::StatInfo;
use crate::MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER;

/// Cost charged per evicted allocation when comparing candidate placements,
/// on top of the evicted bytes themselves. Biases the search toward fewer,
/// smaller evictions.
const LOST_SUBALLOCATION_COST: u64 = 1 << 20;

/// What kind of resource occupies a suballocation. Drives the
/// page-granularity conflict rule between neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuballocationKind {
    Free,
    /// Occupied, resource kind not stated. Conflicts with everything.
    Unknown,
    Buffer,
    ImageLinear,
    ImageOptimal,
}

/// Free-region selection policy for the primary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
    /// Smallest sufficient free region, found by binary search in the
    /// size-sorted index. The default.
    BestFit,
    /// Largest free region first.
    WorstFit,
}

impl Default for FitStrategy {
    fn default() -> FitStrategy { FitStrategy::BestFit }
}

/// One contiguous sub-range of a block.
pub(crate) struct Suballocation {
    pub offset: u64,
    pub size: u64,
    pub kind: SuballocationKind,
    pub alloc: Option<Arc<Allocation>>,
    prev: Option<Index>,
    next: Option<Index>,
}

impl Suballocation {
    #[inline]
    pub fn is_free(&self) -> bool { self.kind == SuballocationKind::Free }
}

/// Result of a feasibility search: where an allocation could go and what it
/// would cost. Valid only against the exact metadata state it was computed
/// from; commit it before anything else mutates the block.
pub(crate) struct AllocationRequest {
    pub offset: u64,
    /// Free bytes among the consumed suballocations.
    pub sum_free_size: u64,
    /// Bytes of allocations that would have to be made lost.
    pub sum_item_size: u64,
    /// Anchor suballocation; updated while victims are made lost.
    pub item: Index,
    pub items_to_make_lost_count: usize,
}

impl AllocationRequest {
    #[inline]
    pub fn cost(&self) -> u64 {
        self.sum_item_size + self.items_to_make_lost_count as u64 * LOST_SUBALLOCATION_COST
    }
}

// Alignment helpers ///////////////////////////////////////////////////////////////////////////////

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    (value + alignment - 1) / alignment * alignment
}

/// Whether the end of region A and the start of region B land on the same
/// aligned page. `page_size` must be a power of two.
pub(crate) fn blocks_on_same_page(a_offset: u64, a_size: u64, b_offset: u64, page_size: u64) -> bool {
    debug_assert!(a_offset + a_size <= b_offset && a_size > 0 && page_size > 0);
    debug_assert!(page_size.is_power_of_two());
    let a_end = a_offset + a_size - 1;
    let a_end_page = a_end & !(page_size - 1);
    let b_start_page = b_offset & !(page_size - 1);
    a_end_page == b_start_page
}

/// Whether two resource kinds may not share a granularity page.
pub(crate) fn is_granularity_conflict(mut a: SuballocationKind, mut b: SuballocationKind) -> bool {
    use self::SuballocationKind::*;
    // order the pair so fewer cases need spelling out
    if kind_rank(a) > kind_rank(b) {
        std::mem::swap(&mut a, &mut b);
    }
    match a {
        Free => false,
        Unknown => true,
        Buffer => b == ImageOptimal,
        ImageLinear => b == ImageOptimal,
        ImageOptimal => false,
    }
}

#[inline]
fn kind_rank(kind: SuballocationKind) -> u8 {
    use self::SuballocationKind::*;
    match kind {
        Free => 0,
        Unknown => 1,
        Buffer => 2,
        ImageLinear => 3,
        ImageOptimal => 4,
    }
}

// BlockMetadata ///////////////////////////////////////////////////////////////////////////////////

/// Region bookkeeping for one block of `size` bytes.
pub(crate) struct BlockMetadata {
    size: u64,
    granularity: u64,
    debug_margin: u64,
    free_count: usize,
    sum_free_size: u64,
    nodes: Arena<Suballocation>,
    head: Index,
    tail: Index,
    /// Free suballocations of at least
    /// [MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER] bytes, sorted by ascending
    /// size.
    free_by_size: Vec<Index>,
}

impl BlockMetadata {
    pub fn new(size: u64, granularity: u64, debug_margin: u64) -> BlockMetadata {
        let mut nodes = Arena::new();
        let whole = nodes.insert(Suballocation {
            offset: 0,
            size,
            kind: SuballocationKind::Free,
            alloc: None,
            prev: None,
            next: None,
        });
        let mut meta = BlockMetadata {
            size,
            granularity,
            debug_margin,
            free_count: 1,
            sum_free_size: size,
            nodes,
            head: whole,
            tail: whole,
            free_by_size: Vec::new(),
        };
        meta.register_free(whole);
        meta
    }

    #[inline]
    pub fn size(&self) -> u64 { self.size }
    #[inline]
    pub fn sum_free_size(&self) -> u64 { self.sum_free_size }
    #[inline]
    pub fn allocation_count(&self) -> usize { self.nodes.len() - self.free_count }
    #[inline]
    pub fn free_range_count(&self) -> usize { self.free_count }

    /// Whole block is a single free range.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.free_count == 1
    }

    /// Largest registered free range, for statistics.
    pub fn largest_free_size(&self) -> u64 {
        match self.free_by_size.last() {
            Some(&idx) => self.nodes[idx].size,
            None => 0,
        }
    }

    /// Suballocations in offset order.
    pub fn iter(&self) -> SuballocationIter {
        SuballocationIter { meta: self, cur: Some(self.head) }
    }

    // Search //////////////////////////////////////////////////////////////////////////////////////

    /// Finds a placement for `alloc_size`/`alignment`/`kind`, or `None`.
    ///
    /// The primary search only considers registered free regions. When that
    /// fails and `can_make_other_lost` is set, every suballocation in the
    /// block is tried as an anchor and the cheapest feasible eviction plan
    /// wins. That fallback is an exhaustive O(n) walk over the block's
    /// suballocations per call; fine at realistic suballocation counts, a
    /// known cost liability on pathological blocks.
    pub fn create_allocation_request(&self,
                                     current_frame_index: u32,
                                     frame_in_use_count: u32,
                                     alloc_size: u64,
                                     alignment: u64,
                                     kind: SuballocationKind,
                                     can_make_other_lost: bool,
                                     strategy: FitStrategy) -> Option<AllocationRequest> {
        debug_assert!(alloc_size > 0);
        debug_assert!(kind != SuballocationKind::Free);

        if !can_make_other_lost && self.sum_free_size < alloc_size + 2 * self.debug_margin {
            return None;
        }

        if !self.free_by_size.is_empty() {
            match strategy {
                FitStrategy::BestFit => {
                    let threshold = alloc_size + 2 * self.debug_margin;
                    // The minimum-size candidate can still fail alignment or
                    // granularity checks, in which case this degrades to a
                    // linear scan toward larger regions.
                    let start = self.lower_bound_by_size(threshold);
                    for &idx in &self.free_by_size[start..] {
                        if let Some(offset) = self.check_free_fit(idx, alloc_size, alignment, kind) {
                            return Some(AllocationRequest {
                                offset,
                                sum_free_size: self.nodes[idx].size,
                                sum_item_size: 0,
                                item: idx,
                                items_to_make_lost_count: 0,
                            });
                        }
                    }
                }
                FitStrategy::WorstFit => {
                    for &idx in self.free_by_size.iter().rev() {
                        if let Some(offset) = self.check_free_fit(idx, alloc_size, alignment, kind) {
                            return Some(AllocationRequest {
                                offset,
                                sum_free_size: self.nodes[idx].size,
                                sum_item_size: 0,
                                item: idx,
                                items_to_make_lost_count: 0,
                            });
                        }
                    }
                }
            }
        }

        if can_make_other_lost {
            let mut best: Option<AllocationRequest> = None;
            let mut cur = Some(self.head);
            while let Some(idx) = cur {
                let node = &self.nodes[idx];
                let eligible = node.is_free()
                    || node.alloc.as_ref().map_or(false, |a| a.can_become_lost());
                if eligible {
                    if let Some(req) = self.check_lost_fit(idx, current_frame_index,
                                                           frame_in_use_count, alloc_size,
                                                           alignment, kind) {
                        if best.as_ref().map_or(true, |b| req.cost() < b.cost()) {
                            best = Some(req);
                        }
                    }
                }
                cur = node.next;
            }
            return best;
        }

        None
    }

    /// Margin, alignment and predecessor-granularity adjustment for a
    /// placement starting inside the suballocation at `idx`.
    fn place_offset(&self, idx: Index, base: u64, alignment: u64, kind: SuballocationKind) -> u64 {
        let mut offset = base;
        if self.debug_margin > 0 {
            offset += self.debug_margin;
        }
        offset = align_up(offset, alignment);
        if self.granularity > 1 {
            let mut conflict = false;
            let mut prev = self.nodes[idx].prev;
            while let Some(p_idx) = prev {
                let p = &self.nodes[p_idx];
                if blocks_on_same_page(p.offset, p.size, offset, self.granularity) {
                    if is_granularity_conflict(p.kind, kind) {
                        conflict = true;
                        break;
                    }
                } else {
                    break;
                }
                prev = p.prev;
            }
            if conflict {
                offset = align_up(offset, self.granularity);
            }
        }
        offset
    }

    /// Placement test against a single free suballocation.
    fn check_free_fit(&self, idx: Index, alloc_size: u64, alignment: u64,
                      kind: SuballocationKind) -> Option<u64> {
        let node = &self.nodes[idx];
        debug_assert!(node.is_free());
        if node.size < alloc_size {
            return None;
        }
        let offset = self.place_offset(idx, node.offset, alignment, kind);
        let padding_begin = offset - node.offset;
        if padding_begin + alloc_size + self.debug_margin > node.size {
            return None;
        }
        // successors sharing the end page must not conflict
        if self.granularity > 1 {
            let mut next = node.next;
            while let Some(n_idx) = next {
                let n = &self.nodes[n_idx];
                if blocks_on_same_page(offset, alloc_size, n.offset, self.granularity) {
                    if is_granularity_conflict(kind, n.kind) {
                        return None;
                    }
                } else {
                    break;
                }
                next = n.next;
            }
        }
        Some(offset)
    }

    /// Placement test anchored at `idx`, consuming forward suballocations
    /// and tallying which owners would have to be made lost.
    fn check_lost_fit(&self, idx: Index, current_frame_index: u32, frame_in_use_count: u32,
                      alloc_size: u64, alignment: u64, kind: SuballocationKind)
                      -> Option<AllocationRequest> {
        let evictable = |alloc: &Arc<Allocation>| {
            alloc.can_become_lost()
                && alloc.last_use_frame_index().saturating_add(frame_in_use_count)
                    < current_frame_index
        };

        let node = &self.nodes[idx];
        let mut sum_free_size = 0u64;
        let mut sum_item_size = 0u64;
        let mut items = 0usize;
        if node.is_free() {
            sum_free_size = node.size;
        } else {
            let alloc = node.alloc.as_ref()?;
            if !evictable(alloc) {
                return None;
            }
            items += 1;
            sum_item_size += node.size;
        }

        let offset = self.place_offset(idx, node.offset, alignment, kind);
        let required_end = offset + alloc_size + self.debug_margin;

        // consume forward until the whole placement is covered
        let mut last_idx = idx;
        while self.nodes[last_idx].offset + self.nodes[last_idx].size < required_end {
            last_idx = self.nodes[last_idx].next?;
            let last = &self.nodes[last_idx];
            if last.is_free() {
                sum_free_size += last.size;
            } else {
                let alloc = last.alloc.as_ref()?;
                if !evictable(alloc) {
                    return None;
                }
                items += 1;
                sum_item_size += last.size;
            }
        }

        // conflicting successors on the end page must be evictable too
        if self.granularity > 1 {
            let mut next = self.nodes[last_idx].next;
            while let Some(n_idx) = next {
                let n = &self.nodes[n_idx];
                if blocks_on_same_page(offset, alloc_size, n.offset, self.granularity) {
                    if is_granularity_conflict(kind, n.kind) {
                        let alloc = n.alloc.as_ref()?;
                        if !evictable(alloc) {
                            return None;
                        }
                        items += 1;
                    }
                } else {
                    break;
                }
                next = n.next;
            }
        }

        Some(AllocationRequest {
            offset,
            sum_free_size,
            sum_item_size,
            item: idx,
            items_to_make_lost_count: items,
        })
    }

    // Commit //////////////////////////////////////////////////////////////////////////////////////

    /// Commits a request produced by [create_allocation_request] against the
    /// current, unmodified state. Splits the target free region, re-inserting
    /// begin/end padding as free suballocations.
    pub fn alloc(&mut self, request: &AllocationRequest, kind: SuballocationKind,
                 alloc_size: u64, allocation: &Arc<Allocation>) {
        let idx = request.item;
        assert!(self.nodes[idx].is_free(),
                "allocation request committed against modified metadata");
        debug_assert!(request.offset >= self.nodes[idx].offset);

        let padding_begin = request.offset - self.nodes[idx].offset;
        debug_assert!(self.nodes[idx].size >= padding_begin + alloc_size);
        let padding_end = self.nodes[idx].size - padding_begin - alloc_size;

        self.unregister_free(idx);
        {
            let node = &mut self.nodes[idx];
            node.offset = request.offset;
            node.size = alloc_size;
            node.kind = kind;
            node.alloc = Some(allocation.clone());
        }

        if padding_end > 0 {
            let n_idx = self.insert_after(idx, Suballocation {
                offset: request.offset + alloc_size,
                size: padding_end,
                kind: SuballocationKind::Free,
                alloc: None,
                prev: None,
                next: None,
            });
            self.register_free(n_idx);
            self.free_count += 1;
        }
        if padding_begin > 0 {
            let n_idx = self.insert_before(idx, Suballocation {
                offset: request.offset - padding_begin,
                size: padding_begin,
                kind: SuballocationKind::Free,
                alloc: None,
                prev: None,
                next: None,
            });
            self.register_free(n_idx);
            self.free_count += 1;
        }

        self.free_count -= 1;
        self.sum_free_size -= alloc_size;
        debug_assert!(self.validate());
    }

    /// Releases the suballocation owned by `allocation`.
    pub fn free(&mut self, allocation: &Arc<Allocation>) {
        let mut cur = Some(self.head);
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if let Some(a) = &node.alloc {
                if Arc::ptr_eq(a, allocation) {
                    self.free_suballocation(idx);
                    debug_assert!(self.validate());
                    return;
                }
            }
            cur = node.next;
        }
        debug_assert!(false, "allocation not found in block metadata");
    }

    /// Releases the owned suballocation starting at `offset`.
    pub fn free_at_offset(&mut self, offset: u64) {
        let mut cur = Some(self.head);
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if node.offset == offset && !node.is_free() {
                self.free_suballocation(idx);
                debug_assert!(self.validate());
                return;
            }
            cur = node.next;
        }
        debug_assert!(false, "no owned suballocation at offset {}", offset);
    }

    /// Marks the suballocation free and coalesces with free neighbors.
    /// Returns the index of the resulting free suballocation.
    fn free_suballocation(&mut self, idx: Index) -> Index {
        let size = {
            let node = &mut self.nodes[idx];
            debug_assert!(!node.is_free());
            node.kind = SuballocationKind::Free;
            node.alloc = None;
            node.size
        };
        self.free_count += 1;
        self.sum_free_size += size;

        // at most one merge each side: two adjacent frees never coexist
        let mut result = idx;
        if let Some(n_idx) = self.nodes[idx].next {
            if self.nodes[n_idx].is_free() {
                self.merge_free_with_next(idx);
            }
        }
        if let Some(p_idx) = self.nodes[idx].prev {
            if self.nodes[p_idx].is_free() {
                self.unregister_free(p_idx);
                self.merge_free_with_next(p_idx);
                result = p_idx;
            }
        }
        self.register_free(result);
        result
    }

    /// Absorbs the (free) successor of `idx` into it.
    fn merge_free_with_next(&mut self, idx: Index) {
        let n_idx = match self.nodes[idx].next {
            Some(n) => n,
            None => {
                debug_assert!(false, "merge without a successor");
                return;
            }
        };
        debug_assert!(self.nodes[n_idx].is_free());
        self.unregister_free(n_idx);
        if let Some(removed) = self.nodes.remove(n_idx) {
            self.nodes[idx].next = removed.next;
            match removed.next {
                Some(nn) => self.nodes[nn].prev = Some(idx),
                None => self.tail = idx,
            }
            self.nodes[idx].size += removed.size;
            self.free_count -= 1;
        }
    }

    // Eviction ////////////////////////////////////////////////////////////////////////////////////

    /// Commits the eviction side of a request: every victim covered by the
    /// placement is transitioned to the lost state and its region freed.
    ///
    /// All-or-nothing from the caller's perspective: a single lost race
    /// (another thread touched a victim first) returns `false` and the
    /// caller must discard the whole request and search again. Victims
    /// already processed stay lost; each eviction was legitimate on its
    /// own terms.
    pub fn make_requested_allocations_lost(&mut self,
                                           current_frame_index: u32,
                                           frame_in_use_count: u32,
                                           request: &mut AllocationRequest) -> bool {
        while request.items_to_make_lost_count > 0 {
            if self.nodes[request.item].is_free() {
                match self.nodes[request.item].next {
                    Some(n) => request.item = n,
                    None => {
                        debug_assert!(false, "eviction request ran off the block");
                        return false;
                    }
                }
            }
            let victim = match &self.nodes[request.item].alloc {
                Some(a) => a.clone(),
                None => {
                    debug_assert!(false, "eviction victim has no owner");
                    return false;
                }
            };
            debug_assert!(victim.can_become_lost());
            if victim.make_lost(current_frame_index, frame_in_use_count) {
                request.item = self.free_suballocation(request.item);
                request.items_to_make_lost_count -= 1;
            } else {
                return false;
            }
        }
        debug_assert!(self.nodes[request.item].is_free());
        true
    }

    /// Sweeps the whole block, making every sufficiently stale evictable
    /// allocation lost. Returns how many were lost.
    pub fn make_allocations_lost(&mut self, current_frame_index: u32,
                                 frame_in_use_count: u32) -> usize {
        let mut owned: SmallVec<[Index; 16]> = SmallVec::new();
        let mut cur = Some(self.head);
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if !node.is_free() {
                owned.push(idx);
            }
            cur = node.next;
        }

        let mut lost = 0;
        for idx in owned {
            let evict = match &self.nodes[idx].alloc {
                Some(a) => a.can_become_lost()
                    && a.make_lost(current_frame_index, frame_in_use_count),
                None => false,
            };
            if evict {
                self.free_suballocation(idx);
                lost += 1;
            }
        }
        debug_assert!(self.validate());
        lost
    }

    // Free-size index /////////////////////////////////////////////////////////////////////////////

    /// First position in the size index holding a region of at least `size`.
    fn lower_bound_by_size(&self, size: u64) -> usize {
        use std::cmp::Ordering;
        self.free_by_size
            .binary_search_by(|&i| {
                if self.nodes[i].size < size { Ordering::Less } else { Ordering::Greater }
            })
            .unwrap_or_else(|pos| pos)
    }

    fn register_free(&mut self, idx: Index) {
        let size = self.nodes[idx].size;
        if size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }
        let pos = self.lower_bound_by_size(size);
        self.free_by_size.insert(pos, idx);
    }

    /// Must be called before the region's size changes.
    fn unregister_free(&mut self, idx: Index) {
        let size = self.nodes[idx].size;
        if size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }
        let mut pos = self.lower_bound_by_size(size);
        while pos < self.free_by_size.len() {
            if self.free_by_size[pos] == idx {
                self.free_by_size.remove(pos);
                return;
            }
            debug_assert_eq!(self.nodes[self.free_by_size[pos]].size, size);
            pos += 1;
        }
        debug_assert!(false, "free suballocation missing from the size index");
    }

    // Linked-list plumbing ////////////////////////////////////////////////////////////////////////

    fn insert_after(&mut self, idx: Index, mut node: Suballocation) -> Index {
        let old_next = self.nodes[idx].next;
        node.prev = Some(idx);
        node.next = old_next;
        let new_idx = self.nodes.insert(node);
        self.nodes[idx].next = Some(new_idx);
        match old_next {
            Some(n) => self.nodes[n].prev = Some(new_idx),
            None => self.tail = new_idx,
        }
        new_idx
    }

    fn insert_before(&mut self, idx: Index, mut node: Suballocation) -> Index {
        let old_prev = self.nodes[idx].prev;
        node.prev = old_prev;
        node.next = Some(idx);
        let new_idx = self.nodes.insert(node);
        self.nodes[idx].prev = Some(new_idx);
        match old_prev {
            Some(p) => self.nodes[p].next = Some(new_idx),
            None => self.head = new_idx,
        }
        new_idx
    }

    // Statistics & self-check /////////////////////////////////////////////////////////////////////

    pub fn stat_info(&self) -> StatInfo {
        let mut info = StatInfo::new();
        info.block_count = 1;
        for sub in self.iter() {
            if sub.is_free() {
                info.add_unused_range(sub.size);
            } else {
                info.add_allocation(sub.size);
            }
        }
        info
    }

    /// Full consistency self-check. Debug builds and tests only; O(n).
    pub fn validate(&self) -> bool {
        if self.nodes[self.head].prev.is_some() {
            return false;
        }
        let mut calculated_offset = 0u64;
        let mut calculated_free_count = 0usize;
        let mut calculated_sum_free = 0u64;
        let mut registered = 0usize;
        let mut node_count = 0usize;
        let mut prev_free = false;

        let mut cur = Some(self.head);
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if node.offset != calculated_offset || node.size == 0 {
                return false;
            }
            let free = node.is_free();
            if free && prev_free {
                return false;
            }
            if free != node.alloc.is_none() {
                return false;
            }
            if free {
                calculated_free_count += 1;
                calculated_sum_free += node.size;
                if node.size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
                    registered += 1;
                }
            }
            prev_free = free;
            calculated_offset += node.size;
            node_count += 1;
            if node.next.is_none() && idx != self.tail {
                return false;
            }
            cur = node.next;
        }

        if calculated_offset != self.size
            || calculated_free_count != self.free_count
            || calculated_sum_free != self.sum_free_size
            || node_count != self.nodes.len()
            || registered != self.free_by_size.len()
        {
            return false;
        }

        let mut last_size = 0u64;
        for &i in &self.free_by_size {
            let n = &self.nodes[i];
            if !n.is_free() || n.size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER
                || n.size < last_size
            {
                return false;
            }
            last_size = n.size;
        }
        true
    }
}

/// Offset-order iterator over a block's suballocations.
pub(crate) struct SuballocationIter<'a> {
    meta: &'a BlockMetadata,
    cur: Option<Index>,
}

impl<'a> Iterator for SuballocationIter<'a> {
    type Item = &'a Suballocation;

    fn next(&mut self) -> Option<&'a Suballocation> {
        let idx = self.cur?;
        let node = &self.meta.nodes[idx];
        self.cur = node.next;
        Some(node)
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
