//! Caller-defined memory pools.
//!
//! A [Pool] isolates a class of resources in its own block vector with a
//! fixed block size and explicit min/max block counts, instead of sharing
//! the default vector of its memory type. Useful when a resource class must
//! not fragment the general heap, or needs its own lost-allocation timing.

use std::sync::Arc;

use serde::Serialize;

use crate::device::DeviceContext;
use crate::error::AllocError;
use crate::metadata::FitStrategy;
use crate::vector::BlockVector;

/// Description of a caller pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolCreateInfo {
    /// Memory type every block of this pool is allocated from.
    pub memory_type_index: u32,
    /// Fixed size of every block. Unlike the default vectors, pools never
    /// undersize their first blocks.
    pub block_size: u64,
    /// Blocks created eagerly and never freed.
    pub min_block_count: usize,
    pub max_block_count: usize,
    /// Eviction window for lost allocations made from this pool.
    pub frame_in_use_count: u32,
    pub strategy: FitStrategy,
}

impl Default for PoolCreateInfo {
    fn default() -> PoolCreateInfo {
        PoolCreateInfo {
            memory_type_index: 0,
            block_size: 64 * 1024 * 1024,
            min_block_count: 0,
            max_block_count: usize::max_value(),
            frame_in_use_count: 0,
            strategy: FitStrategy::BestFit,
        }
    }
}

/// Point-in-time numbers for one pool.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    /// Bytes owned across all blocks.
    pub size: u64,
    pub unused_size: u64,
    pub allocation_count: usize,
    pub unused_range_count: usize,
    /// Largest registered free range; an allocation beyond this cannot
    /// succeed without growing.
    pub unused_range_size_max: u64,
    pub block_count: usize,
}

/// A dedicated block vector for one class of resources.
pub struct Pool {
    vector: BlockVector,
}

impl Pool {
    pub(crate) fn new(ctx: Arc<DeviceContext>, info: &PoolCreateInfo)
                      -> Result<Pool, AllocError> {
        if info.block_size == 0
            || info.min_block_count > info.max_block_count
            || info.memory_type_index as usize >= ctx.properties.memory_types.len()
        {
            return Err(AllocError::InvalidUsage);
        }
        let vector = BlockVector::new(
            ctx,
            info.memory_type_index,
            info.block_size,
            info.min_block_count,
            info.max_block_count,
            true,
            info.frame_in_use_count,
            info.strategy,
        );
        vector.ensure_min_blocks()?;
        Ok(Pool { vector })
    }

    #[inline]
    pub(crate) fn vector(&self) -> &BlockVector {
        &self.vector
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.vector.memory_type_index()
    }

    pub fn stats(&self) -> PoolStats {
        self.vector.pool_stats()
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    mod pool {
        use crate::device::DeviceContext;
        use crate::pool::{Pool, PoolCreateInfo};
        use crate::test_support::{test_properties, MockDevice};
        use std::sync::Arc;

        #[test]
        fn min_blocks_are_created_eagerly() {
            let device = Arc::new(MockDevice::new());
            let ctx = Arc::new(DeviceContext::new(
                device.clone(), test_properties(1 << 24), None, None, 0, 1));
            let info = PoolCreateInfo {
                block_size: 1024,
                min_block_count: 2,
                ..PoolCreateInfo::default()
            };
            let pool = Pool::new(ctx, &info).unwrap();
            assert_eq!(device.allocation_sizes(), vec![1024, 1024]);
            let stats = pool.stats();
            assert_eq!(stats.block_count, 2);
            assert_eq!(stats.size, 2048);
            assert_eq!(stats.unused_size, 2048);
            assert_eq!(stats.allocation_count, 0);
        }

        #[test]
        fn invalid_description_is_rejected() {
            let device = Arc::new(MockDevice::new());
            let ctx = Arc::new(DeviceContext::new(
                device, test_properties(1 << 24), None, None, 0, 1));
            let info = PoolCreateInfo {
                memory_type_index: 7,
                ..PoolCreateInfo::default()
            };
            assert!(Pool::new(ctx, &info).is_err());
        }
    }
}
