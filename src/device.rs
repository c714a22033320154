//! The seam between this crate and the native memory API.
//!
//! Nothing in here talks to a real device. The host hands us a
//! [MemoryDevice] implementation at construction along with a
//! [PhysicalMemoryProperties] table describing what that device looks like,
//! and every native call the allocator ever makes goes through that trait.
//! [DeviceContext] wraps the trait with the bookkeeping the allocator needs
//! around every call: per-heap byte ceilings and instrumentation callbacks.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AllocError;

/// Opaque handle to one native memory object. Only ever dereferenced by the
/// host's [MemoryDevice] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemoryHandle(pub u64);

/// Opaque handle to a native resource object (buffer or image) that memory
/// can be bound to. The allocator never creates or destroys these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u64);

bitflags! {
    /// Property flags of one memory type, mirroring the native property bits.
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL     = 0x0000_0001;
        const HOST_VISIBLE     = 0x0000_0002;
        const HOST_COHERENT    = 0x0000_0004;
        const HOST_CACHED      = 0x0000_0008;
        const LAZILY_ALLOCATED = 0x0000_0010;
    }
}

impl MemoryPropertyFlags {
    #[inline]
    pub fn is_host_visible(&self) -> bool { self.contains(MemoryPropertyFlags::HOST_VISIBLE) }
    #[inline]
    pub fn is_device_local(&self) -> bool { self.contains(MemoryPropertyFlags::DEVICE_LOCAL) }
}

/// One memory type: a set of property flags plus the heap it draws from.
#[derive(Debug, Clone, Copy)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One memory heap and its capacity in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryHeap {
    pub size: u64,
}

/// The device's memory topology, queried once by the host and handed to
/// [Allocator::new](crate::allocator::Allocator::new).
#[derive(Debug, Clone)]
pub struct PhysicalMemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
    /// Page size below which resources of conflicting kinds must not share
    /// an aligned page. `1` disables the rule.
    pub buffer_image_granularity: u64,
}

impl PhysicalMemoryProperties {
    /// Heap capacity backing the given memory type.
    #[inline]
    pub fn heap_size_for_type(&self, memory_type_index: u32) -> u64 {
        let heap_index = self.memory_types[memory_type_index as usize].heap_index;
        self.memory_heaps[heap_index as usize].size
    }
}

/// Entry points into the native memory API. Implemented by the host,
/// injected once at allocator construction.
///
/// Every method is treated as a synchronous black box. `map_memory` maps the
/// whole object; offsets are applied by the caller.
pub trait MemoryDevice: Send + Sync {
    fn allocate_memory(&self, memory_type_index: u32, size: u64)
                       -> Result<DeviceMemoryHandle, AllocError>;
    fn free_memory(&self, memory: DeviceMemoryHandle);
    fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<NonNull<u8>, AllocError>;
    fn unmap_memory(&self, memory: DeviceMemoryHandle);
    fn bind_buffer(&self, memory: DeviceMemoryHandle, offset: u64, buffer: ResourceHandle)
                   -> Result<(), AllocError>;
    fn bind_image(&self, memory: DeviceMemoryHandle, offset: u64, image: ResourceHandle)
                  -> Result<(), AllocError>;
}

/// Instrumentation hooks fired after every native allocate/free. Optional.
pub trait DeviceCallbacks: Send + Sync {
    fn on_allocate(&self, memory_type_index: u32, size: u64);
    fn on_free(&self, memory_type_index: u32, size: u64);
}

// DeviceContext ///////////////////////////////////////////////////////////////////////////////////

/// Everything the lower layers need to talk to the device: the injected
/// entry points, the memory topology, optional callbacks, and per-heap
/// usage accounting against the optional simulated ceilings.
pub(crate) struct DeviceContext {
    pub device: Arc<dyn MemoryDevice>,
    pub properties: PhysicalMemoryProperties,
    pub callbacks: Option<Box<dyn DeviceCallbacks>>,
    /// Effective byte ceiling per heap: the configured limit clamped to the
    /// heap size, or the heap size itself.
    heap_limits: Vec<u64>,
    heap_usage: Vec<AtomicU64>,
    pub debug_margin: u64,
    pub debug_min_alignment: u64,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn MemoryDevice>,
               properties: PhysicalMemoryProperties,
               callbacks: Option<Box<dyn DeviceCallbacks>>,
               heap_size_limits: Option<Vec<u64>>,
               debug_margin: u64,
               debug_min_alignment: u64) -> DeviceContext {
        let heap_count = properties.memory_heaps.len();
        let heap_limits = (0..heap_count).map(|i| {
            let heap_size = properties.memory_heaps[i].size;
            match &heap_size_limits {
                Some(limits) if i < limits.len() => limits[i].min(heap_size),
                _ => heap_size,
            }
        }).collect();
        let heap_usage = (0..heap_count).map(|_| AtomicU64::new(0)).collect();
        DeviceContext {
            device,
            properties,
            callbacks,
            heap_limits,
            heap_usage,
            debug_margin,
            debug_min_alignment,
        }
    }

    #[inline]
    pub fn granularity(&self) -> u64 {
        self.properties.buffer_image_granularity
    }

    /// Bytes currently allocated from the given heap.
    #[inline]
    pub fn heap_usage(&self, heap_index: u32) -> u64 {
        self.heap_usage[heap_index as usize].load(Ordering::Relaxed)
    }

    /// Allocates one native memory object, honoring the heap ceiling and
    /// firing the instrumentation callback on success.
    pub fn allocate(&self, memory_type_index: u32, size: u64)
                    -> Result<DeviceMemoryHandle, AllocError> {
        let heap_index = self.properties.memory_types[memory_type_index as usize].heap_index as usize;
        let limit = self.heap_limits[heap_index];
        let usage = &self.heap_usage[heap_index];

        // Reserve budget up front so concurrent allocations can't overshoot
        // the ceiling together.
        let mut current = usage.load(Ordering::Relaxed);
        loop {
            if current + size > limit {
                return Err(AllocError::OutOfDeviceMemory);
            }
            match usage.compare_exchange_weak(current, current + size,
                                              Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        match self.device.allocate_memory(memory_type_index, size) {
            Ok(memory) => {
                if let Some(cb) = &self.callbacks {
                    cb.on_allocate(memory_type_index, size);
                }
                Ok(memory)
            }
            Err(e) => {
                usage.fetch_sub(size, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Frees one native memory object and releases its heap budget.
    pub fn free(&self, memory_type_index: u32, memory: DeviceMemoryHandle, size: u64) {
        self.device.free_memory(memory);
        if let Some(cb) = &self.callbacks {
            cb.on_free(memory_type_index, size);
        }
        let heap_index = self.properties.memory_types[memory_type_index as usize].heap_index as usize;
        self.heap_usage[heap_index].fetch_sub(size, Ordering::Relaxed);
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    mod devicecontext {
        use crate::device::*;
        use crate::error::AllocError;
        use crate::test_support::{test_properties, MockDevice};
        use std::sync::Arc;

        #[test]
        fn heap_ceiling_rejects_allocations_past_the_limit() {
            let device = Arc::new(MockDevice::new());
            let ctx = DeviceContext::new(device, test_properties(1024), None,
                                         Some(vec![256]), 0, 1);
            let first = ctx.allocate(0, 200).unwrap();
            assert_eq!(ctx.allocate(0, 100).unwrap_err(), AllocError::OutOfDeviceMemory);
            ctx.free(0, first, 200);
            // budget released, fits again
            ctx.allocate(0, 100).unwrap();
        }

        #[test]
        fn failed_native_allocation_releases_reserved_budget() {
            let device = Arc::new(MockDevice::new());
            device.fail_next_allocations(1);
            let ctx = DeviceContext::new(device, test_properties(1024), None, None, 0, 1);
            assert!(ctx.allocate(0, 100).is_err());
            assert_eq!(ctx.heap_usage(0), 0);
        }
    }
}
