//! Host-memory mock of the device seam, so allocator behavior (including
//! defragmentation byte moves) is testable without a GPU.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::device::{DeviceMemoryHandle, MemoryDevice, MemoryHeap, MemoryPropertyFlags,
                    MemoryType, PhysicalMemoryProperties, ResourceHandle};
use crate::error::AllocError;

struct MockState {
    memories: HashMap<u64, Box<[u8]>>,
    next_handle: u64,
    fail_allocations: u32,
    allocation_sizes: Vec<u64>,
}

/// A [MemoryDevice] backed by plain host memory. Mapping returns a real
/// pointer into the backing allocation so byte copies are observable.
pub(crate) struct MockDevice {
    state: Mutex<MockState>,
    map_calls: AtomicU32,
    unmap_calls: AtomicU32,
    free_calls: AtomicU32,
    bind_calls: AtomicU32,
}

impl MockDevice {
    pub fn new() -> MockDevice {
        MockDevice {
            state: Mutex::new(MockState {
                memories: HashMap::new(),
                next_handle: 1,
                fail_allocations: 0,
                allocation_sizes: Vec::new(),
            }),
            map_calls: AtomicU32::new(0),
            unmap_calls: AtomicU32::new(0),
            free_calls: AtomicU32::new(0),
            bind_calls: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` native allocations fail with device OOM.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_allocations = count;
    }

    pub fn map_calls(&self) -> u32 { self.map_calls.load(Ordering::Relaxed) }
    pub fn unmap_calls(&self) -> u32 { self.unmap_calls.load(Ordering::Relaxed) }
    pub fn free_calls(&self) -> u32 { self.free_calls.load(Ordering::Relaxed) }
    pub fn bind_calls(&self) -> u32 { self.bind_calls.load(Ordering::Relaxed) }

    /// Sizes of every successful native allocation, in order.
    pub fn allocation_sizes(&self) -> Vec<u64> {
        self.state.lock().allocation_sizes.clone()
    }

    /// The handle of the single live memory object. Panics unless exactly
    /// one is live.
    pub fn only_memory(&self) -> DeviceMemoryHandle {
        let state = self.state.lock();
        assert_eq!(state.memories.len(), 1);
        DeviceMemoryHandle(*state.memories.keys().next().unwrap())
    }

    pub fn poke(&self, memory: DeviceMemoryHandle, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let bytes = state.memories.get_mut(&memory.0).unwrap();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    pub fn peek(&self, memory: DeviceMemoryHandle, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let bytes = &state.memories[&memory.0];
        bytes[offset as usize..offset as usize + len].to_vec()
    }
}

impl MemoryDevice for MockDevice {
    fn allocate_memory(&self, _memory_type_index: u32, size: u64)
                       -> Result<DeviceMemoryHandle, AllocError> {
        let mut state = self.state.lock();
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(AllocError::OutOfDeviceMemory);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.memories.insert(handle, vec![0u8; size as usize].into_boxed_slice());
        state.allocation_sizes.push(size);
        Ok(DeviceMemoryHandle(handle))
    }

    fn free_memory(&self, memory: DeviceMemoryHandle) {
        let removed = self.state.lock().memories.remove(&memory.0);
        assert!(removed.is_some(), "double free of native memory");
        self.free_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<NonNull<u8>, AllocError> {
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let bytes = state.memories.get_mut(&memory.0).ok_or(AllocError::MapFailed)?;
        // the box's backing storage does not move while it stays in the map
        NonNull::new(bytes.as_mut_ptr()).ok_or(AllocError::MapFailed)
    }

    fn unmap_memory(&self, _memory: DeviceMemoryHandle) {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn bind_buffer(&self, memory: DeviceMemoryHandle, offset: u64,
                   _buffer: ResourceHandle) -> Result<(), AllocError> {
        let state = self.state.lock();
        assert!(state.memories.contains_key(&memory.0));
        assert!(offset < state.memories[&memory.0].len() as u64);
        self.bind_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn bind_image(&self, memory: DeviceMemoryHandle, offset: u64,
                  image: ResourceHandle) -> Result<(), AllocError> {
        self.bind_buffer(memory, offset, image)
    }
}

/// One memory type with every useful property, backed by one heap.
pub(crate) fn test_properties(heap_size: u64) -> PhysicalMemoryProperties {
    PhysicalMemoryProperties {
        memory_types: vec![MemoryType {
            property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                | MemoryPropertyFlags::HOST_VISIBLE
                | MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        }],
        memory_heaps: vec![MemoryHeap { size: heap_size }],
        buffer_image_granularity: 1,
    }
}

/// A topology with distinct device-local, host-visible and combined types.
pub(crate) fn test_properties_multi() -> PhysicalMemoryProperties {
    PhysicalMemoryProperties {
        memory_types: vec![
            MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                    | MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 0,
            },
        ],
        memory_heaps: vec![
            MemoryHeap { size: 1 << 30 },
            MemoryHeap { size: 1 << 28 },
        ],
        buffer_image_granularity: 1,
    }
}
