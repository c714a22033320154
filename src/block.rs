//! One real device memory object.
//!
//! [DeviceMemoryBlock] owns a single native memory handle and arbitrates
//! every map, unmap and bind issued against it. The native API forbids
//! concurrent map/bind on the same memory object from multiple threads, so
//! all three go through one mutex here. Mapping is reference counted: the
//! underlying object is mapped at most once no matter how many logical
//! allocations inside it want a pointer.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::device::{DeviceContext, DeviceMemoryHandle, ResourceHandle};
use crate::error::AllocError;

struct MapState {
    ref_count: u32,
    ptr: Option<NonNull<u8>>,
}

/// A block of device memory shared by the allocations placed within it.
/// Region bookkeeping lives in the owning block vector's
/// [BlockMetadata](crate::metadata::BlockMetadata), not here.
pub(crate) struct DeviceMemoryBlock {
    id: u32,
    memory_type_index: u32,
    memory: DeviceMemoryHandle,
    size: u64,
    mapping: Mutex<MapState>,
}

// The mapped pointer is only handed to callers; the block itself never
// dereferences it.
unsafe impl Send for DeviceMemoryBlock {}
unsafe impl Sync for DeviceMemoryBlock {}

impl DeviceMemoryBlock {
    pub fn new(id: u32, memory_type_index: u32, memory: DeviceMemoryHandle,
               size: u64) -> DeviceMemoryBlock {
        DeviceMemoryBlock {
            id,
            memory_type_index,
            memory,
            size,
            mapping: Mutex::new(MapState { ref_count: 0, ptr: None }),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 { self.id }
    #[inline]
    pub fn memory(&self) -> DeviceMemoryHandle { self.memory }
    #[inline]
    pub fn size(&self) -> u64 { self.size }
    #[inline]
    pub fn memory_type_index(&self) -> u32 { self.memory_type_index }

    /// Maps the whole block, reusing an existing native mapping if one is
    /// live. Pair every call with [unmap](DeviceMemoryBlock::unmap).
    pub fn map(&self, ctx: &DeviceContext) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.mapping.lock();
        if state.ref_count > 0 {
            state.ref_count += 1;
            match state.ptr {
                Some(ptr) => Ok(ptr),
                None => Err(AllocError::MapFailed),
            }
        } else {
            let ptr = ctx.device.map_memory(self.memory)?;
            state.ref_count = 1;
            state.ptr = Some(ptr);
            Ok(ptr)
        }
    }

    pub fn unmap(&self, ctx: &DeviceContext) {
        let mut state = self.mapping.lock();
        debug_assert!(state.ref_count > 0, "unmap without a matching map");
        if state.ref_count == 0 {
            return;
        }
        state.ref_count -= 1;
        if state.ref_count == 0 {
            state.ptr = None;
            ctx.device.unmap_memory(self.memory);
        }
    }

    /// Base pointer of the current mapping, if any.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapping.lock().ptr
    }

    /// Binds a region of this block to a buffer object. Serialized with
    /// map/unmap on the same mutex.
    pub fn bind_buffer(&self, ctx: &DeviceContext, offset: u64,
                       buffer: ResourceHandle) -> Result<(), AllocError> {
        let _state = self.mapping.lock();
        ctx.device.bind_buffer(self.memory, offset, buffer)
    }

    /// Binds a region of this block to an image object.
    pub fn bind_image(&self, ctx: &DeviceContext, offset: u64,
                      image: ResourceHandle) -> Result<(), AllocError> {
        let _state = self.mapping.lock();
        ctx.device.bind_image(self.memory, offset, image)
    }

    /// Releases the native memory. The owning vector calls this after its
    /// metadata says the block is entirely free.
    pub fn destroy(&self, ctx: &DeviceContext) {
        debug_assert_eq!(self.mapping.lock().ref_count, 0,
                         "destroying a block that is still mapped");
        ctx.free(self.memory_type_index, self.memory, self.size);
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
