//! Error types returned by every fallible operation in the crate.
//!
//! Failures are values all the way up: metadata search reports "no fit" to
//! its block vector, the vector reports a typed error to the allocator, and
//! the allocator returns it to the host. Nothing in the crate panics on an
//! allocation failure; the self-check assertions in debug builds are the
//! only exception.

use std::error;
use std::fmt;

/// Error produced by allocation, mapping and binding operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No memory type satisfies the requested property flags. The request
    /// asked for a kind of memory this device does not have, which is a
    /// different situation from the device being full.
    FeatureNotPresent,
    /// No block, growth or eviction path could satisfy the request, or a
    /// heap ceiling was reached.
    OutOfDeviceMemory,
    /// The host ran out of memory servicing a native call.
    OutOfHostMemory,
    /// The caller combined mutually exclusive options, e.g. a dedicated
    /// allocation that is also forbidden from allocating, or routed a
    /// dedicated request into a pool. Asserted in debug builds.
    InvalidUsage,
    /// The bounded eviction-retry loop lost its race too many times.
    /// Transient; the caller may legitimately retry.
    TooManyContendingThreads,
    /// The native map call failed.
    MapFailed,
    /// Mapping was refused outright: the allocation can become lost, or
    /// already is. Never forwarded to the native API.
    MapNotAllowed,
}

impl fmt::Display for AllocError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let msg = match *self {
            AllocError::FeatureNotPresent => {
                "no memory type satisfies the requested property flags"
            },
            AllocError::OutOfDeviceMemory => {
                "out of device memory"
            },
            AllocError::OutOfHostMemory => {
                "out of host memory"
            },
            AllocError::InvalidUsage => {
                "invalid combination of allocation options"
            },
            AllocError::TooManyContendingThreads => {
                "eviction retries exhausted by contending threads"
            },
            AllocError::MapFailed => {
                "the native map call failed"
            },
            AllocError::MapNotAllowed => {
                "mapping is not allowed for allocations that can become lost"
            },
        };
        write!(fmt, "{}", msg)
    }
}

impl error::Error for AllocError {}
