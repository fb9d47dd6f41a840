//! Aligned scratch buffers and staged transfers.
//!
//! The service rejects bulk data segments that are not 0x40-aligned. When a
//! caller hands us an arbitrary slice, the transfer is staged through an
//! [`AlignedBuffer`] and copied in or out around the request.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::status::{FsaStatus, ShimError, ShimResult};
use crate::SHIM_ALIGNMENT;

/// Round `n` up to the next multiple of `align` (a power of two).
pub fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Whether `addr` satisfies the service's alignment rule.
pub fn is_aligned(addr: usize) -> bool {
    addr % SHIM_ALIGNMENT == 0
}

/// Zero-filled heap buffer aligned to [`SHIM_ALIGNMENT`], with its capacity
/// rounded up to a multiple of the alignment.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` usable bytes. Returns `None` when the allocator fails.
    pub fn new(len: usize) -> Option<Self> {
        let size = round_up(len.max(1), SHIM_ALIGNMENT);
        let layout = Layout::from_size_align(size, SHIM_ALIGNMENT).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)?;
        Some(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated size, always a multiple of the alignment.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for capacity() >= len initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn stage(len: usize, operation: &'static str) -> ShimResult<AlignedBuffer> {
    tracing::warn!(
        operation,
        len,
        "caller buffer is not 0x40-aligned, staging through a bounce buffer"
    );
    AlignedBuffer::new(len).ok_or(ShimError::Status(FsaStatus::InvalidAlignment))
}

/// A read destination the service can fill directly.
///
/// Wraps the caller's slice, or an aligned copy of it when the slice is
/// misaligned. Call [`StagedRead::finish`] to copy staged data back.
pub struct StagedRead<'a> {
    caller: &'a mut [u8],
    scratch: Option<AlignedBuffer>,
}

impl<'a> StagedRead<'a> {
    pub fn new(caller: &'a mut [u8], operation: &'static str) -> ShimResult<Self> {
        let scratch = if !caller.is_empty() && !is_aligned(caller.as_ptr() as usize) {
            Some(stage(caller.len(), operation)?)
        } else {
            None
        };
        Ok(Self { caller, scratch })
    }

    /// Whether a bounce buffer is in use.
    pub fn staged(&self) -> bool {
        self.scratch.is_some()
    }

    /// The aligned destination to hand to the service.
    pub fn target(&mut self) -> &mut [u8] {
        match self.scratch.as_mut() {
            Some(buf) => buf.as_mut_slice(),
            None => self.caller,
        }
    }

    /// Copy staged bytes back into the caller's slice.
    pub fn finish(self) {
        if let Some(buf) = self.scratch {
            self.caller.copy_from_slice(buf.as_slice());
        }
    }
}

/// A write source the service can consume directly.
pub struct StagedWrite<'a> {
    caller: &'a [u8],
    scratch: Option<AlignedBuffer>,
}

impl<'a> StagedWrite<'a> {
    pub fn new(caller: &'a [u8], operation: &'static str) -> ShimResult<Self> {
        let scratch = if !caller.is_empty() && !is_aligned(caller.as_ptr() as usize) {
            let mut buf = stage(caller.len(), operation)?;
            buf.as_mut_slice().copy_from_slice(caller);
            Some(buf)
        } else {
            None
        };
        Ok(Self { caller, scratch })
    }

    pub fn staged(&self) -> bool {
        self.scratch.is_some()
    }

    pub fn source(&self) -> &[u8] {
        match self.scratch.as_ref() {
            Some(buf) => buf.as_slice(),
            None => self.caller,
        }
    }
}
