//! Transfer buffers and their registration.
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::types::{AccessFlags, MemoryKeys};

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Host,
    Device,
}

impl Placement {
    /// Registration permissions for a buffer in this placement.
    ///
    /// Host buffers are only ever local receive targets. Device buffers may also be written
    /// by the peer.
    #[inline]
    pub fn access(&self) -> AccessFlags {
        match self {
            Placement::Host => AccessFlags::LOCAL_WRITE,
            Placement::Device => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        }
    }
}

/// Produces and releases the memory backing a [`Buffer`].
///
/// Pointers handed out by `allocate` are not necessarily addressable by the CPU; all host
/// access goes through `copy_to_host` and `copy_from_host`.
pub trait BufferAllocator: Send + Sync {
    fn placement(&self) -> Placement;

    fn allocate(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` and `len` must come from a prior `allocate` on this allocator.
    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// # Safety
    ///
    /// `src` must be valid for `dst.len()` bytes.
    unsafe fn copy_to_host(&self, dst: &mut [u8], src: *const u8) -> io::Result<()>;

    /// # Safety
    ///
    /// `dst` must be valid for `src.len()` bytes.
    unsafe fn copy_from_host(&self, dst: *mut u8, src: &[u8]) -> io::Result<()>;
}

/// Page-aligned anonymous host memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl BufferAllocator for HostAllocator {
    fn placement(&self) -> Placement {
        Placement::Host
    }

    fn allocate(&self, len: usize) -> io::Result<NonNull<u8>> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-sized buffer"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        log::trace!("mapped {} bytes of host memory at {:p}", len, ptr);
        NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        munmap(ptr.as_ptr().cast(), len)?;
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: &mut [u8], src: *const u8) -> io::Result<()> {
        std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    unsafe fn copy_from_host(&self, dst: *mut u8, src: &[u8]) -> io::Result<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        Ok(())
    }
}

/// The single transfer buffer of a connection. Released through its allocator on drop.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    allocator: Arc<dyn BufferAllocator>,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("placement", &self.placement())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.allocator.free(self.ptr, self.len) } {
            log::warn!("failed to free {:?} buffer: {}", self.placement(), e);
        }
    }
}

impl Buffer {
    pub fn new(allocator: Arc<dyn BufferAllocator>, len: usize) -> io::Result<Self> {
        let ptr = allocator.allocate(len)?;
        Ok(Buffer {
            ptr,
            len,
            allocator,
        })
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.allocator.placement()
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} exceeds buffer of {} bytes",
                    offset, len, self.len
                ),
            )),
        }
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            self.allocator
                .copy_from_host(self.ptr.as_ptr().add(offset), data)
        }
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the buffer.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, dst.len())?;
        unsafe { self.allocator.copy_to_host(dst, self.ptr.as_ptr().add(offset)) }
    }

    /// Direct view of a host-resident buffer. `None` for device memory.
    pub fn as_host_slice(&self) -> Option<&[u8]> {
        match self.placement() {
            Placement::Host => Some(unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }),
            Placement::Device => None,
        }
    }
}

impl<F: Fabric> Connection<F> {
    /// Allocates a host buffer of `size` bytes and registers it for local writes.
    pub fn register_memory(&mut self, size: usize) -> Result<MemoryKeys> {
        self.register_with(Arc::new(HostAllocator), size)
    }

    /// Allocates a device buffer through the HIP runtime and registers it for local and
    /// remote writes.
    #[cfg(feature = "hip")]
    pub fn register_device_memory(&mut self, size: usize) -> Result<MemoryKeys> {
        self.register_with(Arc::new(crate::hip::HipAllocator::new()), size)
    }

    /// Allocates `size` bytes from `allocator` and binds them to the protection domain.
    ///
    /// The access flags follow the allocator's placement. A connection carries at most one
    /// registration.
    pub fn register_with(
        &mut self,
        allocator: Arc<dyn BufferAllocator>,
        size: usize,
    ) -> Result<MemoryKeys> {
        if self.mr.is_some() || self.buffer.is_some() {
            return Err(Error::AlreadyRegistered);
        }
        let pd = self.pd.as_ref().ok_or(Error::InvalidState {
            op: "register memory",
            state: self.state,
        })?;

        let placement = allocator.placement();
        let access = placement.access();
        let buffer = Buffer::new(allocator, size).map_err(Error::Registration)?;
        // Stored first so a failed registration still releases the allocation on teardown.
        let buffer = self.buffer.insert(buffer);
        let mr = unsafe {
            self.fabric
                .reg_mr(pd, buffer.as_mut_ptr(), buffer.len(), access)
                .map_err(Error::Registration)?
        };
        let keys = self.fabric.mr_keys(&mr);
        self.mr = Some(mr);
        log::debug!(
            "registered {} bytes of {:?} memory, access {:?}, lkey {:#x}, rkey {:#x}",
            size,
            placement,
            access,
            keys.lkey,
            keys.rkey
        );
        Ok(keys)
    }

    /// Keys of the registered buffer.
    pub fn memory_keys(&self) -> Option<MemoryKeys> {
        self.mr.as_ref().map(|mr| self.fabric.mr_keys(mr))
    }

    #[inline]
    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Copies `data` to the start of the registered buffer.
    pub fn write_buffer(&mut self, data: &[u8]) -> Result<()> {
        let state = self.state;
        let buffer = self.buffer.as_mut().ok_or(Error::InvalidState {
            op: "write buffer",
            state,
        })?;
        buffer.write_at(0, data)?;
        Ok(())
    }

    /// Copies the first `len` bytes of the registered buffer out.
    pub fn read_buffer(&self, len: usize) -> Result<Vec<u8>> {
        let buffer = self.buffer.as_ref().ok_or(Error::InvalidState {
            op: "read buffer",
            state: self.state,
        })?;
        let mut out = vec![0u8; len];
        buffer.read_at(0, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffer_roundtrip() {
        let mut buf = Buffer::new(Arc::new(HostAllocator), 4096).unwrap();
        assert_eq!(buf.placement(), Placement::Host);
        assert_eq!(buf.as_mut_ptr() as usize % 4096, 0);
        buf.write_at(10, b"ping").unwrap();
        let mut out = [0u8; 4];
        buf.read_at(10, &mut out).unwrap();
        assert_eq!(&out, b"ping");
        assert_eq!(&buf.as_host_slice().unwrap()[10..14], b"ping");
    }

    #[test]
    fn out_of_range_access() {
        let mut buf = Buffer::new(Arc::new(HostAllocator), 16).unwrap();
        assert!(buf.write_at(14, b"ping").is_err());
        let mut out = [0u8; 4];
        assert!(buf.read_at(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn zero_sized_allocation() {
        assert!(Buffer::new(Arc::new(HostAllocator), 0).is_err());
    }

    #[test]
    fn placement_access() {
        assert_eq!(Placement::Host.access(), AccessFlags::LOCAL_WRITE);
        assert!(Placement::Device
            .access()
            .contains(AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE));
        assert!(!Placement::Host.access().contains(AccessFlags::REMOTE_WRITE));
    }
}
