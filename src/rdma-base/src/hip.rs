//! Device memory through the HIP runtime.
use std::ffi::c_void;
use std::io;
use std::ptr::{self, NonNull};

use crate::mr::{BufferAllocator, Placement};

type HipError = i32;

const HIP_SUCCESS: HipError = 0;
const HIP_MEMCPY_HOST_TO_DEVICE: i32 = 1;
const HIP_MEMCPY_DEVICE_TO_HOST: i32 = 2;

extern "C" {
    fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> HipError;
    fn hipFree(ptr: *mut c_void) -> HipError;
    fn hipMemcpy(dst: *mut c_void, src: *const c_void, size: usize, kind: i32) -> HipError;
    fn hipDeviceSynchronize() -> HipError;
}

fn check(op: &'static str, rc: HipError) -> io::Result<()> {
    if rc == HIP_SUCCESS {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} failed with hipError {}", op, rc),
        ))
    }
}

/// Allocates buffers with `hipMalloc`. Copies are synchronous and the device is synchronized
/// after each one, so a copy is complete before the next post.
#[derive(Debug, Default, Clone, Copy)]
pub struct HipAllocator;

impl HipAllocator {
    pub fn new() -> Self {
        HipAllocator
    }

    /// Waits for all work queued on the current device.
    pub fn synchronize(&self) -> io::Result<()> {
        check("hipDeviceSynchronize", unsafe { hipDeviceSynchronize() })
    }
}

impl BufferAllocator for HipAllocator {
    fn placement(&self) -> Placement {
        Placement::Device
    }

    fn allocate(&self, len: usize) -> io::Result<NonNull<u8>> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-sized buffer"));
        }
        let mut ptr: *mut c_void = ptr::null_mut();
        check("hipMalloc", unsafe { hipMalloc(&mut ptr, len) })?;
        log::debug!("hipMalloc {} bytes at {:p}", len, ptr);
        NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        check("hipFree", hipFree(ptr.as_ptr().cast()))
    }

    unsafe fn copy_to_host(&self, dst: &mut [u8], src: *const u8) -> io::Result<()> {
        check(
            "hipMemcpy",
            hipMemcpy(
                dst.as_mut_ptr().cast(),
                src.cast(),
                dst.len(),
                HIP_MEMCPY_DEVICE_TO_HOST,
            ),
        )?;
        self.synchronize()
    }

    unsafe fn copy_from_host(&self, dst: *mut u8, src: &[u8]) -> io::Result<()> {
        check(
            "hipMemcpy",
            hipMemcpy(
                dst.cast(),
                src.as_ptr().cast(),
                src.len(),
                HIP_MEMCPY_HOST_TO_DEVICE,
            ),
        )?;
        self.synchronize()
    }
}
