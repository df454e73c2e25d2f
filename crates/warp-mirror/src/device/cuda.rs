//! CUDA device backend
//!
//! Raw driver allocations and copies through cudarc 0.18. Asynchronous copies
//! are queued on the configured stream; synchronous copies and
//! [`synchronize`](DeviceBackend::synchronize) act as barriers.

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaStream, DriverError, result as cuda_result, sys::CUdeviceptr};
use tracing::{debug, info, trace};

use super::{CopyMode, DeviceBackend, DeviceError, DeviceResult, DeviceStats, Direction};
use crate::addr::DeviceAddr;
use crate::config::StreamKind;

/// NVIDIA GPU backend
pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    device_id: usize,
    name: String,
    /// Live allocations: device pointer -> size
    allocations: HashMap<CUdeviceptr, usize>,
    stats: DeviceStats,
}

impl CudaDevice {
    /// Open device `device_id` and select the copy stream
    pub fn new(device_id: usize, stream: StreamKind) -> DeviceResult<Self> {
        debug!("Initializing CUDA device {}", device_id);

        let ctx = CudaContext::new(device_id).map_err(|e| DeviceError::Init {
            device_id,
            message: format!("{:?}", e),
        })?;
        let name = ctx.name().map_err(|e| DeviceError::Init {
            device_id,
            message: format!("{:?}", e),
        })?;
        let stream = match stream {
            StreamKind::Default => ctx.default_stream(),
            StreamKind::Dedicated => ctx.new_stream().map_err(|e| DeviceError::Init {
                device_id,
                message: format!("{:?}", e),
            })?,
        };

        info!("CUDA device {} initialized: {}", device_id, name);

        Ok(Self {
            ctx,
            stream,
            device_id,
            name,
            allocations: HashMap::new(),
            stats: DeviceStats::default(),
        })
    }

    /// Check if a CUDA device can be opened
    pub fn is_present() -> bool {
        CudaContext::new(0).is_ok()
    }

    /// Device ordinal
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    fn bind(&self) -> DeviceResult<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| DeviceError::Init {
                device_id: self.device_id,
                message: format!("{:?}", e),
            })
    }

    fn copy_error(direction: Direction, err: DriverError) -> DeviceError {
        DeviceError::Copy(format!("{}: {}", direction, format!("{:?}", err)))
    }
}

impl DeviceBackend for CudaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        true
    }

    fn allocate(&mut self, bytes: usize) -> DeviceResult<DeviceAddr> {
        self.bind()?;
        // SAFETY: context bound to this thread; size checked by the driver
        let ptr = unsafe { cuda_result::malloc_sync(bytes) }.map_err(|e| DeviceError::Allocation {
            bytes,
            message: format!("{:?}", e),
        })?;
        self.allocations.insert(ptr, bytes);
        self.stats.record_alloc(bytes);
        debug!("cuMemAlloc {} bytes at {:#x}", bytes, ptr);
        Ok(DeviceAddr::new(ptr as usize))
    }

    fn free(&mut self, addr: DeviceAddr) -> DeviceResult<()> {
        let ptr = addr.raw() as CUdeviceptr;
        let bytes = self
            .allocations
            .remove(&ptr)
            .ok_or(DeviceError::InvalidAddress { addr, bytes: 0 })?;
        self.bind()?;
        // Pending async copies may still target this allocation
        self.stream
            .synchronize()
            .map_err(|e| DeviceError::Synchronization(format!("{:?}", e)))?;
        // SAFETY: ptr came from malloc_sync and is released once
        unsafe { cuda_result::free_sync(ptr) }.map_err(|e| DeviceError::Allocation {
            bytes,
            message: format!("{:?}", e),
        })?;
        self.stats.record_free(bytes);
        Ok(())
    }

    unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        self.bind()?;
        // SAFETY: caller guarantees src is valid for bytes
        let src = unsafe { std::slice::from_raw_parts(src, bytes) };
        let dst_ptr = dst.raw() as CUdeviceptr;
        let result = match mode {
            CopyMode::Async => unsafe { cuda_result::memcpy_htod_async(dst_ptr, src, self.stream.cu_stream()) },
            CopyMode::Sync => unsafe { cuda_result::memcpy_htod_sync(dst_ptr, src) },
        };
        result.map_err(|e| Self::copy_error(Direction::HostToDevice, e))?;
        self.stats.record_copy(Direction::HostToDevice, bytes, mode);
        trace!("cuMemcpyHtoD {} bytes -> {} ({:?})", bytes, dst, mode);
        Ok(())
    }

    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        self.bind()?;
        // SAFETY: caller guarantees dst is valid for bytes
        let dst = unsafe { std::slice::from_raw_parts_mut(dst, bytes) };
        let src_ptr = src.raw() as CUdeviceptr;
        let result = match mode {
            CopyMode::Async => unsafe { cuda_result::memcpy_dtoh_async(dst, src_ptr, self.stream.cu_stream()) },
            CopyMode::Sync => unsafe { cuda_result::memcpy_dtoh_sync(dst, src_ptr) },
        };
        result.map_err(|e| Self::copy_error(Direction::DeviceToHost, e))?;
        self.stats.record_copy(Direction::DeviceToHost, bytes, mode);
        trace!("cuMemcpyDtoH {} bytes <- {} ({:?})", bytes, src, mode);
        Ok(())
    }

    unsafe fn copy_device_to_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        self.bind()?;
        let dst_ptr = dst.raw() as CUdeviceptr;
        let src_ptr = src.raw() as CUdeviceptr;
        let result = match mode {
            CopyMode::Async => unsafe {
                cuda_result::memcpy_dtod_async(dst_ptr, src_ptr, bytes, self.stream.cu_stream())
            },
            CopyMode::Sync => unsafe { cuda_result::memcpy_dtod_sync(dst_ptr, src_ptr, bytes) },
        };
        result.map_err(|e| Self::copy_error(Direction::DeviceToDevice, e))?;
        self.stats.record_copy(Direction::DeviceToDevice, bytes, mode);
        trace!("cuMemcpyDtoD {} bytes {} -> {} ({:?})", bytes, src, dst, mode);
        Ok(())
    }

    fn synchronize(&mut self) -> DeviceResult<()> {
        self.stream
            .synchronize()
            .map_err(|e| DeviceError::Synchronization(format!("{:?}", e)))
    }

    fn stats(&self) -> DeviceStats {
        self.stats.clone()
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        if self.allocations.is_empty() {
            return;
        }
        let _ = self.stream.synchronize();
        for (ptr, _) in self.allocations.drain() {
            // SAFETY: remaining pointers came from malloc_sync
            let _ = unsafe { cuda_result::free_sync(ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_roundtrip() {
        let mut dev = match CudaDevice::new(0, StreamKind::Default) {
            Ok(dev) => dev,
            Err(_) => {
                println!("No CUDA device available, skipping test");
                return;
            }
        };

        let data: Vec<u8> = (0..=255).collect();
        let addr = dev.allocate(data.len()).unwrap();
        let mut out = vec![0u8; data.len()];
        unsafe {
            dev.copy_host_to_device(addr, data.as_ptr(), data.len(), CopyMode::Async).unwrap();
            dev.copy_device_to_host(out.as_mut_ptr(), addr, data.len(), CopyMode::Sync).unwrap();
        }
        assert_eq!(out, data);
        dev.free(addr).unwrap();
    }
}
