//! Copy dispatch
//!
//! Raw buffer-to-buffer copies in the three directions. A zero-byte request
//! returns immediately without touching either buffer or the backend. With
//! the accelerator disabled, "device" memory is host memory and every
//! direction degrades to a plain in-process copy.

use tracing::trace;

use super::MemoryManager;
use crate::addr::{DeviceAddr, HostAddr};
use crate::device::{CopyMode, DeviceBackend, DeviceResult};
use crate::error::MirrorResult;

/// Copy `bytes` from `src` to `dst` inside this process
///
/// # Safety
/// Both ranges must be valid for `bytes` bytes. Overlap is allowed.
#[inline]
unsafe fn host_copy(dst: usize, src: usize, bytes: usize) {
    unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
}

impl<B: DeviceBackend> MemoryManager<B> {
    /// Copy `bytes` from host memory at `src` to device memory at `dst`
    ///
    /// # Safety
    /// `src` must be valid for reads and `dst` for writes of `bytes` bytes.
    pub unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddr,
        src: HostAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> MirrorResult<DeviceAddr> {
        if bytes == 0 {
            return Ok(dst);
        }
        if !self.config.accelerator {
            unsafe { host_copy(dst.raw(), src.raw(), bytes) };
            return Ok(dst);
        }
        let result = unsafe { self.backend.copy_host_to_device(dst, src.as_ptr(), bytes, mode) };
        self.finish(result, dst)
    }

    /// Copy `bytes` from device memory at `src` to host memory at `dst`
    ///
    /// # Safety
    /// `src` must be valid for reads and `dst` for writes of `bytes` bytes.
    pub unsafe fn copy_device_to_host(
        &mut self,
        dst: HostAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> MirrorResult<HostAddr> {
        if bytes == 0 {
            return Ok(dst);
        }
        if !self.config.accelerator {
            unsafe { host_copy(dst.raw(), src.raw(), bytes) };
            return Ok(dst);
        }
        let result = unsafe { self.backend.copy_device_to_host(dst.as_mut_ptr(), src, bytes, mode) };
        self.finish(result, dst)
    }

    /// Copy `bytes` between two device ranges
    ///
    /// # Safety
    /// `src` must be valid for reads and `dst` for writes of `bytes` bytes.
    pub unsafe fn copy_device_to_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> MirrorResult<DeviceAddr> {
        if bytes == 0 {
            return Ok(dst);
        }
        if !self.config.accelerator {
            unsafe { host_copy(dst.raw(), src.raw(), bytes) };
            return Ok(dst);
        }
        let result = unsafe { self.backend.copy_device_to_device(dst, src, bytes, mode) };
        self.finish(result, dst)
    }

    /// Synchronous device to device copy
    ///
    /// # Safety
    /// Same contract as [`copy_device_to_device`](Self::copy_device_to_device).
    pub unsafe fn copy(&mut self, dst: DeviceAddr, src: DeviceAddr, bytes: usize) -> MirrorResult<DeviceAddr> {
        unsafe { self.copy_device_to_device(dst, src, bytes, CopyMode::Sync) }
    }

    fn finish<T: Copy + std::fmt::Debug>(&self, result: DeviceResult<()>, dst: T) -> MirrorResult<T> {
        match result {
            Ok(()) => {
                trace!("Copy to {:?} dispatched to {}", dst, self.backend.name());
                Ok(dst)
            }
            Err(err) => self.fail(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::{DeviceAddr, HostAddr};
    use crate::config::MirrorConfig;
    use crate::device::{CopyMode, DeviceBackend, HostDevice};
    use crate::error::MirrorError;
    use crate::manager::MemoryManager;

    #[test]
    fn test_zero_bytes_untouched() {
        let mut mm = MemoryManager::new(MirrorConfig::accelerated());
        let src = [0xaau8; 8];
        let mut dst = [0x55u8; 8];
        let d = DeviceAddr::new(dst.as_mut_ptr() as usize);
        let s = HostAddr::of_slice(&src);

        unsafe {
            assert_eq!(mm.copy_host_to_device(d, s, 0, CopyMode::Sync).unwrap(), d);
            mm.copy_device_to_host(HostAddr::new(d.raw()), DeviceAddr::new(s.raw()), 0, CopyMode::Async)
                .unwrap();
            mm.copy(d, DeviceAddr::new(s.raw()), 0).unwrap();
        }
        assert_eq!(dst, [0x55; 8]);
        assert_eq!(src, [0xaa; 8]);
        assert_eq!(mm.backend().stats().total_copies(), 0);
    }

    #[test]
    fn test_host_mode_plain_copy_all_directions() {
        let mut mm = MemoryManager::with_backend(MirrorConfig::default(), HostDevice::unavailable());
        let src: Vec<u8> = (0..32).collect();
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        let mut c = vec![0u8; 32];

        unsafe {
            mm.copy_host_to_device(DeviceAddr::new(a.as_mut_ptr() as usize), HostAddr::of_slice(&src), 32, CopyMode::Async)
                .unwrap();
            mm.copy_device_to_device(
                DeviceAddr::new(b.as_mut_ptr() as usize),
                DeviceAddr::new(a.as_ptr() as usize),
                32,
                CopyMode::Sync,
            )
            .unwrap();
            mm.copy_device_to_host(HostAddr::from_ptr(c.as_mut_ptr()), DeviceAddr::new(b.as_ptr() as usize), 32, CopyMode::Sync)
                .unwrap();
        }
        assert_eq!(a, src);
        assert_eq!(b, src);
        assert_eq!(c, src);
    }

    #[test]
    fn test_accelerated_copies_use_backend() {
        let mut mm = MemoryManager::new(MirrorConfig::accelerated());
        let dev_a = mm.backend_mut().allocate(16).unwrap();
        let dev_b = mm.backend_mut().allocate(16).unwrap();
        let src = [3u8; 16];
        let mut out = [0u8; 16];

        unsafe {
            mm.copy_host_to_device(dev_a, HostAddr::of_slice(&src), 16, CopyMode::Async).unwrap();
            mm.copy(dev_b, dev_a, 16).unwrap();
            mm.copy_device_to_host(HostAddr::from_ptr(out.as_mut_ptr()), dev_b, 16, CopyMode::Sync)
                .unwrap();
        }
        assert_eq!(out, src);

        let stats = mm.backend().stats();
        assert_eq!(stats.host_to_device, 1);
        assert_eq!(stats.device_to_device, 1);
        assert_eq!(stats.device_to_host, 1);
    }

    #[test]
    fn test_backend_error_surfaces() {
        let mut mm = MemoryManager::new(MirrorConfig::accelerated());
        let src = [0u8; 4];
        // Not a device allocation
        let err = unsafe { mm.copy_host_to_device(DeviceAddr::new(0x1000), HostAddr::of_slice(&src), 4, CopyMode::Sync) }
            .unwrap_err();
        assert!(matches!(err, MirrorError::Device(_)));
    }
}
