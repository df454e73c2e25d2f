//! Host-simulated device
//!
//! Device allocations come from a private aligned heap, distinct from the
//! caller's buffers, so mirrored data really lives in a second copy. Copies
//! complete before returning; asynchronous requests are only counted.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::{CopyMode, DeviceBackend, DeviceError, DeviceResult, DeviceStats, Direction};
use crate::addr::DeviceAddr;

/// Default device allocation alignment (bytes)
pub const DEFAULT_ALIGNMENT: usize = 256;

/// Device memory simulated in a separate host heap
pub struct HostDevice {
    /// Live allocations: start address -> layout
    allocations: BTreeMap<usize, Layout>,
    alignment: usize,
    available: bool,
    stats: DeviceStats,
}

impl HostDevice {
    /// Create an available device with the default alignment
    pub fn new() -> Self {
        Self::with_alignment(DEFAULT_ALIGNMENT)
    }

    /// Create an available device with a custom allocation alignment
    ///
    /// Non power-of-two alignments fall back to the default.
    pub fn with_alignment(alignment: usize) -> Self {
        let alignment = if alignment.is_power_of_two() { alignment } else { DEFAULT_ALIGNMENT };
        Self {
            allocations: BTreeMap::new(),
            alignment,
            available: true,
            stats: DeviceStats::default(),
        }
    }

    /// Create a backend that reports no accelerator runtime
    pub fn unavailable() -> Self {
        let mut dev = Self::new();
        dev.available = false;
        dev
    }

    /// Allocation alignment in bytes
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    fn ensure_available(&self) -> DeviceResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(DeviceError::Unavailable("host device created without accelerator support".into()))
        }
    }

    /// Check that `[addr, addr + bytes)` lies inside one live allocation
    fn check_range(&self, addr: DeviceAddr, bytes: usize) -> DeviceResult<()> {
        let invalid = || DeviceError::InvalidAddress { addr, bytes };
        let (&start, layout) = self.allocations.range(..=addr.raw()).next_back().ok_or_else(invalid)?;
        let offset = addr.raw() - start;
        if offset.checked_add(bytes).is_some_and(|end| end <= layout.size()) {
            Ok(())
        } else {
            Err(invalid())
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn allocate(&mut self, bytes: usize) -> DeviceResult<DeviceAddr> {
        self.ensure_available()?;
        if bytes == 0 {
            return Err(DeviceError::Allocation {
                bytes,
                message: "zero-sized allocation".into(),
            });
        }
        let layout = Layout::from_size_align(bytes, self.alignment).map_err(|e| DeviceError::Allocation {
            bytes,
            message: e.to_string(),
        })?;

        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DeviceError::Allocation {
                bytes,
                message: "host heap exhausted".into(),
            });
        }

        self.allocations.insert(ptr as usize, layout);
        self.stats.record_alloc(bytes);
        debug!("Allocated {} device bytes at {:#x}", bytes, ptr as usize);
        Ok(DeviceAddr::new(ptr as usize))
    }

    fn free(&mut self, addr: DeviceAddr) -> DeviceResult<()> {
        let layout = self
            .allocations
            .remove(&addr.raw())
            .ok_or(DeviceError::InvalidAddress { addr, bytes: 0 })?;

        // SAFETY: the pointer and layout came from alloc_zeroed in allocate
        unsafe { dealloc(addr.as_mut_ptr::<u8>(), layout) };
        self.stats.record_free(layout.size());
        debug!("Freed {} device bytes at {}", layout.size(), addr);
        Ok(())
    }

    unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        self.ensure_available()?;
        self.check_range(dst, bytes)?;
        // SAFETY: dst checked above, src guaranteed by the caller
        unsafe { std::ptr::copy(src, dst.as_mut_ptr::<u8>(), bytes) };
        self.stats.record_copy(Direction::HostToDevice, bytes, mode);
        trace!("H2D {} bytes -> {} ({:?})", bytes, dst, mode);
        Ok(())
    }

    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        self.ensure_available()?;
        self.check_range(src, bytes)?;
        // SAFETY: src checked above, dst guaranteed by the caller
        unsafe { std::ptr::copy(src.as_ptr::<u8>(), dst, bytes) };
        self.stats.record_copy(Direction::DeviceToHost, bytes, mode);
        trace!("D2H {} bytes <- {} ({:?})", bytes, src, mode);
        Ok(())
    }

    unsafe fn copy_device_to_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        self.ensure_available()?;
        self.check_range(dst, bytes)?;
        self.check_range(src, bytes)?;
        // SAFETY: both ranges lie inside live allocations
        unsafe { std::ptr::copy(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), bytes) };
        self.stats.record_copy(Direction::DeviceToDevice, bytes, mode);
        trace!("D2D {} bytes {} -> {} ({:?})", bytes, src, dst, mode);
        Ok(())
    }

    fn synchronize(&mut self) -> DeviceResult<()> {
        self.ensure_available()
    }

    fn stats(&self) -> DeviceStats {
        self.stats.clone()
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        for (start, layout) in std::mem::take(&mut self.allocations) {
            // SAFETY: every entry was produced by alloc_zeroed with this layout
            unsafe { dealloc(start as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_aligned_and_zeroed() {
        let mut dev = HostDevice::new();
        let addr = dev.allocate(1000).unwrap();
        assert_eq!(addr.raw() % DEFAULT_ALIGNMENT, 0);

        let mut out = vec![0xffu8; 1000];
        unsafe { dev.copy_device_to_host(out.as_mut_ptr(), addr, 1000, CopyMode::Sync).unwrap() };
        assert!(out.iter().all(|&b| b == 0));
        dev.free(addr).unwrap();
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn test_roundtrip_through_device() {
        let mut dev = HostDevice::new();
        let a = dev.allocate(64).unwrap();
        let b = dev.allocate(64).unwrap();
        let data: Vec<u8> = (0..64).collect();

        unsafe {
            dev.copy_host_to_device(a, data.as_ptr(), 64, CopyMode::Async).unwrap();
            dev.copy_device_to_device(b, a, 64, CopyMode::Sync).unwrap();
        }
        let mut out = vec![0u8; 64];
        unsafe { dev.copy_device_to_host(out.as_mut_ptr(), b, 64, CopyMode::Sync).unwrap() };
        assert_eq!(out, data);

        let stats = dev.stats();
        assert_eq!(stats.host_to_device, 1);
        assert_eq!(stats.device_to_device, 1);
        assert_eq!(stats.device_to_host, 1);
        assert_eq!(stats.async_copies, 1);
    }

    #[test]
    fn test_out_of_range_copy_rejected() {
        let mut dev = HostDevice::new();
        let a = dev.allocate(16).unwrap();
        let data = [0u8; 32];
        let err = unsafe { dev.copy_host_to_device(a, data.as_ptr(), 32, CopyMode::Sync) }.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidAddress { bytes: 32, .. }));

        // Interior ranges are fine
        unsafe { dev.copy_host_to_device(a.add(8), data.as_ptr(), 8, CopyMode::Sync).unwrap() };
    }

    #[test]
    fn test_double_free_rejected() {
        let mut dev = HostDevice::new();
        let a = dev.allocate(8).unwrap();
        dev.free(a).unwrap();
        assert!(dev.free(a).is_err());
        assert_eq!(dev.stats().frees, 1);
    }

    #[test]
    fn test_unavailable_backend() {
        let mut dev = HostDevice::unavailable();
        assert!(!dev.is_available());
        assert!(matches!(dev.allocate(8), Err(DeviceError::Unavailable(_))));
        assert!(dev.synchronize().is_err());
    }

    #[test]
    fn test_zero_sized_allocation_rejected() {
        let mut dev = HostDevice::new();
        assert!(matches!(dev.allocate(0), Err(DeviceError::Allocation { bytes: 0, .. })));
    }

    #[test]
    fn test_bad_alignment_falls_back() {
        assert_eq!(HostDevice::with_alignment(100).alignment(), DEFAULT_ALIGNMENT);
        assert_eq!(HostDevice::with_alignment(64).alignment(), 64);
    }
}
