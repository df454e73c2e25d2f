//! Device backend abstraction
//!
//! The memory manager treats the accelerator as an opaque native service
//! offering allocation, three directional copies and a stream barrier. Each
//! backend implements [`DeviceBackend`]:
//!
//! - [`HostDevice`]: device memory simulated by a separate aligned host heap.
//!   Always compiled; used when no accelerator is present and by the tests.
//! - `CudaDevice`: NVIDIA GPUs through the cudarc driver API (`cuda` feature).

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::HostDevice;

#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;

use tracing::warn;

use crate::addr::DeviceAddr;
use crate::config::{BackendKind, MirrorConfig};

/// Result type for backend operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Device backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No accelerator runtime behind this backend
    #[error("Accelerator unavailable: {0}")]
    Unavailable(String),

    /// Device initialization failed
    #[error("Failed to initialize device {device_id}: {message}")]
    Init {
        /// Device ordinal
        device_id: usize,
        /// Error message
        message: String,
    },

    /// Allocation failed
    #[error("Device allocation of {bytes} bytes failed: {message}")]
    Allocation {
        /// Requested size
        bytes: usize,
        /// Error message
        message: String,
    },

    /// Address does not belong to a live device allocation
    #[error("Invalid device range {addr} (+{bytes} bytes)")]
    InvalidAddress {
        /// Start of the range
        addr: DeviceAddr,
        /// Length of the range
        bytes: usize,
    },

    /// Copy primitive failed
    #[error("Device copy failed: {0}")]
    Copy(String),

    /// Stream synchronization failed
    #[error("Stream synchronization failed: {0}")]
    Synchronization(String),
}

/// Whether a copy blocks the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Return after the copy has completed
    #[default]
    Sync,
    /// Queue the copy on the configured stream
    Async,
}

impl CopyMode {
    /// Build from an `asynchronous` flag
    pub const fn from_async(asynchronous: bool) -> Self {
        if asynchronous { Self::Async } else { Self::Sync }
    }

    /// Check for asynchronous mode
    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Async)
    }
}

/// Counters kept by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Allocations performed
    pub allocations: u64,
    /// Allocations released
    pub frees: u64,
    /// Bytes currently allocated
    pub live_bytes: usize,
    /// High-water mark of allocated bytes
    pub peak_bytes: usize,
    /// Host to device copies
    pub host_to_device: u64,
    /// Device to host copies
    pub device_to_host: u64,
    /// Device to device copies
    pub device_to_device: u64,
    /// Copies issued asynchronously
    pub async_copies: u64,
    /// Total bytes moved
    pub bytes_copied: u64,
}

impl DeviceStats {
    /// Total copies of any direction
    pub fn total_copies(&self) -> u64 {
        self.host_to_device + self.device_to_host + self.device_to_device
    }

    /// Allocations not yet freed
    pub fn live_allocations(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }

    pub(crate) fn record_alloc(&mut self, bytes: usize) {
        self.allocations += 1;
        self.live_bytes += bytes;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
    }

    pub(crate) fn record_free(&mut self, bytes: usize) {
        self.frees += 1;
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
    }

    pub(crate) fn record_copy(&mut self, direction: Direction, bytes: usize, mode: CopyMode) {
        match direction {
            Direction::HostToDevice => self.host_to_device += 1,
            Direction::DeviceToHost => self.device_to_host += 1,
            Direction::DeviceToDevice => self.device_to_device += 1,
        }
        if mode.is_async() {
            self.async_copies += 1;
        }
        self.bytes_copied += bytes as u64;
    }
}

/// Copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    HostToDevice,
    /// Device to host
    DeviceToHost,
    /// Device to device
    DeviceToDevice,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::HostToDevice => write!(f, "H2D"),
            Direction::DeviceToHost => write!(f, "D2H"),
            Direction::DeviceToDevice => write!(f, "D2D"),
        }
    }
}

/// Accelerator runtime used by the memory manager
///
/// Copy methods are `unsafe`: the caller guarantees that host pointers are
/// valid for `bytes` bytes. Backends validate device ranges where they can.
pub trait DeviceBackend: Send {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Whether the runtime can allocate and copy
    fn is_available(&self) -> bool;

    /// Allocate `bytes` of device memory
    fn allocate(&mut self, bytes: usize) -> DeviceResult<DeviceAddr>;

    /// Release an allocation returned by [`allocate`](Self::allocate)
    fn free(&mut self, addr: DeviceAddr) -> DeviceResult<()>;

    /// Copy `bytes` from host memory into device memory
    ///
    /// # Safety
    /// `src` must be valid for reads of `bytes` bytes.
    unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()>;

    /// Copy `bytes` from device memory into host memory
    ///
    /// # Safety
    /// `dst` must be valid for writes of `bytes` bytes.
    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()>;

    /// Copy `bytes` between two device ranges
    ///
    /// # Safety
    /// Both ranges must lie in live device allocations.
    unsafe fn copy_device_to_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()>;

    /// Wait for all queued work on the copy stream
    fn synchronize(&mut self) -> DeviceResult<()>;

    /// Counters
    fn stats(&self) -> DeviceStats;
}

impl DeviceBackend for Box<dyn DeviceBackend> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn allocate(&mut self, bytes: usize) -> DeviceResult<DeviceAddr> {
        (**self).allocate(bytes)
    }

    fn free(&mut self, addr: DeviceAddr) -> DeviceResult<()> {
        (**self).free(addr)
    }

    unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        unsafe { (**self).copy_host_to_device(dst, src, bytes, mode) }
    }

    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        unsafe { (**self).copy_device_to_host(dst, src, bytes, mode) }
    }

    unsafe fn copy_device_to_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> DeviceResult<()> {
        unsafe { (**self).copy_device_to_device(dst, src, bytes, mode) }
    }

    fn synchronize(&mut self) -> DeviceResult<()> {
        (**self).synchronize()
    }

    fn stats(&self) -> DeviceStats {
        (**self).stats()
    }
}

/// Create the backend selected by `config`
///
/// A CUDA request that cannot be honoured yields an unavailable host backend,
/// so the failure surfaces as an unsupported-accelerator error on the first
/// operation that needs a device mirror.
pub fn create_backend(config: &MirrorConfig) -> Box<dyn DeviceBackend> {
    match config.backend {
        BackendKind::Host => Box::new(HostDevice::with_alignment(config.device_alignment)),
        BackendKind::Cuda => cuda_backend(config),
    }
}

#[cfg(feature = "cuda")]
fn cuda_backend(config: &MirrorConfig) -> Box<dyn DeviceBackend> {
    match CudaDevice::new(config.device_id, config.stream) {
        Ok(device) => Box::new(device),
        Err(err) => {
            warn!(error = %err, "CUDA backend requested but not usable");
            Box::new(HostDevice::unavailable())
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend(_config: &MirrorConfig) -> Box<dyn DeviceBackend> {
    warn!("CUDA backend requested but warp-mirror was built without the `cuda` feature");
    Box::new(HostDevice::unavailable())
}
