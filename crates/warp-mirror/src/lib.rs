//! # warp-mirror: Dual-Residency Memory Manager
//!
//! Lets numerical arrays live in host memory and, on demand, mirror
//! themselves into accelerator memory without callers tracking which copy is
//! current.
//!
//! ## Features
//!
//! - **Address Registry**: tracks host allocations by base address
//! - **Range Resolver**: interior pointers resolve to their enclosing region
//! - **Residency Resolver**: lazily creates device mirrors on first use
//! - **Explicit Sync**: `push` / `pull` force one-directional copies
//! - **Copy Dispatcher**: H2D, D2H and D2D copies that degrade to `memcpy`
//!   when the accelerator is off
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Array / vector objects                   │
//! └───────┬──────────────┬───────────────┬───────────────────┘
//!   insert/erase      resolve        push/pull
//!         ▼              ▼               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     MemoryManager                        │
//! │  ┌──────────┐  ┌───────────────┐  ┌───────────────────┐  │
//! │  │ Registry │◀─│ Range Resolver│  │  Copy Dispatcher  │  │
//! │  └──────────┘  └───────────────┘  └─────────┬─────────┘  │
//! └─────────────────────────────────────────────┼────────────┘
//!                                               ▼
//!                         DeviceBackend (HostDevice | CudaDevice)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use warp_mirror::{HostAddr, MemoryManager, MirrorConfig, Resolved};
//!
//! # fn main() -> Result<(), warp_mirror::MirrorError> {
//! let mut mm = MemoryManager::new(MirrorConfig::accelerated());
//! let mut data = vec![1.0f64; 1024];
//! let addr = HostAddr::from_ptr(data.as_mut_ptr());
//!
//! // SAFETY: `data` outlives its registration
//! unsafe { mm.insert(addr, data.len(), 8)? };
//!
//! // First use mirrors the array into device memory
//! let Resolved::Device(_device) = mm.resolve(addr)? else { unreachable!() };
//!
//! // Bring device results back
//! mm.pull(addr)?;
//! mm.erase(addr)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::missing_safety_doc)]

pub mod addr;
pub mod config;
pub mod device;
pub mod error;
pub mod global;
pub mod logging;
pub mod manager;
pub mod registry;

pub use addr::{AddressShift, DEBUG_ADDRESS_SHIFT, DeviceAddr, HostAddr};
pub use config::{BackendKind, ConfigError, ConfigLoader, ENV_PREFIX, FailurePolicy, MirrorConfig, StreamKind};
pub use device::{CopyMode, DeviceBackend, DeviceError, DeviceResult, DeviceStats, Direction, HostDevice, create_backend};
pub use error::{CallSite, MirrorError, MirrorResult, Operation};
pub use logging::{LogConfig, LogFormat, LogLevel, LoggingError, init_logging};
pub use manager::{MemoryManager, MirrorStats, Resolved};
pub use registry::{Entry, EntryKind, RegionId, Registry, Residency};

#[cfg(feature = "cuda")]
pub use device::CudaDevice;
