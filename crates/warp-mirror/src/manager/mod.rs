//! Residency resolution and synchronization
//!
//! [`MemoryManager`] ties the registry to a device backend. Callers register
//! host buffers, later ask for "the address to compute on", and force
//! synchronization explicitly with [`push`](MemoryManager::push) and
//! [`pull`](MemoryManager::pull).
//!
//! # State machine
//!
//! ```text
//!  HostOnly ──first resolve (accelerator on)──▶ Mirrored
//!                                              │    ▲
//!                                         push │    │ pull
//!                                              ▼    │
//!                           DeviceAuthoritative ◀─▶ HostAuthoritative
//! ```
//!
//! `resolve` never changes authority after the first mirroring and never
//! checks whether the host copy changed since; staleness is the caller's
//! responsibility.
//!
//! # Threading
//!
//! All operations take `&mut self`. Sharing a manager between threads
//! requires an external lock, as [`crate::global`] does.

mod copy;

use tracing::{debug, error, info, trace, warn};

use crate::addr::{AddressShift, DeviceAddr, HostAddr};
use crate::config::{ConfigLoader, FailurePolicy, MirrorConfig};
use crate::device::{CopyMode, DeviceBackend, DeviceStats, HostDevice, create_backend};
use crate::error::{CallSite, MirrorError, MirrorResult, Operation};
use crate::registry::{Entry, EntryKind, RegionId, Registry, Residency};

/// Pointer to use for computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Host copy (accelerator off)
    Host(HostAddr),
    /// Device mirror; null for zero-sized regions
    Device(DeviceAddr),
}

impl Resolved {
    /// Raw address value
    pub fn raw(&self) -> usize {
        match self {
            Resolved::Host(addr) => addr.raw(),
            Resolved::Device(addr) => addr.raw(),
        }
    }

    /// Host address, if resolved to the host
    pub fn host(&self) -> Option<HostAddr> {
        match self {
            Resolved::Host(addr) => Some(*addr),
            Resolved::Device(_) => None,
        }
    }

    /// Device address, if resolved to the device
    pub fn device(&self) -> Option<DeviceAddr> {
        match self {
            Resolved::Device(addr) => Some(*addr),
            Resolved::Host(_) => None,
        }
    }

    /// Check for a device address
    pub fn is_device(&self) -> bool {
        matches!(self, Resolved::Device(_))
    }
}

/// Manager statistics
#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    /// Live entries
    pub entries: usize,
    /// Live entries synthesized by the range resolver
    pub sub_ranges: usize,
    /// Entries touched by the accelerator
    pub mirrored: usize,
    /// Bytes held by device mirrors
    pub mirrored_bytes: usize,
    /// Backend counters
    pub device: DeviceStats,
}

/// Dual-residency memory manager
pub struct MemoryManager<B: DeviceBackend = HostDevice> {
    config: MirrorConfig,
    shift: AddressShift,
    registry: Registry,
    backend: B,
}

impl MemoryManager<HostDevice> {
    /// Create a manager on the host-simulated device
    pub fn new(config: MirrorConfig) -> Self {
        let backend = HostDevice::with_alignment(config.device_alignment);
        Self::with_backend(config, backend)
    }
}

impl MemoryManager<Box<dyn DeviceBackend>> {
    /// Create a manager on the backend selected by `config`
    pub fn from_config(config: MirrorConfig) -> Self {
        let backend = create_backend(&config);
        Self::with_backend(config, backend)
    }

    /// Create a manager configured from `MIRROR_*` environment variables
    pub fn from_env() -> MirrorResult<Self> {
        let config = ConfigLoader::from_env().load()?;
        Ok(Self::from_config(config))
    }
}

impl<B: DeviceBackend> MemoryManager<B> {
    /// Create a manager on an explicit backend
    pub fn with_backend(config: MirrorConfig, backend: B) -> Self {
        let shift = config.shift();
        info!(
            accelerator = config.accelerator,
            backend = backend.name(),
            available = backend.is_available(),
            address_shift = shift.is_enabled(),
            "Memory manager ready"
        );
        Self {
            config,
            shift,
            registry: Registry::new(),
            backend,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Active address shift
    pub fn shift(&self) -> AddressShift {
        self.shift
    }

    /// Device backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Device backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Whether `addr` is registered exactly
    pub fn contains(&self, addr: HostAddr) -> bool {
        self.registry.contains(self.shift.apply(addr))
    }

    /// Entry registered exactly at `addr`
    pub fn lookup(&self, addr: HostAddr) -> Option<&Entry> {
        self.registry.get(self.shift.apply(addr))
    }

    /// Entry behind a handle; `None` once erased
    pub fn entry(&self, id: RegionId) -> Option<&Entry> {
        self.registry.entry(id)
    }

    /// Handle for the entry registered exactly at `addr`
    pub fn region_id(&self, addr: HostAddr) -> Option<RegionId> {
        self.registry.id_of(self.shift.apply(addr))
    }

    /// Entries in address order
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.registry.iter()
    }

    /// Register `count * element_size` bytes at `host_ptr`
    ///
    /// A count of zero registers a size-unknown placeholder.
    ///
    /// # Safety
    /// With the accelerator enabled, `host_ptr` must stay valid for reads and
    /// writes of the registered size until the entry is erased; `resolve`,
    /// `push` and `pull` copy through it.
    #[track_caller]
    pub unsafe fn insert(&mut self, host_ptr: HostAddr, count: usize, element_size: usize) -> MirrorResult<RegionId> {
        let site = CallSite::caller();
        let identity = self.shift.apply(host_ptr);

        if let Some(existing) = self.registry.get(identity) {
            let err = MirrorError::Duplicate {
                addr: host_ptr,
                kind: existing.kind(),
                site,
                registered_at: existing.site(),
            };
            return self.fail(err);
        }

        let Some(byte_size) = count.checked_mul(element_size) else {
            return self.fail(MirrorError::SizeOverflow {
                count,
                element_size,
                site,
            });
        };

        let (id, _) = self
            .registry
            .insert(Entry::new(identity, host_ptr, byte_size, EntryKind::Registered, site));
        debug!("Registered {} ({} bytes) at {}", host_ptr, byte_size, site);
        Ok(id)
    }

    /// Register `count` values of `T` starting at `ptr`
    ///
    /// # Safety
    /// Same contract as [`insert`](Self::insert).
    #[track_caller]
    pub unsafe fn insert_ptr<T>(&mut self, ptr: *const T, count: usize) -> MirrorResult<RegionId> {
        unsafe { self.insert(HostAddr::from_ptr(ptr), count, std::mem::size_of::<T>()) }
    }

    /// Register a slice
    ///
    /// # Safety
    /// Same contract as [`insert`](Self::insert): the slice's buffer must
    /// outlive the registration.
    #[track_caller]
    pub unsafe fn insert_slice<T>(&mut self, slice: &[T]) -> MirrorResult<RegionId> {
        unsafe { self.insert(HostAddr::of_slice(slice), slice.len(), std::mem::size_of::<T>()) }
    }

    /// Remove the entry registered at `addr`, releasing its device mirror
    ///
    /// Returns the caller's address. Sub-range entries derived from this one
    /// are left in place. If the device mirror cannot be released the entry
    /// stays registered.
    #[track_caller]
    pub fn erase(&mut self, addr: HostAddr) -> MirrorResult<HostAddr> {
        let site = CallSite::caller();
        let identity = self.shift.apply(addr);

        let Some(device_ptr) = self.registry.get(identity).map(Entry::device_ptr) else {
            return self.fail(MirrorError::unknown(addr, Operation::Erase, site));
        };

        if let Some(device_ptr) = device_ptr
            && let Err(err) = self.backend.free(device_ptr)
        {
            return self.fail(err.into());
        }

        let byte_size = self.registry.remove(identity).map_or(0, |entry| entry.byte_size());
        debug!("Erased {} ({} bytes) at {}", addr, byte_size, site);
        Ok(self.shift.reverse(identity))
    }

    /// Whether `addr` is registered
    ///
    /// With `insert_if_in_range`, an address inside a registered region is
    /// registered as a sub-range entry covering the rest of that region, so
    /// later lookups on it are exact.
    #[track_caller]
    pub fn known(&mut self, addr: HostAddr, insert_if_in_range: bool) -> bool {
        let site = CallSite::caller();
        self.known_at(addr, insert_if_in_range, site)
    }

    fn known_at(&mut self, addr: HostAddr, insert_if_in_range: bool, site: CallSite) -> bool {
        let identity = self.shift.apply(addr);
        if self.registry.contains(identity) {
            return true;
        }
        if !insert_if_in_range {
            return false;
        }

        let Some(remaining) = self.registry.remaining_bytes(identity) else {
            trace!("{} is outside every registered range", addr);
            return false;
        };

        self.registry
            .insert(Entry::new(identity, addr, remaining, EntryKind::SubRange, site));
        debug!("Registered sub-range {} ({} bytes) at {}", addr, remaining, site);
        true
    }

    /// Address to use for computation on `addr`
    ///
    /// With the accelerator off this is always the host copy. With it on, the
    /// first call allocates the device mirror and queues a full host to device
    /// copy; later calls return the same device address without copying.
    #[track_caller]
    pub fn resolve(&mut self, addr: HostAddr) -> MirrorResult<Resolved> {
        let site = CallSite::caller();
        if !self.known_at(addr, true, site) {
            return self.fail(MirrorError::unknown(addr, Operation::Resolve, site));
        }

        let identity = self.shift.apply(addr);
        let Some(entry) = self.registry.get(identity) else {
            return self.fail(MirrorError::unknown(addr, Operation::Resolve, site));
        };

        if !self.config.accelerator {
            return Ok(Resolved::Host(entry.host_ptr()));
        }
        if entry.is_mirrored() {
            return Ok(Resolved::Device(entry.device_ptr().unwrap_or(DeviceAddr::NULL)));
        }

        let (host_ptr, byte_size) = (entry.host_ptr(), entry.byte_size());
        let device_ptr = self.mirror(addr, host_ptr, byte_size, site)?;

        if let Some(entry) = self.registry.get_mut(identity) {
            entry.device_ptr = device_ptr;
            entry.mirrored = true;
            entry.residency = Residency::DeviceAuthoritative;
        }
        Ok(Resolved::Device(device_ptr.unwrap_or(DeviceAddr::NULL)))
    }

    /// Allocate a device mirror and queue the initial upload
    fn mirror(
        &mut self,
        addr: HostAddr,
        host_ptr: HostAddr,
        byte_size: usize,
        site: CallSite,
    ) -> MirrorResult<Option<DeviceAddr>> {
        if !self.backend.is_available() {
            return self.fail(MirrorError::AcceleratorUnsupported { addr, site });
        }
        if byte_size == 0 {
            debug!("Mirrored empty region {} without allocation", addr);
            return Ok(None);
        }

        let device_ptr = match self.backend.allocate(byte_size) {
            Ok(ptr) => ptr,
            Err(err) => return self.fail(err.into()),
        };

        // SAFETY: host_ptr is valid for byte_size bytes per the insert contract
        let uploaded = unsafe { self.copy_host_to_device(device_ptr, host_ptr, byte_size, CopyMode::Async) };
        if let Err(err) = uploaded {
            if let Err(free_err) = self.backend.free(device_ptr) {
                warn!(error = %free_err, "Failed to release device mirror {}", device_ptr);
            }
            return Err(err);
        }

        debug!("Mirrored {} ({} bytes) to {}", addr, byte_size, device_ptr);
        Ok(Some(device_ptr))
    }

    /// Copy the host region into its device mirror
    ///
    /// No-op for entries the accelerator has never touched.
    #[track_caller]
    pub fn push(&mut self, addr: HostAddr) -> MirrorResult<()> {
        let site = CallSite::caller();
        let Some((host_ptr, device_ptr, bytes)) = self.mirrored_region(addr, Operation::Push, site)? else {
            return Ok(());
        };

        if let Some(device_ptr) = device_ptr {
            // SAFETY: host_ptr is valid for bytes per the insert contract
            unsafe { self.copy_host_to_device(device_ptr, host_ptr, bytes, CopyMode::Sync)? };
        }
        self.set_residency(addr, Residency::DeviceAuthoritative);
        trace!("Pushed {} ({} bytes)", addr, bytes);
        Ok(())
    }

    /// Copy the device mirror back into the host region
    ///
    /// No-op for entries the accelerator has never touched.
    #[track_caller]
    pub fn pull(&mut self, addr: HostAddr) -> MirrorResult<()> {
        let site = CallSite::caller();
        let Some((host_ptr, device_ptr, bytes)) = self.mirrored_region(addr, Operation::Pull, site)? else {
            return Ok(());
        };

        if let Some(device_ptr) = device_ptr {
            // SAFETY: host_ptr is valid for bytes per the insert contract
            unsafe { self.copy_device_to_host(host_ptr, device_ptr, bytes, CopyMode::Sync)? };
        }
        self.set_residency(addr, Residency::HostAuthoritative);
        trace!("Pulled {} ({} bytes)", addr, bytes);
        Ok(())
    }

    /// Host pointer, device mirror and size of a mirrored entry
    fn mirrored_region(
        &self,
        addr: HostAddr,
        op: Operation,
        site: CallSite,
    ) -> MirrorResult<Option<(HostAddr, Option<DeviceAddr>, usize)>> {
        let Some(entry) = self.registry.get(self.shift.apply(addr)) else {
            return self.fail(MirrorError::unknown(addr, op, site));
        };
        if !entry.is_mirrored() {
            trace!("{} is host-only, nothing to {}", addr, op);
            return Ok(None);
        }
        Ok(Some((entry.host_ptr(), entry.device_ptr(), entry.byte_size())))
    }

    fn set_residency(&mut self, addr: HostAddr, residency: Residency) {
        if let Some(entry) = self.registry.get_mut(self.shift.apply(addr)) {
            entry.residency = residency;
        }
    }

    /// Wait for queued asynchronous copies
    pub fn synchronize(&mut self) -> MirrorResult<()> {
        if !self.config.accelerator {
            return Ok(());
        }
        match self.backend.synchronize() {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err.into()),
        }
    }

    /// Current statistics
    pub fn stats(&self) -> MirrorStats {
        let mut stats = MirrorStats {
            device: self.backend.stats(),
            ..MirrorStats::default()
        };
        for entry in self.registry.iter() {
            stats.entries += 1;
            if entry.is_sub_range() {
                stats.sub_ranges += 1;
            }
            if entry.is_mirrored() {
                stats.mirrored += 1;
            }
            if entry.device_ptr().is_some() {
                stats.mirrored_bytes += entry.byte_size();
            }
        }
        stats
    }

    /// Apply the failure policy to a detected error
    fn fail<T>(&self, err: MirrorError) -> MirrorResult<T> {
        match self.config.failure_policy {
            FailurePolicy::Propagate => {
                warn!(error = %err, "Memory manager operation failed");
                Err(err)
            }
            FailurePolicy::Panic => {
                error!(error = %err, "Memory manager operation failed");
                panic!("[ERROR] {err}");
            }
            FailurePolicy::Abort => {
                error!(error = %err, "Memory manager operation failed, aborting");
                eprintln!("[ERROR] {err}");
                std::process::abort();
            }
        }
    }
}

impl<B: DeviceBackend> Drop for MemoryManager<B> {
    fn drop(&mut self) {
        let mirrors: Vec<DeviceAddr> = self
            .registry
            .drain()
            .into_iter()
            .filter_map(|entry| entry.device_ptr())
            .collect();
        if mirrors.is_empty() {
            return;
        }

        // Pending async uploads must land before their targets go away
        if let Err(err) = self.backend.synchronize() {
            warn!(error = %err, "Stream synchronization failed during teardown");
        }
        for device_ptr in mirrors {
            if let Err(err) = self.backend.free(device_ptr) {
                warn!(error = %err, "Failed to release device mirror {}", device_ptr);
            }
        }
    }
}

impl<B: DeviceBackend> std::fmt::Debug for MemoryManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("accelerator", &self.config.accelerator)
            .field("backend", &self.backend.name())
            .field("shift", &self.shift)
            .field("entries", &self.registry.len())
            .finish()
    }
}
