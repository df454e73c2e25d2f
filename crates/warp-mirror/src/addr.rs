//! Address newtypes for host and device memory
//!
//! Addresses are carried as plain integers rather than raw pointers so that
//! the registry stays `Send` and can be moved behind a lock. Conversion back
//! to a pointer happens only at the copy boundary.

use std::fmt;

/// Offset applied by the debug address shift (bytes)
#[cfg(target_pointer_width = "64")]
pub const DEBUG_ADDRESS_SHIFT: usize = 1 << 48;

/// Offset applied by the debug address shift (bytes)
#[cfg(not(target_pointer_width = "64"))]
pub const DEBUG_ADDRESS_SHIFT: usize = 1 << 28;

/// Address of a host-resident buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostAddr(usize);

impl HostAddr {
    /// Create from a raw address value
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Create from a pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Create from a slice's base pointer
    #[inline]
    pub fn of_slice<T>(slice: &[T]) -> Self {
        Self::from_ptr(slice.as_ptr())
    }

    /// Get raw value
    #[inline]
    pub const fn raw(&self) -> usize {
        self.0
    }

    /// Byte-offset this address
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Bytes between `base` and this address (`self >= base`)
    #[inline]
    pub const fn offset_from(self, base: HostAddr) -> usize {
        self.0 - base.0
    }

    /// View as a const pointer
    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    /// View as a mutable pointer
    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address inside device memory
///
/// With the accelerator disabled "device" memory is ordinary host memory and
/// the value is a host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddr(usize);

impl DeviceAddr {
    /// The null device address (no allocation)
    pub const NULL: DeviceAddr = DeviceAddr(0);

    /// Create from a raw address value
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Get raw value
    #[inline]
    pub const fn raw(&self) -> usize {
        self.0
    }

    /// Check for the null address
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Byte-offset this address
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// View as a const pointer
    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    /// View as a mutable pointer
    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{:#x}", self.0)
    }
}

/// Uniform offset applied to every registered address
///
/// When enabled, registry identities live `DEBUG_ADDRESS_SHIFT` bytes above
/// the caller's addresses so that any identity accidentally dereferenced as a
/// host pointer faults immediately. The manager applies the shift on the way
/// in and reverses it on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressShift(usize);

impl AddressShift {
    /// No shift
    pub const fn disabled() -> Self {
        Self(0)
    }

    /// The fixed debug shift
    pub const fn debug() -> Self {
        Self(DEBUG_ADDRESS_SHIFT)
    }

    /// Build from a flag
    pub const fn from_flag(enabled: bool) -> Self {
        if enabled { Self::debug() } else { Self::disabled() }
    }

    /// Whether a shift is applied
    pub const fn is_enabled(&self) -> bool {
        self.0 != 0
    }

    /// Shift size in bytes
    pub const fn bytes(&self) -> usize {
        self.0
    }

    /// Map a caller address to a registry identity
    #[inline]
    pub const fn apply(&self, addr: HostAddr) -> HostAddr {
        HostAddr(addr.0.wrapping_add(self.0))
    }

    /// Map a registry identity back to the caller address
    #[inline]
    pub const fn reverse(&self, identity: HostAddr) -> HostAddr {
        HostAddr(identity.0.wrapping_sub(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_addr_arithmetic() {
        let base = HostAddr::new(0x1000);
        let inner = base.add(0x40);
        assert_eq!(inner.raw(), 0x1040);
        assert_eq!(inner.offset_from(base), 0x40);
        assert!(base < inner);
    }

    #[test]
    fn test_addr_display() {
        assert_eq!(HostAddr::new(0x1000).to_string(), "0x1000");
        assert_eq!(DeviceAddr::new(0xff).to_string(), "dev:0xff");
        assert!(DeviceAddr::NULL.is_null());
    }

    #[test]
    fn test_of_slice() {
        let data = [1.0f64, 2.0, 3.0];
        let addr = HostAddr::of_slice(&data);
        assert_eq!(addr.as_ptr::<f64>(), data.as_ptr());
    }

    #[test]
    fn test_shift_roundtrip() {
        let shift = AddressShift::debug();
        let addr = HostAddr::new(0x7fff_0000);
        let identity = shift.apply(addr);
        assert_ne!(identity, addr);
        assert_eq!(identity.offset_from(addr), DEBUG_ADDRESS_SHIFT);
        assert_eq!(shift.reverse(identity), addr);
    }

    #[test]
    fn test_disabled_shift_is_identity() {
        let shift = AddressShift::from_flag(false);
        assert!(!shift.is_enabled());
        let addr = HostAddr::new(0x1234);
        assert_eq!(shift.apply(addr), addr);
        assert_eq!(shift.reverse(addr), addr);
    }
}
