//! Error types for memory manager operations

use std::fmt;
use std::panic::Location;

use crate::addr::HostAddr;
use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::registry::EntryKind;

/// Result type for memory manager operations
pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

/// Source location of a manager call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Source file
    pub file: &'static str,
    /// Line number
    pub line: u32,
}

impl CallSite {
    /// Capture the location of the calling code
    ///
    /// Propagates through `#[track_caller]` functions, so public manager
    /// operations report the user's call site rather than their own.
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(loc: &'static Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Operation that required a known address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Removing a registration
    Erase,
    /// Converting to a usable pointer
    Resolve,
    /// Host to device synchronization
    Push,
    /// Device to host synchronization
    Pull,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Erase => write!(f, "remove"),
            Operation::Resolve => write!(f, "convert"),
            Operation::Push => write!(f, "push"),
            Operation::Pull => write!(f, "pull"),
        }
    }
}

/// Memory manager errors
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Address already has a registry entry
    #[error("Trying to add already {kind} address {addr} at {site} (registered at {registered_at})")]
    Duplicate {
        /// Caller address
        addr: HostAddr,
        /// Kind of the existing entry
        kind: EntryKind,
        /// Failing call site
        site: CallSite,
        /// Where the existing entry was registered
        registered_at: CallSite,
    },

    /// Address is neither registered nor inside a registered range
    #[error("Trying to {op} an unknown address {addr} at {site}")]
    UnknownAddress {
        /// Caller address
        addr: HostAddr,
        /// Operation that was attempted
        op: Operation,
        /// Failing call site
        site: CallSite,
    },

    /// A device mirror is needed but no accelerator runtime is available
    #[error("Trying to run without accelerator support: cannot mirror {addr} at {site}")]
    AcceleratorUnsupported {
        /// Caller address
        addr: HostAddr,
        /// Failing call site
        site: CallSite,
    },

    /// Element count times element size does not fit in `usize`
    #[error("Registration size overflows: {count} elements of {element_size} bytes at {site}")]
    SizeOverflow {
        /// Element count
        count: usize,
        /// Element size in bytes
        element_size: usize,
        /// Failing call site
        site: CallSite,
    },

    /// Device backend failure
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MirrorError {
    /// Create an unknown-address error
    #[inline]
    pub fn unknown(addr: HostAddr, op: Operation, site: CallSite) -> Self {
        Self::UnknownAddress { addr, op, site }
    }

    /// Whether the error is a registry invariant violation (a caller bug)
    /// rather than a backend or configuration failure
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::Duplicate { .. } | Self::UnknownAddress { .. } | Self::SizeOverflow { .. }
        )
    }

    /// Call site of the failing operation, when known
    pub fn site(&self) -> Option<CallSite> {
        match self {
            Self::Duplicate { site, .. }
            | Self::UnknownAddress { site, .. }
            | Self::AcceleratorUnsupported { site, .. }
            | Self::SizeOverflow { site, .. } => Some(*site),
            Self::Device(_) | Self::Config(_) => None,
        }
    }
}
