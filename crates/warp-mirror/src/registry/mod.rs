//! Address registry
//!
//! Entries live in a generational arena; an ordered index maps each host
//! identity to its arena slot. Exact lookups are logarithmic and the ordering
//! lets the range resolver find the region below an interior address without
//! scanning.
//!
//! The registry stores and returns entries but enforces no policy: duplicate
//! detection, error reporting and device memory are the manager's job.

mod range;

use std::collections::BTreeMap;
use std::fmt;

use crate::addr::{DeviceAddr, HostAddr};
use crate::error::CallSite;

/// Which copy holds the most recent data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residency {
    /// Host copy is current
    #[default]
    HostAuthoritative,
    /// Device copy is current
    DeviceAuthoritative,
}

/// How an entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Explicitly registered allocation
    Registered,
    /// Interior address synthesized by the range resolver
    SubRange,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Registered => write!(f, "present"),
            EntryKind::SubRange => write!(f, "ranged"),
        }
    }
}

/// Opaque handle to a registry entry
///
/// Handles carry a generation, so a handle to an erased entry never aliases
/// a later entry that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}v{}", self.index, self.generation)
    }
}

/// One tracked allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub(crate) identity: HostAddr,
    pub(crate) byte_size: usize,
    pub(crate) host_ptr: HostAddr,
    pub(crate) device_ptr: Option<DeviceAddr>,
    pub(crate) residency: Residency,
    pub(crate) mirrored: bool,
    pub(crate) kind: EntryKind,
    pub(crate) site: CallSite,
}

impl Entry {
    /// Create a host-only entry
    pub fn new(identity: HostAddr, host_ptr: HostAddr, byte_size: usize, kind: EntryKind, site: CallSite) -> Self {
        Self {
            identity,
            byte_size,
            host_ptr,
            device_ptr: None,
            residency: Residency::HostAuthoritative,
            mirrored: false,
            kind,
            site,
        }
    }

    /// Registry key
    pub fn identity(&self) -> HostAddr {
        self.identity
    }

    /// Region length in bytes
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Host copy
    pub fn host_ptr(&self) -> HostAddr {
        self.host_ptr
    }

    /// Device mirror, if allocated
    pub fn device_ptr(&self) -> Option<DeviceAddr> {
        self.device_ptr
    }

    /// Authoritative copy
    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Whether the accelerator has touched this entry
    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    /// Whether the range resolver created this entry
    pub fn is_sub_range(&self) -> bool {
        self.kind == EntryKind::SubRange
    }

    /// Entry kind
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Where the entry was registered
    pub fn site(&self) -> CallSite {
        self.site
    }

    /// Whether `identity` falls in `[self.identity, self.identity + byte_size)`
    pub fn spans(&self, identity: HostAddr) -> bool {
        identity >= self.identity && identity.offset_from(self.identity) < self.byte_size
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena of entries indexed by identity
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: BTreeMap<HostAddr, RegionId>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Exact identity match
    pub fn contains(&self, identity: HostAddr) -> bool {
        self.index.contains_key(&identity)
    }

    /// Handle for an identity
    pub fn id_of(&self, identity: HostAddr) -> Option<RegionId> {
        self.index.get(&identity).copied()
    }

    /// Entry by identity
    pub fn get(&self, identity: HostAddr) -> Option<&Entry> {
        let id = self.id_of(identity)?;
        self.entry(id)
    }

    /// Mutable entry by identity
    pub fn get_mut(&mut self, identity: HostAddr) -> Option<&mut Entry> {
        let id = self.id_of(identity)?;
        self.entry_mut(id)
    }

    /// Entry by handle; `None` once erased
    pub fn entry(&self, id: RegionId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: RegionId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Store an entry whose identity is not yet present
    ///
    /// An existing entry with the same identity is replaced and returned;
    /// callers check [`contains`](Self::contains) first.
    pub fn insert(&mut self, entry: Entry) -> (RegionId, Option<Entry>) {
        let replaced = self.remove(entry.identity);
        let identity = entry.identity;

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                RegionId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                RegionId { index, generation: 0 }
            }
        };

        self.index.insert(identity, id);
        (id, replaced)
    }

    /// Remove the entry for an identity
    pub fn remove(&mut self, identity: HostAddr) -> Option<Entry> {
        let id = self.index.remove(&identity)?;
        let slot = &mut self.slots[id.index as usize];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        entry
    }

    /// Entries in identity order
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.index.values().filter_map(|id| self.entry(*id))
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<Entry> {
        let identities: Vec<HostAddr> = self.index.keys().copied().collect();
        identities.into_iter().filter_map(|identity| self.remove(identity)).collect()
    }
}
