//! Interior-address resolution

use super::Registry;
use crate::addr::HostAddr;

impl Registry {
    /// Identity of the entry whose span contains `identity`
    ///
    /// Walks entries downward from `identity` and returns the first whose
    /// span contains it. Zero-sized placeholders contain nothing. Entries
    /// below `identity` that end before it (such as sub-ranges left behind by
    /// an erased parent) are skipped. Because sub-range entries end where
    /// their parent ends, landing on one yields the same remaining length as
    /// landing on the parent.
    pub fn find_containing_range(&self, identity: HostAddr) -> Option<HostAddr> {
        self.index
            .range(..=identity)
            .rev()
            .filter_map(|(_, id)| self.entry(*id))
            .find(|entry| entry.spans(identity))
            .map(|entry| entry.identity)
    }

    /// Bytes from `identity` to the end of its containing entry
    pub fn remaining_bytes(&self, identity: HostAddr) -> Option<usize> {
        let base = self.find_containing_range(identity)?;
        let entry = self.get(base)?;
        Some(entry.byte_size - identity.offset_from(base))
    }
}
