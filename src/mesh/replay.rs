//! Replay Protection List
//!
//! One entry per source address, holding the highest accepted sequence number
//! and whether it was received on the previous IV index. [`check`] and
//! [`commit`] are separate so that segmented messages are only recorded once
//! reassembly completes.
//!
//! [`check`]: ReplayProtectionList::check
//! [`commit`]: ReplayProtectionList::commit

use crate::constants::RPL_SIZE;
use crate::mesh::addr;

/// Persistence hook for Replay Protection List changes.
pub trait ReplayStore {
    /// Entry was created or updated
    fn store(&mut self, entry: &ReplayEntry);

    /// Entry for `src` was removed
    fn clear(&mut self, src: u16);
}

/// No persistence
impl ReplayStore for () {
    fn store(&mut self, _entry: &ReplayEntry) {}

    fn clear(&mut self, _src: u16) {}
}

/// Replay Protection List entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReplayEntry {
    /// Source address (`0` for an empty slot)
    pub src: u16,
    /// Highest accepted sequence number
    pub seq: u32,
    /// Sequence number belongs to the previous IV index
    pub old_iv: bool,
}

impl ReplayEntry {
    fn is_empty(&self) -> bool {
        self.src == addr::UNASSIGNED
    }

    fn accepts(&self, seq: u32, old_iv: bool) -> bool {
        if old_iv && !self.old_iv {
            return false;
        }
        (!old_iv && self.old_iv) || seq > self.seq
    }
}

/// Result of a replay check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReplayCheck {
    /// Message may be processed; commit once it has been consumed
    Accept,
    /// Replayed, reordered, or no slot available
    Reject,
}

/// Fixed-size Replay Protection List
#[derive(Debug, Clone)]
pub struct ReplayProtectionList<const N: usize = RPL_SIZE> {
    entries: [ReplayEntry; N],
}

impl<const N: usize> Default for ReplayProtectionList<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ReplayProtectionList<N> {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: [ReplayEntry::default(); N],
        }
    }

    /// Check whether `seq` from `src` may be accepted without recording it.
    #[must_use]
    pub fn check(&self, src: u16, seq: u32, old_iv: bool) -> ReplayCheck {
        for entry in &self.entries {
            if entry.is_empty() {
                return ReplayCheck::Accept;
            }
            if entry.src == src {
                return if entry.accepts(seq, old_iv) {
                    ReplayCheck::Accept
                } else {
                    ReplayCheck::Reject
                };
            }
        }

        error!("[RPL] List is full, rejecting src {:#x}", src);
        ReplayCheck::Reject
    }

    /// Record `seq` from `src`, returning the updated entry.
    ///
    /// Returns `None` when the list is full or the sequence would move the
    /// entry backwards.
    pub fn commit(&mut self, src: u16, seq: u32, old_iv: bool) -> Option<ReplayEntry> {
        for entry in &mut self.entries {
            if entry.is_empty() {
                *entry = ReplayEntry { src, seq, old_iv };
                return Some(*entry);
            }
            if entry.src == src {
                if !entry.accepts(seq, old_iv) {
                    return None;
                }
                entry.seq = seq;
                entry.old_iv = old_iv;
                return Some(*entry);
            }
        }

        error!("[RPL] List is full, cannot record src {:#x}", src);
        None
    }

    /// Check and commit in one step, as used for unsegmented messages
    pub fn check_and_commit(&mut self, src: u16, seq: u32, old_iv: bool) -> Option<ReplayEntry> {
        match self.check(src, seq, old_iv) {
            ReplayCheck::Accept => self.commit(src, seq, old_iv),
            ReplayCheck::Reject => None,
        }
    }

    /// Roll the list over to a new IV index.
    ///
    /// Entries already on the old IV index are dropped; the others are marked
    /// as old. Returns the number of dropped entries.
    pub fn iv_update(&mut self, store: &mut impl ReplayStore) -> usize {
        let mut dropped = 0;
        for entry in &mut self.entries {
            if entry.is_empty() {
                continue;
            }
            if entry.old_iv {
                store.clear(entry.src);
                *entry = ReplayEntry::default();
                dropped += 1;
            } else {
                entry.old_iv = true;
                store.store(entry);
            }
        }
        self.compact();
        debug!("[RPL] IV update, dropped {} entries", dropped);
        dropped
    }

    /// Forget `src`
    pub fn remove(&mut self, src: u16, store: &mut impl ReplayStore) {
        let mut removed = false;
        for entry in &mut self.entries {
            if !entry.is_empty() && entry.src == src {
                *entry = ReplayEntry::default();
                removed = true;
            }
        }
        if removed {
            store.clear(src);
            self.compact();
        }
    }

    /// Forget every source
    pub fn clear(&mut self, store: &mut impl ReplayStore) {
        for entry in &mut self.entries {
            if !entry.is_empty() {
                store.clear(entry.src);
                *entry = ReplayEntry::default();
            }
        }
    }

    /// Look up the entry for `src`
    #[must_use]
    pub fn get(&self, src: u16) -> Option<&ReplayEntry> {
        self.entries
            .iter()
            .take_while(|entry| !entry.is_empty())
            .find(|entry| entry.src == src)
    }

    /// Number of occupied entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_empty()).count()
    }

    /// Whether no source is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The linear scan stops at the first empty slot, so occupied entries must
    // stay contiguous.
    fn compact(&mut self) {
        let mut write = 0;
        for read in 0..N {
            if !self.entries[read].is_empty() {
                self.entries.swap(write, read);
                write += 1;
            }
        }
    }
}
