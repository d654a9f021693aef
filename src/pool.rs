//! Fixed-capacity slot arena with generation-tagged handles.
//!
//! Both segment stores keep their contexts in a [`Pool`]. A [`SlotHandle`]
//! captures the slot index together with the generation current at the time
//! it was issued; every reset bumps the generation, so timers and network
//! completions that refer to a torn-down context are recognised and ignored.

/// Implemented by pool entries to tell whether the slot may be reused.
pub trait Reusable {
    /// Whether this entry may be handed out by [`Pool::allocate`].
    fn is_free(&self) -> bool;
}

/// Reference to a pool slot, valid only while the slot's generation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotHandle {
    index: u8,
    generation: u16,
}

impl SlotHandle {
    /// Index of the slot inside its pool
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Generation the handle was issued for
    #[must_use]
    pub fn generation(self) -> u16 {
        self.generation
    }
}

/// A fixed array of `N` entries plus one generation counter per slot.
#[derive(Debug)]
pub struct Pool<T, const N: usize> {
    entries: [T; N],
    generations: [u16; N],
}

impl<T: Reusable + Default, const N: usize> Pool<T, N> {
    /// Create a pool with every slot in its default (free) state
    #[must_use]
    pub fn new() -> Self {
        debug_assert!(N <= u8::MAX as usize);
        Self {
            entries: core::array::from_fn(|_| T::default()),
            generations: [0; N],
        }
    }
}

impl<T: Reusable + Default, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reusable, const N: usize> Pool<T, N> {
    /// Claim the first free slot.
    ///
    /// The slot's generation is advanced, so handles issued for the previous
    /// occupant stop resolving.
    pub fn allocate(&mut self) -> Option<SlotHandle> {
        let index = self.entries.iter().position(Reusable::is_free)?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        Some(self.handle_at(index))
    }

    /// Advance a slot's generation, invalidating every outstanding handle.
    pub fn invalidate(&mut self, index: usize) {
        if let Some(generation) = self.generations.get_mut(index) {
            *generation = generation.wrapping_add(1);
        }
    }

    /// Current handle for the slot at `index`
    #[must_use]
    pub fn handle_at(&self, index: usize) -> SlotHandle {
        SlotHandle {
            index: index as u8,
            generation: self.generations[index],
        }
    }

    /// Whether `handle` still refers to the slot's current generation
    #[must_use]
    pub fn is_current(&self, handle: SlotHandle) -> bool {
        self.generations
            .get(handle.index())
            .is_some_and(|generation| *generation == handle.generation)
    }

    /// Resolve a handle, returning `None` for a stale generation
    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        if self.is_current(handle) {
            self.entries.get(handle.index())
        } else {
            None
        }
    }

    /// Resolve a handle mutably, returning `None` for a stale generation
    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        if self.is_current(handle) {
            self.entries.get_mut(handle.index())
        } else {
            None
        }
    }

    /// Find the first slot whose entry satisfies `predicate`
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<SlotHandle> {
        self.entries
            .iter()
            .position(|entry| predicate(entry))
            .map(|index| self.handle_at(index))
    }

    /// Iterate over every slot with its current handle
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (self.handle_at(index), entry))
    }

    /// Number of slots not currently free
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_free()).count()
    }

    /// Pool capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}
