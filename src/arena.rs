//! Generational arena backing the fiber table.
//!
//! Fibers are addressed by `(index, generation)` pairs instead of pointers.
//! A removed slot bumps its generation, so a stale handle to a finished fiber
//! can never alias the fiber that later reuses the slot.

use std::fmt;

/// An index into an [`Arena`] with a generation counter for ABA safety.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Returns the raw slot index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Vec-backed arena with a free list and per-slot generations.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied { .. }))
            .count()
    }

    pub(crate) fn insert(&mut self, value: T) -> ArenaIndex {
        if let Some(free_index) = self.free_head {
            let slot = &mut self.slots[free_index as usize];
            let generation = match *slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    self.free_head = next_free;
                    generation
                }
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            };
            *slot = Slot::Occupied { value, generation };
            ArenaIndex {
                index: free_index,
                generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena overflow");
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            ArenaIndex {
                index,
                generation: 0,
            }
        }
    }

    pub(crate) fn get(&self, idx: ArenaIndex) -> Option<&T> {
        match self.slots.get(idx.index as usize)? {
            Slot::Occupied { value, generation } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(idx.index as usize)? {
            Slot::Occupied { value, generation } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == idx.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            next_free: self.free_head,
            generation: idx.generation.wrapping_add(1),
        };
        match std::mem::replace(slot, vacant) {
            Slot::Occupied { value, .. } => {
                self.free_head = Some(idx.index);
                Some(value)
            }
            Slot::Vacant { .. } => unreachable!(),
        }
    }
}
