//! Generational slot arena.
//!
//! Sessions, tasks and admin connections are stored in dense arenas and
//! referenced by `SlotId` handles. A handle carries the generation of the
//! slot it was minted for; a stale handle (the slot was freed and reused)
//! simply resolves to `None` instead of aliasing a new occupant.

// ============================================================================
// Slot Identifier
// ============================================================================

/// Handle into a [`Slots`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    idx: u32,
    gen: u32,
}

impl SlotId {
    /// Raw slot index (stable for the lifetime of the occupant).
    #[inline]
    pub fn index(&self) -> usize {
        self.idx as usize
    }

    /// Build a handle from raw parts.
    ///
    /// Only useful in tests; a fabricated handle resolves to `None`
    /// unless it matches a live slot.
    pub fn from_raw(idx: u32, gen: u32) -> Self {
        Self { idx, gen }
    }
}

// ============================================================================
// Arena
// ============================================================================

struct Entry<T> {
    gen: u32,
    val: Option<T>,
    /// Slot is allocated but its value is temporarily checked out.
    taken: bool,
}

/// Generational arena with checkout support.
///
/// `take`/`restore` let a caller move a value out, mutate the arena through
/// other handles, and put the value back without invalidating its handle.
pub struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of live (inserted, possibly checked-out) slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, returning its handle.
    pub fn insert(&mut self, val: T) -> SlotId {
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            let entry = &mut self.entries[idx as usize];
            debug_assert!(entry.val.is_none() && !entry.taken);
            entry.val = Some(val);
            SlotId {
                idx,
                gen: entry.gen,
            }
        } else {
            let idx = self.entries.len() as u32;
            self.entries.push(Entry {
                gen: 0,
                val: Some(val),
                taken: false,
            });
            SlotId { idx, gen: 0 }
        }
    }

    fn entry(&self, id: SlotId) -> Option<&Entry<T>> {
        self.entries
            .get(id.idx as usize)
            .filter(|e| e.gen == id.gen)
    }

    /// Resolve a handle. Stale or checked-out slots yield `None`.
    #[inline]
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.entry(id).and_then(|e| e.val.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.entries
            .get_mut(id.idx as usize)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.val.as_mut())
    }

    /// Check a value out of the arena, leaving the slot reserved.
    ///
    /// The handle stays valid for [`Slots::restore`]; `get` returns `None`
    /// while the value is out.
    pub fn take(&mut self, id: SlotId) -> Option<T> {
        let entry = self
            .entries
            .get_mut(id.idx as usize)
            .filter(|e| e.gen == id.gen)?;
        let val = entry.val.take()?;
        entry.taken = true;
        Some(val)
    }

    /// Put a checked-out value back into its reserved slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not checked out with [`Slots::take`]; that is
    /// a state-machine impossibility, not a recoverable error.
    pub fn restore(&mut self, id: SlotId, val: T) {
        let entry = self
            .entries
            .get_mut(id.idx as usize)
            .filter(|e| e.gen == id.gen)
            .expect("restore of stale slot handle");
        assert!(entry.taken && entry.val.is_none(), "restore of live slot");
        entry.val = Some(val);
        entry.taken = false;
    }

    /// Free a slot, invalidating all handles to it.
    ///
    /// Accepts both live and checked-out slots (a checked-out occupant is
    /// considered already moved out by the caller).
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let entry = self
            .entries
            .get_mut(id.idx as usize)
            .filter(|e| e.gen == id.gen)?;
        if entry.val.is_none() && !entry.taken {
            return None;
        }
        let val = entry.val.take();
        entry.taken = false;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.idx);
        self.len -= 1;
        val
    }

    /// Iterate over live slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.val.as_ref().map(|v| {
                (
                    SlotId {
                        idx: i as u32,
                        gen: e.gen,
                    },
                    v,
                )
            })
        })
    }

    /// Handles of every live or checked-out slot.
    pub fn ids(&self) -> Vec<SlotId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.val.is_some() || e.taken)
            .map(|(i, e)| SlotId {
                idx: i as u32,
                gen: e.gen,
            })
            .collect()
    }
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}
