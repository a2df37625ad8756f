//! Sleep/Wake slot arena
//!
//! A cached group exposes `num_tcs * ncpt` command slots. Each claimed slot
//! remembers the resource address written into it, so a repeated vote for the
//! same resources lands on the same slots instead of consuming new ones.

use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Index into a group's slot arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Contiguous run of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: SlotId,
    pub len: usize,
}

impl SlotRange {
    pub fn slots(&self) -> impl Iterator<Item = SlotId> {
        self.indices().map(SlotId)
    }

    fn indices(&self) -> Range<usize> {
        self.start.0..self.start.0 + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free run of {requested} slots")]
pub struct OutOfCapacity {
    pub requested: usize,
}

/// Result of matching a request against the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLookup {
    /// Every address already sits, in order, in this run
    Hit(SlotRange),
    /// None of the addresses is cached
    Miss,
    /// An address is cached at this slot, but not in this sequence
    Mismatch(SlotId),
}

pub struct SlotArena {
    ncpt: usize,
    slots: Vec<Option<u32>>,
}

impl SlotArena {
    pub fn new(num_tcs: usize, ncpt: usize) -> Self {
        Self {
            ncpt,
            slots: vec![None; num_tcs * ncpt],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn cached(&self, slot: SlotId) -> Option<u32> {
        self.slots.get(slot.0).copied().flatten()
    }

    /// Slot holding `addr`, if it is cached
    pub fn slot_of(&self, addr: u32) -> Option<SlotId> {
        self.slots.iter().position(|s| *s == Some(addr)).map(SlotId)
    }

    /// Match `addrs` against the cache. A resource holds at most one slot, so
    /// any cached address outside a matching run is a mismatch.
    pub fn lookup(&self, addrs: &[u32]) -> SlotLookup {
        let Some(&first) = addrs.first() else {
            return SlotLookup::Miss;
        };
        let Some(SlotId(start)) = self.slot_of(first) else {
            return match addrs.iter().find_map(|&addr| self.slot_of(addr)) {
                Some(slot) => SlotLookup::Mismatch(slot),
                None => SlotLookup::Miss,
            };
        };

        let range = SlotRange {
            start: SlotId(start),
            len: addrs.len(),
        };
        let matches = range.indices().end <= self.slots.len()
            && range
                .indices()
                .zip(addrs)
                .all(|(i, &addr)| self.slots[i] == Some(addr));
        if matches {
            SlotLookup::Hit(range)
        } else {
            SlotLookup::Mismatch(SlotId(start))
        }
    }

    /// First free run of `len` slots that stays inside one TCS
    pub fn allocate(&self, len: usize) -> Result<SlotRange, OutOfCapacity> {
        let fail = OutOfCapacity { requested: len };
        if len == 0 || len > self.ncpt {
            return Err(fail);
        }

        for (q, window) in self.slots.chunks(self.ncpt).enumerate() {
            let mut run = 0;
            for (n, slot) in window.iter().enumerate() {
                run = if slot.is_none() { run + 1 } else { 0 };
                if run == len {
                    return Ok(SlotRange {
                        start: SlotId(q * self.ncpt + n + 1 - len),
                        len,
                    });
                }
            }
        }
        Err(fail)
    }

    /// Record `addrs` in `range`. Lengths must match.
    pub fn claim(&mut self, range: SlotRange, addrs: &[u32]) {
        debug_assert_eq!(range.len, addrs.len());
        for (i, &addr) in range.indices().zip(addrs) {
            self.slots[i] = Some(addr);
        }
    }

    /// `(tcs within group, command index)` of a slot
    pub fn position(&self, slot: SlotId) -> (usize, usize) {
        (slot.0 / self.ncpt, slot.0 % self.ncpt)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(arena: &mut SlotArena, addrs: &[u32]) -> SlotRange {
        let range = arena.allocate(addrs.len()).unwrap();
        arena.claim(range, addrs);
        range
    }

    #[test]
    fn repeated_vote_reuses_slots() {
        let mut arena = SlotArena::new(2, 4);
        let range = cache(&mut arena, &[0x10, 0x14]);
        assert_eq!(range.start, SlotId(0));

        assert_eq!(arena.lookup(&[0x10, 0x14]), SlotLookup::Hit(range));
        assert_eq!(
            arena.lookup(&[0x10]),
            SlotLookup::Hit(SlotRange {
                start: SlotId(0),
                len: 1
            })
        );
        assert_eq!(arena.lookup(&[0x10, 0x18]), SlotLookup::Mismatch(SlotId(0)));
        assert_eq!(arena.lookup(&[0x20]), SlotLookup::Miss);
        assert_eq!(arena.in_use(), 2);
    }

    #[test]
    fn cached_address_in_a_later_position_is_a_mismatch() {
        let mut arena = SlotArena::new(2, 4);
        cache(&mut arena, &[0x10, 0x14]);

        assert_eq!(arena.lookup(&[0x20, 0x10]), SlotLookup::Mismatch(SlotId(0)));
        assert_eq!(arena.lookup(&[0x20, 0x24, 0x14]), SlotLookup::Mismatch(SlotId(1)));
        assert_eq!(arena.slot_of(0x14), Some(SlotId(1)));
        assert_eq!(arena.slot_of(0x20), None);
    }

    #[test]
    fn runs_never_straddle_a_tcs() {
        let mut arena = SlotArena::new(2, 4);
        cache(&mut arena, &[1, 2, 3]);
        // One slot left in tcs 0, the run of two lands in tcs 1.
        let range = cache(&mut arena, &[4, 5]);
        assert_eq!(range.start, SlotId(4));
        assert_eq!(arena.position(SlotId(5)), (1, 1));

        let single = cache(&mut arena, &[6]);
        assert_eq!(single.start, SlotId(3));

        assert_eq!(arena.allocate(3), Err(OutOfCapacity { requested: 3 }));
        assert!(arena.allocate(2).is_ok());
        assert!(arena.allocate(5).is_err());
        assert!(arena.allocate(0).is_err());
    }

    #[test]
    fn clear_frees_everything() {
        let mut arena = SlotArena::new(1, 4);
        cache(&mut arena, &[1, 2, 3, 4]);
        assert!(arena.allocate(1).is_err());
        arena.clear();
        assert_eq!(arena.in_use(), 0);
        assert_eq!(arena.allocate(4).unwrap().start, SlotId(0));
        assert_eq!(arena.cached(SlotId(2)), None);
    }
}
