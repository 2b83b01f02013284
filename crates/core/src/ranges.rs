//! Sorted, non-overlapping address-range index.
//!
//! Both the section privilege map and the address-to-symbol map are built on
//! this. Ranges are inserted in priority order; a later range only takes the
//! addresses no earlier range already owns. Lookups are a binary search.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry<T> {
    pub start: u64,
    pub end: u64,
    pub value: T,
}

/// A claimed range that was (partly) already owned by `owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeConflict<T> {
    pub owner: T,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct RangeIndexBuilder<T> {
    entries: BTreeMap<u64, (u64, T)>,
}

impl<T: Copy> Default for RangeIndexBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> RangeIndexBuilder<T> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Claim `[start, end)` for `value`, keeping whatever is already owned.
    ///
    /// Returns the pieces that were already owned by someone else.
    pub fn claim(&mut self, start: u64, end: u64, value: T) -> Vec<RangeConflict<T>> {
        let mut conflicts = Vec::new();
        if end <= start {
            return conflicts;
        }

        // Existing entries are disjoint, so walking back from `end` visits
        // exactly the ones that intersect until one ends at or before `start`.
        let mut owned: Vec<(u64, u64, T)> = Vec::new();
        for (&s, &(e, owner)) in self.entries.range(..end).rev() {
            if e <= start {
                break;
            }
            owned.push((s, e, owner));
        }
        owned.reverse();

        let mut cursor = start;
        let mut free: Vec<(u64, u64)> = Vec::new();
        for (s, e, owner) in owned {
            conflicts.push(RangeConflict { owner, start: s.max(start), end: e.min(end) });
            if cursor < s {
                free.push((cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < end {
            free.push((cursor, end));
        }

        for (s, e) in free {
            self.entries.insert(s, (e, value));
        }
        conflicts
    }

    pub fn build(self) -> RangeIndex<T> {
        RangeIndex {
            entries: self
                .entries
                .into_iter()
                .map(|(start, (end, value))| RangeEntry { start, end, value })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeIndex<T> {
    entries: Vec<RangeEntry<T>>,
}

impl<T: Copy> RangeIndex<T> {
    pub fn lookup(&self, address: u64) -> Option<T> {
        self.entry(address).map(|e| e.value)
    }

    pub fn entry(&self, address: u64) -> Option<&RangeEntry<T>> {
        let idx = self.entries.partition_point(|e| e.start <= address);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        (address < entry.end).then_some(entry)
    }

    pub fn entries(&self) -> &[RangeEntry<T>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
