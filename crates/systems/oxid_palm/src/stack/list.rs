// crates/systems/oxid_palm/src/stack/list.rs
use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// One contiguous stack. `bottom <= top`; the stack grows down from `top`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackRange {
    pub bottom: u32,
    pub top: u32,
    /// Deepest SP seen while this stack was current.
    pub low_water_mark: u32,
}

impl StackRange {
    pub fn new(bottom: u32, top: u32) -> Self {
        debug_assert!(bottom <= top);
        Self {
            bottom,
            top,
            low_water_mark: top,
        }
    }

    pub fn size(&self) -> u32 {
        self.top - self.bottom
    }

    /// SP values inside the stack, the empty-stack position `top` included.
    pub fn contains(&self, sp: u32) -> bool {
        (self.bottom..=self.top).contains(&sp)
    }

    pub fn overlaps(&self, other: &StackRange) -> bool {
        self.bottom < other.top && other.bottom < self.top
    }

    fn overlaps_range(&self, range: &Range<u32>) -> bool {
        self.bottom < range.end && range.start < self.top
    }
}

impl fmt::Debug for StackRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:08X}..{:08X} lwm {:08X}]",
            self.bottom, self.top, self.low_water_mark
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stack {new:?} overlaps tracked stack {existing:?}")]
pub struct OverlappingStack {
    pub new: StackRange,
    pub existing: StackRange,
}

/// Unordered set of non-overlapping stacks, looked up by containment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackList {
    ranges: Vec<StackRange>,
}

impl StackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackRange> {
        self.ranges.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut StackRange> {
        self.ranges.iter_mut()
    }

    pub fn find(&self, sp: u32) -> Option<StackRange> {
        self.ranges.iter().find(|r| r.contains(sp)).copied()
    }

    pub fn insert(&mut self, range: StackRange) -> Result<(), OverlappingStack> {
        if let Some(existing) = self.ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(OverlappingStack {
                new: range,
                existing: *existing,
            });
        }
        self.ranges.push(range);
        Ok(())
    }

    /// Removes the range with the same bounds, if tracked.
    pub fn remove(&mut self, range: StackRange) -> Option<StackRange> {
        let idx = self
            .ranges
            .iter()
            .position(|r| r.bottom == range.bottom && r.top == range.top)?;
        Some(self.ranges.swap_remove(idx))
    }

    pub fn remove_overlapping(&mut self, range: Range<u32>) -> Vec<StackRange> {
        let mut removed = Vec::new();
        self.ranges.retain(|r| {
            if r.overlaps_range(&range) {
                removed.push(*r);
                false
            } else {
                true
            }
        });
        removed
    }
}
