// crates/systems/oxid_palm/src/memory/meta.rs
//! One metadata byte per emulated RAM byte, flagging regions that are
//! interesting to the access classifier.

use bitflags::bitflags;
use std::ops::Range;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaBits: u8 {
        const CHUNK_HEADER   = 1 << 0;
        const CHUNK_TRAILER  = 1 << 1;
        const FREE_CHUNK     = 1 << 2;
        const UNLOCKED_CHUNK = 1 << 3;
        /// Heap headers and master pointer tables
        const MEM_MGR        = 1 << 4;
        const LOW_MEMORY     = 1 << 5;
        const SYSTEM_GLOBAL  = 1 << 6;
        const SCREEN         = 1 << 7;
    }
}

/// Ranges shorter than this are updated a byte at a time.
const BULK_THRESHOLD: u32 = 12;

#[derive(Debug, Clone)]
pub struct MetadataShadow {
    base: u32,
    bytes: Vec<u8>,
}

impl MetadataShadow {
    pub fn new(base: u32, len: u32) -> Self {
        Self {
            base,
            bytes: vec![0; len as usize],
        }
    }

    /// Emulated addresses covered by the shadow.
    pub fn window(&self) -> Range<u32> {
        self.base..self.base.saturating_add(self.bytes.len() as u32)
    }

    pub fn get(&self, addr: u32) -> MetaBits {
        match addr.checked_sub(self.base) {
            Some(off) if (off as usize) < self.bytes.len() => {
                MetaBits::from_bits_retain(self.bytes[off as usize])
            }
            _ => MetaBits::empty(),
        }
    }

    /// Union of the bits over `[addr, addr + size)`.
    pub fn bits_in(&self, addr: u32, size: u32) -> MetaBits {
        let Some((lo, hi)) = self.clamp(addr..addr.saturating_add(size)) else {
            return MetaBits::empty();
        };
        let acc = self.bytes[lo..hi].iter().fold(0u8, |acc, b| acc | b);
        MetaBits::from_bits_retain(acc)
    }

    pub fn mark_range(&mut self, range: Range<u32>, bits: MetaBits) {
        self.mark_unmark_range(range, bits, MetaBits::empty());
    }

    pub fn unmark_range(&mut self, range: Range<u32>, bits: MetaBits) {
        self.mark_unmark_range(range, MetaBits::empty(), bits);
    }

    /// Clears `unmark` then sets `mark` over the part of `range` that lies
    /// inside the window; the rest is ignored.
    pub fn mark_unmark_range(&mut self, range: Range<u32>, mark: MetaBits, unmark: MetaBits) {
        let Some((lo, hi)) = self.clamp(range) else {
            return;
        };
        let and = !unmark.bits();
        let or = mark.bits();
        if ((hi - lo) as u32) < BULK_THRESHOLD {
            apply_bytewise(&mut self.bytes[lo..hi], and, or);
        } else {
            let head = ((4 - ((self.base as usize + lo) & 3)) & 3).min(hi - lo);
            apply_bulk(&mut self.bytes[lo..hi], head, and, or);
        }
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    fn clamp(&self, range: Range<u32>) -> Option<(usize, usize)> {
        let window = self.window();
        let start = range.start.max(window.start);
        let end = range.end.min(window.end);
        if start >= end {
            return None;
        }
        Some(((start - self.base) as usize, (end - self.base) as usize))
    }
}

fn apply_bytewise(bytes: &mut [u8], and: u8, or: u8) {
    for b in bytes {
        *b = (*b & and) | or;
    }
}

fn apply_bulk(bytes: &mut [u8], head: usize, and: u8, or: u8) {
    let (lead, rest) = bytes.split_at_mut(head);
    apply_bytewise(lead, and, or);

    let and32 = u32::from_ne_bytes([and; 4]);
    let or32 = u32::from_ne_bytes([or; 4]);
    let mut words = rest.chunks_exact_mut(4);
    for word in &mut words {
        let v = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
        word.copy_from_slice(&((v & and32) | or32).to_ne_bytes());
    }
    apply_bytewise(words.into_remainder(), and, or);
}
