// crates/systems/oxid_palm/src/heap.rs
//! Read-mostly model of the memory manager's heaps, kept in sync by the
//! memory manager patches and consumed by the stack tracker, the access
//! classifier and the system-code cache.

use std::ops::Range;

use crate::memory::{MetaBits, MetadataShadow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: Range<u32>,
    pub body: Range<u32>,
    pub trailer: Option<Range<u32>>,
    pub free: bool,
    /// 0 = unlocked
    pub lock_count: u8,
}

impl Chunk {
    /// Lays out header, body and optional trailer back to back from `start`.
    pub fn new(start: u32, header_len: u32, body_len: u32, trailer_len: u32) -> Self {
        let body_start = start + header_len;
        let body_end = body_start + body_len;
        Self {
            header: start..body_start,
            body: body_start..body_end,
            trailer: (trailer_len > 0).then(|| body_end..body_end + trailer_len),
            free: false,
            lock_count: 1,
        }
    }

    pub fn free(mut self) -> Self {
        self.free = true;
        self.lock_count = 0;
        self
    }

    pub fn locked(mut self, count: u8) -> Self {
        self.lock_count = count;
        self
    }

    pub fn range(&self) -> Range<u32> {
        let end = self.trailer.as_ref().map_or(self.body.end, |t| t.end);
        self.header.start..end
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.range().contains(&addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heap {
    pub id: u16,
    pub header: Range<u32>,
    pub master_pointer_tables: Vec<Range<u32>>,
    pub chunks: Vec<Chunk>,
}

impl Heap {
    pub fn new(id: u16, header: Range<u32>) -> Self {
        Self {
            id,
            header,
            master_pointer_tables: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn with_master_pointer_table(mut self, table: Range<u32>) -> Self {
        self.master_pointer_tables.push(table);
        self
    }

    pub fn with_chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    pub fn range(&self) -> Range<u32> {
        let end = self
            .chunks
            .iter()
            .map(|c| c.range().end)
            .chain(self.master_pointer_tables.iter().map(|t| t.end))
            .fold(self.header.end, u32::max);
        self.header.start..end
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.range().contains(&addr)
    }

    pub fn chunk_containing(&self, addr: u32) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.contains(addr))
    }
}

/// Reported when a lock count change makes a chunk movable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUnlocked {
    pub body: Range<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct HeapModel {
    heaps: Vec<Heap>,
}

impl HeapModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces (by id) a heap.
    pub fn insert_heap(&mut self, heap: Heap) {
        match self.heaps.iter_mut().find(|h| h.id == heap.id) {
            Some(slot) => *slot = heap,
            None => self.heaps.push(heap),
        }
    }

    pub fn heaps(&self) -> impl Iterator<Item = &Heap> {
        self.heaps.iter()
    }

    pub fn heap_by_id(&self, id: u16) -> Option<&Heap> {
        self.heaps.iter().find(|h| h.id == id)
    }

    pub fn heap_containing(&self, addr: u32) -> Option<&Heap> {
        self.heaps.iter().find(|h| h.contains(addr))
    }

    pub fn chunk_containing(&self, addr: u32) -> Option<(&Heap, &Chunk)> {
        let heap = self.heap_containing(addr)?;
        heap.chunk_containing(addr).map(|c| (heap, c))
    }

    fn chunk_by_body_mut(&mut self, body_start: u32) -> Option<&mut Chunk> {
        self.heaps
            .iter_mut()
            .flat_map(|h| h.chunks.iter_mut())
            .find(|c| c.body.start == body_start)
    }

    pub fn set_lock_count(&mut self, body_start: u32, count: u8) -> Option<ChunkUnlocked> {
        let chunk = self.chunk_by_body_mut(body_start)?;
        let was_locked = chunk.lock_count > 0;
        chunk.lock_count = count;
        (was_locked && count == 0).then(|| ChunkUnlocked {
            body: chunk.body.clone(),
        })
    }

    /// Marks a chunk free and returns its whole range so dependants can
    /// forget it.
    pub fn free_chunk(&mut self, body_start: u32) -> Option<Range<u32>> {
        let chunk = self.chunk_by_body_mut(body_start)?;
        chunk.free = true;
        chunk.lock_count = 0;
        Some(chunk.range())
    }

    /// Rewrites the heap-related shadow bits from the model.
    pub fn mark_shadow(&self, shadow: &mut MetadataShadow) {
        let heap_bits = MetaBits::CHUNK_HEADER
            | MetaBits::CHUNK_TRAILER
            | MetaBits::FREE_CHUNK
            | MetaBits::UNLOCKED_CHUNK
            | MetaBits::MEM_MGR;
        for heap in &self.heaps {
            shadow.unmark_range(heap.range(), heap_bits);
            shadow.mark_range(heap.header.clone(), MetaBits::MEM_MGR);
            for table in &heap.master_pointer_tables {
                shadow.mark_range(table.clone(), MetaBits::MEM_MGR);
            }
            for chunk in &heap.chunks {
                shadow.mark_range(chunk.header.clone(), MetaBits::CHUNK_HEADER);
                if let Some(trailer) = &chunk.trailer {
                    shadow.mark_range(trailer.clone(), MetaBits::CHUNK_TRAILER);
                }
                if chunk.free {
                    shadow.mark_range(chunk.body.clone(), MetaBits::FREE_CHUNK);
                } else if chunk.lock_count == 0 {
                    shadow.mark_range(chunk.body.clone(), MetaBits::UNLOCKED_CHUNK);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> HeapModel {
        let mut model = HeapModel::new();
        model.insert_heap(
            Heap::new(0, 0x1000..0x1020)
                .with_master_pointer_table(0x1020..0x1040)
                .with_chunk(Chunk::new(0x1040, 8, 0x40, 0))
                .with_chunk(Chunk::new(0x1088, 8, 0x20, 4).locked(0))
                .with_chunk(Chunk::new(0x10B4, 8, 0x10, 0).free()),
        );
        model
    }

    #[test]
    fn test_chunk_partitions_its_range() {
        let chunk = Chunk::new(0x2000, 8, 0x30, 4);
        assert_eq!(chunk.header, 0x2000..0x2008);
        assert_eq!(chunk.body, 0x2008..0x2038);
        assert_eq!(chunk.trailer, Some(0x2038..0x203C));
        assert_eq!(chunk.range(), 0x2000..0x203C);
    }

    #[test]
    fn test_lookup_by_id_and_pointer() {
        let model = model();
        assert_eq!(model.heap_by_id(0).map(|h| h.range()), Some(0x1000..0x10CC));
        assert!(model.heap_by_id(1).is_none());
        let (_, chunk) = model.chunk_containing(0x1090).unwrap();
        assert_eq!(chunk.body.start, 0x1090);
        assert!(model.chunk_containing(0x1010).is_none());
        assert!(model.heap_containing(0x5000).is_none());
    }

    #[test]
    fn test_unlock_is_reported_only_on_transition() {
        let mut model = model();
        assert_eq!(
            model.set_lock_count(0x1048, 0),
            Some(ChunkUnlocked { body: 0x1048..0x1088 })
        );
        assert_eq!(model.set_lock_count(0x1048, 0), None);
        assert_eq!(model.set_lock_count(0x1048, 2), None);
        assert_eq!(model.set_lock_count(0xDEAD, 0), None);
    }

    #[test]
    fn test_shadow_marks() {
        let model = model();
        let mut shadow = MetadataShadow::new(0, 0x2000);
        model.mark_shadow(&mut shadow);
        assert_eq!(shadow.get(0x1000), MetaBits::MEM_MGR);
        assert_eq!(shadow.get(0x1030), MetaBits::MEM_MGR);
        assert_eq!(shadow.get(0x1040), MetaBits::CHUNK_HEADER);
        assert_eq!(shadow.get(0x1050), MetaBits::empty());
        assert_eq!(shadow.get(0x1090), MetaBits::UNLOCKED_CHUNK);
        assert_eq!(shadow.get(0x10B0), MetaBits::CHUNK_TRAILER);
        assert_eq!(shadow.get(0x10BC), MetaBits::FREE_CHUNK);
    }
}
