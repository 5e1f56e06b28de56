// crates/systems/oxid_palm/src/syscode.rs
//! Remembers which RAM code chunks belong to the system (extensions,
//! shared libraries, panels, patches) and which to applications.

use std::ops::Range;

use oxide_core::MemoryBus;

use crate::config::LowMemLayout;
use crate::heap::HeapModel;
use crate::lowmem::LowMem;
use crate::memory::ChecksSuspended;

pub const STORE_SIGNATURE: u32 = 0xFEED_FACE;
const STORE_DIR_ID: u32 = 60;

const DB_ATTRIBUTES: u32 = 32;
const DB_ATTR_RESOURCE: u16 = 0x0001;
const DB_TYPE: u32 = 60;
const DB_CREATOR: u32 = 64;
const DB_RESOURCE_LIST: u32 = 72;

// list header: next@0, count@4, entries@6
const LIST_COUNT: u32 = 4;
const LIST_ENTRIES: u32 = 6;
const DIR_ENTRY_SIZE: u32 = 4;
const RSRC_ENTRY_SIZE: u32 = 10;
const RSRC_LOCAL_ID: u32 = 6;

const MAX_LISTS: usize = 64;

pub const fn four_cc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

/// Type/creator pairs that mark system code.
pub fn is_system_database(db_type: u32, creator: u32) -> bool {
    const LOWERCASE_TYPES: [u32; 4] = [
        four_cc(b"extn"),
        four_cc(b"libr"),
        four_cc(b"panl"),
        four_cc(b"ptch"),
    ];
    const PARTNERS: [(u32, u32); 2] = [
        (four_cc(b"extn"), four_cc(b"HsEx")),
        (four_cc(b"libr"), four_cc(b"HsSL")),
    ];
    let lowercase = creator.to_be_bytes().iter().all(u8::is_ascii_lowercase);
    (LOWERCASE_TYPES.contains(&db_type) && lowercase)
        || (db_type == four_cc(b"appl") && creator == four_cc(b"psys"))
        || PARTNERS.contains(&(db_type, creator))
}

/// Card-relative local ID to a bus address. Odd IDs are handles.
fn local_to_ptr(bus: &dyn MemoryBus, card_base: u32, id: u32) -> Option<u32> {
    if id == 0 {
        return None;
    }
    let addr = card_base.wrapping_add(id & !1);
    if id & 1 == 0 {
        return Some(addr);
    }
    let ptr = bus.read_u32(addr);
    (ptr != 0).then_some(ptr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedChunk {
    pub body: Range<u32>,
    pub system: bool,
}

impl TaggedChunk {
    fn contains(&self, addr: u32) -> bool {
        self.body.contains(&addr)
    }
}

#[derive(Debug, Clone)]
pub struct SystemCodeCache {
    layout: LowMemLayout,
    last: Option<TaggedChunk>,
    chunks: Vec<TaggedChunk>,
    walks: u32,
}

impl SystemCodeCache {
    pub fn new(layout: LowMemLayout) -> Self {
        Self {
            layout,
            last: None,
            chunks: Vec::new(),
            walks: 0,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.chunks.clear();
        self.walks = 0;
    }

    pub fn chunks(&self) -> &[TaggedChunk] {
        &self.chunks
    }

    /// Directory walks performed so far.
    pub fn directory_walks(&self) -> u32 {
        self.walks
    }

    pub fn is_system_code(&mut self, bus: &dyn MemoryBus, heaps: &HeapModel, pc: u32) -> bool {
        if let Some(last) = self.last.as_ref().filter(|c| c.contains(pc)) {
            return last.system;
        }
        if let Some(hit) = self.chunks.iter().find(|c| c.contains(pc)) {
            let system = hit.system;
            self.last = Some(hit.clone());
            return system;
        }

        self.walks += 1;
        let found = find_resource_chunk(bus, heaps, &self.layout, pc).or_else(|| {
            // Not in any resource; remember the chunk as application code.
            heaps
                .chunk_containing(pc)
                .map(|(_, c)| (c.body.clone(), false))
        });
        let Some((body, system)) = found else {
            return false;
        };
        tracing::debug!(
            target: "oxid_palm::syscode",
            start = format_args!("{:#010X}", body.start),
            end = format_args!("{:#010X}", body.end),
            system,
            "tagged code chunk"
        );
        let tagged = TaggedChunk { body, system };
        self.chunks.push(tagged.clone());
        self.last = Some(tagged);
        system
    }

    /// An unlocked chunk may move, so its tag no longer applies.
    pub fn on_chunk_unlocked(&mut self, body: &Range<u32>) {
        let overlaps = |c: &TaggedChunk| c.body.start < body.end && body.start < c.body.end;
        self.chunks.retain(|c| !overlaps(c));
        if self.last.as_ref().is_some_and(overlaps) {
            self.last = None;
        }
    }
}

/// Finds the resource chunk holding `pc` by walking the RAM store's
/// database directory.
fn find_resource_chunk(
    bus: &dyn MemoryBus,
    heaps: &HeapModel,
    layout: &LowMemLayout,
    pc: u32,
) -> Option<(Range<u32>, bool)> {
    let guard = ChecksSuspended::new(bus);
    let bus = guard.bus();
    let (store, card) = {
        let low = LowMem::new(bus, layout);
        (low.ram_store(), low.card0_base())
    };
    if store == 0 || bus.read_u32(store) != STORE_SIGNATURE {
        return None;
    }

    let mut dir = local_to_ptr(bus, card, bus.read_u32(store.checked_add(STORE_DIR_ID)?));
    for _ in 0..MAX_LISTS {
        let Some(list) = dir else { break };
        let count = bus.read_u16(list.checked_add(LIST_COUNT)?) as u32;
        for i in 0..count {
            let id = bus.read_u32(list.checked_add(LIST_ENTRIES + i * DIR_ENTRY_SIZE)?);
            let Some(db) = local_to_ptr(bus, card, id) else {
                continue;
            };
            let Some(resources) = db.checked_add(DB_RESOURCE_LIST) else {
                continue;
            };
            if bus.read_u16(db + DB_ATTRIBUTES) & DB_ATTR_RESOURCE == 0 {
                continue;
            }
            if let Some(body) = resource_containing(bus, heaps, card, resources, pc) {
                let system = is_system_database(bus.read_u32(db + DB_TYPE), bus.read_u32(db + DB_CREATOR));
                return Some((body, system));
            }
        }
        dir = local_to_ptr(bus, card, bus.read_u32(list));
    }
    None
}

fn resource_containing(
    bus: &dyn MemoryBus,
    heaps: &HeapModel,
    card: u32,
    first_list: u32,
    pc: u32,
) -> Option<Range<u32>> {
    let mut list = Some(first_list);
    for _ in 0..MAX_LISTS {
        let header = list?;
        let count = bus.read_u16(header.checked_add(LIST_COUNT)?) as u32;
        for i in 0..count {
            let entry = header.checked_add(LIST_ENTRIES + i * RSRC_ENTRY_SIZE + RSRC_LOCAL_ID)?;
            let Some(ptr) = local_to_ptr(bus, card, bus.read_u32(entry)) else {
                continue;
            };
            if let Some((_, chunk)) = heaps.chunk_containing(ptr) {
                if chunk.body.contains(&pc) {
                    return Some(chunk.body.clone());
                }
            }
        }
        list = local_to_ptr(bus, card, bus.read_u32(header));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_tags() {
        assert!(is_system_database(four_cc(b"libr"), four_cc(b"netl")));
        assert!(is_system_database(four_cc(b"extn"), four_cc(b"HsEx")));
        assert!(is_system_database(four_cc(b"libr"), four_cc(b"HsSL")));
        assert!(is_system_database(four_cc(b"appl"), four_cc(b"psys")));
        assert!(!is_system_database(four_cc(b"libr"), four_cc(b"NetL")));
        assert!(!is_system_database(four_cc(b"appl"), four_cc(b"memo")));
        assert!(!is_system_database(four_cc(b"extn"), four_cc(b"HsSL")));
        assert!(!is_system_database(four_cc(b"DATA"), four_cc(b"abcd")));
    }

    #[test]
    fn test_directory_near_top_of_memory_ends_the_walk() {
        use crate::config::LowMemLayout;
        use crate::heap::{Chunk, Heap};
        use crate::memory::PalmMemory;
        use oxide_core::Rom;

        let layout = LowMemLayout::default();
        let mut bus = PalmMemory::new(0x1_0000, 0x1_0000, Rom::new_empty(0x100));
        bus.write_u32(layout.card0_ram_store_p, 0x2000);
        bus.write_u32(0x2000, STORE_SIGNATURE);
        bus.write_u32(0x2000 + STORE_DIR_ID, 0xFFFF_FFFE);
        let mut heaps = HeapModel::new();
        heaps.insert_heap(Heap::new(1, 0x4FE0..0x5000).with_chunk(Chunk::new(0x5000, 8, 0xF8, 0)));

        let mut cache = SystemCodeCache::new(layout);
        assert!(!cache.is_system_code(&bus, &heaps, 0x5010));
        assert_eq!(cache.directory_walks(), 1);
        assert_eq!(cache.chunks().len(), 1);
    }
}
