// crates/systems/oxid_palm/src/symbols.rs
//! Function identity for a PC: explicit symbol ranges, the MacsBug names
//! the Palm compilers append after every function, and A6 frame chains.

use std::ops::Range;

use oxide_core::MemoryBus;

use crate::memory::ChecksSuspended;
use crate::stack::StackRange;

pub trait SymbolResolver {
    fn function_at(&self, bus: &dyn MemoryBus, pc: u32) -> Option<String>;
}

/// Resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn function_at(&self, _bus: &dyn MemoryBus, _pc: u32) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<(Range<u32>, String)>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: Range<u32>, name: &str) {
        self.entries.push((range, name.to_string()));
    }

    pub fn lookup(&self, pc: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains(&pc))
            .map(|(_, n)| n.as_str())
    }
}

impl SymbolResolver for SymbolTable {
    fn function_at(&self, _bus: &dyn MemoryBus, pc: u32) -> Option<String> {
        self.lookup(pc).map(str::to_string)
    }
}

const RTS: u16 = 0x4E75;
const RTE: u16 = 0x4E73;
const JMP_A0: u16 = 0x4ED0;
const MAX_NAME: usize = 64;

/// Scans forward from the PC for the function's terminating instruction
/// and decodes the MacsBug name that follows it.
#[derive(Debug, Clone, Copy)]
pub struct MacsBugNames {
    pub max_scan: u32,
}

impl Default for MacsBugNames {
    fn default() -> Self {
        Self { max_scan: 0x8000 }
    }
}

impl MacsBugNames {
    fn name_after(bus: &dyn MemoryBus, addr: u32) -> Option<String> {
        let first = bus.read(addr);
        let (start, len) = match first {
            0x80 => (addr.wrapping_add(2), bus.read(addr.wrapping_add(1)) as usize),
            0x81..=0x9F => (addr.wrapping_add(1), (first & 0x7F) as usize),
            // fixed eight character form, first byte may carry bit 7
            0x20..=0x7F | 0xA0..=0xFF => (addr, 8),
            _ => return None,
        };
        if len == 0 || len > MAX_NAME {
            return None;
        }
        let mut name = String::with_capacity(len);
        for i in 0..len as u32 {
            let c = bus.read(start.wrapping_add(i)) & 0x7F;
            if !(c.is_ascii_alphanumeric() || matches!(c, b'_' | b'%' | b'.' | b' ')) {
                return None;
            }
            name.push(c as char);
        }
        let name = name.trim_end().to_string();
        (!name.is_empty()).then_some(name)
    }
}

impl SymbolResolver for MacsBugNames {
    fn function_at(&self, bus: &dyn MemoryBus, pc: u32) -> Option<String> {
        let guard = ChecksSuspended::new(bus);
        let bus = guard.bus();
        let mut addr = pc & !1;
        let end = addr.saturating_add(self.max_scan);
        while addr < end && bus.valid_address(addr, 2) {
            match bus.read_u16(addr) {
                RTS | RTE | JMP_A0 => return Self::name_after(bus, addr.checked_add(2)?),
                _ => addr = addr.checked_add(2)?,
            }
        }
        None
    }
}

/// Tries each resolver in turn.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn SymbolResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R: SymbolResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl SymbolResolver for ResolverChain {
    fn function_at(&self, bus: &dyn MemoryBus, pc: u32) -> Option<String> {
        self.resolvers.iter().find_map(|r| r.function_at(bus, pc))
    }
}

const MAX_FRAMES: usize = 64;

/// Return addresses found by following LINK frames from `a6`, innermost
/// first. Stops at the first frame outside `stack`.
pub fn call_chain(bus: &dyn MemoryBus, a6: u32, stack: Option<StackRange>) -> Vec<u32> {
    let Some(stack) = stack else {
        return Vec::new();
    };
    let guard = ChecksSuspended::new(bus);
    let bus = guard.bus();
    let mut chain = Vec::new();
    let mut frame = a6;
    while chain.len() < MAX_FRAMES
        && frame & 1 == 0
        && frame >= stack.bottom
        && frame.saturating_add(8) <= stack.top
    {
        chain.push(bus.read_u32(frame + 4));
        let caller = bus.read_u32(frame);
        // frames only ever get shallower
        if caller <= frame {
            break;
        }
        frame = caller;
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PalmMemory, ROM_BASE};
    use oxide_core::Rom;

    fn rom_with(code: &[u8]) -> PalmMemory {
        let mut rom = Rom::new_empty(0x1000);
        rom.data[..code.len()].copy_from_slice(code);
        PalmMemory::new(0x1_0000, 0x1_0000, rom)
    }

    #[test]
    fn test_table_lookup() {
        let mut table = SymbolTable::new();
        table.insert(0x1000..0x1100, "FrmDrawForm");
        let bus = rom_with(&[]);
        assert_eq!(table.function_at(&bus, 0x10FE).as_deref(), Some("FrmDrawForm"));
        assert_eq!(table.function_at(&bus, 0x1100), None);
    }

    #[test]
    fn test_variable_length_macsbug_name() {
        // NOP; NOP; RTS; 0x8A "MemPtrFree"
        let mut code = vec![0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x75, 0x8A];
        code.extend_from_slice(b"MemPtrFree");
        let bus = rom_with(&code);
        let names = MacsBugNames::default();
        assert_eq!(names.function_at(&bus, ROM_BASE).as_deref(), Some("MemPtrFree"));
    }

    #[test]
    fn test_long_and_fixed_forms() {
        let mut code = vec![0x4E, 0xD0, 0x80, 0x06];
        code.extend_from_slice(b"DmOpen");
        code.extend_from_slice(&[0x4E, 0x73]);
        code.extend_from_slice(b"SysTrap ");
        let bus = rom_with(&code);
        let names = MacsBugNames::default();
        assert_eq!(names.function_at(&bus, ROM_BASE).as_deref(), Some("DmOpen"));
        assert_eq!(names.function_at(&bus, ROM_BASE + 10).as_deref(), Some("SysTrap"));
    }

    #[test]
    fn test_garbage_after_rts_is_not_a_name() {
        let bus = rom_with(&[0x4E, 0x75, 0x85, 0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(MacsBugNames::default().function_at(&bus, ROM_BASE), None);
    }

    #[test]
    fn test_chain_tries_in_order() {
        let mut table = SymbolTable::new();
        table.insert(ROM_BASE..ROM_BASE + 4, "Override");
        let mut code = vec![0x4E, 0x75, 0x83];
        code.extend_from_slice(b"Foo");
        let bus = rom_with(&code);
        let chain = ResolverChain::new().with(table).with(MacsBugNames::default());
        assert_eq!(chain.function_at(&bus, ROM_BASE).as_deref(), Some("Override"));
        assert_eq!(NoSymbols.function_at(&bus, ROM_BASE), None);
    }

    #[test]
    fn test_call_chain_follows_frames() {
        let mut bus = rom_with(&[]);
        let stack = StackRange::new(0x2000, 0x3000);
        // innermost frame at 0x2100 -> 0x2200 -> 0x2300 -> end (saved A6 = 0)
        bus.write_u32(0x2100, 0x2200);
        bus.write_u32(0x2104, 0x1111_0000);
        bus.write_u32(0x2200, 0x2300);
        bus.write_u32(0x2204, 0x2222_0000);
        bus.write_u32(0x2300, 0);
        bus.write_u32(0x2304, 0x3333_0000);
        let chain = call_chain(&bus, 0x2100, Some(stack));
        assert_eq!(chain, vec![0x1111_0000, 0x2222_0000, 0x3333_0000]);
        assert!(call_chain(&bus, 0x2100, None).is_empty());
        assert!(call_chain(&bus, 0x5000, Some(stack)).is_empty());
    }
}
