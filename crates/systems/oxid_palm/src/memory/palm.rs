// crates/systems/oxid_palm/src/memory/palm.rs
use std::cell::{Cell, RefCell};
use std::ops::Range;

use oxide_core::{BankKind, MemoryBus, Rom};

use super::meta::{MetaBits, MetadataShadow};

// Palm Memory Map (DragonBall)
// $00000000 - RAM end:    DRAM (dynamic heap) then SRAM (storage heap)
// $10C00000 - ROM end:    ROM / Flash (Read Only)
// $FFFFF000 - $FFFFFFFF:  DragonBall registers
// Host-mapped regions:    wherever the host places them
// Everything else -> unmapped, reads float high
pub const ROM_BASE: u32 = 0x10C0_0000;
pub const REGS_BASE: u32 = 0xFFFF_F000;
const REGS_SIZE: usize = 0x1000;
const BANK_SHIFT: u32 = 16;
const BANK_COUNT: usize = 1 << 16;

/// A RAM access that hit flagged metadata while checks were live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessAttempt {
    pub address: u32,
    pub size: u32,
    pub for_read: bool,
}

struct MappedRegion {
    base: u32,
    data: Vec<u8>,
}

impl MappedRegion {
    fn contains(&self, addr: u32, size: u32) -> bool {
        addr >= self.base && (addr - self.base) as u64 + size as u64 <= self.data.len() as u64
    }
}

pub struct PalmMemory {
    ram: Vec<u8>,
    dynamic_end: u32,
    rom: Vec<u8>,
    rom_base: u32,
    rom_kind: BankKind,
    regs: Vec<u8>,
    mapped: Vec<MappedRegion>,
    banks: Vec<BankKind>,
    meta: MetadataShadow,
    check_mask: MetaBits,
    suspended: Cell<u32>,
    pending: RefCell<Vec<AccessAttempt>>,
}

impl PalmMemory {
    /// `dynamic_end` splits RAM into DRAM (below) and SRAM (above).
    pub fn new(ram_size: u32, dynamic_end: u32, rom: Rom) -> Self {
        let mut mem = Self {
            ram: vec![0; ram_size as usize],
            dynamic_end: dynamic_end.min(ram_size),
            rom: rom.data,
            rom_base: ROM_BASE,
            rom_kind: BankKind::Rom,
            regs: vec![0; REGS_SIZE],
            mapped: Vec::new(),
            banks: vec![BankKind::Unmapped; BANK_COUNT],
            meta: MetadataShadow::new(0, ram_size),
            check_mask: MetaBits::empty(),
            suspended: Cell::new(0),
            pending: RefCell::new(Vec::new()),
        };
        mem.rebuild_banks();
        mem
    }

    pub fn with_rom_base(mut self, base: u32) -> Self {
        self.rom_base = base;
        self.rebuild_banks();
        self
    }

    pub fn with_flash(mut self) -> Self {
        self.rom_kind = BankKind::Flash;
        self.rebuild_banks();
        self
    }

    /// Maps host memory at `base`. Later regions win on bank overlap.
    pub fn map_region(&mut self, base: u32, data: Vec<u8>) {
        self.mapped.push(MappedRegion { base, data });
        self.rebuild_banks();
    }

    fn rebuild_banks(&mut self) {
        self.banks.fill(BankKind::Unmapped);
        let ram_len = self.ram.len() as u64;
        for bank in 0..banks_below(ram_len) {
            let start = (bank as u32) << BANK_SHIFT;
            self.banks[bank] = if start < self.dynamic_end {
                BankKind::Dram
            } else {
                BankKind::Sram
            };
        }
        let first = (self.rom_base >> BANK_SHIFT) as usize;
        let rom_end = self.rom_base as u64 + self.rom.len() as u64;
        for bank in first..banks_below(rom_end).min(BANK_COUNT) {
            self.banks[bank] = self.rom_kind;
        }
        for region in &self.mapped {
            let first = (region.base >> BANK_SHIFT) as usize;
            let end = banks_below(region.base as u64 + region.data.len() as u64).min(BANK_COUNT);
            for bank in first..end {
                self.banks[bank] = BankKind::Mapped;
            }
        }
        self.banks[(REGS_BASE >> BANK_SHIFT) as usize] = BankKind::Registers;
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    pub fn dynamic_end(&self) -> u32 {
        self.dynamic_end
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn rom_range(&self) -> Range<u32> {
        self.rom_base..self.rom_base.wrapping_add(self.rom.len() as u32)
    }

    pub fn meta(&self) -> &MetadataShadow {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetadataShadow {
        &mut self.meta
    }

    /// Bits that make a RAM access worth recording. Empty disables
    /// recording altogether.
    pub fn set_check_mask(&mut self, mask: MetaBits) {
        self.check_mask = mask;
    }

    pub fn take_access_attempts(&self) -> Vec<AccessAttempt> {
        self.pending.take()
    }

    fn record(&self, addr: u32, size: u32, for_read: bool) {
        if self.check_mask.is_empty() || self.suspended.get() > 0 {
            return;
        }
        if !matches!(self.bank(addr), BankKind::Dram | BankKind::Sram) {
            return;
        }
        if self.meta.bits_in(addr, size).intersects(self.check_mask) {
            self.pending.borrow_mut().push(AccessAttempt {
                address: addr,
                size,
                for_read,
            });
        }
    }

    #[inline]
    fn bank(&self, addr: u32) -> BankKind {
        self.banks[(addr >> BANK_SHIFT) as usize]
    }

    fn raw_read(&self, addr: u32) -> u8 {
        match self.bank(addr) {
            BankKind::Dram | BankKind::Sram => self.ram.get(addr as usize).copied().unwrap_or(0xFF),
            BankKind::Rom | BankKind::Flash => addr
                .checked_sub(self.rom_base)
                .and_then(|off| self.rom.get(off as usize))
                .copied()
                .unwrap_or(0xFF),
            BankKind::Registers => addr
                .checked_sub(REGS_BASE)
                .map(|off| self.regs[off as usize])
                .unwrap_or(0xFF),
            BankKind::Mapped => self
                .mapped
                .iter()
                .rev()
                .find(|r| r.contains(addr, 1))
                .map(|r| r.data[(addr - r.base) as usize])
                .unwrap_or(0xFF),
            BankKind::Unmapped => 0xFF,
        }
    }

    fn raw_write(&mut self, addr: u32, val: u8) {
        match self.bank(addr) {
            BankKind::Dram | BankKind::Sram => {
                if let Some(b) = self.ram.get_mut(addr as usize) {
                    *b = val;
                }
            }
            // ROM is read only; flash programming is not emulated.
            BankKind::Rom | BankKind::Flash => {}
            BankKind::Registers => {
                if let Some(off) = addr.checked_sub(REGS_BASE) {
                    self.regs[off as usize] = val;
                }
            }
            BankKind::Mapped => {
                if let Some(r) = self.mapped.iter_mut().rev().find(|r| r.contains(addr, 1)) {
                    r.data[(addr - r.base) as usize] = val;
                }
            }
            BankKind::Unmapped => {}
        }
    }
}

/// Number of banks needed to cover `[0, end)`.
fn banks_below(end: u64) -> usize {
    end.div_ceil(1 << BANK_SHIFT) as usize
}

impl MemoryBus for PalmMemory {
    fn read(&self, addr: u32) -> u8 {
        self.record(addr, 1, true);
        self.raw_read(addr)
    }

    fn write(&mut self, addr: u32, val: u8) {
        self.record(addr, 1, false);
        self.raw_write(addr, val);
    }

    fn read_u16(&self, addr: u32) -> u16 {
        self.record(addr, 2, true);
        u16::from_be_bytes([self.raw_read(addr), self.raw_read(addr.wrapping_add(1))])
    }

    fn read_u32(&self, addr: u32) -> u32 {
        self.record(addr, 4, true);
        u32::from_be_bytes([
            self.raw_read(addr),
            self.raw_read(addr.wrapping_add(1)),
            self.raw_read(addr.wrapping_add(2)),
            self.raw_read(addr.wrapping_add(3)),
        ])
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.record(addr, 2, false);
        for (i, b) in val.to_be_bytes().into_iter().enumerate() {
            self.raw_write(addr.wrapping_add(i as u32), b);
        }
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.record(addr, 4, false);
        for (i, b) in val.to_be_bytes().into_iter().enumerate() {
            self.raw_write(addr.wrapping_add(i as u32), b);
        }
    }

    fn bank_kind(&self, addr: u32) -> BankKind {
        self.bank(addr)
    }

    fn valid_address(&self, addr: u32, size: u32) -> bool {
        let end = addr as u64 + size as u64;
        match self.bank(addr) {
            BankKind::Dram | BankKind::Sram => end <= self.ram.len() as u64,
            BankKind::Rom | BankKind::Flash => {
                addr >= self.rom_base && end <= self.rom_base as u64 + self.rom.len() as u64
            }
            BankKind::Registers => addr >= REGS_BASE && end <= 1 << 32,
            BankKind::Mapped => self.mapped.iter().any(|r| r.contains(addr, size)),
            BankKind::Unmapped => false,
        }
    }

    fn real_slice(&self, addr: u32, len: u32) -> Option<&[u8]> {
        let end = addr as usize + len as usize;
        match self.bank(addr) {
            BankKind::Dram | BankKind::Sram => self.ram.get(addr as usize..end),
            BankKind::Rom | BankKind::Flash => {
                let off = addr.checked_sub(self.rom_base)? as usize;
                self.rom.get(off..off + len as usize)
            }
            _ => None,
        }
    }

    fn suspend_access_checks(&self) {
        self.suspended.set(self.suspended.get() + 1);
    }

    fn resume_access_checks(&self) {
        self.suspended.set(self.suspended.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ChecksSuspended;

    fn memory() -> PalmMemory {
        let mut rom = Rom::new_empty(0x2_0000);
        rom.data[0..2].copy_from_slice(&[0x4E, 0x75]);
        PalmMemory::new(0x4_0000, 0x2_0000, rom)
    }

    #[test]
    fn test_bank_table() {
        let mem = memory();
        assert_eq!(mem.bank_kind(0x0000_0100), BankKind::Dram);
        assert_eq!(mem.bank_kind(0x0001_FFFF), BankKind::Dram);
        assert_eq!(mem.bank_kind(0x0002_0000), BankKind::Sram);
        assert_eq!(mem.bank_kind(0x0004_0000), BankKind::Unmapped);
        assert_eq!(mem.bank_kind(ROM_BASE), BankKind::Rom);
        assert_eq!(mem.bank_kind(ROM_BASE + 0x1_FFFF), BankKind::Rom);
        assert_eq!(mem.bank_kind(ROM_BASE + 0x2_0000), BankKind::Unmapped);
        assert_eq!(mem.bank_kind(REGS_BASE), BankKind::Registers);

        let flash = memory().with_flash();
        assert_eq!(flash.bank_kind(ROM_BASE), BankKind::Flash);
    }

    #[test]
    fn test_rom_is_read_only() {
        let mut mem = memory();
        assert_eq!(mem.read_u16(ROM_BASE), 0x4E75);
        mem.write_u16(ROM_BASE, 0x1234);
        assert_eq!(mem.read_u16(ROM_BASE), 0x4E75);
        assert_eq!(mem.read(0x0800_0000), 0xFF);
    }

    #[test]
    fn test_mapped_region_validity() {
        let mut mem = memory();
        mem.map_region(0x2000_0000, vec![0xAB; 0x100]);
        assert_eq!(mem.bank_kind(0x2000_0080), BankKind::Mapped);
        assert!(mem.valid_address(0x2000_00FE, 2));
        assert!(!mem.valid_address(0x2000_00FF, 2));
        assert!(!mem.valid_address(0x2000_1000, 2));
        assert_eq!(mem.read(0x2000_0010), 0xAB);
    }

    #[test]
    fn test_flagged_accesses_are_recorded_once_per_access() {
        let mut mem = memory();
        mem.meta_mut().mark_range(0x1000..0x1010, MetaBits::FREE_CHUNK);
        mem.set_check_mask(MetaBits::FREE_CHUNK | MetaBits::UNLOCKED_CHUNK);

        mem.read_u32(0x0FFE);
        mem.write_u16(0x2000, 0x55AA);
        mem.write(0x100F, 1);
        let attempts = mem.take_access_attempts();
        assert_eq!(
            attempts,
            vec![
                AccessAttempt { address: 0x0FFE, size: 4, for_read: true },
                AccessAttempt { address: 0x100F, size: 1, for_read: false },
            ]
        );
        assert!(mem.take_access_attempts().is_empty());
    }

    #[test]
    fn test_suspended_checks_record_nothing() {
        let mut mem = memory();
        mem.meta_mut().mark_range(0x1000..0x1010, MetaBits::UNLOCKED_CHUNK);
        mem.set_check_mask(MetaBits::all());
        {
            let guard = ChecksSuspended::new(&mem);
            let _ = guard.bus().read_u32(0x1000);
            {
                let _nested = ChecksSuspended::new(guard.bus());
            }
            let _ = guard.bus().read(0x1004);
        }
        assert!(mem.take_access_attempts().is_empty());
        mem.read(0x1004);
        assert_eq!(mem.take_access_attempts().len(), 1);
    }
}
