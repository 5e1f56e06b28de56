// Shared fixtures for the integration tests.
#![allow(dead_code)]

use oxide_core::{Cpu, MemoryBus, Rom};
use oxid_palm::{CoreConfig, LowMemLayout, PalmCore, PalmMemory};

pub const TABLE: u32 = 0x0400;
pub const TABLE_SIZE: u16 = 0x300;
/// End of the system globals once the dispatch table is installed.
pub const GLOBALS_END: u32 = TABLE + 4 * TABLE_SIZE as u32;

/// Register file standing in for the interpreter.
#[derive(Debug, Default)]
pub struct TestCpu {
    pub pc: u32,
    pub d: [u32; 8],
    pub a: [u32; 8],
}

impl TestCpu {
    pub fn at(pc: u32, sp: u32) -> Self {
        let mut cpu = Self::default();
        cpu.pc = pc;
        cpu.a[7] = sp;
        cpu
    }
}

impl Cpu for TestCpu {
    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn d(&self, reg: usize) -> u32 {
        self.d[reg]
    }

    fn a(&self, reg: usize) -> u32 {
        self.a[reg]
    }

    fn set_a(&mut self, reg: usize, val: u32) {
        self.a[reg] = val;
    }
}

/// 64 KB of DRAM and a small blank ROM.
pub fn memory() -> PalmMemory {
    PalmMemory::new(0x1_0000, 0x1_0000, Rom::new_empty(0x2000))
}

pub fn memory_with_rom(rom: Vec<u8>) -> PalmMemory {
    PalmMemory::new(0x1_0000, 0x1_0000, Rom { data: rom })
}

pub fn palm_core() -> PalmCore {
    PalmCore::new(CoreConfig::default())
}

/// Installs a trap dispatch table at `TABLE`.
pub fn install_dispatch_table(mem: &mut PalmMemory) {
    let layout = LowMemLayout::default();
    mem.write_u32(layout.sys_dispatch_table_p, TABLE);
    mem.write_u16(layout.sys_dispatch_table_size, TABLE_SIZE);
}

pub fn set_trap(mem: &mut PalmMemory, index: u16, dest: u32) {
    mem.write_u32(TABLE + 4 * index as u32, dest);
}
