// crates/systems/oxid_palm/src/lowmem.rs
//! Reads of the fixed low-memory globals. These are the core's own reads,
//! so they never show up as emulated access violations.

use std::ops::Range;

use oxide_core::MemoryBus;

use crate::config::LowMemLayout;
use crate::memory::ChecksSuspended;

pub struct LowMem<'a> {
    guard: ChecksSuspended<'a>,
    layout: &'a LowMemLayout,
}

impl<'a> LowMem<'a> {
    pub fn new(bus: &'a dyn MemoryBus, layout: &'a LowMemLayout) -> Self {
        Self {
            guard: ChecksSuspended::new(bus),
            layout,
        }
    }

    fn bus(&self) -> &'a dyn MemoryBus {
        self.guard.bus()
    }

    /// `0 .. globals_start`: the exception vectors.
    pub fn low_memory(&self) -> Range<u32> {
        0..self.layout.globals_start
    }

    pub fn dispatch_table(&self) -> u32 {
        self.bus().read_u32(self.layout.sys_dispatch_table_p)
    }

    pub fn dispatch_table_size(&self) -> u16 {
        self.bus().read_u16(self.layout.sys_dispatch_table_size)
    }

    /// From the start of the globals to the end of the live dispatch table.
    pub fn system_globals(&self) -> Range<u32> {
        let end = self
            .dispatch_table()
            .saturating_add(4 * self.dispatch_table_size() as u32);
        self.layout.globals_start..end.max(self.layout.globals_start)
    }

    pub fn lib_table(&self) -> u32 {
        self.bus().read_u32(self.layout.sys_lib_table_p)
    }

    pub fn lib_table_entries(&self) -> u16 {
        self.bus().read_u16(self.layout.sys_lib_table_entries)
    }

    pub fn lib_entry_size(&self) -> u32 {
        self.layout.lib_entry_size
    }

    pub fn mem_semaphore_free(&self) -> bool {
        self.bus().read_u16(self.layout.mem_semaphore_count) == 0
    }

    pub fn card0_base(&self) -> u32 {
        self.bus().read_u32(self.layout.card0_base_p)
    }

    pub fn ram_store(&self) -> u32 {
        self.bus().read_u32(self.layout.card0_ram_store_p)
    }

    pub fn first_window(&self) -> u32 {
        self.bus().read_u32(self.layout.ui_first_window_p)
    }
}
