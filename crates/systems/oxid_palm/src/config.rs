// crates/systems/oxid_palm/src/config.rs
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::PalmError;

/// Palm OS version of the ROM being emulated, compared as (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u8,
    pub minor: u8,
}

impl OsVersion {
    pub const V1_0: OsVersion = OsVersion::new(1, 0);
    pub const V2_0: OsVersion = OsVersion::new(2, 0);
    pub const V3_0: OsVersion = OsVersion::new(3, 0);
    pub const V3_1: OsVersion = OsVersion::new(3, 1);
    pub const V3_2: OsVersion = OsVersion::new(3, 2);
    pub const V3_5: OsVersion = OsVersion::new(3, 5);
    pub const V4_0: OsVersion = OsVersion::new(4, 0);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Default for OsVersion {
    fn default() -> Self {
        OsVersion::V3_5
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

bitflags! {
    /// Which access violations get reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AccessChecks: u16 {
        const LOW_MEMORY     = 1 << 0;
        const SYSTEM_GLOBALS = 1 << 1;
        const SCREEN         = 1 << 2;
        const LOW_STACK      = 1 << 3;
        const MEM_MGR        = 1 << 4;
        const FREE_CHUNK     = 1 << 5;
        const UNLOCKED_CHUNK = 1 << 6;
        const UI_OBJECTS     = 1 << 7;
    }
}

impl Default for AccessChecks {
    fn default() -> Self {
        AccessChecks::all()
    }
}

/// Addresses of the fixed low-memory globals the core reads.
///
/// Defaults follow the 3.x layout. Everything below `globals_start` is the
/// 68000 exception vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowMemLayout {
    pub globals_start: u32,
    /// u16: number of entries in the trap dispatch table
    pub sys_dispatch_table_size: u32,
    /// u32: pointer to the trap dispatch table
    pub sys_dispatch_table_p: u32,
    pub sys_lib_table_p: u32,
    /// u16
    pub sys_lib_table_entries: u32,
    /// u16, zero when the memory manager semaphore is free
    pub mem_semaphore_count: u32,
    pub card0_base_p: u32,
    pub card0_ram_store_p: u32,
    pub ui_first_window_p: u32,
    pub lib_entry_size: u32,
}

impl Default for LowMemLayout {
    fn default() -> Self {
        Self {
            globals_start: 0x0100,
            sys_dispatch_table_size: 0x011E,
            sys_dispatch_table_p: 0x0122,
            sys_lib_table_p: 0x0126,
            sys_lib_table_entries: 0x012A,
            mem_semaphore_count: 0x012C,
            card0_base_p: 0x0130,
            card0_ram_store_p: 0x0134,
            ui_first_window_p: 0x0138,
            lib_entry_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub os_version: OsVersion,
    pub checks: AccessChecks,
    /// Master switch; when off every access classifies as OK.
    pub checks_enabled: bool,
    pub log_system_calls: bool,
    pub low_mem: LowMemLayout,
    /// Where the ROM image sits on the bus.
    pub rom_base: u32,
    /// `tracing` level name used by the binary ("error" .. "trace").
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            os_version: OsVersion::default(),
            checks: AccessChecks::default(),
            checks_enabled: true,
            log_system_calls: false,
            low_mem: LowMemLayout::default(),
            rom_base: crate::memory::ROM_BASE,
            log_level: "info".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_json(text: &str) -> Result<Self, PalmError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PalmError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
