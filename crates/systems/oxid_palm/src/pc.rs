// crates/systems/oxid_palm/src/pc.rs
//! Destination checks for every control transfer.

use oxide_core::{BankKind, MemoryBus};

use crate::config::LowMemLayout;
use crate::error::{InvalidPcReason, PalmError, Result};
use crate::lowmem::LowMem;

#[derive(Debug, Clone, Copy)]
pub struct PcValidator {
    layout: LowMemLayout,
}

impl PcValidator {
    pub fn new(layout: LowMemLayout) -> Self {
        Self { layout }
    }

    pub fn check(&self, bus: &dyn MemoryBus, pc: u32) -> std::result::Result<(), InvalidPcReason> {
        if pc & 1 != 0 {
            return Err(InvalidPcReason::OddAddress);
        }
        match bus.bank_kind(pc) {
            BankKind::Rom | BankKind::Flash => {
                if bus.valid_address(pc, 2) {
                    Ok(())
                } else {
                    Err(InvalidPcReason::NotInRom)
                }
            }
            BankKind::Sram => Ok(()),
            BankKind::Dram => {
                let globals_end = LowMem::new(bus, &self.layout).system_globals().end;
                if pc >= globals_end {
                    Ok(())
                } else {
                    Err(InvalidPcReason::InLowMemory)
                }
            }
            BankKind::Mapped => {
                if bus.valid_address(pc, 2) {
                    Ok(())
                } else {
                    Err(InvalidPcReason::InvalidMapped)
                }
            }
            BankKind::Registers | BankKind::Unmapped => Err(InvalidPcReason::UnmappedAddress),
        }
    }

    /// Fatal form of [`check`](Self::check).
    pub fn validate(&self, bus: &dyn MemoryBus, pc: u32) -> Result<()> {
        self.check(bus, pc).map_err(|reason| {
            tracing::error!(target: "oxid_palm::pc", pc = format_args!("{pc:#010X}"), ?reason, "invalid PC");
            PalmError::InvalidPc {
                address: pc,
                reason,
            }
        })
    }
}
