// crates/systems/oxid_palm/src/syscall/context.rs
//! Turning a trap word into a call target.

use oxide_core::MemoryBus;

use crate::config::LowMemLayout;
use crate::error::TrapResolveError;
use crate::lowmem::LowMem;
use crate::memory::ChecksSuspended;

pub const SYS_TRAP_BASE: u16 = 0xA000;
pub const SYS_TRAP_LAST: u16 = 0xA7FF;
pub const LIB_TRAP_BASE: u16 = 0xA800;
pub const LIB_TRAP_LAST: u16 = 0xAFFF;
/// sysTrapSysUnimplemented; table entries equal to its entry are holes.
pub const SYS_TRAP_UNIMPLEMENTED: u16 = 0xA27B;
const SYS_LIB_TRAP_REF_NUM_INVALID: u16 = 0xFFFF;

pub const TRAP_15: u16 = 0x4E4F;
const JMP_ABS_L: u16 = 0x4EF9;
const MOVE_L_ABS_W_A1: u16 = 0x2278;
const MOVE_L_D16_A1_A1: u16 = 0x2269;
const JSR_IND_A1: u16 = 0x4E91;

/// How the call reached the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallForm {
    /// `TRAP #15` followed by the trap word.
    Trap,
    /// The inline `MOVE.L / MOVE.L / JSR (A1)` glue.
    Inline,
}

impl CallForm {
    /// Bytes between the PC the dispatcher sees and the instruction start.
    pub fn pc_adjust(self) -> u32 {
        match self {
            CallForm::Trap => 2,
            CallForm::Inline => 0,
        }
    }
}

/// Where a trap was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite {
    pub form: CallForm,
    pub trap_word: u16,
    /// Trap word address for `Trap`, the JSR address for `Inline`.
    pub pc: u32,
    pub next_pc: u32,
}

impl TrapSite {
    pub fn trap(pc: u32, trap_word: u16) -> Self {
        Self {
            form: CallForm::Trap,
            trap_word,
            pc,
            next_pc: pc.wrapping_add(2),
        }
    }

    pub fn inline(jsr_pc: u32, trap_word: u16) -> Self {
        Self {
            form: CallForm::Inline,
            trap_word,
            pc: jsr_pc,
            next_pc: jsr_pc.wrapping_add(2),
        }
    }

    /// Start of the instruction that made the call.
    pub fn instruction_pc(&self) -> u32 {
        self.pc.wrapping_sub(self.form.pc_adjust())
    }
}

/// Recognises the inline dispatch glue ending with `JSR (A1)` at `jsr_pc`
/// and returns the trap word it stands for.
pub fn inline_trap_word(bus: &dyn MemoryBus, layout: &LowMemLayout, jsr_pc: u32) -> Option<u16> {
    let guard = ChecksSuspended::new(bus);
    let bus = guard.bus();
    let start = jsr_pc.checked_sub(8)?;
    if bus.read_u16(jsr_pc) != JSR_IND_A1
        || bus.read_u16(start + 4) != MOVE_L_D16_A1_A1
        || bus.read_u16(start) != MOVE_L_ABS_W_A1
    {
        return None;
    }
    // absolute short, sign extended
    let table_p = bus.read_u16(start + 2) as i16 as i32 as u32;
    if table_p != layout.sys_dispatch_table_p {
        return None;
    }
    let disp = bus.read_u16(start + 6);
    if disp % 4 != 0 || disp / 4 > SYS_TRAP_LAST - SYS_TRAP_BASE {
        return None;
    }
    Some(SYS_TRAP_BASE | disp / 4)
}

/// A resolved system call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCallContext {
    pub site: TrapSite,
    pub trap_index: u16,
    /// Library reference number for library traps.
    pub ref_num: Option<u16>,
    /// Dispatch table target.
    pub dest_pc1: u32,
    /// `dest_pc1` with one `JMP abs.l` stub followed.
    pub dest_pc2: u32,
}

impl SystemCallContext {
    pub fn trap_word(&self) -> u16 {
        self.site.trap_word
    }

    pub fn via_trap(&self) -> bool {
        self.site.form == CallForm::Trap
    }

    /// `sp` is the stack pointer at the call, pointing at the first
    /// argument.
    pub fn resolve(
        bus: &dyn MemoryBus,
        layout: &LowMemLayout,
        site: TrapSite,
        sp: u32,
    ) -> Result<Self, TrapResolveError> {
        let guard = ChecksSuspended::new(bus);
        let bus = guard.bus();
        let low = LowMem::new(bus, layout);
        let word = site.trap_word;
        let unimplemented = TrapResolveError::UnimplementedTrap { trap_word: word };

        let (trap_index, ref_num, dest_pc1) = match word {
            SYS_TRAP_BASE..=SYS_TRAP_LAST => {
                let index = word & 0x0FFF;
                let table = low.dispatch_table();
                if table == 0 || index >= low.dispatch_table_size() {
                    return Err(unimplemented);
                }
                let hole_index = (SYS_TRAP_UNIMPLEMENTED & 0x0FFF) as u32;
                // The table pointer is guest data; one that wraps is garbage.
                let (Some(slot), Some(hole_slot)) = (
                    table.checked_add(4 * index as u32),
                    table.checked_add(4 * hole_index),
                ) else {
                    return Err(unimplemented);
                };
                let entry = bus.read_u32(slot);
                let hole = bus.read_u32(hole_slot);
                if entry == 0 || (index as u32 != hole_index && entry == hole) {
                    return Err(unimplemented);
                }
                (index, None, entry)
            }
            LIB_TRAP_BASE..=LIB_TRAP_LAST => {
                let ref_num = bus.read_u16(sp);
                let invalid = TrapResolveError::InvalidLibraryRefNum {
                    trap_word: word,
                    ref_num,
                };
                if ref_num == SYS_LIB_TRAP_REF_NUM_INVALID || ref_num >= low.lib_table_entries() {
                    return Err(invalid);
                }
                let Some(entry) = (ref_num as u32)
                    .checked_mul(low.lib_entry_size())
                    .and_then(|off| low.lib_table().checked_add(off))
                else {
                    return Err(invalid);
                };
                let dispatch = bus.read_u32(entry);
                if dispatch == 0 {
                    return Err(invalid);
                }
                let index = word - LIB_TRAP_BASE;
                let Some(dest) = dispatch
                    .checked_add(2 * index as u32)
                    .map(|slot| bus.read_u16(slot))
                    .and_then(|offset| dispatch.checked_add(offset as u32))
                else {
                    return Err(invalid);
                };
                (index, Some(ref_num), dest)
            }
            _ => return Err(unimplemented),
        };

        let dest_pc2 = match dest_pc1.checked_add(2) {
            Some(target) if bus.read_u16(dest_pc1) == JMP_ABS_L => bus.read_u32(target),
            _ => dest_pc1,
        };

        Ok(Self {
            site,
            trap_index,
            ref_num,
            dest_pc1,
            dest_pc2,
        })
    }
}
