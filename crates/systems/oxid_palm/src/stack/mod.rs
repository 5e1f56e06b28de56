// crates/systems/oxid_palm/src/stack/mod.rs
//! Tracks which stack the emulated CPU is running on and catches
//! overflows before they trash neighbouring memory.

mod list;
mod snapshot;

pub use list::{OverlappingStack, StackList, StackRange};

use std::ops::Range;

use oxide_core::MemoryBus;

use crate::error::{PalmError, Result, SnapshotError};
use crate::heap::HeapModel;
use crate::memory::ChecksSuspended;
use crate::session::{DeferredError, ResetKind, Session};

/// Worst-case exception frame push.
pub const INTERRUPT_OVERHEAD: u32 = 34;
/// Head room below which application stacks get a warning.
pub const STACK_SLUSH: u32 = 50;
pub const BOOT_STACK_SIZE: u32 = 0x500;
/// Kernel stacks this small overrun into the interrupt stack on old ROMs.
pub const SMALL_KERNEL_STACK: u32 = 0x2F4;
pub const AMX_TAG: u32 = 0x414D_5800;
pub const FENCE_TAG: u32 = 0x5555_5555;

/// Current-stack thresholds; all zero while no stack is current.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackThresholds {
    pub high: u32,
    pub low_water_mark: u32,
    pub low_warn: u32,
    pub low: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StackTracker {
    stacks: StackList,
    boot: Option<StackRange>,
    kernel: Option<StackRange>,
    interrupt: Option<StackRange>,
    limits: StackThresholds,
    kernel_stack_overflowed: bool,
    warned: bool,
}

impl StackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn stacks(&self) -> &StackList {
        &self.stacks
    }

    pub fn boot_stack(&self) -> Option<StackRange> {
        self.boot
    }

    pub fn kernel_stack(&self) -> Option<StackRange> {
        self.kernel
    }

    pub fn interrupt_stack(&self) -> Option<StackRange> {
        self.interrupt
    }

    pub fn thresholds(&self) -> StackThresholds {
        self.limits
    }

    pub fn kernel_stack_overflowed(&self) -> bool {
        self.kernel_stack_overflowed
    }

    pub fn has_current(&self) -> bool {
        self.limits.high != 0
    }

    /// The tracked range whose top is the current `stackHigh`.
    pub fn current(&self) -> Option<StackRange> {
        if !self.has_current() {
            return None;
        }
        self.stacks.iter().find(|r| r.top == self.limits.high).copied()
    }

    fn kernel_is_current(&self) -> bool {
        self.kernel.is_some_and(|k| k.top == self.limits.high)
    }

    /// Handles a drastic change of A7: a switch to a different stack.
    pub fn check_assignment(&mut self, sp: u32, bus: &dyn MemoryBus, heaps: &HeapModel) {
        if let Some(range) = self.stacks.find(sp) {
            self.make_current(range);
            return;
        }

        let Some((_, chunk)) = heaps.chunk_containing(sp) else {
            if self.stacks.is_empty() {
                let boot = StackRange::new(sp.saturating_sub(BOOT_STACK_SIZE), sp);
                tracing::debug!(target: "oxid_palm::stack", ?boot, "boot stack");
                self.boot = Some(boot);
                self.remember(boot);
                self.make_current(boot);
            } else {
                tracing::debug!(target: "oxid_palm::stack", sp = format_args!("{sp:#010X}"), "SP outside any heap; untracked");
                self.save_low_water_mark();
                self.limits = StackThresholds::default();
            }
            return;
        };
        let body = chunk.body.clone();

        if let Some((kernel, interrupt)) = find_kernel_stacks(bus, sp, body.clone()) {
            tracing::debug!(target: "oxid_palm::stack", ?kernel, ?interrupt, "kernel stack");
            self.interrupt = Some(interrupt);
            self.remember(interrupt);
            self.kernel = Some(kernel);
            self.remember(kernel);
            if let Some(boot) = self.boot.take() {
                self.save_low_water_mark();
                self.stacks.remove(boot);
                if self.limits.high == boot.top {
                    self.limits = StackThresholds::default();
                }
            }
            self.make_current(kernel);
            return;
        }

        let range = StackRange::new(body.start, body.end);
        tracing::debug!(target: "oxid_palm::stack", ?range, "application stack");
        self.remember(range);
        self.make_current(range);
    }

    /// Handles A7 moving down inside the presumed-current stack.
    pub fn check_decrement(&mut self, sp: u32, session: &mut Session) -> Result<()> {
        if !self.has_current() {
            return Ok(());
        }
        if sp < self.limits.low_water_mark {
            self.limits.low_water_mark = sp;
        }
        if self.kernel_stack_overflowed {
            if !self.back_in_range(sp) {
                return Ok(());
            }
            self.kernel_stack_overflowed = false;
        }
        if sp >= self.limits.low_warn {
            return Ok(());
        }

        if sp <= self.limits.low && self.kernel_is_current() {
            let small = self.kernel.is_some_and(|k| k.size() <= SMALL_KERNEL_STACK);
            if small {
                tracing::warn!(
                    target: "oxid_palm::stack",
                    sp = format_args!("{sp:#010X}"),
                    "small kernel stack overran its floor; tolerating"
                );
                self.kernel_stack_overflowed = true;
                return Ok(());
            }
        }

        if sp <= self.limits.low {
            return Err(PalmError::StackOverflow {
                sp,
                floor: self.limits.low,
            });
        }

        if !self.warned {
            self.warned = true;
            session.schedule_deferred_error(DeferredError::StackNearlyFull {
                sp,
                stack_low: self.limits.low,
                stack_high: self.limits.high,
            });
        }
        Ok(())
    }

    /// A7 moved up; re-arms the nearly-full warning once clear of it.
    pub fn check_increment(&mut self, sp: u32) {
        if self.warned && sp >= self.limits.low_warn {
            self.warned = false;
        }
    }

    /// Re-validates the small-kernel-stack latch.
    pub fn check_kernel_stack_hack(&mut self, sp: u32) {
        if self.kernel_stack_overflowed && self.back_in_range(sp) {
            tracing::debug!(target: "oxid_palm::stack", "kernel stack back within bounds");
            self.kernel_stack_overflowed = false;
        }
    }

    fn back_in_range(&self, sp: u32) -> bool {
        (self.limits.low..=self.limits.high).contains(&sp)
    }

    /// Drops every tracked stack overlapping `range` (chunk freed,
    /// database unloaded...).
    pub fn forget_range(&mut self, range: Range<u32>) {
        let removed = self.stacks.remove_overlapping(range);
        for gone in removed {
            for slot in [&mut self.boot, &mut self.kernel, &mut self.interrupt] {
                if slot.is_some_and(|s| s.bottom == gone.bottom && s.top == gone.top) {
                    *slot = None;
                }
            }
            if gone.top == self.limits.high {
                self.limits = StackThresholds::default();
                self.warned = false;
            }
        }
    }

    /// Restores state from `data`, or schedules a reboot when there is
    /// nothing usable to restore.
    pub fn load_or_reboot(&mut self, data: Option<&[u8]>, session: &mut Session) -> bool {
        let result = match data {
            Some(mut bytes) => self.load(&mut bytes),
            None => Err(SnapshotError::Missing),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "oxid_palm::stack", %err, "cannot reload stack state");
                self.reset();
                session.schedule_reset(ResetKind::Reboot);
                false
            }
        }
    }

    fn remember(&mut self, range: StackRange) {
        if let Err(err) = self.stacks.insert(range) {
            tracing::warn!(target: "oxid_palm::stack", %err, "dropping stale stacks");
            self.forget_range(range.bottom..range.top.saturating_add(1));
            if let Err(err) = self.stacks.insert(range) {
                tracing::warn!(target: "oxid_palm::stack", %err, "stack not tracked");
            }
        }
    }

    fn save_low_water_mark(&mut self) {
        if !self.has_current() {
            return;
        }
        let high = self.limits.high;
        let mark = self.limits.low_water_mark;
        if let Some(r) = self.stacks.iter_mut().find(|r| r.top == high) {
            r.low_water_mark = r.low_water_mark.min(mark);
        }
    }

    fn make_current(&mut self, range: StackRange) {
        self.save_low_water_mark();
        let slush = if self.kernel.is_some_and(|k| k.top == range.top) {
            0
        } else {
            STACK_SLUSH
        };
        let low = range.bottom.saturating_add(INTERRUPT_OVERHEAD);
        self.limits = StackThresholds {
            high: range.top,
            low_water_mark: self
                .stacks
                .iter()
                .find(|r| r.top == range.top)
                .map_or(range.low_water_mark, |r| r.low_water_mark),
            low_warn: low.saturating_add(slush),
            low,
        };
        self.warned = false;
    }
}

/// Kernel and interrupt stacks when `sp` sits on the AMX tag pair.
fn find_kernel_stacks(
    bus: &dyn MemoryBus,
    sp: u32,
    body: Range<u32>,
) -> Option<(StackRange, StackRange)> {
    let guard = ChecksSuspended::new(bus);
    let bus = guard.bus();
    if sp.checked_add(8)? > body.end {
        return None;
    }
    if bus.read_u32(sp) != AMX_TAG || bus.read_u32(sp + 4) != FENCE_TAG {
        return None;
    }
    let upper = find_fence_below(bus, sp, body.start)?;
    let lower = find_fence_below(bus, skip_fence_run(bus, upper, body.start), body.start)?;
    let kernel = StackRange::new(upper + 4, sp);
    let interrupt = StackRange::new(lower + 4, upper);
    Some((kernel, interrupt))
}

/// Highest fence word strictly below `from`, scanning in 2-byte steps.
fn find_fence_below(bus: &dyn MemoryBus, from: u32, floor: u32) -> Option<u32> {
    let mut addr = from.checked_sub(2)?;
    while addr >= floor {
        if bus.read_u32(addr) == FENCE_TAG {
            return Some(addr);
        }
        addr = addr.checked_sub(2)?;
    }
    None
}

/// A run of fence words counts as one fence; returns the run's lowest word.
fn skip_fence_run(bus: &dyn MemoryBus, fence: u32, floor: u32) -> u32 {
    let mut addr = fence;
    while addr >= floor + 4 && bus.read_u32(addr - 4) == FENCE_TAG {
        addr -= 4;
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Chunk, Heap};
    use oxide_core::Rom;

    use crate::memory::PalmMemory;

    fn bus() -> PalmMemory {
        PalmMemory::new(0x1_0000, 0x1_0000, Rom::new_empty(0x100))
    }

    fn heaps_with_chunk(start: u32, body: u32) -> HeapModel {
        let mut heaps = HeapModel::new();
        heaps.insert_heap(Heap::new(0, 0x0800..0x0820).with_chunk(Chunk::new(start, 8, body, 0)));
        heaps
    }

    #[test]
    fn test_first_unknown_sp_becomes_boot_stack() {
        let mut t = StackTracker::new();
        t.check_assignment(0x3000, &bus(), &HeapModel::new());
        let boot = t.boot_stack().unwrap();
        assert_eq!(boot, StackRange::new(0x3000 - BOOT_STACK_SIZE, 0x3000));
        assert_eq!(t.thresholds().high, 0x3000);
        assert_eq!(t.thresholds().low, boot.bottom + INTERRUPT_OVERHEAD);
        assert_eq!(t.thresholds().low_warn, boot.bottom + INTERRUPT_OVERHEAD + STACK_SLUSH);
        assert_eq!(t.stacks().len(), 1);
    }

    #[test]
    fn test_known_range_is_reused() {
        let mut t = StackTracker::new();
        let heaps = heaps_with_chunk(0x1000, 0x400);
        t.check_assignment(0x1300, &bus(), &heaps);
        assert_eq!(t.stacks().len(), 1);
        t.check_assignment(0x3000, &bus(), &HeapModel::new());
        t.check_assignment(0x1200, &bus(), &heaps);
        assert_eq!(t.stacks().len(), 1);
        assert_eq!(t.thresholds().high, 0x1408);
    }

    #[test]
    fn test_low_water_mark_survives_switches() {
        let mut session = Session::new();
        let mut t = StackTracker::new();
        let mut heaps = heaps_with_chunk(0x1000, 0x400);
        heaps.insert_heap(Heap::new(1, 0x4000..0x4010).with_chunk(Chunk::new(0x4010, 8, 0x400, 0)));
        t.check_assignment(0x1400, &bus(), &heaps);
        t.check_decrement(0x1200, &mut session).unwrap();
        t.check_assignment(0x4300, &bus(), &heaps);
        assert_eq!(t.thresholds().low_water_mark, 0x4418);
        t.check_assignment(0x1300, &bus(), &heaps);
        assert_eq!(t.thresholds().low_water_mark, 0x1200);
    }

    #[test]
    fn test_forget_clears_current_and_slots() {
        let mut t = StackTracker::new();
        t.check_assignment(0x3000, &bus(), &HeapModel::new());
        t.forget_range(0x2000..0x4000);
        assert!(t.boot_stack().is_none());
        assert!(!t.has_current());
        assert!(t.stacks().is_empty());
    }

    #[test]
    fn test_no_current_stack_never_faults() {
        let mut session = Session::new();
        let mut t = StackTracker::new();
        assert!(t.check_decrement(0x10, &mut session).is_ok());
        assert_eq!(session.pending_errors().count(), 0);
    }

    #[test]
    fn test_missing_state_forces_reboot() {
        let mut session = Session::new();
        let mut t = StackTracker::new();
        t.check_assignment(0x3000, &bus(), &HeapModel::new());
        assert!(!t.load_or_reboot(None, &mut session));
        assert!(t.stacks().is_empty());
        assert_eq!(session.take_reset(), Some(ResetKind::Reboot));

        assert!(!t.load_or_reboot(Some(&b"garbage"[..]), &mut session));
        assert_eq!(session.take_reset(), Some(ResetKind::Reboot));
    }
}
