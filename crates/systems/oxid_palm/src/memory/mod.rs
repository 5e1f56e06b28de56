// crates/systems/oxid_palm/src/memory/mod.rs
mod meta;
mod palm;

pub use meta::{MetaBits, MetadataShadow};
pub use palm::{AccessAttempt, PalmMemory, REGS_BASE, ROM_BASE};

use oxide_core::MemoryBus;

/// Suspends access instrumentation on a bus for the guard's lifetime.
pub struct ChecksSuspended<'a> {
    bus: &'a dyn MemoryBus,
}

impl<'a> ChecksSuspended<'a> {
    pub fn new(bus: &'a dyn MemoryBus) -> Self {
        bus.suspend_access_checks();
        Self { bus }
    }

    pub fn bus(&self) -> &'a dyn MemoryBus {
        self.bus
    }
}

impl Drop for ChecksSuspended<'_> {
    fn drop(&mut self) {
        self.bus.resume_access_checks();
    }
}
