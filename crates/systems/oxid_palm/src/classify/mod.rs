// crates/systems/oxid_palm/src/classify/mod.rs
//! Decides what kind of memory an emulated access touched and whether
//! that is worth telling the user about.

pub mod allowance;
pub mod ui;

use std::ops::Range;

use oxide_core::MemoryBus;

use self::allowance::{AllowanceQuery, AllowanceTable};
use self::ui::UiAccess;
use crate::config::{AccessChecks, CoreConfig, LowMemLayout, OsVersion};
use crate::heap::HeapModel;
use crate::lowmem::LowMem;
use crate::memory::ChecksSuspended;
use crate::session::{DeferredError, Session};
use crate::stack::StackTracker;
use crate::symbols::SymbolResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Ok,
    LowMemory,
    SystemGlobal,
    ScreenBuffer,
    LowStack,
    MemMgrInternal,
    FreeChunk,
    UnlockedChunk,
    /// Nothing recognised it; treated as OK.
    Unknown,
}

impl AccessType {
    pub fn is_violation(self) -> bool {
        !matches!(self, AccessType::Ok | AccessType::Unknown)
    }

    /// The user-facing switch for this kind of violation.
    pub fn check_flag(self) -> AccessChecks {
        match self {
            AccessType::LowMemory => AccessChecks::LOW_MEMORY,
            AccessType::SystemGlobal => AccessChecks::SYSTEM_GLOBALS,
            AccessType::ScreenBuffer => AccessChecks::SCREEN,
            AccessType::LowStack => AccessChecks::LOW_STACK,
            AccessType::MemMgrInternal => AccessChecks::MEM_MGR,
            AccessType::FreeChunk => AccessChecks::FREE_CHUNK,
            AccessType::UnlockedChunk => AccessChecks::UNLOCKED_CHUNK,
            AccessType::Ok | AccessType::Unknown => AccessChecks::empty(),
        }
    }
}

/// Who performed the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorKind {
    Rom,
    /// RAM-resident system code (extensions, libraries, patches).
    RamSystem,
    Application,
}

/// One access on its way through the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhatHappened {
    pub address: u32,
    pub size: u32,
    pub for_read: bool,
    pub result: AccessType,
}

impl WhatHappened {
    pub fn new(address: u32, size: u32, for_read: bool) -> Self {
        Self {
            address,
            size,
            for_read,
            result: AccessType::Unknown,
        }
    }

    fn touches(&self, range: &Range<u32>) -> bool {
        let end = self.address as u64 + self.size.max(1) as u64;
        (self.address as u64) < range.end as u64 && (range.start as u64) < end
    }
}

/// The instruction that made the access.
#[derive(Debug, Clone, Copy)]
pub struct AccessSite<'a> {
    pub pc: u32,
    pub sp: u32,
    pub accessor: AccessorKind,
    pub call_chain: &'a [u32],
}

/// Read-only machine state the classifier looks at.
pub struct ClassifyEnv<'a> {
    pub bus: &'a dyn MemoryBus,
    pub heaps: &'a HeapModel,
    pub stack: &'a StackTracker,
    pub symbols: &'a dyn SymbolResolver,
    pub site: AccessSite<'a>,
}

pub struct Classifier {
    enabled: bool,
    checks: AccessChecks,
    os_version: OsVersion,
    layout: LowMemLayout,
    screen: Option<Range<u32>>,
    allowances: AllowanceTable,
}

impl Classifier {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            enabled: config.checks_enabled,
            checks: config.checks,
            os_version: config.os_version,
            layout: config.low_mem,
            screen: None,
            allowances: AllowanceTable::seeded(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    pub fn checks(&self) -> AccessChecks {
        self.checks
    }

    pub fn set_checks(&mut self, checks: AccessChecks) {
        self.checks = checks;
    }

    pub fn screen(&self) -> Option<Range<u32>> {
        self.screen.clone()
    }

    /// The LCD frame buffer, once the host knows where it is.
    pub fn set_screen(&mut self, screen: Option<Range<u32>>) {
        self.screen = screen;
    }

    pub fn allowances_mut(&mut self) -> &mut AllowanceTable {
        &mut self.allowances
    }

    /// Classifies one access, recording the outcome in `what.result`.
    /// UI-object violations are queued on the session and reported back
    /// as OK so they are not reported twice.
    pub fn classify(
        &self,
        env: &ClassifyEnv<'_>,
        session: &mut Session,
        what: &mut WhatHappened,
    ) -> AccessType {
        if !self.enabled {
            what.result = AccessType::Ok;
            return what.result;
        }
        let guard = ChecksSuspended::new(env.bus);
        let bus = guard.bus();

        if let Some(kind) = self.fixed_region(bus, env.stack, env.site.sp, what) {
            what.result = kind;
        } else if let Some(kind) = self.ui_object(bus, session, what) {
            what.result = kind;
            return what.result;
        } else if let Some(kind) = heap_region(env.heaps, what) {
            what.result = kind;
        } else {
            what.result = AccessType::Unknown;
            return what.result;
        }

        if what.result.is_violation() {
            let query = AllowanceQuery {
                kind: what.result,
                address: what.address,
                size: what.size,
                for_read: what.for_read,
                pc: env.site.pc,
                accessor: env.site.accessor,
                os_version: self.os_version,
                layout: &self.layout,
                bus,
                symbols: env.symbols,
                call_chain: env.site.call_chain,
            };
            if let Some((rule, outcome)) = self.allowances.apply(&query) {
                tracing::trace!(target: "oxid_palm::classify", rule, ?outcome, "allowance");
                what.result = outcome;
            }
        }
        what.result
    }

    fn fixed_region(
        &self,
        bus: &dyn MemoryBus,
        stack: &StackTracker,
        sp: u32,
        what: &WhatHappened,
    ) -> Option<AccessType> {
        let low = LowMem::new(bus, &self.layout);
        if what.touches(&low.low_memory()) {
            return Some(AccessType::LowMemory);
        }
        if what.touches(&low.system_globals()) {
            return Some(AccessType::SystemGlobal);
        }
        if self.screen.as_ref().is_some_and(|s| what.touches(s)) {
            return Some(AccessType::ScreenBuffer);
        }
        let current = stack.current().filter(|s| s.contains(sp));
        if current.is_some_and(|s| what.touches(&(s.bottom..sp))) {
            return Some(AccessType::LowStack);
        }
        None
    }

    fn ui_object(
        &self,
        bus: &dyn MemoryBus,
        session: &mut Session,
        what: &WhatHappened,
    ) -> Option<AccessType> {
        if !self.checks.contains(AccessChecks::UI_OBJECTS) {
            return None;
        }
        let first = LowMem::new(bus, &self.layout).first_window();
        let hit = ui::check_ui_access(
            bus,
            first,
            what.address,
            what.size,
            what.for_read,
            self.os_version,
        )?;
        let (address, size, for_read) = (what.address, what.size, what.for_read);
        let err = match hit {
            UiAccess::Allowed => None,
            UiAccess::Window { window } => Some(DeferredError::WindowAccess {
                address,
                size,
                for_read,
                window,
            }),
            UiAccess::Form { form } => Some(DeferredError::FormAccess {
                address,
                size,
                for_read,
                form,
            }),
            UiAccess::FormObject { form, object, kind } => Some(DeferredError::FormObjectAccess {
                address,
                size,
                for_read,
                form,
                object,
                kind,
            }),
        };
        if let Some(err) = err {
            session.schedule_deferred_error(err);
        }
        Some(AccessType::Ok)
    }
}

/// Free wins over unlocked: a free chunk's lock count means nothing.
fn heap_region(heaps: &HeapModel, what: &WhatHappened) -> Option<AccessType> {
    let heap = heaps.heaps().find(|h| what.touches(&h.range()))?;
    if what.touches(&heap.header) || heap.master_pointer_tables.iter().any(|t| what.touches(t)) {
        return Some(AccessType::MemMgrInternal);
    }
    for chunk in heap.chunks.iter().filter(|c| what.touches(&c.range())) {
        if what.touches(&chunk.header) || chunk.trailer.as_ref().is_some_and(|t| what.touches(t)) {
            return Some(AccessType::MemMgrInternal);
        }
        if chunk.free {
            return Some(AccessType::FreeChunk);
        }
        if chunk.lock_count == 0 {
            return Some(AccessType::UnlockedChunk);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Chunk, Heap};
    use crate::memory::PalmMemory;
    use crate::symbols::{NoSymbols, SymbolTable};
    use oxide_core::Rom;

    struct Machine {
        bus: PalmMemory,
        heaps: HeapModel,
        stack: StackTracker,
    }

    fn machine() -> Machine {
        let layout = LowMemLayout::default();
        let mut bus = PalmMemory::new(0x2_0000, 0x2_0000, Rom::new_empty(0x100));
        // dispatch table 0x0400..0x0500
        bus.write_u32(layout.sys_dispatch_table_p, 0x0400);
        bus.write_u16(layout.sys_dispatch_table_size, 0x40);
        let mut heaps = HeapModel::new();
        heaps.insert_heap(
            Heap::new(0, 0x1000..0x1020)
                .with_master_pointer_table(0x1020..0x1040)
                .with_chunk(Chunk::new(0x1040, 8, 0x40, 0))
                .with_chunk(Chunk::new(0x1088, 8, 0x20, 4).locked(0))
                .with_chunk(Chunk::new(0x10B4, 8, 0x10, 0).free())
                .with_chunk(Chunk::new(0x10CC, 8, 0x400, 0)),
        );
        let mut stack = StackTracker::new();
        stack.check_assignment(0x14D0, &bus, &heaps);
        Machine { bus, heaps, stack }
    }

    fn classify_with(
        classifier: &Classifier,
        m: &Machine,
        symbols: &dyn SymbolResolver,
        site: AccessSite<'_>,
        address: u32,
        size: u32,
        for_read: bool,
    ) -> (AccessType, Session) {
        let env = ClassifyEnv {
            bus: &m.bus,
            heaps: &m.heaps,
            stack: &m.stack,
            symbols,
            site,
        };
        let mut session = Session::new();
        let mut what = WhatHappened::new(address, size, for_read);
        let kind = classifier.classify(&env, &mut session, &mut what);
        assert_eq!(kind, what.result);
        (kind, session)
    }

    fn app_site() -> AccessSite<'static> {
        AccessSite {
            pc: 0x1_8000,
            sp: 0x1400,
            accessor: AccessorKind::Application,
            call_chain: &[],
        }
    }

    fn classify(c: &Classifier, m: &Machine, address: u32, size: u32, for_read: bool) -> AccessType {
        classify_with(c, m, &NoSymbols, app_site(), address, size, for_read).0
    }

    #[test]
    fn test_disabled_checks_always_ok() {
        let m = machine();
        let mut c = Classifier::new(&CoreConfig::default());
        c.set_enabled(false);
        assert_eq!(classify(&c, &m, 0x0000, 4, true), AccessType::Ok);
    }

    #[test]
    fn test_low_memory_regardless_of_direction() {
        let m = machine();
        let c = Classifier::new(&CoreConfig::default());
        assert_eq!(classify(&c, &m, 0x0008, 4, true), AccessType::LowMemory);
        assert_eq!(classify(&c, &m, 0x00FE, 2, false), AccessType::LowMemory);
        assert_eq!(classify(&c, &m, 0x0100, 2, false), AccessType::SystemGlobal);
        assert_eq!(classify(&c, &m, 0x04FC, 4, true), AccessType::SystemGlobal);
        assert_eq!(classify(&c, &m, 0x0500, 4, true), AccessType::Unknown);
    }

    #[test]
    fn test_screen_and_low_stack() {
        let m = machine();
        let mut c = Classifier::new(&CoreConfig::default());
        c.set_screen(Some(0x8000..0x9000));
        assert_eq!(classify(&c, &m, 0x8FFF, 1, false), AccessType::ScreenBuffer);
        // current stack body 0x10D4..0x14D4, SP 0x1400
        assert_eq!(classify(&c, &m, 0x13FC, 4, false), AccessType::LowStack);
        assert_eq!(classify(&c, &m, 0x1400, 4, true), AccessType::Unknown);
    }

    #[test]
    fn test_heap_structures() {
        let m = machine();
        let c = Classifier::new(&CoreConfig::default());
        assert_eq!(classify(&c, &m, 0x1004, 2, true), AccessType::MemMgrInternal);
        assert_eq!(classify(&c, &m, 0x1030, 4, true), AccessType::MemMgrInternal);
        assert_eq!(classify(&c, &m, 0x1044, 2, false), AccessType::MemMgrInternal);
        assert_eq!(classify(&c, &m, 0x10B0, 2, true), AccessType::MemMgrInternal);
        assert_eq!(classify(&c, &m, 0x1060, 4, true), AccessType::Unknown);
        assert_eq!(classify(&c, &m, 0x1098, 4, true), AccessType::UnlockedChunk);
        assert_eq!(classify(&c, &m, 0x10C0, 4, false), AccessType::FreeChunk);
    }

    #[test]
    fn test_allowance_downgrades_to_ok() {
        let m = machine();
        let c = Classifier::new(&CoreConfig::default());
        let mut symbols = SymbolTable::new();
        symbols.insert(0x1_8000..0x1_8100, "MemHeapScramble");
        let rom_site = AccessSite {
            accessor: AccessorKind::Rom,
            ..app_site()
        };
        let (kind, _) = classify_with(&c, &m, &symbols, rom_site, 0x10C0, 4, true);
        assert_eq!(kind, AccessType::Ok);
        // Same name in application code is still reported.
        let (kind, _) = classify_with(&c, &m, &symbols, app_site(), 0x10C0, 4, true);
        assert_eq!(kind, AccessType::FreeChunk);

        let (kind, _) = classify_with(&c, &m, &NoSymbols, rom_site, 0x0008, 4, true);
        assert_eq!(kind, AccessType::Ok);
    }

    #[test]
    fn test_ui_violation_is_deferred() {
        let mut m = machine();
        let layout = LowMemLayout::default();
        // a plain window inside the locked chunk at 0x1048
        m.bus.write_u32(layout.ui_first_window_p, 0x1048);
        let c = Classifier::new(&CoreConfig::default());
        let (kind, mut session) = classify_with(&c, &m, &NoSymbols, app_site(), 0x1048 + 20, 2, false);
        assert_eq!(kind, AccessType::Ok);
        let errs = session.drain_deferred_errors();
        assert_eq!(
            errs,
            vec![DeferredError::WindowAccess {
                address: 0x105C,
                size: 2,
                for_read: false,
                window: 0x1048,
            }]
        );
    }
}
