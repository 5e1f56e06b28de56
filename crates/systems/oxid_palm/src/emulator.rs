// crates/systems/oxid_palm/src/emulator.rs
//! `PalmCore`: owns every piece of per-session state and answers the CPU
//! interpreter's hooks.

use std::io::Write;

use oxide_core::{BankKind, Cpu, CpuHooks, HookOutcome, MemoryBus, SpChange};

use crate::classify::{AccessSite, AccessType, AccessorKind, ClassifyEnv, Classifier, WhatHappened};
use crate::config::{AccessChecks, CoreConfig};
use crate::error::{PalmError, Result, SnapshotError};
use crate::heap::HeapModel;
use crate::lowmem::LowMem;
use crate::memory::{ChecksSuspended, MetaBits, PalmMemory};
use crate::pc::PcValidator;
use crate::session::{DeferredError, ResetKind, Session};
use crate::stack::StackTracker;
use crate::symbols::{self, MacsBugNames, SymbolResolver};
use crate::syscall::big_rom::BigRomEntry;
use crate::syscall::{inline_trap_word, DispatchEnv, SystemCallDispatcher, TrapSite};
use crate::syscode::SystemCodeCache;

pub struct PalmCore {
    config: CoreConfig,
    validator: PcValidator,
    classifier: Classifier,
    dispatcher: SystemCallDispatcher,
    stack: StackTracker,
    heaps: HeapModel,
    session: Session,
    syscode: SystemCodeCache,
    big_rom: BigRomEntry,
    symbols: Box<dyn SymbolResolver>,
}

impl PalmCore {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            validator: PcValidator::new(config.low_mem),
            classifier: Classifier::new(&config),
            dispatcher: SystemCallDispatcher::new(config.low_mem, config.log_system_calls),
            stack: StackTracker::new(),
            heaps: HeapModel::new(),
            session: Session::new(),
            syscode: SystemCodeCache::new(config.low_mem),
            big_rom: BigRomEntry::new(),
            symbols: Box::new(MacsBugNames::default()),
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn stack(&self) -> &StackTracker {
        &self.stack
    }

    pub fn heaps(&self) -> &HeapModel {
        &self.heaps
    }

    /// The memory manager patches keep this in sync.
    pub fn heaps_mut(&mut self) -> &mut HeapModel {
        &mut self.heaps
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn classifier_mut(&mut self) -> &mut Classifier {
        &mut self.classifier
    }

    pub fn dispatcher_mut(&mut self) -> &mut SystemCallDispatcher {
        &mut self.dispatcher
    }

    pub fn system_code(&self) -> &SystemCodeCache {
        &self.syscode
    }

    pub fn set_symbols(&mut self, symbols: Box<dyn SymbolResolver>) {
        self.symbols = symbols;
    }

    /// Back to power-on state. Configuration and injected collaborators
    /// stay.
    pub fn reset(&mut self) {
        self.stack.reset();
        self.syscode.reset();
        self.big_rom.reset();
        self.session.drain_deferred_errors();
    }

    pub fn save_state<W: Write>(&self, w: &mut W) -> std::result::Result<(), SnapshotError> {
        self.stack.save(w)
    }

    /// `false` when the state could not be restored and a reboot was
    /// scheduled instead.
    pub fn load_state(&mut self, data: Option<&[u8]>) -> bool {
        self.syscode.reset();
        self.big_rom.reset();
        self.stack.load_or_reboot(data, &mut self.session)
    }

    /// A chunk's lock count changed.
    pub fn chunk_lock_changed(&mut self, body_start: u32, lock_count: u8) {
        if let Some(unlocked) = self.heaps.set_lock_count(body_start, lock_count) {
            self.syscode.on_chunk_unlocked(&unlocked.body);
        }
    }

    pub fn chunk_freed(&mut self, body_start: u32) {
        if let Some(range) = self.heaps.free_chunk(body_start) {
            self.syscode.on_chunk_unlocked(&range);
            self.stack.forget_range(range);
        }
    }

    fn check_mask(&self) -> MetaBits {
        if !self.classifier.enabled() {
            return MetaBits::empty();
        }
        let checks = self.classifier.checks();
        let mut mask = MetaBits::empty();
        for (flag, bits) in [
            (AccessChecks::LOW_MEMORY, MetaBits::LOW_MEMORY),
            (AccessChecks::SYSTEM_GLOBALS, MetaBits::SYSTEM_GLOBAL),
            (AccessChecks::SCREEN, MetaBits::SCREEN),
            (
                AccessChecks::MEM_MGR,
                MetaBits::MEM_MGR | MetaBits::CHUNK_HEADER | MetaBits::CHUNK_TRAILER,
            ),
            (AccessChecks::FREE_CHUNK, MetaBits::FREE_CHUNK),
            (AccessChecks::UNLOCKED_CHUNK, MetaBits::UNLOCKED_CHUNK),
        ] {
            if checks.contains(flag) {
                mask |= bits;
            }
        }
        mask
    }

    /// Rebuilds the metadata shadow from the low-memory layout, the screen
    /// and the heap model, and arms access recording to match.
    pub fn refresh_meta(&mut self, mem: &mut PalmMemory) {
        let (low, globals) = {
            let l = LowMem::new(&*mem, &self.config.low_mem);
            (l.low_memory(), l.system_globals())
        };
        let fixed = MetaBits::LOW_MEMORY | MetaBits::SYSTEM_GLOBAL | MetaBits::SCREEN;
        let meta = mem.meta_mut();
        let window = meta.window();
        meta.unmark_range(window, fixed);
        meta.mark_range(low, MetaBits::LOW_MEMORY);
        meta.mark_range(globals, MetaBits::SYSTEM_GLOBAL);
        if let Some(screen) = self.classifier.screen() {
            meta.mark_range(screen, MetaBits::SCREEN);
        }
        self.heaps.mark_shadow(meta);
        mem.set_check_mask(self.check_mask());
    }

    pub fn accessor_kind(&mut self, bus: &dyn MemoryBus, pc: u32) -> AccessorKind {
        match bus.bank_kind(pc) {
            BankKind::Rom | BankKind::Flash => AccessorKind::Rom,
            BankKind::Dram | BankKind::Sram if self.syscode.is_system_code(bus, &self.heaps, pc) => {
                AccessorKind::RamSystem
            }
            _ => AccessorKind::Application,
        }
    }

    /// Classifies one access made by the instruction at `pc`.
    pub fn classify_access(
        &mut self,
        cpu: &dyn Cpu,
        bus: &dyn MemoryBus,
        pc: u32,
        what: &mut WhatHappened,
    ) -> AccessType {
        let accessor = self.accessor_kind(bus, pc);
        let chain = symbols::call_chain(bus, cpu.a(6), self.stack.current());
        let env = ClassifyEnv {
            bus,
            heaps: &self.heaps,
            stack: &self.stack,
            symbols: self.symbols.as_ref(),
            site: AccessSite {
                pc,
                sp: cpu.sp(),
                accessor,
                call_chain: &chain,
            },
        };
        self.classifier.classify(&env, &mut self.session, what)
    }

    /// Classifies the accesses recorded while the instruction at `pc`
    /// ran and queues the enabled violations. Returns how many were
    /// queued.
    pub fn after_instruction(&mut self, cpu: &dyn Cpu, mem: &PalmMemory, pc: u32) -> usize {
        let attempts = mem.take_access_attempts();
        let mut reported = 0;
        for attempt in attempts {
            let mut what = WhatHappened::new(attempt.address, attempt.size, attempt.for_read);
            let kind = self.classify_access(cpu, mem, pc, &mut what);
            if kind.is_violation() && self.classifier.checks().contains(kind.check_flag()) {
                self.session.schedule_deferred_error(DeferredError::Access {
                    kind,
                    address: what.address,
                    size: what.size,
                    for_read: what.for_read,
                    pc,
                });
                reported += 1;
            }
        }
        reported
    }

    fn dispatch(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        site: TrapSite,
    ) -> Result<HookOutcome> {
        let env = DispatchEnv {
            stack: &mut self.stack,
            session: &mut self.session,
            symbols: self.symbols.as_ref(),
        };
        self.dispatcher.dispatch(cpu, bus, site, env)
    }
}

fn peek_u16(bus: &dyn MemoryBus, addr: u32) -> u16 {
    ChecksSuspended::new(bus).bus().read_u16(addr)
}

impl CpuHooks for PalmCore {
    type Error = PalmError;

    fn on_system_call(&mut self, cpu: &mut dyn Cpu, bus: &mut dyn MemoryBus) -> Result<HookOutcome> {
        let pc = cpu.pc();
        let word = peek_u16(&*bus, pc);
        self.dispatch(cpu, bus, TrapSite::trap(pc, word))
    }

    fn on_jsr(&mut self, _cpu: &mut dyn Cpu, bus: &mut dyn MemoryBus, _old_pc: u32, dest: u32) -> Result<HookOutcome> {
        self.validator.validate(&*bus, dest)?;
        Ok(HookOutcome::NotHandled)
    }

    fn on_jsr_indirect(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        old_pc: u32,
        dest: u32,
    ) -> Result<HookOutcome> {
        if let Some(word) = inline_trap_word(&*bus, &self.config.low_mem, old_pc) {
            return self.dispatch(cpu, bus, TrapSite::inline(old_pc, word));
        }
        if self.big_rom.get(&*bus, self.config.rom_base) == Some(dest) {
            tracing::info!(target: "oxid_palm::core", dest = format_args!("{dest:#010X}"), "jump into big ROM");
            self.session.schedule_reset(ResetKind::Soft);
            return Ok(HookOutcome::Handled);
        }
        self.validator.validate(&*bus, dest)?;
        Ok(HookOutcome::NotHandled)
    }

    fn on_link(&mut self, cpu: &mut dyn Cpu, _bus: &mut dyn MemoryBus, displacement: i16) -> Result<HookOutcome> {
        let sp = cpu
            .sp()
            .wrapping_sub(4)
            .wrapping_add(displacement as i32 as u32);
        self.stack.check_decrement(sp, &mut self.session)?;
        Ok(HookOutcome::NotHandled)
    }

    fn on_rts(&mut self, _cpu: &mut dyn Cpu, bus: &mut dyn MemoryBus, dest: u32) -> Result<HookOutcome> {
        self.validator.validate(&*bus, dest)?;
        Ok(HookOutcome::NotHandled)
    }

    fn on_rte(&mut self, _cpu: &mut dyn Cpu, bus: &mut dyn MemoryBus, dest: u32) -> Result<HookOutcome> {
        self.validator.validate(&*bus, dest)?;
        Ok(HookOutcome::NotHandled)
    }

    fn on_new_pc(&mut self, bus: &dyn MemoryBus, dest: u32) -> Result<()> {
        self.validator.validate(bus, dest)
    }

    fn on_new_sp(&mut self, cpu: &dyn Cpu, bus: &dyn MemoryBus, change: SpChange) -> Result<()> {
        let sp = cpu.sp();
        match change {
            SpChange::Assignment => self.stack.check_assignment(sp, bus, &self.heaps),
            SpChange::Decrement => self.stack.check_decrement(sp, &mut self.session)?,
            SpChange::Increment => self.stack.check_increment(sp),
            SpChange::KernelStackHack => self.stack.check_kernel_stack_hack(sp),
        }
        Ok(())
    }
}
