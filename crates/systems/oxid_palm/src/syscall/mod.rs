// crates/systems/oxid_palm/src/syscall/mod.rs
//! System-call dispatch: resolve the trap, give the debugger and the
//! patches their turn, then jump into the ROM body natively.

pub mod big_rom;
pub mod context;

pub use context::{inline_trap_word, CallForm, SystemCallContext, TrapSite};

use oxide_core::{Cpu, HookOutcome, MemoryBus};

use crate::config::LowMemLayout;
use crate::error::Result;
use crate::lowmem::LowMem;
use crate::pc::PcValidator;
use crate::session::{SuspendReason, Session};
use crate::stack::StackTracker;
use crate::symbols::SymbolResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRom {
    Yes,
    No,
}

/// Head and tail patches applied around ROM calls.
pub trait PatchDispatcher {
    /// `CallRom::No` means the patch fully emulated the call.
    fn handle_system_call(
        &mut self,
        ctx: &SystemCallContext,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
    ) -> CallRom;
}

/// Debugger hooks consulted before patches.
pub trait Debugger {
    /// `true` when the debugger takes over this call.
    fn handle_system_call(&mut self, ctx: &SystemCallContext) -> bool;

    fn has_breakpoints(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NoPatches;

impl PatchDispatcher for NoPatches {
    fn handle_system_call(&mut self, _: &SystemCallContext, _: &mut dyn Cpu, _: &mut dyn MemoryBus) -> CallRom {
        CallRom::Yes
    }
}

#[derive(Debug, Default)]
pub struct NoDebugger;

impl Debugger for NoDebugger {
    fn handle_system_call(&mut self, _: &SystemCallContext) -> bool {
        false
    }

    fn has_breakpoints(&self) -> bool {
        false
    }
}

/// Mutable core state the dispatcher needs for one call.
pub struct DispatchEnv<'a> {
    pub stack: &'a mut StackTracker,
    pub session: &'a mut Session,
    pub symbols: &'a dyn SymbolResolver,
}

pub struct SystemCallDispatcher {
    layout: LowMemLayout,
    validator: PcValidator,
    log_calls: bool,
    patches: Box<dyn PatchDispatcher>,
    debugger: Box<dyn Debugger>,
}

impl SystemCallDispatcher {
    pub fn new(layout: LowMemLayout, log_calls: bool) -> Self {
        Self {
            layout,
            validator: PcValidator::new(layout),
            log_calls,
            patches: Box::new(NoPatches),
            debugger: Box::new(NoDebugger),
        }
    }

    pub fn set_patches(&mut self, patches: Box<dyn PatchDispatcher>) {
        self.patches = patches;
    }

    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = debugger;
    }

    pub fn set_log_calls(&mut self, on: bool) {
        self.log_calls = on;
    }

    pub fn dispatch(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        site: TrapSite,
        env: DispatchEnv<'_>,
    ) -> Result<HookOutcome> {
        let DispatchEnv {
            stack,
            session,
            symbols,
        } = env;

        if !session.is_nested()
            && session.break_on_syscall()
            && LowMem::new(&*bus, &self.layout).mem_semaphore_free()
        {
            cpu.set_pc(site.instruction_pc());
            session.schedule_suspend(SuspendReason::SystemCallBreak);
            return Ok(HookOutcome::Handled);
        }

        let ctx = SystemCallContext::resolve(&*bus, &self.layout, site, cpu.sp()).map_err(|err| {
            tracing::error!(target: "oxid_palm::syscall", %err, pc = format_args!("{:#010X}", site.pc), "cannot resolve system call");
            err
        })?;

        if self.log_calls && !session.is_nested() {
            let name = symbols.function_at(&*bus, ctx.dest_pc2);
            tracing::info!(
                target: "oxid_palm::syscall",
                trap = format_args!("{:#06X}", ctx.trap_word()),
                function = name.as_deref().unwrap_or("?"),
                ref_num = ?ctx.ref_num,
                "system call"
            );
        }

        if self.debugger.handle_system_call(&ctx) {
            cpu.set_pc(site.instruction_pc());
            session.schedule_suspend(SuspendReason::Debugger);
            return Ok(HookOutcome::Handled);
        }

        if self.patches.handle_system_call(&ctx, cpu, bus) == CallRom::No {
            cpu.set_pc(ctx.site.next_pc);
            return Ok(HookOutcome::Handled);
        }

        let sp = cpu.sp().wrapping_sub(4);
        bus.write_u32(sp, ctx.site.next_pc);
        cpu.set_sp(sp);
        stack.check_decrement(sp, session)?;

        let dest = if self.debugger.has_breakpoints() {
            ctx.dest_pc1
        } else {
            ctx.dest_pc2
        };
        self.validator.validate(&*bus, dest)?;
        cpu.set_pc(dest);
        Ok(HookOutcome::Handled)
    }
}
