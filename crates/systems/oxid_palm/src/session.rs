// crates/systems/oxid_palm/src/session.rs
//! The slice of the emulation session the core talks to: nesting, break
//! on system call, pending suspend/reset and the deferred-error queue.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use crate::classify::ui::UiObjectKind;
use crate::classify::AccessType;

/// A fault queued for the UI layer instead of being raised mid-instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
    StackNearlyFull {
        sp: u32,
        stack_low: u32,
        stack_high: u32,
    },
    Access {
        kind: AccessType,
        address: u32,
        size: u32,
        for_read: bool,
        pc: u32,
    },
    WindowAccess {
        address: u32,
        size: u32,
        for_read: bool,
        window: u32,
    },
    FormAccess {
        address: u32,
        size: u32,
        for_read: bool,
        form: u32,
    },
    FormObjectAccess {
        address: u32,
        size: u32,
        for_read: bool,
        form: u32,
        object: u32,
        kind: UiObjectKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    SystemCallBreak,
    Debugger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// The OS jumped into the big ROM entry point.
    Soft,
    /// Saved state could not be reloaded.
    Reboot,
}

#[derive(Debug, Default)]
pub struct Session {
    nested: u32,
    break_on_syscall: bool,
    suspend: Option<SuspendReason>,
    reset: Option<ResetKind>,
    deferred: VecDeque<DeferredError>,
    stopped: u32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_nested(&self) -> bool {
        self.nested > 0
    }

    /// Host-initiated calls into emulated code run nested.
    pub fn begin_nested_call(&mut self) {
        self.nested += 1;
    }

    pub fn end_nested_call(&mut self) {
        self.nested = self.nested.saturating_sub(1);
    }

    pub fn break_on_syscall(&self) -> bool {
        self.break_on_syscall
    }

    pub fn set_break_on_syscall(&mut self, on: bool) {
        self.break_on_syscall = on;
    }

    pub fn schedule_suspend(&mut self, reason: SuspendReason) {
        tracing::debug!(?reason, "suspend scheduled");
        self.suspend = Some(reason);
    }

    pub fn take_suspend(&mut self) -> Option<SuspendReason> {
        self.suspend.take()
    }

    pub fn schedule_reset(&mut self, kind: ResetKind) {
        tracing::info!(?kind, "reset scheduled");
        self.reset = Some(kind);
    }

    pub fn take_reset(&mut self) -> Option<ResetKind> {
        self.reset.take()
    }

    pub fn schedule_deferred_error(&mut self, err: DeferredError) {
        tracing::debug!(?err, "deferred error queued");
        self.deferred.push_back(err);
    }

    pub fn pending_errors(&self) -> impl Iterator<Item = &DeferredError> {
        self.deferred.iter()
    }

    /// Hands the queued errors to the UI layer, oldest first.
    pub fn drain_deferred_errors(&mut self) -> Vec<DeferredError> {
        self.deferred.drain(..).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped > 0
    }

    /// Pauses the emulated CPU at an instruction boundary until the guard
    /// drops. Stoppers nest.
    pub fn stop(&mut self) -> Stopper<'_> {
        self.stopped += 1;
        Stopper { session: self }
    }
}

pub struct Stopper<'a> {
    session: &'a mut Session,
}

impl Deref for Stopper<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for Stopper<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for Stopper<'_> {
    fn drop(&mut self) {
        self.session.stopped -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stoppers_nest() {
        let mut session = Session::new();
        {
            let mut outer = session.stop();
            assert!(outer.is_stopped());
            {
                let inner = outer.stop();
                assert!(inner.is_stopped());
            }
            assert!(outer.is_stopped());
        }
        assert!(!session.is_stopped());
    }

    #[test]
    fn test_deferred_errors_drain_in_order() {
        let mut session = Session::new();
        session.schedule_deferred_error(DeferredError::StackNearlyFull {
            sp: 0x1000,
            stack_low: 0x0F00,
            stack_high: 0x2000,
        });
        session.schedule_deferred_error(DeferredError::Access {
            kind: AccessType::LowMemory,
            address: 0x10,
            size: 4,
            for_read: true,
            pc: 0x4000,
        });
        let errs = session.drain_deferred_errors();
        assert_eq!(errs.len(), 2);
        assert!(matches!(errs[0], DeferredError::StackNearlyFull { .. }));
        assert_eq!(session.pending_errors().count(), 0);
    }

    #[test]
    fn test_nesting_never_underflows() {
        let mut session = Session::new();
        session.end_nested_call();
        assert!(!session.is_nested());
        session.begin_nested_call();
        assert!(session.is_nested());
        session.end_nested_call();
        assert!(!session.is_nested());
    }
}
