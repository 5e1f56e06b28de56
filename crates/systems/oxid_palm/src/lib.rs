// crates/systems/oxid_palm/src/lib.rs
//! Palm OS emulation core (DragonBall): stack tracking, system-call
//! dispatch, PC validation and memory access checking.
//!
//! The 68000 interpreter lives outside this crate; it talks to
//! [`PalmCore`] through [`oxide_core::CpuHooks`].

pub mod classify;
pub mod config;
pub mod emulator;
pub mod error;
pub mod heap;
pub mod lowmem;
pub mod memory;
pub mod pc;
pub mod session;
pub mod stack;
pub mod symbols;
pub mod syscall;
pub mod syscode;

pub use classify::{AccessType, AccessorKind, WhatHappened};
pub use config::{AccessChecks, CoreConfig, LowMemLayout, OsVersion};
pub use emulator::PalmCore;
pub use error::{InvalidPcReason, PalmError, Result, SnapshotError, TrapResolveError};
pub use memory::PalmMemory;
pub use session::{DeferredError, ResetKind, Session, SuspendReason};
