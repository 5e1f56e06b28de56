// crates/systems/oxid_palm/src/classify/allowance.rs
//! Known historical OS behaviour that touches memory the classifier would
//! otherwise flag. Rules run in order; the first one that answers wins.

use std::ops::{Range, RangeInclusive};

use oxide_core::MemoryBus;

use super::{AccessType, AccessorKind};
use crate::config::{LowMemLayout, OsVersion};
use crate::lowmem::LowMem;
use crate::symbols::SymbolResolver;

/// Everything a rule may look at.
pub struct AllowanceQuery<'a> {
    pub kind: AccessType,
    pub address: u32,
    pub size: u32,
    pub for_read: bool,
    pub pc: u32,
    pub accessor: AccessorKind,
    pub os_version: OsVersion,
    pub layout: &'a LowMemLayout,
    pub bus: &'a dyn MemoryBus,
    pub symbols: &'a dyn SymbolResolver,
    /// Return addresses, innermost first.
    pub call_chain: &'a [u32],
}

impl AllowanceQuery<'_> {
    pub fn current_function(&self) -> Option<String> {
        self.symbols.function_at(self.bus, self.pc)
    }

    /// True when the PC or any caller on the chain resolves to a match.
    pub fn executing_in(&self, function: &FunctionMatch) -> bool {
        std::iter::once(self.pc)
            .chain(self.call_chain.iter().copied())
            .filter_map(|pc| self.symbols.function_at(self.bus, pc))
            .any(|name| function.matches(&name))
    }
}

pub trait AllowanceRule {
    fn name(&self) -> &str;

    /// `Some(outcome)` overrides the classification.
    fn check(&self, query: &AllowanceQuery<'_>) -> Option<AccessType>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionMatch {
    Exact(String),
    OneOf(Vec<String>),
}

impl FunctionMatch {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            FunctionMatch::Exact(f) => name == f,
            FunctionMatch::OneOf(names) => names.iter().any(|f| f == name),
        }
    }
}

/// Data-driven rule: every predicate that is set must hold.
#[derive(Debug, Clone)]
pub struct Allowance {
    name: String,
    kinds: Vec<AccessType>,
    address: Option<Range<u32>>,
    size: Option<u32>,
    for_read: Option<bool>,
    versions: Option<RangeInclusive<OsVersion>>,
    accessors: Vec<AccessorKind>,
    inside: Option<FunctionMatch>,
    outcome: AccessType,
}

impl Allowance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kinds: Vec::new(),
            address: None,
            size: None,
            for_read: None,
            versions: None,
            accessors: Vec::new(),
            inside: None,
            outcome: AccessType::Ok,
        }
    }

    pub fn kind(mut self, kind: AccessType) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn at(mut self, address: Range<u32>) -> Self {
        self.address = Some(address);
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn reads_only(mut self) -> Self {
        self.for_read = Some(true);
        self
    }

    pub fn writes_only(mut self) -> Self {
        self.for_read = Some(false);
        self
    }

    pub fn versions(mut self, versions: RangeInclusive<OsVersion>) -> Self {
        self.versions = Some(versions);
        self
    }

    pub fn before(self, version: OsVersion) -> Self {
        let last = if version.minor > 0 {
            OsVersion::new(version.major, version.minor - 1)
        } else {
            OsVersion::new(version.major.saturating_sub(1), u8::MAX)
        };
        self.versions(OsVersion::new(0, 0)..=last)
    }

    pub fn accessor(mut self, accessor: AccessorKind) -> Self {
        self.accessors.push(accessor);
        self
    }

    pub fn inside(mut self, function: &str) -> Self {
        self.inside = Some(FunctionMatch::Exact(function.to_string()));
        self
    }

    pub fn inside_any(mut self, functions: &[&str]) -> Self {
        self.inside = Some(FunctionMatch::OneOf(functions.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn outcome(mut self, outcome: AccessType) -> Self {
        self.outcome = outcome;
        self
    }
}

impl AllowanceRule for Allowance {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, q: &AllowanceQuery<'_>) -> Option<AccessType> {
        if !self.kinds.is_empty() && !self.kinds.contains(&q.kind) {
            return None;
        }
        if let Some(range) = &self.address {
            let end = q.address.saturating_add(q.size);
            if q.address < range.start || end > range.end {
                return None;
            }
        }
        if self.size.is_some_and(|s| s != q.size) {
            return None;
        }
        if self.for_read.is_some_and(|r| r != q.for_read) {
            return None;
        }
        if self.versions.as_ref().is_some_and(|v| !v.contains(&q.os_version)) {
            return None;
        }
        if !self.accessors.is_empty() && !self.accessors.contains(&q.accessor) {
            return None;
        }
        // Symbol lookups are the expensive part; keep them last.
        if self.inside.as_ref().is_some_and(|f| !q.executing_in(f)) {
            return None;
        }
        Some(self.outcome)
    }
}

/// Rule backed by a closure, for checks that need to look at code.
pub struct FnRule<F> {
    name: String,
    check: F,
}

impl<F> FnRule<F>
where
    F: Fn(&AllowanceQuery<'_>) -> Option<AccessType>,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> AllowanceRule for FnRule<F>
where
    F: Fn(&AllowanceQuery<'_>) -> Option<AccessType>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, query: &AllowanceQuery<'_>) -> Option<AccessType> {
        (self.check)(query)
    }
}

const MOVE_L_ABS_W_A1: u16 = 0x2278;
const MOVE_L_D16_A1_A1: u16 = 0x2269;

/// Memory manager entry points that walk or rewrite heap structures.
const MEMORY_MANAGER: &[&str] = &[
    "MemChunkFree",
    "MemChunkNew",
    "MemHandleFree",
    "MemHandleNew",
    "MemHandleResize",
    "MemHeapCheck",
    "MemHeapCompact",
    "MemHeapFreeBytes",
    "MemHeapInit",
    "MemHeapScramble",
    "MemPtrNew",
    "MemPtrResize",
];

#[derive(Default)]
pub struct AllowanceTable {
    rules: Vec<Box<dyn AllowanceRule>>,
}

impl AllowanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in rule set.
    pub fn seeded() -> Self {
        let mut table = Self::new();

        // Inline trap glue in every application reads the dispatch table
        // pointer and one table entry.
        table.push(FnRule::new("inline trap dispatch", |q: &AllowanceQuery<'_>| {
            if q.kind != AccessType::SystemGlobal || !q.for_read || q.size != 4 {
                return None;
            }
            match q.bus.read_u16(q.pc) {
                MOVE_L_ABS_W_A1 if q.address == q.layout.sys_dispatch_table_p => {
                    Some(AccessType::Ok)
                }
                MOVE_L_D16_A1_A1 => {
                    let low = LowMem::new(q.bus, q.layout);
                    let table = low.dispatch_table() as u64;
                    let end = table + 4 * low.dispatch_table_size() as u64;
                    let addr = q.address as u64;
                    (addr >= table && addr + 4 <= end).then_some(AccessType::Ok)
                }
                _ => None,
            }
        }));

        table.push(
            Allowance::new("system code owns the globals")
                .kind(AccessType::LowMemory)
                .kind(AccessType::SystemGlobal)
                .kind(AccessType::ScreenBuffer)
                .kind(AccessType::UnlockedChunk)
                .accessor(AccessorKind::Rom)
                .accessor(AccessorKind::RamSystem),
        );
        table.push(
            Allowance::new("memory manager internals")
                .kind(AccessType::MemMgrInternal)
                .kind(AccessType::FreeChunk)
                .kind(AccessType::UnlockedChunk)
                .accessor(AccessorKind::Rom)
                .accessor(AccessorKind::RamSystem)
                .inside_any(MEMORY_MANAGER),
        );
        table.push(
            Allowance::new("leak check walks free chunks")
                .kind(AccessType::FreeChunk)
                .reads_only()
                .inside("PrvFindMemoryLeaks"),
        );
        table.push(
            Allowance::new("launch reads unlocked app info block")
                .kind(AccessType::UnlockedChunk)
                .reads_only()
                .before(OsVersion::V3_0)
                .inside("SysAppLaunch"),
        );
        table.push(
            Allowance::new("field reads text handle after unlock")
                .kind(AccessType::UnlockedChunk)
                .reads_only()
                .versions(OsVersion::V3_0..=OsVersion::V3_5)
                .inside("FldHandleEvent"),
        );
        table
    }

    pub fn push<R: AllowanceRule + 'static>(&mut self, rule: R) {
        self.rules.push(Box::new(rule));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First override, with the rule that produced it.
    pub fn apply(&self, query: &AllowanceQuery<'_>) -> Option<(&str, AccessType)> {
        self.rules
            .iter()
            .find_map(|rule| rule.check(query).map(|outcome| (rule.name(), outcome)))
    }
}
