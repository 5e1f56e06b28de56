// crates/systems/oxid_palm/src/error.rs
use oxide_core::RomError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PalmError>;

/// Why a destination PC was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPcReason {
    OddAddress,
    UnmappedAddress,
    /// ROM/Flash bank, but outside the image
    NotInRom,
    /// DRAM below the end of the system globals
    InLowMemory,
    /// Mapped bank refused the address
    InvalidMapped,
}

/// Failures while turning a trap into a call target.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapResolveError {
    #[error("unimplemented trap {trap_word:#06X}")]
    UnimplementedTrap { trap_word: u16 },
    #[error("invalid library reference number {ref_num} for trap {trap_word:#06X}")]
    InvalidLibraryRefNum { trap_word: u16, ref_num: u16 },
}

/// Fatal, non-returning conditions. Whoever receives one must stop
/// forward dispatch of the current call.
#[derive(Error, Debug)]
pub enum PalmError {
    #[error(transparent)]
    Trap(#[from] TrapResolveError),

    #[error("invalid PC {address:#010X}: {reason:?}")]
    InvalidPc {
        address: u32,
        reason: InvalidPcReason,
    },

    #[error("stack overflow: SP={sp:#010X} below floor {floor:#010X}")]
    StackOverflow { sp: u32, floor: u32 },

    #[error("ROM error: {0}")]
    Rom(#[from] RomError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no saved stack state")]
    Missing,

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}
