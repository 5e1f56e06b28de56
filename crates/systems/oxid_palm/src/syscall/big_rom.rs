// crates/systems/oxid_palm/src/syscall/big_rom.rs
//! Card headers and the big-ROM entry point.
//!
//! Devices with a small boot ROM jump into the big ROM's reset vector once
//! the small ROM has done its job. The emulator treats that jump as a soft
//! reset, so it needs to know where it lands.

use oxide_core::MemoryBus;

pub const CARD_SIGNATURE: u32 = 0xFEED_BEEF;
const SCAN_STEP: u32 = 0x1000;
const SCAN_LIMIT: u32 = 0x4_0000;
const BUS_OFFSET_MASK: u32 = 0x000F_FFFF;

/// Something a card header can be read out of.
pub trait ImageSource {
    fn bytes(&self, offset: u32, len: usize) -> Option<Vec<u8>>;
}

impl ImageSource for [u8] {
    fn bytes(&self, offset: u32, len: usize) -> Option<Vec<u8>> {
        let start = offset as usize;
        self.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }
}

/// The ROM as seen through the bus.
pub struct BusImage<'a> {
    pub bus: &'a dyn MemoryBus,
    pub base: u32,
}

impl ImageSource for BusImage<'_> {
    fn bytes(&self, offset: u32, len: usize) -> Option<Vec<u8>> {
        let addr = self.base.checked_add(offset)?;
        if !self.bus.valid_address(addr, len as u32) {
            return None;
        }
        if let Some(slice) = self.bus.real_slice(addr, len as u32) {
            return Some(slice.to_vec());
        }
        Some((0..len as u32).map(|i| self.bus.read(addr + i)).collect())
    }
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn c_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardHeader {
    pub init_stack: u32,
    pub reset_vector: u32,
    pub signature: u32,
    pub hdr_version: u16,
    pub flags: u16,
    pub name: String,
    pub manuf: String,
    pub version: u16,
    pub creation_date: u32,
    pub num_ram_blocks: u16,
    pub block_list_offset: u32,
    pub read_write_parms_offset: u32,
    pub read_write_parms_size: u32,
    pub read_only_parms_offset: u32,
    pub big_rom_offset: u32,
}

impl CardHeader {
    pub const SIZE: usize = 108;

    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            init_stack: be_u32(b, 0),
            reset_vector: be_u32(b, 4),
            signature: be_u32(b, 8),
            hdr_version: be_u16(b, 12),
            flags: be_u16(b, 14),
            name: c_string(&b[16..48]),
            manuf: c_string(&b[48..80]),
            version: be_u16(b, 80),
            creation_date: be_u32(b, 82),
            num_ram_blocks: be_u16(b, 86),
            block_list_offset: be_u32(b, 88),
            read_write_parms_offset: be_u32(b, 92),
            read_write_parms_size: be_u32(b, 96),
            read_only_parms_offset: be_u32(b, 100),
            big_rom_offset: be_u32(b, 104),
        })
    }

    pub fn read<S: ImageSource + ?Sized>(image: &S, offset: u32) -> Option<Self> {
        Self::parse(&image.bytes(offset, Self::SIZE)?)
    }

    pub fn is_signed(&self) -> bool {
        self.signature == CARD_SIGNATURE
    }
}

/// First signed header with `hdrVersion >= 2`, scanning 4 KB steps.
pub fn find_card_header<S: ImageSource + ?Sized>(image: &S) -> Option<(u32, CardHeader)> {
    (0..SCAN_LIMIT)
        .step_by(SCAN_STEP as usize)
        .filter_map(|off| CardHeader::read(image, off).map(|h| (off, h)))
        .find(|(_, h)| h.is_signed() && h.hdr_version >= 2)
}

/// The big ROM's card header and its offset from the ROM start.
pub fn find_big_rom<S: ImageSource + ?Sized>(image: &S) -> Option<(u32, CardHeader)> {
    let (_, small) = find_card_header(image)?;
    let offset = small.big_rom_offset & BUS_OFFSET_MASK;
    CardHeader::read(image, offset).map(|h| (offset, h))
}

pub fn locate_big_rom_entry<S: ImageSource + ?Sized>(image: &S) -> Option<u32> {
    if let Some((_, big)) = find_big_rom(image) {
        return Some(big.reset_vector);
    }
    // Version 1 headers predate the signature.
    CardHeader::read(image, 0)
        .filter(|h| h.hdr_version == 1)
        .map(|h| h.reset_vector)
}

/// Lazily computed big-ROM entry, kept per core.
#[derive(Debug, Clone, Default)]
pub struct BigRomEntry {
    cached: Option<Option<u32>>,
}

impl BigRomEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.cached = None;
    }

    pub fn get(&mut self, bus: &dyn MemoryBus, rom_base: u32) -> Option<u32> {
        *self.cached.get_or_insert_with(|| {
            let entry = locate_big_rom_entry(&BusImage { bus, base: rom_base });
            tracing::debug!(target: "oxid_palm::syscall", ?entry, "big ROM entry");
            entry
        })
    }
}
