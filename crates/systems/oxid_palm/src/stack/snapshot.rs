// crates/systems/oxid_palm/src/stack/snapshot.rs
//! Versioned save/load of the stack tracker.
//!
//! Layout (little endian): magic, version u16, range count u32, ranges,
//! boot/kernel/interrupt slots, the four thresholds, then (version 2) the
//! kernel-overflow latch. Unset slots are stored with both bounds zero.

use std::io::{Read, Write};

use super::{StackList, StackRange, StackThresholds, StackTracker};
use crate::error::SnapshotError;

type Result<T> = std::result::Result<T, SnapshotError>;

const MAGIC: [u8; 4] = *b"OXSK";
/// Ranges, slots and thresholds.
pub const VERSION_CORE: u16 = 1;
/// Adds the kernel-overflow latch.
pub const VERSION_LATCH: u16 = 2;
const MAX_RANGES: u32 = 4096;

trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_range(&mut self, r: &StackRange) -> Result<()> {
        self.write_u32_le(r.bottom)?;
        self.write_u32_le(r.top)?;
        self.write_u32_le(r.low_water_mark)
    }

    fn write_slot(&mut self, slot: Option<StackRange>) -> Result<()> {
        match slot {
            Some(r) => self.write_range(&r),
            None => self.write_range(&StackRange {
                bottom: 0,
                top: 0,
                low_water_mark: 0,
            }),
        }
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_range(&mut self) -> Result<StackRange> {
        let bottom = self.read_u32_le()?;
        let top = self.read_u32_le()?;
        let low_water_mark = self.read_u32_le()?;
        if bottom > top {
            return Err(SnapshotError::Corrupt("stack bottom above top"));
        }
        Ok(StackRange {
            bottom,
            top,
            low_water_mark,
        })
    }

    fn read_slot(&mut self) -> Result<Option<StackRange>> {
        let r = self.read_range()?;
        Ok((r.bottom != 0 || r.top != 0).then_some(r))
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

impl StackTracker {
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        self.save_with_version(w, VERSION_LATCH)
    }

    fn save_with_version<W: Write>(&self, w: &mut W, version: u16) -> Result<()> {
        w.write_all(&MAGIC)?;
        w.write_u16_le(version)?;
        let count: u32 = self
            .stacks
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many stacks"))?;
        w.write_u32_le(count)?;
        for r in self.stacks.iter() {
            w.write_range(r)?;
        }
        w.write_slot(self.boot)?;
        w.write_slot(self.kernel)?;
        w.write_slot(self.interrupt)?;
        w.write_u32_le(self.limits.high)?;
        w.write_u32_le(self.limits.low_water_mark)?;
        w.write_u32_le(self.limits.low_warn)?;
        w.write_u32_le(self.limits.low)?;
        if version >= VERSION_LATCH {
            w.write_u8(self.kernel_stack_overflowed as u8)?;
        }
        Ok(())
    }

    /// Replaces the tracker state. On error the tracker is left untouched.
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<()> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if !(VERSION_CORE..=VERSION_LATCH).contains(&version) {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let count = r.read_u32_le()?;
        if count > MAX_RANGES {
            return Err(SnapshotError::Corrupt("stack count out of range"));
        }
        let mut stacks = StackList::new();
        for _ in 0..count {
            let range = r.read_range()?;
            stacks
                .insert(range)
                .map_err(|_| SnapshotError::Corrupt("overlapping stacks"))?;
        }
        let boot = r.read_slot()?;
        let kernel = r.read_slot()?;
        let interrupt = r.read_slot()?;
        let limits = StackThresholds {
            high: r.read_u32_le()?,
            low_water_mark: r.read_u32_le()?,
            low_warn: r.read_u32_le()?,
            low: r.read_u32_le()?,
        };
        let kernel_stack_overflowed = if version >= VERSION_LATCH {
            match r.read_u8()? {
                0 => false,
                1 => true,
                _ => return Err(SnapshotError::Corrupt("bad latch value")),
            }
        } else {
            false
        };

        *self = StackTracker {
            stacks,
            boot,
            kernel,
            interrupt,
            limits,
            kernel_stack_overflowed,
            warned: false,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Chunk, Heap, HeapModel};
    use crate::memory::PalmMemory;
    use crate::session::Session;
    use crate::stack::{AMX_TAG, FENCE_TAG};
    use oxide_core::{MemoryBus, Rom};
    use std::io::Cursor;

    /// Boot stack, then kernel + interrupt stacks, then an overflowed
    /// small kernel stack.
    fn busy_tracker() -> StackTracker {
        let mut bus = PalmMemory::new(0x1_0000, 0x1_0000, Rom::new_empty(0x100));
        let mut heaps = HeapModel::new();
        heaps.insert_heap(Heap::new(0, 0x0800..0x0820).with_chunk(Chunk::new(0x2000, 8, 0x400, 0)));
        // interrupt [0x200C, 0x2100], kernel [0x2104, 0x2300]
        bus.write_u32(0x2008, FENCE_TAG);
        bus.write_u32(0x2100, FENCE_TAG);
        bus.write_u32(0x2300, AMX_TAG);
        bus.write_u32(0x2304, FENCE_TAG);

        let mut t = StackTracker::new();
        let mut session = Session::new();
        t.check_assignment(0x8000, &bus, &heaps);
        t.check_assignment(0x2300, &bus, &heaps);
        t.check_decrement(0x2200, &mut session).unwrap();
        t.check_decrement(0x2104, &mut session).unwrap();
        assert!(t.kernel_stack_overflowed());
        t
    }

    #[test]
    fn test_round_trip_reproduces_state() {
        let t = busy_tracker();
        let mut buf = Vec::new();
        t.save(&mut buf).unwrap();

        let mut fresh = StackTracker::new();
        fresh.load(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(fresh.stacks(), t.stacks());
        assert_eq!(fresh.boot_stack(), t.boot_stack());
        assert_eq!(fresh.kernel_stack(), t.kernel_stack());
        assert_eq!(fresh.interrupt_stack(), t.interrupt_stack());
        assert_eq!(fresh.thresholds(), t.thresholds());
        assert!(fresh.kernel_stack_overflowed());
    }

    #[test]
    fn test_version_one_defaults_latch_to_clear() {
        let t = busy_tracker();
        let mut buf = Vec::new();
        t.save_with_version(&mut buf, VERSION_CORE).unwrap();

        let mut fresh = StackTracker::new();
        fresh.load(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(fresh.stacks(), t.stacks());
        assert_eq!(fresh.kernel_stack(), t.kernel_stack());
        assert_eq!(fresh.thresholds(), t.thresholds());
        assert!(!fresh.kernel_stack_overflowed());
    }

    #[test]
    fn test_malformed_data_is_rejected_without_side_effects() {
        let t = busy_tracker();
        let mut buf = Vec::new();
        t.save(&mut buf).unwrap();

        let mut bad_version = buf.clone();
        bad_version[4] = 9;
        let mut fresh = StackTracker::new();
        assert!(matches!(
            fresh.load(&mut Cursor::new(&bad_version)),
            Err(SnapshotError::UnsupportedVersion(9))
        ));
        assert!(fresh.stacks().is_empty());

        let truncated = &buf[..buf.len() - 3];
        assert!(matches!(
            fresh.load(&mut Cursor::new(truncated)),
            Err(SnapshotError::Io(_))
        ));

        assert!(matches!(
            fresh.load(&mut Cursor::new(b"NOPE\x02\x00")),
            Err(SnapshotError::InvalidMagic)
        ));
        assert!(!fresh.has_current());
    }
}
