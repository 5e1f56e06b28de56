mod common;

use common::{install_dispatch_table, memory, palm_core, TestCpu};
use oxide_core::{CpuHooks, MemoryBus, SpChange};
use oxid_palm::heap::{Chunk, Heap};
use oxid_palm::memory::ROM_BASE;
use oxid_palm::symbols::SymbolTable;
use oxid_palm::{AccessChecks, AccessType, DeferredError, LowMemLayout, PalmCore, PalmMemory, WhatHappened};

const APP_PC: u32 = 0x8000;
const FREE_BODY: u32 = 0x4028;
const LOCKED_BODY: u32 = 0x4070;

fn machine() -> (PalmCore, PalmMemory) {
    let mut mem = memory();
    install_dispatch_table(&mut mem);
    let mut core = palm_core();
    core.heaps_mut().insert_heap(
        Heap::new(0, 0x4000..0x4020)
            .with_chunk(Chunk::new(0x4020, 8, 0x40, 0).free())
            .with_chunk(Chunk::new(0x4068, 8, 0x40, 0))
            .with_chunk(Chunk::new(0x40B0, 8, 0x400, 0)),
    );
    core.refresh_meta(&mut mem);
    (core, mem)
}

fn reported(core: &mut PalmCore) -> Vec<AccessType> {
    core.session_mut()
        .drain_deferred_errors()
        .into_iter()
        .filter_map(|e| match e {
            DeferredError::Access { kind, .. } => Some(kind),
            _ => None,
        })
        .collect()
}

#[test]
fn test_application_touching_vectors_is_reported() {
    let (mut core, mem) = machine();
    let cpu = TestCpu::at(APP_PC, 0xF000);

    let _ = mem.read_u32(0x0010);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 1);
    assert_eq!(
        core.session_mut().drain_deferred_errors(),
        vec![DeferredError::Access {
            kind: AccessType::LowMemory,
            address: 0x0010,
            size: 4,
            for_read: true,
            pc: APP_PC,
        }]
    );
}

#[test]
fn test_rom_code_may_touch_globals() {
    let (mut core, mut mem) = machine();
    let pc = ROM_BASE + 0x100;
    let cpu = TestCpu::at(pc, 0xF000);

    let _ = mem.read_u32(0x0010);
    mem.write_u16(0x0200, 0x1234);
    assert_eq!(core.after_instruction(&cpu, &mem, pc), 0);
    assert!(reported(&mut core).is_empty());
}

#[test]
fn test_inline_dispatch_may_read_table_pointer() {
    let (mut core, mut mem) = machine();
    let layout = LowMemLayout::default();
    mem.write_u16(APP_PC, 0x2278);
    let cpu = TestCpu::at(APP_PC, 0xF000);

    let _ = mem.read_u32(layout.sys_dispatch_table_p);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 0);

    let _ = mem.read_u32(layout.sys_dispatch_table_p);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC + 2), 1);
    assert_eq!(reported(&mut core), vec![AccessType::SystemGlobal]);
}

#[test]
fn test_free_and_unlocked_chunks() {
    let (mut core, mut mem) = machine();
    let cpu = TestCpu::at(APP_PC, 0xF000);

    let _ = mem.read_u16(FREE_BODY + 8);
    let _ = mem.read_u16(LOCKED_BODY + 8);
    mem.write(0x4068, 0);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 2);
    assert_eq!(
        reported(&mut core),
        vec![AccessType::FreeChunk, AccessType::MemMgrInternal]
    );

    core.chunk_lock_changed(LOCKED_BODY, 0);
    core.refresh_meta(&mut mem);
    let _ = mem.read_u16(LOCKED_BODY + 8);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 1);
    assert_eq!(reported(&mut core), vec![AccessType::UnlockedChunk]);
}

#[test]
fn test_application_named_like_memory_manager_is_reported() {
    let (mut core, mut mem) = machine();
    let mut symbols = SymbolTable::new();
    symbols.insert(APP_PC..APP_PC + 0x100, "MemoPadHandleEvent");
    core.set_symbols(Box::new(symbols));
    let cpu = TestCpu::at(APP_PC, 0xF000);

    mem.write_u16(FREE_BODY + 8, 0);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 1);
    assert_eq!(reported(&mut core), vec![AccessType::FreeChunk]);
}

#[test]
fn test_switched_off_checks_record_nothing() {
    let (mut core, mut mem) = machine();
    let cpu = TestCpu::at(APP_PC, 0xF000);

    core.classifier_mut()
        .set_checks(AccessChecks::all() - AccessChecks::FREE_CHUNK);
    core.refresh_meta(&mut mem);
    let _ = mem.read_u16(FREE_BODY);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 0);
    let _ = mem.read_u16(0x0008);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 1);
    reported(&mut core);

    core.classifier_mut().set_enabled(false);
    core.refresh_meta(&mut mem);
    let _ = mem.read_u16(0x0008);
    assert!(mem.take_access_attempts().is_empty());
    let mut what = WhatHappened::new(0x0008, 2, true);
    assert_eq!(core.classify_access(&cpu, &mem, APP_PC, &mut what), AccessType::Ok);
}

#[test]
fn test_below_stack_pointer_is_low_stack() {
    let (mut core, mem) = machine();
    let sp = 0x4400;
    let cpu = TestCpu::at(APP_PC, sp);
    core.on_new_sp(&cpu, &mem, SpChange::Assignment).unwrap();

    let mut what = WhatHappened::new(sp - 0x10, 4, false);
    assert_eq!(core.classify_access(&cpu, &mem, APP_PC, &mut what), AccessType::LowStack);
    let mut what = WhatHappened::new(sp, 4, true);
    assert_eq!(core.classify_access(&cpu, &mem, APP_PC, &mut what), AccessType::Unknown);
}

#[test]
fn test_screen_buffer() {
    let (mut core, mut mem) = machine();
    let cpu = TestCpu::at(APP_PC, 0xF000);
    core.classifier_mut().set_screen(Some(0xA000..0xA800));
    core.refresh_meta(&mut mem);

    mem.write_u32(0xA100, 0xFFFF_FFFF);
    assert_eq!(core.after_instruction(&cpu, &mem, APP_PC), 1);
    assert_eq!(reported(&mut core), vec![AccessType::ScreenBuffer]);
}
