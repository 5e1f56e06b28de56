// crates/systems/oxid_palm/src/classify/ui.rs
//! Direct application access to window, form and form-object structures.
//!
//! Applications are expected to go through the UI traps. A few fields were
//! commonly read directly before the OS grew an accessor for them; those
//! stay allowed on the older versions.

use std::collections::HashSet;
use std::ops::Range;

use oxide_core::MemoryBus;

use crate::config::OsVersion;

const WINDOW_SIZE: u32 = 40;
const WINDOW_FLAGS: u32 = 8;
const WINDOW_NEXT: u32 = 36;
const DIALOG_FLAG: u16 = 0x0200;

const FORM_SIZE: u32 = 66;
const FORM_NUM_OBJECTS: u32 = 60;
const FORM_OBJECTS: u32 = 62;
const FORM_OBJECT_ENTRY: u32 = 6;

const MAX_WINDOWS: usize = 256;
const MAX_OBJECTS: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UiObjectKind {
    Field = 0,
    Control = 1,
    List = 2,
    Table = 3,
    Bitmap = 4,
    Line = 5,
    Frame = 6,
    Rectangle = 7,
    Label = 8,
    Title = 9,
    Popup = 10,
    GraffitiState = 11,
    Gadget = 12,
    ScrollBar = 13,
}

impl UiObjectKind {
    pub fn from_type(t: u8) -> Option<Self> {
        use UiObjectKind::*;
        Some(match t {
            0 => Field,
            1 => Control,
            2 => List,
            3 => Table,
            4 => Bitmap,
            5 => Line,
            6 => Frame,
            7 => Rectangle,
            8 => Label,
            9 => Title,
            10 => Popup,
            11 => GraffitiState,
            12 => Gadget,
            13 => ScrollBar,
            _ => return None,
        })
    }

    pub fn size(self) -> u32 {
        use UiObjectKind::*;
        match self {
            Field => 40,
            Control => 20,
            List => 32,
            Table => 74,
            Bitmap => 8,
            Line => 10,
            Frame => 14,
            Rectangle => 10,
            Label => 14,
            Title => 12,
            Popup => 4,
            GraffitiState => 4,
            Gadget => 20,
            ScrollBar => 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UiStruct {
    Window,
    Form,
    Object(UiObjectKind),
}

/// A field sub-range applications may read directly.
struct FieldRule {
    of: UiStruct,
    field: Range<u32>,
    /// `None`: on every version.
    before: Option<OsVersion>,
}

const fn rule(of: UiStruct, field: Range<u32>, before: Option<OsVersion>) -> FieldRule {
    FieldRule { of, field, before }
}

const PRE_35: Option<OsVersion> = Some(OsVersion::V3_5);

const READABLE: &[FieldRule] = &[
    rule(UiStruct::Window, 8..10, PRE_35),
    rule(UiStruct::Window, 10..18, PRE_35),
    rule(UiStruct::Form, 40..42, None),
    rule(UiStruct::Form, 42..44, PRE_35),
    rule(UiStruct::Object(UiObjectKind::Field), 0..2, None),
    rule(UiStruct::Object(UiObjectKind::Field), 10..16, PRE_35),
    rule(UiStruct::Object(UiObjectKind::Field), 24..26, PRE_35),
    rule(UiStruct::Object(UiObjectKind::Control), 0..2, None),
    rule(UiStruct::Object(UiObjectKind::Control), 14..16, PRE_35),
    rule(UiStruct::Object(UiObjectKind::List), 0..2, None),
    rule(UiStruct::Object(UiObjectKind::List), 18..22, PRE_35),
    rule(UiStruct::Object(UiObjectKind::Table), 0..2, None),
    rule(UiStruct::Object(UiObjectKind::Frame), 0..2, None),
    rule(UiStruct::Object(UiObjectKind::Label), 0..2, None),
    rule(UiStruct::Object(UiObjectKind::Label), 10..14, PRE_35),
    rule(UiStruct::Object(UiObjectKind::Title), 8..12, PRE_35),
    rule(UiStruct::Object(UiObjectKind::ScrollBar), 12..18, PRE_35),
];

fn allowed(of: UiStruct, offset: u32, size: u32, for_read: bool, version: OsVersion) -> bool {
    // No accessor gives gadget callbacks their own data.
    if of == UiStruct::Object(UiObjectKind::Gadget) {
        return true;
    }
    if !for_read {
        return false;
    }
    let end = offset + size;
    READABLE.iter().any(|r| {
        r.of == of
            && r.field.start <= offset
            && end <= r.field.end
            && !matches!(r.before, Some(v) if version >= v)
    })
}

/// Where an access into UI memory landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAccess {
    Allowed,
    Window { window: u32 },
    Form { form: u32 },
    FormObject {
        form: u32,
        object: u32,
        kind: UiObjectKind,
    },
}

fn overlaps(start: u32, len: u32, addr: u32, size: u32) -> bool {
    let end = start as u64 + len as u64;
    (addr as u64) < end && start as u64 <= addr as u64 + size.max(1) as u64 - 1
}

/// Walks the window list from `first_window`. `None` when the access
/// touches no UI structure.
pub fn check_ui_access(
    bus: &dyn MemoryBus,
    first_window: u32,
    addr: u32,
    size: u32,
    for_read: bool,
    version: OsVersion,
) -> Option<UiAccess> {
    let mut seen = HashSet::new();
    let mut window = first_window;
    while window != 0 && seen.len() < MAX_WINDOWS && seen.insert(window) {
        if window & 1 != 0 || !bus.valid_address(window, WINDOW_SIZE) {
            tracing::debug!(target: "oxid_palm::ui", window = format_args!("{window:#010X}"), "window list ends in garbage");
            return None;
        }
        let is_form = bus.read_u16(window.wrapping_add(WINDOW_FLAGS)) & DIALOG_FLAG != 0;

        if is_form {
            if let Some(hit) = check_form_objects(bus, window, addr, size, for_read, version) {
                return Some(hit);
            }
        }

        let (of, len) = if is_form {
            (UiStruct::Form, FORM_SIZE)
        } else {
            (UiStruct::Window, WINDOW_SIZE)
        };
        if overlaps(window, len, addr, size) {
            return Some(
                if addr >= window && allowed(of, addr - window, size, for_read, version) {
                    UiAccess::Allowed
                } else if is_form {
                    UiAccess::Form { form: window }
                } else {
                    UiAccess::Window { window }
                },
            );
        }
        window = bus.read_u32(window.wrapping_add(WINDOW_NEXT));
    }
    None
}

fn check_form_objects(
    bus: &dyn MemoryBus,
    form: u32,
    addr: u32,
    size: u32,
    for_read: bool,
    version: OsVersion,
) -> Option<UiAccess> {
    let count = bus.read_u16(form.wrapping_add(FORM_NUM_OBJECTS)).min(MAX_OBJECTS) as u32;
    let list = bus.read_u32(form.wrapping_add(FORM_OBJECTS));
    if list == 0 || count == 0 {
        return None;
    }
    if overlaps(list, count * FORM_OBJECT_ENTRY, addr, size) {
        return Some(UiAccess::Form { form });
    }
    for i in 0..count {
        // A list running off the top of the address space ends here.
        let Some(entry) = list.checked_add(i * FORM_OBJECT_ENTRY) else {
            break;
        };
        let Some(kind) = UiObjectKind::from_type(bus.read(entry)) else {
            continue;
        };
        let Some(object) = entry.checked_add(2).map(|p| bus.read_u32(p)) else {
            break;
        };
        if object == 0 || !overlaps(object, kind.size(), addr, size) {
            continue;
        }
        let ok = addr >= object && allowed(UiStruct::Object(kind), addr - object, size, for_read, version);
        return Some(if ok {
            UiAccess::Allowed
        } else {
            UiAccess::FormObject { form, object, kind }
        });
    }
    None
}
