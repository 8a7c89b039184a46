//! Global pointer discovery.
//!
//! Two independent queries over the mutable data section: finding the
//! slot holding an exact pointer value (singleton discovery), and
//! linking a known code site to the data-section globals it touches
//! through position-relative operands.

use crate::pe::{ImageContainer, Section};

/// A data-section word equal to a queried virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointerSlot {
    pub slot_offset: usize,
    pub slot_rva: u32,
}

/// Kind of instruction referencing a global.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalRefKind {
    Lea,
    Mov,
}

/// A position-relative operand near a code site that resolves into
/// the data section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalRef {
    /// File offset of the referencing instruction.
    pub instr_offset: usize,
    /// RVA of the referencing instruction.
    pub instr_rva: u32,
    /// RVA of the referenced data slot.
    pub target_rva: u32,
    pub kind: GlobalRefKind,
}

/// Scan a data section at 8-byte alignment for words equal to
/// `target_va`.
pub fn find_pointer_slots(
    image: &ImageContainer,
    data: &Section,
    target_va: u64,
) -> Vec<PointerSlot> {
    let start = data.file_offset as usize;
    let Some(bytes) = image.read_bytes(start, data.file_size as usize) else {
        return Vec::new();
    };

    let mut slots = Vec::new();
    let mut i = 0;
    while i + 8 <= bytes.len() {
        let val = u64::from_le_bytes(bytes[i..i + 8].try_into().unwrap());
        if val == target_va {
            slots.push(PointerSlot {
                slot_offset: start + i,
                slot_rva: data.virtual_address + i as u32,
            });
        }
        i += 8;
    }
    slots
}

/// Scan a byte window around a code site for RIP-relative MOV/LEA
/// operands whose resolved target falls inside the data section.
///
/// Used to tie a string-referencing code site to the specific global
/// slot it reads or takes the address of.
pub fn find_globals_near(
    image: &ImageContainer,
    code: &Section,
    data: &Section,
    site_offset: usize,
    window: usize,
) -> Vec<GlobalRef> {
    let d = image.bytes();
    let code_start = code.file_offset as usize;
    let code_end = code_start + code.file_size as usize;

    let scan_start = code_start.max(site_offset.saturating_sub(window));
    let scan_end = code_end.min(site_offset + window).min(d.len());
    if scan_start + 7 > scan_end {
        return Vec::new();
    }

    // Widened: the header sum may exceed u32, and a pathological
    // displacement could resolve below zero.
    let data_lo = data.virtual_address as i64;
    let data_hi = data_lo + data.file_size as i64;

    let mut found = Vec::new();
    for i in scan_start..scan_end - 6 {
        if !matches!(d[i], 0x48 | 0x4C) || !matches!(d[i + 1], 0x8B | 0x8D) {
            continue;
        }
        let modrm = d[i + 2];
        if (modrm >> 6) & 3 != 0 || modrm & 7 != 5 {
            continue;
        }
        let disp =
            i32::from_le_bytes([d[i + 3], d[i + 4], d[i + 5], d[i + 6]]);
        let Some(instr_rva) = image.file_offset_to_rva(i) else {
            continue;
        };
        let target = instr_rva as i64 + 7 + disp as i64;
        let Ok(target_rva) = u32::try_from(target) else {
            continue;
        };
        if target >= data_lo && target < data_hi {
            found.push(GlobalRef {
                instr_offset: i,
                instr_rva,
                target_rva,
                kind: if d[i + 1] == 0x8D {
                    GlobalRefKind::Lea
                } else {
                    GlobalRefKind::Mov
                },
            });
        }
    }
    found
}
