//! Function boundary recovery.
//!
//! Walks backward from an interior code offset to the function's
//! entry point using three ordered heuristic tiers. The prologue
//! grammar favors recall over precision: callers must corroborate the
//! result independently, e.g. by checking that the originating
//! reference sits at a plausible distance past the recovered entry.

use crate::pe::{ImageContainer, Section};

/// Backward-search bounds for the three tiers.
#[derive(Clone, Debug)]
pub struct BoundaryConfig {
    /// Total backward budget for the terminator-then-prologue tier.
    pub max_search: usize,
    /// Window for accepting a prologue directly preceded by a
    /// terminator or trap byte.
    pub padded_window: usize,
    /// Window for accepting the nearest prologue unconditionally.
    pub nearest_window: usize,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_search: 2048,
            padded_window: 512,
            nearest_window: 256,
        }
    }
}

/// A heuristically recovered function entry, unvalidated against any
/// symbol table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionCandidate {
    /// File offset of the entry.
    pub entry_offset: usize,
    /// RVA of the entry.
    pub entry_rva: u32,
}

/// Recover a function entry from an interior file offset.
///
/// Tiers, first success wins:
/// 1. backward scan for a RET/trap byte, skip trap padding, accept
///    the first following prologue match (within `max_search`);
/// 2. prologue match immediately preceded by a terminator byte
///    (within `padded_window`);
/// 3. nearest prologue match (within `nearest_window`).
pub fn resolve_entry(
    image: &ImageContainer,
    code: &Section,
    interior_offset: usize,
    config: &BoundaryConfig,
) -> Option<FunctionCandidate> {
    let d = image.bytes();
    let code_start = code.file_offset as usize;
    if interior_offset <= code_start || interior_offset > d.len() {
        return None;
    }
    let search_start = code_start.max(interior_offset.saturating_sub(config.max_search));

    // Tier 1: terminator, then padding, then prologue.
    for i in (search_start + 1..interior_offset).rev() {
        if d[i] == 0xCC || d[i] == 0xC3 {
            let mut candidate = i + 1;
            while candidate < interior_offset && d[candidate] == 0xCC {
                candidate += 1;
            }
            if candidate < interior_offset && is_prologue(d, candidate) {
                return finish(image, candidate);
            }
        }
    }

    // Tier 2: prologue with a terminator immediately before it.
    for i in (search_start + 1..interior_offset).rev() {
        if interior_offset - i < config.padded_window
            && is_prologue(d, i)
            && matches!(d[i - 1], 0xCC | 0xC3 | 0xCB)
        {
            return finish(image, i);
        }
    }

    // Tier 3: nearest prologue.
    for i in (search_start + 1..interior_offset).rev() {
        if interior_offset - i < config.nearest_window && is_prologue(d, i) {
            return finish(image, i);
        }
    }

    None
}

fn finish(image: &ImageContainer, entry_offset: usize) -> Option<FunctionCandidate> {
    Some(FunctionCandidate {
        entry_offset,
        entry_rva: image.file_offset_to_rva(entry_offset)?,
    })
}

/// Fixed prologue byte sequences recognized at `offset`.
pub fn is_prologue(d: &[u8], offset: usize) -> bool {
    if offset + 5 > d.len() {
        return false;
    }

    // mov [rsp+xx], rbx/rsi/rcx/rdx/rbp
    if d[offset] == 0x48
        && d[offset + 1] == 0x89
        && matches!(d[offset + 2], 0x5C | 0x74 | 0x4C | 0x54 | 0x6C)
        && d[offset + 3] == 0x24
    {
        return true;
    }
    // mov [rsp+xx], r8/r9
    if d[offset] == 0x4C
        && d[offset + 1] == 0x89
        && matches!(d[offset + 2], 0x44 | 0x4C)
        && d[offset + 3] == 0x24
    {
        return true;
    }
    // REX-prefixed push rbx/rbp/rsi/rdi
    if d[offset] == 0x40 && matches!(d[offset + 1], 0x53 | 0x55 | 0x56 | 0x57) {
        return true;
    }
    // sub rsp, imm8 / imm32
    if d[offset] == 0x48 && matches!(d[offset + 1], 0x83 | 0x81) && d[offset + 2] == 0xEC {
        return true;
    }
    // mov rbp, rsp (either encoding)
    if d[offset] == 0x48 && d[offset + 1] == 0x8B && d[offset + 2] == 0xEC {
        return true;
    }
    if d[offset] == 0x48 && d[offset + 1] == 0x89 && d[offset + 2] == 0xE5 {
        return true;
    }
    // bare push followed by a REX byte
    if d[offset] == 0x55 && matches!(d[offset + 1], 0x48 | 0x8B) {
        return true;
    }
    if matches!(d[offset], 0x53 | 0x56 | 0x57) && d[offset + 1] == 0x48 {
        return true;
    }
    // push r12/r13/r14/r15
    if d[offset] == 0x41 && matches!(d[offset + 1], 0x54 | 0x55 | 0x56 | 0x57) {
        return true;
    }

    false
}
