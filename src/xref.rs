//! Position-relative reference scanning.
//!
//! Finds every instruction in a code section that references a target
//! virtual address through RIP-relative addressing (ModRM mod=0,
//! rm=5, 32-bit signed displacement). The recognized opcode set is a
//! closed contract: recognizing additional forms would shift wildcard
//! placement downstream and break pattern compatibility.

use crate::pe::{ImageContainer, Section};

/// The encoding a reference was found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    /// `lea reg, [rip+disp32]` with a REX prefix (48/4C 8D).
    Lea,
    /// `lea reg, [rip+disp32]` without a REX prefix (8D).
    LeaNoRex,
    /// `mov reg, [rip+disp32]` (48/4C 8B).
    MovLoad,
    /// `mov [rip+disp32], reg` (48/4C 89).
    MovStore,
    /// `cmp` against `[rip+disp32]` (48 39/3B).
    Cmp,
}

impl RefKind {
    /// Total encoded instruction length. The displacement is relative
    /// to the end of the instruction, so these lengths are part of
    /// the contract: get one wrong and every target is mislocated.
    pub fn instruction_len(&self) -> usize {
        match self {
            RefKind::LeaNoRex => 6,
            _ => 7,
        }
    }
}

/// One located position-relative operand.
#[derive(Clone, Debug)]
pub struct Reference {
    /// File offset of the first instruction byte.
    pub source_offset: usize,
    pub kind: RefKind,
    /// The virtual address the operand resolves to.
    pub target_va: u64,
}

fn is_rip_relative(modrm: u8) -> bool {
    (modrm >> 6) & 3 == 0 && modrm & 7 == 5
}

/// Scan a code section for position-relative references to `target_va`.
///
/// Linear over the section's file bytes; no backtracking. Returns at
/// most one reference per byte position.
pub fn scan_references(
    image: &ImageContainer,
    code: &Section,
    target_va: u64,
) -> Vec<Reference> {
    let start = code.file_offset as usize;
    let Some(data) = image.read_bytes(start, code.file_size as usize) else {
        return Vec::new();
    };
    let section_va = image.base() + code.virtual_address as u64;

    let mut refs = Vec::new();
    for i in 0..data.len() {
        let Some(hit) = match_at(data, i) else {
            continue;
        };
        let (kind, disp) = hit;
        let len = kind.instruction_len();
        let resolved =
            (section_va + i as u64).wrapping_add(len as u64).wrapping_add(disp as i64 as u64);
        if resolved == target_va {
            refs.push(Reference {
                source_offset: start + i,
                kind,
                target_va: resolved,
            });
        }
    }
    refs
}

/// Try to decode a recognized RIP-relative form at position `i`.
fn match_at(data: &[u8], i: usize) -> Option<(RefKind, i32)> {
    let b0 = data[i];

    // Non-REX LEA: 8D modrm disp32 (6 bytes)
    if b0 == 0x8D && i + 6 <= data.len() && is_rip_relative(data[i + 1]) {
        return Some((RefKind::LeaNoRex, read_disp32(data, i + 2)));
    }

    if i + 7 > data.len() {
        return None;
    }
    let b1 = data[i + 1];
    let modrm = data[i + 2];
    if !is_rip_relative(modrm) {
        return None;
    }
    let disp = read_disp32(data, i + 3);

    let kind = match (b0, b1) {
        (0x48 | 0x4C, 0x8D) => RefKind::Lea,
        (0x48 | 0x4C, 0x8B) => RefKind::MovLoad,
        (0x48 | 0x4C, 0x89) => RefKind::MovStore,
        (0x48, 0x39 | 0x3B) => RefKind::Cmp,
        _ => return None,
    };
    Some((kind, disp))
}

fn read_disp32(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{minimal_image, BASE};

    const TEXT_RVA: u64 = 0x1000;

    fn image_with_text(text: &[u8]) -> ImageContainer {
        ImageContainer::parse(minimal_image(BASE, text)).unwrap()
    }

    /// Encode `mov rax, [rip+disp32]` at `at` targeting `target_va`.
    fn encode_mov_load(text: &mut [u8], at: usize, target_va: u64) {
        text[at] = 0x48;
        text[at + 1] = 0x8B;
        text[at + 2] = 0x05; // mod=0, reg=0, rm=5
        let instr_end = BASE + TEXT_RVA + at as u64 + 7;
        let disp = (target_va as i64 - instr_end as i64) as i32;
        text[at + 3..at + 7].copy_from_slice(&disp.to_le_bytes());
    }

    #[test]
    fn test_mov_load_reference_located_exactly_once() {
        let mut text = vec![0x90u8; 64];
        let target = BASE + TEXT_RVA + 48;
        encode_mov_load(&mut text, 8, target);

        let image = image_with_text(&text);
        let code = image.section(".text").unwrap().clone();

        let refs = scan_references(&image, &code, target);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].source_offset, 0x200 + 8);
        assert_eq!(refs[0].kind, RefKind::MovLoad);
        assert_eq!(refs[0].target_va, target);

        // Any other target yields nothing.
        assert!(scan_references(&image, &code, target + 1).is_empty());
    }

    #[test]
    fn test_lea_without_rex_uses_six_byte_length() {
        let mut text = vec![0x90u8; 64];
        let target = BASE + TEXT_RVA + 32;
        text[4] = 0x8D;
        text[5] = 0x0D; // mod=0, reg=1, rm=5
        let instr_end = BASE + TEXT_RVA + 4 + 6;
        let disp = (target as i64 - instr_end as i64) as i32;
        text[6..10].copy_from_slice(&disp.to_le_bytes());

        let image = image_with_text(&text);
        let code = image.section(".text").unwrap().clone();
        let refs = scan_references(&image, &code, target);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, RefKind::LeaNoRex);
    }

    #[test]
    fn test_cmp_and_store_forms_recognized() {
        let mut text = vec![0x90u8; 96];
        let target = BASE + TEXT_RVA + 80;

        // cmp [rip+disp32], rcx: 48 39 0D
        text[0] = 0x48;
        text[1] = 0x39;
        text[2] = 0x0D;
        let disp = (target as i64 - (BASE + TEXT_RVA + 7) as i64) as i32;
        text[3..7].copy_from_slice(&disp.to_le_bytes());

        // mov [rip+disp32], rbx: 48 89 1D
        text[16] = 0x48;
        text[17] = 0x89;
        text[18] = 0x1D;
        let disp = (target as i64 - (BASE + TEXT_RVA + 16 + 7) as i64) as i32;
        text[19..23].copy_from_slice(&disp.to_le_bytes());

        let image = image_with_text(&text);
        let code = image.section(".text").unwrap().clone();
        let refs = scan_references(&image, &code, target);
        let kinds: Vec<_> = refs.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RefKind::Cmp, RefKind::MovStore]);
    }

    #[test]
    fn test_non_rip_modrm_ignored() {
        let mut text = vec![0x90u8; 32];
        // mov rax, [rcx]: mod=0, rm=1, not RIP-relative
        text[0] = 0x48;
        text[1] = 0x8B;
        text[2] = 0x01;
        let image = image_with_text(&text);
        let code = image.section(".text").unwrap().clone();
        assert!(scan_references(&image, &code, BASE + TEXT_RVA).is_empty());
    }
}
