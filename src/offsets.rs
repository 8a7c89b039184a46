//! Struct-field offset extraction.
//!
//! Scans a function body for memory-operand displacements used by
//! integer moves, LEA, and scalar-float moves. Small displacements
//! off a base register are strong candidates for fixed struct field
//! offsets; large ones usually indicate array indexing and are
//! excluded. Attribution is approximate: a later instruction using
//! the same displacement overwrites the earlier record.

use std::collections::BTreeMap;
use std::fmt;

use crate::pe::ImageContainer;

/// Operation kind that produced a displacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetOp {
    /// `mov reg, [reg+disp]`
    MovLoad,
    /// `mov [reg+disp], reg`
    MovStore,
    /// `lea reg, [reg+disp]`
    Lea,
    /// `movss xmm, [reg+disp]`
    MovssLoad,
    /// `movss [reg+disp], xmm`
    MovssStore,
}

impl OffsetOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MovLoad => "MOV",
            Self::MovStore => "MOV_STORE",
            Self::Lea => "LEA",
            Self::MovssLoad => "MOVSS",
            Self::MovssStore => "MOVSS_STORE",
        }
    }

    /// Whether this operation writes to memory.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::MovStore | Self::MovssStore)
    }
}

/// Width of the encoded displacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispWidth {
    Disp8,
    Disp32,
}

/// One recorded displacement use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffsetRecord {
    pub op: OffsetOp,
    pub width: DispWidth,
    /// ModRM reg field (destination/source register number).
    pub reg: u8,
    /// ModRM rm field (base register number).
    pub rm: u8,
    pub disp: u32,
}

impl fmt::Display for OffsetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            OffsetOp::MovssLoad => {
                write!(f, "MOVSS xmm, [r{}+0x{:X}]", self.rm, self.disp)
            }
            OffsetOp::MovssStore => {
                write!(f, "MOVSS_STORE [r{}+0x{:X}], xmm", self.rm, self.disp)
            }
            _ => write!(
                f,
                "{} r{}, [r{}+0x{:X}]",
                self.op.name(),
                self.reg,
                self.rm,
                self.disp
            ),
        }
    }
}

/// Scan bounds and displacement filters.
///
/// The displacement caps are undocumented heuristic thresholds
/// inherited from field-offset mining practice; they are parameters
/// rather than fixed semantics.
#[derive(Clone, Debug)]
pub struct ExtractConfig {
    /// Maximum bytes to scan past the function entry.
    pub max_scan: usize,
    /// Exclusive upper bound for 8-bit displacements.
    pub max_disp8: u32,
    /// Exclusive upper bound for 32-bit displacements.
    pub max_disp32: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_scan: 512,
            max_disp8: 0xFF,
            max_disp32: 0x1000,
        }
    }
}

/// Enumerate memory-operand displacements in the function body
/// starting at `func_offset`, keyed by displacement value.
///
/// Stops at the first RET byte (0xC3/0xCB) or after
/// `config.max_scan` bytes.
pub fn extract_offsets(
    image: &ImageContainer,
    func_offset: usize,
    config: &ExtractConfig,
) -> BTreeMap<u32, OffsetRecord> {
    let d = image.bytes();
    let mut found = BTreeMap::new();
    let end = (func_offset + config.max_scan).min(d.len().saturating_sub(8));

    let mut i = func_offset;
    while i < end {
        if d[i] == 0xC3 || d[i] == 0xCB {
            break;
        }

        // mov/lea with a REX prefix
        if i + 6 < end && matches!(d[i], 0x48 | 0x4C) && matches!(d[i + 1], 0x8B | 0x89 | 0x8D)
        {
            let op = match d[i + 1] {
                0x8B => OffsetOp::MovLoad,
                0x89 => OffsetOp::MovStore,
                _ => OffsetOp::Lea,
            };
            let modrm = d[i + 2];
            let (mod_, reg, rm) = split_modrm(modrm);
            if mod_ == 2 && rm != 4 {
                let disp = read_i32(d, i + 3);
                record(&mut found, disp, config.max_disp32, op, DispWidth::Disp32, reg, rm);
                i += 7;
                continue;
            } else if mod_ == 1 && rm != 4 {
                let disp = d[i + 3] as i32;
                record(&mut found, disp, config.max_disp8, op, DispWidth::Disp8, reg, rm);
                i += 4;
                continue;
            }
        }

        // movss xmm, [reg+disp]
        if i + 7 < end && d[i] == 0xF3 && d[i + 1] == 0x0F && d[i + 2] == 0x10 {
            let (mod_, reg, rm) = split_modrm(d[i + 3]);
            if mod_ == 2 && rm != 4 {
                let disp = read_i32(d, i + 4);
                record(
                    &mut found, disp, config.max_disp32, OffsetOp::MovssLoad,
                    DispWidth::Disp32, reg, rm,
                );
                i += 8;
                continue;
            } else if mod_ == 1 && rm != 4 {
                let disp = d[i + 4] as i32;
                record(
                    &mut found, disp, config.max_disp8, OffsetOp::MovssLoad,
                    DispWidth::Disp8, reg, rm,
                );
                i += 5;
                continue;
            }
        }

        // movss [reg+disp32], xmm
        if i + 7 < end && d[i] == 0xF3 && d[i + 1] == 0x0F && d[i + 2] == 0x11 {
            let (mod_, reg, rm) = split_modrm(d[i + 3]);
            if mod_ == 2 && rm != 4 {
                let disp = read_i32(d, i + 4);
                record(
                    &mut found, disp, config.max_disp32, OffsetOp::MovssStore,
                    DispWidth::Disp32, reg, rm,
                );
                i += 8;
                continue;
            }
        }

        i += 1;
    }

    found
}

fn split_modrm(modrm: u8) -> (u8, u8, u8) {
    ((modrm >> 6) & 3, (modrm >> 3) & 7, modrm & 7)
}

fn read_i32(d: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([d[offset], d[offset + 1], d[offset + 2], d[offset + 3]])
}

fn record(
    found: &mut BTreeMap<u32, OffsetRecord>,
    disp: i32,
    bound: u32,
    op: OffsetOp,
    width: DispWidth,
    reg: u8,
    rm: u8,
) {
    if disp > 0 && (disp as u32) < bound {
        let disp = disp as u32;
        found.insert(disp, OffsetRecord { op, width, reg, rm, disp });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::ImageContainer;
    use crate::testutil::{minimal_image, BASE, TEXT_FILE_OFFSET};

    fn image_with_text(text: &[u8]) -> ImageContainer {
        ImageContainer::parse(minimal_image(BASE, text)).unwrap()
    }

    #[test]
    fn test_mov_disp8_and_disp32_recorded() {
        let mut text = vec![0x90u8; 96];
        // mov rax, [rcx+0x10]: 48 8B 41 10 (mod=1, reg=0, rm=1)
        text[0..4].copy_from_slice(&[0x48, 0x8B, 0x41, 0x10]);
        // mov [rdx+0x2B8], rbx: 48 89 9A B8 02 00 00 (mod=2, reg=3, rm=2)
        text[4..11].copy_from_slice(&[0x48, 0x89, 0x9A, 0xB8, 0x02, 0x00, 0x00]);

        let image = image_with_text(&text);
        let offsets = extract_offsets(&image, TEXT_FILE_OFFSET, &ExtractConfig::default());

        let rec8 = offsets.get(&0x10).unwrap();
        assert_eq!(rec8.op, OffsetOp::MovLoad);
        assert_eq!(rec8.width, DispWidth::Disp8);
        assert_eq!(rec8.rm, 1);

        let rec32 = offsets.get(&0x2B8).unwrap();
        assert_eq!(rec32.op, OffsetOp::MovStore);
        assert_eq!(rec32.width, DispWidth::Disp32);
        assert_eq!(rec32.to_string(), "MOV_STORE r3, [r2+0x2B8]");
    }

    #[test]
    fn test_movss_store_recorded() {
        let mut text = vec![0x90u8; 96];
        // movss [rcx+0xA0], xmm0: F3 0F 11 81 A0 00 00 00
        text[0..8].copy_from_slice(&[0xF3, 0x0F, 0x11, 0x81, 0xA0, 0x00, 0x00, 0x00]);

        let image = image_with_text(&text);
        let offsets = extract_offsets(&image, TEXT_FILE_OFFSET, &ExtractConfig::default());
        let rec = offsets.get(&0xA0).unwrap();
        assert_eq!(rec.op, OffsetOp::MovssStore);
        assert!(rec.op.is_store());
    }

    #[test]
    fn test_large_displacement_excluded() {
        let mut text = vec![0x90u8; 96];
        // mov rax, [rcx+0x2000]: past the disp32 bound
        text[0..7].copy_from_slice(&[0x48, 0x8B, 0x81, 0x00, 0x20, 0x00, 0x00]);

        let image = image_with_text(&text);
        let offsets = extract_offsets(&image, TEXT_FILE_OFFSET, &ExtractConfig::default());
        assert!(offsets.is_empty());

        // A raised bound admits it.
        let config = ExtractConfig {
            max_disp32: 0x4000,
            ..Default::default()
        };
        let offsets = extract_offsets(&image, TEXT_FILE_OFFSET, &config);
        assert!(offsets.contains_key(&0x2000));
    }

    #[test]
    fn test_scan_stops_at_ret() {
        let mut text = vec![0x90u8; 96];
        text[0] = 0xC3;
        // Displacement after the RET must not be recorded.
        text[1..5].copy_from_slice(&[0x48, 0x8B, 0x41, 0x10]);

        let image = image_with_text(&text);
        let offsets = extract_offsets(&image, TEXT_FILE_OFFSET, &ExtractConfig::default());
        assert!(offsets.is_empty());
    }

    #[test]
    fn test_collision_keeps_last_record() {
        let mut text = vec![0x90u8; 96];
        // Two instructions using displacement 0x10: load then store.
        text[0..4].copy_from_slice(&[0x48, 0x8B, 0x41, 0x10]);
        text[4..8].copy_from_slice(&[0x48, 0x89, 0x41, 0x10]);

        let image = image_with_text(&text);
        let offsets = extract_offsets(&image, TEXT_FILE_OFFSET, &ExtractConfig::default());
        assert_eq!(offsets.get(&0x10).unwrap().op, OffsetOp::MovStore);
    }
}
