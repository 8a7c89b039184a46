//! Dispatch-table scanning.
//!
//! Dispatch tables are contiguous arrays of code pointers in
//! read-only data, preceded by a non-code word (zero or a type-info
//! pointer). Given addresses of known functions, this module finds
//! the tables containing them and recovers each table's start by
//! walking backward through consecutive code-pointer words.

use crate::pe::{ImageContainer, Section};

/// One dispatch-table hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VtableMatch {
    /// File offset of the table start.
    pub table_offset: usize,
    /// RVA of the table start.
    pub table_rva: u32,
    /// Index of the matched entry, counted from the table start.
    pub matched_index: usize,
    /// The known virtual address that matched.
    pub matched_va: u64,
    /// Number of consecutive code-pointer words from the table start.
    pub run_length: usize,
}

/// Scan a read-only section for pointer runs containing any of the
/// known function virtual addresses.
///
/// The section is walked at 8-byte alignment. Results are best-effort:
/// a data word that happens to equal a code address produces a false
/// table, so callers should corroborate across functions.
pub fn scan_vtables(
    image: &ImageContainer,
    rodata: &Section,
    code: &Section,
    known_vas: &[u64],
) -> Vec<VtableMatch> {
    if known_vas.is_empty() {
        return Vec::new();
    }
    let start = rodata.file_offset as usize;
    let Some(bytes) = image.read_bytes(start, rodata.file_size as usize) else {
        return Vec::new();
    };
    let (code_lo, code_hi) = code.va_range(image.base());

    let mut matches = Vec::new();
    let mut i = 0;
    while i + 8 <= bytes.len() {
        let val = read_u64(bytes, i);
        if known_vas.contains(&val) {
            let table = walk_back_to_start(bytes, i, code_lo, code_hi);
            let run = run_length(bytes, table, code_lo, code_hi);
            matches.push(VtableMatch {
                table_offset: start + table,
                table_rva: rodata.virtual_address + table as u32,
                matched_index: (i - table) / 8,
                matched_va: val,
                run_length: run,
            });
        }
        i += 8;
    }
    matches
}

/// Walk backward through aligned words while each resolves into the
/// code range; the stop point is the table start.
fn walk_back_to_start(bytes: &[u8], ptr_offset: usize, code_lo: u64, code_hi: u64) -> usize {
    let mut i = ptr_offset;
    while i >= 8 {
        let val = read_u64(bytes, i - 8);
        if val >= code_lo && val < code_hi {
            i -= 8;
        } else {
            break;
        }
    }
    i
}

fn run_length(bytes: &[u8], table_start: usize, code_lo: u64, code_hi: u64) -> usize {
    let mut n = 0;
    let mut i = table_start;
    while i + 8 <= bytes.len() {
        let val = read_u64(bytes, i);
        if val >= code_lo && val < code_hi {
            n += 1;
            i += 8;
        } else {
            break;
        }
    }
    n
}

/// Every file offset at which the exact little-endian concatenation
/// of the given virtual addresses occurs. Needs at least two entries
/// to be meaningful.
pub fn find_pointer_sequence(image: &ImageContainer, vas: &[u64]) -> Vec<usize> {
    if vas.len() < 2 {
        return Vec::new();
    }
    let mut needle = Vec::with_capacity(vas.len() * 8);
    for va in vas {
        needle.extend_from_slice(&va.to_le_bytes());
    }
    image.find_bytes(&needle)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}
