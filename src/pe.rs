//! PE image container.
//!
//! Parses headers and the section table from an on-disk PE32+ image and
//! maps between the three coordinate systems used everywhere else:
//! file offsets, RVAs (offsets from the load base), and virtual
//! addresses (`base + rva`). The loaded buffer is immutable; every
//! query is bounds-checked and returns `Option` for anything that
//! falls outside a section or the buffer.

use crate::error::{Error, Result};

// PE format constants
pub const DOS_MAGIC: &[u8; 2] = b"MZ";
pub const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
pub const PE32_PLUS_MAGIC: u16 = 0x20B;

/// Offset of `e_lfanew` in the DOS header.
const E_LFANEW_OFFSET: usize = 0x3C;
/// Size of one section table record.
const SECTION_RECORD_SIZE: usize = 40;

/// One entry of the section table.
///
/// Only the fields the analysis consumes are kept. `virtual_size` may
/// exceed `file_size` (zero-fill tail); translation goes through the
/// file range.
#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub file_size: u32,
    pub file_offset: u32,
}

impl Section {
    /// Whether an RVA falls inside this section's file-backed range.
    /// Widened to u64: section headers are not sanity-checked at
    /// parse time, so `virtual_address + file_size` may exceed u32.
    pub fn contains_rva(&self, rva: u32) -> bool {
        let rva = rva as u64;
        let start = self.virtual_address as u64;
        rva >= start && rva < start + self.file_size as u64
    }

    /// Whether a file offset falls inside this section's raw data.
    pub fn contains_file_offset(&self, offset: usize) -> bool {
        let start = self.file_offset as usize;
        offset >= start && offset < start + self.file_size as usize
    }

    /// Virtual address range `[start, end)` of the file-backed data.
    pub fn va_range(&self, base: u64) -> (u64, u64) {
        let start = base + self.virtual_address as u64;
        (start, start + self.file_size as u64)
    }
}

/// A loaded, immutable PE32+ image.
#[derive(Debug)]
pub struct ImageContainer {
    data: Vec<u8>,
    base: u64,
    sections: Vec<Section>,
}

impl ImageContainer {
    /// Load and parse an image file. This is the only I/O the
    /// analysis performs; everything after is in-memory.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Self::parse(std::fs::read(path)?)
    }

    /// Parse a PE32+ image from a byte buffer.
    ///
    /// Fails when the MZ signature is missing, `e_lfanew` points past
    /// the buffer, the PE signature is wrong, the optional header is
    /// not the 64-bit form, or the section table runs off the end.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < E_LFANEW_OFFSET + 4 {
            return Err(Error::HeadersTooSmall {
                expected: E_LFANEW_OFFSET + 4,
                actual: data.len(),
            });
        }
        if &data[..2] != DOS_MAGIC {
            return Err(Error::InvalidDosSignature);
        }

        let e_lfanew = read_u32_at(&data, E_LFANEW_OFFSET).unwrap_or(0) as usize;
        if e_lfanew + 4 > data.len() {
            return Err(Error::HeadersTooSmall {
                expected: e_lfanew + 4,
                actual: data.len(),
            });
        }
        if &data[e_lfanew..e_lfanew + 4] != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(e_lfanew));
        }

        // COFF file header follows the signature.
        let coff = e_lfanew + 4;
        let min_headers = coff + 20 + 2;
        if data.len() < min_headers {
            return Err(Error::HeadersTooSmall {
                expected: min_headers,
                actual: data.len(),
            });
        }
        let number_of_sections =
            u16::from_le_bytes([data[coff + 2], data[coff + 3]]) as usize;
        let size_of_optional_header =
            u16::from_le_bytes([data[coff + 16], data[coff + 17]]) as usize;

        let opt = coff + 20;
        let magic = u16::from_le_bytes([data[opt], data[opt + 1]]);
        if magic != PE32_PLUS_MAGIC {
            return Err(Error::UnsupportedMagic(magic));
        }
        let base = read_u64_at(&data, opt + 24).ok_or(Error::HeadersTooSmall {
            expected: opt + 32,
            actual: data.len(),
        })?;

        let table_start = opt + size_of_optional_header;
        let table_end = table_start + number_of_sections * SECTION_RECORD_SIZE;
        if table_end > data.len() {
            return Err(Error::HeadersTooSmall {
                expected: table_end,
                actual: data.len(),
            });
        }

        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let off = table_start + i * SECTION_RECORD_SIZE;
            let name_bytes = &data[off..off + 8];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
            let name = std::str::from_utf8(&name_bytes[..end])
                .unwrap_or("")
                .to_string();
            sections.push(Section {
                name,
                virtual_size: read_u32_at(&data, off + 8).unwrap_or(0),
                virtual_address: read_u32_at(&data, off + 12).unwrap_or(0),
                file_size: read_u32_at(&data, off + 16).unwrap_or(0),
                file_offset: read_u32_at(&data, off + 20).unwrap_or(0),
            });
        }

        Ok(Self {
            data,
            base,
            sections,
        })
    }

    /// The image's preferred load base.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Total size of the loaded buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw image bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// All parsed sections, in table order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Look up a section by name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Translate an RVA to a file offset, or `None` if no section's
    /// file-backed range covers it.
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<usize> {
        self.sections.iter().find(|s| s.contains_rva(rva)).map(|s| {
            (rva - s.virtual_address + s.file_offset) as usize
        })
    }

    /// Translate a file offset to an RVA, or `None` if unmapped or
    /// the resulting RVA does not fit in 32 bits.
    pub fn file_offset_to_rva(&self, offset: usize) -> Option<u32> {
        self.sections
            .iter()
            .find(|s| s.contains_file_offset(offset))
            .and_then(|s| {
                let rva =
                    offset as u64 - s.file_offset as u64 + s.virtual_address as u64;
                u32::try_from(rva).ok()
            })
    }

    /// Translate a virtual address to a file offset.
    pub fn va_to_file_offset(&self, va: u64) -> Option<usize> {
        let rva = va.checked_sub(self.base)?;
        self.rva_to_file_offset(u32::try_from(rva).ok()?)
    }

    /// Bounds-checked slice of the image.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.data.get(offset..offset.checked_add(len)?)
    }

    /// Read a little-endian u64 (pointer-sized word).
    pub fn read_pointer(&self, offset: usize) -> Option<u64> {
        read_u64_at(&self.data, offset)
    }

    /// Read a little-endian u32.
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        read_u32_at(&self.data, offset)
    }

    /// Read a little-endian i32.
    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        Some(read_u32_at(&self.data, offset)? as i32)
    }

    /// Every file offset at which `needle` occurs in the image.
    pub fn find_bytes(&self, needle: &[u8]) -> Vec<usize> {
        if needle.is_empty() {
            return Vec::new();
        }
        memchr::memmem::find_iter(&self.data, needle).collect()
    }
}

fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64_at(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}
