//! Synthetic image builders shared by the unit tests.

pub const BASE: u64 = 0x1_4000_0000;

pub const TEXT_RVA: u32 = 0x1000;
pub const RDATA_RVA: u32 = 0x2000;
pub const DATA_RVA: u32 = 0x3000;

pub const TEXT_FILE_OFFSET: usize = 0x200;
pub const RDATA_FILE_OFFSET: usize = 0x400;
pub const DATA_FILE_OFFSET: usize = 0x600;

const SECTION_CAPACITY: usize = 0x200;

fn write_section_record(
    image: &mut [u8],
    record_offset: usize,
    name: &[u8],
    rva: u32,
    file_offset: usize,
    file_size: usize,
) {
    image[record_offset..record_offset + name.len()].copy_from_slice(name);
    image[record_offset + 8..record_offset + 12]
        .copy_from_slice(&(file_size as u32).to_le_bytes());
    image[record_offset + 12..record_offset + 16].copy_from_slice(&rva.to_le_bytes());
    image[record_offset + 16..record_offset + 20]
        .copy_from_slice(&(file_size as u32).to_le_bytes());
    image[record_offset + 20..record_offset + 24]
        .copy_from_slice(&(file_offset as u32).to_le_bytes());
}

fn header_skeleton(base: u64, section_count: u16, total_size: usize) -> Vec<u8> {
    let e_lfanew = 0x80usize;
    let mut image = vec![0u8; total_size];
    image[0] = b'M';
    image[1] = b'Z';
    image[0x3C..0x40].copy_from_slice(&(e_lfanew as u32).to_le_bytes());
    image[e_lfanew..e_lfanew + 4].copy_from_slice(b"PE\0\0");

    let coff = e_lfanew + 4;
    image[coff + 2..coff + 4].copy_from_slice(&section_count.to_le_bytes());
    image[coff + 16..coff + 18].copy_from_slice(&0x70u16.to_le_bytes());

    let opt = coff + 20;
    image[opt..opt + 2].copy_from_slice(&0x20Bu16.to_le_bytes());
    image[opt + 24..opt + 32].copy_from_slice(&base.to_le_bytes());
    image
}

/// Minimal PE32+ image with one `.text` section at RVA 0x1000,
/// file offset 0x200, holding exactly `text`.
pub fn minimal_image(base: u64, text: &[u8]) -> Vec<u8> {
    let mut image = header_skeleton(base, 1, TEXT_FILE_OFFSET + text.len());
    let table = 0x80 + 4 + 20 + 0x70;
    write_section_record(&mut image, table, b".text", TEXT_RVA, TEXT_FILE_OFFSET, text.len());
    image[TEXT_FILE_OFFSET..TEXT_FILE_OFFSET + text.len()].copy_from_slice(text);
    image
}

/// Image with `.text`, `.rdata`, and `.data` sections (0x200 bytes
/// each at RVAs 0x1000/0x2000/0x3000). Contents are padded with
/// zeros up to the section capacity.
pub fn three_section_image(base: u64, text: &[u8], rdata: &[u8], data: &[u8]) -> Vec<u8> {
    assert!(text.len() <= SECTION_CAPACITY);
    assert!(rdata.len() <= SECTION_CAPACITY);
    assert!(data.len() <= SECTION_CAPACITY);

    let mut image = header_skeleton(base, 3, DATA_FILE_OFFSET + SECTION_CAPACITY);
    let table = 0x80 + 4 + 20 + 0x70;
    write_section_record(
        &mut image, table, b".text", TEXT_RVA, TEXT_FILE_OFFSET, SECTION_CAPACITY,
    );
    write_section_record(
        &mut image, table + 40, b".rdata", RDATA_RVA, RDATA_FILE_OFFSET, SECTION_CAPACITY,
    );
    write_section_record(
        &mut image, table + 80, b".data", DATA_RVA, DATA_FILE_OFFSET, SECTION_CAPACITY,
    );

    image[TEXT_FILE_OFFSET..TEXT_FILE_OFFSET + text.len()].copy_from_slice(text);
    image[RDATA_FILE_OFFSET..RDATA_FILE_OFFSET + rdata.len()].copy_from_slice(rdata);
    image[DATA_FILE_OFFSET..DATA_FILE_OFFSET + data.len()].copy_from_slice(data);
    image
}
