//! The fingerprinting pipeline.
//!
//! Ties the primitives together: marker-string search, reference
//! scanning, boundary recovery, and signature generation compose into
//! "fingerprint every function that references this string". The
//! marker strings themselves are injected configuration; nothing here
//! knows what any particular marker means.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::boundary::{self, BoundaryConfig, FunctionCandidate};
use crate::error::{Error, Result};
use crate::globals::{self, GlobalRef};
use crate::offsets::{self, ExtractConfig, OffsetRecord};
use crate::pe::{ImageContainer, Section};
use crate::signature::Signature;
use crate::vtable::{self, VtableMatch};
use crate::xref;

/// Section names and heuristic bounds for one analysis run.
#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    pub code_section: String,
    pub rodata_section: String,
    pub data_section: String,
    /// Signature window length in bytes.
    pub signature_window: usize,
    /// Byte window around a code site when hunting globals.
    pub global_window: usize,
    pub boundary: BoundaryConfig,
    pub extract: ExtractConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            code_section: ".text".into(),
            rodata_section: ".rdata".into(),
            data_section: ".data".into(),
            signature_window: 32,
            global_window: 128,
            boundary: BoundaryConfig::default(),
            extract: ExtractConfig::default(),
        }
    }
}

/// One named lookup: a label and the marker strings that identify it.
#[derive(Clone, Debug, Deserialize)]
pub struct MarkerTarget {
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub markers: Vec<String>,
}

/// A singleton lookup: the marker whose referencing code should be
/// inspected for nearby data-section globals.
#[derive(Clone, Debug, Deserialize)]
pub struct SingletonTarget {
    pub label: String,
    pub marker: String,
}

/// Injected scan specification, deserialized from the caller's
/// configuration file. Fallback offsets fill anything discovery
/// missed; they never influence the scan itself.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ScanSpec {
    #[serde(default)]
    pub targets: Vec<MarkerTarget>,
    #[serde(default)]
    pub singletons: Vec<SingletonTarget>,
    #[serde(default)]
    pub fallback_offsets: BTreeMap<String, u64>,
}

/// One fingerprinted function.
#[derive(Clone, Debug)]
pub struct FunctionMatch {
    pub entry: FunctionCandidate,
    /// File offset of the referencing instruction.
    pub xref_offset: usize,
    /// File offset of the referenced marker string.
    pub string_offset: usize,
    /// Bytes between the entry and the reference; smaller is a
    /// stronger corroboration that the entry is real.
    pub distance: usize,
    pub signature: Signature,
    /// Raw entry bytes, same window as the signature.
    pub raw: Vec<u8>,
}

/// The best fingerprint found for a labeled target.
#[derive(Clone, Debug)]
pub struct NamedPattern {
    pub label: String,
    pub description: String,
    /// The marker that produced the hit.
    pub marker: String,
    pub best: FunctionMatch,
    /// How many distinct functions referenced the marker.
    pub total_functions: usize,
}

/// A discovered global singleton slot.
#[derive(Clone, Debug)]
pub struct SingletonHit {
    pub label: String,
    pub marker: String,
    pub site: GlobalRef,
    /// The slot's on-disk value (usually zero before runtime init).
    pub static_value: Option<u64>,
}

/// Pure query interface over one loaded image.
pub struct Analyzer<'a> {
    image: &'a ImageContainer,
    config: AnalyzerConfig,
    code: Section,
    rodata: Option<Section>,
    data: Option<Section>,
}

impl<'a> Analyzer<'a> {
    pub fn new(image: &'a ImageContainer) -> Result<Self> {
        Self::with_config(image, AnalyzerConfig::default())
    }

    pub fn with_config(image: &'a ImageContainer, config: AnalyzerConfig) -> Result<Self> {
        let code = image
            .section(&config.code_section)
            .cloned()
            .ok_or_else(|| Error::SectionNotFound {
                name: config.code_section.clone(),
            })?;
        let rodata = image.section(&config.rodata_section).cloned();
        let data = image.section(&config.data_section).cloned();
        Ok(Self {
            image,
            config,
            code,
            rodata,
            data,
        })
    }

    pub fn image(&self) -> &ImageContainer {
        self.image
    }

    pub fn code_section(&self) -> &Section {
        &self.code
    }

    /// Fingerprint every function referencing `marker`, sorted by
    /// xref distance (closest first). Functions are deduplicated by
    /// entry offset across all occurrences of the marker.
    pub fn functions_for_marker(&self, marker: &[u8]) -> Vec<FunctionMatch> {
        let mut seen = std::collections::BTreeSet::new();
        let mut matches = Vec::new();

        for string_offset in self.image.find_bytes(marker) {
            let Some(string_rva) = self.image.file_offset_to_rva(string_offset) else {
                continue;
            };
            let string_va = self.image.base() + string_rva as u64;

            for r in xref::scan_references(self.image, &self.code, string_va) {
                let Some(entry) = boundary::resolve_entry(
                    self.image,
                    &self.code,
                    r.source_offset,
                    &self.config.boundary,
                ) else {
                    continue;
                };
                if !seen.insert(entry.entry_offset) {
                    continue;
                }
                let window = self
                    .config
                    .signature_window
                    .min(self.image.len() - entry.entry_offset);
                let raw = self
                    .image
                    .read_bytes(entry.entry_offset, window)
                    .unwrap_or(&[])
                    .to_vec();
                matches.push(FunctionMatch {
                    entry,
                    xref_offset: r.source_offset,
                    string_offset,
                    distance: r.source_offset - entry.entry_offset,
                    signature: Signature::generate(&raw),
                    raw,
                });
            }
        }

        matches.sort_by_key(|m| m.distance);
        debug!(
            marker = %String::from_utf8_lossy(marker),
            functions = matches.len(),
            "marker scan"
        );
        matches
    }

    /// Resolve a labeled target: the first marker with any hit wins,
    /// and the closest-xref function is taken as the fingerprint.
    pub fn scan_target(&self, target: &MarkerTarget) -> Option<NamedPattern> {
        for marker in &target.markers {
            let matches = self.functions_for_marker(marker.as_bytes());
            if let Some(best) = matches.first() {
                info!(
                    label = %target.label,
                    marker = %marker,
                    rva = best.entry.entry_rva,
                    "target found"
                );
                return Some(NamedPattern {
                    label: target.label.clone(),
                    description: target.description.clone(),
                    marker: marker.clone(),
                    best: best.clone(),
                    total_functions: matches.len(),
                });
            }
        }
        None
    }

    /// Struct-offset candidates in the function at `entry_offset`.
    pub fn struct_offsets(&self, entry_offset: usize) -> BTreeMap<u32, OffsetRecord> {
        offsets::extract_offsets(self.image, entry_offset, &self.config.extract)
    }

    /// Dispatch tables containing any of the known function addresses.
    pub fn vtables(&self, known_vas: &[u64]) -> Vec<VtableMatch> {
        let Some(rodata) = &self.rodata else {
            return Vec::new();
        };
        vtable::scan_vtables(self.image, rodata, &self.code, known_vas)
    }

    /// Data-section slots holding `target_va`.
    pub fn pointer_slots(&self, target_va: u64) -> Vec<globals::PointerSlot> {
        let Some(data) = &self.data else {
            return Vec::new();
        };
        globals::find_pointer_slots(self.image, data, target_va)
    }

    /// Find the global slot touched near code referencing `marker`.
    ///
    /// Follows the first few references of the first marker occurrence
    /// and takes the first data-section global in their vicinity.
    pub fn singleton_for_marker(&self, target: &SingletonTarget) -> Option<SingletonHit> {
        let data = self.data.as_ref()?;
        let string_offset = *self.image.find_bytes(target.marker.as_bytes()).first()?;
        let string_rva = self.image.file_offset_to_rva(string_offset)?;
        let string_va = self.image.base() + string_rva as u64;

        for r in xref::scan_references(self.image, &self.code, string_va)
            .iter()
            .take(3)
        {
            let found = globals::find_globals_near(
                self.image,
                &self.code,
                data,
                r.source_offset,
                self.config.global_window,
            );
            if let Some(site) = found.first() {
                let static_value = self
                    .image
                    .rva_to_file_offset(site.target_rva)
                    .and_then(|off| self.image.read_pointer(off));
                return Some(SingletonHit {
                    label: target.label.clone(),
                    marker: target.marker.clone(),
                    site: *site,
                    static_value,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::ImageContainer;
    use crate::testutil::{
        three_section_image, BASE, DATA_RVA, RDATA_FILE_OFFSET, RDATA_RVA,
        TEXT_FILE_OFFSET, TEXT_RVA,
    };

    /// Lay out: marker string in .rdata, a function in .text whose
    /// body LEAs the string, entry marked by RET + padding + prologue.
    fn build_fixture() -> Vec<u8> {
        let mut text = vec![0x90u8; 0x100];
        let mut rdata = vec![0u8; 0x100];

        rdata[0x10..0x1E].copy_from_slice(b"Creating squad");

        // Function entry at 0x20: RET, CC padding, then prologue.
        text[0x1D] = 0xC3;
        text[0x1E] = 0xCC;
        text[0x1F] = 0xCC;
        // mov [rsp+8], rbx ; sub rsp, 0x40
        text[0x20..0x25].copy_from_slice(&[0x48, 0x89, 0x5C, 0x24, 0x08]);
        text[0x25..0x29].copy_from_slice(&[0x48, 0x83, 0xEC, 0x40]);
        // mov rax, [rcx+0x58], a struct-offset candidate
        text[0x29..0x2D].copy_from_slice(&[0x48, 0x8B, 0x41, 0x58]);
        // lea rcx, [rip+disp32] → marker string
        let at = 0x2D;
        text[at] = 0x48;
        text[at + 1] = 0x8D;
        text[at + 2] = 0x0D;
        let string_rva = RDATA_RVA as i64 + 0x10;
        let disp = string_rva - (TEXT_RVA as i64 + at as i64 + 7);
        text[at + 3..at + 7].copy_from_slice(&(disp as i32).to_le_bytes());
        text[0x40] = 0xC3;

        three_section_image(BASE, &text, &rdata, &[0u8; 0x40])
    }

    #[test]
    fn test_pipeline_fingerprints_marker_function() {
        let image = ImageContainer::parse(build_fixture()).unwrap();
        let analyzer = Analyzer::new(&image).unwrap();

        let matches = analyzer.functions_for_marker(b"Creating squad");
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.entry.entry_offset, TEXT_FILE_OFFSET + 0x20);
        assert_eq!(m.entry.entry_rva, TEXT_RVA + 0x20);
        assert_eq!(m.xref_offset, TEXT_FILE_OFFSET + 0x2D);
        assert_eq!(m.string_offset, RDATA_FILE_OFFSET + 0x10);
        assert_eq!(m.distance, 0x0D);
        assert_eq!(m.signature.len(), 32);
        // Spill and reservation displacements wildcarded, opcodes literal.
        let text = m.signature.to_string();
        assert!(text.starts_with("48 89 5C 24 ? 48 83 EC ?"));
    }

    #[test]
    fn test_scan_target_first_marker_wins() {
        let image = ImageContainer::parse(build_fixture()).unwrap();
        let analyzer = Analyzer::new(&image).unwrap();

        let target = MarkerTarget {
            label: "SQUAD_CREATE".into(),
            description: "Squad creation".into(),
            markers: vec!["no such marker".into(), "Creating squad".into()],
        };
        let named = analyzer.scan_target(&target).unwrap();
        assert_eq!(named.label, "SQUAD_CREATE");
        assert_eq!(named.marker, "Creating squad");
        assert_eq!(named.total_functions, 1);

        let missing = MarkerTarget {
            label: "NOPE".into(),
            description: String::new(),
            markers: vec!["absent".into()],
        };
        assert!(analyzer.scan_target(&missing).is_none());
    }

    #[test]
    fn test_struct_offsets_from_fingerprinted_entry() {
        let image = ImageContainer::parse(build_fixture()).unwrap();
        let analyzer = Analyzer::new(&image).unwrap();
        let m = &analyzer.functions_for_marker(b"Creating squad")[0];
        let offs = analyzer.struct_offsets(m.entry.entry_offset);
        assert!(offs.contains_key(&0x58));
    }

    #[test]
    fn test_scan_spec_deserialization() {
        let json = r#"{
            "targets": [
                { "label": "ZONE_LOAD", "description": "Zone loading",
                  "markers": ["zone.%d.%d.zone"] }
            ],
            "singletons": [ { "label": "GAME_WORLD", "marker": "GameWorld" } ],
            "fallback_offsets": { "name": 16, "faction": 80 }
        }"#;
        let spec: ScanSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.targets.len(), 1);
        assert_eq!(spec.targets[0].markers[0], "zone.%d.%d.zone");
        assert_eq!(spec.singletons[0].label, "GAME_WORLD");
        assert_eq!(spec.fallback_offsets["faction"], 80);
    }

    #[test]
    fn test_singleton_discovery() {
        let mut text = vec![0x90u8; 0x100];
        let mut rdata = vec![0u8; 0x100];
        rdata[0x20..0x29].copy_from_slice(b"GameWorld");

        // lea rax, [rip] → marker at .rdata+0x20
        let site = 0x30usize;
        text[site] = 0x48;
        text[site + 1] = 0x8D;
        text[site + 2] = 0x05;
        let disp = RDATA_RVA as i64 + 0x20 - (TEXT_RVA as i64 + site as i64 + 7);
        text[site + 3..site + 7].copy_from_slice(&(disp as i32).to_le_bytes());

        // mov rcx, [rip] → global slot at .data+0x10, a few bytes later
        let g = site + 8;
        text[g] = 0x48;
        text[g + 1] = 0x8B;
        text[g + 2] = 0x0D;
        let disp = DATA_RVA as i64 + 0x10 - (TEXT_RVA as i64 + g as i64 + 7);
        text[g + 3..g + 7].copy_from_slice(&(disp as i32).to_le_bytes());

        let mut data = vec![0u8; 0x40];
        data[0x10..0x18].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());

        let image =
            ImageContainer::parse(three_section_image(BASE, &text, &rdata, &data)).unwrap();
        let analyzer = Analyzer::new(&image).unwrap();

        let hit = analyzer
            .singleton_for_marker(&SingletonTarget {
                label: "GAME_WORLD".into(),
                marker: "GameWorld".into(),
            })
            .unwrap();
        assert_eq!(hit.site.target_rva, DATA_RVA + 0x10);
        assert_eq!(hit.static_value, Some(0xDEAD_BEEF));
    }
}
