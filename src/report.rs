//! JSON serialization of scan results.
//!
//! Consumes the analyzer's structured outputs and renders the two
//! report files downstream code generation reads: `patterns.json`
//! (one record per fingerprinted function) and `offsets.json`
//! (struct offsets, singletons, vtables). Addresses are rendered as
//! `0x`-prefixed hex strings to match the consumers' expectations.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::analyzer::{NamedPattern, SingletonHit};
use crate::globals::GlobalRefKind;
use crate::offsets::OffsetRecord;
use crate::vtable::VtableMatch;

/// One entry of `patterns.json`.
#[derive(Clone, Debug, Serialize)]
pub struct PatternRecord {
    pub pattern: String,
    pub rva: String,
    pub offset: String,
    pub string: String,
    pub raw_bytes: String,
    pub description: String,
}

impl PatternRecord {
    pub fn from_named(named: &NamedPattern) -> Self {
        let raw_bytes = named
            .best
            .raw
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            pattern: named.best.signature.to_string(),
            rva: format!("0x{:08X}", named.best.entry.entry_rva),
            offset: format!("0x{:08X}", named.best.entry.entry_offset),
            string: named.marker.clone(),
            raw_bytes,
            description: named.description.clone(),
        }
    }
}

/// One entry of the `singletons` map in `offsets.json`.
#[derive(Clone, Debug, Serialize)]
pub struct SingletonRecord {
    pub rva: String,
    pub instr_rva: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub static_value: Option<String>,
}

impl SingletonRecord {
    pub fn from_hit(hit: &SingletonHit) -> Self {
        Self {
            rva: format!("0x{:08X}", hit.site.target_rva),
            instr_rva: format!("0x{:08X}", hit.site.instr_rva),
            kind: match hit.site.kind {
                GlobalRefKind::Lea => "LEA".into(),
                GlobalRefKind::Mov => "MOV".into(),
            },
            static_value: hit.static_value.map(|v| format!("0x{v:016X}")),
        }
    }
}

/// One entry of the `vtables` map in `offsets.json`.
#[derive(Clone, Debug, Serialize)]
pub struct VtableRecord {
    pub rva: String,
    pub offset: String,
    pub matched_func: String,
    pub index: usize,
    pub run_length: usize,
}

impl VtableRecord {
    pub fn from_match(m: &VtableMatch, base: u64) -> Self {
        Self {
            rva: format!("0x{:08X}", m.table_rva),
            offset: format!("0x{:08X}", m.table_offset),
            matched_func: format!("0x{:08X}", m.matched_va - base),
            index: m.matched_index,
            run_length: m.run_length,
        }
    }

    /// Map key for a vtable record, keyed by table RVA.
    pub fn key(m: &VtableMatch) -> String {
        format!("vtable_0x{:08X}", m.table_rva)
    }
}

/// The `offsets.json` document.
#[derive(Clone, Debug, Default, Serialize)]
pub struct OffsetsReport {
    pub struct_offsets: BTreeMap<String, String>,
    pub singletons: BTreeMap<String, SingletonRecord>,
    pub vtables: BTreeMap<String, VtableRecord>,
}

impl OffsetsReport {
    pub fn insert_offset(&mut self, name: &str, value: u64) {
        self.struct_offsets
            .insert(name.to_string(), format!("0x{value:X}"));
    }

    /// Record every mined displacement for a labeled function, keyed
    /// `<label>_0x<disp>`. Nothing is truncated here: display caps
    /// are the console's business, not the report's.
    pub fn insert_function_offsets(
        &mut self,
        label: &str,
        offsets: &BTreeMap<u32, OffsetRecord>,
    ) {
        for disp in offsets.keys() {
            self.insert_offset(
                &format!("{}_0x{:X}", label.to_lowercase(), disp),
                *disp as u64,
            );
        }
    }

    /// Fill any keys discovery missed with caller-supplied fallbacks.
    pub fn apply_fallbacks(&mut self, fallbacks: &BTreeMap<String, u64>) {
        for (name, value) in fallbacks {
            if !self.struct_offsets.contains_key(name) {
                self.insert_offset(name, *value);
            }
        }
    }
}

/// The `patterns.json` document: label → record, sorted by label.
pub type PatternsReport = BTreeMap<String, PatternRecord>;

pub fn patterns_report<'a>(
    patterns: impl IntoIterator<Item = &'a NamedPattern>,
) -> PatternsReport {
    patterns
        .into_iter()
        .map(|p| (p.label.clone(), PatternRecord::from_named(p)))
        .collect()
}
