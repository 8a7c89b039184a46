//! Recompilation-tolerant byte signatures.
//!
//! Converts a fixed window of function-entry bytes into an IDA-style
//! pattern: literal bytes stay as uppercase hex, displacement and
//! immediate bytes of the recognized variable forms become `?`
//! wildcards. The recognized set is closed; adding forms would change
//! wildcard placement and break pattern reproducibility against other
//! implementations.

use std::fmt;

/// Wildcard marker in the textual pattern.
pub const WILDCARD: char = '?';

/// A fixed-length sequence of literal-or-wildcard tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    tokens: Vec<Option<u8>>,
}

impl Signature {
    /// Generate a pattern from a byte window starting at a function
    /// entry. Deterministic and idempotent: identical input always
    /// yields an identical pattern.
    pub fn generate(window: &[u8]) -> Self {
        let mut wildcard = vec![false; window.len()];

        let mut i = 0;
        while i < window.len() {
            // mov [rsp+disp8], reg: wildcard the displacement byte.
            if i + 4 < window.len()
                && matches!(window[i], 0x48 | 0x4C)
                && window[i + 1] == 0x89
            {
                let modrm = window[i + 2];
                if (modrm >> 6) & 3 == 1 {
                    if modrm & 7 == 4 {
                        wildcard[i + 4] = true; // SIB byte present
                    } else {
                        wildcard[i + 3] = true;
                    }
                }
            }

            // sub rsp, imm8
            if i + 3 < window.len()
                && window[i] == 0x48
                && window[i + 1] == 0x83
                && window[i + 2] == 0xEC
            {
                wildcard[i + 3] = true;
            }

            // sub rsp, imm32
            if i + 6 < window.len()
                && window[i] == 0x48
                && window[i + 1] == 0x81
                && window[i + 2] == 0xEC
            {
                for w in &mut wildcard[i + 3..i + 7] {
                    *w = true;
                }
            }

            // call rel32 / jmp rel32
            if matches!(window[i], 0xE8 | 0xE9) && i + 4 < window.len() {
                for w in &mut wildcard[i + 1..i + 5] {
                    *w = true;
                }
                i += 5;
                continue;
            }

            // lea reg, [rip+disp32]
            if i + 6 < window.len()
                && matches!(window[i], 0x48 | 0x4C)
                && window[i + 1] == 0x8D
                && is_rip_relative(window[i + 2])
            {
                for w in &mut wildcard[i + 3..i + 7] {
                    *w = true;
                }
                i += 7;
                continue;
            }

            // mov to/from [rip+disp32]
            if i + 6 < window.len()
                && matches!(window[i], 0x48 | 0x4C)
                && matches!(window[i + 1], 0x8B | 0x89)
                && is_rip_relative(window[i + 2])
            {
                for w in &mut wildcard[i + 3..i + 7] {
                    *w = true;
                }
                i += 7;
                continue;
            }

            i += 1;
        }

        let tokens = window
            .iter()
            .zip(wildcard)
            .map(|(&b, w)| if w { None } else { Some(b) })
            .collect();
        Self { tokens }
    }

    /// Number of tokens (equals the window length).
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The literal byte at `index`, or `None` for a wildcard.
    pub fn literal(&self, index: usize) -> Option<u8> {
        self.tokens.get(index).copied().flatten()
    }

    /// Count of wildcarded positions.
    pub fn wildcard_count(&self) -> usize {
        self.tokens.iter().filter(|t| t.is_none()).count()
    }
}

impl fmt::Display for Signature {
    /// Space-separated tokens, each an uppercase two-digit hex byte
    /// or `?`, in address order. This exact text form is the
    /// cross-implementation contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Some(b) => write!(f, "{b:02X}")?,
                None => write!(f, "{WILDCARD}")?,
            }
        }
        Ok(())
    }
}

fn is_rip_relative(modrm: u8) -> bool {
    (modrm >> 6) & 3 == 0 && modrm & 7 == 5
}
