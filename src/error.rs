//! Error types for rescan.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading and parsing an image.
///
/// Parse failures are fatal: no partial-image analysis is attempted.
/// Per-query operations (address translation, bounds-checked reads,
/// scans) return `Option`/empty results instead of going through here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid DOS signature (expected MZ)")]
    InvalidDosSignature,

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("unsupported optional header magic: 0x{0:X} (only PE32+ is supported)")]
    UnsupportedMagic(u16),

    #[error("section '{name}' not found")]
    SectionNotFound { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
