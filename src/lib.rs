//! # rescan
//!
//! Static analysis of stripped PE32+ images: recovers function
//! locations, recompilation-tolerant byte signatures, struct field
//! offsets, and virtual-dispatch tables for consumption by an
//! external instrumentation project.
//!
//! ## Overview
//!
//! The engine is a pure library of queries over one immutable loaded
//! image:
//!
//! 1. [`pe::ImageContainer`] parses the container and translates
//!    between file offsets, RVAs, and virtual addresses.
//! 2. [`xref`] locates position-relative references to a target
//!    address in code.
//! 3. [`boundary`] walks backward from a reference to the owning
//!    function's entry.
//! 4. [`signature`] turns the entry bytes into a wildcarded pattern
//!    that survives recompilation.
//! 5. [`offsets`], [`vtable`], and [`globals`] mine struct field
//!    offsets, dispatch tables, and global singleton slots from the
//!    fingerprinted functions.
//!
//! [`analyzer::Analyzer`] composes 1-4 into a "fingerprint every
//! function referencing this marker string" pipeline; the marker
//! tables themselves are injected configuration. Nothing here ever
//! modifies, relocates, or executes the image, and this is not a
//! general disassembler: only the operand forms needed for reference
//! and offset discovery are decoded.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod analyzer;
pub mod boundary;
pub mod error;
pub mod globals;
pub mod offsets;
pub mod pe;
pub mod report;
pub mod signature;
pub mod vtable;
pub mod xref;

#[cfg(test)]
pub(crate) mod testutil;

pub use analyzer::{Analyzer, AnalyzerConfig, MarkerTarget, ScanSpec};
pub use boundary::{BoundaryConfig, FunctionCandidate};
pub use error::{Error, Result};
pub use pe::{ImageContainer, Section};
pub use signature::Signature;
