#![forbid(unsafe_code)]
//! Error types for the LPT subsystem.
//!
//! # Error Taxonomy
//!
//! The subsystem uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lpt-types` | Packed-format violations detected by the pure codec |
//! | Runtime | `LptError` (this crate) | `lpt-error` | User-facing errors for every tree operation |
//!
//! `lpt-error` is intentionally independent of `lpt-types` so the two
//! layers cannot become cyclic. `lpt-core` depends on both and performs
//! the conversion, attaching the flash address of the node whose bytes
//! failed to parse.
//!
//! The mapping rules are:
//!
//! | ParseError variant | LptError variant | Rationale |
//! |--------------------|------------------|-----------|
//! | `InsufficientData` | `Corruption` | A short node body means truncated or misaddressed media |
//! | `CrcMismatch` | `CrcMismatch` | Flash corruption, not transient; never retried |
//! | `BadNodeType` | `BadNodeType` | Wrong node at the right offset — same corruption class |
//! | `InvalidField` (codec) | `Corruption` | A CRC-valid node with out-of-range fields |
//! | `InvalidField` (geometry) | `InvalidGeometry` | Mount-time configuration failure |
//!
//! Every failure propagates to the immediate caller; there is no retry,
//! no default-value substitution and no partial success. Corruption is
//! surfaced for offline recovery tooling, never repaired here.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = LptError> = std::result::Result<T, E>;

/// Unified runtime error for all LPT operations.
#[derive(Debug, Error)]
pub enum LptError {
    /// Operating system I/O error from the flash device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A packed node failed its CRC16 check.
    #[error("bad CRC in LPT node at {lnum}:{offs}: stored {stored:#06x}, computed {computed:#06x}")]
    CrcMismatch {
        lnum: u32,
        offs: u32,
        stored: u16,
        computed: u16,
    },

    /// A packed node carried the wrong type tag.
    #[error("bad LPT node type at {lnum}:{offs}: expected tag {expected}, found {found}")]
    BadNodeType {
        lnum: u32,
        offs: u32,
        expected: u32,
        found: u32,
    },

    /// A structurally invalid node or an out-of-range request: branch
    /// addresses outside the LPT area, misaligned space counts, a node
    /// number that does not match its tree position, or a lookup for a
    /// LEB the tree does not cover.
    #[error("LPT range violation at {lnum}:{offs}: {detail}")]
    OutOfRange {
        lnum: u32,
        offs: u32,
        detail: String,
    },

    /// Corrupt metadata detected at a known flash address.
    #[error("corrupt LPT node at {lnum}:{offs}: {detail}")]
    Corruption {
        lnum: u32,
        offs: u32,
        detail: String,
    },

    /// The volume parameters cannot host an LPT: detected once at mount,
    /// fatal, no recovery path inside this subsystem.
    #[error("invalid LPT geometry: {0}")]
    InvalidGeometry(String),
}
