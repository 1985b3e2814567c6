#![forbid(unsafe_code)]
//! On-flash format handling for the LPT.
//!
//! Pure codec crate — no I/O, no side effects. Converts between packed
//! node bytes and plain data structs, and derives the volume geometry
//! every field width depends on.
//!
//! Every packed node starts with a CRC16 over the node body, followed by
//! a 4-bit type tag; all multi-bit fields are packed MSB-first at widths
//! taken from [`LptGeometry`]. Corruption (CRC, type tag, out-of-range
//! fields) is reported as `ParseError` and is always a hard failure for
//! the caller — flash corruption is not transient and is never retried.

pub mod bits;
pub mod codec;
pub mod geom;

pub use bits::{BitReader, BitWriter};
pub use codec::{
    pack_lsave, pack_ltab, pack_nnode, pack_pnode, unpack_lsave, unpack_ltab, unpack_nnode,
    unpack_pnode, RawBranch, RawLprops, RawLtabEntry, RawNnode, RawPnode, LPT_CRC,
};
pub use geom::{GeometryInput, LptGeometry};
