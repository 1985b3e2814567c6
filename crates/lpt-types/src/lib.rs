#![forbid(unsafe_code)]
//! Shared types for the LEB properties tree (LPT).
//!
//! This crate holds the vocabulary of the subsystem: LEB numbers, node
//! addresses, per-LEB property records, the free-space categories, the
//! LPT area layout, and the parse-layer error type returned by the pure
//! codec crate (`lpt-ondisk`).
//!
//! The runtime error type lives in `lpt-error`, which intentionally does
//! not depend on this crate; `lpt-core` performs the `ParseError` →
//! `LptError` conversion at its boundary, attaching the flash address of
//! the offending node.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Branches per internal tree node and property records per leaf node.
pub const LPT_FANOUT: usize = 4;

/// log2 of [`LPT_FANOUT`].
pub const LPT_FANOUT_SHIFT: u32 = 2;

/// Width of the CRC field at the start of every packed LPT node.
pub const LPT_CRC_BITS: u32 = 16;

/// Byte size of the CRC field.
pub const LPT_CRC_BYTES: usize = 2;

/// Width of the node-type tag following the CRC.
pub const LPT_TYPE_BITS: u32 = 4;

/// Logical erase block number.
///
/// LEB number 0 doubles as the "never written" marker in nnode branches:
/// a branch with `lnum == 0` describes a subtree of only-empty LEBs.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lnum(pub u32);

impl fmt::Display for Lnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flash address of a packed LPT node.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeAddr {
    pub lnum: Lnum,
    pub offs: u32,
}

impl NodeAddr {
    #[must_use]
    pub fn new(lnum: u32, offs: u32) -> Self {
        Self {
            lnum: Lnum(lnum),
            offs,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lnum, self.offs)
    }
}

/// On-disk LPT node kinds, in tag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LptNodeType {
    Pnode = 0,
    Nnode = 1,
    Ltab = 2,
    Lsave = 3,
}

impl LptNodeType {
    /// Decode a 4-bit type tag.
    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Pnode),
            1 => Some(Self::Nnode),
            2 => Some(Self::Ltab),
            3 => Some(Self::Lsave),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for LptNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pnode => "pnode",
            Self::Nnode => "nnode",
            Self::Ltab => "ltab",
            Self::Lsave => "lsave",
        };
        f.write_str(name)
    }
}

/// Free-space category of a main-area LEB.
///
/// `Dirty`, `DirtyIndex` and `Free` LEBs live on bounded heaps; `Empty`,
/// `Freeable` and `FreeableIndex` on unbounded lists. `Uncat` collects
/// LEBs that fit no category or fell off a full heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LpropsCategory {
    #[default]
    Uncat,
    /// Enough obsoleted data to be worth garbage collecting.
    Dirty,
    /// An index LEB with reclaimable space.
    DirtyIndex,
    /// Has free space, not empty.
    Free,
    /// Completely erased.
    Empty,
    /// Free plus dirty covers the whole LEB.
    Freeable,
    /// Freeable, but holds index nodes.
    FreeableIndex,
}

impl LpropsCategory {
    /// Categories kept on a bounded heap rather than a list.
    #[must_use]
    pub fn is_heap(self) -> bool {
        matches!(self, Self::Dirty | Self::DirtyIndex | Self::Free)
    }
}

/// Non-category flag bits of a LEB property record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpropsFlags {
    /// The LEB holds index nodes.
    pub index: bool,
    /// The LEB is in use by some operation and must not be reallocated.
    pub taken: bool,
    /// Current free-space category.
    pub cat: LpropsCategory,
}

/// Properties of one main-area LEB.
///
/// Invariants: `free + dirty <= leb_size`; `free` is a multiple of the
/// minimum I/O unit; both are multiples of 8 (the packed encoding stores
/// them shifted right by 3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LebProps {
    /// The LEB this record describes. `Lnum(0)` marks a record slot past
    /// the end of the volume.
    pub lnum: Lnum,
    /// Bytes of free space.
    pub free: u32,
    /// Bytes of obsoleted data.
    pub dirty: u32,
    pub flags: LpropsFlags,
}

/// Placement of the LPT area within the volume.
///
/// These are the fixed addresses the tree is anchored at: where the LPT
/// LEB range starts, where the root nnode and the ltab node were last
/// written, and where the main area (the LEBs the tree describes) begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LptLayout {
    /// First LEB of the LPT area.
    pub lpt_first: Lnum,
    /// Number of LEBs in the LPT area.
    pub lpt_lebs: u32,
    /// Flash address of the root nnode. `lnum == 0` means the tree was
    /// never written and describes only-empty LEBs.
    pub root: NodeAddr,
    /// Flash address of the ltab node.
    pub ltab: NodeAddr,
    /// Flash address of the lsave node (big model only).
    pub lsave: Option<NodeAddr>,
    /// First LEB of the main area.
    pub main_first: Lnum,
    /// Total LEB count of the volume.
    pub leb_cnt: u32,
}

impl LptLayout {
    /// Last LEB of the LPT area.
    #[must_use]
    pub fn lpt_last(&self) -> Lnum {
        Lnum(self.lpt_first.0 + self.lpt_lebs - 1)
    }

    /// Whether `lnum` falls inside the LPT area.
    #[must_use]
    pub fn contains_lpt(&self, lnum: Lnum) -> bool {
        lnum >= self.lpt_first && lnum <= self.lpt_last()
    }

    /// Whether `lnum` falls inside the main area.
    #[must_use]
    pub fn contains_main(&self, lnum: Lnum) -> bool {
        lnum >= self.main_first && lnum.0 < self.leb_cnt
    }
}

/// Errors detected while packing, unpacking or deriving geometry.
///
/// This is the parse layer's error type: it carries no flash addresses
/// because the codec never performs I/O. `lpt-core` converts it into the
/// user-facing `LptError`, adding the node's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes, got {actual}")]
    InsufficientData { needed: usize, actual: usize },

    #[error("bad CRC: stored {stored:#06x}, computed {computed:#06x}")]
    CrcMismatch { stored: u16, computed: u16 },

    #[error("bad node type tag: expected {expected}, found {found}")]
    BadNodeType { expected: u32, found: u32 },

    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_tags_round_trip() {
        for ty in [
            LptNodeType::Pnode,
            LptNodeType::Nnode,
            LptNodeType::Ltab,
            LptNodeType::Lsave,
        ] {
            assert_eq!(LptNodeType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(LptNodeType::from_tag(4), None);
        assert_eq!(LptNodeType::from_tag(15), None);
    }

    #[test]
    fn layout_ranges() {
        let layout = LptLayout {
            lpt_first: Lnum(3),
            lpt_lebs: 4,
            root: NodeAddr::new(3, 0),
            ltab: NodeAddr::new(4, 0),
            lsave: None,
            main_first: Lnum(7),
            leb_cnt: 100,
        };
        assert_eq!(layout.lpt_last(), Lnum(6));
        assert!(layout.contains_lpt(Lnum(3)));
        assert!(layout.contains_lpt(Lnum(6)));
        assert!(!layout.contains_lpt(Lnum(7)));
        assert!(layout.contains_main(Lnum(7)));
        assert!(layout.contains_main(Lnum(99)));
        assert!(!layout.contains_main(Lnum(100)));
        assert!(!layout.contains_main(Lnum(2)));
    }

    #[test]
    fn default_lprops_is_uncategorized() {
        let props = LebProps::default();
        assert_eq!(props.flags.cat, LpropsCategory::Uncat);
        assert!(!props.flags.index);
        assert_eq!(props.free, 0);
    }
}
