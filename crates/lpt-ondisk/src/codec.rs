//! Packers and unpackers for the four on-flash LPT node kinds.
//!
//! Layouts, CRC first in every case:
//!
//! - pnode: `[crc16][type][num?][(free, dirty, is_index) x FANOUT]`
//! - nnode: `[crc16][type][num?][(lnum, offs) x FANOUT]`
//! - ltab:  `[crc16][type][(free, dirty) x lpt_lebs]`
//! - lsave: `[crc16][type][lnum x lsave_cnt]`
//!
//! The `num` field is present only in the big model. pnode space counts
//! are stored shifted right by 3; nnode branch LEB numbers are stored
//! relative to the first LPT LEB, with the unwritten marker (absolute 0)
//! encoded as one past the last LPT LEB.
//!
//! The CRC16 covers the node body excluding the CRC field itself and
//! uses the 0xFFFF initial value of the kernel `crc16` (CRC-16/MODBUS
//! parameters).

use crate::bits::{BitReader, BitWriter};
use crate::geom::LptGeometry;
use crc::{Crc, CRC_16_MODBUS};
use lpt_types::{
    Lnum, LptNodeType, ParseError, LPT_CRC_BITS, LPT_CRC_BYTES, LPT_FANOUT, LPT_TYPE_BITS,
};

/// CRC used by every packed LPT node.
pub const LPT_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// One LEB property record as stored in a pnode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawLprops {
    pub free: u32,
    pub dirty: u32,
    pub index: bool,
}

/// Unpacked pnode payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawPnode {
    /// Position-derived node number; zero in the small model.
    pub num: u32,
    pub lprops: [RawLprops; LPT_FANOUT],
}

/// One nnode branch: the flash address of a child node. `lnum == 0`
/// means the child was never written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawBranch {
    pub lnum: Lnum,
    pub offs: u32,
}

/// Unpacked nnode payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawNnode {
    pub num: u32,
    pub branches: [RawBranch; LPT_FANOUT],
}

/// Space accounting for one LEB of the LPT area itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawLtabEntry {
    pub free: u32,
    pub dirty: u32,
}

fn check_crc(buf: &[u8], len: usize) -> Result<(), ParseError> {
    if buf.len() < len {
        return Err(ParseError::InsufficientData {
            needed: len,
            actual: buf.len(),
        });
    }
    let mut reader = BitReader::new(buf);
    let stored = reader.read_bits(LPT_CRC_BITS)? as u16;
    let computed = LPT_CRC.checksum(&buf[LPT_CRC_BYTES..len]);
    if stored != computed {
        return Err(ParseError::CrcMismatch { stored, computed });
    }
    Ok(())
}

fn check_type(reader: &mut BitReader<'_>, expected: LptNodeType) -> Result<(), ParseError> {
    let found = reader.read_bits(LPT_TYPE_BITS)?;
    if found != expected.tag() {
        return Err(ParseError::BadNodeType {
            expected: expected.tag(),
            found,
        });
    }
    Ok(())
}

/// Seal a packed node body: prepend the CRC over `body`, which must
/// already be padded to the node size minus the CRC field.
fn seal(body: Vec<u8>) -> Vec<u8> {
    let crc = LPT_CRC.checksum(&body);
    let mut out = Vec::with_capacity(body.len() + LPT_CRC_BYTES);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn body_writer(node_sz: u32) -> BitWriter {
    BitWriter::with_capacity(node_sz as usize - LPT_CRC_BYTES)
}

fn finish_body(writer: BitWriter, node_sz: u32) -> Vec<u8> {
    let mut body = writer.into_bytes();
    body.resize(node_sz as usize - LPT_CRC_BYTES, 0);
    body
}

// ── pnode ───────────────────────────────────────────────────────────────────

pub fn unpack_pnode(geom: &LptGeometry, buf: &[u8]) -> Result<RawPnode, ParseError> {
    let len = geom.pnode_sz as usize;
    check_crc(buf, len)?;
    let mut reader = BitReader::new(&buf[LPT_CRC_BYTES..len]);
    check_type(&mut reader, LptNodeType::Pnode)?;

    let mut pnode = RawPnode::default();
    if geom.big_lpt {
        pnode.num = reader.read_bits(geom.pcnt_bits)?;
    }
    for slot in &mut pnode.lprops {
        slot.free = reader.read_bits(geom.space_bits)? << 3;
        slot.dirty = reader.read_bits(geom.space_bits)? << 3;
        slot.index = reader.read_bits(1)? != 0;
    }
    Ok(pnode)
}

pub fn pack_pnode(geom: &LptGeometry, pnode: &RawPnode) -> Vec<u8> {
    let mut writer = body_writer(geom.pnode_sz);
    writer.write_bits(LptNodeType::Pnode.tag(), LPT_TYPE_BITS);
    if geom.big_lpt {
        writer.write_bits(pnode.num, geom.pcnt_bits);
    }
    for slot in &pnode.lprops {
        debug_assert_eq!(slot.free & 7, 0);
        debug_assert_eq!(slot.dirty & 7, 0);
        writer.write_bits(slot.free >> 3, geom.space_bits);
        writer.write_bits(slot.dirty >> 3, geom.space_bits);
        writer.write_bits(u32::from(slot.index), 1);
    }
    seal(finish_body(writer, geom.pnode_sz))
}

// ── nnode ───────────────────────────────────────────────────────────────────

pub fn unpack_nnode(
    geom: &LptGeometry,
    lpt_first: Lnum,
    buf: &[u8],
) -> Result<RawNnode, ParseError> {
    let len = geom.nnode_sz as usize;
    check_crc(buf, len)?;
    let mut reader = BitReader::new(&buf[LPT_CRC_BYTES..len]);
    check_type(&mut reader, LptNodeType::Nnode)?;

    let mut nnode = RawNnode::default();
    if geom.big_lpt {
        nnode.num = reader.read_bits(geom.pcnt_bits)?;
    }
    let lpt_last = lpt_first.0 + geom.lpt_lebs - 1;
    for branch in &mut nnode.branches {
        let mut lnum = reader.read_bits(geom.lpt_lnum_bits)? + lpt_first.0;
        if lnum == lpt_last + 1 {
            lnum = 0;
        }
        branch.lnum = Lnum(lnum);
        branch.offs = reader.read_bits(geom.lpt_offs_bits)?;
    }
    Ok(nnode)
}

pub fn pack_nnode(geom: &LptGeometry, lpt_first: Lnum, nnode: &RawNnode) -> Vec<u8> {
    let mut writer = body_writer(geom.nnode_sz);
    writer.write_bits(LptNodeType::Nnode.tag(), LPT_TYPE_BITS);
    if geom.big_lpt {
        writer.write_bits(nnode.num, geom.pcnt_bits);
    }
    let lpt_last = lpt_first.0 + geom.lpt_lebs - 1;
    for branch in &nnode.branches {
        let lnum = if branch.lnum.0 == 0 {
            lpt_last + 1
        } else {
            branch.lnum.0
        };
        debug_assert!(lnum >= lpt_first.0 && lnum <= lpt_last + 1);
        writer.write_bits(lnum - lpt_first.0, geom.lpt_lnum_bits);
        writer.write_bits(branch.offs, geom.lpt_offs_bits);
    }
    seal(finish_body(writer, geom.nnode_sz))
}

// ── ltab ────────────────────────────────────────────────────────────────────

/// Unpack the ltab node, range-checking every entry against the LEB
/// size. A CRC-valid ltab with impossible space counts is corrupt.
pub fn unpack_ltab(geom: &LptGeometry, buf: &[u8]) -> Result<Vec<RawLtabEntry>, ParseError> {
    let len = geom.ltab_sz as usize;
    check_crc(buf, len)?;
    let mut reader = BitReader::new(&buf[LPT_CRC_BYTES..len]);
    check_type(&mut reader, LptNodeType::Ltab)?;

    let mut entries = Vec::with_capacity(geom.lpt_lebs as usize);
    for _ in 0..geom.lpt_lebs {
        let free = reader.read_bits(geom.lpt_spc_bits)?;
        let dirty = reader.read_bits(geom.lpt_spc_bits)?;
        if free > geom.leb_size || dirty > geom.leb_size || free + dirty > geom.leb_size {
            return Err(ParseError::InvalidField {
                field: "ltab",
                reason: "free/dirty exceed the LEB size",
            });
        }
        entries.push(RawLtabEntry { free, dirty });
    }
    Ok(entries)
}

pub fn pack_ltab(geom: &LptGeometry, entries: &[RawLtabEntry]) -> Vec<u8> {
    debug_assert_eq!(entries.len(), geom.lpt_lebs as usize);
    let mut writer = body_writer(geom.ltab_sz);
    writer.write_bits(LptNodeType::Ltab.tag(), LPT_TYPE_BITS);
    for entry in entries {
        writer.write_bits(entry.free, geom.lpt_spc_bits);
        writer.write_bits(entry.dirty, geom.lpt_spc_bits);
    }
    seal(finish_body(writer, geom.ltab_sz))
}

// ── lsave ───────────────────────────────────────────────────────────────────

/// Unpack the lsave table (big model): a list of LEB numbers visited
/// first on remount.
pub fn unpack_lsave(geom: &LptGeometry, buf: &[u8]) -> Result<Vec<Lnum>, ParseError> {
    let len = geom.lsave_sz as usize;
    check_crc(buf, len)?;
    let mut reader = BitReader::new(&buf[LPT_CRC_BYTES..len]);
    check_type(&mut reader, LptNodeType::Lsave)?;

    let mut lnums = Vec::with_capacity(geom.lsave_cnt as usize);
    for _ in 0..geom.lsave_cnt {
        let lnum = reader.read_bits(geom.lnum_bits)?;
        if lnum >= geom.leb_cnt {
            return Err(ParseError::InvalidField {
                field: "lsave",
                reason: "saved LEB number beyond the volume",
            });
        }
        lnums.push(Lnum(lnum));
    }
    Ok(lnums)
}

pub fn pack_lsave(geom: &LptGeometry, lnums: &[Lnum]) -> Vec<u8> {
    debug_assert_eq!(lnums.len(), geom.lsave_cnt as usize);
    let mut writer = body_writer(geom.lsave_sz);
    writer.write_bits(LptNodeType::Lsave.tag(), LPT_TYPE_BITS);
    for lnum in lnums {
        writer.write_bits(lnum.0, geom.lnum_bits);
    }
    seal(finish_body(writer, geom.lsave_sz))
}
