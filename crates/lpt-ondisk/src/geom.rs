//! LPT geometry.
//!
//! All packed field widths, node byte sizes, the tree height and the
//! total LPT footprint are functions of the volume parameters. They are
//! derived once at mount into an immutable [`LptGeometry`] that every
//! codec and tree operation takes by reference.

use lpt_types::{ParseError, LPT_CRC_BITS, LPT_FANOUT, LPT_FANOUT_SHIFT, LPT_TYPE_BITS};

/// Bit length of `v` (position of the highest set bit, 1-based).
fn fls(v: u32) -> u32 {
    32 - v.leading_zeros()
}

fn align_up(v: u64, alignment: u64) -> u64 {
    v.div_ceil(alignment) * alignment
}

/// Volume parameters the geometry is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryInput {
    /// LEB size in bytes.
    pub leb_size: u32,
    /// Minimum I/O unit of the flash.
    pub min_io_size: u32,
    /// Current LEB count of the volume.
    pub leb_cnt: u32,
    /// LEB count the volume may grow to; field widths are sized for it.
    pub max_leb_cnt: u32,
    /// LEBs in the main area (the LEBs the tree describes).
    pub main_lebs: u32,
    /// LEBs reserved for the LPT area itself.
    pub lpt_lebs: u32,
    /// Entries in the lsave table (big model only).
    pub lsave_cnt: u32,
    /// Big-model layout: node numbers on flash plus an lsave table.
    pub big_lpt: bool,
}

/// Derived, immutable geometry of the LPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LptGeometry {
    pub leb_size: u32,
    pub min_io_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub main_lebs: u32,
    pub lpt_lebs: u32,
    pub lsave_cnt: u32,
    pub big_lpt: bool,

    /// Height of the tree; the root nnode sits at this level, pnodes
    /// conceptually at level 0.
    pub lpt_hght: u32,
    /// Leaf nodes needed to cover the main area.
    pub pnode_cnt: u32,
    /// Internal nodes across all levels.
    pub nnode_cnt: u32,

    /// Width of a packed free/dirty count (stored as `bytes >> 3`).
    pub space_bits: u32,
    /// Width of an LPT-relative LEB number in an nnode branch.
    pub lpt_lnum_bits: u32,
    /// Width of a node offset within an LPT LEB.
    pub lpt_offs_bits: u32,
    /// Width of an ltab free/dirty count (byte granularity).
    pub lpt_spc_bits: u32,
    /// Width of a node number (big model).
    pub pcnt_bits: u32,
    /// Width of an absolute LEB number in the lsave table.
    pub lnum_bits: u32,

    /// Packed byte sizes of each node kind.
    pub pnode_sz: u32,
    pub nnode_sz: u32,
    pub ltab_sz: u32,
    pub lsave_sz: u32,

    /// Total LPT footprint including per-LEB wastage: a node never spans
    /// two LEBs, so each partially filled LEB wastes up to one node.
    pub lpt_sz: u64,
}

impl LptGeometry {
    /// Derive the geometry without enforcing the mount invariants.
    ///
    /// Useful for sizing a volume (how big would the LPT be?); mounting
    /// goes through [`LptGeometry::calculate`].
    #[must_use]
    pub fn derive(input: &GeometryInput) -> Self {
        let fanout = LPT_FANOUT as u32;
        let pnode_cnt = input.main_lebs.div_ceil(fanout);

        let mut lpt_hght = 1;
        let mut n = fanout;
        while n < pnode_cnt {
            lpt_hght += 1;
            n <<= LPT_FANOUT_SHIFT;
        }

        let mut n = pnode_cnt.div_ceil(fanout);
        let mut nnode_cnt = n;
        for _ in 1..lpt_hght {
            n = n.div_ceil(fanout);
            nnode_cnt += n;
        }

        let space_bits = fls(input.leb_size) - 3;
        let lpt_lnum_bits = fls(input.lpt_lebs);
        let lpt_offs_bits = fls(input.leb_size - 1);
        let lpt_spc_bits = fls(input.leb_size);
        let pcnt_bits = fls(input.max_leb_cnt.div_ceil(fanout) - 1);
        let lnum_bits = fls(input.max_leb_cnt - 1);

        let hdr_bits = LPT_CRC_BITS + LPT_TYPE_BITS;
        let num_bits = if input.big_lpt { pcnt_bits } else { 0 };

        let bits = hdr_bits + num_bits + (space_bits * 2 + 1) * fanout;
        let pnode_sz = bits.div_ceil(8);

        let bits = hdr_bits + num_bits + (lpt_lnum_bits + lpt_offs_bits) * fanout;
        let nnode_sz = bits.div_ceil(8);

        let bits = hdr_bits + input.lpt_lebs * lpt_spc_bits * 2;
        let ltab_sz = bits.div_ceil(8);

        let bits = hdr_bits + lnum_bits * input.lsave_cnt;
        let lsave_sz = bits.div_ceil(8);

        let mut lpt_sz = u64::from(pnode_cnt) * u64::from(pnode_sz)
            + u64::from(nnode_cnt) * u64::from(nnode_sz)
            + u64::from(ltab_sz);
        if input.big_lpt {
            lpt_sz += u64::from(lsave_sz);
        }

        // Wastage: walk LEB by LEB, losing up to one max-size node at
        // each LEB boundary, then align the tail to the min I/O unit.
        let leb_size = u64::from(input.leb_size);
        let per_leb_wastage = u64::from(pnode_sz.max(nnode_sz));
        let mut sz = lpt_sz + per_leb_wastage;
        let mut tot_wastage = per_leb_wastage;
        while sz > leb_size {
            sz += per_leb_wastage;
            sz -= leb_size;
            tot_wastage += per_leb_wastage;
        }
        tot_wastage += align_up(sz, u64::from(input.min_io_size)) - sz;
        lpt_sz += tot_wastage;

        Self {
            leb_size: input.leb_size,
            min_io_size: input.min_io_size,
            leb_cnt: input.leb_cnt,
            max_leb_cnt: input.max_leb_cnt,
            main_lebs: input.main_lebs,
            lpt_lebs: input.lpt_lebs,
            lsave_cnt: input.lsave_cnt,
            big_lpt: input.big_lpt,
            lpt_hght,
            pnode_cnt,
            nnode_cnt,
            space_bits,
            lpt_lnum_bits,
            lpt_offs_bits,
            lpt_spc_bits,
            pcnt_bits,
            lnum_bits,
            pnode_sz,
            nnode_sz,
            ltab_sz,
            lsave_sz,
            lpt_sz,
        }
    }

    /// Derive the geometry and enforce the mount-time invariants.
    ///
    /// Fails if the LPT area cannot hold at least twice the computed LPT
    /// size (the headroom a copy-on-write commit needs) or if the ltab
    /// node does not fit in a single LEB (it is never split).
    pub fn calculate(input: &GeometryInput) -> Result<Self, ParseError> {
        validate_input(input)?;
        let geom = Self::derive(input);

        let leb_size = u64::from(input.leb_size);
        let lebs_needed = (geom.lpt_sz * 2).div_ceil(leb_size);
        if lebs_needed > u64::from(input.lpt_lebs) {
            return Err(ParseError::InvalidField {
                field: "lpt_lebs",
                reason: "too few LPT LEBs to hold twice the LPT size",
            });
        }

        if geom.ltab_sz > input.leb_size {
            return Err(ParseError::InvalidField {
                field: "ltab_sz",
                reason: "ltab node does not fit in a single LEB",
            });
        }

        Ok(geom)
    }

    /// The larger of the two tree node sizes; sized buffers for node
    /// reads use this.
    #[must_use]
    pub fn max_node_sz(&self) -> u32 {
        self.pnode_sz.max(self.nnode_sz)
    }
}

fn validate_input(input: &GeometryInput) -> Result<(), ParseError> {
    if input.min_io_size < 8 || !input.min_io_size.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field: "min_io_size",
            reason: "must be a power of two of at least 8",
        });
    }
    if input.leb_size == 0 || input.leb_size % input.min_io_size != 0 {
        return Err(ParseError::InvalidField {
            field: "leb_size",
            reason: "must be a non-zero multiple of min_io_size",
        });
    }
    if input.main_lebs == 0 {
        return Err(ParseError::InvalidField {
            field: "main_lebs",
            reason: "must be non-zero",
        });
    }
    if input.lpt_lebs == 0 {
        return Err(ParseError::InvalidField {
            field: "lpt_lebs",
            reason: "must be non-zero",
        });
    }
    if input.leb_cnt < input.main_lebs {
        return Err(ParseError::InvalidField {
            field: "leb_cnt",
            reason: "smaller than the main area",
        });
    }
    if input.max_leb_cnt < input.leb_cnt {
        return Err(ParseError::InvalidField {
            field: "max_leb_cnt",
            reason: "smaller than the current LEB count",
        });
    }
    if input.big_lpt && input.lsave_cnt == 0 {
        return Err(ParseError::InvalidField {
            field: "lsave_cnt",
            reason: "big-model LPT requires a non-empty lsave table",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_128k_1000() -> GeometryInput {
        GeometryInput {
            leb_size: 128 * 1024,
            min_io_size: 2048,
            leb_cnt: 1024,
            max_leb_cnt: 1024,
            main_lebs: 1000,
            lpt_lebs: 4,
            lsave_cnt: 0,
            big_lpt: false,
        }
    }

    #[test]
    fn height_for_1000_main_lebs_is_4() {
        // ceil(1000 / 4) = 250 pnodes; 4^4 = 256 >= 250.
        let geom = LptGeometry::calculate(&input_128k_1000()).unwrap();
        assert_eq!(geom.pnode_cnt, 250);
        assert_eq!(geom.lpt_hght, 4);
        // 63 + 16 + 4 + 1 internal nodes.
        assert_eq!(geom.nnode_cnt, 84);
    }

    #[test]
    fn field_widths_follow_bit_length() {
        let geom = LptGeometry::calculate(&input_128k_1000()).unwrap();
        // leb_size = 2^17: fls = 18.
        assert_eq!(geom.space_bits, 15);
        assert_eq!(geom.lpt_spc_bits, 18);
        assert_eq!(geom.lpt_offs_bits, 17);
        assert_eq!(geom.lpt_lnum_bits, fls(4));
        assert_eq!(geom.lnum_bits, fls(1023));
    }

    #[test]
    fn node_sizes_cover_packed_bits() {
        let geom = LptGeometry::calculate(&input_128k_1000()).unwrap();
        // pnode: 20 header bits + (15 * 2 + 1) * 4 = 144 bits.
        assert_eq!(geom.pnode_sz, 18);
        // nnode: 20 + (3 + 17) * 4 = 100 bits.
        assert_eq!(geom.nnode_sz, 13);
        // ltab: 20 + 4 * 18 * 2 = 164 bits.
        assert_eq!(geom.ltab_sz, 21);
    }

    #[test]
    fn big_model_adds_node_numbers() {
        let mut input = input_128k_1000();
        input.big_lpt = true;
        input.lsave_cnt = 256;
        let small = LptGeometry::calculate(&input_128k_1000()).unwrap();
        let big = LptGeometry::calculate(&input).unwrap();
        assert!(big.pnode_sz > small.pnode_sz);
        assert!(big.nnode_sz > small.nnode_sz);
        assert!(big.lpt_sz > small.lpt_sz);
    }

    #[test]
    fn too_few_lpt_lebs_is_rejected_at_the_boundary() {
        // Small LEBs and a large main area so the 2x headroom boundary
        // falls inside the scanned range; every lpt_lebs below the
        // documented minimum must fail, every one at or above succeed.
        let mut input = GeometryInput {
            leb_size: 2048,
            min_io_size: 8,
            leb_cnt: 11000,
            max_leb_cnt: 11000,
            main_lebs: 10000,
            lpt_lebs: 1,
            lsave_cnt: 0,
            big_lpt: false,
        };
        let mut saw_reject = false;
        let mut saw_accept = false;
        for lpt_lebs in 1..64 {
            input.lpt_lebs = lpt_lebs;
            let derived = LptGeometry::derive(&input);
            let needed = (derived.lpt_sz * 2).div_ceil(u64::from(input.leb_size));
            let result = LptGeometry::calculate(&input);
            if u64::from(lpt_lebs) >= needed {
                assert!(result.is_ok(), "lpt_lebs={lpt_lebs} should satisfy 2x headroom");
                saw_accept = true;
            } else {
                assert!(matches!(
                    result,
                    Err(ParseError::InvalidField { field: "lpt_lebs", .. })
                ));
                saw_reject = true;
            }
        }
        assert!(saw_reject && saw_accept, "boundary not inside scanned range");
    }

    #[test]
    fn oversized_ltab_is_rejected() {
        // Tiny LEBs with a large LPT area: the ltab alone outgrows one
        // LEB while the 2x headroom check still passes.
        let input = GeometryInput {
            leb_size: 256,
            min_io_size: 8,
            leb_cnt: 300,
            max_leb_cnt: 300,
            main_lebs: 8,
            lpt_lebs: 200,
            lsave_cnt: 0,
            big_lpt: false,
        };
        let derived = LptGeometry::derive(&input);
        assert!(derived.ltab_sz > input.leb_size);
        assert!(matches!(
            LptGeometry::calculate(&input),
            Err(ParseError::InvalidField { field: "ltab_sz", .. })
        ));
    }

    #[test]
    fn nonsense_inputs_are_rejected() {
        let mut input = input_128k_1000();
        input.min_io_size = 6;
        assert!(LptGeometry::calculate(&input).is_err());

        let mut input = input_128k_1000();
        input.main_lebs = 0;
        assert!(LptGeometry::calculate(&input).is_err());

        let mut input = input_128k_1000();
        input.max_leb_cnt = 100;
        assert!(LptGeometry::calculate(&input).is_err());

        let mut input = input_128k_1000();
        input.big_lpt = true;
        input.lsave_cnt = 0;
        assert!(LptGeometry::calculate(&input).is_err());
    }
}
