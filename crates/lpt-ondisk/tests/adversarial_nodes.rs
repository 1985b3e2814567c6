#![forbid(unsafe_code)]
//! Adversarial decode coverage: every corrupted node must be rejected
//! with a typed `ParseError`, never a panic and never silent acceptance
//! of different bytes.

use lpt_ondisk::{
    pack_ltab, pack_nnode, pack_pnode, unpack_ltab, unpack_nnode, unpack_pnode, GeometryInput,
    LptGeometry, RawBranch, RawLprops, RawLtabEntry, RawNnode, RawPnode,
};
use lpt_types::{Lnum, ParseError};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    crc_mismatch: u32,
    bad_node_type: u32,
    invalid_field: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::CrcMismatch { .. } => self.crc_mismatch += 1,
            ParseError::BadNodeType { .. } => self.bad_node_type += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
        }
    }
}

fn small_geom() -> LptGeometry {
    LptGeometry::calculate(&GeometryInput {
        leb_size: 64 * 1024,
        min_io_size: 512,
        leb_cnt: 512,
        max_leb_cnt: 512,
        main_lebs: 480,
        lpt_lebs: 6,
        lsave_cnt: 0,
        big_lpt: false,
    })
    .unwrap()
}

const LPT_FIRST: Lnum = Lnum(4);

fn samples(geom: &LptGeometry) -> Vec<(&'static str, Vec<u8>)> {
    let pnode = RawPnode {
        num: 0,
        lprops: [
            RawLprops {
                free: 64 * 1024,
                dirty: 0,
                index: false,
            },
            RawLprops {
                free: 512,
                dirty: 1024,
                index: true,
            },
            RawLprops {
                free: 0,
                dirty: 64 * 1024,
                index: false,
            },
            RawLprops {
                free: 1536,
                dirty: 8,
                index: false,
            },
        ],
    };
    let nnode = RawNnode {
        num: 0,
        branches: [
            RawBranch {
                lnum: Lnum(4),
                offs: 100,
            },
            RawBranch {
                lnum: Lnum(9),
                offs: 0,
            },
            RawBranch {
                lnum: Lnum(0),
                offs: 0,
            },
            RawBranch {
                lnum: Lnum(5),
                offs: 64 * 1024 - 32,
            },
        ],
    };
    let ltab: Vec<RawLtabEntry> = (0..geom.lpt_lebs)
        .map(|i| RawLtabEntry {
            free: i * 512,
            dirty: i * 8,
        })
        .collect();

    vec![
        ("pnode", pack_pnode(geom, &pnode)),
        ("nnode", pack_nnode(geom, LPT_FIRST, &nnode)),
        ("ltab", pack_ltab(geom, &ltab)),
    ]
}

fn decode(geom: &LptGeometry, kind: &str, bytes: &[u8]) -> Result<(), ParseError> {
    match kind {
        "pnode" => unpack_pnode(geom, bytes).map(|_| ()),
        "nnode" => unpack_nnode(geom, LPT_FIRST, bytes).map(|_| ()),
        "ltab" => unpack_ltab(geom, bytes).map(|_| ()),
        _ => unreachable!(),
    }
}

#[test]
fn single_bit_flips_never_decode() {
    let geom = small_geom();
    let mut coverage = ErrorCoverage::default();

    for (kind, packed) in samples(&geom) {
        for bit in 0..packed.len() * 8 {
            let mut corrupt = packed.clone();
            corrupt[bit / 8] ^= 0x80 >> (bit % 8);
            match decode(&geom, kind, &corrupt) {
                Ok(()) => panic!("{kind}: flipped bit {bit} decoded successfully"),
                Err(err) => coverage.observe(&err),
            }
        }
    }

    // Bit flips land in the CRC field or the body; both classes must
    // show up.
    assert!(coverage.crc_mismatch > 0);
    assert_eq!(coverage.insufficient_data, 0);
    assert_eq!(coverage.bad_node_type, 0);
}

#[test]
fn truncations_never_decode() {
    let geom = small_geom();
    let mut coverage = ErrorCoverage::default();

    for (kind, packed) in samples(&geom) {
        for len in 0..packed.len() {
            match decode(&geom, kind, &packed[..len]) {
                Ok(()) => panic!("{kind}: truncation to {len} bytes decoded"),
                Err(err) => coverage.observe(&err),
            }
        }
    }

    assert!(coverage.insufficient_data > 0);
    assert_eq!(coverage.crc_mismatch, 0, "short reads must not reach CRC math");
}

#[test]
fn cross_typed_nodes_never_decode() {
    // Feed each node's bytes (padded or trimmed to size) to the other
    // decoders: either the CRC over the differently-sized body fails or
    // the type tag gives it away.
    let geom = small_geom();
    let mut coverage = ErrorCoverage::default();

    for (kind, packed) in samples(&geom) {
        for other in ["pnode", "nnode", "ltab"] {
            if other == kind {
                continue;
            }
            let needed = match other {
                "pnode" => geom.pnode_sz as usize,
                "nnode" => geom.nnode_sz as usize,
                "ltab" => geom.ltab_sz as usize,
                _ => unreachable!(),
            };
            let mut bytes = packed.clone();
            bytes.resize(needed, 0xFF);
            match decode(&geom, other, &bytes) {
                Ok(()) => panic!("{kind} bytes decoded as {other}"),
                Err(err) => coverage.observe(&err),
            }
        }
    }

    assert!(coverage.crc_mismatch + coverage.bad_node_type > 0);
}

#[test]
fn random_noise_never_decodes() {
    let geom = small_geom();
    // Deterministic xorshift noise; no RNG dependency needed.
    let mut state = 0x9E37_79B9_u32;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };

    for _ in 0..256 {
        let mut bytes = vec![0u8; geom.max_node_sz() as usize];
        for b in &mut bytes {
            *b = next() as u8;
        }
        assert!(decode(&geom, "pnode", &bytes).is_err());
        assert!(decode(&geom, "nnode", &bytes).is_err());
    }
}
