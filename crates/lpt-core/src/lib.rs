#![forbid(unsafe_code)]
//! The in-memory LEB properties tree.
//!
//! A fixed-fanout tree of internal nodes (nnodes) and leaf nodes
//! (pnodes, each covering [`LPT_FANOUT`] consecutive main-area LEBs),
//! read lazily from flash: a node is loaded the first time a lookup
//! descends through it, and a branch whose address is LEB 0 was never
//! written — its whole subtree describes empty LEBs and is synthesized
//! in memory without touching flash.
//!
//! Nodes live in arenas owned by [`Lpt`]; parent links are arena indices
//! plus the branch slot, a weak back-reference that never owns. When a
//! commit is streaming a node out (its `cow` flag is set), mutating
//! lookups clone the node into a fresh arena slot, re-point its
//! children's parent links, splice the clone into the parent branch and
//! mark the original obsolete. The original stays in the arena, intact,
//! for the commit reader — that is the whole copy-on-write contract.
//!
//! All corruption (CRC, type tag, structural validation) is fatal to
//! the operation in progress and propagates as [`LptError`]; the tree
//! never repairs media.
//!
//! # Logging
//!
//! - **TRACE** `lpt_nnode_read` / `lpt_pnode_read` — node loaded or
//!   synthesized
//! - **DEBUG** `lpt_cow_nnode` / `lpt_cow_pnode` — node copied for write
//! - **ERROR** `lpt_nnode_read_failed` / `lpt_pnode_read_failed` /
//!   `lpt_invariant_violation` — corrupt media or accounting violation

mod cats;

pub use cats::{CatRef, Classifier, LPT_HEAP_SZ};

use lpt_error::{LptError, Result};
use lpt_flash::LebDevice;
use lpt_ondisk::{codec, LptGeometry};
use lpt_types::{
    LebProps, Lnum, LpropsCategory, LptLayout, NodeAddr, ParseError, LPT_FANOUT, LPT_FANOUT_SHIFT,
};
use std::sync::Arc;
use tracing::{debug, error, trace};

// ── Arena nodes ─────────────────────────────────────────────────────────────

/// Index of an nnode in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NnodeId(pub(crate) u32);

/// Index of a pnode in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PnodeId(pub(crate) u32);

impl NnodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl PnodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    Nnode(NnodeId),
    Pnode(PnodeId),
}

/// Node lifecycle flags.
///
/// `dirty`: changed since the last commit, must be written out.
/// `cow`: part of an in-flight commit snapshot; mutate via clone only.
/// `obsolete`: superseded by a clone; the commit still reads it, nothing
/// may mutate or re-link it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct NodeFlags {
    dirty: bool,
    cow: bool,
    obsolete: bool,
}

/// One branch of an nnode: the flash address of the child plus, once
/// loaded, the child's arena slot.
#[derive(Debug, Clone, Copy)]
struct Branch {
    lnum: Lnum,
    offs: u32,
    child: Option<Child>,
}

impl Branch {
    const EMPTY: Self = Self {
        lnum: Lnum(0),
        offs: 0,
        child: None,
    };
}

#[derive(Debug, Clone)]
struct Nnode {
    num: u32,
    /// Distance from the leaves; the root sits at `lpt_hght`, nnodes
    /// whose branches hold pnodes at 1.
    level: u32,
    parent: Option<(NnodeId, usize)>,
    flags: NodeFlags,
    branches: [Branch; LPT_FANOUT],
}

#[derive(Debug, Clone)]
struct Pnode {
    num: u32,
    parent: (NnodeId, usize),
    flags: NodeFlags,
    lprops: [LebProps; LPT_FANOUT],
}

/// Space accounting for one LEB of the LPT area itself.
///
/// `tgc` and `cmt` are runtime-only transient flags (garbage collection
/// and commit bookkeeping); they are never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LtabEntry {
    pub free: u32,
    pub dirty: u32,
    pub tgc: bool,
    pub cmt: bool,
}

// ── The tree ────────────────────────────────────────────────────────────────

/// The LEB properties tree of one mounted volume.
///
/// All operations are synchronous and assume the caller serializes
/// access; the only tolerated concurrent reader is a commit holding
/// `cow`-flagged nodes, which copy-on-write keeps valid.
pub struct Lpt {
    dev: Arc<dyn LebDevice>,
    geom: LptGeometry,
    layout: LptLayout,
    classifier: Classifier,
    nnodes: Vec<Nnode>,
    pnodes: Vec<Pnode>,
    nroot: Option<NnodeId>,
    ltab: Vec<LtabEntry>,
    cats: cats::Cats,
    dirty_nn_cnt: u32,
    dirty_pn_cnt: u32,
    pnodes_loaded: u32,
    /// Latched the first time the root's dirt makes the ltab itself
    /// dirty in this commit cycle, so the ltab's own size is accounted
    /// exactly once.
    ltab_dirty: bool,
}

impl std::fmt::Debug for Lpt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lpt")
            .field("nnodes", &self.nnodes.len())
            .field("pnodes", &self.pnodes.len())
            .field("nroot", &self.nroot)
            .finish_non_exhaustive()
    }
}

impl Lpt {
    /// Bring up the subsystem for a mounted volume.
    ///
    /// With `rd` set this reads and validates the ltab node — the ltab
    /// cannot be reconstructed from anything else, so any failure here
    /// is fatal to the mount. Without `rd` the ltab starts zeroed (the
    /// caller is only going to write, e.g. when creating a volume).
    pub fn init(
        dev: Arc<dyn LebDevice>,
        geom: LptGeometry,
        layout: LptLayout,
        dead_wm: u32,
        rd: bool,
    ) -> Result<Self> {
        check_layout(&geom, &layout, dev.as_ref())?;
        let classifier = Classifier {
            leb_size: geom.leb_size,
            min_io_size: geom.min_io_size,
            dead_wm,
        };
        let mut lpt = Self {
            dev,
            geom,
            layout,
            classifier,
            nnodes: Vec::new(),
            pnodes: Vec::new(),
            nroot: None,
            ltab: vec![LtabEntry::default(); geom.lpt_lebs as usize],
            cats: cats::Cats::new(),
            dirty_nn_cnt: 0,
            dirty_pn_cnt: 0,
            pnodes_loaded: 0,
            ltab_dirty: false,
        };
        if rd {
            lpt.read_ltab()?;
        }
        debug!(
            lpt_hght = geom.lpt_hght,
            pnode_cnt = geom.pnode_cnt,
            nnode_cnt = geom.nnode_cnt,
            pnode_sz = geom.pnode_sz,
            nnode_sz = geom.nnode_sz,
            ltab_sz = geom.ltab_sz,
            big_lpt = geom.big_lpt,
            "lpt_init"
        );
        Ok(lpt)
    }

    #[must_use]
    pub fn geometry(&self) -> &LptGeometry {
        &self.geom
    }

    #[must_use]
    pub fn layout(&self) -> &LptLayout {
        &self.layout
    }

    /// The space accounting entry for an LPT-area LEB.
    #[must_use]
    pub fn ltab_entry(&self, lnum: Lnum) -> Option<LtabEntry> {
        if !self.layout.contains_lpt(lnum) {
            return None;
        }
        Some(self.ltab[(lnum.0 - self.layout.lpt_first.0) as usize])
    }

    /// Classify a property record (free-space category).
    #[must_use]
    pub fn categorize(&self, props: &LebProps) -> LpropsCategory {
        self.classifier.categorize(props)
    }

    /// Number of records currently filed under a category.
    #[must_use]
    pub fn category_len(&self, cat: LpropsCategory) -> usize {
        self.cats.len(cat)
    }

    /// The pnode currently holding the categorized record for `lnum`
    /// under `cat`, if one is registered.
    #[must_use]
    pub fn categorized_pnode(&self, cat: LpropsCategory, lnum: Lnum) -> Option<PnodeId> {
        self.cats.find(cat, lnum).map(|entry| entry.pnode)
    }

    /// LEBs on the freeable list — whole-LEB reclaim candidates.
    #[must_use]
    pub fn freeable_count(&self) -> u32 {
        self.cats.freeable_cnt
    }

    /// Records registered in any category container.
    #[must_use]
    pub fn categorized_count(&self) -> u32 {
        self.cats.in_cat_cnt
    }

    #[must_use]
    pub fn dirty_nnode_count(&self) -> u32 {
        self.dirty_nn_cnt
    }

    #[must_use]
    pub fn dirty_pnode_count(&self) -> u32 {
        self.dirty_pn_cnt
    }

    /// Pnodes materialized in memory so far. Each pnode is read from
    /// flash at most once per mount.
    #[must_use]
    pub fn loaded_pnode_count(&self) -> u32 {
        self.pnodes_loaded
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// The properties of main-area LEB `lnum`.
    ///
    /// Loads the path from the root on demand. The returned reference is
    /// read-only; mutation goes through [`Lpt::lookup_dirty`], which is
    /// what keeps the copy-on-write accounting honest.
    pub fn lookup(&mut self, lnum: Lnum) -> Result<&LebProps> {
        let (pid, slot) = self.pnode_for(lnum, false)?;
        Ok(&self.pnodes[pid.index()].lprops[slot])
    }

    /// Like [`Lpt::lookup`], but copy-on-write-dirties every node on the
    /// path so the returned record is safe to mutate. The only correct
    /// way to obtain a mutable record.
    pub fn lookup_dirty(&mut self, lnum: Lnum) -> Result<&mut LebProps> {
        let (pid, slot) = self.pnode_for(lnum, true)?;
        Ok(&mut self.pnodes[pid.index()].lprops[slot])
    }

    /// Descend to the pnode covering `lnum`, optionally dirtying the
    /// whole path. Node loads are strictly top-down: a child's flash
    /// address is only known once its parent is unpacked.
    fn pnode_for(&mut self, lnum: Lnum, dirtying: bool) -> Result<(PnodeId, usize)> {
        if !self.layout.contains_main(lnum) {
            return Err(LptError::OutOfRange {
                lnum: lnum.0,
                offs: 0,
                detail: "LEB outside the main area".to_owned(),
            });
        }

        let root = self.nroot;
        let mut nid = match root {
            Some(id) => id,
            None => self.read_nnode(None)?,
        };
        if dirtying {
            nid = self.dirty_cow_nnode(nid);
        }

        let i = lnum.0 - self.layout.main_first.0;
        let fanout_mask = LPT_FANOUT as u32 - 1;
        let mut shft = self.geom.lpt_hght * LPT_FANOUT_SHIFT;
        for _ in 1..self.geom.lpt_hght {
            let iip = ((i >> shft) & fanout_mask) as usize;
            shft -= LPT_FANOUT_SHIFT;
            nid = self.get_nnode(nid, iip)?;
            if dirtying {
                nid = self.dirty_cow_nnode(nid);
            }
        }

        let iip = ((i >> shft) & fanout_mask) as usize;
        let mut pid = self.get_pnode(nid, iip)?;
        if dirtying {
            pid = self.dirty_cow_pnode(pid);
        }
        Ok((pid, (i & fanout_mask) as usize))
    }

    // ── Memoized accessors ──────────────────────────────────────────────────

    /// The child nnode in branch `iip`, loading it on first access.
    pub fn get_nnode(&mut self, parent: NnodeId, iip: usize) -> Result<NnodeId> {
        let branch = self.nnodes[parent.index()].branches[iip];
        match branch.child {
            Some(Child::Nnode(id)) => Ok(id),
            Some(Child::Pnode(_)) => Err(LptError::Corruption {
                lnum: branch.lnum.0,
                offs: branch.offs,
                detail: "branch holds a leaf where an internal node was expected".to_owned(),
            }),
            None => self.read_nnode(Some((parent, iip))),
        }
    }

    /// The child pnode in branch `iip`, loading it on first access and
    /// registering its records with the category bookkeeping.
    pub fn get_pnode(&mut self, parent: NnodeId, iip: usize) -> Result<PnodeId> {
        let branch = self.nnodes[parent.index()].branches[iip];
        match branch.child {
            Some(Child::Pnode(id)) => Ok(id),
            Some(Child::Nnode(_)) => Err(LptError::Corruption {
                lnum: branch.lnum.0,
                offs: branch.offs,
                detail: "branch holds an internal node where a leaf was expected".to_owned(),
            }),
            None => {
                let id = self.read_pnode((parent, iip))?;
                self.update_cats(id);
                Ok(id)
            }
        }
    }

    // ── On-demand loaders ───────────────────────────────────────────────────

    /// Read (or synthesize) an nnode and link it into its parent branch,
    /// or into the root slot when `parent` is `None`.
    fn read_nnode(&mut self, parent: Option<(NnodeId, usize)>) -> Result<NnodeId> {
        let (addr, level) = match parent {
            Some((pid, iip)) => {
                let p = &self.nnodes[pid.index()];
                let branch = p.branches[iip];
                (
                    NodeAddr {
                        lnum: branch.lnum,
                        offs: branch.offs,
                    },
                    p.level - 1,
                )
            }
            None => (self.layout.root, self.geom.lpt_hght),
        };

        match self.load_nnode(parent, addr, level) {
            Ok(id) => Ok(id),
            Err(err) => {
                error!(
                    lnum = addr.lnum.0,
                    offs = addr.offs,
                    level,
                    error = %err,
                    "lpt_nnode_read_failed"
                );
                Err(err)
            }
        }
    }

    fn load_nnode(
        &mut self,
        parent: Option<(NnodeId, usize)>,
        addr: NodeAddr,
        level: u32,
    ) -> Result<NnodeId> {
        let mut node = Nnode {
            num: 0,
            level,
            parent,
            flags: NodeFlags::default(),
            branches: [Branch::EMPTY; LPT_FANOUT],
        };

        if addr.lnum.0 == 0 {
            // Never written: all branches stay unwritten, the subtree
            // describes only-empty LEBs.
            if self.geom.big_lpt {
                node.num = self.nnode_num_from_parent(parent);
            }
        } else {
            let mut buf = vec![0u8; self.geom.nnode_sz as usize];
            self.dev.leb_read(addr.lnum, addr.offs, &mut buf)?;
            let raw = codec::unpack_nnode(&self.geom, self.layout.lpt_first, &buf)
                .map_err(|err| parse_error_at(err, addr))?;
            node.num = raw.num;
            for (branch, raw_branch) in node.branches.iter_mut().zip(raw.branches.iter()) {
                branch.lnum = raw_branch.lnum;
                branch.offs = raw_branch.offs;
            }
        }

        self.validate_nnode(&node, parent, addr)?;
        if !self.geom.big_lpt {
            node.num = self.nnode_num_from_parent(parent);
        }

        let id = NnodeId(self.nnodes.len() as u32);
        self.nnodes.push(node);
        match parent {
            Some((pid, iip)) => {
                self.nnodes[pid.index()].branches[iip].child = Some(Child::Nnode(id));
            }
            None => self.nroot = Some(id),
        }
        trace!(
            lnum = addr.lnum.0,
            offs = addr.offs,
            level,
            num = self.nnodes[id.index()].num,
            synthesized = addr.lnum.0 == 0,
            "lpt_nnode_read"
        );
        Ok(id)
    }

    /// Read (or synthesize) the pnode in `parent`'s branch `iip` and
    /// link it in.
    fn read_pnode(&mut self, parent: (NnodeId, usize)) -> Result<PnodeId> {
        let (pid, iip) = parent;
        let branch = self.nnodes[pid.index()].branches[iip];
        let addr = NodeAddr {
            lnum: branch.lnum,
            offs: branch.offs,
        };

        match self.load_pnode(parent, addr) {
            Ok(id) => Ok(id),
            Err(err) => {
                error!(
                    lnum = addr.lnum.0,
                    offs = addr.offs,
                    error = %err,
                    "lpt_pnode_read_failed"
                );
                Err(err)
            }
        }
    }

    fn load_pnode(&mut self, parent: (NnodeId, usize), addr: NodeAddr) -> Result<PnodeId> {
        let mut node = Pnode {
            num: 0,
            parent,
            flags: NodeFlags::default(),
            lprops: [LebProps::default(); LPT_FANOUT],
        };

        if addr.lnum.0 == 0 {
            // Never written: every covered LEB is empty.
            for props in &mut node.lprops {
                props.free = self.geom.leb_size;
                props.flags.cat = self.classifier.categorize(props);
            }
        } else {
            let mut buf = vec![0u8; self.geom.pnode_sz as usize];
            self.dev.leb_read(addr.lnum, addr.offs, &mut buf)?;
            let raw =
                codec::unpack_pnode(&self.geom, &buf).map_err(|err| parse_error_at(err, addr))?;
            node.num = raw.num;
            for (props, raw_props) in node.lprops.iter_mut().zip(raw.lprops.iter()) {
                props.free = raw_props.free;
                props.dirty = raw_props.dirty;
                props.flags.index = raw_props.index;
                props.flags.cat = self.classifier.categorize(props);
            }
        }

        self.validate_pnode(&node, parent, addr)?;
        if !self.geom.big_lpt {
            node.num = self.pnode_num_from_parent(parent);
        }

        let id = PnodeId(self.pnodes.len() as u32);
        self.pnodes.push(node);
        self.nnodes[parent.0.index()].branches[parent.1].child = Some(Child::Pnode(id));
        self.set_pnode_lnums(id);
        self.pnodes_loaded += 1;
        trace!(
            lnum = addr.lnum.0,
            offs = addr.offs,
            num = self.pnodes[id.index()].num,
            synthesized = addr.lnum.0 == 0,
            "lpt_pnode_read"
        );
        Ok(id)
    }

    /// Read the ltab node. Fatal on any failure: the ltab has no backup.
    fn read_ltab(&mut self) -> Result<()> {
        let addr = self.layout.ltab;
        let mut buf = vec![0u8; self.geom.ltab_sz as usize];
        self.dev.leb_read(addr.lnum, addr.offs, &mut buf)?;
        let entries =
            codec::unpack_ltab(&self.geom, &buf).map_err(|err| parse_error_at(err, addr))?;
        self.ltab = entries
            .into_iter()
            .map(|entry| LtabEntry {
                free: entry.free,
                dirty: entry.dirty,
                tgc: false,
                cmt: false,
            })
            .collect();
        trace!(lnum = addr.lnum.0, offs = addr.offs, "lpt_ltab_read");
        Ok(())
    }

    // ── Structural validation ───────────────────────────────────────────────

    /// Second line of defense after the CRC: a CRC-valid nnode can still
    /// be the wrong node or carry impossible branch addresses.
    fn validate_nnode(
        &self,
        node: &Nnode,
        parent: Option<(NnodeId, usize)>,
        addr: NodeAddr,
    ) -> Result<()> {
        if self.geom.big_lpt {
            let expected = self.nnode_num_from_parent(parent);
            if node.num != expected {
                error!(
                    invariant = "nnode.num",
                    expected,
                    got = node.num,
                    "lpt_invariant_violation"
                );
                return Err(out_of_range(
                    addr,
                    format!("nnode number {} does not match position {expected}", node.num),
                ));
            }
        }
        if node.level < 1 {
            return Err(out_of_range(addr, "nnode below level 1".to_owned()));
        }
        let child_sz = if node.level == 1 {
            self.geom.pnode_sz
        } else {
            self.geom.nnode_sz
        };
        let max_offs = self.geom.leb_size - child_sz;
        for branch in &node.branches {
            if branch.lnum.0 == 0 {
                if branch.offs != 0 {
                    return Err(out_of_range(
                        addr,
                        "unwritten branch with a non-zero offset".to_owned(),
                    ));
                }
                continue;
            }
            if !self.layout.contains_lpt(branch.lnum) {
                return Err(out_of_range(
                    addr,
                    format!(
                        "branch LEB {} outside the LPT area {}..={}",
                        branch.lnum,
                        self.layout.lpt_first,
                        self.layout.lpt_last()
                    ),
                ));
            }
            if branch.offs > max_offs {
                return Err(out_of_range(
                    addr,
                    format!("branch offset {} beyond {max_offs}", branch.offs),
                ));
            }
        }
        Ok(())
    }

    /// Structural checks for a pnode: node number (big model) and the
    /// space invariants of every record.
    fn validate_pnode(
        &self,
        node: &Pnode,
        parent: (NnodeId, usize),
        addr: NodeAddr,
    ) -> Result<()> {
        if self.geom.big_lpt {
            let expected = self.pnode_num_from_parent(parent);
            if node.num != expected {
                error!(
                    invariant = "pnode.num",
                    expected,
                    got = node.num,
                    "lpt_invariant_violation"
                );
                return Err(out_of_range(
                    addr,
                    format!("pnode number {} does not match position {expected}", node.num),
                ));
            }
        }
        for props in &node.lprops {
            if props.free > self.geom.leb_size
                || props.free % self.geom.min_io_size != 0
                || props.free & 7 != 0
            {
                return Err(out_of_range(
                    addr,
                    format!("free space {} invalid for this volume", props.free),
                ));
            }
            if props.dirty > self.geom.leb_size || props.dirty & 7 != 0 {
                return Err(out_of_range(
                    addr,
                    format!("dirty space {} invalid for this volume", props.dirty),
                ));
            }
            if props.free + props.dirty > self.geom.leb_size {
                return Err(out_of_range(
                    addr,
                    format!(
                        "free {} + dirty {} exceed the LEB size",
                        props.free, props.dirty
                    ),
                ));
            }
        }
        Ok(())
    }

    // ── Position-derived node numbers ───────────────────────────────────────

    /// Node number an nnode at this position must have. The root is 1;
    /// a child shifts the parent's marker bit up one fanout slice and
    /// records its branch slot.
    fn nnode_num_from_parent(&self, parent: Option<(NnodeId, usize)>) -> u32 {
        match parent {
            None => 1,
            Some((pid, iip)) => {
                let p = &self.nnodes[pid.index()];
                let shft = (self.geom.lpt_hght - p.level) * LPT_FANOUT_SHIFT;
                (p.num ^ (1 << shft)) | ((LPT_FANOUT as u32 + iip as u32) << shft)
            }
        }
    }

    /// Pnode index derived from the parent's number: peel the parent's
    /// fanout slices off in reverse and append the branch slot. Equals
    /// the pnode's position among all leaves.
    fn pnode_num_from_parent(&self, parent: (NnodeId, usize)) -> u32 {
        let (pid, iip) = parent;
        let mut pnum = self.nnodes[pid.index()].num;
        let mut num = 0;
        for _ in 0..self.geom.lpt_hght.saturating_sub(1) {
            num <<= LPT_FANOUT_SHIFT;
            num |= pnum & (LPT_FANOUT as u32 - 1);
            pnum >>= LPT_FANOUT_SHIFT;
        }
        (num << LPT_FANOUT_SHIFT) | iip as u32
    }

    /// Assign the consecutive LEB numbers a pnode covers, stopping at
    /// the end of the volume; trailing slots keep `Lnum(0)`.
    fn set_pnode_lnums(&mut self, id: PnodeId) {
        let first = (self.pnodes[id.index()].num << LPT_FANOUT_SHIFT) + self.layout.main_first.0;
        for i in 0..LPT_FANOUT {
            let lnum = first + i as u32;
            if lnum >= self.layout.leb_cnt {
                return;
            }
            self.pnodes[id.index()].lprops[i].lnum = Lnum(lnum);
        }
    }

    // ── Copy-on-write dirtying ──────────────────────────────────────────────

    /// Dirty an nnode in place, or clone it if a commit holds it.
    ///
    /// Dirt is accounted only on the clean-to-dirty edge, so repeated
    /// dirtying never double-counts. Returns the id the caller must
    /// continue the descent through — the clone's when one was made.
    fn dirty_cow_nnode(&mut self, id: NnodeId) -> NnodeId {
        if !self.nnodes[id.index()].flags.cow {
            if !self.nnodes[id.index()].flags.dirty {
                self.nnodes[id.index()].flags.dirty = true;
                self.dirty_nn_cnt += 1;
                self.add_nnode_dirt(id);
            }
            return id;
        }

        // The commit is writing this exact node out: clone it, re-point
        // the children's parent links, splice the clone in, abandon the
        // original to the commit.
        debug_assert!(!self.nnodes[id.index()].flags.obsolete);
        let mut clone = self.nnodes[id.index()].clone();
        clone.flags.dirty = true;
        clone.flags.cow = false;
        let parent = clone.parent;
        let new_id = NnodeId(self.nnodes.len() as u32);
        self.nnodes.push(clone);

        for iip in 0..LPT_FANOUT {
            let child = self.nnodes[new_id.index()].branches[iip].child;
            match child {
                Some(Child::Nnode(child)) => {
                    self.nnodes[child.index()].parent = Some((new_id, iip));
                }
                Some(Child::Pnode(child)) => {
                    self.pnodes[child.index()].parent = (new_id, iip);
                }
                None => {}
            }
        }

        self.nnodes[id.index()].flags.obsolete = true;
        self.dirty_nn_cnt += 1;
        self.add_nnode_dirt(new_id);
        match parent {
            Some((pid, iip)) => {
                self.nnodes[pid.index()].branches[iip].child = Some(Child::Nnode(new_id));
            }
            None => self.nroot = Some(new_id),
        }
        debug!(old = id.0, new = new_id.0, "lpt_cow_nnode");
        new_id
    }

    /// Dirty a pnode in place, or clone it if a commit holds it. The
    /// category entries of the covered LEBs move to the clone —
    /// replaced, never duplicated.
    fn dirty_cow_pnode(&mut self, id: PnodeId) -> PnodeId {
        if !self.pnodes[id.index()].flags.cow {
            if !self.pnodes[id.index()].flags.dirty {
                self.pnodes[id.index()].flags.dirty = true;
                self.dirty_pn_cnt += 1;
                self.add_pnode_dirt(id);
            }
            return id;
        }

        debug_assert!(!self.pnodes[id.index()].flags.obsolete);
        let mut clone = self.pnodes[id.index()].clone();
        clone.flags.dirty = true;
        clone.flags.cow = false;
        let parent = clone.parent;
        let new_id = PnodeId(self.pnodes.len() as u32);
        self.pnodes.push(clone);

        self.replace_cats(new_id);

        self.pnodes[id.index()].flags.obsolete = true;
        self.dirty_pn_cnt += 1;
        self.add_pnode_dirt(new_id);
        self.nnodes[parent.0.index()].branches[parent.1].child = Some(Child::Pnode(new_id));
        debug!(old = id.0, new = new_id.0, "lpt_cow_pnode");
        new_id
    }

    // ── Category bookkeeping ────────────────────────────────────────────────

    /// Register a freshly loaded pnode's records. LEB numbers within a
    /// pnode are consecutive, so the first unset slot ends the pnode.
    fn update_cats(&mut self, id: PnodeId) {
        for slot in 0..LPT_FANOUT {
            let props = self.pnodes[id.index()].lprops[slot];
            if props.lnum.0 == 0 {
                return;
            }
            let entry = CatRef {
                lnum: props.lnum,
                pnode: id,
                slot,
                free: props.free,
                dirty: props.dirty,
            };
            let (actual, evicted) = self.cats.add(props.flags.cat, entry);
            if actual != props.flags.cat {
                self.pnodes[id.index()].lprops[slot].flags.cat = actual;
            }
            if let Some(victim) = evicted {
                self.pnodes[victim.pnode.index()].lprops[victim.slot].flags.cat =
                    LpropsCategory::Uncat;
            }
        }
    }

    /// Re-point category entries at a pnode's copy-on-write clone.
    fn replace_cats(&mut self, new_id: PnodeId) {
        for slot in 0..LPT_FANOUT {
            let props = self.pnodes[new_id.index()].lprops[slot];
            if props.lnum.0 == 0 {
                return;
            }
            self.cats.replace(props.flags.cat, props.lnum, new_id);
        }
    }

    // ── Dirty-space accounting ──────────────────────────────────────────────

    /// Add dirt to the ltab entry of an LPT-area LEB. A no-op for
    /// `dirty == 0` or the unwritten marker (nothing on flash to
    /// obsolete).
    pub fn add_lpt_dirt(&mut self, lnum: Lnum, dirty: u32) {
        if dirty == 0 || lnum.0 == 0 {
            return;
        }
        if !self.layout.contains_lpt(lnum) {
            error!(
                invariant = "lnum within the LPT area",
                lnum = lnum.0,
                dirty,
                "lpt_invariant_violation"
            );
            return;
        }
        let idx = (lnum.0 - self.layout.lpt_first.0) as usize;
        trace!(lnum = lnum.0, dirty, total = self.ltab[idx].dirty + dirty, "lpt_dirt_add");
        self.ltab[idx].dirty += dirty;
    }

    /// Account a dirtied pnode: its packed size is now dead space in
    /// the LEB holding its last written copy.
    fn add_pnode_dirt(&mut self, id: PnodeId) {
        let (pid, iip) = self.pnodes[id.index()].parent;
        let lnum = self.nnodes[pid.index()].branches[iip].lnum;
        self.add_lpt_dirt(lnum, self.geom.pnode_sz);
    }

    /// Account a dirtied nnode. Dirtying the root also dirties the ltab
    /// itself once per commit cycle: the ltab's on-flash copy carries
    /// the root-pointer bookkeeping.
    pub fn add_nnode_dirt(&mut self, id: NnodeId) {
        let parent = self.nnodes[id.index()].parent;
        match parent {
            Some((pid, iip)) => {
                let lnum = self.nnodes[pid.index()].branches[iip].lnum;
                self.add_lpt_dirt(lnum, self.geom.nnode_sz);
            }
            None => {
                self.add_lpt_dirt(self.layout.root.lnum, self.geom.nnode_sz);
                if !self.ltab_dirty {
                    self.ltab_dirty = true;
                    self.add_lpt_dirt(self.layout.ltab.lnum, self.geom.ltab_sz);
                }
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Attach a flash address to a parse-layer error.
fn parse_error_at(err: ParseError, addr: NodeAddr) -> LptError {
    match err {
        ParseError::CrcMismatch { stored, computed } => LptError::CrcMismatch {
            lnum: addr.lnum.0,
            offs: addr.offs,
            stored,
            computed,
        },
        ParseError::BadNodeType { expected, found } => LptError::BadNodeType {
            lnum: addr.lnum.0,
            offs: addr.offs,
            expected,
            found,
        },
        ParseError::InsufficientData { needed, actual } => LptError::Corruption {
            lnum: addr.lnum.0,
            offs: addr.offs,
            detail: format!("node body truncated: need {needed} bytes, got {actual}"),
        },
        ParseError::InvalidField { field, reason } => LptError::Corruption {
            lnum: addr.lnum.0,
            offs: addr.offs,
            detail: format!("{field}: {reason}"),
        },
    }
}

fn out_of_range(addr: NodeAddr, detail: String) -> LptError {
    LptError::OutOfRange {
        lnum: addr.lnum.0,
        offs: addr.offs,
        detail,
    }
}

/// Mount-time cross-checks between geometry, layout and device.
fn check_layout(geom: &LptGeometry, layout: &LptLayout, dev: &dyn LebDevice) -> Result<()> {
    if layout.leb_cnt != geom.leb_cnt {
        return Err(LptError::InvalidGeometry(format!(
            "layout LEB count {} disagrees with geometry {}",
            layout.leb_cnt, geom.leb_cnt
        )));
    }
    if layout.leb_cnt > dev.leb_cnt() {
        return Err(LptError::InvalidGeometry(format!(
            "volume of {} LEBs on a device of {}",
            layout.leb_cnt,
            dev.leb_cnt()
        )));
    }
    if dev.leb_size() != geom.leb_size {
        return Err(LptError::InvalidGeometry(format!(
            "device LEB size {} disagrees with geometry {}",
            dev.leb_size(),
            geom.leb_size
        )));
    }
    if layout.lpt_lebs != geom.lpt_lebs {
        return Err(LptError::InvalidGeometry(format!(
            "layout LPT area of {} LEBs disagrees with geometry {}",
            layout.lpt_lebs, geom.lpt_lebs
        )));
    }
    if layout.lpt_last().0 >= layout.main_first.0 {
        return Err(LptError::InvalidGeometry(
            "LPT area overlaps the main area".to_owned(),
        ));
    }
    if layout.main_first.0 + geom.main_lebs != layout.leb_cnt {
        return Err(LptError::InvalidGeometry(format!(
            "main area [{}, {}) does not hold {} LEBs",
            layout.main_first, layout.leb_cnt, geom.main_lebs
        )));
    }
    if layout.root.lnum.0 != 0 && !layout.contains_lpt(layout.root.lnum) {
        return Err(LptError::InvalidGeometry(format!(
            "root nnode at {} outside the LPT area",
            layout.root
        )));
    }
    if !layout.contains_lpt(layout.ltab.lnum) {
        return Err(LptError::InvalidGeometry(format!(
            "ltab at {} outside the LPT area",
            layout.ltab
        )));
    }
    Ok(())
}
