//! Free-space categorization of main-area LEBs.
//!
//! Garbage collection and space allocation elsewhere in the filesystem
//! pick LEBs by category, so every property record loaded into the tree
//! is registered here: `Dirty`, `DirtyIndex` and `Free` LEBs on bounded
//! max-heaps (best candidates on top), `Empty`, `Freeable` and
//! `FreeableIndex` on lists, everything else on the uncategorized list.
//!
//! The heaps have fixed capacity [`LPT_HEAP_SZ`]. A record arriving at a
//! full heap either replaces a strictly worse entry from the bottom half
//! (which then moves to the uncategorized list) or is itself left
//! uncategorized — accounting never silently loses a LEB.

use crate::PnodeId;
use lpt_types::{LebProps, Lnum, LpropsCategory};

/// Capacity of each category heap.
pub const LPT_HEAP_SZ: usize = 256;

/// Pure classification of a property record into a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    pub leb_size: u32,
    pub min_io_size: u32,
    /// Smallest amount of dirty space considered worth garbage
    /// collecting; LEBs with less stay uncategorized.
    pub dead_wm: u32,
}

impl Classifier {
    #[must_use]
    pub fn categorize(&self, props: &LebProps) -> LpropsCategory {
        if props.flags.taken {
            return LpropsCategory::Uncat;
        }
        if props.free == self.leb_size {
            return LpropsCategory::Empty;
        }
        if props.free + props.dirty == self.leb_size {
            if props.flags.index {
                return LpropsCategory::FreeableIndex;
            }
            return LpropsCategory::Freeable;
        }
        if props.flags.index {
            if props.free + props.dirty >= self.min_io_size {
                return LpropsCategory::DirtyIndex;
            }
        } else {
            if props.dirty >= self.dead_wm {
                return LpropsCategory::Dirty;
            }
            if props.free > 0 {
                return LpropsCategory::Free;
            }
        }
        LpropsCategory::Uncat
    }
}

/// Where a categorized record lives: the owning pnode's arena slot.
///
/// `free`/`dirty` are cached heap keys; they equal the record's values
/// at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatRef {
    pub lnum: Lnum,
    pub pnode: PnodeId,
    pub slot: usize,
    pub free: u32,
    pub dirty: u32,
}

fn heap_key(cat: LpropsCategory, entry: &CatRef) -> u32 {
    match cat {
        LpropsCategory::Free => entry.free,
        LpropsCategory::DirtyIndex => entry.free + entry.dirty,
        _ => entry.dirty,
    }
}

#[derive(Debug)]
enum HeapAdd {
    Added,
    /// Added by evicting a worse bottom-half entry, returned here.
    Evicted(CatRef),
    /// Heap full and the record did not beat the probed victim.
    Rejected,
}

#[derive(Debug)]
struct LpropsHeap {
    cat: LpropsCategory,
    arr: Vec<CatRef>,
}

impl LpropsHeap {
    fn new(cat: LpropsCategory) -> Self {
        Self {
            cat,
            arr: Vec::with_capacity(LPT_HEAP_SZ),
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if heap_key(self.cat, &self.arr[pos]) <= heap_key(self.cat, &self.arr[parent]) {
                break;
            }
            self.arr.swap(pos, parent);
            pos = parent;
        }
    }

    fn add(&mut self, entry: CatRef) -> HeapAdd {
        if self.arr.len() >= LPT_HEAP_SZ {
            // Probe a pseudo-random slot in the bottom half of the heap
            // and keep whichever record is the better GC candidate.
            let b = LPT_HEAP_SZ / 2 - 1;
            let cpos = ((entry.lnum.0 as usize >> 1) & b) + b;
            if heap_key(self.cat, &entry) > heap_key(self.cat, &self.arr[cpos]) {
                let victim = self.arr[cpos];
                self.arr[cpos] = entry;
                self.sift_up(cpos);
                return HeapAdd::Evicted(victim);
            }
            return HeapAdd::Rejected;
        }
        self.arr.push(entry);
        self.sift_up(self.arr.len() - 1);
        HeapAdd::Added
    }

    fn replace(&mut self, lnum: Lnum, new_pnode: PnodeId) {
        if let Some(entry) = self.arr.iter_mut().find(|e| e.lnum == lnum) {
            entry.pnode = new_pnode;
        }
    }

    fn len(&self) -> usize {
        self.arr.len()
    }
}

/// All category containers.
#[derive(Debug)]
pub(crate) struct Cats {
    free: LpropsHeap,
    dirty: LpropsHeap,
    dirty_idx: LpropsHeap,
    uncat: Vec<CatRef>,
    empty: Vec<CatRef>,
    freeable: Vec<CatRef>,
    frdi_idx: Vec<CatRef>,
    pub freeable_cnt: u32,
    pub in_cat_cnt: u32,
}

impl Cats {
    pub fn new() -> Self {
        Self {
            free: LpropsHeap::new(LpropsCategory::Free),
            dirty: LpropsHeap::new(LpropsCategory::Dirty),
            dirty_idx: LpropsHeap::new(LpropsCategory::DirtyIndex),
            uncat: Vec::new(),
            empty: Vec::new(),
            freeable: Vec::new(),
            frdi_idx: Vec::new(),
            freeable_cnt: 0,
            in_cat_cnt: 0,
        }
    }

    /// Register a record under `cat`. Returns the category actually
    /// recorded (a full heap demotes to `Uncat`) and, when the add
    /// evicted an older heap entry, that entry — the caller must
    /// re-flag its record as uncategorized.
    pub fn add(&mut self, cat: LpropsCategory, entry: CatRef) -> (LpropsCategory, Option<CatRef>) {
        self.in_cat_cnt += 1;
        let heap = match cat {
            LpropsCategory::Free => &mut self.free,
            LpropsCategory::Dirty => &mut self.dirty,
            LpropsCategory::DirtyIndex => &mut self.dirty_idx,
            LpropsCategory::Uncat => {
                self.uncat.push(entry);
                return (LpropsCategory::Uncat, None);
            }
            LpropsCategory::Empty => {
                self.empty.push(entry);
                return (cat, None);
            }
            LpropsCategory::Freeable => {
                self.freeable.push(entry);
                self.freeable_cnt += 1;
                return (cat, None);
            }
            LpropsCategory::FreeableIndex => {
                self.frdi_idx.push(entry);
                return (cat, None);
            }
        };
        match heap.add(entry) {
            HeapAdd::Added => (cat, None),
            HeapAdd::Evicted(victim) => {
                self.uncat.push(victim);
                (cat, Some(victim))
            }
            HeapAdd::Rejected => {
                self.uncat.push(entry);
                (LpropsCategory::Uncat, None)
            }
        }
    }

    /// Re-point the entry for `lnum` at a replacement pnode, keeping
    /// its category position. Used when a pnode is copied on write: the
    /// entry is replaced, never duplicated.
    pub fn replace(&mut self, cat: LpropsCategory, lnum: Lnum, new_pnode: PnodeId) {
        match cat {
            LpropsCategory::Free => self.free.replace(lnum, new_pnode),
            LpropsCategory::Dirty => self.dirty.replace(lnum, new_pnode),
            LpropsCategory::DirtyIndex => self.dirty_idx.replace(lnum, new_pnode),
            LpropsCategory::Uncat => replace_in_list(&mut self.uncat, lnum, new_pnode),
            LpropsCategory::Empty => replace_in_list(&mut self.empty, lnum, new_pnode),
            LpropsCategory::Freeable => replace_in_list(&mut self.freeable, lnum, new_pnode),
            LpropsCategory::FreeableIndex => replace_in_list(&mut self.frdi_idx, lnum, new_pnode),
        }
    }

    /// Number of records currently filed under `cat`.
    pub fn len(&self, cat: LpropsCategory) -> usize {
        match cat {
            LpropsCategory::Free => self.free.len(),
            LpropsCategory::Dirty => self.dirty.len(),
            LpropsCategory::DirtyIndex => self.dirty_idx.len(),
            LpropsCategory::Uncat => self.uncat.len(),
            LpropsCategory::Empty => self.empty.len(),
            LpropsCategory::Freeable => self.freeable.len(),
            LpropsCategory::FreeableIndex => self.frdi_idx.len(),
        }
    }

    /// The pnode currently holding the categorized record for `lnum`,
    /// if any.
    pub fn find(&self, cat: LpropsCategory, lnum: Lnum) -> Option<&CatRef> {
        let list: &[CatRef] = match cat {
            LpropsCategory::Free => &self.free.arr,
            LpropsCategory::Dirty => &self.dirty.arr,
            LpropsCategory::DirtyIndex => &self.dirty_idx.arr,
            LpropsCategory::Uncat => &self.uncat,
            LpropsCategory::Empty => &self.empty,
            LpropsCategory::Freeable => &self.freeable,
            LpropsCategory::FreeableIndex => &self.frdi_idx,
        };
        list.iter().find(|e| e.lnum == lnum)
    }
}

fn replace_in_list(list: &mut [CatRef], lnum: Lnum, new_pnode: PnodeId) {
    if let Some(entry) = list.iter_mut().find(|e| e.lnum == lnum) {
        entry.pnode = new_pnode;
    }
}
