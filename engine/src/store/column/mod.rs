//! Typed columns built on the node array.
//!
//! Every column is either a single leaf array or a tree whose inner
//! nodes are two-slot arrays `[offsets, child-refs]`, where `offsets[i]`
//! is the cumulative element count up to and including child `i`.
//! Lookups descend by binary-searching the offsets; inserts split leaves
//! that reach [`MAX_LEAF_SIZE`] and propagate splits upward; erases
//! remove drained leaves and collapse single-child roots.
//!
//! The concrete column types layer their value encodings on top:
//!
//! - [`IntColumn`] — integers (also backing bool and date columns and
//!   every refs/offsets structure).
//! - [`StringColumn`] — adaptive short/long strings.
//! - [`EnumStringColumn`] — `[keys, values]` enumerated strings.
//! - [`BinaryColumn`] — `[offsets, blob]` byte strings.
//! - [`SubtableColumn`] — refs to nested tables sharing the parent spec.
//! - [`MixedColumn`] — `[types, refs, data]` per-cell unions.

pub(crate) mod binary;
pub(crate) mod enumstring;
pub(crate) mod integer;
pub(crate) mod mixed;
pub(crate) mod string;
pub(crate) mod subtable;

pub use binary::BinaryColumn;
pub use enumstring::EnumStringColumn;
pub use integer::IntColumn;
pub use mixed::{MixedColumn, MixedValue};
pub use string::StringColumn;
pub use subtable::SubtableColumn;

use crate::error::Result;
use crate::store::alloc::Ref;
use crate::store::array::{Array, ArrayKind, ArrayParent, Cond, ParentLink, SharedArray};

/// A leaf splits once it reaches this many elements.
pub(crate) const MAX_LEAF_SIZE: usize = 1000;

/// An inner node splits once it reaches this many children.
pub(crate) const MAX_NODE_CHILDREN: usize = 1000;

/// An ordered set of row indices, produced by the `find_all` family.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RowSet {
    rows: Vec<usize>,
}

impl RowSet {
    pub fn new() -> RowSet {
        RowSet::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, ndx: usize) -> usize {
        self.rows[ndx]
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.iter().copied()
    }

    pub(crate) fn push(&mut self, row: usize) {
        self.rows.push(row);
    }
}

/// Swap a column's root array for a new one, carrying the parent link
/// over and writing the new ref into the containing slot. The shared
/// cell is updated in place so every live handle observes the new root.
pub(crate) fn replace_root(root: &SharedArray, mut new_root: Array) -> Result<()> {
    let link = root.with_mut(|a| a.take_parent());
    if let Some(link) = &link {
        link.update(new_root.ref_())?;
    }
    new_root.set_parent(link);
    root.with_mut(|a| *a = new_root);
    Ok(())
}

/// A parent seam that addresses a logical row of a column tree rather
/// than a physical slot of one array. Subtable roots hang off these.
pub(crate) struct TreeParent {
    root: SharedArray,
}

impl ArrayParent for TreeParent {
    fn update_child_ref(&self, child_index: usize, new_ref: Ref) -> Result<()> {
        tree::set(&self.root, child_index, new_ref.to_slot())
    }

    fn child_ref(&self, child_index: usize) -> Ref {
        Ref::from_slot(tree::get(&self.root, child_index))
    }
}

/// A parent link designating logical row `index` of the tree at `root`.
pub(crate) fn tree_parent_link(root: &SharedArray, index: usize) -> ParentLink {
    ParentLink::new(std::rc::Rc::new(TreeParent { root: root.clone() }), index)
}

/// Tree operations shared by every column type. A root is either a leaf
/// (fast path) or an inner node `[offsets, child-refs]`.
pub(crate) mod tree {
    use super::*;

    /// The outcome of an insert that overflowed an array: a new right
    /// sibling plus the element counts on both sides.
    struct Split {
        sibling: Ref,
        left_count: usize,
        right_count: usize,
    }

    /// Attach the `[offsets, refs]` children of an inner node, wired for
    /// write-back.
    fn node_parts(node: &SharedArray) -> Result<(SharedArray, SharedArray)> {
        debug_assert!(node.is_node());
        let alloc = node.alloc_handle();
        let offsets = SharedArray::attach(alloc.clone(), node.get_as_ref(0))?;
        offsets.set_parent(Some(node.parent_link(0)));
        let refs = SharedArray::attach(alloc, node.get_as_ref(1))?;
        refs.set_parent(Some(node.parent_link(1)));
        Ok((offsets, refs))
    }

    /// Attach child `k` of a node, wired for write-back.
    fn child_at(refs: &SharedArray, k: usize) -> Result<SharedArray> {
        let child = SharedArray::attach(refs.alloc_handle(), refs.get_as_ref(k))?;
        child.set_parent(Some(refs.parent_link(k)));
        Ok(child)
    }

    /// Position of the child containing element `ndx`: the smallest `k`
    /// with `offsets[k] > ndx`. Returns the child index and the element
    /// offset of its first element.
    fn find_child(offsets: &SharedArray, ndx: usize) -> (usize, usize) {
        let mut lo = 0;
        let mut hi = offsets.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if offsets.get(mid) > ndx as i64 {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let base = if lo == 0 { 0 } else { offsets.get(lo - 1) as usize };
        (lo, base)
    }

    /// Position of the child an insert at `ndx` should go to: the
    /// smallest `k` with `offsets[k] >= ndx` (appends land in the last
    /// child).
    fn find_child_for_insert(offsets: &SharedArray, ndx: usize) -> (usize, usize) {
        let mut lo = 0;
        let mut hi = offsets.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if offsets.get(mid) >= ndx as i64 {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let k = lo.min(offsets.len() - 1);
        let base = if k == 0 { 0 } else { offsets.get(k - 1) as usize };
        (k, base)
    }

    /// Total element count of the tree.
    pub fn len(root: &SharedArray) -> usize {
        if !root.is_node() {
            return root.len();
        }
        let offsets = SharedArray::attach(root.alloc_handle(), root.get_as_ref(0))
            .expect("node offsets unreadable");
        if offsets.is_empty() {
            0
        } else {
            offsets.back() as usize
        }
    }

    pub fn get(root: &SharedArray, ndx: usize) -> i64 {
        if !root.is_node() {
            return root.get(ndx);
        }
        let (offsets, refs) =
            node_parts(root).expect("node children unreadable");
        let (k, base) = find_child(&offsets, ndx);
        let child = child_at(&refs, k).expect("node child unreadable");
        get(&child, ndx - base)
    }

    pub fn set(root: &SharedArray, ndx: usize, value: i64) -> Result<()> {
        if !root.is_node() {
            return root.set(ndx, value);
        }
        let (offsets, refs) = node_parts(root)?;
        let (k, base) = find_child(&offsets, ndx);
        let child = child_at(&refs, k)?;
        set(&child, ndx - base, value)
    }

    pub fn insert(root: &SharedArray, ndx: usize, value: i64) -> Result<()> {
        if let Some(split) = insert_rec(root, ndx, value)? {
            // The root itself split: grow the tree by one level. The new
            // root is an inner node with the old root and its sibling as
            // children.
            let alloc = root.alloc_handle();
            let mut offsets = Array::new(alloc.clone(), ArrayKind::Leaf)?;
            offsets.add(split.left_count as i64)?;
            offsets.add((split.left_count + split.right_count) as i64)?;
            let mut refs = Array::new(alloc.clone(), ArrayKind::HasRefs)?;
            refs.add(root.ref_().to_slot())?;
            refs.add(split.sibling.to_slot())?;
            let mut node = Array::new(alloc, ArrayKind::Node)?;
            node.add(offsets.ref_().to_slot())?;
            node.add(refs.ref_().to_slot())?;
            replace_root(root, node)?;
        }
        Ok(())
    }

    fn insert_rec(arr: &SharedArray, ndx: usize, value: i64) -> Result<Option<Split>> {
        if !arr.is_node() {
            let len = arr.len();
            if len < MAX_LEAF_SIZE {
                arr.insert(ndx, value)?;
                return Ok(None);
            }
            // Split the full leaf in half and retry the insert on the
            // matching side.
            let half = len / 2;
            let kind = if arr.has_refs() {
                ArrayKind::HasRefs
            } else {
                ArrayKind::Leaf
            };
            let sibling = SharedArray::new(arr.alloc_handle(), kind)?;
            for i in half..len {
                sibling.add(arr.get(i))?;
            }
            arr.with_mut(|a| a.truncate_shallow(half))?;
            if ndx < half {
                arr.insert(ndx, value)?;
            } else {
                sibling.insert(ndx - half, value)?;
            }
            return Ok(Some(Split {
                sibling: sibling.ref_(),
                left_count: arr.len(),
                right_count: sibling.len(),
            }));
        }

        let (offsets, refs) = node_parts(arr)?;
        let (k, base) = find_child_for_insert(&offsets, ndx);
        let child = child_at(&refs, k)?;
        match insert_rec(&child, ndx - base, value)? {
            None => {
                offsets.adjust(k, 1)?;
                Ok(None)
            }
            Some(split) => {
                offsets.set(k, (base + split.left_count) as i64)?;
                offsets.insert(k + 1, (base + split.left_count + split.right_count) as i64)?;
                offsets.adjust(k + 2, 1)?;
                refs.insert(k + 1, split.sibling.to_slot())?;

                if refs.len() < MAX_NODE_CHILDREN {
                    return Ok(None);
                }
                // The node itself overflowed: split it in half.
                let n = refs.len();
                let half = n / 2;
                let carried = offsets.get(half - 1);
                let total = offsets.back();

                let alloc = arr.alloc_handle();
                let s_offsets = SharedArray::new(alloc.clone(), ArrayKind::Leaf)?;
                let s_refs = SharedArray::new(alloc.clone(), ArrayKind::HasRefs)?;
                for i in half..n {
                    s_offsets.add(offsets.get(i) - carried)?;
                    s_refs.add(refs.get(i))?;
                }
                offsets.truncate(half)?;
                refs.with_mut(|a| a.truncate_shallow(half))?;

                let sibling = SharedArray::new(alloc, ArrayKind::Node)?;
                sibling.add(s_offsets.ref_().to_slot())?;
                sibling.add(s_refs.ref_().to_slot())?;
                Ok(Some(Split {
                    sibling: sibling.ref_(),
                    left_count: carried as usize,
                    right_count: (total - carried) as usize,
                }))
            }
        }
    }

    pub fn erase(root: &SharedArray, ndx: usize) -> Result<()> {
        if !root.is_node() {
            return root.erase(ndx);
        }
        erase_rec(root, ndx)?;

        let alloc = root.alloc_handle();
        let (offsets, refs) = node_parts(root)?;
        drop(offsets);
        if refs.len() == 1 {
            // Collapse a single-child root back down one level.
            let child_ref = refs.get_as_ref(0);
            refs.with_mut(|a| a.truncate_shallow(0))?;
            drop(refs);
            // Any copy-on-write above has settled; this ref is current.
            let old_ref = root.ref_();
            let child = Array::attach(alloc.clone(), child_ref)?;
            replace_root(root, child)?;
            let mut shell = Array::attach(alloc, old_ref)?;
            shell.destroy();
        } else if refs.is_empty() {
            // The tree drained completely; shrink back to an empty leaf.
            let old_ref = root.ref_();
            drop(refs);
            let leaf = Array::new(alloc.clone(), ArrayKind::Leaf)?;
            replace_root(root, leaf)?;
            let mut shell = Array::attach(alloc, old_ref)?;
            shell.destroy();
        }
        Ok(())
    }

    fn erase_rec(arr: &SharedArray, ndx: usize) -> Result<()> {
        debug_assert!(arr.is_node());
        let (offsets, refs) = node_parts(arr)?;
        let (k, base) = find_child(&offsets, ndx);
        let child = child_at(&refs, k)?;

        if child.is_node() {
            erase_rec(&child, ndx - base)?;
            offsets.adjust(k, -1)?;
            // Collapse a single-child inner node into its child.
            let (_, c_refs) = node_parts(&child)?;
            if c_refs.len() == 1 {
                let grandchild = c_refs.get_as_ref(0);
                c_refs.with_mut(|a| a.truncate_shallow(0))?;
                child.destroy();
                refs.set(k, grandchild.to_slot())?;
            } else if c_refs.is_empty() {
                child.destroy();
                refs.erase(k)?;
                offsets.erase(k)?;
            }
        } else {
            child.erase(ndx - base)?;
            offsets.adjust(k, -1)?;
            if child.is_empty() {
                child.destroy();
                refs.erase(k)?;
                offsets.erase(k)?;
            }
        }
        Ok(())
    }

    /// Remove every element, shrinking the tree back to an empty leaf of
    /// the given kind. The root ref is preserved.
    pub fn clear(root: &SharedArray, leaf_kind: ArrayKind) -> Result<()> {
        root.clear()?;
        root.with_mut(|a| a.set_kind(leaf_kind))
    }

    pub fn find_first(
        root: &SharedArray,
        cond: Cond,
        value: i64,
        start: usize,
        end: usize,
    ) -> Option<usize> {
        if !root.is_node() {
            return root.find_first(cond, value, start, end);
        }
        let end = if end == usize::MAX { len(root) } else { end };
        let (offsets, refs) = node_parts(root).expect("node children unreadable");
        let mut base = 0usize;
        for k in 0..refs.len() {
            let next = offsets.get(k) as usize;
            if next > start && base < end {
                let child = child_at(&refs, k).expect("node child unreadable");
                let s = start.saturating_sub(base);
                let e = end.min(next) - base;
                if let Some(found) = find_first(&child, cond, value, s, e) {
                    return Some(base + found);
                }
            }
            base = next;
            if base >= end {
                break;
            }
        }
        None
    }

    pub fn find_all(root: &SharedArray, out: &mut RowSet, value: i64, base: usize) {
        if !root.is_node() {
            let matches: Vec<usize> = {
                let mut v = Vec::new();
                let mut start = 0;
                while let Some(found) = root.find_first(Cond::Eq, value, start, usize::MAX) {
                    v.push(found);
                    start = found + 1;
                }
                v
            };
            for m in matches {
                out.push(base + m);
            }
            return;
        }
        let (offsets, refs) = node_parts(root).expect("node children unreadable");
        let mut child_base = 0usize;
        for k in 0..refs.len() {
            let child = child_at(&refs, k).expect("node child unreadable");
            find_all(&child, out, value, base + child_base);
            child_base = offsets.get(k) as usize;
        }
    }

    pub fn sum(root: &SharedArray, start: usize, end: usize) -> i64 {
        fold(root, start, end, 0, |acc, arr, s, e| acc + arr.sum(s, e))
    }

    pub fn minimum(root: &SharedArray, start: usize, end: usize) -> Option<i64> {
        fold(root, start, end, None, |acc: Option<i64>, arr, s, e| {
            match (acc, arr.minimum(s, e)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        })
    }

    pub fn maximum(root: &SharedArray, start: usize, end: usize) -> Option<i64> {
        fold(root, start, end, None, |acc: Option<i64>, arr, s, e| {
            match (acc, arr.maximum(s, e)) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            }
        })
    }

    pub fn count(root: &SharedArray, value: i64) -> usize {
        if !root.is_node() {
            return root.count(value);
        }
        let (_, refs) = node_parts(root).expect("node children unreadable");
        let mut total = 0;
        for k in 0..refs.len() {
            let child = child_at(&refs, k).expect("node child unreadable");
            total += count(&child, value);
        }
        total
    }

    /// Fold `f` over the leaves intersecting `[start, end)`, passing
    /// leaf-local ranges.
    fn fold<A>(
        root: &SharedArray,
        start: usize,
        end: usize,
        init: A,
        f: impl Fn(A, &SharedArray, usize, usize) -> A + Copy,
    ) -> A {
        if !root.is_node() {
            let end = if end == usize::MAX { root.len() } else { end };
            return f(init, root, start, end);
        }
        let end = if end == usize::MAX { len(root) } else { end };
        let (offsets, refs) = node_parts(root).expect("node children unreadable");
        let mut acc = init;
        let mut base = 0usize;
        for k in 0..refs.len() {
            let next = offsets.get(k) as usize;
            if next > start && base < end {
                let child = child_at(&refs, k).expect("node child unreadable");
                let s = start.saturating_sub(base);
                let e = end.min(next) - base;
                acc = fold(&child, s, e, acc, f);
            }
            base = next;
            if base >= end {
                break;
            }
        }
        acc
    }

    pub fn adjust(root: &SharedArray, start: usize, diff: i64) -> Result<()> {
        if !root.is_node() {
            return root.adjust(start, diff);
        }
        let (offsets, refs) = node_parts(root)?;
        let mut base = 0usize;
        for k in 0..refs.len() {
            let next = offsets.get(k) as usize;
            if next > start {
                let child = child_at(&refs, k)?;
                adjust(&child, start.saturating_sub(base), diff)?;
            }
            base = next;
        }
        Ok(())
    }

    pub fn adjust_ge(root: &SharedArray, limit: i64, diff: i64) -> Result<()> {
        if !root.is_node() {
            return root.adjust_ge(limit, diff);
        }
        let (_, refs) = node_parts(root)?;
        for k in 0..refs.len() {
            let child = child_at(&refs, k)?;
            adjust_ge(&child, limit, diff)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use std::rc::Rc;

    fn new_root() -> SharedArray {
        let alloc = Rc::new(SlabAlloc::new(8));
        SharedArray::new(alloc, ArrayKind::Leaf).unwrap()
    }

    #[test]
    fn tree_grows_past_leaf_capacity() {
        let root = new_root();

        for i in 0..2500i64 {
            tree::insert(&root, i as usize, i).unwrap();
        }

        assert!(root.is_node());
        assert_eq!(tree::len(&root), 2500);
        for i in (0..2500).step_by(97) {
            assert_eq!(tree::get(&root, i), i as i64);
        }
    }

    #[test]
    fn tree_offsets_stay_monotone() {
        let root = new_root();
        for i in 0..3000i64 {
            tree::insert(&root, 0, i).unwrap(); // front inserts
        }

        // Walk the node structure and verify the offsets invariant.
        fn verify(root: &SharedArray) -> usize {
            if !root.is_node() {
                return root.len();
            }
            let offsets =
                SharedArray::attach(root.alloc_handle(), root.get_as_ref(0)).unwrap();
            let refs = SharedArray::attach(root.alloc_handle(), root.get_as_ref(1)).unwrap();
            let mut cumulative = 0i64;
            for k in 0..refs.len() {
                let child =
                    SharedArray::attach(root.alloc_handle(), refs.get_as_ref(k)).unwrap();
                cumulative += verify(&child) as i64;
                assert_eq!(offsets.get(k), cumulative, "offsets must be cumulative");
                if k > 0 {
                    assert!(offsets.get(k) > offsets.get(k - 1), "offsets must increase");
                }
            }
            cumulative as usize
        }
        assert_eq!(verify(&root), 3000);
        assert_eq!(tree::len(&root), 3000);
    }

    #[test]
    fn tree_erase_drains_back_to_leaf() {
        let root = new_root();
        for i in 0..1500i64 {
            tree::insert(&root, i as usize, i).unwrap();
        }
        assert!(root.is_node());

        for _ in 0..1500 {
            tree::erase(&root, 0).unwrap();
        }

        assert_eq!(tree::len(&root), 0);
        assert!(!root.is_node());
    }

    #[test]
    fn tree_set_and_aggregates_across_leaves() {
        let root = new_root();
        for i in 0..2000i64 {
            tree::insert(&root, i as usize, 1).unwrap();
        }

        tree::set(&root, 1500, 100).unwrap();

        assert_eq!(tree::get(&root, 1500), 100);
        assert_eq!(tree::sum(&root, 0, usize::MAX), 1999 + 100);
        assert_eq!(tree::maximum(&root, 0, usize::MAX), Some(100));
        assert_eq!(tree::minimum(&root, 0, usize::MAX), Some(1));
        assert_eq!(tree::count(&root, 100), 1);
        assert_eq!(
            tree::find_first(&root, Cond::Eq, 100, 0, usize::MAX),
            Some(1500)
        );
    }

    #[test]
    fn tree_find_all_collects_every_match() {
        let root = new_root();
        for i in 0..2200usize {
            tree::insert(&root, i, (i % 2) as i64).unwrap();
        }

        let mut out = RowSet::new();
        tree::find_all(&root, &mut out, 1, 0);

        assert_eq!(out.len(), 1100);
        assert_eq!(out.get(0), 1);
        assert!(out.iter().all(|r| r % 2 == 1));
    }

    #[test]
    fn tree_clear_preserves_root_identity() {
        let root = new_root();
        for i in 0..1200i64 {
            tree::insert(&root, i as usize, i).unwrap();
        }
        let r = root.ref_();

        tree::clear(&root, ArrayKind::Leaf).unwrap();

        assert_eq!(root.ref_(), r);
        assert!(!root.is_node());
        assert_eq!(tree::len(&root), 0);
    }
}
