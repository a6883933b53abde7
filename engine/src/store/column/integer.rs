//! The integer column, and the substrate for every refs-bearing column
//! structure. Leaf values are the integers themselves.

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{ArrayKind, Cond, ParentLink, SharedArray};
use crate::store::column::{tree, RowSet};
use crate::store::index::SearchIndex;

/// A column of 64-bit signed integers (bool and date columns share this
/// representation, as do the internal refs and offsets structures).
pub struct IntColumn {
    root: SharedArray,
    index: Option<SearchIndex>,
}

impl IntColumn {
    /// Create an empty column.
    pub fn new(alloc: SharedAlloc) -> Result<IntColumn> {
        IntColumn::new_with_kind(alloc, ArrayKind::Leaf)
    }

    /// Create an empty refs-bearing column (subtable and mixed storage).
    pub fn new_has_refs(alloc: SharedAlloc) -> Result<IntColumn> {
        IntColumn::new_with_kind(alloc, ArrayKind::HasRefs)
    }

    fn new_with_kind(alloc: SharedAlloc, kind: ArrayKind) -> Result<IntColumn> {
        Ok(IntColumn {
            root: SharedArray::new(alloc, kind)?,
            index: None,
        })
    }

    /// Attach to an existing column root.
    pub fn attach(alloc: SharedAlloc, r: Ref) -> Result<IntColumn> {
        Ok(IntColumn {
            root: SharedArray::attach(alloc, r)?,
            index: None,
        })
    }

    /// The ref of the column's root array.
    pub fn root_ref(&self) -> Ref {
        self.root.ref_()
    }

    pub(crate) fn root(&self) -> &SharedArray {
        &self.root
    }

    /// Bind the column root into its containing slot.
    pub fn set_parent(&self, link: Option<ParentLink>) {
        self.root.set_parent(link);
    }

    /// Shift the slot index the root occupies in its parent.
    pub fn adjust_parent_index(&self, diff: isize) {
        self.root.adjust_parent_index(diff);
    }

    pub fn len(&self) -> usize {
        tree::len(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ndx: usize) -> i64 {
        tree::get(&self.root, ndx)
    }

    /// Read a slot as a ref (refs-bearing columns only).
    pub fn get_as_ref(&self, ndx: usize) -> Ref {
        Ref::from_slot(self.get(ndx))
    }

    pub fn set(&mut self, ndx: usize, value: i64) -> Result<()> {
        self.invalidate_index();
        tree::set(&self.root, ndx, value)
    }

    pub fn insert(&mut self, ndx: usize, value: i64) -> Result<()> {
        self.invalidate_index();
        tree::insert(&self.root, ndx, value)
    }

    pub fn add(&mut self, value: i64) -> Result<()> {
        let len = self.len();
        self.insert(len, value)
    }

    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        self.invalidate_index();
        tree::erase(&self.root, ndx)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.invalidate_index();
        let kind = if self.root.has_refs() {
            ArrayKind::HasRefs
        } else {
            ArrayKind::Leaf
        };
        tree::clear(&self.root, kind)
    }

    /// First row equal to `value` within `[start, end)`. Uses the search
    /// index when one is attached and the range is the whole column.
    pub fn find_first(&self, value: i64, start: usize, end: usize) -> Option<usize> {
        if start == 0 && end == usize::MAX {
            if let Some(index) = &self.index {
                return index.find_first(value);
            }
        }
        tree::find_first(&self.root, Cond::Eq, value, start, end)
    }

    /// First row satisfying `cond` against `value`.
    pub fn find_first_cond(
        &self,
        cond: Cond,
        value: i64,
        start: usize,
        end: usize,
    ) -> Option<usize> {
        tree::find_first(&self.root, cond, value, start, end)
    }

    /// Collect every row equal to `value`.
    pub fn find_all(&self, out: &mut RowSet, value: i64) {
        tree::find_all(&self.root, out, value, 0);
    }

    pub fn sum(&self, start: usize, end: usize) -> i64 {
        tree::sum(&self.root, start, end)
    }

    pub fn minimum(&self, start: usize, end: usize) -> Option<i64> {
        tree::minimum(&self.root, start, end)
    }

    pub fn maximum(&self, start: usize, end: usize) -> Option<i64> {
        tree::maximum(&self.root, start, end)
    }

    pub fn count(&self, value: i64) -> usize {
        tree::count(&self.root, value)
    }

    /// Add `diff` to every value from row `start` on.
    pub fn adjust(&mut self, start: usize, diff: i64) -> Result<()> {
        self.invalidate_index();
        tree::adjust(&self.root, start, diff)
    }

    /// Add `delta` to every value greater than or equal to `limit`.
    pub fn increment_if(&mut self, limit: i64, delta: i64) -> Result<()> {
        self.invalidate_index();
        tree::adjust_ge(&self.root, limit, delta)
    }

    /// Build (or rebuild) the search index over the current contents.
    pub fn build_index(&mut self) -> &SearchIndex {
        let values: Vec<i64> = (0..self.len()).map(|i| self.get(i)).collect();
        self.index = Some(SearchIndex::build(&values));
        self.index.as_ref().expect("index just built")
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Drop the search index.
    pub fn remove_index(&mut self) {
        self.index = None;
    }

    fn invalidate_index(&mut self) {
        self.index = None;
    }

    /// Tear down the column's storage.
    pub fn destroy(&mut self) {
        self.root.destroy();
    }
}
