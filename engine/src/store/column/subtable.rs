//! The subtable column: each slot is either null (an empty subtable,
//! materialized on first write) or the ref of a nested table's columns
//! array. The nested spec is shared from the parent table's spec, so a
//! subtable column contributes no schema of its own.
//!
//! Live subtable accessors are handed out through a registry keyed by
//! row, so that repeated `table_at` calls observe the same storage and
//! row surgery can detach accessors that lost their cell.

use std::cell::RefCell;
use std::rc::Weak;

use dashmap::DashMap;

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{self, ParentLink};
use crate::store::column::{tree_parent_link, IntColumn};
use crate::store::table::TableInner;

/// A column of nested-table refs.
pub struct SubtableColumn {
    values: IntColumn,
    /// Live accessors by row. Entries are weak: dropping every user
    /// handle releases the accessor, not the data.
    registry: DashMap<usize, Weak<RefCell<TableInner>>>,
}

impl SubtableColumn {
    pub fn new(alloc: SharedAlloc) -> Result<SubtableColumn> {
        Ok(SubtableColumn {
            values: IntColumn::new_has_refs(alloc)?,
            registry: DashMap::new(),
        })
    }

    pub fn attach(alloc: SharedAlloc, r: Ref) -> Result<SubtableColumn> {
        Ok(SubtableColumn {
            values: IntColumn::attach(alloc, r)?,
            registry: DashMap::new(),
        })
    }

    pub fn root_ref(&self) -> Ref {
        self.values.root_ref()
    }

    pub fn set_parent(&self, link: Option<ParentLink>) {
        self.values.set_parent(link);
    }

    pub fn adjust_parent_index(&self, diff: isize) {
        self.values.adjust_parent_index(diff);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The nested table's columns-array ref; null for an empty subtable.
    pub fn ref_at(&self, ndx: usize) -> Ref {
        self.values.get_as_ref(ndx)
    }

    /// A parent link through which the nested table accessor writes its
    /// columns-array ref back into this slot.
    pub(crate) fn slot_link(&self, ndx: usize) -> ParentLink {
        tree_parent_link(self.values.root(), ndx)
    }

    /// Insert an empty subtable slot.
    pub fn insert(&mut self, ndx: usize) -> Result<()> {
        self.values.insert(ndx, Ref::NULL.to_slot())?;
        self.shift_registry(ndx, 1);
        Ok(())
    }

    pub fn add(&mut self) -> Result<()> {
        self.insert(self.len())
    }

    /// Remove a row, destroying the nested table it holds.
    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        self.destroy_subtree(ndx);
        self.detach_at(ndx);
        self.values.erase(ndx)?;
        self.shift_registry(ndx + 1, -1);
        Ok(())
    }

    /// Destroy the nested table at `ndx` and reset the slot to the
    /// empty subtable.
    pub fn clear_at(&mut self, ndx: usize) -> Result<()> {
        self.destroy_subtree(ndx);
        self.detach_at(ndx);
        self.values.set(ndx, Ref::NULL.to_slot())
    }

    /// Remove every row.
    pub fn clear(&mut self) -> Result<()> {
        // The refs-bearing clear destroys the subtrees.
        self.detach_all();
        self.values.clear()
    }

    pub fn destroy(&mut self) {
        self.detach_all();
        self.values.destroy();
    }

    fn destroy_subtree(&self, ndx: usize) {
        let r = self.ref_at(ndx);
        if !r.is_null() {
            let alloc = self.values.root().alloc_handle();
            array::destroy_subtree(&alloc, r);
        }
    }

    // ---- accessor registry ----

    /// The live accessor for row `ndx`, if any user reference keeps it
    /// alive.
    pub(crate) fn cached(&self, ndx: usize) -> Option<std::rc::Rc<RefCell<TableInner>>> {
        let entry = self.registry.get(&ndx)?;
        entry.value().upgrade()
    }

    /// Register a freshly materialized accessor for row `ndx`.
    pub(crate) fn cache(&self, ndx: usize, inner: &std::rc::Rc<RefCell<TableInner>>) {
        self.registry.insert(ndx, std::rc::Rc::downgrade(inner));
    }

    /// Detach the accessor whose cell is going away.
    fn detach_at(&self, ndx: usize) {
        if let Some((_, weak)) = self.registry.remove(&ndx) {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().detached = true;
            }
        }
    }

    fn detach_all(&self) {
        for entry in self.registry.iter() {
            if let Some(inner) = entry.value().upgrade() {
                inner.borrow_mut().detached = true;
            }
        }
        self.registry.clear();
    }

    /// Rekey live accessors after row surgery at `from`: keys and
    /// parent-link indices shift by `diff`.
    fn shift_registry(&self, from: usize, diff: isize) {
        let keys: Vec<usize> = self
            .registry
            .iter()
            .map(|e| *e.key())
            .filter(|&k| k >= from)
            .collect();
        // Rekey in an order that never overwrites a surviving entry.
        let mut keys = keys;
        if diff > 0 {
            keys.sort_unstable_by(|a, b| b.cmp(a));
        } else {
            keys.sort_unstable();
        }
        for k in keys {
            if let Some((_, weak)) = self.registry.remove(&k) {
                let new_key = (k as isize + diff) as usize;
                if let Some(inner) = weak.upgrade() {
                    inner.borrow_mut().shift_columns_parent(diff);
                    self.registry.insert(new_key, std::rc::Rc::downgrade(&inner));
                } else {
                    // Dead entry; drop it.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use crate::store::array::{Array, ArrayKind};
    use std::rc::Rc;

    fn new_column() -> SubtableColumn {
        SubtableColumn::new(Rc::new(SlabAlloc::new(8))).unwrap()
    }

    #[test]
    fn slots_start_as_empty_subtables() {
        let mut col = new_column();

        col.add().unwrap();
        col.add().unwrap();

        assert_eq!(col.len(), 2);
        assert!(col.ref_at(0).is_null());
        assert!(col.ref_at(1).is_null());
    }

    #[test]
    fn clear_at_resets_a_materialized_slot() {
        let mut col = new_column();
        col.add().unwrap();

        // Simulate materialization: hang a columns array off the slot.
        let alloc = col.values.root().alloc_handle();
        let mut columns = Array::new(alloc, ArrayKind::HasRefs).unwrap();
        let link = col.slot_link(0);
        link.update(columns.ref_()).unwrap();
        columns.set_parent(Some(link));
        assert!(!col.ref_at(0).is_null());

        col.clear_at(0).unwrap();

        assert!(col.ref_at(0).is_null());
    }

    #[test]
    fn erase_shifts_later_slots() {
        let mut col = new_column();
        for _ in 0..3 {
            col.add().unwrap();
        }

        col.erase(1).unwrap();

        assert_eq!(col.len(), 2);
    }
}
