//! The enumerated string column: a `[keys, values]` pair where `keys`
//! is a dictionary of distinct strings and `values` holds indices into
//! it. Produced by `Table::optimize` from a plain string column whose
//! distinct ratio is low; readers keep seeing a plain string column.

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::ParentLink;
use crate::store::column::{IntColumn, RowSet, StringColumn};

/// An enum-compressed string column. Occupies two adjacent slots in the
/// containing columns array (keys, then values) but one spec column.
pub struct EnumStringColumn {
    keys: StringColumn,
    values: IntColumn,
}

impl EnumStringColumn {
    pub fn attach(alloc: SharedAlloc, keys_ref: Ref, values_ref: Ref) -> Result<EnumStringColumn> {
        Ok(EnumStringColumn {
            keys: StringColumn::attach(alloc.clone(), keys_ref)?,
            values: IntColumn::attach(alloc, values_ref)?,
        })
    }

    pub fn keys_ref(&self) -> Ref {
        self.keys.root_ref()
    }

    pub fn values_ref(&self) -> Ref {
        self.values.root_ref()
    }

    pub fn set_parent(&self, keys: Option<ParentLink>, values: Option<ParentLink>) {
        self.keys.set_parent(keys);
        self.values.set_parent(values);
    }

    pub fn adjust_parent_index(&self, diff: isize) {
        self.keys.adjust_parent_index(diff);
        self.values.adjust_parent_index(diff);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, ndx: usize) -> String {
        let key_ndx = self.values.get(ndx);
        self.keys.get(key_ndx as usize)
    }

    pub fn set(&mut self, ndx: usize, value: &str) -> Result<()> {
        let key_ndx = self.key_index_or_add(value)?;
        self.values.set(ndx, key_ndx as i64)
    }

    pub fn insert(&mut self, ndx: usize, value: &str) -> Result<()> {
        let key_ndx = self.key_index_or_add(value)?;
        self.values.insert(ndx, key_ndx as i64)
    }

    pub fn add(&mut self, value: &str) -> Result<()> {
        self.insert(self.len(), value)
    }

    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        self.values.erase(ndx)
    }

    /// Remove every row. The keys dictionary is kept; rebuilding it
    /// would require rewriting the column.
    pub fn clear(&mut self) -> Result<()> {
        self.values.clear()
    }

    pub fn find_first(&self, value: &str, start: usize, end: usize) -> Option<usize> {
        let key_ndx = self.keys.find_first(value, 0, usize::MAX)?;
        self.values.find_first_cond(
            crate::store::array::Cond::Eq,
            key_ndx as i64,
            start,
            if end == usize::MAX { self.len() } else { end },
        )
    }

    pub fn find_all(&self, out: &mut RowSet, value: &str) {
        if let Some(key_ndx) = self.keys.find_first(value, 0, usize::MAX) {
            self.values.find_all(out, key_ndx as i64);
        }
    }

    /// Number of distinct strings in the dictionary.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn key_index_or_add(&mut self, value: &str) -> Result<usize> {
        if let Some(ndx) = self.keys.find_first(value, 0, usize::MAX) {
            return Ok(ndx);
        }
        let ndx = self.keys.len();
        self.keys.add(value)?;
        Ok(ndx)
    }

    pub fn destroy(&mut self) {
        self.keys.destroy();
        self.values.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use std::rc::Rc;

    fn enumerated() -> EnumStringColumn {
        let alloc = Rc::new(SlabAlloc::new(8));
        let mut plain = StringColumn::new(alloc.clone()).unwrap();
        for s in ["red", "green", "red", "red", "green"] {
            plain.add(s).unwrap();
        }
        let (keys_ref, values_ref) = plain.auto_enumerate().unwrap().unwrap();
        EnumStringColumn::attach(alloc, keys_ref, values_ref).unwrap()
    }

    #[test]
    fn reads_translate_through_keys() {
        let col = enumerated();

        assert_eq!(col.len(), 5);
        assert_eq!(col.get(0), "red");
        assert_eq!(col.get(1), "green");
        assert_eq!(col.key_count(), 2);
    }

    #[test]
    fn writes_reuse_or_extend_the_dictionary() {
        let mut col = enumerated();

        col.set(0, "green").unwrap();
        assert_eq!(col.get(0), "green");
        assert_eq!(col.key_count(), 2); // reused

        col.add("blue").unwrap();
        assert_eq!(col.get(5), "blue");
        assert_eq!(col.key_count(), 3); // extended
    }

    #[test]
    fn find_goes_through_the_key_index() {
        let col = enumerated();

        assert_eq!(col.find_first("green", 0, usize::MAX), Some(1));
        assert_eq!(col.find_first("missing", 0, usize::MAX), None);

        let mut rows = RowSet::new();
        col.find_all(&mut rows, "red");
        assert_eq!(rows.iter().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn clear_keeps_keys() {
        let mut col = enumerated();

        col.clear().unwrap();

        assert!(col.is_empty());
        assert_eq!(col.key_count(), 2);
    }
}
