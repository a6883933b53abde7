//! The mixed column: a per-cell union of int, bool, date, string,
//! binary, or a nested table.
//!
//! Storage is three parallel columns under one refs-bearing root:
//!
//! ```text
//! types[i] = small-integer tag
//! refs[i]  = scalar        -> (value << 1) | 1
//!            string/binary -> (data_index << 1) | 1
//!            table         -> subtable root ref (untagged, owned)
//! data     = concatenated payload bytes, created lazily
//! ```
//!
//! The tag makes every bit pattern of `refs[i]` unambiguous. Changing a
//! cell away from string/binary leaves its payload bytes in place;
//! erasing the row blanks a non-terminal payload (other indices must
//! keep their positions) and truncates a terminal one.

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{self, ParentLink, SharedArray};
use crate::store::column::{tree_parent_link, BinaryColumn, IntColumn};

/// The per-cell type tag of a mixed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixedType {
    Int = 0,
    Bool = 1,
    Date = 2,
    String = 3,
    Binary = 4,
    Table = 5,
}

impl MixedType {
    fn from_tag(tag: i64) -> MixedType {
        match tag {
            0 => MixedType::Int,
            1 => MixedType::Bool,
            2 => MixedType::Date,
            3 => MixedType::String,
            4 => MixedType::Binary,
            5 => MixedType::Table,
            _ => unreachable!("invalid mixed type tag {}", tag),
        }
    }
}

/// An owned mixed cell value. `Table` stands for an empty nested table;
/// its contents are reached through the table accessor, not through
/// this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum MixedValue {
    Int(i64),
    Bool(bool),
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    Table,
}

impl MixedValue {
    pub fn type_of(&self) -> MixedType {
        match self {
            MixedValue::Int(_) => MixedType::Int,
            MixedValue::Bool(_) => MixedType::Bool,
            MixedValue::Date(_) => MixedType::Date,
            MixedValue::String(_) => MixedType::String,
            MixedValue::Binary(_) => MixedType::Binary,
            MixedValue::Table => MixedType::Table,
        }
    }
}

/// A column of mixed cells.
pub struct MixedColumn {
    root: SharedArray,
    types: IntColumn,
    refs: IntColumn,
    data: Option<BinaryColumn>,
}

impl MixedColumn {
    pub fn new(alloc: SharedAlloc) -> Result<MixedColumn> {
        let types = IntColumn::new(alloc.clone())?;
        let refs = IntColumn::new_has_refs(alloc.clone())?;
        let root = SharedArray::new(alloc, crate::store::array::ArrayKind::HasRefs)?;
        root.add(types.root_ref().to_slot())?;
        root.add(refs.root_ref().to_slot())?;
        types.set_parent(Some(root.parent_link(0)));
        refs.set_parent(Some(root.parent_link(1)));
        Ok(MixedColumn {
            root,
            types,
            refs,
            data: None,
        })
    }

    pub fn attach(alloc: SharedAlloc, r: Ref) -> Result<MixedColumn> {
        let root = SharedArray::attach(alloc.clone(), r)?;
        let types = IntColumn::attach(alloc.clone(), root.get_as_ref(0))?;
        let refs = IntColumn::attach(alloc.clone(), root.get_as_ref(1))?;
        types.set_parent(Some(root.parent_link(0)));
        refs.set_parent(Some(root.parent_link(1)));
        // The payload column exists only once a string or binary value
        // has been stored.
        let data = if root.len() == 3 {
            let data = BinaryColumn::attach(alloc, root.get_as_ref(2))?;
            data.set_parent(Some(root.parent_link(2)));
            Some(data)
        } else {
            None
        };
        Ok(MixedColumn {
            root,
            types,
            refs,
            data,
        })
    }

    pub fn root_ref(&self) -> Ref {
        self.root.ref_()
    }

    pub fn set_parent(&self, link: Option<ParentLink>) {
        self.root.set_parent(link);
    }

    pub fn adjust_parent_index(&self, diff: isize) {
        self.root.adjust_parent_index(diff);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn type_at(&self, ndx: usize) -> MixedType {
        MixedType::from_tag(self.types.get(ndx))
    }

    pub fn get(&self, ndx: usize) -> MixedValue {
        match self.type_at(ndx) {
            MixedType::Int => MixedValue::Int(self.get_int(ndx)),
            MixedType::Bool => MixedValue::Bool(self.get_bool(ndx)),
            MixedType::Date => MixedValue::Date(self.get_date(ndx)),
            MixedType::String => MixedValue::String(self.get_string(ndx)),
            MixedType::Binary => MixedValue::Binary(self.get_binary(ndx)),
            MixedType::Table => MixedValue::Table,
        }
    }

    pub fn get_int(&self, ndx: usize) -> i64 {
        assert_eq!(self.type_at(ndx), MixedType::Int, "cell is not an int");
        array::untag_value(self.refs.get(ndx))
    }

    pub fn get_bool(&self, ndx: usize) -> bool {
        assert_eq!(self.type_at(ndx), MixedType::Bool, "cell is not a bool");
        array::untag_value(self.refs.get(ndx)) == 1
    }

    pub fn get_date(&self, ndx: usize) -> i64 {
        assert_eq!(self.type_at(ndx), MixedType::Date, "cell is not a date");
        array::untag_value(self.refs.get(ndx))
    }

    pub fn get_string(&self, ndx: usize) -> String {
        assert_eq!(self.type_at(ndx), MixedType::String, "cell is not a string");
        let data_ndx = array::untag_value(self.refs.get(ndx)) as usize;
        let data = self.data.as_ref().expect("string cell without data column");
        String::from_utf8_lossy(&data.get(data_ndx)).into_owned()
    }

    pub fn get_binary(&self, ndx: usize) -> Vec<u8> {
        assert_eq!(self.type_at(ndx), MixedType::Binary, "cell is not binary");
        let data_ndx = array::untag_value(self.refs.get(ndx)) as usize;
        let data = self.data.as_ref().expect("binary cell without data column");
        data.get(data_ndx)
    }

    /// The nested table's root ref (null for a not-yet-materialized
    /// empty table).
    pub fn subtable_ref(&self, ndx: usize) -> Ref {
        assert_eq!(self.type_at(ndx), MixedType::Table, "cell is not a table");
        Ref::from_slot(self.refs.get(ndx))
    }

    /// A parent link through which a nested table accessor writes its
    /// root ref back into this cell.
    pub(crate) fn subtable_slot_link(&self, ndx: usize) -> ParentLink {
        tree_parent_link(self.refs.root(), ndx)
    }

    pub fn insert(&mut self, ndx: usize, value: &MixedValue) -> Result<()> {
        match value {
            MixedValue::Int(v) => self.insert_scalar(ndx, MixedType::Int, *v),
            MixedValue::Bool(v) => self.insert_scalar(ndx, MixedType::Bool, i64::from(*v)),
            MixedValue::Date(v) => self.insert_scalar(ndx, MixedType::Date, *v),
            MixedValue::String(s) => self.insert_payload(ndx, MixedType::String, s.as_bytes()),
            MixedValue::Binary(b) => self.insert_payload(ndx, MixedType::Binary, b),
            MixedValue::Table => {
                self.types.insert(ndx, MixedType::Table as i64)?;
                self.refs.insert(ndx, Ref::NULL.to_slot())
            }
        }
    }

    pub fn add(&mut self, value: &MixedValue) -> Result<()> {
        self.insert(self.len(), value)
    }

    pub fn set(&mut self, ndx: usize, value: &MixedValue) -> Result<()> {
        match value {
            MixedValue::Int(v) => self.set_scalar(ndx, MixedType::Int, *v),
            MixedValue::Bool(v) => self.set_scalar(ndx, MixedType::Bool, i64::from(*v)),
            MixedValue::Date(v) => self.set_scalar(ndx, MixedType::Date, *v),
            MixedValue::String(s) => self.set_payload(ndx, MixedType::String, s.as_bytes()),
            MixedValue::Binary(b) => self.set_payload(ndx, MixedType::Binary, b),
            MixedValue::Table => {
                self.clear_value(ndx, MixedType::Table, true)?;
                self.refs.set(ndx, Ref::NULL.to_slot())
            }
        }
    }

    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        self.clear_value(ndx, MixedType::Int, true)?;
        self.types.erase(ndx)?;
        self.refs.erase(ndx)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.types.clear()?;
        // Clearing the refs column reclaims the nested tables: their
        // roots are the untagged slots.
        self.refs.clear()?;
        if let Some(data) = &mut self.data {
            data.clear()?;
        }
        Ok(())
    }

    /// First cell equal to `value`. Table cells compare by identity and
    /// never match.
    pub fn find_first(&self, value: &MixedValue, start: usize, end: usize) -> Option<usize> {
        let end = if end == usize::MAX { self.len() } else { end };
        if value.type_of() == MixedType::Table {
            return None;
        }
        (start..end).find(|&i| self.type_at(i) == value.type_of() && self.get(i) == *value)
    }

    pub fn destroy(&mut self) {
        self.root.destroy();
    }

    fn insert_scalar(&mut self, ndx: usize, ty: MixedType, value: i64) -> Result<()> {
        self.types.insert(ndx, ty as i64)?;
        self.refs.insert(ndx, array::tag_value(value))
    }

    fn set_scalar(&mut self, ndx: usize, ty: MixedType, value: i64) -> Result<()> {
        self.clear_value(ndx, ty, false)?;
        self.refs.set(ndx, array::tag_value(value))
    }

    fn insert_payload(&mut self, ndx: usize, ty: MixedType, bytes: &[u8]) -> Result<()> {
        self.init_data_column()?;
        let data = self.data.as_mut().expect("data column just initialized");
        let data_ndx = data.len();
        data.add(bytes)?;
        self.types.insert(ndx, ty as i64)?;
        self.refs.insert(ndx, array::tag_value(data_ndx as i64))
    }

    fn set_payload(&mut self, ndx: usize, ty: MixedType, bytes: &[u8]) -> Result<()> {
        self.init_data_column()?;
        let old_type = self.type_at(ndx);
        // Reuse the existing payload slot on a string<->binary rewrite.
        if old_type == MixedType::String || old_type == MixedType::Binary {
            let data_ndx = array::untag_value(self.refs.get(ndx)) as usize;
            let data = self.data.as_mut().expect("payload cell without data column");
            data.set(data_ndx, bytes)?;
            if old_type != ty {
                self.types.set(ndx, ty as i64)?;
            }
            return Ok(());
        }
        self.clear_value(ndx, ty, false)?;
        let data = self.data.as_mut().expect("data column just initialized");
        let data_ndx = data.len();
        data.add(bytes)?;
        self.refs.set(ndx, array::tag_value(data_ndx as i64))
    }

    fn init_data_column(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Ok(());
        }
        debug_assert_eq!(self.root.len(), 2);
        let data = BinaryColumn::new(self.root.alloc_handle())?;
        self.root.add(data.root_ref().to_slot())?;
        data.set_parent(Some(self.root.parent_link(2)));
        self.data = Some(data);
        Ok(())
    }

    /// Release whatever the cell holds before it changes type.
    ///
    /// `reclaim` distinguishes row removal (blank or truncate the
    /// payload slot) from a type change (the payload bytes stay behind;
    /// live indices elsewhere must not shift).
    fn clear_value(&mut self, ndx: usize, new_type: MixedType, reclaim: bool) -> Result<()> {
        let old_type = self.type_at(ndx);
        match old_type {
            MixedType::Int | MixedType::Bool | MixedType::Date => {}
            MixedType::String | MixedType::Binary => {
                if reclaim {
                    let data_ndx = array::untag_value(self.refs.get(ndx)) as usize;
                    let data = self.data.as_mut().expect("payload cell without data column");
                    if data_ndx + 1 == data.len() {
                        data.erase(data_ndx)?;
                    } else {
                        data.set(data_ndx, &[])?;
                    }
                }
            }
            MixedType::Table => {
                let r = Ref::from_slot(self.refs.get(ndx));
                if !r.is_null() {
                    let alloc = self.root.alloc_handle();
                    array::destroy_subtree(&alloc, r);
                }
            }
        }
        if old_type != new_type {
            self.types.set(ndx, new_type as i64)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use std::rc::Rc;

    fn new_column() -> MixedColumn {
        MixedColumn::new(Rc::new(SlabAlloc::new(8))).unwrap()
    }

    #[test]
    fn scalar_cells_are_tagged_inline() {
        let mut col = new_column();

        col.add(&MixedValue::Int(42)).unwrap();
        col.add(&MixedValue::Bool(true)).unwrap();
        col.add(&MixedValue::Date(1_600_000_000)).unwrap();

        assert_eq!(col.get_int(0), 42);
        assert!(col.get_bool(1));
        assert_eq!(col.get_date(2), 1_600_000_000);

        // The low bit marks the slot as an inline value, not a ref.
        for i in 0..3 {
            assert_eq!(col.refs.get(i) & 1, 1);
        }
    }

    #[test]
    fn payload_cells_index_into_data() {
        let mut col = new_column();

        col.add(&MixedValue::String("hello".into())).unwrap();
        col.add(&MixedValue::Binary(vec![1, 2, 3])).unwrap();

        assert_eq!(col.type_at(0), MixedType::String);
        assert_eq!(col.get_string(0), "hello");
        assert_eq!(col.get_binary(1), vec![1, 2, 3]);

        // Unshifted slot values are valid data indices.
        assert_eq!(array::untag_value(col.refs.get(0)), 0);
        assert_eq!(array::untag_value(col.refs.get(1)), 1);
    }

    #[test]
    fn type_change_keeps_payload_bytes() {
        let mut col = new_column();
        col.add(&MixedValue::Int(42)).unwrap();

        col.set(0, &MixedValue::String("hello".into())).unwrap();
        assert_eq!(col.get_string(0), "hello");

        col.set(0, &MixedValue::Int(7)).unwrap();

        assert_eq!(col.type_at(0), MixedType::Int);
        assert_eq!(col.get_int(0), 7);
        assert_eq!(col.refs.get(0) & 1, 1);
        // The payload bytes linger; other payload indices must not move.
        assert_eq!(col.data.as_ref().unwrap().get(0), b"hello");
    }

    #[test]
    fn string_rewrite_reuses_the_slot() {
        let mut col = new_column();
        col.add(&MixedValue::String("one".into())).unwrap();
        col.add(&MixedValue::String("two".into())).unwrap();

        col.set(0, &MixedValue::String("replaced".into())).unwrap();
        col.set(1, &MixedValue::Binary(vec![9])).unwrap();

        assert_eq!(col.get_string(0), "replaced");
        assert_eq!(col.get_binary(1), vec![9]);
        assert_eq!(col.data.as_ref().unwrap().len(), 2); // no new slots
    }

    #[test]
    fn erase_blanks_non_terminal_payloads() {
        let mut col = new_column();
        col.add(&MixedValue::String("first".into())).unwrap();
        col.add(&MixedValue::String("second".into())).unwrap();

        // Erase the first cell: its payload slot is blanked, not
        // removed, so the second cell's index stays valid.
        col.erase(0).unwrap();

        assert_eq!(col.len(), 1);
        assert_eq!(col.get_string(0), "second");
        let data = col.data.as_ref().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.get(0), b"");

        // Erasing the terminal payload truncates.
        col.erase(0).unwrap();
        assert_eq!(col.data.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn table_cells_hold_refs() {
        let mut col = new_column();
        col.add(&MixedValue::Table).unwrap();

        assert_eq!(col.type_at(0), MixedType::Table);
        assert!(col.subtable_ref(0).is_null()); // materialized on first write
        assert_eq!(col.refs.get(0) & 1, 0); // untagged slot
    }

    #[test]
    fn find_first_skips_other_types() {
        let mut col = new_column();
        col.add(&MixedValue::Int(5)).unwrap();
        col.add(&MixedValue::String("5".into())).unwrap();
        col.add(&MixedValue::Int(5)).unwrap();

        assert_eq!(col.find_first(&MixedValue::Int(5), 0, usize::MAX), Some(0));
        assert_eq!(
            col.find_first(&MixedValue::String("5".into()), 0, usize::MAX),
            Some(1)
        );
        assert_eq!(col.find_first(&MixedValue::Table, 0, usize::MAX), None);
    }
}
