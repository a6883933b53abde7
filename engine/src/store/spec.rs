//! Column specifications: the ordered list of named, typed columns that
//! defines a table, stored as nested node arrays.
//!
//! The spec set is a refs-bearing array `[types, names, (subspecs)]`.
//! The subspecs slot exists only when at least one column is of
//! subtable type; it holds one child spec set per subtable column, in
//! column order. Enum-compressed string columns keep their internal tag
//! in the types array but are reported to readers as plain strings.

use crate::error::{Error, Result};
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{Array, ArrayKind, ParentLink, SharedArray};
use crate::store::column::StringColumn;

/// The user-visible column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Bool,
    Date,
    String,
    Binary,
    Table,
    Mixed,
}

/// The stored column tags; `StringEnum` never escapes the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawColumnType {
    Int = 0,
    Bool = 1,
    Date = 2,
    String = 3,
    Binary = 4,
    Table = 5,
    Mixed = 6,
    StringEnum = 7,
}

impl RawColumnType {
    pub(crate) fn from_tag(tag: i64) -> Result<RawColumnType> {
        Ok(match tag {
            0 => RawColumnType::Int,
            1 => RawColumnType::Bool,
            2 => RawColumnType::Date,
            3 => RawColumnType::String,
            4 => RawColumnType::Binary,
            5 => RawColumnType::Table,
            6 => RawColumnType::Mixed,
            7 => RawColumnType::StringEnum,
            _ => return Err(Error::corruption(format!("invalid column type tag {}", tag))),
        })
    }

    pub(crate) fn public(self) -> ColumnType {
        match self {
            RawColumnType::Int => ColumnType::Int,
            RawColumnType::Bool => ColumnType::Bool,
            RawColumnType::Date => ColumnType::Date,
            RawColumnType::String | RawColumnType::StringEnum => ColumnType::String,
            RawColumnType::Binary => ColumnType::Binary,
            RawColumnType::Table => ColumnType::Table,
            RawColumnType::Mixed => ColumnType::Mixed,
        }
    }
}

impl From<ColumnType> for RawColumnType {
    fn from(ty: ColumnType) -> RawColumnType {
        match ty {
            ColumnType::Int => RawColumnType::Int,
            ColumnType::Bool => RawColumnType::Bool,
            ColumnType::Date => RawColumnType::Date,
            ColumnType::String => RawColumnType::String,
            ColumnType::Binary => RawColumnType::Binary,
            ColumnType::Table => RawColumnType::Table,
            ColumnType::Mixed => RawColumnType::Mixed,
        }
    }
}

/// Accessor over a stored spec set. Subtable accessors attach their own
/// `Spec` over the same refs, so schema reads through either stay
/// coherent.
pub struct Spec {
    set: SharedArray,
    types: SharedArray,
    names: StringColumn,
    subspecs: Option<SharedArray>,
}

impl Spec {
    /// Create an empty spec set.
    pub(crate) fn new(alloc: SharedAlloc) -> Result<Spec> {
        let types = Array::new(alloc.clone(), ArrayKind::Leaf)?;
        let names = StringColumn::new(alloc.clone())?;
        let set = SharedArray::new(alloc.clone(), ArrayKind::HasRefs)?;
        set.add(types.ref_().to_slot())?;
        set.add(names.root_ref().to_slot())?;
        let types = SharedArray::wrap(types);
        types.set_parent(Some(set.parent_link(0)));
        names.set_parent(Some(set.parent_link(1)));
        Ok(Spec {
            set,
            types,
            names,
            subspecs: None,
        })
    }

    /// Attach to an existing spec set.
    pub(crate) fn attach(alloc: SharedAlloc, r: Ref) -> Result<Spec> {
        let set = SharedArray::attach(alloc.clone(), r)?;
        if set.len() < 2 || set.len() > 3 {
            return Err(Error::corruption("spec set must have two or three slots"));
        }
        let types = SharedArray::attach(alloc.clone(), set.get_as_ref(0))?;
        types.set_parent(Some(set.parent_link(0)));
        let names = StringColumn::attach(alloc.clone(), set.get_as_ref(1))?;
        names.set_parent(Some(set.parent_link(1)));
        let subspecs = if set.len() == 3 {
            let subspecs = SharedArray::attach(alloc, set.get_as_ref(2))?;
            subspecs.set_parent(Some(set.parent_link(2)));
            Some(subspecs)
        } else {
            None
        };
        Ok(Spec {
            set,
            types,
            names,
            subspecs,
        })
    }

    /// The ref of the spec set.
    pub(crate) fn ref_(&self) -> Ref {
        self.set.ref_()
    }

    pub(crate) fn set_parent(&self, link: Option<ParentLink>) {
        self.set.set_parent(link);
    }

    pub fn column_count(&self) -> usize {
        self.types.len()
    }

    /// The user-visible type of column `ndx`.
    pub fn column_type(&self, ndx: usize) -> ColumnType {
        self.raw_column_type(ndx).public()
    }

    pub(crate) fn raw_column_type(&self, ndx: usize) -> RawColumnType {
        RawColumnType::from_tag(self.types.get(ndx)).expect("corrupt column type tag")
    }

    pub fn column_name(&self, ndx: usize) -> String {
        self.names.get(ndx)
    }

    /// The position of the column named `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.find_first(name, 0, usize::MAX)
    }

    /// Append a non-subtable column.
    pub(crate) fn add_column(&mut self, ty: ColumnType, name: &str) -> Result<()> {
        assert_ne!(ty, ColumnType::Table, "subtable columns carry a child spec");
        self.types.add(RawColumnType::from(ty) as i64)?;
        self.names.add(name)
    }

    /// Append a subtable column and return the accessor for its child
    /// spec.
    pub(crate) fn add_subtable_column(&mut self, name: &str) -> Result<Spec> {
        self.types.add(RawColumnType::Table as i64)?;
        self.names.add(name)?;
        self.ensure_subspecs()?;
        let alloc = self.set.alloc_handle();
        let child = Spec::new(alloc.clone())?;
        let subspecs = self.subspecs.as_ref().expect("subspecs just ensured");
        let pos = subspecs.len();
        subspecs.add(child.ref_().to_slot())?;
        child.set_parent(Some(subspecs.parent_link(pos)));
        Ok(child)
    }

    /// The child spec of the subtable column at `ndx`.
    pub(crate) fn subspec(&self, ndx: usize) -> Result<Spec> {
        assert_eq!(self.raw_column_type(ndx), RawColumnType::Table);
        let order = self.subspec_position(ndx);
        let subspecs = self
            .subspecs
            .as_ref()
            .expect("subtable column without subspecs slot");
        let child = Spec::attach(self.set.alloc_handle(), subspecs.get_as_ref(order))?;
        child.set_parent(Some(subspecs.parent_link(order)));
        Ok(child)
    }

    /// How many subtable columns precede `ndx` (the child spec order).
    fn subspec_position(&self, ndx: usize) -> usize {
        (0..ndx)
            .filter(|&i| self.raw_column_type(i) == RawColumnType::Table)
            .count()
    }

    /// Rewrite the stored tag in place (enum promotion).
    pub(crate) fn set_raw_type(&mut self, ndx: usize, raw: RawColumnType) -> Result<()> {
        self.types.set(ndx, raw as i64)
    }

    /// Remove the column at `ndx` from the schema.
    pub(crate) fn erase_column(&mut self, ndx: usize) -> Result<()> {
        if self.raw_column_type(ndx) == RawColumnType::Table {
            let order = self.subspec_position(ndx);
            let subspecs = self
                .subspecs
                .as_ref()
                .expect("subtable column without subspecs slot");
            let child_ref = subspecs.get_as_ref(order);
            crate::store::array::destroy_subtree(&self.set.alloc_handle(), child_ref);
            subspecs.set(order, Ref::NULL.to_slot())?;
            subspecs.erase(order)?;
        }
        self.types.erase(ndx)?;
        self.names.erase(ndx)
    }

    pub(crate) fn rename_column(&mut self, ndx: usize, new_name: &str) -> Result<()> {
        self.names.set(ndx, new_name)
    }

    fn ensure_subspecs(&mut self) -> Result<()> {
        if self.subspecs.is_some() {
            return Ok(());
        }
        let alloc = self.set.alloc_handle();
        let subspecs = SharedArray::new(alloc, ArrayKind::HasRefs)?;
        self.set.add(subspecs.ref_().to_slot())?;
        subspecs.set_parent(Some(self.set.parent_link(2)));
        self.subspecs = Some(subspecs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use std::rc::Rc;

    fn new_spec() -> Spec {
        Spec::new(Rc::new(SlabAlloc::new(8))).unwrap()
    }

    #[test]
    fn columns_round_trip_through_storage() {
        let mut spec = new_spec();
        spec.add_column(ColumnType::Int, "age").unwrap();
        spec.add_column(ColumnType::String, "name").unwrap();

        let reattached = Spec::attach(spec.set.alloc_handle(), spec.ref_()).unwrap();

        assert_eq!(reattached.column_count(), 2);
        assert_eq!(reattached.column_type(0), ColumnType::Int);
        assert_eq!(reattached.column_name(0), "age");
        assert_eq!(reattached.column_type(1), ColumnType::String);
        assert_eq!(reattached.column_index("name"), Some(1));
        assert_eq!(reattached.column_index("missing"), None);
    }

    #[test]
    fn subtable_columns_get_child_specs_in_order() {
        let mut spec = new_spec();
        spec.add_column(ColumnType::Int, "id").unwrap();
        let mut first = spec.add_subtable_column("events").unwrap();
        first.add_column(ColumnType::Date, "at").unwrap();
        let mut second = spec.add_subtable_column("tags").unwrap();
        second.add_column(ColumnType::String, "tag").unwrap();

        assert_eq!(spec.column_count(), 3);
        assert_eq!(spec.column_type(1), ColumnType::Table);

        let events = spec.subspec(1).unwrap();
        assert_eq!(events.column_count(), 1);
        assert_eq!(events.column_name(0), "at");

        let tags = spec.subspec(2).unwrap();
        assert_eq!(tags.column_name(0), "tag");
    }

    #[test]
    fn enum_tag_is_invisible_to_readers() {
        let mut spec = new_spec();
        spec.add_column(ColumnType::String, "city").unwrap();

        spec.set_raw_type(0, RawColumnType::StringEnum).unwrap();

        assert_eq!(spec.column_type(0), ColumnType::String);
        assert_eq!(spec.raw_column_type(0), RawColumnType::StringEnum);
    }
}
