//! Tables: records of rows defined by a [`Spec`], with per-cell access
//! delegated to the typed columns.
//!
//! A top-level table wraps `(spec set, columns array)` in an outer
//! refs-bearing array so the pair can occupy one slot of the group's
//! tables array. A subtable obtained from [`Table::get_table`] is a
//! live accessor over storage rooted in a cell of the parent column;
//! an empty subtable is a null slot, materialized on first write.
//!
//! Accessors are shared: `Table` is a cheap handle, and repeated
//! `get_table` calls for the same cell return the same underlying
//! accessor for as long as any user reference keeps it alive.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{ArrayKind, ParentLink, SharedArray};
use crate::store::column::{
    BinaryColumn, EnumStringColumn, IntColumn, MixedColumn, MixedValue, RowSet, StringColumn,
    SubtableColumn,
};
use crate::store::observer::{CollectionKind, MutationObserver, PkValue};
use crate::store::spec::{ColumnType, RawColumnType, Spec};

/// One cached accessor per spec column.
pub(crate) enum ColumnAccessor {
    Int(IntColumn),
    Bool(IntColumn),
    Date(IntColumn),
    String(StringColumn),
    StringEnum(EnumStringColumn),
    Binary(BinaryColumn),
    Subtable(SubtableColumn),
    Mixed(MixedColumn),
}

impl ColumnAccessor {
    fn length(&self) -> usize {
        match self {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => c.len(),
            ColumnAccessor::String(c) => c.len(),
            ColumnAccessor::StringEnum(c) => c.len(),
            ColumnAccessor::Binary(c) => c.len(),
            ColumnAccessor::Subtable(c) => c.len(),
            ColumnAccessor::Mixed(c) => c.len(),
        }
    }

    /// How many slots of the columns array this accessor occupies.
    fn slot_width(&self) -> usize {
        match self {
            ColumnAccessor::StringEnum(_) => 2,
            _ => 1,
        }
    }

    fn insert_default(&mut self, ndx: usize) -> Result<()> {
        match self {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.insert(ndx, 0)
            }
            ColumnAccessor::String(c) => c.insert(ndx, ""),
            ColumnAccessor::StringEnum(c) => c.insert(ndx, ""),
            ColumnAccessor::Binary(c) => c.insert(ndx, &[]),
            ColumnAccessor::Subtable(c) => c.insert(ndx),
            ColumnAccessor::Mixed(c) => c.insert(ndx, &MixedValue::Int(0)),
        }
    }

    fn erase_row(&mut self, ndx: usize) -> Result<()> {
        match self {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.erase(ndx)
            }
            ColumnAccessor::String(c) => c.erase(ndx),
            ColumnAccessor::StringEnum(c) => c.erase(ndx),
            ColumnAccessor::Binary(c) => c.erase(ndx),
            ColumnAccessor::Subtable(c) => c.erase(ndx),
            ColumnAccessor::Mixed(c) => c.erase(ndx),
        }
    }

    fn clear_rows(&mut self) -> Result<()> {
        match self {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.clear()
            }
            ColumnAccessor::String(c) => c.clear(),
            ColumnAccessor::StringEnum(c) => c.clear(),
            ColumnAccessor::Binary(c) => c.clear(),
            ColumnAccessor::Subtable(c) => c.clear(),
            ColumnAccessor::Mixed(c) => c.clear(),
        }
    }

    fn adjust_parent_index(&self, diff: isize) {
        match self {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.adjust_parent_index(diff)
            }
            ColumnAccessor::String(c) => c.adjust_parent_index(diff),
            ColumnAccessor::StringEnum(c) => c.adjust_parent_index(diff),
            ColumnAccessor::Binary(c) => c.adjust_parent_index(diff),
            ColumnAccessor::Subtable(c) => c.adjust_parent_index(diff),
            ColumnAccessor::Mixed(c) => c.adjust_parent_index(diff),
        }
    }

    fn destroy(&mut self) {
        match self {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.destroy()
            }
            ColumnAccessor::String(c) => c.destroy(),
            ColumnAccessor::StringEnum(c) => c.destroy(),
            ColumnAccessor::Binary(c) => c.destroy(),
            ColumnAccessor::Subtable(c) => c.destroy(),
            ColumnAccessor::Mixed(c) => c.destroy(),
        }
    }
}

/// How the table's storage is rooted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootKind {
    /// `(spec set, columns)` behind an outer wrapper held by the group.
    TopLevel,
    /// Columns array in a subtable-column cell; spec shared from the
    /// parent.
    Subtable,
    /// `(spec set, columns)` behind a wrapper held in a mixed cell.
    MixedSubtable,
}

pub(crate) struct TableInner {
    alloc: SharedAlloc,
    kind: RootKind,
    /// The outer wrapper (`TopLevel`/`MixedSubtable` once materialized).
    top: Option<SharedArray>,
    /// `None` only for an unmaterialized mixed subtable.
    spec: Option<Spec>,
    /// `None` while the table is an empty, unmaterialized subtable.
    columns: Option<SharedArray>,
    cols: Vec<ColumnAccessor>,
    size: usize,
    pub(crate) detached: bool,
    /// Subtables: where the root ref is written on materialization and
    /// copy-on-write.
    slot_link: Option<ParentLink>,
    name: Option<String>,
    pk_col: Option<usize>,
    observer: Option<Rc<dyn MutationObserver>>,
}

impl TableInner {
    /// Called by the containing subtable column when row surgery moves
    /// this accessor's cell.
    pub(crate) fn shift_columns_parent(&mut self, diff: isize) {
        if let Some(link) = &self.slot_link {
            // Every accessor copy shares the index cell.
            link.adjust_index(diff);
        }
    }

    fn assert_attached(&self) {
        assert!(!self.detached, "operation on a detached table accessor");
    }

    fn assert_row(&self, row: usize) {
        assert!(row < self.size, "row index {} out of range", row);
    }

    /// Create the backing storage of an empty subtable on first write.
    fn ensure_materialized(&mut self) -> Result<()> {
        if self.columns.is_some() {
            return Ok(());
        }
        match self.kind {
            RootKind::TopLevel => unreachable!("top-level tables are born materialized"),
            RootKind::Subtable => {
                let link = self
                    .slot_link
                    .clone()
                    .expect("subtable accessor without a slot link");
                let columns = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
                link.update(columns.ref_())?;
                columns.set_parent(Some(link));
                self.columns = Some(columns);
                self.create_columns()?;
            }
            RootKind::MixedSubtable => {
                let link = self
                    .slot_link
                    .clone()
                    .expect("mixed subtable accessor without a slot link");
                let spec = Spec::new(self.alloc.clone())?;
                let columns = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
                let top = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
                top.add(spec.ref_().to_slot())?;
                top.add(columns.ref_().to_slot())?;
                link.update(top.ref_())?;
                top.set_parent(Some(link));
                spec.set_parent(Some(top.parent_link(0)));
                columns.set_parent(Some(top.parent_link(1)));
                self.spec = Some(spec);
                self.columns = Some(columns);
                self.top = Some(top);
            }
        }
        Ok(())
    }

    fn spec(&self) -> &Spec {
        self.spec.as_ref().expect("unmaterialized table has no spec")
    }

    /// Position of the first columns-array slot of spec column `col`.
    fn slot_of(&self, col: usize) -> usize {
        self.cols[..col].iter().map(|c| c.slot_width()).sum()
    }

    /// Build one accessor per spec column from the stored refs.
    fn cache_columns(&mut self) -> Result<()> {
        debug_assert!(self.cols.is_empty());
        let columns = self.columns.as_ref().expect("no columns to cache");
        let spec = self.spec.as_ref().expect("no spec to cache from");
        let mut pos = 0usize;
        let mut size: Option<usize> = None;
        for i in 0..spec.column_count() {
            let raw = spec.raw_column_type(i);
            let r = columns.get_as_ref(pos);
            let link = columns.parent_link(pos);
            let acc = match raw {
                RawColumnType::Int => {
                    let c = IntColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::Int(c)
                }
                RawColumnType::Bool => {
                    let c = IntColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::Bool(c)
                }
                RawColumnType::Date => {
                    let c = IntColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::Date(c)
                }
                RawColumnType::String => {
                    let c = StringColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::String(c)
                }
                RawColumnType::StringEnum => {
                    let values_ref = columns.get_as_ref(pos + 1);
                    let c = EnumStringColumn::attach(self.alloc.clone(), r, values_ref)?;
                    c.set_parent(Some(link), Some(columns.parent_link(pos + 1)));
                    pos += 1;
                    ColumnAccessor::StringEnum(c)
                }
                RawColumnType::Binary => {
                    let c = BinaryColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::Binary(c)
                }
                RawColumnType::Table => {
                    let c = SubtableColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::Subtable(c)
                }
                RawColumnType::Mixed => {
                    let c = MixedColumn::attach(self.alloc.clone(), r)?;
                    c.set_parent(Some(link));
                    ColumnAccessor::Mixed(c)
                }
            };
            match size {
                None => size = Some(acc.length()),
                Some(s) => debug_assert_eq!(s, acc.length(), "column lengths diverge"),
            }
            self.cols.push(acc);
            pos += 1;
        }
        self.size = size.unwrap_or(0);
        Ok(())
    }

    /// Create empty storage for every spec column (fresh tables and
    /// subtable materialization).
    fn create_columns(&mut self) -> Result<()> {
        debug_assert!(self.cols.is_empty());
        let count = self.spec().column_count();
        for i in 0..count {
            let raw = self.spec().raw_column_type(i);
            self.append_column_storage(raw)?;
        }
        Ok(())
    }

    /// Create storage for one spec column and hook it into the columns
    /// array.
    fn append_column_storage(&mut self, raw: RawColumnType) -> Result<()> {
        let columns = self.columns.as_ref().expect("no columns array").clone();
        let pos = columns.len();
        let acc = match raw {
            RawColumnType::Int => {
                let c = IntColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::Int(c)
            }
            RawColumnType::Bool => {
                let c = IntColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::Bool(c)
            }
            RawColumnType::Date => {
                let c = IntColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::Date(c)
            }
            RawColumnType::String => {
                let c = StringColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::String(c)
            }
            RawColumnType::StringEnum => {
                unreachable!("enum columns are only produced by optimize()")
            }
            RawColumnType::Binary => {
                let c = BinaryColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::Binary(c)
            }
            RawColumnType::Table => {
                let c = SubtableColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::Subtable(c)
            }
            RawColumnType::Mixed => {
                let c = MixedColumn::new(self.alloc.clone())?;
                columns.add(c.root_ref().to_slot())?;
                c.set_parent(Some(columns.parent_link(pos)));
                ColumnAccessor::Mixed(c)
            }
        };
        self.cols.push(acc);
        Ok(())
    }

    fn insert_row_internal(&mut self, ndx: usize) -> Result<()> {
        for col in self.cols.iter_mut() {
            col.insert_default(ndx)?;
        }
        self.size += 1;
        Ok(())
    }

    fn delete_row_internal(&mut self, ndx: usize) -> Result<()> {
        for col in self.cols.iter_mut() {
            col.erase_row(ndx)?;
        }
        self.size -= 1;
        Ok(())
    }

    /// The primary key of a row, when the table has a key column.
    fn pk_of(&self, row: usize) -> Option<PkValue> {
        let pk_col = self.pk_col?;
        Some(match &self.cols[pk_col] {
            ColumnAccessor::Int(c) => PkValue::Int(c.get(row)),
            ColumnAccessor::String(c) => PkValue::String(c.get(row)),
            ColumnAccessor::StringEnum(c) => PkValue::String(c.get(row)),
            _ => unreachable!("primary keys are integers or strings"),
        })
    }

    /// The observer context for a mutation of `row`, when recording
    /// applies.
    fn record_ctx(&self, row: usize) -> Option<(Rc<dyn MutationObserver>, String, PkValue)> {
        let observer = self.observer.clone()?;
        let name = self.name.clone()?;
        let pk = self.pk_of(row)?;
        Some((observer, name, pk))
    }

    /// A scalar snapshot of a cell, for prior-state capture. Nested
    /// tables have no scalar value.
    fn cell_value(&self, col: usize, row: usize) -> Option<MixedValue> {
        match &self.cols[col] {
            ColumnAccessor::Int(c) => Some(MixedValue::Int(c.get(row))),
            ColumnAccessor::Bool(c) => Some(MixedValue::Bool(c.get(row) != 0)),
            ColumnAccessor::Date(c) => Some(MixedValue::Date(c.get(row))),
            ColumnAccessor::String(c) => Some(MixedValue::String(c.get(row))),
            ColumnAccessor::StringEnum(c) => Some(MixedValue::String(c.get(row))),
            ColumnAccessor::Binary(c) => Some(MixedValue::Binary(c.get(row))),
            ColumnAccessor::Subtable(_) => None,
            ColumnAccessor::Mixed(c) => match c.get(row) {
                MixedValue::Table => None,
                v => Some(v),
            },
        }
    }
}

/// A shared table accessor.
#[derive(Clone)]
pub struct Table {
    pub(crate) inner: Rc<RefCell<TableInner>>,
}

impl Table {
    // ---- construction (crate-internal; users go through the group) ----

    /// A fresh top-level table with an empty spec.
    pub(crate) fn create_top_level(alloc: SharedAlloc) -> Result<Table> {
        let spec = Spec::new(alloc.clone())?;
        let columns = SharedArray::new(alloc.clone(), ArrayKind::HasRefs)?;
        let top = SharedArray::new(alloc.clone(), ArrayKind::HasRefs)?;
        top.add(spec.ref_().to_slot())?;
        top.add(columns.ref_().to_slot())?;
        spec.set_parent(Some(top.parent_link(0)));
        columns.set_parent(Some(top.parent_link(1)));
        Ok(Table {
            inner: Rc::new(RefCell::new(TableInner {
                alloc,
                kind: RootKind::TopLevel,
                top: Some(top),
                spec: Some(spec),
                columns: Some(columns),
                cols: Vec::new(),
                size: 0,
                detached: false,
                slot_link: None,
                name: None,
                pk_col: None,
                observer: None,
            })),
        })
    }

    /// Attach to a stored top-level table.
    pub(crate) fn attach_top_level(alloc: SharedAlloc, top_ref: Ref) -> Result<Table> {
        let top = SharedArray::attach(alloc.clone(), top_ref)?;
        let spec = Spec::attach(alloc.clone(), top.get_as_ref(0))?;
        spec.set_parent(Some(top.parent_link(0)));
        let columns = SharedArray::attach(alloc.clone(), top.get_as_ref(1))?;
        columns.set_parent(Some(top.parent_link(1)));
        // An optional third slot records the primary-key column.
        let pk_col = if top.len() >= 3 {
            let tagged = crate::store::array::untag_value(top.get(2));
            (tagged > 0).then(|| (tagged - 1) as usize)
        } else {
            None
        };
        let table = Table {
            inner: Rc::new(RefCell::new(TableInner {
                alloc,
                kind: RootKind::TopLevel,
                top: Some(top),
                spec: Some(spec),
                columns: Some(columns),
                cols: Vec::new(),
                size: 0,
                detached: false,
                slot_link: None,
                name: None,
                pk_col,
                observer: None,
            })),
        };
        table.inner.borrow_mut().cache_columns()?;
        Ok(table)
    }

    /// Record the primary-key column in the table wrapper so reattach
    /// restores it.
    pub(crate) fn persist_pk_col(&self, col: usize) -> Result<()> {
        let inner = self.inner.borrow();
        let top = inner.top.as_ref().expect("table without a top array");
        let tagged = crate::store::array::tag_value(col as i64 + 1);
        if top.len() >= 3 {
            top.set(2, tagged)
        } else {
            top.add(tagged)
        }
    }

    pub(crate) fn top_ref(&self) -> Ref {
        self.inner
            .borrow()
            .top
            .as_ref()
            .expect("table without a top array")
            .ref_()
    }

    pub(crate) fn set_top_parent(&self, link: Option<ParentLink>) {
        let inner = self.inner.borrow();
        if let Some(top) = &inner.top {
            top.set_parent(link);
        }
    }

    pub(crate) fn adjust_top_parent_index(&self, diff: isize) {
        let inner = self.inner.borrow();
        if let Some(top) = &inner.top {
            top.adjust_parent_index(diff);
        }
    }

    /// Wire the replication identity: the table name, the observer, and
    /// (when present) the primary key column.
    pub(crate) fn set_sync_meta(
        &self,
        name: &str,
        observer: Option<Rc<dyn MutationObserver>>,
        pk_col: Option<usize>,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.name = Some(name.to_string());
        inner.observer = observer;
        inner.pk_col = pk_col;
    }

    pub(crate) fn pk_col(&self) -> Option<usize> {
        self.inner.borrow().pk_col
    }

    /// Tear the accessor off its storage (rollback, table erasure).
    pub(crate) fn detach(&self) {
        self.inner.borrow_mut().detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.inner.borrow().detached
    }

    // ---- schema ----

    pub fn column_count(&self) -> usize {
        let inner = self.inner.borrow();
        match &inner.spec {
            Some(spec) => spec.column_count(),
            None => 0,
        }
    }

    pub fn column_name(&self, col: usize) -> String {
        self.inner.borrow().spec().column_name(col)
    }

    pub fn column_type(&self, col: usize) -> ColumnType {
        self.inner.borrow().spec().column_type(col)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        let inner = self.inner.borrow();
        inner.spec.as_ref()?.column_index(name)
    }

    /// Append a column of a scalar type. Existing rows get the default
    /// value.
    pub fn add_column(&self, ty: ColumnType, name: &str) -> Result<usize> {
        self.add_column_with_kind(ty, name, CollectionKind::Single)
    }

    /// Append a collection column: storage-wise a subtable column whose
    /// child spec holds one `value` column of the element type.
    pub fn add_collection_column(
        &self,
        name: &str,
        element: ColumnType,
        kind: CollectionKind,
    ) -> Result<usize> {
        debug_assert_ne!(kind, CollectionKind::Single);
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        let mut child = inner
            .spec
            .as_mut()
            .expect("materialized table has a spec")
            .add_subtable_column(name)?;
        child.add_column(element, "value")?;
        inner.append_column_storage(RawColumnType::Table)?;
        let col = inner.cols.len() - 1;
        let size = inner.size;
        for row in 0..size {
            inner.cols[col].insert_default(row)?;
        }
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            observer.add_column(table, name, element, false, kind)?;
        }
        Ok(col)
    }

    /// Append a subtable column with the given child columns.
    pub fn add_subtable_column(
        &self,
        name: &str,
        child_columns: &[(ColumnType, &str)],
    ) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        let mut child = inner
            .spec
            .as_mut()
            .expect("materialized table has a spec")
            .add_subtable_column(name)?;
        for (ty, child_name) in child_columns {
            child.add_column(*ty, child_name)?;
        }
        inner.append_column_storage(RawColumnType::Table)?;
        let col = inner.cols.len() - 1;
        let size = inner.size;
        for row in 0..size {
            inner.cols[col].insert_default(row)?;
        }
        Ok(col)
    }

    fn add_column_with_kind(
        &self,
        ty: ColumnType,
        name: &str,
        kind: CollectionKind,
    ) -> Result<usize> {
        assert_ne!(ty, ColumnType::Table, "use add_subtable_column");
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        inner
            .spec
            .as_mut()
            .expect("materialized table has a spec")
            .add_column(ty, name)?;
        inner.append_column_storage(RawColumnType::from(ty))?;
        let col = inner.cols.len() - 1;
        let size = inner.size;
        for row in 0..size {
            inner.cols[col].insert_default(row)?;
        }
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            observer.add_column(table, name, ty, false, kind)?;
        }
        Ok(col)
    }

    /// Remove a column and its storage.
    pub fn erase_column(&self, col: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        let name = inner.spec().column_name(col);
        let ty = inner.spec().column_type(col);
        let slot = inner.slot_of(col);
        let width = inner.cols[col].slot_width();

        inner.cols[col].destroy();
        inner.cols.remove(col);

        let columns = inner.columns.as_ref().expect("no columns array").clone();
        for _ in 0..width {
            // The refs were freed above; remove the dangling slots.
            columns.erase(slot)?;
        }
        for acc in inner.cols[col..].iter() {
            acc.adjust_parent_index(-(width as isize));
        }
        inner
            .spec
            .as_mut()
            .expect("materialized table has a spec")
            .erase_column(col)?;
        if inner.cols.is_empty() {
            inner.size = 0;
        }
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            observer.erase_column(table, &name, ty, false, CollectionKind::Single)?;
        }
        Ok(())
    }

    pub fn rename_column(&self, col: usize, new_name: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        let old = inner.spec().column_name(col);
        inner
            .spec
            .as_mut()
            .expect("materialized table has a spec")
            .rename_column(col, new_name)?;
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            observer.rename_column(table, &old, new_name)?;
        }
        Ok(())
    }

    // ---- rows ----

    pub fn row_count(&self) -> usize {
        self.inner.borrow().size
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn add_row(&self) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        let ndx = inner.size;
        inner.insert_row_internal(ndx)?;
        Ok(ndx)
    }

    pub fn insert_row(&self, ndx: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        assert!(ndx <= inner.size, "row index {} out of range", ndx);
        inner.insert_row_internal(ndx)
    }

    pub fn delete_row(&self, ndx: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(ndx);
        inner.delete_row_internal(ndx)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        for col in inner.cols.iter_mut() {
            col.clear_rows()?;
        }
        inner.size = 0;
        Ok(())
    }

    // ---- the insert protocol ----
    //
    // Every column must receive exactly one `insert_*` at the same row
    // position, then `insert_done` bumps the row count.

    pub fn insert_int(&self, col: usize, ndx: usize, value: i64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        match &mut inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Date(c) => c.insert(ndx, value),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn insert_bool(&self, col: usize, ndx: usize, value: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        match &mut inner.cols[col] {
            ColumnAccessor::Bool(c) => c.insert(ndx, i64::from(value)),
            _ => panic!("column {} is not a bool column", col),
        }
    }

    pub fn insert_string(&self, col: usize, ndx: usize, value: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        match &mut inner.cols[col] {
            ColumnAccessor::String(c) => c.insert(ndx, value),
            ColumnAccessor::StringEnum(c) => c.insert(ndx, value),
            _ => panic!("column {} is not a string column", col),
        }
    }

    pub fn insert_binary(&self, col: usize, ndx: usize, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        match &mut inner.cols[col] {
            ColumnAccessor::Binary(c) => c.insert(ndx, value),
            _ => panic!("column {} is not a binary column", col),
        }
    }

    pub fn insert_subtable(&self, col: usize, ndx: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        match &mut inner.cols[col] {
            ColumnAccessor::Subtable(c) => c.insert(ndx),
            _ => panic!("column {} is not a subtable column", col),
        }
    }

    pub fn insert_mixed(&self, col: usize, ndx: usize, value: &MixedValue) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        match &mut inner.cols[col] {
            ColumnAccessor::Mixed(c) => c.insert(ndx, value),
            _ => panic!("column {} is not a mixed column", col),
        }
    }

    /// Complete a row built with the `insert_*` family.
    pub fn insert_done(&self) {
        let mut inner = self.inner.borrow_mut();
        let len = inner.cols.first().map(|c| c.length()).unwrap_or(0);
        #[cfg(debug_assertions)]
        for (i, c) in inner.cols.iter().enumerate() {
            debug_assert_eq!(c.length(), len, "column {} out of step after insert", i);
        }
        inner.size = len;
    }

    // ---- cells ----

    pub fn get_int(&self, col: usize, row: usize) -> i64 {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        match &inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Date(c) => c.get(row),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn get_bool(&self, col: usize, row: usize) -> bool {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        match &inner.cols[col] {
            ColumnAccessor::Bool(c) => c.get(row) != 0,
            _ => panic!("column {} is not a bool column", col),
        }
    }

    pub fn get_date(&self, col: usize, row: usize) -> i64 {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        match &inner.cols[col] {
            ColumnAccessor::Date(c) => c.get(row),
            _ => panic!("column {} is not a date column", col),
        }
    }

    pub fn get_string(&self, col: usize, row: usize) -> String {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        match &inner.cols[col] {
            ColumnAccessor::String(c) => c.get(row),
            ColumnAccessor::StringEnum(c) => c.get(row),
            _ => panic!("column {} is not a string column", col),
        }
    }

    pub fn get_binary(&self, col: usize, row: usize) -> Vec<u8> {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        match &inner.cols[col] {
            ColumnAccessor::Binary(c) => c.get(row),
            _ => panic!("column {} is not a binary column", col),
        }
    }

    pub fn get_mixed(&self, col: usize, row: usize) -> MixedValue {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        match &inner.cols[col] {
            ColumnAccessor::Mixed(c) => c.get(row),
            _ => panic!("column {} is not a mixed column", col),
        }
    }

    pub fn set_int(&self, col: usize, row: usize, value: i64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        self.record_set(&inner, col, row, &MixedValue::Int(value))?;
        match &mut inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Date(c) => c.set(row, value),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn set_bool(&self, col: usize, row: usize, value: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        self.record_set(&inner, col, row, &MixedValue::Bool(value))?;
        match &mut inner.cols[col] {
            ColumnAccessor::Bool(c) => c.set(row, i64::from(value)),
            _ => panic!("column {} is not a bool column", col),
        }
    }

    pub fn set_date(&self, col: usize, row: usize, value: i64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        self.record_set(&inner, col, row, &MixedValue::Date(value))?;
        match &mut inner.cols[col] {
            ColumnAccessor::Date(c) => c.set(row, value),
            _ => panic!("column {} is not a date column", col),
        }
    }

    pub fn set_string(&self, col: usize, row: usize, value: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        self.record_set(&inner, col, row, &MixedValue::String(value.to_string()))?;
        match &mut inner.cols[col] {
            ColumnAccessor::String(c) => c.set(row, value),
            ColumnAccessor::StringEnum(c) => c.set(row, value),
            _ => panic!("column {} is not a string column", col),
        }
    }

    pub fn set_binary(&self, col: usize, row: usize, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        self.record_set(&inner, col, row, &MixedValue::Binary(value.to_vec()))?;
        match &mut inner.cols[col] {
            ColumnAccessor::Binary(c) => c.set(row, value),
            _ => panic!("column {} is not a binary column", col),
        }
    }

    pub fn set_mixed(&self, col: usize, row: usize, value: &MixedValue) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        self.record_set(&inner, col, row, value)?;
        match &mut inner.cols[col] {
            ColumnAccessor::Mixed(c) => c.set(row, value),
            _ => panic!("column {} is not a mixed column", col),
        }
    }

    /// Add `delta` to an integer cell, recorded as an additive merge
    /// operation rather than an overwrite.
    pub fn add_int(&self, col: usize, row: usize, delta: i64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        if Some(col) != inner.pk_col {
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                observer.add_int(&table, &pk, &field, delta)?;
            }
        }
        match &mut inner.cols[col] {
            ColumnAccessor::Int(c) => {
                let old = c.get(row);
                c.set(row, old + delta)
            }
            _ => panic!("column {} is not an integer column", col),
        }
    }

    fn record_set(&self, inner: &TableInner, col: usize, row: usize, value: &MixedValue) -> Result<()> {
        if Some(col) == inner.pk_col {
            return Ok(());
        }
        if let Some((observer, table, pk)) = inner.record_ctx(row) {
            let field = inner.spec().column_name(col);
            let prior = inner.cell_value(col, row);
            observer.set_value(&table, &pk, &field, Some(value), prior.as_ref(), false)?;
        }
        Ok(())
    }

    // ---- subtables ----

    /// A live accessor for the nested table in the given cell.
    pub fn get_table(&self, col: usize, row: usize) -> Result<Table> {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        let sc = match &inner.cols[col] {
            ColumnAccessor::Subtable(sc) => sc,
            _ => panic!("column {} is not a subtable column", col),
        };
        if let Some(cached) = sc.cached(row) {
            return Ok(Table { inner: cached });
        }
        let child_spec = inner.spec().subspec(col)?;
        let slot_link = sc.slot_link(row);
        let columns_ref = sc.ref_at(row);
        let columns = if columns_ref.is_null() {
            None
        } else {
            let columns = SharedArray::attach(inner.alloc.clone(), columns_ref)?;
            columns.set_parent(Some(slot_link.clone()));
            Some(columns)
        };
        let sub = Rc::new(RefCell::new(TableInner {
            alloc: inner.alloc.clone(),
            kind: RootKind::Subtable,
            top: None,
            spec: Some(child_spec),
            columns,
            cols: Vec::new(),
            size: 0,
            detached: false,
            slot_link: Some(slot_link),
            name: None,
            pk_col: None,
            observer: None,
        }));
        if sub.borrow().columns.is_some() {
            sub.borrow_mut().cache_columns()?;
        }
        sc.cache(row, &sub);
        Ok(Table { inner: sub })
    }

    /// Destroy the nested table in the cell, leaving an empty subtable.
    pub fn clear_subtable(&self, col: usize, row: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.assert_row(row);
        match &mut inner.cols[col] {
            ColumnAccessor::Subtable(sc) => sc.clear_at(row),
            _ => panic!("column {} is not a subtable column", col),
        }
    }

    /// A live accessor for the nested table held in a mixed cell. The
    /// cell must already hold a table value.
    pub fn get_mixed_table(&self, col: usize, row: usize) -> Result<Table> {
        let inner = self.inner.borrow();
        inner.assert_attached();
        inner.assert_row(row);
        let mc = match &inner.cols[col] {
            ColumnAccessor::Mixed(c) => c,
            _ => panic!("column {} is not a mixed column", col),
        };
        let slot_link = mc.subtable_slot_link(row);
        let top_ref = mc.subtable_ref(row);
        let (top, spec, columns) = if top_ref.is_null() {
            (None, None, None)
        } else {
            let top = SharedArray::attach(inner.alloc.clone(), top_ref)?;
            top.set_parent(Some(slot_link.clone()));
            let spec = Spec::attach(inner.alloc.clone(), top.get_as_ref(0))?;
            spec.set_parent(Some(top.parent_link(0)));
            let columns = SharedArray::attach(inner.alloc.clone(), top.get_as_ref(1))?;
            columns.set_parent(Some(top.parent_link(1)));
            (Some(top), Some(spec), Some(columns))
        };
        let sub = Rc::new(RefCell::new(TableInner {
            alloc: inner.alloc.clone(),
            kind: RootKind::MixedSubtable,
            top,
            spec,
            columns,
            cols: Vec::new(),
            size: 0,
            detached: false,
            slot_link: Some(slot_link),
            name: None,
            pk_col: None,
            observer: None,
        }));
        if sub.borrow().columns.is_some() {
            sub.borrow_mut().cache_columns()?;
        }
        Ok(Table { inner: sub })
    }

    // ---- find and aggregates ----

    pub fn find_first_int(&self, col: usize, value: i64) -> Option<usize> {
        let inner = self.inner.borrow();
        match inner.cols.get(col)? {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.find_first(value, 0, usize::MAX)
            }
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn find_all_int(&self, col: usize, value: i64) -> RowSet {
        let inner = self.inner.borrow();
        let mut out = RowSet::new();
        match &inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.find_all(&mut out, value)
            }
            _ => panic!("column {} is not an integer column", col),
        }
        out
    }

    pub fn find_first_string(&self, col: usize, value: &str) -> Option<usize> {
        let inner = self.inner.borrow();
        match inner.cols.get(col)? {
            ColumnAccessor::String(c) => c.find_first(value, 0, usize::MAX),
            ColumnAccessor::StringEnum(c) => c.find_first(value, 0, usize::MAX),
            _ => panic!("column {} is not a string column", col),
        }
    }

    pub fn find_all_string(&self, col: usize, value: &str) -> RowSet {
        let inner = self.inner.borrow();
        let mut out = RowSet::new();
        match &inner.cols[col] {
            ColumnAccessor::String(c) => c.find_all(&mut out, value),
            ColumnAccessor::StringEnum(c) => c.find_all(&mut out, value),
            _ => panic!("column {} is not a string column", col),
        }
        out
    }

    pub fn find_first_binary(&self, col: usize, value: &[u8]) -> Option<usize> {
        let inner = self.inner.borrow();
        match inner.cols.get(col)? {
            ColumnAccessor::Binary(c) => c.find_first(value, 0, usize::MAX),
            _ => panic!("column {} is not a binary column", col),
        }
    }

    pub fn sum_int(&self, col: usize) -> i64 {
        let inner = self.inner.borrow();
        match &inner.cols[col] {
            ColumnAccessor::Int(c) => c.sum(0, usize::MAX),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn minimum_int(&self, col: usize) -> Option<i64> {
        let inner = self.inner.borrow();
        match &inner.cols[col] {
            ColumnAccessor::Int(c) => c.minimum(0, usize::MAX),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn maximum_int(&self, col: usize) -> Option<i64> {
        let inner = self.inner.borrow();
        match &inner.cols[col] {
            ColumnAccessor::Int(c) => c.maximum(0, usize::MAX),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    pub fn count_int(&self, col: usize, value: i64) -> usize {
        let inner = self.inner.borrow();
        match &inner.cols[col] {
            ColumnAccessor::Int(c) => c.count(value),
            _ => panic!("column {} is not an integer column", col),
        }
    }

    /// Attach a search index to an integer column.
    pub fn set_index(&self, col: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        match &mut inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.build_index();
            }
            _ => panic!("column {} is not an integer column", col),
        }
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            let field = inner.spec().column_name(col);
            observer.add_search_index(table, &field)?;
        }
        Ok(())
    }

    /// Drop the search index from an integer column.
    pub fn remove_index(&self, col: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        match &mut inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.remove_index();
            }
            _ => panic!("column {} is not an integer column", col),
        }
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            let field = inner.spec().column_name(col);
            observer.remove_search_index(table, &field)?;
        }
        Ok(())
    }

    pub fn has_index(&self, col: usize) -> bool {
        let inner = self.inner.borrow();
        match &inner.cols[col] {
            ColumnAccessor::Int(c) | ColumnAccessor::Bool(c) | ColumnAccessor::Date(c) => {
                c.has_index()
            }
            _ => false,
        }
    }

    /// Scan string columns and enum-compress the ones whose distinct
    /// ratio is strictly below the threshold.
    pub fn optimize(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        let count = inner.cols.len();
        for col in 0..count {
            let pair = match &inner.cols[col] {
                ColumnAccessor::String(c) => c.auto_enumerate()?,
                _ => None,
            };
            let Some((keys_ref, values_ref)) = pair else {
                continue;
            };
            trace!("enum-compressing string column {}", col);

            let slot = inner.slot_of(col);
            let columns = inner.columns.as_ref().expect("no columns array").clone();
            columns.set(slot, keys_ref.to_slot())?;
            columns.insert(slot + 1, values_ref.to_slot())?;
            // Subsequent accessors shifted one slot to the right.
            for acc in inner.cols[col + 1..].iter() {
                acc.adjust_parent_index(1);
            }
            inner
                .spec
                .as_mut()
                .expect("materialized table has a spec")
                .set_raw_type(col, RawColumnType::StringEnum)?;

            let enum_col =
                EnumStringColumn::attach(inner.alloc.clone(), keys_ref, values_ref)?;
            enum_col.set_parent(
                Some(columns.parent_link(slot)),
                Some(columns.parent_link(slot + 1)),
            );
            let old = std::mem::replace(&mut inner.cols[col], ColumnAccessor::StringEnum(enum_col));
            if let ColumnAccessor::String(mut old) = old {
                old.set_parent(None);
                old.destroy();
            }
        }
        Ok(())
    }

    // ---- objects (primary-key addressed rows) ----

    /// The row holding the given primary key.
    pub fn find_row_by_pk(&self, pk: &PkValue) -> Option<usize> {
        let inner = self.inner.borrow();
        let pk_col = inner.pk_col?;
        match (&inner.cols[pk_col], pk) {
            (ColumnAccessor::Int(c), PkValue::Int(v)) => c.find_first(*v, 0, usize::MAX),
            (ColumnAccessor::String(c), PkValue::String(v)) => c.find_first(v, 0, usize::MAX),
            (ColumnAccessor::StringEnum(c), PkValue::String(v)) => c.find_first(v, 0, usize::MAX),
            _ => None,
        }
    }

    /// Create the object with the given key; idempotent.
    pub fn create_object(&self, pk: &PkValue) -> Result<usize> {
        if let Some(row) = self.find_row_by_pk(pk) {
            return Ok(row);
        }
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        inner.ensure_materialized()?;
        let pk_col = inner.pk_col.expect("create_object on a table without a key");
        if let (Some(observer), Some(table)) = (&inner.observer, &inner.name) {
            observer.create_object(table, pk)?;
        }
        let row = inner.size;
        inner.insert_row_internal(row)?;
        match (&mut inner.cols[pk_col], pk) {
            (ColumnAccessor::Int(c), PkValue::Int(v)) => c.set(row, *v)?,
            (ColumnAccessor::String(c), PkValue::String(v)) => c.set(row, v)?,
            (ColumnAccessor::StringEnum(c), PkValue::String(v)) => c.set(row, v)?,
            _ => panic!("primary key type mismatch"),
        }
        Ok(row)
    }

    /// Erase the object with the given key. Returns whether it existed.
    pub fn erase_object(&self, pk: &PkValue) -> Result<bool> {
        let Some(row) = self.find_row_by_pk(pk) else {
            return Ok(false);
        };
        let mut inner = self.inner.borrow_mut();
        inner.assert_attached();
        if let (Some(observer), Some(table)) = (inner.observer.clone(), inner.name.clone()) {
            let mut prior = Vec::new();
            for col in 0..inner.cols.len() {
                if Some(col) == inner.pk_col {
                    continue;
                }
                if let Some(value) = inner.cell_value(col, row) {
                    prior.push((inner.spec().column_name(col), value));
                }
            }
            observer.erase_object(&table, pk, &prior)?;
        }
        inner.delete_row_internal(row)?;
        Ok(true)
    }

    // ---- collection cells (lists and unordered sets) ----
    //
    // A collection cell is a nested table with a single `value` column;
    // the parent table carries the path context for recording.

    pub fn list_size(&self, col: usize, row: usize) -> Result<usize> {
        Ok(self.get_table(col, row)?.row_count())
    }

    pub fn list_get(&self, col: usize, row: usize, ndx: usize) -> Result<MixedValue> {
        let sub = self.get_table(col, row)?;
        let value = sub
            .inner
            .borrow()
            .cell_value(0, ndx)
            .expect("collection cells hold scalar values");
        Ok(value)
    }

    pub fn list_insert(
        &self,
        col: usize,
        row: usize,
        ndx: usize,
        value: &MixedValue,
    ) -> Result<()> {
        let sub = self.get_table(col, row)?;
        let prior_size = sub.row_count();
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                observer.list_insert(&table, &pk, &field, ndx as u32, value, prior_size as u32)?;
            }
        }
        sub.insert_row(ndx)?;
        sub.set_collection_value(ndx, value)
    }

    pub fn list_set(&self, col: usize, row: usize, ndx: usize, value: &MixedValue) -> Result<()> {
        let sub = self.get_table(col, row)?;
        let prior_size = sub.row_count();
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                let prior = sub.inner.borrow().cell_value(0, ndx);
                observer.list_set(
                    &table,
                    &pk,
                    &field,
                    ndx as u32,
                    value,
                    prior.as_ref(),
                    prior_size as u32,
                )?;
            }
        }
        sub.set_collection_value(ndx, value)
    }

    pub fn list_erase(&self, col: usize, row: usize, ndx: usize) -> Result<()> {
        let sub = self.get_table(col, row)?;
        let prior_size = sub.row_count();
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                let prior = sub.inner.borrow().cell_value(0, ndx);
                observer.list_erase(
                    &table,
                    &pk,
                    &field,
                    ndx as u32,
                    prior.as_ref(),
                    prior_size as u32,
                )?;
            }
        }
        sub.delete_row(ndx)
    }

    pub fn list_move(&self, col: usize, row: usize, from: usize, to: usize) -> Result<()> {
        let sub = self.get_table(col, row)?;
        let prior_size = sub.row_count();
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                observer.list_move(&table, &pk, &field, from as u32, to as u32, prior_size as u32)?;
            }
        }
        let value = sub
            .inner
            .borrow()
            .cell_value(0, from)
            .expect("collection cells hold scalar values");
        sub.delete_row(from)?;
        sub.insert_row(to)?;
        sub.set_collection_value(to, &value)
    }

    pub fn list_clear(&self, col: usize, row: usize) -> Result<()> {
        let sub = self.get_table(col, row)?;
        let prior_size = sub.row_count();
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                let items: Vec<MixedValue> = (0..prior_size)
                    .filter_map(|i| sub.inner.borrow().cell_value(0, i))
                    .collect();
                observer.list_clear(&table, &pk, &field, prior_size as u32, &items)?;
            }
        }
        sub.clear()
    }

    /// Insert into an unordered-set cell; a present value is a no-op.
    pub fn insert_into_set(&self, col: usize, row: usize, value: &MixedValue) -> Result<bool> {
        let sub = self.get_table(col, row)?;
        if sub.find_collection_value(value).is_some() {
            return Ok(false);
        }
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                observer.set_insert(&table, &pk, &field, value)?;
            }
        }
        let ndx = sub.row_count();
        sub.insert_row(ndx)?;
        sub.set_collection_value(ndx, value)?;
        Ok(true)
    }

    /// Erase from an unordered-set cell; an absent value is a no-op.
    pub fn erase_from_set(&self, col: usize, row: usize, value: &MixedValue) -> Result<bool> {
        let sub = self.get_table(col, row)?;
        let Some(ndx) = sub.find_collection_value(value) else {
            return Ok(false);
        };
        {
            let inner = self.inner.borrow();
            if let Some((observer, table, pk)) = inner.record_ctx(row) {
                let field = inner.spec().column_name(col);
                observer.set_erase(&table, &pk, &field, value)?;
            }
        }
        sub.delete_row(ndx)?;
        Ok(true)
    }

    /// Write the single `value` column of a collection row. A value of
    /// the wrong element type is rejected at this boundary: it can only
    /// come from a malformed changeset.
    fn set_collection_value(&self, ndx: usize, value: &MixedValue) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match (&mut inner.cols[0], value) {
            (ColumnAccessor::Int(c), MixedValue::Int(v)) => c.set(ndx, *v),
            (ColumnAccessor::Bool(c), MixedValue::Bool(v)) => c.set(ndx, i64::from(*v)),
            (ColumnAccessor::Date(c), MixedValue::Date(v)) => c.set(ndx, *v),
            (ColumnAccessor::String(c), MixedValue::String(v)) => c.set(ndx, v),
            (ColumnAccessor::StringEnum(c), MixedValue::String(v)) => c.set(ndx, v),
            (ColumnAccessor::Binary(c), MixedValue::Binary(v)) => c.set(ndx, v),
            (ColumnAccessor::Mixed(c), v) => c.set(ndx, v),
            _ => Err(crate::error::Error::bad_changeset(
                "collection element type does not match the column",
            )),
        }
    }

    fn find_collection_value(&self, value: &MixedValue) -> Option<usize> {
        let inner = self.inner.borrow();
        match (inner.cols.first()?, value) {
            (ColumnAccessor::Int(c), MixedValue::Int(v)) => c.find_first(*v, 0, usize::MAX),
            (ColumnAccessor::Bool(c), MixedValue::Bool(v)) => {
                c.find_first(i64::from(*v), 0, usize::MAX)
            }
            (ColumnAccessor::Date(c), MixedValue::Date(v)) => c.find_first(*v, 0, usize::MAX),
            (ColumnAccessor::String(c), MixedValue::String(v)) => c.find_first(v, 0, usize::MAX),
            (ColumnAccessor::StringEnum(c), MixedValue::String(v)) => {
                c.find_first(v, 0, usize::MAX)
            }
            (ColumnAccessor::Binary(c), MixedValue::Binary(v)) => c.find_first(v, 0, usize::MAX),
            (ColumnAccessor::Mixed(c), v) => c.find_first(v, 0, usize::MAX),
            _ => None,
        }
    }
}
