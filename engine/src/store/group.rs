//! The group: the outer container of a database. Owns the allocator,
//! the registry of top-level tables, and the history compartment the
//! sync engine stores changesets in.
//!
//! # File format
//!
//! A committed file is a 24-byte header followed by the slab space:
//!
//! ```text
//! 0..4   magic "TIDE"
//! 4..8   file format version (little-endian u32)
//! 8..16  top array ref (little-endian u64)
//! 16..24 file size in bytes (little-endian u64)
//! ```
//!
//! The group's top array holds `[table names, table refs, history kind,
//! history schema version, history ref]`. On open the whole file image
//! is attached read-only; every mutation copies on write, so a crashed
//! transaction leaves the committed file untouched. Commit rewrites the
//! image to a temporary file and renames it into place.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::debug;

use crate::error::{Error, Result};
use crate::store::alloc::{Ref, SharedAlloc, SlabAlloc};
use crate::store::array::{
    self, Array, ArrayKind, ArrayParent, ParentLink, SharedArray, WidthType,
};
use crate::store::column::StringColumn;
use crate::store::observer::MutationObserver;
use crate::store::spec::ColumnType;
use crate::store::table::Table;

const MAGIC: &[u8; 4] = b"TIDE";
const FILE_FORMAT_VERSION: u32 = 1;
const FILE_HEADER_SIZE: usize = 24;

/// The recognized history compartment layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    /// No history is kept.
    None = 0,
    /// Local-only continuous transactions.
    Local = 1,
    /// A synchronized client file.
    SyncClient = 2,
    /// A server-side file with a client registry.
    SyncServer = 3,
}

impl HistoryKind {
    fn from_tag(tag: i64) -> Result<HistoryKind> {
        Ok(match tag {
            0 => HistoryKind::None,
            1 => HistoryKind::Local,
            2 => HistoryKind::SyncClient,
            3 => HistoryKind::SyncServer,
            _ => return Err(Error::corruption(format!("unknown history kind {}", tag))),
        })
    }
}

/// One entry of the server-side client file registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientFileEntry {
    pub ident_salt: i64,
    pub client_version: i64,
    pub reciprocal_base_version: i64,
    pub proxy_file: i64,
    pub client_type: i64,
    pub last_seen_timestamp: i64,
    pub locked_server_version: i64,
}

/// The root seam: the group records the current top ref through it when
/// the top array itself copies on write.
struct TopRoot {
    top_ref: Cell<Ref>,
}

impl ArrayParent for TopRoot {
    fn update_child_ref(&self, _child_index: usize, new_ref: Ref) -> Result<()> {
        self.top_ref.set(new_ref);
        Ok(())
    }

    fn child_ref(&self, _child_index: usize) -> Ref {
        self.top_ref.get()
    }
}

// Top array slots.
const SLOT_NAMES: usize = 0;
const SLOT_TABLES: usize = 1;
const SLOT_HISTORY_KIND: usize = 2;
const SLOT_HISTORY_VERSION: usize = 3;
const SLOT_HISTORY: usize = 4;

// History array slots.
const HIST_CHANGESETS: usize = 0;
const HIST_LAST_VERSION: usize = 1;
const HIST_RECIPROCALS: usize = 2;
const HIST_CLIENT_FILES: usize = 3;

/// The outer container. See the module docs for the layout.
pub struct Group {
    alloc: SharedAlloc,
    path: Option<PathBuf>,
    top: SharedArray,
    names: RefCell<StringColumn>,
    tables: SharedArray,
    top_root: Rc<TopRoot>,
    committed_top: Cell<Ref>,
    cached: RefCell<HashMap<String, Table>>,
    observer: RefCell<Option<Rc<dyn MutationObserver>>>,
}

impl Group {
    /// An empty in-memory group.
    pub fn new_in_memory() -> Result<Group> {
        let alloc: SharedAlloc = Rc::new(SlabAlloc::new(8));
        Group::initialize(alloc, None)
    }

    /// Create a new file-backed group. The file is written on the first
    /// commit.
    pub fn create(path: impl AsRef<Path>) -> Result<Group> {
        let alloc: SharedAlloc = Rc::new(SlabAlloc::new(FILE_HEADER_SIZE));
        Group::initialize(alloc, Some(path.as_ref().to_path_buf()))
    }

    /// Open a committed group file.
    pub fn open(path: impl AsRef<Path>) -> Result<Group> {
        let data = std::fs::read(path.as_ref())?;
        if data.len() < FILE_HEADER_SIZE || &data[0..4] != MAGIC {
            return Err(Error::corruption("not a database file"));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().expect("sliced four bytes"));
        if version != FILE_FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported file format version {}",
                version
            )));
        }
        let top_ref = u64::from_le_bytes(data[8..16].try_into().expect("sliced eight bytes"));
        let size = u64::from_le_bytes(data[16..24].try_into().expect("sliced eight bytes"));
        if size as usize != data.len() {
            return Err(Error::corruption("file size does not match the header"));
        }
        if top_ref == 0 || top_ref as usize >= data.len() {
            return Err(Error::corruption("top ref out of bounds"));
        }

        let alloc: SharedAlloc = Rc::new(SlabAlloc::attach_image(data));
        let top_ref = Ref::new(top_ref as usize);
        let top_root = Rc::new(TopRoot {
            top_ref: Cell::new(top_ref),
        });
        let (top, names, tables) = Group::attach_state(&alloc, top_ref, &top_root)?;
        debug!(
            "opened group at {:?}: {} table(s)",
            path.as_ref(),
            names.len()
        );
        Ok(Group {
            alloc,
            path: Some(path.as_ref().to_path_buf()),
            top,
            names: RefCell::new(names),
            tables,
            top_root,
            committed_top: Cell::new(top_ref),
            cached: RefCell::new(HashMap::new()),
            observer: RefCell::new(None),
        })
    }

    fn initialize(alloc: SharedAlloc, path: Option<PathBuf>) -> Result<Group> {
        let names = StringColumn::new(alloc.clone())?;
        let tables = SharedArray::new(alloc.clone(), ArrayKind::HasRefs)?;
        let top = SharedArray::new(alloc.clone(), ArrayKind::HasRefs)?;
        top.add(names.root_ref().to_slot())?;
        top.add(tables.ref_().to_slot())?;
        top.add(array::tag_value(HistoryKind::None as i64))?;
        top.add(array::tag_value(0))?; // history schema version
        top.add(Ref::NULL.to_slot())?; // history compartment

        let top_root = Rc::new(TopRoot {
            top_ref: Cell::new(top.ref_()),
        });
        top.set_parent(Some(ParentLink::new(top_root.clone(), 0)));
        names.set_parent(Some(top.parent_link(SLOT_NAMES)));
        tables.set_parent(Some(top.parent_link(SLOT_TABLES)));

        // The initial state counts as committed: every later mutation
        // copies on write, which is what makes rollback trivial.
        alloc.freeze_all();
        let committed = top.ref_();
        Ok(Group {
            alloc,
            path,
            top,
            names: RefCell::new(names),
            tables,
            top_root,
            committed_top: Cell::new(committed),
            cached: RefCell::new(HashMap::new()),
            observer: RefCell::new(None),
        })
    }

    fn attach_state(
        alloc: &SharedAlloc,
        top_ref: Ref,
        top_root: &Rc<TopRoot>,
    ) -> Result<(SharedArray, StringColumn, SharedArray)> {
        let top = SharedArray::attach(alloc.clone(), top_ref)?;
        if top.len() < 5 {
            return Err(Error::corruption("group top array is too short"));
        }
        top.set_parent(Some(ParentLink::new(top_root.clone(), 0)));
        let names = StringColumn::attach(alloc.clone(), top.get_as_ref(SLOT_NAMES))?;
        names.set_parent(Some(top.parent_link(SLOT_NAMES)));
        let tables = SharedArray::attach(alloc.clone(), top.get_as_ref(SLOT_TABLES))?;
        tables.set_parent(Some(top.parent_link(SLOT_TABLES)));
        Ok((top, names, tables))
    }

    pub(crate) fn alloc(&self) -> SharedAlloc {
        self.alloc.clone()
    }

    /// The currently attached replication observer.
    pub(crate) fn observer_handle(&self) -> Option<Rc<dyn MutationObserver>> {
        self.observer.borrow().clone()
    }

    /// Attach the replication observer. Freshly fetched tables report
    /// their mutations through it.
    pub(crate) fn set_observer(&self, observer: Option<Rc<dyn MutationObserver>>) {
        *self.observer.borrow_mut() = observer.clone();
        for (name, table) in self.cached.borrow().iter() {
            table.set_sync_meta(name, observer.clone(), table.pk_col());
        }
    }

    // ---- tables ----

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn table_names(&self) -> Vec<String> {
        let names = self.names.borrow();
        (0..names.len()).map(|i| names.get(i)).collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.names.borrow().find_first(name, 0, usize::MAX).is_some()
    }

    /// Create a new top-level table without a primary key.
    pub fn add_table(&self, name: &str) -> Result<Table> {
        assert!(!self.has_table(name), "table '{}' already exists", name);
        let table = Table::create_top_level(self.alloc.clone())?;
        self.hook_table(name, &table)?;
        table.set_sync_meta(name, self.observer.borrow().clone(), None);
        Ok(table)
    }

    /// Create a new top-level table keyed by a primary-key column. The
    /// key type must be int or string.
    pub fn add_table_with_primary_key(
        &self,
        name: &str,
        pk_field: &str,
        pk_type: ColumnType,
    ) -> Result<Table> {
        assert!(
            matches!(pk_type, ColumnType::Int | ColumnType::String),
            "primary keys are integers or strings"
        );
        assert!(!self.has_table(name), "table '{}' already exists", name);
        if let Some(observer) = self.observer.borrow().as_ref() {
            observer.add_table(name, pk_field, pk_type)?;
        }
        let table = Table::create_top_level(self.alloc.clone())?;
        self.hook_table(name, &table)?;
        // The key column itself is schema, not a recorded user column.
        table.set_sync_meta(name, None, None);
        let pk_col = table.add_column(pk_type, pk_field)?;
        table.persist_pk_col(pk_col)?;
        table.set_sync_meta(name, self.observer.borrow().clone(), Some(pk_col));
        Ok(table)
    }

    fn hook_table(&self, name: &str, table: &Table) -> Result<()> {
        let pos = self.tables.len();
        self.tables.add(table.top_ref().to_slot())?;
        table.set_top_parent(Some(self.tables.parent_link(pos)));
        self.names.borrow_mut().add(name)?;
        self.cached
            .borrow_mut()
            .insert(name.to_string(), table.clone());
        Ok(())
    }

    /// Fetch a table accessor by name.
    pub fn table(&self, name: &str) -> Option<Table> {
        if let Some(table) = self.cached.borrow().get(name) {
            if !table.is_detached() {
                return Some(table.clone());
            }
        }
        let pos = self.names.borrow().find_first(name, 0, usize::MAX)?;
        let top_ref = self.tables.get_as_ref(pos);
        let table = Table::attach_top_level(self.alloc.clone(), top_ref).ok()?;
        table.set_top_parent(Some(self.tables.parent_link(pos)));
        table.set_sync_meta(name, self.observer.borrow().clone(), table.pk_col());
        self.cached
            .borrow_mut()
            .insert(name.to_string(), table.clone());
        Some(table)
    }

    pub fn get_or_add_table(&self, name: &str) -> Result<Table> {
        match self.table(name) {
            Some(table) => Ok(table),
            None => self.add_table(name),
        }
    }

    /// Remove a table and destroy its storage.
    pub fn remove_table(&self, name: &str) -> Result<()> {
        let pos = self
            .names
            .borrow()
            .find_first(name, 0, usize::MAX)
            .unwrap_or_else(|| panic!("table '{}' does not exist", name));
        if let Some(observer) = self.observer.borrow().as_ref() {
            observer.erase_table(name)?;
        }
        if let Some(table) = self.cached.borrow_mut().remove(name) {
            table.set_top_parent(None);
            table.detach();
        }
        let top_ref = self.tables.get_as_ref(pos);
        array::destroy_subtree(&self.alloc, top_ref);
        self.tables.erase(pos)?;
        self.names.borrow_mut().erase(pos)?;
        // Tables after the removed slot shift down.
        for (other_name, table) in self.cached.borrow().iter() {
            if let Some(other_pos) = self.names.borrow().find_first(other_name, 0, usize::MAX) {
                if other_pos >= pos {
                    table.adjust_top_parent_index(-1);
                }
            }
        }
        Ok(())
    }

    // ---- history compartment ----

    pub fn history_kind(&self) -> HistoryKind {
        HistoryKind::from_tag(array::untag_value(self.top.get(SLOT_HISTORY_KIND)))
            .expect("corrupt history kind")
    }

    pub fn history_schema_version(&self) -> i64 {
        array::untag_value(self.top.get(SLOT_HISTORY_VERSION))
    }

    /// Declare the history layout of this file. Allowed once, or again
    /// with the same kind.
    pub fn set_history_kind(&self, kind: HistoryKind, schema_version: i64) -> Result<()> {
        let current = self.history_kind();
        assert!(
            current == HistoryKind::None || current == kind,
            "history kind cannot change from {:?} to {:?}",
            current,
            kind
        );
        self.top
            .set(SLOT_HISTORY_KIND, array::tag_value(kind as i64))?;
        self.top
            .set(SLOT_HISTORY_VERSION, array::tag_value(schema_version))
    }

    /// Attach (creating on demand) the history arrays.
    fn history(&self) -> Result<(SharedArray, SharedArray, SharedArray, SharedArray)> {
        let hist_ref = self.top.get_as_ref(SLOT_HISTORY);
        let hist = if hist_ref.is_null() {
            let changesets = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
            let reciprocals = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
            let client_files = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
            let hist = SharedArray::new(self.alloc.clone(), ArrayKind::HasRefs)?;
            hist.add(changesets.ref_().to_slot())?;
            hist.add(array::tag_value(0))?;
            hist.add(reciprocals.ref_().to_slot())?;
            hist.add(client_files.ref_().to_slot())?;
            self.top.set(SLOT_HISTORY, hist.ref_().to_slot())?;
            hist
        } else {
            SharedArray::attach(self.alloc.clone(), hist_ref)?
        };
        hist.set_parent(Some(self.top.parent_link(SLOT_HISTORY)));
        let changesets = SharedArray::attach(self.alloc.clone(), hist.get_as_ref(HIST_CHANGESETS))?;
        changesets.set_parent(Some(hist.parent_link(HIST_CHANGESETS)));
        let reciprocals =
            SharedArray::attach(self.alloc.clone(), hist.get_as_ref(HIST_RECIPROCALS))?;
        reciprocals.set_parent(Some(hist.parent_link(HIST_RECIPROCALS)));
        let client_files =
            SharedArray::attach(self.alloc.clone(), hist.get_as_ref(HIST_CLIENT_FILES))?;
        client_files.set_parent(Some(hist.parent_link(HIST_CLIENT_FILES)));
        Ok((hist, changesets, reciprocals, client_files))
    }

    /// Append an encoded changeset; returns the new history version.
    pub fn history_append_changeset(&self, bytes: &[u8]) -> Result<u64> {
        let (hist, changesets, reciprocals, _) = self.history()?;
        let mut blob = Array::new_with_type(self.alloc.clone(), ArrayKind::Leaf, WidthType::Ignore)?;
        blob.blob_append(bytes)?;
        let pos = changesets.len();
        changesets.add(blob.ref_().to_slot())?;
        reciprocals.add(Ref::NULL.to_slot())?;
        let version = array::untag_value(hist.get(HIST_LAST_VERSION)) + 1;
        hist.set(HIST_LAST_VERSION, array::tag_value(version))?;
        debug_assert_eq!(pos + 1, version as usize);
        Ok(version as u64)
    }

    pub fn history_changeset_count(&self) -> usize {
        if self.top.get_as_ref(SLOT_HISTORY).is_null() {
            return 0;
        }
        let (_, changesets, _, _) = self.history().expect("history unreadable");
        changesets.len()
    }

    /// The encoded changeset at 0-based history position `ndx`.
    pub fn history_changeset(&self, ndx: usize) -> Result<Vec<u8>> {
        let (_, changesets, _, _) = self.history()?;
        let blob = Array::attach(self.alloc.clone(), changesets.get_as_ref(ndx))?;
        Ok(blob.blob_read(0, blob.blob_len()))
    }

    /// Store the reciprocal transform for history position `ndx`.
    pub fn set_reciprocal(&self, ndx: usize, bytes: &[u8]) -> Result<()> {
        let (_, _, reciprocals, _) = self.history()?;
        let old = reciprocals.get_as_ref(ndx);
        if !old.is_null() {
            array::destroy_subtree(&self.alloc, old);
        }
        let mut blob = Array::new_with_type(self.alloc.clone(), ArrayKind::Leaf, WidthType::Ignore)?;
        blob.blob_append(bytes)?;
        reciprocals.set(ndx, blob.ref_().to_slot())
    }

    pub fn reciprocal(&self, ndx: usize) -> Result<Option<Vec<u8>>> {
        let (_, _, reciprocals, _) = self.history()?;
        let r = reciprocals.get_as_ref(ndx);
        if r.is_null() {
            return Ok(None);
        }
        let blob = Array::attach(self.alloc.clone(), r)?;
        Ok(Some(blob.blob_read(0, blob.blob_len())))
    }

    /// Drop every cached reciprocal. Required after a failed merge so
    /// partially transformed state cannot leak into the next attempt.
    pub fn clear_reciprocals(&self) -> Result<()> {
        if self.top.get_as_ref(SLOT_HISTORY).is_null() {
            return Ok(());
        }
        let (_, _, reciprocals, _) = self.history()?;
        for ndx in 0..reciprocals.len() {
            let r = reciprocals.get_as_ref(ndx);
            if !r.is_null() {
                array::destroy_subtree(&self.alloc, r);
                reciprocals.set(ndx, Ref::NULL.to_slot())?;
            }
        }
        Ok(())
    }

    // ---- client file registry (server-side files) ----

    pub fn add_client_file(&self, entry: &ClientFileEntry) -> Result<usize> {
        debug_assert_eq!(self.history_kind(), HistoryKind::SyncServer);
        let (_, _, _, client_files) = self.history()?;
        let mut record = Array::new(self.alloc.clone(), ArrayKind::Leaf)?;
        for v in [
            entry.ident_salt,
            entry.client_version,
            entry.reciprocal_base_version,
            entry.proxy_file,
            entry.client_type,
            entry.last_seen_timestamp,
            entry.locked_server_version,
        ] {
            record.add(v)?;
        }
        let pos = client_files.len();
        client_files.add(record.ref_().to_slot())?;
        Ok(pos)
    }

    pub fn client_file_count(&self) -> usize {
        if self.top.get_as_ref(SLOT_HISTORY).is_null() {
            return 0;
        }
        let (_, _, _, client_files) = self.history().expect("history unreadable");
        client_files.len()
    }

    pub fn client_file(&self, ndx: usize) -> Result<ClientFileEntry> {
        let (_, _, _, client_files) = self.history()?;
        let record = Array::attach(self.alloc.clone(), client_files.get_as_ref(ndx))?;
        Ok(ClientFileEntry {
            ident_salt: record.get(0),
            client_version: record.get(1),
            reciprocal_base_version: record.get(2),
            proxy_file: record.get(3),
            client_type: record.get(4),
            last_seen_timestamp: record.get(5),
            locked_server_version: record.get(6),
        })
    }

    pub fn update_client_file(&self, ndx: usize, entry: &ClientFileEntry) -> Result<()> {
        let (_, _, _, client_files) = self.history()?;
        let mut record = Array::attach(self.alloc.clone(), client_files.get_as_ref(ndx))?;
        record.set_parent(Some(client_files.parent_link(ndx)));
        for (i, v) in [
            entry.ident_salt,
            entry.client_version,
            entry.reciprocal_base_version,
            entry.proxy_file,
            entry.client_type,
            entry.last_seen_timestamp,
            entry.locked_server_version,
        ]
        .into_iter()
        .enumerate()
        {
            record.set(i, v)?;
        }
        Ok(())
    }

    // ---- transactions ----

    /// Make the accumulated state durable. File-backed groups rewrite
    /// the image atomically; afterwards every touched region is
    /// read-only and the next write transaction copies on write.
    pub fn commit(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let mut image = self.alloc.build_image();
            let top_ref = self.top_root.top_ref.get();
            image[0..4].copy_from_slice(MAGIC);
            image[4..8].copy_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
            image[8..16].copy_from_slice(&(top_ref.offset() as u64).to_le_bytes());
            let image_len = image.len() as u64;
            image[16..24].copy_from_slice(&image_len.to_le_bytes());

            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &image)?;
            std::fs::rename(&tmp, path)?;
            debug!("committed {} bytes to {:?}", image.len(), path);
        }
        self.alloc.freeze_all();
        self.committed_top.set(self.top_root.top_ref.get());
        Ok(())
    }

    /// Discard everything since the last commit. Live table accessors
    /// are detached; fetch them again to keep working.
    pub fn rollback(&mut self) -> Result<()> {
        self.alloc.discard_live();
        for (_, table) in self.cached.borrow_mut().drain() {
            table.detach();
        }
        let committed = self.committed_top.get();
        self.top_root.top_ref.set(committed);
        let (top, names, tables) = Group::attach_state(&self.alloc, committed, &self.top_root)?;
        self.top = top;
        self.names = RefCell::new(names);
        self.tables = tables;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::spec::ColumnType;

    #[test]
    fn tables_are_registered_and_cached() {
        // Given
        let group = Group::new_in_memory().unwrap();

        // When
        let people = group.add_table("people").unwrap();
        people.add_column(ColumnType::Int, "age").unwrap();

        // Then
        assert!(group.has_table("people"));
        assert_eq!(group.table_names(), vec!["people".to_string()]);
        let again = group.table("people").unwrap();
        let row = again.add_row().unwrap();
        again.set_int(0, row, 9).unwrap();
        assert_eq!(people.get_int(0, row), 9, "accessors share storage");
    }

    #[test]
    fn commit_and_reopen_round_trip() {
        // Given
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.tide");
        {
            let group = Group::create(&path).unwrap();
            let people = group.add_table("people").unwrap();
            let age = people.add_column(ColumnType::Int, "age").unwrap();
            let name = people.add_column(ColumnType::String, "name").unwrap();
            let row = people.add_row().unwrap();
            people.set_int(age, row, 41).unwrap();
            people.set_string(name, row, "Grace").unwrap();
            group.commit().unwrap();
        }

        // When
        let group = Group::open(&path).unwrap();

        // Then
        let people = group.table("people").unwrap();
        assert_eq!(people.row_count(), 1);
        assert_eq!(people.get_int(0, 0), 41);
        assert_eq!(people.get_string(1, 0), "Grace");
    }

    #[test]
    fn mutations_after_commit_copy_on_write() {
        // Given
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cow.tide");
        let group = Group::create(&path).unwrap();
        let t = group.add_table("t").unwrap();
        let a = t.add_column(ColumnType::Int, "a").unwrap();
        let row = t.add_row().unwrap();
        t.set_int(a, row, 1).unwrap();
        group.commit().unwrap();

        // When - mutate the committed state, commit again, reopen.
        t.set_int(a, row, 2).unwrap();
        group.commit().unwrap();

        // Then
        let reopened = Group::open(&path).unwrap();
        assert_eq!(reopened.table("t").unwrap().get_int(a, row), 2);
    }

    #[test]
    fn rollback_discards_uncommitted_changes() {
        // Given
        let mut group = Group::new_in_memory().unwrap();
        let t = group.add_table("t").unwrap();
        let a = t.add_column(ColumnType::Int, "a").unwrap();
        let row = t.add_row().unwrap();
        t.set_int(a, row, 1).unwrap();
        group.commit().unwrap();

        // When - mutate and roll back.
        t.set_int(a, row, 99).unwrap();
        group.rollback().unwrap();

        // Then - the accessor was torn down; a fresh one sees the
        // committed value.
        assert!(t.is_detached());
        let t = group.table("t").unwrap();
        assert_eq!(t.get_int(a, row), 1);
    }

    #[test]
    fn remove_table_destroys_and_unregisters() {
        // Given
        let group = Group::new_in_memory().unwrap();
        group.add_table("a").unwrap();
        let b = group.add_table("b").unwrap();
        b.add_column(ColumnType::Int, "x").unwrap();

        // When
        group.remove_table("a").unwrap();

        // Then
        assert!(!group.has_table("a"));
        assert!(group.has_table("b"));
        let b = group.table("b").unwrap();
        b.add_row().unwrap();
        assert_eq!(b.row_count(), 1);
    }

    #[test]
    fn history_stores_changesets_and_reciprocals() {
        // Given
        let group = Group::new_in_memory().unwrap();
        group.set_history_kind(HistoryKind::SyncClient, 1).unwrap();

        // When
        let v1 = group.history_append_changeset(b"first").unwrap();
        let v2 = group.history_append_changeset(b"second").unwrap();

        // Then
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(group.history_changeset_count(), 2);
        assert_eq!(group.history_changeset(0).unwrap(), b"first");
        assert_eq!(group.history_changeset(1).unwrap(), b"second");

        // Reciprocal transforms ride alongside.
        assert_eq!(group.reciprocal(0).unwrap(), None);
        group.set_reciprocal(0, b"recip").unwrap();
        assert_eq!(group.reciprocal(0).unwrap().as_deref(), Some(&b"recip"[..]));
        group.clear_reciprocals().unwrap();
        assert_eq!(group.reciprocal(0).unwrap(), None);
    }

    #[test]
    fn client_file_registry_round_trip() {
        // Given
        let group = Group::new_in_memory().unwrap();
        group.set_history_kind(HistoryKind::SyncServer, 1).unwrap();
        let entry = ClientFileEntry {
            ident_salt: 11,
            client_version: 5,
            reciprocal_base_version: 4,
            proxy_file: 0,
            client_type: 2,
            last_seen_timestamp: 1_700_000_000,
            locked_server_version: 3,
        };

        // When
        let ndx = group.add_client_file(&entry).unwrap();
        let mut updated = entry;
        updated.client_version = 6;
        group.update_client_file(ndx, &updated).unwrap();

        // Then
        assert_eq!(group.client_file_count(), 1);
        assert_eq!(group.client_file(ndx).unwrap(), updated);
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, b"not a database at all").unwrap();

        let err = match Group::open(&path) {
            Err(e) => e,
            Ok(_) => panic!("expected open to fail"),
        };
        assert!(matches!(err, Error::Corruption(_)));
    }
}
