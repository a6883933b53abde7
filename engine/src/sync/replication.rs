//! The replication layer: records every observed mutation as an
//! instruction in the transaction's changeset, and drives the
//! commit-side handshake (`initiate_transact` / `prepare_commit` /
//! `finalize_commit`).
//!
//! The recorder captures displaced state (prior payloads, prior
//! schema) alongside each instruction so the produced log is
//! reversible.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::error::Result;
use crate::store::group::{Group, HistoryKind};
use crate::store::observer::{CollectionKind, MutationObserver, PkValue};
use crate::store::spec::ColumnType;
use crate::store::MixedValue;
use crate::sync::changeset::Changeset;
use crate::sync::encode::encode_changeset;
use crate::sync::instruction::{
    AddColumn, AddInteger, AddSearchIndex, AddTable, ArrayErase, ArrayInsert, ArrayMove, Clear,
    CollectionType, CreateObject, EraseObject, EraseTable, Instruction, Path, PathElement,
    Payload, PayloadType, PrimaryKey, RemoveSearchIndex, RenameColumn, SetErase, SetInsert,
    TableType, Update,
};

/// The commit-side interface of a replication plugin.
pub trait Replication {
    /// Begin a write transaction at the given version.
    fn initiate_transact(&self, version: u64) -> Result<()>;

    /// Encode the accumulated changeset and append it to the group's
    /// history. Returns the new history version.
    fn prepare_commit(&self, group: &Group) -> Result<u64>;

    /// The commit succeeded; start a fresh changeset.
    fn finalize_commit(&self) -> Result<()>;

    /// The transaction was abandoned; drop the accumulated changeset.
    fn abort_transact(&self);

    /// The encoded bytes of the not-yet-committed changeset.
    fn get_uncommitted_changes(&self) -> Vec<u8>;
}

struct RecorderState {
    changeset: Changeset,
    prepared_version: Option<u64>,
}

/// The synchronization recorder. Attach it to a group to have every
/// mutation of primary-keyed tables accumulate into a changeset.
pub struct SyncReplication {
    state: RefCell<RecorderState>,
    file_ident: u64,
}

impl SyncReplication {
    pub fn new(file_ident: u64) -> Rc<SyncReplication> {
        Rc::new(SyncReplication {
            state: RefCell::new(RecorderState {
                changeset: Changeset::with_origin(0, file_ident),
                prepared_version: None,
            }),
            file_ident,
        })
    }

    /// Wire the recorder into a group as its mutation observer.
    pub fn attach(self: &Rc<Self>, group: &Group) {
        group.set_observer(Some(self.clone()));
    }

    /// Stamp the origin timestamp used for merge tie-breaking. Usually
    /// advanced once per transaction.
    pub fn set_origin_timestamp(&self, timestamp: i64) {
        self.state.borrow_mut().changeset.origin_timestamp = timestamp;
    }

    /// The version of the last integrated remote changeset, recorded in
    /// every produced changeset.
    pub fn set_last_integrated_remote_version(&self, version: u64) {
        self.state
            .borrow_mut()
            .changeset
            .last_integrated_remote_version = version;
    }

    /// Run `f` over the in-progress changeset.
    pub fn with_changeset<R>(&self, f: impl FnOnce(&Changeset) -> R) -> R {
        f(&self.state.borrow().changeset)
    }

    /// Take the in-progress changeset, leaving a fresh one.
    pub fn take_changeset(&self) -> Changeset {
        let mut state = self.state.borrow_mut();
        let file_ident = self.file_ident;
        let timestamp = state.changeset.origin_timestamp;
        std::mem::replace(
            &mut state.changeset,
            Changeset::with_origin(timestamp, file_ident),
        )
    }

    fn record(&self, build: impl FnOnce(&mut Changeset) -> Instruction) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let instr = build(&mut state.changeset);
        state.changeset.push(instr);
        Ok(())
    }
}

fn intern_pk(cs: &mut Changeset, pk: &PkValue) -> PrimaryKey {
    match pk {
        PkValue::Int(v) => PrimaryKey::Int(*v),
        PkValue::String(s) => PrimaryKey::String(cs.intern_str(s)),
    }
}

fn intern_value(cs: &mut Changeset, value: &MixedValue) -> Payload {
    match value {
        MixedValue::Int(v) => Payload::Int(*v),
        MixedValue::Bool(v) => Payload::Bool(*v),
        MixedValue::Date(v) => Payload::Timestamp(crate::sync::instruction::Timestamp {
            seconds: *v,
            nanoseconds: 0,
        }),
        MixedValue::String(s) => {
            let s = cs.intern_str(s);
            Payload::String(s)
        }
        MixedValue::Binary(b) => {
            let b = cs.intern_string(b);
            Payload::Binary(b)
        }
        // A nested-table cell coming into existence is the
        // container-creation sentinel.
        MixedValue::Table => Payload::ObjectValue,
    }
}

fn intern_path(cs: &mut Changeset, table: &str, pk: &PkValue, field: &str) -> Path {
    let table = cs.intern_str(table);
    let object = intern_pk(cs, pk);
    let field = cs.intern_str(field);
    Path::new(table, object, field)
}

/// The payload type a stored column type maps to. A mixed column has no
/// single payload type; the null code stands in for it.
fn schema_payload_type(ty: ColumnType) -> PayloadType {
    match ty {
        ColumnType::Int => PayloadType::Int,
        ColumnType::Bool => PayloadType::Bool,
        ColumnType::Date => PayloadType::Timestamp,
        ColumnType::String => PayloadType::String,
        ColumnType::Binary => PayloadType::Binary,
        ColumnType::Mixed => PayloadType::Null,
        ColumnType::Table => PayloadType::ObjectValue,
    }
}

fn collection_type(kind: CollectionKind) -> CollectionType {
    match kind {
        CollectionKind::Single => CollectionType::Single,
        CollectionKind::List => CollectionType::List,
        CollectionKind::Set => CollectionType::Set,
        CollectionKind::Dictionary => CollectionType::Dictionary,
    }
}

impl MutationObserver for SyncReplication {
    fn add_table(&self, table: &str, pk_field: &str, pk_type: ColumnType) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let pk_field = cs.intern_str(pk_field);
            Instruction::AddTable(AddTable {
                table,
                ty: TableType::TopLevel {
                    pk_field,
                    pk_type: schema_payload_type(pk_type),
                    pk_nullable: false,
                },
            })
        })
    }

    fn erase_table(&self, table: &str) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            Instruction::EraseTable(EraseTable { table, prior: None })
        })
    }

    fn add_column(
        &self,
        table: &str,
        field: &str,
        ty: ColumnType,
        nullable: bool,
        collection: CollectionKind,
    ) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let field = cs.intern_str(field);
            Instruction::AddColumn(AddColumn {
                table,
                field,
                ty: schema_payload_type(ty),
                nullable,
                collection: collection_type(collection),
                link_target: None,
            })
        })
    }

    fn erase_column(
        &self,
        table: &str,
        field: &str,
        ty: ColumnType,
        nullable: bool,
        collection: CollectionKind,
    ) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let field = cs.intern_str(field);
            Instruction::EraseColumn(crate::sync::instruction::EraseColumn {
                table,
                field,
                prior: Some(crate::sync::instruction::ColumnSchema {
                    field,
                    ty: schema_payload_type(ty),
                    nullable,
                    collection: collection_type(collection),
                    link_target: None,
                }),
            })
        })
    }

    fn rename_column(&self, table: &str, field: &str, new_name: &str) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let field = cs.intern_str(field);
            let new_name = cs.intern_str(new_name);
            Instruction::RenameColumn(RenameColumn {
                table,
                field,
                new_name,
            })
        })
    }

    fn add_search_index(&self, table: &str, field: &str) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let field = cs.intern_str(field);
            Instruction::AddSearchIndex(AddSearchIndex { table, field })
        })
    }

    fn remove_search_index(&self, table: &str, field: &str) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let field = cs.intern_str(field);
            Instruction::RemoveSearchIndex(RemoveSearchIndex { table, field })
        })
    }

    fn create_object(&self, table: &str, pk: &PkValue) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let object = intern_pk(cs, pk);
            Instruction::CreateObject(CreateObject { table, object })
        })
    }

    fn erase_object(
        &self,
        table: &str,
        pk: &PkValue,
        prior_fields: &[(String, MixedValue)],
    ) -> Result<()> {
        self.record(|cs| {
            let table = cs.intern_str(table);
            let object = intern_pk(cs, pk);
            let prior_fields = prior_fields
                .iter()
                .map(|(field, value)| {
                    let field = cs.intern_str(field);
                    let value = intern_value(cs, value);
                    (field, value)
                })
                .collect();
            Instruction::EraseObject(EraseObject {
                table,
                object,
                prior_fields,
            })
        })
    }

    fn set_value(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        value: Option<&MixedValue>,
        prior: Option<&MixedValue>,
        is_default: bool,
    ) -> Result<()> {
        self.record(|cs| {
            let path = intern_path(cs, table, pk, field);
            let value = match value {
                Some(v) => intern_value(cs, v),
                None => Payload::Null,
            };
            let prior = prior.map(|p| intern_value(cs, p));
            Instruction::Update(Update {
                path,
                value,
                is_default,
                prior_size: 0,
                prior,
            })
        })
    }

    fn add_int(&self, table: &str, pk: &PkValue, field: &str, delta: i64) -> Result<()> {
        self.record(|cs| {
            let path = intern_path(cs, table, pk, field);
            Instruction::AddInteger(AddInteger { path, value: delta })
        })
    }

    fn list_insert(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        index: u32,
        value: &MixedValue,
        prior_size: u32,
    ) -> Result<()> {
        self.record(|cs| {
            let mut path = intern_path(cs, table, pk, field);
            path.elements.push(PathElement::Index(index));
            let value = intern_value(cs, value);
            Instruction::ArrayInsert(ArrayInsert {
                path,
                value,
                prior_size,
            })
        })
    }

    fn list_set(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        index: u32,
        value: &MixedValue,
        prior: Option<&MixedValue>,
        prior_size: u32,
    ) -> Result<()> {
        self.record(|cs| {
            let mut path = intern_path(cs, table, pk, field);
            path.elements.push(PathElement::Index(index));
            let value = intern_value(cs, value);
            let prior = prior.map(|p| intern_value(cs, p));
            Instruction::Update(Update {
                path,
                value,
                is_default: false,
                prior_size,
                prior,
            })
        })
    }

    fn list_move(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        from: u32,
        to: u32,
        prior_size: u32,
    ) -> Result<()> {
        self.record(|cs| {
            let mut path = intern_path(cs, table, pk, field);
            path.elements.push(PathElement::Index(from));
            Instruction::ArrayMove(ArrayMove {
                path,
                ndx_2: to,
                prior_size,
            })
        })
    }

    fn list_erase(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        index: u32,
        prior: Option<&MixedValue>,
        prior_size: u32,
    ) -> Result<()> {
        self.record(|cs| {
            let mut path = intern_path(cs, table, pk, field);
            path.elements.push(PathElement::Index(index));
            let prior = prior.map(|p| intern_value(cs, p));
            Instruction::ArrayErase(ArrayErase {
                path,
                prior_size,
                prior,
            })
        })
    }

    fn list_clear(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        prior_size: u32,
        prior_items: &[MixedValue],
    ) -> Result<()> {
        self.record(|cs| {
            let path = intern_path(cs, table, pk, field);
            let prior_items = prior_items.iter().map(|v| intern_value(cs, v)).collect();
            Instruction::Clear(Clear {
                path,
                prior_size,
                prior_items,
            })
        })
    }

    fn set_insert(&self, table: &str, pk: &PkValue, field: &str, value: &MixedValue) -> Result<()> {
        self.record(|cs| {
            let path = intern_path(cs, table, pk, field);
            let value = intern_value(cs, value);
            Instruction::SetInsert(SetInsert { path, value })
        })
    }

    fn set_erase(&self, table: &str, pk: &PkValue, field: &str, value: &MixedValue) -> Result<()> {
        self.record(|cs| {
            let path = intern_path(cs, table, pk, field);
            let value = intern_value(cs, value);
            Instruction::SetErase(SetErase { path, value })
        })
    }
}

impl Replication for SyncReplication {
    fn initiate_transact(&self, version: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.changeset.version = version;
        state.prepared_version = None;
        trace!("write transaction initiated at version {}", version);
        Ok(())
    }

    fn prepare_commit(&self, group: &Group) -> Result<u64> {
        if group.history_kind() == HistoryKind::None {
            group.set_history_kind(HistoryKind::SyncClient, 1)?;
        }
        let mut state = self.state.borrow_mut();
        let bytes = encode_changeset(&state.changeset);
        let version = group.history_append_changeset(&bytes)?;
        state.changeset.version = version;
        state.prepared_version = Some(version);
        trace!("prepared commit of version {} ({} bytes)", version, bytes.len());
        Ok(version)
    }

    fn finalize_commit(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        debug_assert!(state.prepared_version.is_some(), "finalize without prepare");
        let timestamp = state.changeset.origin_timestamp;
        let last_integrated = state.changeset.last_integrated_remote_version;
        state.changeset = Changeset::with_origin(timestamp, self.file_ident);
        state.changeset.last_integrated_remote_version = last_integrated;
        state.prepared_version = None;
        Ok(())
    }

    fn abort_transact(&self) {
        let mut state = self.state.borrow_mut();
        let timestamp = state.changeset.origin_timestamp;
        let last_integrated = state.changeset.last_integrated_remote_version;
        state.changeset = Changeset::with_origin(timestamp, self.file_ident);
        state.changeset.last_integrated_remote_version = last_integrated;
        state.prepared_version = None;
    }

    fn get_uncommitted_changes(&self) -> Vec<u8> {
        encode_changeset(&self.state.borrow().changeset)
    }
}
