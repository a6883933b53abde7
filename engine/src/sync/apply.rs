//! Replay of a (transformed) changeset onto a group.
//!
//! Schema instructions map to spec edits, object instructions locate
//! rows by primary key, list instructions address collection cells, and
//! set instructions keep their find-before-insert idempotence. The
//! observer is suspended for the duration so remote changes are not
//! re-recorded as local ones.
//!
//! Malformed targets raise `BadChangeset`; instructions aimed at
//! objects that no longer exist are skipped (their erasure won the
//! merge).

use log::trace;

use crate::error::{Error, Result};
use crate::store::group::Group;
use crate::store::observer::PkValue;
use crate::store::spec::ColumnType;
use crate::store::{CollectionKind, MixedValue, Table};
use crate::sync::changeset::Changeset;
use crate::sync::instruction::{
    CollectionType, Instruction, Path, Payload, PayloadType, PrimaryKey,
};

/// Apply every live instruction of `cs` to `group`.
pub fn apply_changeset(group: &Group, cs: &Changeset) -> Result<()> {
    let saved = group.observer_handle();
    group.set_observer(None);
    let result = apply_all(group, cs);
    group.set_observer(saved);
    result
}

fn apply_all(group: &Group, cs: &Changeset) -> Result<()> {
    for (_, instr) in cs.iter() {
        apply_instruction(group, cs, instr)?;
    }
    Ok(())
}

fn apply_instruction(group: &Group, cs: &Changeset, instr: &Instruction) -> Result<()> {
    match instr {
        Instruction::AddTable(i) => {
            let name = cs.string_str(i.table).into_owned();
            match &i.ty {
                crate::sync::instruction::TableType::TopLevel {
                    pk_field, pk_type, ..
                } => {
                    let pk_name = cs.string_str(*pk_field).into_owned();
                    let pk_ty = match pk_type {
                        PayloadType::Int => ColumnType::Int,
                        PayloadType::String => ColumnType::String,
                        _ => {
                            return Err(Error::bad_changeset(
                                "unsupported primary key type in AddTable",
                            ))
                        }
                    };
                    match group.table(&name) {
                        None => {
                            group.add_table_with_primary_key(&name, &pk_name, pk_ty)?;
                        }
                        Some(existing) => {
                            // Idempotent when the declarations agree.
                            let pk_col = existing.pk_col();
                            let matches = pk_col
                                .map(|col| {
                                    existing.column_name(col) == pk_name
                                        && existing.column_type(col) == pk_ty
                                })
                                .unwrap_or(false);
                            if !matches {
                                return Err(Error::schema_mismatch(format!(
                                    "table '{}' already exists with a different key",
                                    name
                                )));
                            }
                        }
                    }
                }
                crate::sync::instruction::TableType::Embedded => {
                    if group.table(&name).is_none() {
                        group.add_table(&name)?;
                    }
                }
            }
            Ok(())
        }
        Instruction::EraseTable(i) => {
            let name = cs.string_str(i.table).into_owned();
            if group.table(&name).is_some() {
                group.remove_table(&name)?;
            }
            Ok(())
        }
        Instruction::AddColumn(i) => {
            let table = table_for(group, cs, i.table)?;
            let field = cs.string_str(i.field).into_owned();
            if table.column_index(&field).is_some() {
                return Ok(());
            }
            let element = storage_type(i.ty)?;
            match i.collection {
                CollectionType::Single => {
                    table.add_column(element, &field)?;
                }
                CollectionType::List => {
                    table.add_collection_column(&field, element, CollectionKind::List)?;
                }
                CollectionType::Set => {
                    table.add_collection_column(&field, element, CollectionKind::Set)?;
                }
                CollectionType::Dictionary => {
                    return Err(Error::bad_changeset(
                        "dictionary columns are not supported by this store",
                    ));
                }
            }
            Ok(())
        }
        Instruction::EraseColumn(i) => {
            let table = table_for(group, cs, i.table)?;
            let field = cs.string_str(i.field).into_owned();
            if let Some(col) = table.column_index(&field) {
                table.erase_column(col)?;
            }
            Ok(())
        }
        Instruction::RenameColumn(i) => {
            let table = table_for(group, cs, i.table)?;
            let field = cs.string_str(i.field).into_owned();
            let new_name = cs.string_str(i.new_name).into_owned();
            if let Some(col) = table.column_index(&field) {
                table.rename_column(col, &new_name)?;
            }
            Ok(())
        }
        Instruction::AddSearchIndex(i) => {
            let table = table_for(group, cs, i.table)?;
            let field = cs.string_str(i.field).into_owned();
            match table.column_index(&field) {
                Some(col)
                    if matches!(
                        table.column_type(col),
                        ColumnType::Int | ColumnType::Bool | ColumnType::Date
                    ) =>
                {
                    table.set_index(col)?;
                }
                _ => trace!("ignoring search index on '{}'", field),
            }
            Ok(())
        }
        Instruction::RemoveSearchIndex(i) => {
            let table = table_for(group, cs, i.table)?;
            let field = cs.string_str(i.field).into_owned();
            if let Some(col) = table.column_index(&field) {
                if table.has_index(col) {
                    table.remove_index(col)?;
                }
            }
            Ok(())
        }
        Instruction::SetLinkType(_) => {
            // Link semantics live above this store's data model.
            trace!("ignoring SetLinkType");
            Ok(())
        }
        Instruction::CreateObject(i) => {
            let table = table_for(group, cs, i.table)?;
            if table.pk_col().is_none() {
                return Err(Error::bad_changeset(
                    "CreateObject against a table without a primary key",
                ));
            }
            let pk = pk_value(cs, &i.object)?;
            table.create_object(&pk)?;
            Ok(())
        }
        Instruction::EraseObject(i) => {
            let table = table_for(group, cs, i.table)?;
            let pk = pk_value(cs, &i.object)?;
            table.erase_object(&pk)?;
            Ok(())
        }
        Instruction::Update(i) => {
            let Some((table, row, col)) = resolve_field(group, cs, &i.path)? else {
                return Ok(());
            };
            if i.path.elements.is_empty() {
                set_cell(&table, col, row, cs, &i.value)
            } else if i.path.is_array_path() {
                if table.column_type(col) != ColumnType::Table {
                    return Err(Error::bad_changeset("array update on a non-collection column"));
                }
                let ndx = i.path.index() as usize;
                let size = table.list_size(col, row)?;
                if ndx >= size {
                    return Err(Error::bad_changeset("array update out of bounds"));
                }
                let value = to_mixed(cs, &i.value)?;
                table.list_set(col, row, ndx, &value)
            } else {
                trace!("ignoring dictionary-addressed update");
                Ok(())
            }
        }
        Instruction::AddInteger(i) => {
            let Some((table, row, col)) = resolve_field(group, cs, &i.path)? else {
                return Ok(());
            };
            if table.column_type(col) != ColumnType::Int {
                return Err(Error::bad_changeset("integer add on a non-integer column"));
            }
            table.add_int(col, row, i.value)
        }
        Instruction::ArrayInsert(i) => {
            let Some((table, row, col)) = resolve_collection(group, cs, &i.path)? else {
                return Ok(());
            };
            let ndx = i.path.index() as usize;
            let size = table.list_size(col, row)?;
            if ndx > size {
                return Err(Error::bad_changeset("array insert out of bounds"));
            }
            let value = to_mixed(cs, &i.value)?;
            table.list_insert(col, row, ndx, &value)
        }
        Instruction::ArrayMove(i) => {
            let Some((table, row, col)) = resolve_collection(group, cs, &i.path)? else {
                return Ok(());
            };
            let from = i.path.index() as usize;
            let to = i.ndx_2 as usize;
            let size = table.list_size(col, row)?;
            if from >= size || to >= size {
                return Err(Error::bad_changeset("array move out of bounds"));
            }
            table.list_move(col, row, from, to)
        }
        Instruction::ArrayErase(i) => {
            let Some((table, row, col)) = resolve_collection(group, cs, &i.path)? else {
                return Ok(());
            };
            let ndx = i.path.index() as usize;
            let size = table.list_size(col, row)?;
            if ndx >= size {
                return Err(Error::bad_changeset("array erase out of bounds"));
            }
            table.list_erase(col, row, ndx)
        }
        Instruction::Clear(i) => {
            let Some((table, row, col)) = resolve_collection(group, cs, &i.path)? else {
                return Ok(());
            };
            table.list_clear(col, row)
        }
        Instruction::SetInsert(i) => {
            let Some((table, row, col)) = resolve_collection(group, cs, &i.path)? else {
                return Ok(());
            };
            let value = to_mixed(cs, &i.value)?;
            table.insert_into_set(col, row, &value)?;
            Ok(())
        }
        Instruction::SetErase(i) => {
            let Some((table, row, col)) = resolve_collection(group, cs, &i.path)? else {
                return Ok(());
            };
            let value = to_mixed(cs, &i.value)?;
            table.erase_from_set(col, row, &value)?;
            Ok(())
        }
    }
}

fn table_for(
    group: &Group,
    cs: &Changeset,
    table: crate::sync::instruction::InternString,
) -> Result<Table> {
    let name = cs.string_str(table).into_owned();
    group
        .table(&name)
        .ok_or_else(|| Error::bad_changeset(format!("no such table '{}'", name)))
}

fn pk_value(cs: &Changeset, pk: &PrimaryKey) -> Result<PkValue> {
    Ok(match pk {
        PrimaryKey::Int(v) => PkValue::Int(*v),
        PrimaryKey::String(s) => PkValue::String(cs.string_str(*s).into_owned()),
        _ => {
            return Err(Error::bad_changeset(
                "unsupported primary key kind for this store",
            ))
        }
    })
}

/// Locate the `(table, row, column)` a path addresses. `None` when the
/// object is gone (its erasure won the merge).
fn resolve_field(group: &Group, cs: &Changeset, path: &Path) -> Result<Option<(Table, usize, usize)>> {
    let table = table_for(group, cs, path.table)?;
    let pk = pk_value(cs, &path.object)?;
    let Some(row) = table.find_row_by_pk(&pk) else {
        trace!("skipping instruction for a missing object");
        return Ok(None);
    };
    let field = cs.string_str(path.field).into_owned();
    let col = table
        .column_index(&field)
        .ok_or_else(|| Error::bad_changeset(format!("no such column '{}'", field)))?;
    Ok(Some((table, row, col)))
}

/// Like [`resolve_field`], but the column must be a collection cell.
fn resolve_collection(
    group: &Group,
    cs: &Changeset,
    path: &Path,
) -> Result<Option<(Table, usize, usize)>> {
    let Some((table, row, col)) = resolve_field(group, cs, path)? else {
        return Ok(None);
    };
    if table.column_type(col) != ColumnType::Table {
        return Err(Error::bad_changeset(format!(
            "column '{}' is not a collection",
            table.column_name(col)
        )));
    }
    Ok(Some((table, row, col)))
}

/// The stored column type a payload type maps to: exotic scalars keep
/// their full typing in the changeset layer and persist as fixed-width
/// byte strings; a null type code declares a mixed column.
fn storage_type(ty: PayloadType) -> Result<ColumnType> {
    Ok(match ty {
        PayloadType::Int => ColumnType::Int,
        PayloadType::Bool => ColumnType::Bool,
        PayloadType::Timestamp => ColumnType::Date,
        PayloadType::String => ColumnType::String,
        PayloadType::Binary => ColumnType::Binary,
        PayloadType::Null => ColumnType::Mixed,
        PayloadType::Float
        | PayloadType::Double
        | PayloadType::Decimal
        | PayloadType::ObjectId
        | PayloadType::Uuid
        | PayloadType::Link => ColumnType::Binary,
        PayloadType::Erased | PayloadType::Dictionary | PayloadType::ObjectValue => {
            return Err(Error::bad_changeset("sentinel payload type in a schema slot"))
        }
    })
}

/// Convert a concrete payload into a storable value.
fn to_mixed(cs: &Changeset, payload: &Payload) -> Result<MixedValue> {
    Ok(match payload {
        Payload::Int(v) => MixedValue::Int(*v),
        Payload::Bool(v) => MixedValue::Bool(*v),
        Payload::Timestamp(t) => MixedValue::Date(t.seconds),
        Payload::String(s) => MixedValue::String(cs.string_str(*s).into_owned()),
        Payload::Binary(b) => MixedValue::Binary(cs.string(*b).to_vec()),
        Payload::Float(v) => MixedValue::Binary(v.to_le_bytes().to_vec()),
        Payload::Double(v) => MixedValue::Binary(v.to_le_bytes().to_vec()),
        Payload::Decimal(d) => MixedValue::Binary(d.0.to_vec()),
        Payload::ObjectId(oid) => MixedValue::Binary(oid.0.to_vec()),
        Payload::Uuid(uuid) => MixedValue::Binary(uuid.0.to_vec()),
        Payload::Link {
            target_table,
            target,
        } => {
            // Canonical bytes: the target table, then the key.
            let mut bytes = cs.string(*target_table).to_vec();
            bytes.push(0);
            match target {
                PrimaryKey::Int(v) => bytes.extend_from_slice(&v.to_le_bytes()),
                PrimaryKey::String(s) => bytes.extend_from_slice(cs.string(*s)),
                PrimaryKey::ObjectId(oid) => bytes.extend_from_slice(&oid.0),
                PrimaryKey::Uuid(uuid) => bytes.extend_from_slice(&uuid.0),
            }
            MixedValue::Binary(bytes)
        }
        Payload::Null | Payload::Erased | Payload::Dictionary | Payload::ObjectValue => {
            return Err(Error::bad_changeset("sentinel payload where a value is required"))
        }
    })
}

/// Write a field-level payload into a cell, honouring the column type.
fn set_cell(table: &Table, col: usize, row: usize, cs: &Changeset, payload: &Payload) -> Result<()> {
    let column_type = table.column_type(col);
    match payload {
        Payload::Null | Payload::Erased => {
            // No null representation in storage: write the default.
            match column_type {
                ColumnType::Int => table.set_int(col, row, 0),
                ColumnType::Bool => table.set_bool(col, row, false),
                ColumnType::Date => table.set_date(col, row, 0),
                ColumnType::String => table.set_string(col, row, ""),
                ColumnType::Binary => table.set_binary(col, row, &[]),
                ColumnType::Mixed => table.set_mixed(col, row, &MixedValue::Int(0)),
                ColumnType::Table => table.clear_subtable(col, row),
            }
        }
        Payload::ObjectValue | Payload::Dictionary => {
            if column_type == ColumnType::Mixed {
                table.set_mixed(col, row, &MixedValue::Table)
            } else {
                trace!("ignoring container-creation sentinel on a plain column");
                Ok(())
            }
        }
        concrete => {
            let value = to_mixed(cs, concrete)?;
            match (column_type, &value) {
                (ColumnType::Int, MixedValue::Int(v)) => table.set_int(col, row, *v),
                (ColumnType::Bool, MixedValue::Bool(v)) => table.set_bool(col, row, *v),
                (ColumnType::Date, MixedValue::Date(v)) => table.set_date(col, row, *v),
                (ColumnType::String, MixedValue::String(s)) => table.set_string(col, row, s),
                (ColumnType::Binary, MixedValue::Binary(b)) => table.set_binary(col, row, b),
                (ColumnType::Mixed, v) => table.set_mixed(col, row, v),
                _ => Err(Error::bad_changeset(format!(
                    "payload type does not fit column '{}'",
                    table.column_name(col)
                ))),
            }
        }
    }
}
