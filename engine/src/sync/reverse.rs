//! Changeset reversal: for every instruction an inverse exists, and the
//! reversed log applied in reverse instruction order is a rollback.
//!
//! Inverses of destructive operations rely on the displaced state the
//! recorder captured (`prior` payloads, prior schema). A foreign log
//! parsed without that capture is not reversible; attempting it raises
//! `BadChangeset`. Selection instructions are an encoding artifact and
//! re-emerge automatically when the reversed changeset is encoded.

use crate::error::{Error, Result};
use crate::sync::changeset::Changeset;
use crate::sync::instruction::{
    AddColumn, AddInteger, AddSearchIndex, AddTable, ArrayErase, ArrayInsert, ArrayMove, Clear,
    CreateObject, EraseColumn, EraseObject, EraseTable, Instruction, Path, PathElement,
    RemoveSearchIndex, RenameColumn, SetErase, SetInsert, SetLinkType, TableSchema, TableType,
    Update,
};

/// Build the inverse changeset: each instruction inverted, the sequence
/// reversed.
pub fn reverse_changeset(cs: &Changeset) -> Result<Changeset> {
    let mut out = Changeset::with_origin(cs.origin_timestamp, cs.origin_file_ident);
    out.version = cs.version;
    out.last_integrated_remote_version = cs.last_integrated_remote_version;

    let mut inverted: Vec<Vec<Instruction>> = Vec::new();
    for (_, instr) in cs.iter() {
        inverted.push(invert(&mut out, cs, instr)?);
    }
    for group in inverted.into_iter().rev() {
        for instr in group {
            out.push(instr);
        }
    }
    Ok(out)
}

/// The inverse of one instruction, as a sequence in forward order.
fn invert(out: &mut Changeset, cs: &Changeset, instr: &Instruction) -> Result<Vec<Instruction>> {
    Ok(match instr {
        Instruction::AddTable(i) => {
            let table = out.adopt_string(cs, i.table);
            let ty = adopt_table_type(out, cs, &i.ty);
            vec![Instruction::EraseTable(EraseTable {
                table,
                prior: Some(TableSchema {
                    ty,
                    columns: Vec::new(),
                }),
            })]
        }
        Instruction::EraseTable(i) => {
            let Some(prior) = &i.prior else {
                return Err(Error::bad_changeset(
                    "EraseTable without captured schema is irreversible",
                ));
            };
            let table = out.adopt_string(cs, i.table);
            let ty = adopt_table_type(out, cs, &prior.ty);
            let mut seq = vec![Instruction::AddTable(AddTable { table, ty })];
            for column in &prior.columns {
                let field = out.adopt_string(cs, column.field);
                let link_target = column.link_target.map(|t| out.adopt_string(cs, t));
                seq.push(Instruction::AddColumn(AddColumn {
                    table,
                    field,
                    ty: column.ty,
                    nullable: column.nullable,
                    collection: column.collection,
                    link_target,
                }));
            }
            seq
        }
        Instruction::AddColumn(i) => {
            let table = out.adopt_string(cs, i.table);
            let field = out.adopt_string(cs, i.field);
            let link_target = i.link_target.map(|t| out.adopt_string(cs, t));
            vec![Instruction::EraseColumn(EraseColumn {
                table,
                field,
                prior: Some(crate::sync::instruction::ColumnSchema {
                    field,
                    ty: i.ty,
                    nullable: i.nullable,
                    collection: i.collection,
                    link_target,
                }),
            })]
        }
        Instruction::EraseColumn(i) => {
            let Some(prior) = &i.prior else {
                return Err(Error::bad_changeset(
                    "EraseColumn without captured schema is irreversible",
                ));
            };
            let table = out.adopt_string(cs, i.table);
            let field = out.adopt_string(cs, i.field);
            let link_target = prior.link_target.map(|t| out.adopt_string(cs, t));
            vec![Instruction::AddColumn(AddColumn {
                table,
                field,
                ty: prior.ty,
                nullable: prior.nullable,
                collection: prior.collection,
                link_target,
            })]
        }
        Instruction::RenameColumn(i) => {
            let table = out.adopt_string(cs, i.table);
            let field = out.adopt_string(cs, i.field);
            let new_name = out.adopt_string(cs, i.new_name);
            vec![Instruction::RenameColumn(RenameColumn {
                table,
                field: new_name,
                new_name: field,
            })]
        }
        Instruction::AddSearchIndex(i) => {
            let table = out.adopt_string(cs, i.table);
            let field = out.adopt_string(cs, i.field);
            vec![Instruction::RemoveSearchIndex(RemoveSearchIndex {
                table,
                field,
            })]
        }
        Instruction::RemoveSearchIndex(i) => {
            let table = out.adopt_string(cs, i.table);
            let field = out.adopt_string(cs, i.field);
            vec![Instruction::AddSearchIndex(AddSearchIndex { table, field })]
        }
        Instruction::SetLinkType(i) => {
            let Some(prior) = i.prior else {
                return Err(Error::bad_changeset(
                    "SetLinkType without captured prior is irreversible",
                ));
            };
            let table = out.adopt_string(cs, i.table);
            let field = out.adopt_string(cs, i.field);
            vec![Instruction::SetLinkType(SetLinkType {
                table,
                field,
                link_type: prior,
                prior: Some(i.link_type),
            })]
        }
        Instruction::CreateObject(i) => {
            let table = out.adopt_string(cs, i.table);
            let object = out.adopt_key(cs, &i.object);
            vec![Instruction::EraseObject(EraseObject {
                table,
                object,
                prior_fields: Vec::new(),
            })]
        }
        Instruction::EraseObject(i) => {
            let table = out.adopt_string(cs, i.table);
            let object = out.adopt_key(cs, &i.object);
            let mut seq = vec![Instruction::CreateObject(CreateObject { table, object })];
            for (field, payload) in &i.prior_fields {
                let field = out.adopt_string(cs, *field);
                let value = out.adopt_payload(cs, payload);
                seq.push(Instruction::Update(Update {
                    path: Path::new(table, object, field),
                    value,
                    is_default: false,
                    prior_size: 0,
                    prior: None,
                }));
            }
            seq
        }
        Instruction::Update(i) => {
            let Some(prior) = &i.prior else {
                return Err(Error::bad_changeset(
                    "Update without captured prior is irreversible",
                ));
            };
            let path = out.adopt_path(cs, &i.path);
            let value = out.adopt_payload(cs, prior);
            let prior = out.adopt_payload(cs, &i.value);
            vec![Instruction::Update(Update {
                path,
                value,
                is_default: false,
                prior_size: i.prior_size,
                prior: Some(prior),
            })]
        }
        Instruction::AddInteger(i) => {
            let path = out.adopt_path(cs, &i.path);
            vec![Instruction::AddInteger(AddInteger {
                path,
                value: -i.value,
            })]
        }
        Instruction::ArrayInsert(i) => {
            let path = out.adopt_path(cs, &i.path);
            let prior = out.adopt_payload(cs, &i.value);
            vec![Instruction::ArrayErase(ArrayErase {
                path,
                prior_size: i.prior_size + 1,
                prior: Some(prior),
            })]
        }
        Instruction::ArrayErase(i) => {
            let Some(prior) = &i.prior else {
                return Err(Error::bad_changeset(
                    "ArrayErase without captured prior is irreversible",
                ));
            };
            let path = out.adopt_path(cs, &i.path);
            let value = out.adopt_payload(cs, prior);
            vec![Instruction::ArrayInsert(ArrayInsert {
                path,
                value,
                prior_size: i.prior_size - 1,
            })]
        }
        Instruction::ArrayMove(i) => {
            let mut path = out.adopt_path(cs, &i.path);
            let from = path.index();
            path.set_index(i.ndx_2);
            vec![Instruction::ArrayMove(ArrayMove {
                path,
                ndx_2: from,
                prior_size: i.prior_size,
            })]
        }
        Instruction::Clear(i) => {
            // Re-insert the displaced items in order.
            let base = out.adopt_path(cs, &i.path);
            let mut seq = Vec::with_capacity(i.prior_items.len());
            for (k, item) in i.prior_items.iter().enumerate() {
                let mut path = base.clone();
                path.elements.push(PathElement::Index(k as u32));
                let value = out.adopt_payload(cs, item);
                seq.push(Instruction::ArrayInsert(ArrayInsert {
                    path,
                    value,
                    prior_size: k as u32,
                }));
            }
            seq
        }
        Instruction::SetInsert(i) => {
            let path = out.adopt_path(cs, &i.path);
            let value = out.adopt_payload(cs, &i.value);
            vec![Instruction::SetErase(SetErase { path, value })]
        }
        Instruction::SetErase(i) => {
            let path = out.adopt_path(cs, &i.path);
            let value = out.adopt_payload(cs, &i.value);
            vec![Instruction::SetInsert(SetInsert { path, value })]
        }
    })
}

fn adopt_table_type(out: &mut Changeset, cs: &Changeset, ty: &TableType) -> TableType {
    match ty {
        TableType::TopLevel {
            pk_field,
            pk_type,
            pk_nullable,
        } => TableType::TopLevel {
            pk_field: out.adopt_string(cs, *pk_field),
            pk_type: *pk_type,
            pk_nullable: *pk_nullable,
        },
        TableType::Embedded => TableType::Embedded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::instruction::{Payload, PrimaryKey};

    #[test]
    fn update_inverse_swaps_value_and_prior() {
        let mut cs = Changeset::new();
        let table = cs.intern_str("t");
        let field = cs.intern_str("a");
        cs.push(Instruction::Update(Update {
            path: Path::new(table, PrimaryKey::Int(1), field),
            value: Payload::Int(2),
            is_default: false,
            prior_size: 0,
            prior: Some(Payload::Int(1)),
        }));

        let reversed = reverse_changeset(&cs).unwrap();

        assert_eq!(reversed.len(), 1);
        let (_, instr) = reversed.iter().next().unwrap();
        match instr {
            Instruction::Update(u) => {
                assert_eq!(u.value, Payload::Int(1));
                assert_eq!(u.prior, Some(Payload::Int(2)));
            }
            other => panic!("unexpected inverse {:?}", other),
        }
    }

    #[test]
    fn instruction_order_is_reversed() {
        let mut cs = Changeset::new();
        let table = cs.intern_str("t");
        cs.push(Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(1),
        }));
        cs.push(Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(2),
        }));

        let reversed = reverse_changeset(&cs).unwrap();

        let pks: Vec<i64> = reversed
            .iter()
            .map(|(_, i)| match i {
                Instruction::EraseObject(e) => match e.object {
                    PrimaryKey::Int(v) => v,
                    _ => panic!("unexpected key"),
                },
                other => panic!("unexpected inverse {:?}", other),
            })
            .collect();
        assert_eq!(pks, vec![2, 1]);
    }

    #[test]
    fn clear_inverse_reinserts_items() {
        let mut cs = Changeset::new();
        let table = cs.intern_str("t");
        let field = cs.intern_str("l");
        cs.push(Instruction::Clear(Clear {
            path: Path::new(table, PrimaryKey::Int(1), field),
            prior_size: 2,
            prior_items: vec![Payload::Int(10), Payload::Int(20)],
        }));

        let reversed = reverse_changeset(&cs).unwrap();

        let inserted: Vec<(u32, Payload)> = reversed
            .iter()
            .map(|(_, i)| match i {
                Instruction::ArrayInsert(a) => (a.path.index(), a.value),
                other => panic!("unexpected inverse {:?}", other),
            })
            .collect();
        assert_eq!(inserted, vec![(0, Payload::Int(10)), (1, Payload::Int(20))]);
    }

    #[test]
    fn foreign_log_without_priors_is_irreversible() {
        let mut cs = Changeset::new();
        let table = cs.intern_str("t");
        let field = cs.intern_str("a");
        cs.push(Instruction::Update(Update {
            path: Path::new(table, PrimaryKey::Int(1), field),
            value: Payload::Int(2),
            is_default: false,
            prior_size: 0,
            prior: None,
        }));

        assert!(reverse_changeset(&cs).is_err());
    }
}
