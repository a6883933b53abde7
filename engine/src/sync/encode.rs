//! The changeset encoder: a self-delimiting instruction stream.
//!
//! Each instruction starts with a one-byte tag. The canonical tag
//! values are stable across format versions; new tags append. A
//! selection scheme avoids repeating the target in every instruction:
//! `SelectTable` establishes the table for everything that follows, and
//! `SelectList` establishes the container for list and set operations.
//! The encoder tracks the last selection emitted and inserts the
//! `Select*` instructions lazily.

use bytes::BufMut;
use smallvec::SmallVec;

use crate::sync::changeset::Changeset;
use crate::sync::instruction::{
    ColumnSchema, Instruction, InternString, Path, PathElement, Payload, PayloadType, PrimaryKey,
    TableType,
};
use crate::sync::wire::{write_f32, write_f64, write_string, write_svarint, write_uvarint};

// Canonical instruction tags.
pub(crate) const TAG_ADD_TABLE: u8 = 1; // InsertGroupLevelTable
pub(crate) const TAG_ERASE_TABLE: u8 = 2; // EraseGroupLevelTable
pub(crate) const TAG_SELECT_TABLE: u8 = 5;
pub(crate) const TAG_UPDATE: u8 = 6; // Set
pub(crate) const TAG_UPDATE_DEFAULT: u8 = 8; // SetDefault
pub(crate) const TAG_ADD_INTEGER: u8 = 9;
pub(crate) const TAG_ADD_COLUMN: u8 = 21; // InsertColumn
pub(crate) const TAG_ADD_LINK_COLUMN: u8 = 22; // InsertLinkColumn
pub(crate) const TAG_ADD_NULLABLE_COLUMN: u8 = 23; // InsertNullableColumn
pub(crate) const TAG_ERASE_COLUMN: u8 = 24;
pub(crate) const TAG_ERASE_LINK_COLUMN: u8 = 25;
pub(crate) const TAG_RENAME_COLUMN: u8 = 26;
pub(crate) const TAG_ADD_SEARCH_INDEX: u8 = 28;
pub(crate) const TAG_REMOVE_SEARCH_INDEX: u8 = 29;
pub(crate) const TAG_SET_LINK_TYPE: u8 = 30;
pub(crate) const TAG_SELECT_LIST: u8 = 31;
pub(crate) const TAG_ARRAY_MOVE: u8 = 34; // ListMove
pub(crate) const TAG_ARRAY_ERASE: u8 = 36; // ListErase
pub(crate) const TAG_CLEAR: u8 = 38; // ListClear
pub(crate) const TAG_CREATE_OBJECT: u8 = 40;
pub(crate) const TAG_ERASE_OBJECT: u8 = 41; // RemoveObject
pub(crate) const TAG_ARRAY_INSERT: u8 = 43; // ListInsert
pub(crate) const TAG_SET_INSERT: u8 = 44;
pub(crate) const TAG_SET_ERASE: u8 = 45;

/// Serialize a changeset: origin header, then the live instructions.
pub fn encode_changeset(cs: &Changeset) -> Vec<u8> {
    let mut enc = Encoder {
        out: Vec::new(),
        cs,
        selected_table: None,
        selected_list: None,
    };
    write_uvarint(&mut enc.out, cs.version);
    write_uvarint(&mut enc.out, cs.last_integrated_remote_version);
    write_uvarint(&mut enc.out, cs.origin_file_ident);
    write_svarint(&mut enc.out, cs.origin_timestamp);
    for (_, instr) in cs.iter() {
        enc.instruction(instr);
    }
    enc.out
}

/// The container a list/set operation addresses: the object, the field,
/// and the path prefix above the operated position.
type ListSelection = (PrimaryKey, InternString, SmallVec<[PathElement; 2]>);

struct Encoder<'a> {
    out: Vec<u8>,
    cs: &'a Changeset,
    selected_table: Option<InternString>,
    selected_list: Option<ListSelection>,
}

impl Encoder<'_> {
    fn instruction(&mut self, instr: &Instruction) {
        match instr {
            Instruction::AddTable(i) => {
                self.tag(TAG_ADD_TABLE);
                self.string(i.table);
                match &i.ty {
                    TableType::TopLevel {
                        pk_field,
                        pk_type,
                        pk_nullable,
                    } => {
                        self.out.put_u8(0);
                        self.string(*pk_field);
                        write_svarint(&mut self.out, *pk_type as i64);
                        self.out.put_u8(u8::from(*pk_nullable));
                    }
                    TableType::Embedded => self.out.put_u8(1),
                }
            }
            Instruction::EraseTable(i) => {
                self.tag(TAG_ERASE_TABLE);
                self.string(i.table);
                match &i.prior {
                    None => self.out.put_u8(0),
                    Some(schema) => {
                        self.out.put_u8(1);
                        match &schema.ty {
                            TableType::TopLevel {
                                pk_field,
                                pk_type,
                                pk_nullable,
                            } => {
                                self.out.put_u8(0);
                                self.string(*pk_field);
                                write_svarint(&mut self.out, *pk_type as i64);
                                self.out.put_u8(u8::from(*pk_nullable));
                            }
                            TableType::Embedded => self.out.put_u8(1),
                        }
                        write_uvarint(&mut self.out, schema.columns.len() as u64);
                        for column in &schema.columns {
                            self.column_schema(column);
                        }
                    }
                }
            }
            Instruction::AddColumn(i) => {
                self.select_table(i.table);
                let tag = if i.ty == PayloadType::Link {
                    TAG_ADD_LINK_COLUMN
                } else if i.nullable {
                    TAG_ADD_NULLABLE_COLUMN
                } else {
                    TAG_ADD_COLUMN
                };
                self.tag(tag);
                self.string(i.field);
                write_svarint(&mut self.out, i.ty as i64);
                self.out.put_u8(u8::from(i.nullable));
                self.out.put_u8(i.collection as u8);
                if tag == TAG_ADD_LINK_COLUMN {
                    self.string(i.link_target.expect("link column without a target"));
                }
            }
            Instruction::EraseColumn(i) => {
                self.select_table(i.table);
                let is_link = matches!(&i.prior, Some(p) if p.ty == PayloadType::Link);
                self.tag(if is_link {
                    TAG_ERASE_LINK_COLUMN
                } else {
                    TAG_ERASE_COLUMN
                });
                self.string(i.field);
                match &i.prior {
                    None => self.out.put_u8(0),
                    Some(schema) => {
                        self.out.put_u8(1);
                        self.column_schema(schema);
                    }
                }
            }
            Instruction::RenameColumn(i) => {
                self.select_table(i.table);
                self.tag(TAG_RENAME_COLUMN);
                self.string(i.field);
                self.string(i.new_name);
            }
            Instruction::AddSearchIndex(i) => {
                self.select_table(i.table);
                self.tag(TAG_ADD_SEARCH_INDEX);
                self.string(i.field);
            }
            Instruction::RemoveSearchIndex(i) => {
                self.select_table(i.table);
                self.tag(TAG_REMOVE_SEARCH_INDEX);
                self.string(i.field);
            }
            Instruction::SetLinkType(i) => {
                self.select_table(i.table);
                self.tag(TAG_SET_LINK_TYPE);
                self.string(i.field);
                self.out.put_u8(i.link_type as u8);
                match i.prior {
                    None => self.out.put_u8(2),
                    Some(lt) => self.out.put_u8(lt as u8),
                }
            }
            Instruction::CreateObject(i) => {
                self.select_table(i.table);
                self.tag(TAG_CREATE_OBJECT);
                self.primary_key(&i.object);
            }
            Instruction::EraseObject(i) => {
                self.select_table(i.table);
                self.tag(TAG_ERASE_OBJECT);
                self.primary_key(&i.object);
                write_uvarint(&mut self.out, i.prior_fields.len() as u64);
                for (field, payload) in &i.prior_fields {
                    self.string(*field);
                    self.payload(payload);
                }
            }
            Instruction::Update(i) => {
                self.select_table(i.path.table);
                self.tag(if i.is_default {
                    TAG_UPDATE_DEFAULT
                } else {
                    TAG_UPDATE
                });
                self.primary_key(&i.path.object);
                self.string(i.path.field);
                self.path_elements(&i.path.elements);
                self.payload(&i.value);
                write_uvarint(&mut self.out, u64::from(i.prior_size));
                self.optional_payload(&i.prior);
            }
            Instruction::AddInteger(i) => {
                self.select_table(i.path.table);
                self.tag(TAG_ADD_INTEGER);
                self.primary_key(&i.path.object);
                self.string(i.path.field);
                self.path_elements(&i.path.elements);
                write_svarint(&mut self.out, i.value);
            }
            Instruction::ArrayInsert(i) => {
                self.select_table(i.path.table);
                self.select_list_for_element(&i.path);
                self.tag(TAG_ARRAY_INSERT);
                write_uvarint(&mut self.out, u64::from(i.path.index()));
                self.payload(&i.value);
                write_uvarint(&mut self.out, u64::from(i.prior_size));
            }
            Instruction::ArrayMove(i) => {
                self.select_table(i.path.table);
                self.select_list_for_element(&i.path);
                self.tag(TAG_ARRAY_MOVE);
                write_uvarint(&mut self.out, u64::from(i.path.index()));
                write_uvarint(&mut self.out, u64::from(i.ndx_2));
                write_uvarint(&mut self.out, u64::from(i.prior_size));
            }
            Instruction::ArrayErase(i) => {
                self.select_table(i.path.table);
                self.select_list_for_element(&i.path);
                self.tag(TAG_ARRAY_ERASE);
                write_uvarint(&mut self.out, u64::from(i.path.index()));
                write_uvarint(&mut self.out, u64::from(i.prior_size));
                self.optional_payload(&i.prior);
            }
            Instruction::Clear(i) => {
                self.select_table(i.path.table);
                self.select_list_for_container(&i.path);
                self.tag(TAG_CLEAR);
                write_uvarint(&mut self.out, u64::from(i.prior_size));
                write_uvarint(&mut self.out, i.prior_items.len() as u64);
                for item in &i.prior_items {
                    self.payload(item);
                }
            }
            Instruction::SetInsert(i) => {
                self.select_table(i.path.table);
                self.select_list_for_container(&i.path);
                self.tag(TAG_SET_INSERT);
                self.payload(&i.value);
            }
            Instruction::SetErase(i) => {
                self.select_table(i.path.table);
                self.select_list_for_container(&i.path);
                self.tag(TAG_SET_ERASE);
                self.payload(&i.value);
            }
        }
    }

    fn tag(&mut self, tag: u8) {
        self.out.put_u8(tag);
    }

    fn string(&mut self, s: InternString) {
        write_string(&mut self.out, self.cs.string(s));
    }

    /// Emit `SelectTable` when the target table changes.
    fn select_table(&mut self, table: InternString) {
        if self.selected_table == Some(table) {
            return;
        }
        self.tag(TAG_SELECT_TABLE);
        self.string(table);
        self.selected_table = Some(table);
        // A table switch invalidates the container selection.
        self.selected_list = None;
    }

    /// Emit `SelectList` for the container of an element-addressed
    /// operation (the path minus its trailing index).
    fn select_list_for_element(&mut self, path: &Path) {
        debug_assert!(path.is_array_path());
        let prefix: SmallVec<[PathElement; 2]> =
            path.elements[..path.elements.len() - 1].iter().copied().collect();
        self.select_list(path.object, path.field, prefix);
    }

    /// Emit `SelectList` for a container-addressed operation (the whole
    /// path is the container).
    fn select_list_for_container(&mut self, path: &Path) {
        self.select_list(path.object, path.field, path.elements.clone());
    }

    fn select_list(
        &mut self,
        object: PrimaryKey,
        field: InternString,
        prefix: SmallVec<[PathElement; 2]>,
    ) {
        let selection = (object, field, prefix);
        if self.selected_list.as_ref() == Some(&selection) {
            return;
        }
        self.tag(TAG_SELECT_LIST);
        self.primary_key(&selection.0);
        self.string(selection.1);
        self.path_elements(&selection.2);
        self.selected_list = Some(selection);
    }

    fn primary_key(&mut self, key: &PrimaryKey) {
        match key {
            PrimaryKey::Int(v) => {
                self.out.put_u8(0);
                write_svarint(&mut self.out, *v);
            }
            PrimaryKey::String(s) => {
                self.out.put_u8(1);
                self.string(*s);
            }
            PrimaryKey::ObjectId(oid) => {
                self.out.put_u8(2);
                self.out.put_slice(&oid.0);
            }
            PrimaryKey::Uuid(uuid) => {
                self.out.put_u8(3);
                self.out.put_slice(&uuid.0);
            }
        }
    }

    fn path_elements(&mut self, elements: &[PathElement]) {
        write_uvarint(&mut self.out, elements.len() as u64);
        for element in elements {
            match element {
                PathElement::Index(i) => {
                    self.out.put_u8(0);
                    write_uvarint(&mut self.out, u64::from(*i));
                }
                PathElement::Key(k) => {
                    self.out.put_u8(1);
                    self.string(*k);
                }
            }
        }
    }

    fn payload(&mut self, payload: &Payload) {
        write_svarint(&mut self.out, payload.type_of() as i64);
        match payload {
            Payload::Null | Payload::Erased | Payload::Dictionary | Payload::ObjectValue => {}
            Payload::Int(v) => write_svarint(&mut self.out, *v),
            Payload::Bool(v) => self.out.put_u8(u8::from(*v)),
            Payload::Float(v) => write_f32(&mut self.out, *v),
            Payload::Double(v) => write_f64(&mut self.out, *v),
            Payload::Decimal(d) => self.out.put_slice(&d.0),
            Payload::Timestamp(t) => {
                write_svarint(&mut self.out, t.seconds);
                write_svarint(&mut self.out, i64::from(t.nanoseconds));
            }
            Payload::ObjectId(oid) => self.out.put_slice(&oid.0),
            Payload::Uuid(uuid) => self.out.put_slice(&uuid.0),
            Payload::String(s) => self.string(*s),
            Payload::Binary(b) => self.string(*b),
            Payload::Link {
                target_table,
                target,
            } => {
                self.string(*target_table);
                self.primary_key(target);
            }
        }
    }

    fn optional_payload(&mut self, payload: &Option<Payload>) {
        match payload {
            None => self.out.put_u8(0),
            Some(p) => {
                self.out.put_u8(1);
                self.payload(p);
            }
        }
    }

    fn column_schema(&mut self, schema: &ColumnSchema) {
        self.string(schema.field);
        write_svarint(&mut self.out, schema.ty as i64);
        self.out.put_u8(u8::from(schema.nullable));
        self.out.put_u8(schema.collection as u8);
        match schema.link_target {
            None => self.out.put_u8(0),
            Some(t) => {
                self.out.put_u8(1);
                self.string(t);
            }
        }
    }
}
