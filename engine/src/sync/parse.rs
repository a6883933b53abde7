//! The changeset parser: a pull driver over the encoded instruction
//! stream.
//!
//! The parser decodes one instruction at a time and hands it to an
//! [`InstructionHandler`]. String bytes are passed to the handler's
//! interner as borrowed slices; a handler returning `false`, or any
//! malformed input, aborts the parse with `BadChangeset`.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::sync::changeset::Changeset;
use crate::sync::encode::*;
use crate::sync::instruction::{
    AddColumn, AddInteger, AddSearchIndex, AddTable, ArrayErase, ArrayInsert, ArrayMove, Clear,
    CollectionType, ColumnSchema, CreateObject, Decimal128, EraseColumn, EraseObject, EraseTable,
    InternString, Instruction, LinkType, ObjectId, Path, PathElement, Payload, PayloadType,
    PrimaryKey, RemoveSearchIndex, RenameColumn, SetErase, SetInsert, SetLinkType, TableSchema,
    TableType, Timestamp, Update, Uuid,
};
use crate::sync::wire::Reader;

/// Receiver of decoded instructions.
pub trait InstructionHandler {
    /// Intern a string slice from the input buffer; the returned id
    /// must resolve to the same bytes for the rest of the parse.
    fn intern(&mut self, bytes: &[u8]) -> InternString;

    /// One decoded instruction. Returning `false` signals a disallowed
    /// combination and aborts the parse.
    fn instruction(&mut self, instr: Instruction) -> bool;
}

impl InstructionHandler for Changeset {
    fn intern(&mut self, bytes: &[u8]) -> InternString {
        self.intern_string(bytes)
    }

    fn instruction(&mut self, instr: Instruction) -> bool {
        self.push(instr);
        true
    }
}

/// Parse a full encoded changeset, header included.
pub fn parse_changeset(bytes: &[u8]) -> Result<Changeset> {
    let mut cs = Changeset::new();
    let mut rd = Reader::new(bytes);
    cs.version = rd.read_uvarint()?;
    cs.last_integrated_remote_version = rd.read_uvarint()?;
    cs.origin_file_ident = rd.read_uvarint()?;
    cs.origin_timestamp = rd.read_svarint()?;

    let mut parser = Parser::new();
    parser.parse(&mut rd, &mut cs)?;
    cs.set_dirty(false);
    Ok(cs)
}

/// The decoder-side selection state plus the instruction loop.
pub struct Parser {
    selected_table: Option<InternString>,
    selected_list: Option<(PrimaryKey, InternString, SmallVec<[PathElement; 2]>)>,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Parser {
        Parser {
            selected_table: None,
            selected_list: None,
        }
    }

    /// Drive the handler over every instruction in the input.
    pub fn parse<H: InstructionHandler>(&mut self, rd: &mut Reader<'_>, handler: &mut H) -> Result<()> {
        while !rd.at_end() {
            self.parse_one(rd, handler)?;
        }
        Ok(())
    }

    fn parse_one<H: InstructionHandler>(&mut self, rd: &mut Reader<'_>, handler: &mut H) -> Result<()> {
        let tag = rd.read_u8()?;
        let instr = match tag {
            TAG_SELECT_TABLE => {
                let table = self.intern_string(rd, handler)?;
                self.selected_table = Some(table);
                self.selected_list = None;
                return Ok(());
            }
            TAG_SELECT_LIST => {
                let object = self.primary_key(rd, handler)?;
                let field = self.intern_string(rd, handler)?;
                let prefix = self.path_elements(rd, handler)?;
                self.selected_list = Some((object, field, prefix));
                return Ok(());
            }
            TAG_ADD_TABLE => {
                let table = self.intern_string(rd, handler)?;
                let ty = self.table_type(rd, handler)?;
                Instruction::AddTable(AddTable { table, ty })
            }
            TAG_ERASE_TABLE => {
                let table = self.intern_string(rd, handler)?;
                let prior = match rd.read_u8()? {
                    0 => None,
                    1 => {
                        let ty = self.table_type(rd, handler)?;
                        let count = rd.read_uvarint()? as usize;
                        let mut columns = Vec::with_capacity(count.min(256));
                        for _ in 0..count {
                            columns.push(self.column_schema(rd, handler)?);
                        }
                        Some(TableSchema { ty, columns })
                    }
                    _ => return Err(Error::bad_changeset("bad prior-schema flag")),
                };
                Instruction::EraseTable(EraseTable { table, prior })
            }
            TAG_ADD_COLUMN | TAG_ADD_NULLABLE_COLUMN | TAG_ADD_LINK_COLUMN => {
                let table = self.table(rd)?;
                let field = self.intern_string(rd, handler)?;
                let ty = payload_type(rd.read_svarint()?)?;
                let nullable = read_bool(rd)?;
                let collection = collection_type(rd.read_u8()?)?;
                let link_target = if tag == TAG_ADD_LINK_COLUMN {
                    Some(self.intern_string(rd, handler)?)
                } else {
                    None
                };
                if tag == TAG_ADD_LINK_COLUMN && ty != PayloadType::Link {
                    return Err(Error::bad_changeset("link column with non-link type"));
                }
                Instruction::AddColumn(AddColumn {
                    table,
                    field,
                    ty,
                    nullable,
                    collection,
                    link_target,
                })
            }
            TAG_ERASE_COLUMN | TAG_ERASE_LINK_COLUMN => {
                let table = self.table(rd)?;
                let field = self.intern_string(rd, handler)?;
                let prior = match rd.read_u8()? {
                    0 => None,
                    1 => Some(self.column_schema(rd, handler)?),
                    _ => return Err(Error::bad_changeset("bad prior-schema flag")),
                };
                Instruction::EraseColumn(EraseColumn {
                    table,
                    field,
                    prior,
                })
            }
            TAG_RENAME_COLUMN => {
                let table = self.table(rd)?;
                let field = self.intern_string(rd, handler)?;
                let new_name = self.intern_string(rd, handler)?;
                Instruction::RenameColumn(RenameColumn {
                    table,
                    field,
                    new_name,
                })
            }
            TAG_ADD_SEARCH_INDEX => {
                let table = self.table(rd)?;
                let field = self.intern_string(rd, handler)?;
                Instruction::AddSearchIndex(AddSearchIndex { table, field })
            }
            TAG_REMOVE_SEARCH_INDEX => {
                let table = self.table(rd)?;
                let field = self.intern_string(rd, handler)?;
                Instruction::RemoveSearchIndex(RemoveSearchIndex { table, field })
            }
            TAG_SET_LINK_TYPE => {
                let table = self.table(rd)?;
                let field = self.intern_string(rd, handler)?;
                let link_type = link_type(rd.read_u8()?)?;
                let prior = match rd.read_u8()? {
                    2 => None,
                    code => Some(link_type_from(code)?),
                };
                Instruction::SetLinkType(SetLinkType {
                    table,
                    field,
                    link_type,
                    prior,
                })
            }
            TAG_CREATE_OBJECT => {
                let table = self.table(rd)?;
                let object = self.primary_key(rd, handler)?;
                Instruction::CreateObject(CreateObject { table, object })
            }
            TAG_ERASE_OBJECT => {
                let table = self.table(rd)?;
                let object = self.primary_key(rd, handler)?;
                let count = rd.read_uvarint()? as usize;
                let mut prior_fields = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let field = self.intern_string(rd, handler)?;
                    let payload = self.payload(rd, handler)?;
                    prior_fields.push((field, payload));
                }
                Instruction::EraseObject(EraseObject {
                    table,
                    object,
                    prior_fields,
                })
            }
            TAG_UPDATE | TAG_UPDATE_DEFAULT => {
                let table = self.table(rd)?;
                let object = self.primary_key(rd, handler)?;
                let field = self.intern_string(rd, handler)?;
                let elements = self.path_elements(rd, handler)?;
                let value = self.payload(rd, handler)?;
                let prior_size = rd.read_uvarint()? as u32;
                let prior = self.optional_payload(rd, handler)?;
                let mut path = Path::new(table, object, field);
                path.elements = elements;
                Instruction::Update(Update {
                    path,
                    value,
                    is_default: tag == TAG_UPDATE_DEFAULT,
                    prior_size,
                    prior,
                })
            }
            TAG_ADD_INTEGER => {
                let table = self.table(rd)?;
                let object = self.primary_key(rd, handler)?;
                let field = self.intern_string(rd, handler)?;
                let elements = self.path_elements(rd, handler)?;
                let value = rd.read_svarint()?;
                let mut path = Path::new(table, object, field);
                path.elements = elements;
                Instruction::AddInteger(AddInteger { path, value })
            }
            TAG_ARRAY_INSERT => {
                let index = rd.read_uvarint()? as u32;
                let path = self.element_path(index)?;
                let value = self.payload(rd, handler)?;
                let prior_size = rd.read_uvarint()? as u32;
                Instruction::ArrayInsert(ArrayInsert {
                    path,
                    value,
                    prior_size,
                })
            }
            TAG_ARRAY_MOVE => {
                let index = rd.read_uvarint()? as u32;
                let path = self.element_path(index)?;
                let ndx_2 = rd.read_uvarint()? as u32;
                let prior_size = rd.read_uvarint()? as u32;
                Instruction::ArrayMove(ArrayMove {
                    path,
                    ndx_2,
                    prior_size,
                })
            }
            TAG_ARRAY_ERASE => {
                let index = rd.read_uvarint()? as u32;
                let path = self.element_path(index)?;
                let prior_size = rd.read_uvarint()? as u32;
                let prior = self.optional_payload(rd, handler)?;
                Instruction::ArrayErase(ArrayErase {
                    path,
                    prior_size,
                    prior,
                })
            }
            TAG_CLEAR => {
                let path = self.container_path()?;
                let prior_size = rd.read_uvarint()? as u32;
                let count = rd.read_uvarint()? as usize;
                let mut prior_items = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    prior_items.push(self.payload(rd, handler)?);
                }
                Instruction::Clear(Clear {
                    path,
                    prior_size,
                    prior_items,
                })
            }
            TAG_SET_INSERT => {
                let path = self.container_path()?;
                let value = self.payload(rd, handler)?;
                Instruction::SetInsert(SetInsert { path, value })
            }
            TAG_SET_ERASE => {
                let path = self.container_path()?;
                let value = self.payload(rd, handler)?;
                Instruction::SetErase(SetErase { path, value })
            }
            _ => return Err(Error::bad_changeset(format!("unknown instruction tag {}", tag))),
        };
        if !handler.instruction(instr) {
            return Err(Error::bad_changeset("handler rejected instruction"));
        }
        Ok(())
    }

    fn table(&self, _rd: &Reader<'_>) -> Result<InternString> {
        self.selected_table
            .ok_or_else(|| Error::bad_changeset("instruction before SelectTable"))
    }

    /// The path of an element-addressed list operation, from the
    /// current list selection plus the decoded index.
    fn element_path(&self, index: u32) -> Result<Path> {
        let table = self
            .selected_table
            .ok_or_else(|| Error::bad_changeset("list operation before SelectTable"))?;
        let (object, field, prefix) = self
            .selected_list
            .as_ref()
            .ok_or_else(|| Error::bad_changeset("list operation before SelectList"))?;
        let mut path = Path::new(table, *object, *field);
        path.elements = prefix.clone();
        path.elements.push(PathElement::Index(index));
        Ok(path)
    }

    /// The path of a container-addressed operation, from the current
    /// list selection.
    fn container_path(&self) -> Result<Path> {
        let table = self
            .selected_table
            .ok_or_else(|| Error::bad_changeset("list operation before SelectTable"))?;
        let (object, field, prefix) = self
            .selected_list
            .as_ref()
            .ok_or_else(|| Error::bad_changeset("list operation before SelectList"))?;
        let mut path = Path::new(table, *object, *field);
        path.elements = prefix.clone();
        Ok(path)
    }

    fn intern_string<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<InternString> {
        let bytes = rd.read_string()?;
        Ok(handler.intern(bytes))
    }

    fn table_type<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<TableType> {
        match rd.read_u8()? {
            0 => {
                let pk_field = self.intern_string(rd, handler)?;
                let pk_type = payload_type(rd.read_svarint()?)?;
                let pk_nullable = read_bool(rd)?;
                Ok(TableType::TopLevel {
                    pk_field,
                    pk_type,
                    pk_nullable,
                })
            }
            1 => Ok(TableType::Embedded),
            _ => Err(Error::bad_changeset("bad table type")),
        }
    }

    fn column_schema<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<ColumnSchema> {
        let field = self.intern_string(rd, handler)?;
        let ty = payload_type(rd.read_svarint()?)?;
        let nullable = read_bool(rd)?;
        let collection = collection_type(rd.read_u8()?)?;
        let link_target = match rd.read_u8()? {
            0 => None,
            1 => Some(self.intern_string(rd, handler)?),
            _ => return Err(Error::bad_changeset("bad link-target flag")),
        };
        Ok(ColumnSchema {
            field,
            ty,
            nullable,
            collection,
            link_target,
        })
    }

    fn primary_key<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<PrimaryKey> {
        Ok(match rd.read_u8()? {
            0 => PrimaryKey::Int(rd.read_svarint()?),
            1 => PrimaryKey::String(self.intern_string(rd, handler)?),
            2 => {
                let bytes = rd.read_bytes(12)?;
                PrimaryKey::ObjectId(ObjectId(bytes.try_into().expect("sliced twelve bytes")))
            }
            3 => {
                let bytes = rd.read_bytes(16)?;
                PrimaryKey::Uuid(Uuid(bytes.try_into().expect("sliced sixteen bytes")))
            }
            _ => return Err(Error::bad_changeset("bad primary key kind")),
        })
    }

    fn path_elements<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<SmallVec<[PathElement; 2]>> {
        let count = rd.read_uvarint()? as usize;
        let mut elements = SmallVec::new();
        for _ in 0..count {
            elements.push(match rd.read_u8()? {
                0 => PathElement::Index(rd.read_uvarint()? as u32),
                1 => PathElement::Key(self.intern_string(rd, handler)?),
                _ => return Err(Error::bad_changeset("bad path element kind")),
            });
        }
        Ok(elements)
    }

    fn payload<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<Payload> {
        let ty = payload_type(rd.read_svarint()?)?;
        Ok(match ty {
            PayloadType::Null => Payload::Null,
            PayloadType::Erased => Payload::Erased,
            PayloadType::Dictionary => Payload::Dictionary,
            PayloadType::ObjectValue => Payload::ObjectValue,
            PayloadType::Int => Payload::Int(rd.read_svarint()?),
            PayloadType::Bool => Payload::Bool(read_bool(rd)?),
            PayloadType::Float => Payload::Float(rd.read_f32()?),
            PayloadType::Double => Payload::Double(rd.read_f64()?),
            PayloadType::Decimal => {
                let bytes = rd.read_bytes(16)?;
                Payload::Decimal(Decimal128(bytes.try_into().expect("sliced sixteen bytes")))
            }
            PayloadType::Timestamp => Payload::Timestamp(Timestamp {
                seconds: rd.read_svarint()?,
                nanoseconds: rd.read_svarint()? as i32,
            }),
            PayloadType::ObjectId => {
                let bytes = rd.read_bytes(12)?;
                Payload::ObjectId(ObjectId(bytes.try_into().expect("sliced twelve bytes")))
            }
            PayloadType::Uuid => {
                let bytes = rd.read_bytes(16)?;
                Payload::Uuid(Uuid(bytes.try_into().expect("sliced sixteen bytes")))
            }
            PayloadType::String => Payload::String(self.intern_string(rd, handler)?),
            PayloadType::Binary => Payload::Binary(self.intern_string(rd, handler)?),
            PayloadType::Link => {
                let target_table = self.intern_string(rd, handler)?;
                let target = self.primary_key(rd, handler)?;
                Payload::Link {
                    target_table,
                    target,
                }
            }
        })
    }

    fn optional_payload<H: InstructionHandler>(
        &mut self,
        rd: &mut Reader<'_>,
        handler: &mut H,
    ) -> Result<Option<Payload>> {
        match rd.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.payload(rd, handler)?)),
            _ => Err(Error::bad_changeset("bad optional-payload flag")),
        }
    }
}

fn read_bool(rd: &mut Reader) -> Result<bool> {
    match rd.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::bad_changeset("bad bool")),
    }
}

fn payload_type(code: i64) -> Result<PayloadType> {
    PayloadType::from_code(code)
        .ok_or_else(|| Error::bad_changeset(format!("bad payload type code {}", code)))
}

fn collection_type(code: u8) -> Result<CollectionType> {
    Ok(match code {
        0 => CollectionType::Single,
        1 => CollectionType::List,
        2 => CollectionType::Dictionary,
        3 => CollectionType::Set,
        _ => return Err(Error::bad_changeset("bad collection type")),
    })
}

fn link_type(code: u8) -> Result<LinkType> {
    link_type_from(code)
}

fn link_type_from(code: u8) -> Result<LinkType> {
    Ok(match code {
        0 => LinkType::Strong,
        1 => LinkType::Weak,
        _ => return Err(Error::bad_changeset("bad link type")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::encode::encode_changeset;
    use crate::sync::instruction::*;

    fn sample_changeset() -> Changeset {
        let mut cs = Changeset::with_origin(1234, 7);
        cs.version = 3;
        cs.last_integrated_remote_version = 2;

        let table = cs.intern_str("person");
        let pk_field = cs.intern_str("id");
        let name = cs.intern_str("name");
        let scores = cs.intern_str("scores");
        let value = cs.intern_str("Eva");

        cs.push(Instruction::AddTable(AddTable {
            table,
            ty: TableType::TopLevel {
                pk_field,
                pk_type: PayloadType::Int,
                pk_nullable: false,
            },
        }));
        cs.push(Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(5),
        }));
        cs.push(Instruction::Update(Update {
            path: Path::new(table, PrimaryKey::Int(5), name),
            value: Payload::String(value),
            is_default: false,
            prior_size: 0,
            prior: Some(Payload::Null),
        }));
        let mut list_path = Path::new(table, PrimaryKey::Int(5), scores);
        list_path.elements.push(PathElement::Index(0));
        cs.push(Instruction::ArrayInsert(ArrayInsert {
            path: list_path.clone(),
            value: Payload::Int(10),
            prior_size: 0,
        }));
        list_path.set_index(1);
        cs.push(Instruction::ArrayInsert(ArrayInsert {
            path: list_path,
            value: Payload::Int(20),
            prior_size: 1,
        }));
        cs
    }

    #[test]
    fn encode_parse_round_trip() {
        let cs = sample_changeset();

        let bytes = encode_changeset(&cs);
        let parsed = parse_changeset(&bytes).unwrap();

        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.last_integrated_remote_version, 2);
        assert_eq!(parsed.origin_file_ident, 7);
        assert_eq!(parsed.origin_timestamp, 1234);
        assert_eq!(parsed.len(), cs.len());

        // Round-trip equality modulo interned-string renumbering: the
        // canonical encoding must be identical.
        assert_eq!(encode_changeset(&parsed), bytes);
    }

    #[test]
    fn selection_is_not_repeated_per_instruction() {
        let cs = sample_changeset();
        let bytes = encode_changeset(&cs);

        // One SelectTable and one SelectList despite five instructions.
        let select_tables = bytes.iter().filter(|&&b| b == TAG_SELECT_TABLE).count();
        assert!(select_tables >= 1);
        // The two consecutive list inserts share one selection: the
        // second ArrayInsert tag follows the first's payload directly.
        let select_lists = bytes
            .windows(1)
            .filter(|w| w[0] == TAG_SELECT_LIST)
            .count();
        assert_eq!(select_lists, 1);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let cs = sample_changeset();
        let bytes = encode_changeset(&cs);

        let err = match parse_changeset(&bytes[..bytes.len() - 3]) {
            Err(e) => e,
            Ok(_) => panic!("expected parse to fail"),
        };
        assert!(matches!(err, Error::BadChangeset(_)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut cs = Changeset::new();
        cs.version = 1;
        let mut bytes = encode_changeset(&cs);
        bytes.push(200); // no such tag

        let err = match parse_changeset(&bytes) {
            Err(e) => e,
            Ok(_) => panic!("expected parse to fail"),
        };
        assert!(matches!(err, Error::BadChangeset(_)));
    }

    #[test]
    fn instruction_before_selection_is_rejected() {
        let mut bytes = Vec::new();
        // Header.
        crate::sync::wire::write_uvarint(&mut bytes, 1);
        crate::sync::wire::write_uvarint(&mut bytes, 0);
        crate::sync::wire::write_uvarint(&mut bytes, 0);
        crate::sync::wire::write_svarint(&mut bytes, 0);
        // CreateObject without a selected table.
        bytes.push(TAG_CREATE_OBJECT);
        bytes.push(0);
        crate::sync::wire::write_svarint(&mut bytes, 1);

        let err = match parse_changeset(&bytes) {
            Err(e) => e,
            Ok(_) => panic!("expected parse to fail"),
        };
        assert!(matches!(err, Error::BadChangeset(_)));
    }
}
