//! The closed instruction set of a changeset: schema changes, object
//! lifecycle, and path-addressed mutations, together with the payload
//! union they carry.
//!
//! Strings inside instructions are interned per changeset; an
//! [`InternString`] is only meaningful against the pool of the
//! changeset that owns the instruction. Moving an instruction between
//! changesets requires adopting every string into the destination pool.

use smallvec::SmallVec;

/// Index into a changeset's interned string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternString(pub u32);

/// A 12-byte object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub [u8; 12]);

/// A 16-byte universally unique identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(pub [u8; 16]);

/// An opaque 128-bit decimal, carried as its bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal128(pub [u8; 16]);

/// A point in time: seconds since the epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: i32,
}

/// The primary key of an object, as referenced from instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaryKey {
    Int(i64),
    String(InternString),
    ObjectId(ObjectId),
    Uuid(Uuid),
}

/// Type codes of the payload union. The wire writes these as signed
/// integers; `-1` in a type field is the null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Null = -1,
    Erased = -2,
    Dictionary = -3,
    ObjectValue = -4,
    Int = 0,
    Bool = 1,
    Float = 2,
    Double = 3,
    Decimal = 4,
    Timestamp = 5,
    ObjectId = 6,
    Uuid = 7,
    String = 8,
    Binary = 9,
    Link = 10,
}

impl PayloadType {
    pub fn from_code(code: i64) -> Option<PayloadType> {
        Some(match code {
            -1 => PayloadType::Null,
            -2 => PayloadType::Erased,
            -3 => PayloadType::Dictionary,
            -4 => PayloadType::ObjectValue,
            0 => PayloadType::Int,
            1 => PayloadType::Bool,
            2 => PayloadType::Float,
            3 => PayloadType::Double,
            4 => PayloadType::Decimal,
            5 => PayloadType::Timestamp,
            6 => PayloadType::ObjectId,
            7 => PayloadType::Uuid,
            8 => PayloadType::String,
            9 => PayloadType::Binary,
            10 => PayloadType::Link,
            _ => return None,
        })
    }
}

/// A value carried by an instruction. `Dictionary` and `ObjectValue`
/// are container-creation sentinels; `Erased` tombstones a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Null,
    Erased,
    Dictionary,
    ObjectValue,
    Int(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
    Decimal(Decimal128),
    Timestamp(Timestamp),
    ObjectId(ObjectId),
    Uuid(Uuid),
    String(InternString),
    Binary(InternString),
    Link {
        target_table: InternString,
        target: PrimaryKey,
    },
}

impl Payload {
    pub fn type_of(&self) -> PayloadType {
        match self {
            Payload::Null => PayloadType::Null,
            Payload::Erased => PayloadType::Erased,
            Payload::Dictionary => PayloadType::Dictionary,
            Payload::ObjectValue => PayloadType::ObjectValue,
            Payload::Int(_) => PayloadType::Int,
            Payload::Bool(_) => PayloadType::Bool,
            Payload::Float(_) => PayloadType::Float,
            Payload::Double(_) => PayloadType::Double,
            Payload::Decimal(_) => PayloadType::Decimal,
            Payload::Timestamp(_) => PayloadType::Timestamp,
            Payload::ObjectId(_) => PayloadType::ObjectId,
            Payload::Uuid(_) => PayloadType::Uuid,
            Payload::String(_) => PayloadType::String,
            Payload::Binary(_) => PayloadType::Binary,
            Payload::Link { .. } => PayloadType::Link,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }
}

/// One step below the field in a mutation path: a list index or a
/// dictionary key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathElement {
    Index(u32),
    Key(InternString),
}

/// The address of a path instruction's target:
/// `(table, object, field, [index | key]*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub table: InternString,
    pub object: PrimaryKey,
    pub field: InternString,
    pub elements: SmallVec<[PathElement; 2]>,
}

impl Path {
    pub fn new(table: InternString, object: PrimaryKey, field: InternString) -> Path {
        Path {
            table,
            object,
            field,
            elements: SmallVec::new(),
        }
    }

    /// Nesting depth: table, object, field, then one per element.
    pub fn len(&self) -> usize {
        3 + self.elements.len()
    }

    /// Whether the path addresses an array element (trailing index).
    pub fn is_array_path(&self) -> bool {
        matches!(self.elements.last(), Some(PathElement::Index(_)))
    }

    /// The trailing array index.
    ///
    /// # Panics
    /// Panics if the path does not end in an index.
    pub fn index(&self) -> u32 {
        match self.elements.last() {
            Some(PathElement::Index(i)) => *i,
            _ => panic!("path does not address an array element"),
        }
    }

    pub fn set_index(&mut self, index: u32) {
        match self.elements.last_mut() {
            Some(PathElement::Index(i)) => *i = index,
            _ => panic!("path does not address an array element"),
        }
    }
}

/// Whether a column holds one value or a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    Single = 0,
    List = 1,
    Dictionary = 2,
    Set = 3,
}

/// Link semantics of a link column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Strong = 0,
    Weak = 1,
}

/// How a new table is keyed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TableType {
    TopLevel {
        pk_field: InternString,
        pk_type: PayloadType,
        pk_nullable: bool,
    },
    Embedded,
}

/// The schema details of one column, carried by destructive schema
/// instructions so the log stays reversible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSchema {
    pub field: InternString,
    pub ty: PayloadType,
    pub nullable: bool,
    pub collection: CollectionType,
    pub link_target: Option<InternString>,
}

/// The schema details of an erased table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub ty: TableType,
    pub columns: Vec<ColumnSchema>,
}

// ---- instruction variants ----

#[derive(Debug, Clone, PartialEq)]
pub struct AddTable {
    pub table: InternString,
    pub ty: TableType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EraseTable {
    pub table: InternString,
    /// Captured by the recorder; absent in parsed foreign logs that
    /// never carried it.
    pub prior: Option<TableSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddColumn {
    pub table: InternString,
    pub field: InternString,
    pub ty: PayloadType,
    pub nullable: bool,
    pub collection: CollectionType,
    pub link_target: Option<InternString>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EraseColumn {
    pub table: InternString,
    pub field: InternString,
    pub prior: Option<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenameColumn {
    pub table: InternString,
    pub field: InternString,
    pub new_name: InternString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddSearchIndex {
    pub table: InternString,
    pub field: InternString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveSearchIndex {
    pub table: InternString,
    pub field: InternString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetLinkType {
    pub table: InternString,
    pub field: InternString,
    pub link_type: LinkType,
    pub prior: Option<LinkType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateObject {
    pub table: InternString,
    pub object: PrimaryKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EraseObject {
    pub table: InternString,
    pub object: PrimaryKey,
    /// Field values displaced by the erase, for reversal.
    pub prior_fields: Vec<(InternString, Payload)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub path: Path,
    pub value: Payload,
    /// A default-value update loses to any non-default one.
    pub is_default: bool,
    /// Container size before the update; meaningful for array updates.
    pub prior_size: u32,
    /// The displaced value, for reversal.
    pub prior: Option<Payload>,
}

impl Update {
    pub fn is_array_update(&self) -> bool {
        self.path.is_array_path()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddInteger {
    pub path: Path,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInsert {
    /// Ends in the insertion index.
    pub path: Path,
    pub value: Payload,
    pub prior_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMove {
    /// Ends in the source index.
    pub path: Path,
    /// The destination index, interpreted after removal of the source.
    pub ndx_2: u32,
    pub prior_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayErase {
    /// Ends in the erased index.
    pub path: Path,
    pub prior_size: u32,
    /// The displaced value, for reversal.
    pub prior: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clear {
    /// Addresses the container itself (no trailing index).
    pub path: Path,
    pub prior_size: u32,
    /// The displaced values, for reversal.
    pub prior_items: Vec<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetInsert {
    pub path: Path,
    pub value: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetErase {
    pub path: Path,
    pub value: Payload,
}

/// One element of a changeset.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    AddTable(AddTable),
    EraseTable(EraseTable),
    AddColumn(AddColumn),
    EraseColumn(EraseColumn),
    RenameColumn(RenameColumn),
    AddSearchIndex(AddSearchIndex),
    RemoveSearchIndex(RemoveSearchIndex),
    SetLinkType(SetLinkType),
    CreateObject(CreateObject),
    EraseObject(EraseObject),
    Update(Update),
    AddInteger(AddInteger),
    ArrayInsert(ArrayInsert),
    ArrayMove(ArrayMove),
    ArrayErase(ArrayErase),
    Clear(Clear),
    SetInsert(SetInsert),
    SetErase(SetErase),
}

impl Instruction {
    /// The table the instruction targets.
    pub fn table(&self) -> InternString {
        match self {
            Instruction::AddTable(i) => i.table,
            Instruction::EraseTable(i) => i.table,
            Instruction::AddColumn(i) => i.table,
            Instruction::EraseColumn(i) => i.table,
            Instruction::RenameColumn(i) => i.table,
            Instruction::AddSearchIndex(i) => i.table,
            Instruction::RemoveSearchIndex(i) => i.table,
            Instruction::SetLinkType(i) => i.table,
            Instruction::CreateObject(i) => i.table,
            Instruction::EraseObject(i) => i.table,
            Instruction::Update(i) => i.path.table,
            Instruction::AddInteger(i) => i.path.table,
            Instruction::ArrayInsert(i) => i.path.table,
            Instruction::ArrayMove(i) => i.path.table,
            Instruction::ArrayErase(i) => i.path.table,
            Instruction::Clear(i) => i.path.table,
            Instruction::SetInsert(i) => i.path.table,
            Instruction::SetErase(i) => i.path.table,
        }
    }

    /// The object key, for object and path instructions.
    pub fn object(&self) -> Option<PrimaryKey> {
        match self {
            Instruction::CreateObject(i) => Some(i.object),
            Instruction::EraseObject(i) => Some(i.object),
            Instruction::Update(i) => Some(i.path.object),
            Instruction::AddInteger(i) => Some(i.path.object),
            Instruction::ArrayInsert(i) => Some(i.path.object),
            Instruction::ArrayMove(i) => Some(i.path.object),
            Instruction::ArrayErase(i) => Some(i.path.object),
            Instruction::Clear(i) => Some(i.path.object),
            Instruction::SetInsert(i) => Some(i.path.object),
            Instruction::SetErase(i) => Some(i.path.object),
            _ => None,
        }
    }

    /// The mutation path, for path instructions.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Instruction::Update(i) => Some(&i.path),
            Instruction::AddInteger(i) => Some(&i.path),
            Instruction::ArrayInsert(i) => Some(&i.path),
            Instruction::ArrayMove(i) => Some(&i.path),
            Instruction::ArrayErase(i) => Some(&i.path),
            Instruction::Clear(i) => Some(&i.path),
            Instruction::SetInsert(i) => Some(&i.path),
            Instruction::SetErase(i) => Some(&i.path),
            _ => None,
        }
    }

    /// Nesting depth of the target: 1 for table-level schema, 2 for
    /// object lifecycle, 3 and up for path instructions.
    pub fn path_len(&self) -> usize {
        match self {
            Instruction::AddTable(_)
            | Instruction::EraseTable(_)
            | Instruction::AddColumn(_)
            | Instruction::EraseColumn(_)
            | Instruction::RenameColumn(_)
            | Instruction::AddSearchIndex(_)
            | Instruction::RemoveSearchIndex(_)
            | Instruction::SetLinkType(_) => 1,
            Instruction::CreateObject(_) | Instruction::EraseObject(_) => 2,
            _ => self.path().expect("path instruction").len(),
        }
    }

    /// Ordering used to canonicalize the pairwise merge rules: each
    /// unordered pair of instruction types is handled with the
    /// higher-ranked side on the left.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Instruction::AddTable(_) => 0,
            Instruction::EraseTable(_) => 1,
            Instruction::CreateObject(_) => 2,
            Instruction::EraseObject(_) => 3,
            Instruction::Update(_) => 4,
            Instruction::AddInteger(_) => 5,
            Instruction::AddColumn(_) => 6,
            Instruction::EraseColumn(_) => 7,
            Instruction::RenameColumn(_) => 8,
            Instruction::AddSearchIndex(_) => 9,
            Instruction::RemoveSearchIndex(_) => 10,
            Instruction::SetLinkType(_) => 11,
            Instruction::ArrayInsert(_) => 12,
            Instruction::ArrayMove(_) => 13,
            Instruction::ArrayErase(_) => 14,
            Instruction::Clear(_) => 15,
            Instruction::SetInsert(_) => 16,
            Instruction::SetErase(_) => 17,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_len_counts_nesting() {
        let mut path = Path::new(InternString(0), PrimaryKey::Int(5), InternString(1));
        assert_eq!(path.len(), 3);
        assert!(!path.is_array_path());

        path.elements.push(PathElement::Index(2));
        assert_eq!(path.len(), 4);
        assert!(path.is_array_path());
        assert_eq!(path.index(), 2);

        path.set_index(7);
        assert_eq!(path.index(), 7);
    }

    #[test]
    fn instruction_path_lens() {
        let table = InternString(0);
        let field = InternString(1);
        let add = Instruction::AddTable(AddTable {
            table,
            ty: TableType::Embedded,
        });
        assert_eq!(add.path_len(), 1);

        let create = Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(1),
        });
        assert_eq!(create.path_len(), 2);

        let mut path = Path::new(table, PrimaryKey::Int(1), field);
        path.elements.push(PathElement::Index(0));
        let update = Instruction::Update(Update {
            path,
            value: Payload::Int(1),
            is_default: false,
            prior_size: 3,
            prior: None,
        });
        assert_eq!(update.path_len(), 4);
        assert!(matches!(&update, Instruction::Update(u) if u.is_array_update()));
    }

    #[test]
    fn payload_type_codes_round_trip() {
        for payload in [
            Payload::Null,
            Payload::Erased,
            Payload::Dictionary,
            Payload::ObjectValue,
            Payload::Int(1),
            Payload::Bool(true),
            Payload::Float(1.0),
            Payload::Double(1.0),
            Payload::Timestamp(Timestamp {
                seconds: 1,
                nanoseconds: 2,
            }),
            Payload::String(InternString(0)),
        ] {
            let code = payload.type_of() as i64;
            assert_eq!(PayloadType::from_code(code), Some(payload.type_of()));
        }
        assert_eq!(PayloadType::Null as i64, -1);
    }
}
