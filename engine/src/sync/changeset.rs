//! The in-memory representation of a transaction log: an ordered
//! sequence of instructions, an interned string pool, and the origin
//! coordinates (version, file ident, timestamp) the merge engine uses
//! for tie-breaking.
//!
//! Instructions are discarded in place by tombstoning; cursors skip
//! tombstones without reindexing. Prepends insert before a position and
//! shift everything behind them.

use fixedbitset::FixedBitSet;
use indexmap::IndexSet;

use crate::sync::instruction::{
    ColumnSchema, InternString, Instruction, Path, PathElement, Payload, PrimaryKey, TableSchema,
    TableType,
};

/// A per-changeset string pool. Ids are insertion-ordered indices;
/// equality of ids within one pool implies byte equality.
#[derive(Debug, Default, Clone)]
pub struct Interner {
    pool: IndexSet<Box<[u8]>>,
}

impl Interner {
    pub fn intern(&mut self, bytes: &[u8]) -> InternString {
        if let Some(ndx) = self.pool.get_index_of(bytes) {
            return InternString(ndx as u32);
        }
        let (ndx, _) = self.pool.insert_full(bytes.to_vec().into_boxed_slice());
        InternString(ndx as u32)
    }

    pub fn get(&self, s: InternString) -> &[u8] {
        self.pool
            .get_index(s.0 as usize)
            .expect("intern id from a foreign changeset")
    }

    pub fn get_str(&self, s: InternString) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.get(s))
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// An ordered sequence of instructions plus its string pool and origin
/// coordinates.
#[derive(Clone)]
pub struct Changeset {
    instructions: Vec<Instruction>,
    tombstones: FixedBitSet,
    interner: Interner,
    /// Monotonic per originating file.
    pub version: u64,
    /// The last remote version integrated before this changeset.
    pub last_integrated_remote_version: u64,
    /// Assigned by the server on first sync; 0 until then.
    pub origin_file_ident: u64,
    /// Milliseconds-since-epoch style; server-assignable.
    pub origin_timestamp: i64,
    dirty: bool,
}

impl Default for Changeset {
    fn default() -> Self {
        Changeset::new()
    }
}

impl Changeset {
    pub fn new() -> Changeset {
        Changeset {
            instructions: Vec::new(),
            tombstones: FixedBitSet::new(),
            interner: Interner::default(),
            version: 0,
            last_integrated_remote_version: 0,
            origin_file_ident: 0,
            origin_timestamp: 0,
            dirty: false,
        }
    }

    /// A changeset with explicit origin coordinates.
    pub fn with_origin(origin_timestamp: i64, origin_file_ident: u64) -> Changeset {
        let mut cs = Changeset::new();
        cs.origin_timestamp = origin_timestamp;
        cs.origin_file_ident = origin_file_ident;
        cs
    }

    /// Number of instruction slots, tombstones included.
    pub fn slot_count(&self) -> usize {
        self.instructions.len()
    }

    /// Number of live instructions.
    pub fn len(&self) -> usize {
        self.instructions.len() - self.tombstones.count_ones(..)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, instr: Instruction) {
        self.instructions.push(instr);
        self.tombstones.grow(self.instructions.len());
    }

    pub fn is_tombstone(&self, ndx: usize) -> bool {
        self.tombstones.contains(ndx)
    }

    /// The instruction at `ndx`, unless tombstoned.
    pub fn get(&self, ndx: usize) -> Option<&Instruction> {
        if self.tombstones.contains(ndx) {
            None
        } else {
            self.instructions.get(ndx)
        }
    }

    pub fn get_mut(&mut self, ndx: usize) -> Option<&mut Instruction> {
        if self.tombstones.contains(ndx) {
            None
        } else {
            self.instructions.get_mut(ndx)
        }
    }

    /// Overwrite the instruction at `ndx`.
    pub fn replace(&mut self, ndx: usize, instr: Instruction) {
        debug_assert!(!self.tombstones.contains(ndx));
        self.instructions[ndx] = instr;
    }

    /// Discard the instruction in place. Cursors skip the tombstone.
    pub fn discard(&mut self, ndx: usize) {
        self.tombstones.insert(ndx);
        self.dirty = true;
    }

    /// Insert instructions before `ndx`, shifting the rest up.
    pub fn insert_before(&mut self, ndx: usize, instrs: Vec<Instruction>) {
        let count = instrs.len();
        if count == 0 {
            return;
        }
        for (offset, instr) in instrs.into_iter().enumerate() {
            self.instructions.insert(ndx + offset, instr);
        }
        // The tombstone bitmap has no insert; rebuild with the gap.
        let mut grown = FixedBitSet::with_capacity(self.instructions.len());
        for bit in self.tombstones.ones() {
            if bit < ndx {
                grown.insert(bit);
            } else {
                grown.insert(bit + count);
            }
        }
        self.tombstones = grown;
        self.dirty = true;
    }

    /// Iterate live instructions with their slot positions.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Instruction)> + '_ {
        self.instructions
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.tombstones.contains(*i))
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ---- strings ----

    pub fn intern_string(&mut self, bytes: &[u8]) -> InternString {
        self.interner.intern(bytes)
    }

    pub fn intern_str(&mut self, s: &str) -> InternString {
        self.interner.intern(s.as_bytes())
    }

    pub fn string(&self, s: InternString) -> &[u8] {
        self.interner.get(s)
    }

    pub fn string_str(&self, s: InternString) -> std::borrow::Cow<'_, str> {
        self.interner.get_str(s)
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Copy a string from another changeset's pool into this one.
    pub fn adopt_string(&mut self, other: &Changeset, s: InternString) -> InternString {
        let bytes = other.string(s).to_vec();
        self.intern_string(&bytes)
    }

    /// Copy a primary key across pools.
    pub fn adopt_key(&mut self, other: &Changeset, key: &PrimaryKey) -> PrimaryKey {
        match key {
            PrimaryKey::String(s) => PrimaryKey::String(self.adopt_string(other, *s)),
            other_key => *other_key,
        }
    }

    /// Copy a payload across pools.
    pub fn adopt_payload(&mut self, other: &Changeset, payload: &Payload) -> Payload {
        match payload {
            Payload::String(s) => Payload::String(self.adopt_string(other, *s)),
            Payload::Binary(s) => Payload::Binary(self.adopt_string(other, *s)),
            Payload::Link {
                target_table,
                target,
            } => Payload::Link {
                target_table: self.adopt_string(other, *target_table),
                target: self.adopt_key(other, target),
            },
            p => *p,
        }
    }

    /// Copy a path across pools.
    pub fn adopt_path(&mut self, other: &Changeset, path: &Path) -> Path {
        let mut adopted = Path::new(
            self.adopt_string(other, path.table),
            self.adopt_key(other, &path.object),
            self.adopt_string(other, path.field),
        );
        for element in &path.elements {
            adopted.elements.push(match element {
                PathElement::Index(i) => PathElement::Index(*i),
                PathElement::Key(k) => PathElement::Key(self.adopt_string(other, *k)),
            });
        }
        adopted
    }

    fn adopt_column_schema(&mut self, other: &Changeset, schema: &ColumnSchema) -> ColumnSchema {
        ColumnSchema {
            field: self.adopt_string(other, schema.field),
            ty: schema.ty,
            nullable: schema.nullable,
            collection: schema.collection,
            link_target: schema.link_target.map(|t| self.adopt_string(other, t)),
        }
    }

    fn adopt_table_type(&mut self, other: &Changeset, ty: &TableType) -> TableType {
        match ty {
            TableType::TopLevel {
                pk_field,
                pk_type,
                pk_nullable,
            } => TableType::TopLevel {
                pk_field: self.adopt_string(other, *pk_field),
                pk_type: *pk_type,
                pk_nullable: *pk_nullable,
            },
            TableType::Embedded => TableType::Embedded,
        }
    }

    /// Deep-copy an instruction from another changeset, re-interning
    /// every string it references. Mandatory whenever the merge engine
    /// prepends an instruction derived from the opposite side.
    pub fn adopt_instruction(&mut self, other: &Changeset, instr: &Instruction) -> Instruction {
        use crate::sync::instruction as ins;
        match instr {
            Instruction::AddTable(i) => Instruction::AddTable(ins::AddTable {
                table: self.adopt_string(other, i.table),
                ty: self.adopt_table_type(other, &i.ty),
            }),
            Instruction::EraseTable(i) => Instruction::EraseTable(ins::EraseTable {
                table: self.adopt_string(other, i.table),
                prior: i.prior.as_ref().map(|schema| TableSchema {
                    ty: self.adopt_table_type(other, &schema.ty),
                    columns: schema
                        .columns
                        .iter()
                        .map(|c| self.adopt_column_schema(other, c))
                        .collect(),
                }),
            }),
            Instruction::AddColumn(i) => Instruction::AddColumn(ins::AddColumn {
                table: self.adopt_string(other, i.table),
                field: self.adopt_string(other, i.field),
                ty: i.ty,
                nullable: i.nullable,
                collection: i.collection,
                link_target: i.link_target.map(|t| self.adopt_string(other, t)),
            }),
            Instruction::EraseColumn(i) => Instruction::EraseColumn(ins::EraseColumn {
                table: self.adopt_string(other, i.table),
                field: self.adopt_string(other, i.field),
                prior: i.prior.as_ref().map(|c| self.adopt_column_schema(other, c)),
            }),
            Instruction::RenameColumn(i) => Instruction::RenameColumn(ins::RenameColumn {
                table: self.adopt_string(other, i.table),
                field: self.adopt_string(other, i.field),
                new_name: self.adopt_string(other, i.new_name),
            }),
            Instruction::AddSearchIndex(i) => Instruction::AddSearchIndex(ins::AddSearchIndex {
                table: self.adopt_string(other, i.table),
                field: self.adopt_string(other, i.field),
            }),
            Instruction::RemoveSearchIndex(i) => {
                Instruction::RemoveSearchIndex(ins::RemoveSearchIndex {
                    table: self.adopt_string(other, i.table),
                    field: self.adopt_string(other, i.field),
                })
            }
            Instruction::SetLinkType(i) => Instruction::SetLinkType(ins::SetLinkType {
                table: self.adopt_string(other, i.table),
                field: self.adopt_string(other, i.field),
                link_type: i.link_type,
                prior: i.prior,
            }),
            Instruction::CreateObject(i) => Instruction::CreateObject(ins::CreateObject {
                table: self.adopt_string(other, i.table),
                object: self.adopt_key(other, &i.object),
            }),
            Instruction::EraseObject(i) => Instruction::EraseObject(ins::EraseObject {
                table: self.adopt_string(other, i.table),
                object: self.adopt_key(other, &i.object),
                prior_fields: i
                    .prior_fields
                    .iter()
                    .map(|(f, p)| {
                        let f = self.adopt_string(other, *f);
                        let p = self.adopt_payload(other, p);
                        (f, p)
                    })
                    .collect(),
            }),
            Instruction::Update(i) => Instruction::Update(ins::Update {
                path: self.adopt_path(other, &i.path),
                value: self.adopt_payload(other, &i.value),
                is_default: i.is_default,
                prior_size: i.prior_size,
                prior: i.prior.as_ref().map(|p| self.adopt_payload(other, p)),
            }),
            Instruction::AddInteger(i) => Instruction::AddInteger(ins::AddInteger {
                path: self.adopt_path(other, &i.path),
                value: i.value,
            }),
            Instruction::ArrayInsert(i) => Instruction::ArrayInsert(ins::ArrayInsert {
                path: self.adopt_path(other, &i.path),
                value: self.adopt_payload(other, &i.value),
                prior_size: i.prior_size,
            }),
            Instruction::ArrayMove(i) => Instruction::ArrayMove(ins::ArrayMove {
                path: self.adopt_path(other, &i.path),
                ndx_2: i.ndx_2,
                prior_size: i.prior_size,
            }),
            Instruction::ArrayErase(i) => Instruction::ArrayErase(ins::ArrayErase {
                path: self.adopt_path(other, &i.path),
                prior_size: i.prior_size,
                prior: i.prior.as_ref().map(|p| self.adopt_payload(other, p)),
            }),
            Instruction::Clear(i) => Instruction::Clear(ins::Clear {
                path: self.adopt_path(other, &i.path),
                prior_size: i.prior_size,
                prior_items: i
                    .prior_items
                    .iter()
                    .map(|p| self.adopt_payload(other, p))
                    .collect(),
            }),
            Instruction::SetInsert(i) => Instruction::SetInsert(ins::SetInsert {
                path: self.adopt_path(other, &i.path),
                value: self.adopt_payload(other, &i.value),
            }),
            Instruction::SetErase(i) => Instruction::SetErase(ins::SetErase {
                path: self.adopt_path(other, &i.path),
                value: self.adopt_payload(other, &i.value),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::instruction::{CreateObject, PrimaryKey};

    fn create(table: &str, cs: &mut Changeset, pk: i64) -> Instruction {
        let table = cs.intern_str(table);
        Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(pk),
        })
    }

    #[test]
    fn interner_ids_are_stable_and_deduplicated() {
        let mut interner = Interner::default();

        let a = interner.intern(b"alpha");
        let b = interner.intern(b"beta");
        let a2 = interner.intern(b"alpha");

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(interner.get(a), b"alpha");
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn tombstones_hide_but_preserve_positions() {
        let mut cs = Changeset::new();
        for pk in 0..4 {
            let instr = create("t", &mut cs, pk);
            cs.push(instr);
        }

        cs.discard(1);

        assert_eq!(cs.slot_count(), 4);
        assert_eq!(cs.len(), 3);
        assert!(cs.get(1).is_none());
        assert!(cs.is_tombstone(1));
        let positions: Vec<usize> = cs.iter().map(|(i, _)| i).collect();
        assert_eq!(positions, vec![0, 2, 3]);
        assert!(cs.is_dirty());
    }

    #[test]
    fn insert_before_shifts_tombstones() {
        let mut cs = Changeset::new();
        for pk in 0..3 {
            let instr = create("t", &mut cs, pk);
            cs.push(instr);
        }
        cs.discard(2);

        let prepended = create("t", &mut cs, 100);
        cs.insert_before(1, vec![prepended]);

        assert_eq!(cs.slot_count(), 4);
        assert!(!cs.is_tombstone(1));
        assert!(cs.is_tombstone(3)); // shifted from position 2
        let pks: Vec<i64> = cs
            .iter()
            .filter_map(|(_, i)| match i {
                Instruction::CreateObject(c) => match c.object {
                    PrimaryKey::Int(v) => Some(v),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(pks, vec![0, 100, 1]);
    }

    #[test]
    fn adopt_string_copies_across_pools() {
        let mut a = Changeset::new();
        let mut b = Changeset::new();
        // Force differing id assignment in the pools.
        b.intern_str("occupies-slot-zero");

        let s = a.intern_str("shared");
        let adopted = b.adopt_string(&a, s);

        assert_eq!(b.string(adopted), b"shared");
        assert_ne!(s.0, adopted.0);
    }
}
