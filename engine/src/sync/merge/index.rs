//! The changeset index: groups the incoming batch's instructions into
//! conflict groups so merge work stays confined to instructions whose
//! targets can actually interact.
//!
//! Two passes: `scan_changeset` discovers the keys every instruction
//! touches (its object, link targets, or the table itself for schema
//! instructions) and unions groups transitively; `add_changeset` then
//! records, per group, the instruction ranges of each incoming
//! changeset. Local changesets participate in scanning only: their
//! instructions drive the unions but never appear in ranges.

use std::collections::HashMap;

use crate::sync::changeset::Changeset;
use crate::sync::instruction::{Instruction, Payload, PrimaryKey};

/// A resolved object key: strings are flattened to bytes so keys are
/// comparable across changesets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyPart {
    /// The table-level key; schema instructions use it, and it unions
    /// with every object of the table.
    TableLevel,
    Int(i64),
    Str(Vec<u8>),
    ObjectId([u8; 12]),
    Uuid([u8; 16]),
}

type GlobalKey = (Vec<u8>, KeyPart);

/// One contiguous run of instruction slots in one incoming changeset.
pub(crate) type Range = (usize, usize, usize); // (changeset, start, end)

pub(crate) struct ChangesetIndex {
    /// Union-find over group ids.
    parent: Vec<usize>,
    key_to_group: HashMap<GlobalKey, usize>,
    /// Ranges per group root, filled by `add_changeset`.
    ranges: HashMap<usize, Vec<Range>>,
}

impl ChangesetIndex {
    pub fn new() -> ChangesetIndex {
        ChangesetIndex {
            parent: Vec::new(),
            key_to_group: HashMap::new(),
            ranges: HashMap::new(),
        }
    }

    /// First pass: union the groups of every key an instruction touches.
    pub fn scan_changeset(&mut self, cs: &Changeset) {
        for (_, instr) in cs.iter() {
            let keys = instruction_keys(cs, instr);
            let mut first: Option<usize> = None;
            for key in keys {
                let group = self.group_for_key(key);
                if let Some(f) = first {
                    self.union(f, group);
                } else {
                    first = Some(group);
                }
            }
        }
    }

    /// Second pass: record the incoming instruction ranges per group.
    pub fn add_changeset(&mut self, cs_ndx: usize, cs: &Changeset) {
        for (pos, instr) in cs.iter() {
            let keys = instruction_keys(cs, instr);
            let Some(key) = keys.into_iter().next() else {
                continue;
            };
            let group = self.group_for_key(key);
            let root = self.find(group);
            let ranges = self.ranges.entry(root).or_default();
            match ranges.last_mut() {
                Some((last_cs, _, end)) if *last_cs == cs_ndx && *end == pos => *end = pos + 1,
                _ => ranges.push((cs_ndx, pos, pos + 1)),
            }
        }
    }

    /// The conflict ranges of the group(s) an instruction belongs to.
    pub fn ranges_for(&mut self, cs: &Changeset, instr: &Instruction) -> Vec<Range> {
        let mut out: Vec<Range> = Vec::new();
        let mut roots: Vec<usize> = Vec::new();
        for key in instruction_keys(cs, instr) {
            if let Some(&group) = self.key_to_group.get(&key) {
                let root = self.find(group);
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        for root in roots {
            if let Some(ranges) = self.ranges.get(&root) {
                out.extend_from_slice(ranges);
            }
        }
        out.sort_unstable();
        out
    }

    /// Every incoming instruction: the conflict scope of schema
    /// instructions.
    pub fn everything(incoming: &[Changeset]) -> Vec<Range> {
        incoming
            .iter()
            .enumerate()
            .filter(|(_, cs)| cs.slot_count() > 0)
            .map(|(i, cs)| (i, 0, cs.slot_count()))
            .collect()
    }

    /// Account for instructions prepended into an incoming changeset:
    /// ranges behind the insertion shift, ranges around it stretch.
    pub fn adjust_for_insert(&mut self, cs_ndx: usize, at: usize, count: usize) {
        for ranges in self.ranges.values_mut() {
            for (cs, start, end) in ranges.iter_mut() {
                if *cs != cs_ndx {
                    continue;
                }
                if at < *start {
                    *start += count;
                    *end += count;
                } else if at <= *end {
                    *end += count;
                }
            }
        }
    }

    pub fn num_conflict_groups(&self) -> usize {
        self.ranges.len()
    }

    fn group_for_key(&mut self, key: GlobalKey) -> usize {
        if let Some(&group) = self.key_to_group.get(&key) {
            return group;
        }
        let group = self.parent.len();
        self.parent.push(group);
        // A table-level key collapses every object group of that table;
        // an object key joins an existing table-level group.
        match &key.1 {
            KeyPart::TableLevel => {
                let table = key.0.clone();
                let objects: Vec<usize> = self
                    .key_to_group
                    .iter()
                    .filter(|((t, part), _)| *t == table && !matches!(part, KeyPart::TableLevel))
                    .map(|(_, &g)| g)
                    .collect();
                for other in objects {
                    self.union(group, other);
                }
            }
            _ => {
                let table_key = (key.0.clone(), KeyPart::TableLevel);
                if let Some(&table_group) = self.key_to_group.get(&table_key) {
                    self.union(group, table_group);
                }
            }
        }
        self.key_to_group.insert(key, group);
        group
    }

    fn find(&mut self, mut group: usize) -> usize {
        while self.parent[group] != group {
            let grandparent = self.parent[self.parent[group]];
            self.parent[group] = grandparent;
            group = grandparent;
        }
        group
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// The keys an instruction's targets resolve to: the object (or the
/// table for schema instructions) plus any link targets in payloads.
fn instruction_keys(cs: &Changeset, instr: &Instruction) -> Vec<GlobalKey> {
    let table = cs.string(instr.table()).to_vec();
    let mut keys = Vec::with_capacity(2);
    match instr.object() {
        Some(pk) => keys.push((table, key_part(cs, &pk))),
        None => keys.push((table, KeyPart::TableLevel)),
    }
    for payload in instruction_payloads(instr) {
        if let Payload::Link {
            target_table,
            target,
        } = payload
        {
            keys.push((cs.string(*target_table).to_vec(), key_part(cs, target)));
        }
    }
    keys
}

fn instruction_payloads(instr: &Instruction) -> Vec<&Payload> {
    match instr {
        Instruction::Update(i) => vec![&i.value],
        Instruction::ArrayInsert(i) => vec![&i.value],
        Instruction::SetInsert(i) => vec![&i.value],
        Instruction::SetErase(i) => vec![&i.value],
        _ => Vec::new(),
    }
}

fn key_part(cs: &Changeset, pk: &PrimaryKey) -> KeyPart {
    match pk {
        PrimaryKey::Int(v) => KeyPart::Int(*v),
        PrimaryKey::String(s) => KeyPart::Str(cs.string(*s).to_vec()),
        PrimaryKey::ObjectId(oid) => KeyPart::ObjectId(oid.0),
        PrimaryKey::Uuid(uuid) => KeyPart::Uuid(uuid.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::instruction::{CreateObject, Path, Update};

    fn create(cs: &mut Changeset, table: &str, pk: i64) {
        let table = cs.intern_str(table);
        cs.push(Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(pk),
        }));
    }

    fn update(cs: &mut Changeset, table: &str, pk: i64, field: &str, value: i64) {
        let table = cs.intern_str(table);
        let field = cs.intern_str(field);
        cs.push(Instruction::Update(Update {
            path: Path::new(table, PrimaryKey::Int(pk), field),
            value: Payload::Int(value),
            is_default: false,
            prior_size: 0,
            prior: None,
        }));
    }

    #[test]
    fn distinct_objects_get_distinct_groups() {
        let mut incoming = Changeset::new();
        create(&mut incoming, "t", 1);
        create(&mut incoming, "t", 2);

        let mut index = ChangesetIndex::new();
        index.scan_changeset(&incoming);
        index.add_changeset(0, &incoming);

        assert_eq!(index.num_conflict_groups(), 2);

        let ranges = index.ranges_for(&incoming, incoming.get(0).unwrap());
        assert_eq!(ranges, vec![(0, 0, 1)]);
    }

    #[test]
    fn consecutive_same_object_instructions_coalesce() {
        let mut incoming = Changeset::new();
        create(&mut incoming, "t", 1);
        update(&mut incoming, "t", 1, "a", 10);
        update(&mut incoming, "t", 1, "a", 20);

        let mut index = ChangesetIndex::new();
        index.scan_changeset(&incoming);
        index.add_changeset(0, &incoming);

        assert_eq!(index.num_conflict_groups(), 1);
        let ranges = index.ranges_for(&incoming, incoming.get(1).unwrap());
        assert_eq!(ranges, vec![(0, 0, 3)]);
    }

    #[test]
    fn adjust_for_insert_stretches_the_enclosing_range() {
        let mut incoming = Changeset::new();
        create(&mut incoming, "t", 1);
        update(&mut incoming, "t", 1, "a", 10);

        let mut index = ChangesetIndex::new();
        index.scan_changeset(&incoming);
        index.add_changeset(0, &incoming);

        index.adjust_for_insert(0, 1, 2);

        let ranges = index.ranges_for(&incoming, incoming.get(0).unwrap());
        assert_eq!(ranges, vec![(0, 0, 4)]);
    }

    #[test]
    fn link_payloads_union_with_the_target_object() {
        let mut incoming = Changeset::new();
        create(&mut incoming, "target", 9);

        let mut local = Changeset::new();
        let table = local.intern_str("source");
        let field = local.intern_str("link");
        let target_table = local.intern_str("target");
        local.push(Instruction::Update(Update {
            path: Path::new(table, PrimaryKey::Int(1), field),
            value: Payload::Link {
                target_table,
                target: PrimaryKey::Int(9),
            },
            is_default: false,
            prior_size: 0,
            prior: None,
        }));

        let mut index = ChangesetIndex::new();
        index.scan_changeset(&incoming);
        index.scan_changeset(&local);
        index.add_changeset(0, &incoming);

        // The local update's link target places it in the same group as
        // the incoming create.
        let ranges = index.ranges_for(&local, local.get(0).unwrap());
        assert_eq!(ranges, vec![(0, 0, 1)]);
    }
}
