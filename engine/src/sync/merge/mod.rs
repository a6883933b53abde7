//! The operational-transform merge engine.
//!
//! Given a batch of local changesets `L` and a batch of incoming remote
//! changesets `R`, both derived from a common base version, the
//! transformer rewrites both in place so that applying the rewritten
//! `L` after `R` and the rewritten `R` after `L` converge to the same
//! state, up to the documented tie-breaking policy (origin timestamp,
//! then origin file ident).
//!
//! The engine walks every local instruction (the major cursor) against
//! the incoming instructions of its conflict group (the minor cursor),
//! invoking the rule matrix for each pair. Rules mutate operations in
//! place, discard them (tombstones, skipped by the cursors), or prepend
//! derived operations, which are themselves merged before the major
//! cursor advances.

mod index;
mod rules;

use log::{debug, trace};

use crate::error::Result;
use crate::sync::changeset::Changeset;
use crate::sync::instruction::Instruction;
use index::ChangesetIndex;

/// The total order used to break merge ties: origin timestamp first,
/// origin file ident second. Two changesets from different files never
/// compare equal on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Discriminant {
    pub timestamp: i64,
    pub file_ident: u64,
}

impl Discriminant {
    fn of(cs: &Changeset) -> Discriminant {
        Discriminant {
            timestamp: cs.origin_timestamp,
            file_ident: cs.origin_file_ident,
        }
    }
}

/// One side of a rule invocation: the owning changeset, the tie-break
/// discriminant, and the rule's verdict for this side.
pub(crate) struct OpSide<'a> {
    pub cs: &'a mut Changeset,
    discriminant: Discriminant,
    pub discarded: bool,
    changed: bool,
    prepends: Vec<Instruction>,
}

impl<'a> OpSide<'a> {
    fn new(cs: &'a mut Changeset) -> OpSide<'a> {
        let discriminant = Discriminant::of(cs);
        OpSide {
            cs,
            discriminant,
            discarded: false,
            changed: false,
            prepends: Vec::new(),
        }
    }

    pub fn timestamp(&self) -> Discriminant {
        self.discriminant
    }

    /// Discard this side's operation; the driver tombstones it.
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    /// Note an in-place mutation of this side's operation.
    pub fn mark_dirty(&mut self) {
        self.changed = true;
    }

    /// Queue an operation to be inserted before this side's cursor. The
    /// instruction must already reference this side's string pool.
    pub fn prepend(&mut self, instr: Instruction) {
        self.prepends.push(instr);
    }
}

/// The pairwise transform engine. See the module docs.
pub struct Transformer;

impl Transformer {
    /// Rewrite `local` and `incoming` against each other, in place.
    ///
    /// On a schema mismatch both batches are left partially rewritten
    /// and must be discarded by the caller (along with any reciprocal
    /// cache).
    pub fn transform(local: &mut [Changeset], incoming: &mut [Changeset]) -> Result<()> {
        if local.is_empty() || incoming.is_empty() {
            return Ok(());
        }

        let mut index = ChangesetIndex::new();
        for cs in incoming.iter() {
            index.scan_changeset(cs);
        }
        // Local instructions drive group unions but contribute no
        // ranges.
        for cs in local.iter() {
            index.scan_changeset(cs);
        }
        for (i, cs) in incoming.iter().enumerate() {
            index.add_changeset(i, cs);
        }
        debug!(
            "transforming {} local changeset(s) through {} incoming changeset(s), {} conflict group(s)",
            local.len(),
            incoming.len(),
            index.num_conflict_groups()
        );

        for major in local.iter_mut() {
            let mut pos = 0;
            while pos < major.slot_count() {
                if major.is_tombstone(pos) {
                    pos += 1;
                    continue;
                }
                pos = merge_from(major, pos, incoming, &mut index)?;
            }
        }
        Ok(())
    }

    /// Convenience for the common single-changeset-per-side case.
    pub fn transform_pair(local: &mut Changeset, incoming: &mut Changeset) -> Result<()> {
        Transformer::transform(
            std::slice::from_mut(local),
            std::slice::from_mut(incoming),
        )
    }
}

/// Merge the major instruction at `pos`, then recursively merge any
/// operations the rules prepended before it. Returns the position just
/// past the fully handled instruction.
fn merge_from(
    major: &mut Changeset,
    pos: usize,
    incoming: &mut [Changeset],
    index: &mut ChangesetIndex,
) -> Result<usize> {
    let prepended = merge_one(major, pos, incoming, index)?;
    let mut p = pos;
    let mut remaining = prepended;
    while remaining > 0 {
        if major.is_tombstone(p) {
            p += 1;
        } else {
            p = merge_from(major, p, incoming, index)?;
        }
        remaining -= 1;
    }
    Ok(p + 1)
}

/// Walk the minor cursor over the conflict ranges of the major
/// instruction at `pos`, applying the rule matrix. Returns how many
/// operations were prepended before `pos` on the major side.
fn merge_one(
    major: &mut Changeset,
    pos: usize,
    incoming: &mut [Changeset],
    index: &mut ChangesetIndex,
) -> Result<usize> {
    let mut current = major
        .get(pos)
        .expect("merge cursor on a tombstone")
        .clone();

    // Schema instructions conflict with everything; object-addressed
    // instructions only with their group.
    let mut ranges = if current.path_len() <= 1 {
        ChangesetIndex::everything(incoming)
    } else {
        index.ranges_for(major, &current)
    };

    let mut major_discarded = false;
    let mut major_changed = false;
    let mut major_prepends: Vec<Instruction> = Vec::new();

    'ranges: for ri in 0..ranges.len() {
        let (cs_ndx, start, mut end) = ranges[ri];
        let mut mpos = start;
        while mpos < end {
            if incoming[cs_ndx].is_tombstone(mpos) {
                mpos += 1;
                continue;
            }
            let mut minor_instr = incoming[cs_ndx]
                .get(mpos)
                .expect("minor cursor on a tombstone")
                .clone();

            let (minor_discarded, minor_changed, minor_prepends) = {
                let mut major_side = OpSide::new(major);
                let mut minor_side = OpSide::new(&mut incoming[cs_ndx]);
                rules::merge_instructions(
                    &mut current,
                    &mut minor_instr,
                    &mut major_side,
                    &mut minor_side,
                )?;
                major_discarded = major_side.discarded;
                major_changed |= major_side.changed;
                major_prepends.extend(std::mem::take(&mut major_side.prepends));
                (
                    minor_side.discarded,
                    minor_side.changed,
                    std::mem::take(&mut minor_side.prepends),
                )
            };

            // Write the minor side back.
            if minor_discarded {
                trace!("minor instruction {}:{} discarded", cs_ndx, mpos);
                incoming[cs_ndx].discard(mpos);
            } else if minor_changed
                || incoming[cs_ndx].get(mpos).expect("live minor") != &minor_instr
            {
                incoming[cs_ndx].replace(mpos, minor_instr);
                incoming[cs_ndx].set_dirty(true);
            }

            // Prepended minor operations land before the minor cursor;
            // stretch the bookkeeping around them.
            if !minor_prepends.is_empty() {
                let count = minor_prepends.len();
                incoming[cs_ndx].insert_before(mpos, minor_prepends);
                index.adjust_for_insert(cs_ndx, mpos, count);
                for later in ranges[ri + 1..].iter_mut() {
                    if later.0 == cs_ndx && later.1 >= mpos {
                        later.1 += count;
                        later.2 += count;
                    }
                }
                mpos += count;
                end += count;
            }

            if major_discarded {
                // The discard moves the major cursor; stop the walk.
                break 'ranges;
            }
            mpos += 1;
        }
    }

    // Write the major side back.
    if major_discarded {
        trace!("major instruction {} discarded", pos);
        major.discard(pos);
    } else if major_changed || major.get(pos).expect("live major") != &current {
        major.replace(pos, current);
        major.set_dirty(true);
    }

    let count = major_prepends.len();
    if count > 0 {
        major.insert_before(pos, major_prepends);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::instruction::*;
    use crate::Error;

    fn update(cs: &mut Changeset, table: &str, pk: i64, field: &str, value: Payload) {
        let table = cs.intern_str(table);
        let field = cs.intern_str(field);
        cs.push(Instruction::Update(Update {
            path: Path::new(table, PrimaryKey::Int(pk), field),
            value,
            is_default: false,
            prior_size: 0,
            prior: None,
        }));
    }

    fn list_op_path(cs: &mut Changeset, table: &str, pk: i64, field: &str, ndx: u32) -> Path {
        let table = cs.intern_str(table);
        let field = cs.intern_str(field);
        let mut path = Path::new(table, PrimaryKey::Int(pk), field);
        path.elements.push(PathElement::Index(ndx));
        path
    }

    #[test]
    fn later_update_wins_same_field() {
        // Base: {pk = 5, a = 0}. Local sets 1 at t=100, remote sets 2
        // at t=200; the local update must vanish, the remote survive.
        let mut local = Changeset::with_origin(100, 1);
        update(&mut local, "T", 5, "a", Payload::Int(1));
        let mut remote = Changeset::with_origin(200, 2);
        update(&mut remote, "T", 5, "a", Payload::Int(2));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 0, "earlier update must be discarded");
        assert_eq!(remote.len(), 1, "later update must survive unchanged");
        let mut remote_iter = remote.iter();
        match remote_iter.next().unwrap().1 {
            Instruction::Update(u) => assert_eq!(u.value, Payload::Int(2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn insert_vs_erase_shift() {
        // Base list [x, y, z]. Local inserts w at 1 (t=100), remote
        // erases index 2 (t=200).
        let mut local = Changeset::with_origin(100, 1);
        let path = list_op_path(&mut local, "T", 5, "l", 1);
        local.push(Instruction::ArrayInsert(ArrayInsert {
            path,
            value: Payload::Int(42),
            prior_size: 3,
        }));
        let mut remote = Changeset::with_origin(200, 2);
        let path = list_op_path(&mut remote, "T", 5, "l", 2);
        remote.push(Instruction::ArrayErase(ArrayErase {
            path,
            prior_size: 3,
            prior: None,
        }));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        match local.iter().next().unwrap().1 {
            Instruction::ArrayInsert(i) => {
                assert_eq!(i.path.index(), 1, "insert below the erase stays put");
                assert_eq!(i.prior_size, 2, "erase shrank the base list");
            }
            other => panic!("unexpected {:?}", other),
        }
        let mut remote_iter = remote.iter();
        match remote_iter.next().unwrap().1 {
            Instruction::ArrayErase(e) => {
                assert_eq!(e.path.index(), 3, "erase shifts up past the insert");
                assert_eq!(e.prior_size, 4, "insert grew the base list");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn erase_object_beats_nested_update() {
        let mut local = Changeset::with_origin(100, 1);
        let table = local.intern_str("T");
        local.push(Instruction::EraseObject(EraseObject {
            table,
            object: PrimaryKey::Int(5),
            prior_fields: Vec::new(),
        }));
        let mut remote = Changeset::with_origin(200, 2);
        update(&mut remote, "T", 5, "a", Payload::Int(9));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 1, "the erase survives");
        assert_eq!(remote.len(), 0, "the nested update is discarded");
    }

    #[test]
    fn erase_beats_create_regardless_of_time() {
        let mut local = Changeset::with_origin(300, 1);
        let table = local.intern_str("T");
        local.push(Instruction::EraseObject(EraseObject {
            table,
            object: PrimaryKey::Int(5),
            prior_fields: Vec::new(),
        }));
        let mut remote = Changeset::with_origin(100, 2);
        let table = remote.intern_str("T");
        remote.push(Instruction::CreateObject(CreateObject {
            table,
            object: PrimaryKey::Int(5),
        }));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 1);
        assert_eq!(remote.len(), 0);
    }

    #[test]
    fn conflicting_column_types_raise_schema_mismatch() {
        let mut local = Changeset::with_origin(100, 1);
        let table = local.intern_str("T");
        let field = local.intern_str("x");
        local.push(Instruction::AddColumn(AddColumn {
            table,
            field,
            ty: PayloadType::Int,
            nullable: false,
            collection: CollectionType::Single,
            link_target: None,
        }));
        let mut remote = Changeset::with_origin(200, 2);
        let table = remote.intern_str("T");
        let field = remote.intern_str("x");
        remote.push(Instruction::AddColumn(AddColumn {
            table,
            field,
            ty: PayloadType::String,
            nullable: false,
            collection: CollectionType::Single,
            link_target: None,
        }));

        let err = Transformer::transform_pair(&mut local, &mut remote).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn identical_schema_instructions_cancel() {
        let mut local = Changeset::with_origin(100, 1);
        let table = local.intern_str("T");
        let field = local.intern_str("x");
        local.push(Instruction::AddColumn(AddColumn {
            table,
            field,
            ty: PayloadType::Int,
            nullable: false,
            collection: CollectionType::Single,
            link_target: None,
        }));
        let mut remote = Changeset::with_origin(200, 2);
        let table = remote.intern_str("T");
        let field = remote.intern_str("x");
        remote.push(Instruction::AddColumn(AddColumn {
            table,
            field,
            ty: PayloadType::Int,
            nullable: false,
            collection: CollectionType::Single,
            link_target: None,
        }));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 0);
        assert_eq!(remote.len(), 0);
    }

    #[test]
    fn same_position_inserts_order_by_timestamp() {
        let mut local = Changeset::with_origin(100, 1);
        let path = list_op_path(&mut local, "T", 5, "l", 0);
        local.push(Instruction::ArrayInsert(ArrayInsert {
            path,
            value: Payload::Int(1),
            prior_size: 0,
        }));
        let mut remote = Changeset::with_origin(200, 2);
        let path = list_op_path(&mut remote, "T", 5, "l", 0);
        remote.push(Instruction::ArrayInsert(ArrayInsert {
            path,
            value: Payload::Int(2),
            prior_size: 0,
        }));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        // The earlier insert keeps the lower index on both sides.
        match local.iter().next().unwrap().1 {
            Instruction::ArrayInsert(i) => {
                assert_eq!(i.path.index(), 0);
                assert_eq!(i.prior_size, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        let mut remote_iter = remote.iter();
        match remote_iter.next().unwrap().1 {
            Instruction::ArrayInsert(i) => {
                assert_eq!(i.path.index(), 1);
                assert_eq!(i.prior_size, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn add_integer_folds_into_earlier_update() {
        // The add is later than the set: its delta folds into the set's
        // payload on the remote side.
        let mut local = Changeset::with_origin(200, 1);
        let table = local.intern_str("T");
        let field = local.intern_str("a");
        local.push(Instruction::AddInteger(AddInteger {
            path: Path::new(table, PrimaryKey::Int(5), field),
            value: 10,
        }));
        let mut remote = Changeset::with_origin(100, 2);
        update(&mut remote, "T", 5, "a", Payload::Int(1));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 1, "the add survives");
        let mut remote_iter = remote.iter();
        match remote_iter.next().unwrap().1 {
            Instruction::Update(u) => assert_eq!(u.value, Payload::Int(11)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn two_erases_of_same_element_cancel() {
        let mut local = Changeset::with_origin(100, 1);
        let path = list_op_path(&mut local, "T", 5, "l", 1);
        local.push(Instruction::ArrayErase(ArrayErase {
            path,
            prior_size: 3,
            prior: None,
        }));
        let mut remote = Changeset::with_origin(200, 2);
        let path = list_op_path(&mut remote, "T", 5, "l", 1);
        remote.push(Instruction::ArrayErase(ArrayErase {
            path,
            prior_size: 3,
            prior: None,
        }));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 0);
        assert_eq!(remote.len(), 0);
    }

    #[test]
    fn clear_discards_nested_and_later_clear_wins() {
        let mut local = Changeset::with_origin(100, 1);
        let table = local.intern_str("T");
        let field = local.intern_str("l");
        local.push(Instruction::Clear(Clear {
            path: Path::new(table, PrimaryKey::Int(5), field),
            prior_size: 3,
            prior_items: Vec::new(),
        }));
        let mut remote = Changeset::with_origin(200, 2);
        let path = list_op_path(&mut remote, "T", 5, "l", 0);
        remote.push(Instruction::ArrayInsert(ArrayInsert {
            path,
            value: Payload::Int(7),
            prior_size: 3,
        }));
        let table = remote.intern_str("T");
        let field = remote.intern_str("l");
        remote.push(Instruction::Clear(Clear {
            path: Path::new(table, PrimaryKey::Int(5), field),
            prior_size: 4,
            prior_items: Vec::new(),
        }));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        // The remote clear is later: the local clear dies; the remote
        // insert (nested under the local clear) dies with it.
        assert_eq!(local.len(), 0);
        let kinds: Vec<&Instruction> = remote.iter().map(|(_, i)| i).collect();
        assert_eq!(kinds.len(), 1);
        assert!(matches!(kinds[0], Instruction::Clear(_)));
    }

    #[test]
    fn unrelated_objects_are_untouched() {
        let mut local = Changeset::with_origin(100, 1);
        update(&mut local, "T", 1, "a", Payload::Int(1));
        let mut remote = Changeset::with_origin(200, 2);
        update(&mut remote, "T", 2, "a", Payload::Int(2));

        Transformer::transform_pair(&mut local, &mut remote).unwrap();

        assert_eq!(local.len(), 1);
        assert_eq!(remote.len(), 1);
        assert!(!local.is_dirty());
        assert!(!remote.is_dirty());
    }
}
