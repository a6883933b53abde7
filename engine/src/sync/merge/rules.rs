//! The pairwise and nested merge rules.
//!
//! For every pair of instruction types one rule direction is
//! implemented; the opposite order delegates by swapping sides, which
//! the dispatcher does by canonicalizing on the instruction rank. A
//! rule may do nothing, mutate either operation in place, discard
//! either side, or prepend new operations before either cursor.
//!
//! Nested rules apply when one instruction's path is a strict prefix of
//! the other's; instructions at equal nesting meet through the pairwise
//! matrix, regardless of whether they share a prefix.

use crate::error::{Error, Result};
use crate::sync::changeset::Changeset;
use crate::sync::instruction::{
    EraseColumn, Instruction, InternString, Path, PathElement, Payload, PayloadType, PrimaryKey,
    TableType,
};
use crate::sync::merge::OpSide;

/// Merge one major/minor instruction pair: the nested rule when the
/// nesting levels differ, then the pairwise rule.
pub(crate) fn merge_instructions(
    major: &mut Instruction,
    minor: &mut Instruction,
    major_side: &mut OpSide<'_>,
    minor_side: &mut OpSide<'_>,
) -> Result<()> {
    let major_len = major.path_len();
    let minor_len = minor.path_len();

    if minor_len < major_len {
        merge_nested(minor, major, minor_side, major_side)?;
        if major_side.discarded {
            return Ok(());
        }
    } else if major_len < minor_len {
        merge_nested(major, minor, major_side, minor_side)?;
        if minor_side.discarded {
            return Ok(());
        }
    }

    if major_side.discarded || minor_side.discarded {
        return Ok(());
    }

    // Canonical order: the higher-ranked instruction type on the left.
    if major.rank() >= minor.rank() {
        merge_pair(major, minor, major_side, minor_side)
    } else {
        merge_pair(minor, major, minor_side, major_side)
    }
}

fn merge_error(msg: &str) -> Error {
    Error::bad_changeset(format!("merge invariant violated: {}", msg))
}

// ---- cross-changeset comparison helpers ----
//
// Intern ids are only meaningful within their own changeset; every
// comparison resolves through both pools.

fn same_string(l: &Changeset, a: InternString, r: &Changeset, b: InternString) -> bool {
    l.string(a) == r.string(b)
}

fn same_key(l: &Changeset, a: &PrimaryKey, r: &Changeset, b: &PrimaryKey) -> bool {
    match (a, b) {
        (PrimaryKey::Int(x), PrimaryKey::Int(y)) => x == y,
        (PrimaryKey::String(x), PrimaryKey::String(y)) => same_string(l, *x, r, *y),
        (PrimaryKey::ObjectId(x), PrimaryKey::ObjectId(y)) => x == y,
        (PrimaryKey::Uuid(x), PrimaryKey::Uuid(y)) => x == y,
        _ => false,
    }
}

fn same_payload(l: &Changeset, a: &Payload, r: &Changeset, b: &Payload) -> bool {
    match (a, b) {
        (Payload::String(x), Payload::String(y)) => same_string(l, *x, r, *y),
        (Payload::Binary(x), Payload::Binary(y)) => same_string(l, *x, r, *y),
        (
            Payload::Link {
                target_table: lt,
                target: lk,
            },
            Payload::Link {
                target_table: rt,
                target: rk,
            },
        ) => same_string(l, *lt, r, *rt) && same_key(l, lk, r, rk),
        (x, y) => x == y && x.type_of() == y.type_of(),
    }
}

fn same_path_element(l: &Changeset, a: &PathElement, r: &Changeset, b: &PathElement) -> bool {
    match (a, b) {
        (PathElement::Index(x), PathElement::Index(y)) => x == y,
        (PathElement::Key(x), PathElement::Key(y)) => same_string(l, *x, r, *y),
        _ => false,
    }
}

/// Same table, object, and field.
fn same_field(l: &Changeset, a: &Path, r: &Changeset, b: &Path) -> bool {
    same_string(l, a.table, r, b.table)
        && same_key(l, &a.object, r, &b.object)
        && same_string(l, a.field, r, b.field)
}

/// The exact same target.
fn same_path(l: &Changeset, a: &Path, r: &Changeset, b: &Path) -> bool {
    if !same_field(l, a, r, b) || a.elements.len() != b.elements.len() {
        return false;
    }
    a.elements
        .iter()
        .zip(b.elements.iter())
        .all(|(x, y)| same_path_element(l, x, r, y))
}

/// The same container: equal lengths, equal prefix, the last element
/// disregarded (a length of zero counts as the same container).
fn same_container(l: &Changeset, a: &Path, r: &Changeset, b: &Path) -> bool {
    if !same_field(l, a, r, b) || a.elements.len() != b.elements.len() {
        return false;
    }
    if a.elements.is_empty() {
        return true;
    }
    a.elements[..a.elements.len() - 1]
        .iter()
        .zip(b.elements.iter())
        .all(|(x, y)| same_path_element(l, x, r, y))
}

/// Strictly shorter path that is an initial sequence of the longer one.
fn is_prefix_of(l: &Changeset, a: &Path, r: &Changeset, b: &Path) -> bool {
    if a.elements.len() >= b.elements.len() || !same_field(l, a, r, b) {
        return false;
    }
    a.elements
        .iter()
        .zip(b.elements.iter())
        .all(|(x, y)| same_path_element(l, x, r, y))
}

/// The shorter path touches a container within the longer path: like a
/// prefix, except its last element (the index) is not considered.
fn is_container_prefix_of(l: &Changeset, a: &Path, r: &Changeset, b: &Path) -> bool {
    if a.elements.is_empty() || a.elements.len() >= b.elements.len() || !same_field(l, a, r, b) {
        return false;
    }
    a.elements[..a.elements.len() - 1]
        .iter()
        .zip(b.elements.iter())
        .all(|(x, y)| same_path_element(l, x, r, y))
}

/// The element of `path` at the nesting level of the container the
/// outer instruction operates on; it must be an array index.
fn corresponding_index<'a>(outer: &Path, inner: &'a mut Path) -> Result<&'a mut u32> {
    debug_assert!(!outer.elements.is_empty());
    debug_assert!(outer.elements.len() < inner.elements.len());
    let pos = outer.elements.len() - 1;
    match &mut inner.elements[pos] {
        PathElement::Index(i) => Ok(i),
        PathElement::Key(_) => Err(merge_error("inconsistent paths")),
    }
}

/// The standard transform of an element access against a move.
fn merge_get_vs_move(get_ndx: &mut u32, move_from: u32, move_to: u32) {
    if *get_ndx == move_from {
        // Access of the moved element follows it to its destination.
        *get_ndx = move_to;
    } else {
        if *get_ndx > move_from {
            *get_ndx -= 1;
        }
        if *get_ndx >= move_to {
            *get_ndx += 1;
        }
    }
}

// ---- nested rules ----

fn merge_nested(
    outer: &mut Instruction,
    inner: &mut Instruction,
    outer_side: &mut OpSide<'_>,
    inner_side: &mut OpSide<'_>,
) -> Result<()> {
    match outer {
        Instruction::EraseTable(o) => {
            if same_string(outer_side.cs, o.table, inner_side.cs, inner.table()) {
                inner_side.discard();
            }
            Ok(())
        }
        Instruction::EraseObject(o) => {
            // The erase always wins over anything below the object.
            let prefix = match inner.path() {
                Some(p) => {
                    same_string(outer_side.cs, o.table, inner_side.cs, p.table)
                        && same_key(outer_side.cs, &o.object, inner_side.cs, &p.object)
                }
                None => false,
            };
            if prefix {
                inner_side.discard();
            }
            Ok(())
        }
        Instruction::Update(o) => {
            // Creating an embedded object or a dictionary is idempotent
            // and must not eliminate updates to the subtree.
            if matches!(o.value, Payload::ObjectValue | Payload::Dictionary) {
                return Ok(());
            }
            // A value set higher in the hierarchy overwrites any
            // modification of the inner value, regardless of time.
            if let Some(p) = inner.path() {
                if is_prefix_of(outer_side.cs, &o.path, inner_side.cs, p) {
                    inner_side.discard();
                }
            }
            Ok(())
        }
        Instruction::ArrayInsert(o) => {
            let transform = match inner.path() {
                Some(p) => is_container_prefix_of(outer_side.cs, &o.path, inner_side.cs, p),
                None => false,
            };
            if transform {
                let insert_ndx = o.path.index();
                let path = inner_path_mut(inner);
                let index = corresponding_index(&o.path, path)?;
                if *index >= insert_ndx {
                    *index += 1;
                    inner_side.mark_dirty();
                }
            }
            Ok(())
        }
        Instruction::ArrayMove(o) => {
            let transform = match inner.path() {
                Some(p) => is_container_prefix_of(outer_side.cs, &o.path, inner_side.cs, p),
                None => false,
            };
            if transform {
                let from = o.path.index();
                let to = o.ndx_2;
                let path = inner_path_mut(inner);
                let index = corresponding_index(&o.path, path)?;
                merge_get_vs_move(index, from, to);
                inner_side.mark_dirty();
            }
            Ok(())
        }
        Instruction::ArrayErase(o) => {
            let (prefix, container_prefix) = match inner.path() {
                Some(p) => (
                    is_prefix_of(outer_side.cs, &o.path, inner_side.cs, p),
                    is_container_prefix_of(outer_side.cs, &o.path, inner_side.cs, p),
                ),
                None => (false, false),
            };
            if prefix {
                // Erase of the subtree the inner instruction touches.
                inner_side.discard();
            } else if container_prefix {
                // Erase of a sibling element: adjust the path.
                let erase_ndx = o.path.index();
                let path = inner_path_mut(inner);
                let index = corresponding_index(&o.path, path)?;
                if erase_ndx < *index {
                    *index -= 1;
                    inner_side.mark_dirty();
                } else if erase_ndx == *index {
                    return Err(merge_error("sibling erase did not classify as prefix"));
                }
            }
            Ok(())
        }
        Instruction::Clear(o) => {
            // The clear wipes the container; anything at a longer path
            // below it is moot. (A clear's path has no trailing index.)
            if let Some(p) = inner.path() {
                if is_prefix_of(outer_side.cs, &o.path, inner_side.cs, p) {
                    inner_side.discard();
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn inner_path_mut(instr: &mut Instruction) -> &mut Path {
    match instr {
        Instruction::Update(i) => &mut i.path,
        Instruction::AddInteger(i) => &mut i.path,
        Instruction::ArrayInsert(i) => &mut i.path,
        Instruction::ArrayMove(i) => &mut i.path,
        Instruction::ArrayErase(i) => &mut i.path,
        Instruction::Clear(i) => &mut i.path,
        Instruction::SetInsert(i) => &mut i.path,
        Instruction::SetErase(i) => &mut i.path,
        _ => unreachable!("nested inner instruction without a path"),
    }
}

// ---- pairwise rules ----
//
// `left.rank() >= right.rank()` by construction; unlisted combinations
// are no-ops.

fn merge_pair(
    left: &mut Instruction,
    right: &mut Instruction,
    left_side: &mut OpSide<'_>,
    right_side: &mut OpSide<'_>,
) -> Result<()> {
    use Instruction as I;
    match (left, right) {
        // -- AddTable rules --
        (I::AddTable(l), I::AddTable(r)) => {
            if !same_string(left_side.cs, l.table, right_side.cs, r.table) {
                return Ok(());
            }
            let table = left_side.cs.string_str(l.table).into_owned();
            match (&l.ty, &r.ty) {
                (
                    TableType::TopLevel {
                        pk_field: lf,
                        pk_type: lt,
                        pk_nullable: ln,
                    },
                    TableType::TopLevel {
                        pk_field: rf,
                        pk_type: rt,
                        pk_nullable: rn,
                    },
                ) => {
                    if !same_string(left_side.cs, *lf, right_side.cs, *rf) {
                        return Err(Error::schema_mismatch(format!(
                            "'{}' has different primary keys on the two sides",
                            table
                        )));
                    }
                    if lt != rt {
                        return Err(Error::schema_mismatch(format!(
                            "'{}' has primary keys of different types on the two sides",
                            table
                        )));
                    }
                    if ln != rn {
                        return Err(Error::schema_mismatch(format!(
                            "'{}' has a primary key that is nullable on only one side",
                            table
                        )));
                    }
                }
                (TableType::Embedded, TableType::Embedded) => {}
                _ => {
                    return Err(Error::schema_mismatch(format!(
                        "'{}' is an embedded table on only one side",
                        table
                    )));
                }
            }
            // Identical declarations; both sides are moot.
            left_side.discard();
            right_side.discard();
            Ok(())
        }
        (I::EraseTable(l), I::AddTable(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table) {
                right_side.discard();
            }
            Ok(())
        }
        (I::EraseTable(l), I::EraseTable(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table) {
                left_side.discard();
                right_side.discard();
            }
            Ok(())
        }
        (I::AddColumn(l), I::EraseTable(r)) => {
            // A link column added to a surviving table, targeting the
            // erased table: drop the column on the erasing side.
            if l.ty == PayloadType::Link
                && matches!(l.link_target, Some(t) if same_string(left_side.cs, t, right_side.cs, r.table))
            {
                let table = right_side.cs.adopt_string(left_side.cs, l.table);
                let field = right_side.cs.adopt_string(left_side.cs, l.field);
                right_side.prepend(Instruction::EraseColumn(EraseColumn {
                    table,
                    field,
                    prior: None,
                }));
                left_side.discard();
            }
            Ok(())
        }

        // -- object lifecycle rules --
        (I::EraseObject(l), I::CreateObject(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_key(left_side.cs, &l.object, right_side.cs, &r.object)
            {
                // Erase always wins over create.
                right_side.discard();
            }
            Ok(())
        }
        (I::EraseObject(l), I::EraseObject(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_key(left_side.cs, &l.object, right_side.cs, &r.object)
            {
                // Keep the most recent erase, so a pile of old erases
                // cannot shadow a later create-erase pair.
                if right_side.timestamp() < left_side.timestamp() {
                    right_side.discard();
                } else {
                    left_side.discard();
                }
            }
            Ok(())
        }

        // -- Update rules --
        (I::Update(l), I::Update(r)) => {
            if !same_path(left_side.cs, &l.path, right_side.cs, &r.path) {
                return Ok(());
            }
            if l.is_array_update() != r.is_array_update() {
                return Err(merge_error("array update met a field update"));
            }
            let (left_default, right_default) = if l.is_array_update() {
                if l.prior_size != r.prior_size {
                    return Err(merge_error("array updates disagree on prior size"));
                }
                (false, false)
            } else {
                (l.is_default, r.is_default)
            };

            if l.value.type_of() != r.value.type_of() {
                // Container creation always loses to a concrete value:
                // updates inside the discarded container are gone too.
                if matches!(l.value, Payload::Dictionary | Payload::ObjectValue) {
                    left_side.discard();
                    return Ok(());
                }
                if matches!(r.value, Payload::Dictionary | Payload::ObjectValue) {
                    right_side.discard();
                    return Ok(());
                }
            }

            if left_default == right_default {
                if left_side.timestamp() < right_side.timestamp() {
                    left_side.discard();
                } else {
                    right_side.discard();
                }
            } else if left_default {
                left_side.discard();
            } else {
                right_side.discard();
            }
            Ok(())
        }
        (I::AddInteger(l), I::Update(r)) => {
            if !same_path(left_side.cs, &l.path, right_side.cs, &r.path) {
                return Ok(());
            }
            if !matches!(r.value, Payload::Int(_) | Payload::Null) {
                return Err(merge_error("integer add against a non-integer update"));
            }
            let right_is_default = !r.is_array_update() && r.is_default;
            // An add later than the set folds into its payload; note
            // that an add survives a default-value set regardless of
            // time.
            if right_side.timestamp() < left_side.timestamp() || right_is_default {
                if let Payload::Int(v) = r.value {
                    r.value = Payload::Int((v as u64).wrapping_add(l.value as u64) as i64);
                    right_side.mark_dirty();
                }
                // A null payload swallows the add for now; a set that
                // came before the add may revive it elsewhere.
            } else {
                left_side.discard();
            }
            Ok(())
        }
        (I::EraseColumn(l), I::Update(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.path.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.path.field)
            {
                right_side.discard();
            }
            Ok(())
        }

        // -- column schema rules --
        (I::AddColumn(l), I::AddColumn(r)) => {
            if !(same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field))
            {
                return Ok(());
            }
            let field = left_side.cs.string_str(l.field).into_owned();
            let table = left_side.cs.string_str(l.table).into_owned();
            if l.ty != r.ty {
                return Err(Error::schema_mismatch(format!(
                    "property '{}' in class '{}' has different types on the two sides",
                    field, table
                )));
            }
            if l.nullable != r.nullable {
                return Err(Error::schema_mismatch(format!(
                    "property '{}' in class '{}' is nullable on only one side",
                    field, table
                )));
            }
            if l.collection != r.collection {
                return Err(Error::schema_mismatch(format!(
                    "property '{}' in class '{}' has different collection kinds",
                    field, table
                )));
            }
            if l.ty == PayloadType::Link {
                let same_target = match (l.link_target, r.link_target) {
                    (Some(lt), Some(rt)) => same_string(left_side.cs, lt, right_side.cs, rt),
                    (None, None) => true,
                    _ => false,
                };
                if !same_target {
                    return Err(Error::schema_mismatch(format!(
                        "link property '{}' in class '{}' points to different classes",
                        field, table
                    )));
                }
            }
            left_side.discard();
            right_side.discard();
            Ok(())
        }
        (I::EraseColumn(l), I::AddColumn(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field)
            {
                right_side.discard();
            }
            Ok(())
        }
        (I::EraseColumn(l), I::EraseColumn(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field)
            {
                left_side.discard();
                right_side.discard();
            }
            Ok(())
        }
        (I::RenameColumn(l), I::RenameColumn(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field)
            {
                if !same_string(left_side.cs, l.new_name, right_side.cs, r.new_name) {
                    return Err(Error::schema_mismatch(format!(
                        "column '{}' renamed differently on the two sides",
                        left_side.cs.string_str(l.field)
                    )));
                }
                left_side.discard();
                right_side.discard();
            }
            Ok(())
        }
        (I::AddSearchIndex(l), I::AddSearchIndex(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field)
            {
                left_side.discard();
                right_side.discard();
            }
            Ok(())
        }
        (I::RemoveSearchIndex(l), I::RemoveSearchIndex(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field)
            {
                left_side.discard();
                right_side.discard();
            }
            Ok(())
        }
        (I::SetLinkType(l), I::SetLinkType(r)) => {
            if same_string(left_side.cs, l.table, right_side.cs, r.table)
                && same_string(left_side.cs, l.field, right_side.cs, r.field)
            {
                if l.link_type != r.link_type {
                    return Err(Error::schema_mismatch(format!(
                        "column '{}' given different link semantics on the two sides",
                        left_side.cs.string_str(l.field)
                    )));
                }
                left_side.discard();
                right_side.discard();
            }
            Ok(())
        }

        // -- array rules --
        (I::ArrayInsert(l), I::Update(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                if !r.is_array_update() {
                    return Err(merge_error("array insert met a field update"));
                }
                if l.prior_size != r.prior_size {
                    return Err(merge_error("array operations disagree on prior size"));
                }
                r.prior_size += 1;
                if r.path.index() >= l.path.index() {
                    r.path.set_index(r.path.index() + 1);
                }
                right_side.mark_dirty();
            }
            Ok(())
        }
        (I::ArrayMove(l), I::Update(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                let mut ndx = r.path.index();
                merge_get_vs_move(&mut ndx, l.path.index(), l.ndx_2);
                r.path.set_index(ndx);
                right_side.mark_dirty();
            }
            Ok(())
        }
        (I::ArrayErase(l), I::Update(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                if l.prior_size != r.prior_size {
                    return Err(merge_error("array operations disagree on prior size"));
                }
                if l.path.index() >= l.prior_size || r.path.index() >= r.prior_size {
                    return Err(merge_error("array index out of bounds"));
                }
                // Update of a removed element is moot.
                r.prior_size -= 1;
                if l.path.index() == r.path.index() {
                    right_side.discard();
                } else if r.path.index() > l.path.index() {
                    r.path.set_index(r.path.index() - 1);
                    right_side.mark_dirty();
                }
            }
            Ok(())
        }
        (I::ArrayInsert(l), I::ArrayInsert(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                if l.prior_size != r.prior_size {
                    return Err(merge_error("array operations disagree on prior size"));
                }
                l.prior_size += 1;
                r.prior_size += 1;
                if l.path.index() > r.path.index() {
                    l.path.set_index(l.path.index() + 1);
                } else if l.path.index() < r.path.index() {
                    r.path.set_index(r.path.index() + 1);
                } else {
                    // Two inserts at the same position: order by time,
                    // the earlier insert winning the lower index.
                    if left_side.timestamp() < right_side.timestamp() {
                        r.path.set_index(r.path.index() + 1);
                    } else {
                        l.path.set_index(l.path.index() + 1);
                    }
                }
                left_side.mark_dirty();
                right_side.mark_dirty();
            }
            Ok(())
        }
        (I::ArrayMove(l), I::ArrayInsert(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                l.prior_size += 1;

                // Insertion against the removal half of the move.
                if r.path.index() > l.path.index() {
                    r.path.set_index(r.path.index() - 1);
                } else {
                    l.path.set_index(l.path.index() + 1);
                }
                // Insertion against the insertion half of the move.
                if r.path.index() < l.ndx_2 {
                    l.ndx_2 += 1;
                } else if r.path.index() > l.ndx_2 {
                    r.path.set_index(r.path.index() + 1);
                } else {
                    // Insertion and movement to the same position: order
                    // by time.
                    if left_side.timestamp() < right_side.timestamp() {
                        l.ndx_2 += 1;
                    } else {
                        r.path.set_index(r.path.index() + 1);
                    }
                }
                left_side.mark_dirty();
                right_side.mark_dirty();
            }
            Ok(())
        }
        (I::ArrayErase(l), I::ArrayInsert(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                if l.prior_size != r.prior_size {
                    return Err(merge_error("array operations disagree on prior size"));
                }
                if l.path.index() >= l.prior_size || r.path.index() > r.prior_size {
                    return Err(merge_error("array index out of bounds"));
                }
                l.prior_size += 1;
                r.prior_size -= 1;
                if r.path.index() <= l.path.index() {
                    l.path.set_index(l.path.index() + 1);
                } else {
                    r.path.set_index(r.path.index() - 1);
                }
                left_side.mark_dirty();
                right_side.mark_dirty();
            }
            Ok(())
        }
        (I::ArrayMove(l), I::ArrayMove(r)) => {
            if !same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                return Ok(());
            }
            if l.prior_size != r.prior_size {
                return Err(merge_error("array operations disagree on prior size"));
            }
            if l.path.index() >= l.prior_size
                || r.path.index() >= r.prior_size
                || l.ndx_2 >= l.prior_size
                || r.ndx_2 >= r.prior_size
            {
                return Err(merge_error("array index out of bounds"));
            }
            if l.path.index() < r.path.index() {
                r.path.set_index(r.path.index() - 1);
            } else if l.path.index() > r.path.index() {
                l.path.set_index(l.path.index() - 1);
            } else {
                // Two moves of the same element: the later one wins and
                // transforms the earlier.
                if left_side.timestamp() < right_side.timestamp() {
                    r.path.set_index(l.ndx_2);
                    left_side.discard();
                    if r.path.index() == r.ndx_2 {
                        right_side.discard();
                    }
                } else {
                    l.path.set_index(r.ndx_2);
                    if l.path.index() == l.ndx_2 {
                        left_side.discard();
                    }
                    right_side.discard();
                }
                left_side.mark_dirty();
                right_side.mark_dirty();
                return Ok(());
            }

            // Left insertion half against right removal half.
            if l.ndx_2 > r.path.index() {
                l.ndx_2 -= 1;
            } else {
                r.path.set_index(r.path.index() + 1);
            }
            // Left removal half against right insertion half.
            if l.path.index() < r.ndx_2 {
                r.ndx_2 -= 1;
            } else {
                l.path.set_index(l.path.index() + 1);
            }
            // The two insertion halves.
            if l.ndx_2 < r.ndx_2 {
                r.ndx_2 += 1;
            } else if l.ndx_2 > r.ndx_2 {
                l.ndx_2 += 1;
            } else {
                // Two elements moved to the same position: order by time.
                if left_side.timestamp() < right_side.timestamp() {
                    r.ndx_2 += 1;
                } else {
                    l.ndx_2 += 1;
                }
            }

            if l.path.index() == l.ndx_2 {
                left_side.discard();
            }
            if r.path.index() == r.ndx_2 {
                right_side.discard();
            }
            left_side.mark_dirty();
            right_side.mark_dirty();
            Ok(())
        }
        (I::ArrayErase(l), I::ArrayMove(r)) => {
            if !same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                return Ok(());
            }
            if l.prior_size != r.prior_size {
                return Err(merge_error("array operations disagree on prior size"));
            }
            if l.path.index() >= l.prior_size || r.path.index() >= r.prior_size {
                return Err(merge_error("array index out of bounds"));
            }
            r.prior_size -= 1;

            if l.path.index() == r.path.index() {
                // Removal of a moved element: the erase follows the
                // element to its destination, the move is moot.
                l.path.set_index(r.ndx_2);
                right_side.discard();
                left_side.mark_dirty();
                return Ok(());
            }
            // Removal against the removal half of the move.
            if l.path.index() > r.path.index() {
                l.path.set_index(l.path.index() - 1);
            } else {
                r.path.set_index(r.path.index() - 1);
            }
            // Removal against the insertion half of the move.
            if l.path.index() >= r.ndx_2 {
                l.path.set_index(l.path.index() + 1);
            } else {
                r.ndx_2 -= 1;
            }
            if r.path.index() == r.ndx_2 {
                right_side.discard();
            }
            left_side.mark_dirty();
            right_side.mark_dirty();
            Ok(())
        }
        (I::ArrayErase(l), I::ArrayErase(r)) => {
            if same_container(left_side.cs, &l.path, right_side.cs, &r.path) {
                if l.prior_size != r.prior_size {
                    return Err(merge_error("array operations disagree on prior size"));
                }
                if l.path.index() >= l.prior_size || r.path.index() >= r.prior_size {
                    return Err(merge_error("array index out of bounds"));
                }
                l.prior_size -= 1;
                r.prior_size -= 1;
                if l.path.index() > r.path.index() {
                    l.path.set_index(l.path.index() - 1);
                    left_side.mark_dirty();
                    right_side.mark_dirty();
                } else if l.path.index() < r.path.index() {
                    r.path.set_index(r.path.index() - 1);
                    left_side.mark_dirty();
                    right_side.mark_dirty();
                } else {
                    // Two removals of the same element: the row is gone
                    // on both sides already.
                    left_side.discard();
                    right_side.discard();
                }
            }
            Ok(())
        }

        // -- container clear rules --
        (I::Clear(l), I::Clear(r)) => {
            if same_path(left_side.cs, &l.path, right_side.cs, &r.path) {
                // Keep the later clear so its post-clear inserts
                // survive.
                if left_side.timestamp() < right_side.timestamp() {
                    left_side.discard();
                } else {
                    right_side.discard();
                }
            }
            Ok(())
        }
        (I::SetInsert(l), I::Clear(r)) => {
            if same_path(left_side.cs, &l.path, right_side.cs, &r.path) {
                left_side.discard();
            }
            Ok(())
        }
        (I::SetErase(l), I::Clear(r)) => {
            if same_path(left_side.cs, &l.path, right_side.cs, &r.path) {
                left_side.discard();
            }
            Ok(())
        }

        // -- unordered set rules --
        (I::SetInsert(l), I::SetInsert(r)) => {
            if same_path(left_side.cs, &l.path, right_side.cs, &r.path)
                && same_payload(left_side.cs, &l.value, right_side.cs, &r.value)
            {
                // Insertion is idempotent; keeping the later timestamp
                // preserves associativity against interleaved erases.
                if left_side.timestamp() < right_side.timestamp() {
                    left_side.discard();
                } else {
                    right_side.discard();
                }
            }
            Ok(())
        }
        (I::SetErase(l), I::SetInsert(r)) => {
            if same_path(left_side.cs, &l.path, right_side.cs, &r.path)
                && same_payload(left_side.cs, &l.value, right_side.cs, &r.value)
            {
                if left_side.timestamp() < right_side.timestamp() {
                    left_side.discard();
                } else {
                    right_side.discard();
                }
            }
            Ok(())
        }
        (I::SetErase(l), I::SetErase(r)) => {
            if same_path(left_side.cs, &l.path, right_side.cs, &r.path)
                && same_payload(left_side.cs, &l.value, right_side.cs, &r.value)
            {
                if left_side.timestamp() < right_side.timestamp() {
                    left_side.discard();
                } else {
                    right_side.discard();
                }
            }
            Ok(())
        }

        // Every remaining combination is a no-op.
        _ => Ok(()),
    }
}
