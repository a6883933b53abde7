//! End-to-end scenarios: two replicas diverge from a common base, their
//! changesets are transformed against each other, and both replicas
//! must converge to the same state.

mod common;

use common::{group_snapshot, mixed_str, sorted_snapshot};
use tide_engine::store::{ColumnType, Group, MixedValue, PkValue};
use tide_engine::sync::replication::Replication;
use tide_engine::sync::{Changeset, SyncReplication, Transformer};
use tide_engine::Error;

/// One replica: a group with a recorder attached after the base schema
/// and data were installed.
struct Replica {
    group: Group,
    repl: std::rc::Rc<SyncReplication>,
}

impl Replica {
    fn new(file_ident: u64, build_base: impl Fn(&Group)) -> Replica {
        let group = Group::new_in_memory().unwrap();
        build_base(&group);
        let repl = SyncReplication::new(file_ident);
        repl.attach(&group);
        Replica { group, repl }
    }

    fn changeset(&self, timestamp: i64) -> Changeset {
        self.repl.set_origin_timestamp(timestamp);
        let mut cs = self.repl.take_changeset();
        cs.origin_timestamp = timestamp;
        cs
    }
}

/// Transform the two changesets against each other and replay each on
/// the opposite replica; both replicas must end in the same state.
fn converge(a: &Replica, mut a_cs: Changeset, b: &Replica, mut b_cs: Changeset) {
    Transformer::transform_pair(&mut a_cs, &mut b_cs).unwrap();
    // After the transform: `b_cs` is what replica A integrates, `a_cs`
    // is what replica B integrates.
    tide_engine::sync::apply_changeset(&a.group, &b_cs).unwrap();
    tide_engine::sync::apply_changeset(&b.group, &a_cs).unwrap();
    assert_eq!(
        group_snapshot(&a.group),
        group_snapshot(&b.group),
        "replicas diverged"
    );
}

fn base_with_field(group: &Group) {
    let t = group
        .add_table_with_primary_key("T", "id", ColumnType::Int)
        .unwrap();
    t.add_column(ColumnType::Int, "a").unwrap();
    let row = t.create_object(&PkValue::Int(5)).unwrap();
    t.set_int(1, row, 0).unwrap();
}

#[test]
fn two_updates_of_the_same_field_keep_the_later_one() {
    let left = Replica::new(1, base_with_field);
    let right = Replica::new(2, base_with_field);

    let t = left.group.table("T").unwrap();
    t.set_int(1, 0, 1).unwrap();
    let left_cs = left.changeset(100);

    let t = right.group.table("T").unwrap();
    t.set_int(1, 0, 2).unwrap();
    let right_cs = right.changeset(200);

    converge(&left, left_cs, &right, right_cs);

    let t = left.group.table("T").unwrap();
    assert_eq!(t.get_int(1, 0), 2, "the later update must win");
}

#[test]
fn transformed_earlier_update_is_discarded() {
    // The transform itself: the earlier local update becomes empty, the
    // later remote update passes through unchanged.
    let left = Replica::new(1, base_with_field);
    let right = Replica::new(2, base_with_field);

    left.group.table("T").unwrap().set_int(1, 0, 1).unwrap();
    let mut left_cs = left.changeset(100);
    right.group.table("T").unwrap().set_int(1, 0, 2).unwrap();
    let mut right_cs = right.changeset(200);

    Transformer::transform_pair(&mut left_cs, &mut right_cs).unwrap();

    assert_eq!(left_cs.len(), 0);
    assert_eq!(right_cs.len(), 1);
}

fn base_with_list(group: &Group) {
    let t = group
        .add_table_with_primary_key("T", "id", ColumnType::Int)
        .unwrap();
    t.add_collection_column("l", ColumnType::String, tide_engine::store::CollectionKind::List)
        .unwrap();
    let row = t.create_object(&PkValue::Int(5)).unwrap();
    for (i, v) in ["x", "y", "z"].iter().enumerate() {
        t.list_insert(1, row, i, &mixed_str(v)).unwrap();
    }
}

#[test]
fn concurrent_insert_and_erase_shift_each_other() {
    let left = Replica::new(1, base_with_list);
    let right = Replica::new(2, base_with_list);

    // Left inserts "w" at index 1; right erases index 2 ("z").
    let t = left.group.table("T").unwrap();
    t.list_insert(1, 0, 1, &mixed_str("w")).unwrap();
    let left_cs = left.changeset(100);

    let t = right.group.table("T").unwrap();
    t.list_erase(1, 0, 2).unwrap();
    let right_cs = right.changeset(200);

    converge(&left, left_cs, &right, right_cs);

    let t = left.group.table("T").unwrap();
    let items: Vec<MixedValue> = (0..t.list_size(1, 0).unwrap())
        .map(|i| t.list_get(1, 0, i).unwrap())
        .collect();
    assert_eq!(
        items,
        vec![mixed_str("x"), mixed_str("w"), mixed_str("y")],
        "insert kept its slot, erase followed its element"
    );
}

#[test]
fn erase_object_beats_nested_update() {
    let left = Replica::new(1, base_with_field);
    let right = Replica::new(2, base_with_field);

    let t = left.group.table("T").unwrap();
    t.erase_object(&PkValue::Int(5)).unwrap();
    let left_cs = left.changeset(100);

    let t = right.group.table("T").unwrap();
    t.set_int(1, 0, 9).unwrap();
    let right_cs = right.changeset(200);

    converge(&left, left_cs, &right, right_cs);

    let t = left.group.table("T").unwrap();
    assert_eq!(t.find_row_by_pk(&PkValue::Int(5)), None, "object must stay erased");
}

#[test]
fn conflicting_schema_additions_abort_the_transform() {
    let base = |group: &Group| {
        group
            .add_table_with_primary_key("T", "id", ColumnType::Int)
            .unwrap();
    };
    let left = Replica::new(1, base);
    let right = Replica::new(2, base);

    let t = left.group.table("T").unwrap();
    t.add_column(ColumnType::Int, "x").unwrap();
    let mut left_cs = left.changeset(100);

    let t = right.group.table("T").unwrap();
    t.add_column(ColumnType::String, "x").unwrap();
    let mut right_cs = right.changeset(200);

    let err = Transformer::transform_pair(&mut left_cs, &mut right_cs).unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(_)));
}

#[test]
fn concurrent_object_creation_converges() {
    let base = |group: &Group| {
        let t = group
            .add_table_with_primary_key("T", "id", ColumnType::Int)
            .unwrap();
        t.add_column(ColumnType::String, "name").unwrap();
    };
    let left = Replica::new(1, base);
    let right = Replica::new(2, base);

    let t = left.group.table("T").unwrap();
    let row = t.create_object(&PkValue::Int(1)).unwrap();
    t.set_string(1, row, "from-left").unwrap();
    let left_cs = left.changeset(100);

    let t = right.group.table("T").unwrap();
    let row = t.create_object(&PkValue::Int(2)).unwrap();
    t.set_string(1, row, "from-right").unwrap();
    let right_cs = right.changeset(200);

    converge(&left, left_cs, &right, right_cs);

    let t = left.group.table("T").unwrap();
    assert_eq!(t.row_count(), 2);
    let rows = sorted_snapshot(&t);
    assert_eq!(rows[0], vec!["1".to_string(), "from-left".to_string()]);
    assert_eq!(rows[1], vec!["2".to_string(), "from-right".to_string()]);
}

#[test]
fn concurrent_set_operations_are_idempotent() {
    let base = |group: &Group| {
        let t = group
            .add_table_with_primary_key("T", "id", ColumnType::Int)
            .unwrap();
        t.add_collection_column("tags", ColumnType::String, tide_engine::store::CollectionKind::Set)
            .unwrap();
        t.create_object(&PkValue::Int(5)).unwrap();
    };
    let left = Replica::new(1, base);
    let right = Replica::new(2, base);

    // Both sides insert the same tag; one also inserts a distinct one.
    let t = left.group.table("T").unwrap();
    t.insert_into_set(1, 0, &mixed_str("shared")).unwrap();
    t.insert_into_set(1, 0, &mixed_str("left-only")).unwrap();
    let left_cs = left.changeset(100);

    let t = right.group.table("T").unwrap();
    t.insert_into_set(1, 0, &mixed_str("shared")).unwrap();
    let right_cs = right.changeset(200);

    converge(&left, left_cs, &right, right_cs);

    let t = left.group.table("T").unwrap();
    assert_eq!(t.list_size(1, 0).unwrap(), 2, "the shared tag must not duplicate");
}

#[test]
fn integration_stores_reciprocal_transforms() {
    // A client that has shipped a changeset integrates a remote batch:
    // the remote side is replayed, and the rewritten local side is
    // stored back as the reciprocal for the next round.
    let group = Group::new_in_memory().unwrap();
    let t = group
        .add_table_with_primary_key("T", "id", ColumnType::Int)
        .unwrap();
    t.add_column(ColumnType::Int, "a").unwrap();
    t.create_object(&PkValue::Int(5)).unwrap();

    let repl = SyncReplication::new(1);
    repl.attach(&group);
    repl.set_origin_timestamp(100);
    let t = group.table("T").unwrap();
    t.set_int(1, 0, 1).unwrap();
    repl.prepare_commit(&group).unwrap();
    repl.finalize_commit().unwrap();

    // The remote wrote the same field later; the local update loses.
    let mut remote = {
        let other = Replica::new(2, |group| {
            let t = group
                .add_table_with_primary_key("T", "id", ColumnType::Int)
                .unwrap();
            t.add_column(ColumnType::Int, "a").unwrap();
            t.create_object(&PkValue::Int(5)).unwrap();
        });
        let t = other.group.table("T").unwrap();
        t.set_int(1, 0, 2).unwrap();
        other.changeset(200)
    };

    tide_engine::sync::integrate_remote_changesets(&group, std::slice::from_mut(&mut remote))
        .unwrap();

    let t = group.table("T").unwrap();
    assert_eq!(t.get_int(1, 0), 2, "the remote update must be applied");
    // The shipped changeset was rewritten to nothing; the reciprocal
    // records that.
    let reciprocal = group.reciprocal(0).unwrap().expect("reciprocal stored");
    let parsed = tide_engine::sync::parse_changeset(&reciprocal).unwrap();
    assert_eq!(parsed.len(), 0);
}

#[test]
fn failed_integration_clears_the_reciprocal_cache() {
    let group = Group::new_in_memory().unwrap();
    group
        .add_table_with_primary_key("T", "id", ColumnType::Int)
        .unwrap();

    let repl = SyncReplication::new(1);
    repl.attach(&group);
    repl.set_origin_timestamp(100);
    let t = group.table("T").unwrap();
    t.add_column(ColumnType::Int, "x").unwrap();
    repl.prepare_commit(&group).unwrap();
    repl.finalize_commit().unwrap();
    // Seed the cache as a previous integration round would have.
    let shipped = group.history_changeset(0).unwrap();
    group.set_reciprocal(0, &shipped).unwrap();

    // The remote declared the same column with another type.
    let mut remote = {
        let other = Replica::new(2, |group| {
            group
                .add_table_with_primary_key("T", "id", ColumnType::Int)
                .unwrap();
        });
        let t = other.group.table("T").unwrap();
        t.add_column(ColumnType::String, "x").unwrap();
        other.changeset(200)
    };

    let err = tide_engine::sync::integrate_remote_changesets(
        &group,
        std::slice::from_mut(&mut remote),
    )
    .unwrap_err();

    assert!(matches!(err, Error::SchemaMismatch(_) | Error::BadChangeset(_)));
    assert_eq!(group.reciprocal(0).unwrap(), None, "cache must be cleared");
}

#[test]
fn commit_handshake_appends_history_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.tide");

    let group = Group::create(&path).unwrap();
    let t = group
        .add_table_with_primary_key("T", "id", ColumnType::Int)
        .unwrap();
    t.add_column(ColumnType::Int, "a").unwrap();

    let repl = SyncReplication::new(7);
    repl.attach(&group);
    repl.set_origin_timestamp(1000);

    repl.initiate_transact(1).unwrap();
    let t = group.table("T").unwrap();
    let row = t.create_object(&PkValue::Int(5)).unwrap();
    t.set_int(1, row, 42).unwrap();

    assert!(!repl.get_uncommitted_changes().is_empty());
    let version = repl.prepare_commit(&group).unwrap();
    group.commit().unwrap();
    repl.finalize_commit().unwrap();
    assert_eq!(version, 1);

    // The encoded changeset round-trips through the history.
    let reopened = Group::open(&path).unwrap();
    assert_eq!(reopened.history_changeset_count(), 1);
    let bytes = reopened.history_changeset(0).unwrap();
    let parsed = tide_engine::sync::parse_changeset(&bytes).unwrap();
    assert_eq!(parsed.origin_file_ident, 7);
    assert_eq!(parsed.origin_timestamp, 1000);
    assert_eq!(parsed.len(), 2); // CreateObject + Update
}
