//! Shared scenario builders for the benchmarks.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tide_engine::store::{ColumnType, Group, PkValue};
use tide_engine::sync::{Changeset, SyncReplication};

/// Deterministic generator so runs are comparable.
pub fn rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// A group with one keyed table of `rows` objects and an integer field.
pub fn populated_group(rows: usize, seed: u64) -> Group {
    let mut rng = rng(seed);
    let group = Group::new_in_memory().expect("in-memory group");
    let table = group
        .add_table_with_primary_key("bench", "id", ColumnType::Int)
        .expect("bench table");
    table.add_column(ColumnType::Int, "value").expect("value column");
    for pk in 0..rows as i64 {
        let row = table.create_object(&PkValue::Int(pk)).expect("object");
        table
            .set_int(1, row, rng.gen_range(-1_000_000..1_000_000))
            .expect("value");
    }
    group
}

/// A changeset of `updates` field updates spread over `objects`
/// objects, with the given origin coordinates.
pub fn random_changeset(
    updates: usize,
    objects: i64,
    file_ident: u64,
    timestamp: i64,
    seed: u64,
) -> Changeset {
    let mut rng = rng(seed);
    let group = populated_group(objects as usize, seed);
    let repl = SyncReplication::new(file_ident);
    repl.attach(&group);
    repl.set_origin_timestamp(timestamp);

    let table = group.table("bench").expect("bench table");
    for _ in 0..updates {
        let pk = rng.gen_range(0..objects);
        let row = table.find_row_by_pk(&PkValue::Int(pk)).expect("populated");
        table
            .set_int(1, row, rng.gen_range(-1_000_000..1_000_000))
            .expect("update");
    }
    let mut cs = repl.take_changeset();
    cs.origin_timestamp = timestamp;
    cs
}
