//! Helpers shared by the end-to-end tests.

use tide_engine::store::{ColumnType, Group, MixedValue, Table};

/// A printable snapshot of a table's full contents, for state
/// comparisons between replicas.
pub fn table_snapshot(table: &Table) -> Vec<Vec<String>> {
    let mut rows = Vec::with_capacity(table.row_count());
    for row in 0..table.row_count() {
        let mut cells = Vec::with_capacity(table.column_count());
        for col in 0..table.column_count() {
            let cell = match table.column_type(col) {
                ColumnType::Int => table.get_int(col, row).to_string(),
                ColumnType::Bool => table.get_bool(col, row).to_string(),
                ColumnType::Date => table.get_date(col, row).to_string(),
                ColumnType::String => table.get_string(col, row),
                ColumnType::Binary => format!("{:?}", table.get_binary(col, row)),
                ColumnType::Mixed => format!("{:?}", table.get_mixed(col, row)),
                ColumnType::Table => {
                    let size = table.list_size(col, row).expect("collection cell");
                    let items: Vec<String> = (0..size)
                        .map(|i| format!("{:?}", table.list_get(col, row, i).expect("item")))
                        .collect();
                    format!("[{}]", items.join(", "))
                }
            };
            cells.push(cell);
        }
        rows.push(cells);
    }
    rows
}

/// Snapshot of every table in a group, sorted by table name, with rows
/// sorted within each table: convergent replicas agree on content, not
/// on the physical row order their integration produced.
pub fn group_snapshot(group: &Group) -> Vec<(String, Vec<Vec<String>>)> {
    let mut names = group.table_names();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let table = group.table(&name).expect("listed table");
            let mut snapshot = table_snapshot(&table);
            snapshot.sort();
            (name, snapshot)
        })
        .collect()
}

/// Rows of a table sorted by their first cell, for order-insensitive
/// comparisons of primary-keyed tables.
#[allow(dead_code)]
pub fn sorted_snapshot(table: &Table) -> Vec<Vec<String>> {
    let mut rows = table_snapshot(table);
    rows.sort();
    rows
}

#[allow(dead_code)]
pub fn mixed_int(v: i64) -> MixedValue {
    MixedValue::Int(v)
}

#[allow(dead_code)]
pub fn mixed_str(s: &str) -> MixedValue {
    MixedValue::String(s.to_string())
}
