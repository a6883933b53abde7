//! The column storage engine.
//!
//! The store is built as a stack of layers, each a progressively higher
//! abstraction over the one below:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Group                                                  │
//! │  - file open/commit/rollback, table registry, history   │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//! ┌───────────────────────────▼─────────────────────────────┐
//! │  Table + Spec                                           │
//! │  - rows over named, typed columns; nested subtables     │
//! │  - cached column accessors, primary-key objects         │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//! ┌───────────────────────────▼─────────────────────────────┐
//! │  Typed columns                                          │
//! │  - int / string / enum-string / binary / subtable /     │
//! │    mixed, each a tree of node arrays                    │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//! ┌───────────────────────────▼─────────────────────────────┐
//! │  Node array + allocator                                 │
//! │  - tagged, bit-packed, copy-on-write, parent-linked     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything below the group is agnostic of files: the allocator hands
//! out refs, and committed regions become read-only so that readers of
//! an attached snapshot are never disturbed by writers (copy-on-write
//! at the array level).
//!
//! # Thread safety
//!
//! Accessors are single-threaded by design: one writer, external
//! synchronization for anything shared. Read snapshots are consistent
//! because committed memory is immutable.

pub mod alloc;
pub mod array;
pub mod column;
pub mod group;
pub mod index;
pub mod observer;
pub mod spec;
pub mod table;

pub use alloc::{Ref, SharedAlloc, SlabAlloc};
pub use array::{Array, ArrayKind, ArrayParent, Cond, ParentLink, SharedArray};
pub use column::{
    BinaryColumn, EnumStringColumn, IntColumn, MixedColumn, MixedValue, RowSet, StringColumn,
    SubtableColumn,
};
pub use group::{Group, HistoryKind};
pub use index::SearchIndex;
pub use observer::{CollectionKind, MutationObserver, PkValue};
pub use spec::{ColumnType, Spec};
pub use table::Table;
