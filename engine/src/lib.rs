//! An embedded, schemaful, columnar object store with synchronization
//! support.
//!
//! The crate is organized as two cooperating halves:
//!
//! - [`store`] — the column storage engine: a copy-on-write, bit-packed
//!   node-array substrate, the typed columns built from it, and the
//!   spec/table/group layers on top.
//! - [`sync`] — the synchronization engine: the changeset model with its
//!   wire codec, the replication recorder, and the operational-transform
//!   merge that makes concurrent changesets convergent.
//!
//! Client code mutates a [`store::Table`]; with replication attached, each
//! mutation is recorded as an instruction in the current changeset. On
//! commit the changeset is encoded and appended to the group's history.
//! Incoming remote changesets are transformed against the local reciprocal
//! with [`sync::merge::Transformer`] before being replayed.

pub mod error;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
