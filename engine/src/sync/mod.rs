//! The synchronization engine.
//!
//! A write transaction accumulates a [`changeset::Changeset`] through
//! the [`replication`] recorder; on commit the changeset is encoded
//! ([`encode`]) and appended to the group's history. Remote changesets
//! are parsed ([`parse`]), transformed against the local reciprocal by
//! the operational-transform engine ([`merge`]), and replayed onto the
//! store ([`apply`]). [`reverse`] derives the inverse log used for
//! rollback.

pub mod apply;
pub mod changeset;
pub mod encode;
pub mod instruction;
pub mod merge;
pub mod parse;
pub mod replication;
pub mod reverse;
pub mod wire;

pub use apply::apply_changeset;
pub use changeset::{Changeset, Interner};
pub use encode::encode_changeset;
pub use instruction::{Instruction, Path, PathElement, Payload, PayloadType, PrimaryKey};
pub use merge::Transformer;
pub use parse::{parse_changeset, InstructionHandler, Parser};
pub use replication::{Replication, SyncReplication};
pub use reverse::reverse_changeset;

use crate::error::Result;
use crate::store::group::Group;

/// Integrate a batch of remote changesets into a group: transform them
/// against the local reciprocal transforms, replay the rewritten remote
/// side, and store the rewritten local side back as the new
/// reciprocals.
///
/// For every shipped local changeset the group keeps a reciprocal
/// transform — the local changeset as rewritten by every remote batch
/// integrated so far — so the next remote batch is transformed against
/// the correct local view. On any failure the reciprocal cache is
/// cleared before the error is rethrown, so partially merged state
/// cannot leak into the next attempt.
pub fn integrate_remote_changesets(group: &Group, incoming: &mut [Changeset]) -> Result<()> {
    let result = (|| -> Result<Vec<Changeset>> {
        let count = group.history_changeset_count();
        let mut local = Vec::with_capacity(count);
        for ndx in 0..count {
            let bytes = match group.reciprocal(ndx)? {
                Some(bytes) => bytes,
                None => group.history_changeset(ndx)?,
            };
            local.push(parse_changeset(&bytes)?);
        }
        merge::Transformer::transform(&mut local, incoming)?;
        for cs in incoming.iter() {
            apply_changeset(group, cs)?;
        }
        Ok(local)
    })();

    match result {
        Ok(local) => {
            for (ndx, cs) in local.iter().enumerate() {
                if cs.is_dirty() {
                    group.set_reciprocal(ndx, &encode_changeset(cs))?;
                }
            }
            Ok(())
        }
        Err(err) => {
            group.clear_reciprocals()?;
            Err(err)
        }
    }
}
