//! The replication observer seam.
//!
//! A group may carry an observer; every user-visible mutation of a
//! table with a primary key is reported through it before the storage
//! change happens, so the observer can capture displaced state. The
//! sync engine's recorder implements this trait to accumulate the
//! transaction's changeset.

use crate::error::Result;
use crate::store::column::MixedValue;
use crate::store::spec::ColumnType;

/// The primary key of an object row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PkValue {
    Int(i64),
    String(String),
}

/// Whether a column holds a single value or a collection of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Single,
    List,
    Set,
    Dictionary,
}

/// Observer of table and schema mutations. `prior` arguments carry the
/// displaced state (`None` for an empty/default cell) so recorded logs
/// stay reversible.
#[allow(unused_variables)]
pub trait MutationObserver {
    // ---- schema ----

    fn add_table(&self, table: &str, pk_field: &str, pk_type: ColumnType) -> Result<()> {
        Ok(())
    }

    fn erase_table(&self, table: &str) -> Result<()> {
        Ok(())
    }

    fn add_column(
        &self,
        table: &str,
        field: &str,
        ty: ColumnType,
        nullable: bool,
        collection: CollectionKind,
    ) -> Result<()> {
        Ok(())
    }

    fn erase_column(
        &self,
        table: &str,
        field: &str,
        ty: ColumnType,
        nullable: bool,
        collection: CollectionKind,
    ) -> Result<()> {
        Ok(())
    }

    fn rename_column(&self, table: &str, field: &str, new_name: &str) -> Result<()> {
        Ok(())
    }

    fn add_search_index(&self, table: &str, field: &str) -> Result<()> {
        Ok(())
    }

    fn remove_search_index(&self, table: &str, field: &str) -> Result<()> {
        Ok(())
    }

    // ---- objects ----

    fn create_object(&self, table: &str, pk: &PkValue) -> Result<()> {
        Ok(())
    }

    fn erase_object(
        &self,
        table: &str,
        pk: &PkValue,
        prior_fields: &[(String, MixedValue)],
    ) -> Result<()> {
        Ok(())
    }

    // ---- fields ----

    fn set_value(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        value: Option<&MixedValue>,
        prior: Option<&MixedValue>,
        is_default: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn add_int(&self, table: &str, pk: &PkValue, field: &str, delta: i64) -> Result<()> {
        Ok(())
    }

    // ---- lists ----

    fn list_insert(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        index: u32,
        value: &MixedValue,
        prior_size: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn list_set(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        index: u32,
        value: &MixedValue,
        prior: Option<&MixedValue>,
        prior_size: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn list_move(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        from: u32,
        to: u32,
        prior_size: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn list_erase(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        index: u32,
        prior: Option<&MixedValue>,
        prior_size: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn list_clear(
        &self,
        table: &str,
        pk: &PkValue,
        field: &str,
        prior_size: u32,
        prior_items: &[MixedValue],
    ) -> Result<()> {
        Ok(())
    }

    // ---- unordered sets ----

    fn set_insert(&self, table: &str, pk: &PkValue, field: &str, value: &MixedValue) -> Result<()> {
        Ok(())
    }

    fn set_erase(&self, table: &str, pk: &PkValue, field: &str, value: &MixedValue) -> Result<()> {
        Ok(())
    }
}
