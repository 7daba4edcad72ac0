//! Error type shared across the crate.

use thiserror::Error;

/// Errors surfaced by counter construction, deserialization, and unions.
///
/// Operating on a counter that has neither its own settings nor installed
/// defaults is a coding error and panics instead of returning a variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// A settings field is out of range.
    #[error("{field} is out of range: requires at least {min} and at most {max}, got {value}")]
    InvalidSettings {
        /// Name of the offending field.
        field: &'static str,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
        /// The rejected value.
        value: i64,
    },

    /// The serialized header carries a schema version other than 1.
    #[error("unsupported storage spec version: {0}")]
    UnsupportedVersion(u8),

    /// The serialized header carries a storage type outside the known set.
    #[error("invalid storage type: {0}")]
    InvalidStorageType(u8),

    /// The serialized payload is truncated or misaligned.
    #[error("insufficient bytes to deserialize")]
    InsufficientBytes,

    /// A strict union across counters with differing register layouts.
    #[error("cannot union counters with different log2m or regwidth settings")]
    Incompatible,

    /// Defaults were already installed with different settings.
    #[error("different default settings have already been installed")]
    DefaultsConflict,
}
