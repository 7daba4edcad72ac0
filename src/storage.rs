//! The closed set of storage tiers behind a counter.
//!
//! The tiers form a sum type rather than an open trait hierarchy: promotion
//! needs cross-tier knowledge, so the conversions live in the counter core
//! while the uniform serialization surface is dispatched here.

use enum_dispatch::enum_dispatch;

use crate::dense::DenseStorage;
use crate::error::Error;
use crate::explicit::ExplicitStorage;
use crate::settings::DerivedSettings;
use crate::sparse::SparseStorage;

/// Storage type tags as serialized in the header byte's low nibble. The
/// storage spec calls the dense tier "full"; `Undefined` can be written by
/// other implementations but is rejected on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageType {
    /// Reserved tag; never instantiated.
    Undefined = 0,
    /// No storage allocated; the cardinality is zero.
    Empty = 1,
    /// A set of raw hashes.
    Explicit = 2,
    /// Only nonzero registers, as an index-to-value map.
    Sparse = 3,
    /// Every register, bit-packed.
    Dense = 4,
}

impl TryFrom<u8> for StorageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self, Error> {
        match tag {
            1 => Ok(StorageType::Empty),
            2 => Ok(StorageType::Explicit),
            3 => Ok(StorageType::Sparse),
            4 => Ok(StorageType::Dense),
            other => Err(Error::InvalidStorageType(other)),
        }
    }
}

/// A counter's allocated storage; the empty state is the absence of any.
#[derive(Debug, Clone, PartialEq)]
#[enum_dispatch]
pub(crate) enum Storage {
    Explicit(ExplicitStorage),
    Sparse(SparseStorage),
    Dense(DenseStorage),
}

/// Operations every tier supports uniformly. Promotion is deliberately not
/// part of this surface; it lives in the counter core.
#[enum_dispatch(Storage)]
pub(crate) trait StorageOps {
    /// Whether this storage has outgrown the limits in the settings and
    /// should be promoted to the next tier.
    fn over_capacity(&self, settings: &DerivedSettings) -> bool;

    /// Number of payload bytes `write_bytes` will produce.
    fn size_in_bytes(&self, settings: &DerivedSettings) -> usize;

    /// Serializes into `buf`, which holds exactly `size_in_bytes` zeroed
    /// bytes.
    fn write_bytes(&self, settings: &DerivedSettings, buf: &mut [u8]);
}

impl Storage {
    pub(crate) fn storage_type(&self) -> StorageType {
        match self {
            Storage::Explicit(_) => StorageType::Explicit,
            Storage::Sparse(_) => StorageType::Sparse,
            Storage::Dense(_) => StorageType::Dense,
        }
    }
}
