//! Explicit storage: the raw set of observed hashes.
//!
//! While a counter stays below its explicit threshold it simply remembers
//! every distinct hash, making the cardinality exact. On the wire the values
//! are 8-byte big-endian words sorted as **signed** 64-bit integers in
//! ascending order; the PostgreSQL implementation rejects unordered blobs.

use hashbrown::HashSet;

use crate::error::Error;
use crate::settings::DerivedSettings;
use crate::storage::StorageOps;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ExplicitStorage {
    values: HashSet<u64>,
}

impl ExplicitStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Remembers a raw hash. The zero sentinel is filtered by the counter
    /// before it reaches any storage tier.
    pub(crate) fn add(&mut self, value: u64) {
        self.values.insert(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.values.iter().copied()
    }

    /// Reads consecutive 8-byte big-endian values. Duplicates in the input
    /// are tolerated; a length that does not divide into whole words means
    /// the payload was truncated.
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() % 8 != 0 {
            return Err(Error::InsufficientBytes);
        }

        let mut values = HashSet::with_capacity(bytes.len() / 8);
        for chunk in bytes.chunks_exact(8) {
            values.insert(u64::from_be_bytes(chunk.try_into().unwrap()));
        }

        Ok(Self { values })
    }
}

impl StorageOps for ExplicitStorage {
    fn over_capacity(&self, settings: &DerivedSettings) -> bool {
        self.values.len() > settings.explicit_threshold
    }

    fn size_in_bytes(&self, _settings: &DerivedSettings) -> usize {
        8 * self.values.len()
    }

    fn write_bytes(&self, _settings: &DerivedSettings, buf: &mut [u8]) {
        let mut sorted: Vec<i64> = self.values.iter().map(|&v| v as i64).collect();
        sorted.sort_unstable();

        for (i, value) in sorted.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&(*value as u64).to_be_bytes());
        }
    }
}
