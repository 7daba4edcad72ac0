//! The counter itself: lifecycle across storage tiers, insertion
//! arithmetic, the cardinality estimator, unions, and the serialization
//! envelope.

use std::fmt;
use std::sync::Arc;

use crate::dense::DenseStorage;
use crate::error::Error;
use crate::explicit::ExplicitStorage;
use crate::settings::{
    self, pack_cutoff_byte, unpack_cutoff_byte, DerivedSettings, Settings,
};
use crate::sparse::SparseStorage;
use crate::storage::{Storage, StorageOps, StorageType};

/// A probabilistic set of pre-hashed 64-bit values.
///
/// Supports adding values and merging other counters, and estimates the
/// number of distinct values observed. Values must be hashed with a good
/// 64-bit hash function (such as MurmurHash3 or xxHash) before being added;
/// without sufficient entropy the estimates will be inaccurate.
///
/// The serialized form produced by [`to_bytes`](Hll::to_bytes) follows the
/// Aggregate Knowledge HLL storage spec v1 and interoperates with the
/// PostgreSQL `hll` extension and the reference Java library.
///
/// `Hll::default()` is an empty counter bound to the process-wide defaults
/// installed with [`install_defaults`](crate::install_defaults); operating
/// on it without installed defaults is a coding error and panics.
#[derive(Clone, Default)]
pub struct Hll {
    settings: Option<Arc<DerivedSettings>>,
    storage: Option<Storage>,
}

impl Hll {
    /// Creates an empty counter with the provided settings. Applications
    /// juggling a single configuration are usually better served installing
    /// defaults once and using `Hll::default()`.
    pub fn new(settings: Settings) -> Result<Hll, Error> {
        Ok(Hll {
            settings: Some(settings.derive()?),
            storage: None,
        })
    }

    /// Deserializes a counter from its storage-spec byte form. Fails on a
    /// version other than 1, an unknown storage type, settings outside the
    /// supported ranges, or a truncated payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Hll, Error> {
        if bytes.len() < 3 {
            return Err(Error::InsufficientBytes);
        }

        let version = bytes[0] >> 4;
        if version != 1 {
            return Err(Error::UnsupportedVersion(version));
        }
        let storage_type = StorageType::try_from(bytes[0] & 0x0f)?;

        let regwidth = u32::from(bytes[1] >> 5) + 1;
        let log2m = u32::from(bytes[1] & 0x1f);
        let (sparse_enabled, explicit_threshold) = unpack_cutoff_byte(bytes[2])?;

        let settings = Settings {
            log2m,
            regwidth,
            explicit_threshold,
            sparse_enabled,
        }
        .derive()?;

        let payload = &bytes[3..];
        let storage = match storage_type {
            StorageType::Empty => None,
            StorageType::Explicit => Some(Storage::Explicit(ExplicitStorage::from_bytes(payload)?)),
            StorageType::Sparse => Some(Storage::Sparse(SparseStorage::from_bytes(
                &settings, payload,
            ))),
            StorageType::Dense => Some(Storage::Dense(DenseStorage::from_bytes(
                &settings, payload,
            )?)),
            // Rejected by the tag parser above.
            StorageType::Undefined => unreachable!("undefined storage type passed parsing"),
        };

        Ok(Hll {
            settings: Some(settings),
            storage,
        })
    }

    /// Returns this counter's settings.
    ///
    /// Panics on a default-constructed counter when no defaults are
    /// installed.
    pub fn settings(&self) -> Settings {
        self.resolved_settings().source
    }

    /// Returns which storage tier currently backs the counter.
    pub fn storage_type(&self) -> StorageType {
        match &self.storage {
            None => StorageType::Empty,
            Some(storage) => storage.storage_type(),
        }
    }

    /// Adds a pre-hashed value to the counter.
    ///
    /// The raw value 0 is ignored: in the register-based representations a
    /// zero hash carries no observable bits, so for consistency the
    /// explicit representation ignores it as well.
    pub fn add_raw(&mut self, value: u64) {
        let settings = self.init_or_panic();

        // By contract, ignore zero.
        if value == 0 {
            return;
        }

        // Bootstrap an empty counter with the lowest enabled tier.
        let storage = self.storage.get_or_insert_with(|| {
            if settings.explicit_threshold > 0 {
                Storage::Explicit(ExplicitStorage::new())
            } else if settings.source.sparse_enabled {
                Storage::Sparse(SparseStorage::new())
            } else {
                Storage::Dense(DenseStorage::new(&settings))
            }
        });

        match storage {
            Storage::Explicit(set) => set.add(value),
            Storage::Sparse(map) => {
                if let Some((regnum, pw)) = settings.register_observation(value) {
                    map.set_if_greater(regnum, pw);
                }
            }
            Storage::Dense(dense) => {
                if let Some((regnum, pw)) = settings.register_observation(value) {
                    dense.set_if_greater(&settings, regnum as usize, pw);
                }
            }
        }

        if self
            .storage
            .as_ref()
            .is_some_and(|s| s.over_capacity(&settings))
        {
            self.upgrade(&settings);
        }
    }

    /// Estimates the number of distinct values added to this counter.
    pub fn cardinality(&self) -> u64 {
        let settings = self.resolved_settings();

        match &self.storage {
            None => 0,
            Some(Storage::Explicit(set)) => set.len() as u64,
            Some(Storage::Sparse(map)) => {
                let (sum, zeros) = map.indicator(&settings);
                estimate_cardinality(&settings, sum, zeros)
            }
            Some(Storage::Dense(dense)) => {
                let (sum, zeros) = dense.indicator(&settings);
                estimate_cardinality(&settings, sum, zeros)
            }
        }
    }

    /// Merges `other` into this counter.
    ///
    /// Unlike [`strict_union`](Hll::strict_union), counters with different
    /// settings are accepted; doing so loses accuracy and is not
    /// recommended. As long as an application uses one group of settings
    /// this function is safe; when settings may differ, prefer
    /// `strict_union` and check for errors.
    pub fn union(&mut self, other: &Hll) {
        if let Err(err) = self.union_impl(other, false) {
            // A non-strict union accepts any settings, so an error here can
            // only come from a bug in this crate.
            unreachable!("non-strict union failed: {err}");
        }
    }

    /// Merges `other` into this counter, failing with
    /// [`Error::Incompatible`] when the two counters differ in `log2m` or
    /// `regwidth`. Explicit and sparse thresholds do not affect
    /// compatibility.
    pub fn strict_union(&mut self, other: &Hll) -> Result<(), Error> {
        self.union_impl(other, true)
    }

    fn union_impl(&mut self, other: &Hll, strict: bool) -> Result<(), Error> {
        // This is where the storage abstraction intentionally breaks down:
        // something has to know how to convert between and merge the
        // different tier combinations.
        let settings = self.init_or_panic();
        let other_settings = other.resolved_settings();

        let same_settings = settings.regwidth == other_settings.regwidth
            && settings.log2m == other_settings.log2m;
        if strict && !same_settings {
            return Err(Error::Incompatible);
        }

        // Other is empty: nothing to do.
        let Some(other_storage) = &other.storage else {
            return Ok(());
        };

        if self.storage.is_none() {
            // Empty self: deep-copy the other's storage. If the other is
            // sparse but this counter has sparse disabled, go straight to
            // dense while copying the registers over.
            self.storage = Some(match other_storage {
                Storage::Sparse(map) if !settings.source.sparse_enabled => {
                    Storage::Dense(sparse_to_dense(&settings, map))
                }
                other_storage => other_storage.clone(),
            });
        } else {
            let current = self.storage.take().expect("storage checked non-empty");

            match (current, other_storage) {
                // Whatever tier this counter is in, the other's raw values
                // are simply replayed into it.
                (current, Storage::Explicit(other_set)) => {
                    self.storage = Some(current);
                    self.add_from_explicit(other_set);
                }

                (Storage::Explicit(set), Storage::Sparse(other_map)) => {
                    // Copy the sparse registers (converting to dense when
                    // sparse is disabled here), then replay our raw values.
                    self.storage = Some(if settings.source.sparse_enabled {
                        Storage::Sparse(other_map.clone())
                    } else {
                        Storage::Dense(sparse_to_dense(&settings, other_map))
                    });
                    self.add_from_explicit(&set);
                }
                (Storage::Sparse(mut map), Storage::Sparse(other_map)) => {
                    for (regnum, value) in other_map.iter() {
                        // The value may exceed our register capacity when a
                        // non-strict union crosses register widths.
                        map.set_if_greater(regnum, value & settings.index_mask as u8);
                    }
                    self.storage = Some(Storage::Sparse(map));
                }
                (Storage::Dense(mut dense), Storage::Sparse(other_map)) => {
                    for (regnum, value) in other_map.iter() {
                        dense.set_if_greater(
                            &settings,
                            regnum as usize,
                            value & settings.index_mask as u8,
                        );
                    }
                    self.storage = Some(Storage::Dense(dense));
                }

                (Storage::Explicit(set), Storage::Dense(other_dense)) => {
                    self.storage = Some(Storage::Dense(other_dense.clone()));
                    self.add_from_explicit(&set);
                }
                (Storage::Sparse(map), Storage::Dense(other_dense)) => {
                    // Upgrade to dense, then dense-union.
                    let mut dense = sparse_to_dense(&settings, &map);
                    dense_union(&mut dense, other_dense, &settings, &other_settings);
                    self.storage = Some(Storage::Dense(dense));
                }
                (Storage::Dense(mut dense), Storage::Dense(other_dense)) => {
                    dense_union(&mut dense, other_dense, &settings, &other_settings);
                    self.storage = Some(Storage::Dense(dense));
                }
            }
        }

        if self
            .storage
            .as_ref()
            .is_some_and(|s| s.over_capacity(&settings))
        {
            self.upgrade(&settings);
        }

        Ok(())
    }

    /// Serializes per the storage spec:
    /// <https://github.com/aggregateknowledge/hll-storage-spec/blob/master/STORAGE.md>
    pub fn to_bytes(&self) -> Vec<u8> {
        let settings = self.resolved_settings();

        let payload_len = self
            .storage
            .as_ref()
            .map_or(0, |s| s.size_in_bytes(&settings));

        let mut bytes = vec![0u8; 3 + payload_len];
        bytes[0] = (1 << 4) | self.storage_type() as u8;
        bytes[1] = (((settings.regwidth - 1) << 5) | settings.log2m) as u8;
        bytes[2] = pack_cutoff_byte(&settings);

        if let Some(storage) = &self.storage {
            storage.write_bytes(&settings, &mut bytes[3..]);
        }

        bytes
    }

    /// Resets this counter to empty, releasing the backing storage rather
    /// than keeping the current tier in place.
    pub fn clear(&mut self) {
        self.init_or_panic();
        self.storage = None;
    }

    /// Resolves settings for read-only operations: this counter's own, or
    /// the installed defaults.
    fn resolved_settings(&self) -> Arc<DerivedSettings> {
        if let Some(settings) = &self.settings {
            return Arc::clone(settings);
        }
        settings::default_settings()
            .unwrap_or_else(|| panic!("attempted operation on an Hll without default settings"))
    }

    /// Lazily binds a default-constructed counter to the installed
    /// defaults, panicking when there are none: proceeding without any
    /// settings would be a coding error.
    fn init_or_panic(&mut self) -> Arc<DerivedSettings> {
        let settings = self.resolved_settings();
        if self.settings.is_none() {
            self.settings = Some(Arc::clone(&settings));
        }
        settings
    }

    /// Bumps the storage to the next tier. The caller has already verified
    /// the current storage is over capacity.
    ///
    /// Explicit upgrades to either register tier by replaying each raw
    /// value through the insertion arithmetic; sparse upgrades to dense by
    /// copying register values.
    fn upgrade(&mut self, settings: &Arc<DerivedSettings>) {
        match self.storage.take() {
            Some(Storage::Explicit(set)) => {
                self.storage = Some(if settings.source.sparse_enabled {
                    Storage::Sparse(SparseStorage::new())
                } else {
                    Storage::Dense(DenseStorage::new(settings))
                });

                for value in set.iter() {
                    self.add_raw(value);
                }
            }
            Some(Storage::Sparse(map)) => {
                self.storage = Some(Storage::Dense(sparse_to_dense(settings, &map)));
            }
            other => self.storage = other,
        }
    }

    fn add_from_explicit(&mut self, set: &ExplicitStorage) {
        for value in set.iter() {
            self.add_raw(value);
        }
    }
}

impl PartialEq for Hll {
    fn eq(&self, other: &Self) -> bool {
        self.settings.as_ref().map(|s| s.source) == other.settings.as_ref().map(|s| s.source)
            && self.storage == other.storage
    }
}

impl fmt::Debug for Hll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Hll");
        s.field("storage", &self.storage_type());
        if self.settings.is_some() {
            s.field("cardinality", &self.cardinality());
        }
        s.finish()
    }
}

/// Applies the bias-corrected estimate with the small and large range
/// corrections adapted for 64-bit hashes.
fn estimate_cardinality(settings: &DerivedSettings, sum: f64, zeros: usize) -> u64 {
    let estimator = settings.alpha_m_squared / sum;

    if zeros != 0 && estimator < settings.small_estimator_cutoff {
        // Small range correction: only appropriate while registers with the
        // zero value remain.
        let m = settings.m as f64;
        return (m * (m / zeros as f64).ln()).ceil() as u64;
    }

    if estimator <= settings.large_estimator_cutoff {
        return estimator.ceil() as u64;
    }

    // Large range correction, adapted for 64-bit hashes.
    (-settings.two_to_l * (1.0 - estimator / settings.two_to_l).ln()).ceil() as u64
}

fn sparse_to_dense(settings: &DerivedSettings, sparse: &SparseStorage) -> DenseStorage {
    let mut dense = DenseStorage::new(settings);
    for (regnum, value) in sparse.iter() {
        dense.set_if_greater(settings, regnum as usize, value);
    }
    dense
}

/// Unions two dense storages. With matching `log2m` and `regwidth` the
/// single-pass streaming union applies; otherwise registers are compared
/// one by one, masked to this counter's capacity.
fn dense_union(
    this: &mut DenseStorage,
    other: &DenseStorage,
    this_settings: &DerivedSettings,
    other_settings: &DerivedSettings,
) {
    if this_settings.log2m == other_settings.log2m
        && this_settings.regwidth == other_settings.regwidth
    {
        this.union(this_settings, other);
    } else {
        for regnum in 0..this_settings.m {
            let value =
                other.get(regnum, other_settings.regwidth) & this_settings.index_mask as u8;
            this.set_if_greater(this_settings, regnum, value);
        }
    }
}
