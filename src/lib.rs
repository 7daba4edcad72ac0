//! `hll-estimator` is a HyperLogLog distinct-value counter that is bit-exact
//! wire-compatible with the [Aggregate Knowledge HLL storage spec v1], as
//! used by the PostgreSQL `hll` extension and the reference Java library.
//!
//! Counters accept pre-hashed 64-bit values, estimate cardinality with the
//! small/large range corrections adapted for 64-bit hashes, union losslessly,
//! and round-trip through the standardized byte encoding. Storage moves
//! automatically through three tiers as a counter grows: an explicit set of
//! raw hashes, a sparse register map, and a dense bit-packed register array.
//!
//! ```
//! use hll_estimator::{ExplicitThreshold, Hll, Settings};
//!
//! let mut counter = Hll::new(Settings {
//!     log2m: 11,
//!     regwidth: 5,
//!     explicit_threshold: ExplicitThreshold::Auto,
//!     sparse_enabled: true,
//! })
//! .unwrap();
//!
//! // Values must already be hashed (e.g. with MurmurHash3 or xxHash).
//! counter.add_raw(0x3c1a_9f52_77e0_48d1);
//! counter.add_raw(0xb6fe_1200_9ab3_55c7);
//! assert_eq!(2, counter.cardinality());
//!
//! let bytes = counter.to_bytes();
//! assert_eq!(counter, hll_estimator::Hll::from_bytes(&bytes).unwrap());
//! ```
//!
//! [Aggregate Knowledge HLL storage spec v1]:
//!     https://github.com/aggregateknowledge/hll-storage-spec/blob/master/STORAGE.md

mod bits;
mod dense;
mod error;
mod explicit;
mod hll;
#[cfg(feature = "with_serde")]
mod serde;
mod settings;
mod sparse;
mod storage;

pub use crate::error::Error;
pub use crate::hll::Hll;
pub use crate::settings::{install_defaults, ExplicitThreshold, Settings, MAX_EXPLICIT_THRESHOLD};
pub use crate::storage::StorageType;
