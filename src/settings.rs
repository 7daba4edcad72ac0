//! Counter configuration: validation, derived constants, and the
//! process-wide default settings registry.
//!
//! `Settings` is the public, plain-data configuration. Deriving it produces
//! an immutable [`DerivedSettings`] carrying every constant the hot paths
//! need (masks, estimator cutoffs, promotion thresholds). Derivation is
//! memoized per distinct `Settings` value, and the result is shared between
//! counters through an `Arc`.

use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::Error;

const MIN_LOG2M: u32 = 4;
const MAX_LOG2M: u32 = 31;
const MIN_REGWIDTH: u32 = 1;
const MAX_REGWIDTH: u32 = 8;

/// Largest allowed explicit threshold, per the storage spec's cutoff-byte
/// encoding (2^17 entries).
pub const MAX_EXPLICIT_THRESHOLD: u32 = 1 << 17;

/// Cardinality at which a counter leaves the explicit representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExplicitThreshold {
    /// Calculate a threshold from `log2m` and `regwidth` (recommended): the
    /// byte size of the dense form divided by 8, so the explicit set never
    /// outgrows the memory the dense registers would take.
    #[default]
    Auto,
    /// Never use the explicit representation.
    Disabled,
    /// Promote once more than this many distinct hashes are held.
    /// Must be in `1..=MAX_EXPLICIT_THRESHOLD`.
    Fixed(u32),
}

/// Configuration for an [`Hll`](crate::Hll) and its storage transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Settings {
    /// Base-2 log of the register count; the counter uses `2^log2m`
    /// registers. Valid range is 4..=31.
    pub log2m: u32,
    /// Bits per register. Valid range is 1..=8.
    pub regwidth: u32,
    /// When to leave the explicit representation.
    pub explicit_threshold: ExplicitThreshold,
    /// Whether the sparse representation is used between the explicit and
    /// dense tiers. The promotion threshold is calculated automatically.
    pub sparse_enabled: bool,
}

impl Settings {
    /// Validates every field, naming the offending field and bound on error.
    pub fn validate(&self) -> Result<(), Error> {
        check_range("log2m", self.log2m, MIN_LOG2M, MAX_LOG2M)?;
        check_range("regwidth", self.regwidth, MIN_REGWIDTH, MAX_REGWIDTH)?;
        if let ExplicitThreshold::Fixed(n) = self.explicit_threshold {
            check_range("explicit_threshold", n, 1, MAX_EXPLICIT_THRESHOLD)?;
        }
        Ok(())
    }

    /// Validates and derives the internal constants, memoizing the result.
    pub(crate) fn derive(&self) -> Result<Arc<DerivedSettings>, Error> {
        self.validate()?;

        if let Some(derived) = SETTINGS_CACHE.read().get(self) {
            return Ok(Arc::clone(derived));
        }

        let log2m = self.log2m;
        let regwidth = self.regwidth;
        let m = 1usize << log2m;
        let max_reg_value = (1u32 << regwidth) - 1;
        let two_to_l = two_to_l(log2m, regwidth);

        let explicit_threshold = match self.explicit_threshold {
            ExplicitThreshold::Auto => calculate_explicit_threshold(log2m, regwidth),
            ExplicitThreshold::Disabled => 0,
            ExplicitThreshold::Fixed(n) => n as usize,
        };

        let sparse_threshold = if self.sparse_enabled {
            calculate_sparse_threshold(log2m, regwidth)
        } else {
            0
        };

        let derived = Arc::new(DerivedSettings {
            source: *self,
            log2m,
            regwidth,
            explicit_threshold,
            sparse_threshold,
            m,
            index_mask: (m - 1) as u64,
            max_reg_value,
            pw_max_mask: pw_max_mask(regwidth),
            alpha_m_squared: alpha_m_squared(log2m),
            small_estimator_cutoff: (m as f64) * 5.0 / 2.0,
            large_estimator_cutoff: two_to_l / 30.0,
            two_to_l,
        });

        // A racing derivation of the same settings is idempotent.
        SETTINGS_CACHE
            .write()
            .entry(*self)
            .or_insert_with(|| Arc::clone(&derived));

        Ok(derived)
    }
}

/// Validated settings plus every constant derived from them. Immutable and
/// shared between counters through an `Arc`.
#[derive(Debug)]
pub(crate) struct DerivedSettings {
    /// The configuration this was derived from.
    pub(crate) source: Settings,

    pub(crate) log2m: u32,
    pub(crate) regwidth: u32,

    /// Resolved entry cap of the explicit tier; 0 disables it.
    pub(crate) explicit_threshold: usize,
    /// Entry cap of the sparse tier; 0 when sparse is disabled.
    pub(crate) sparse_threshold: usize,

    /// Register count, `2^log2m`.
    pub(crate) m: usize,
    /// Mask extracting the register index from a raw hash.
    pub(crate) index_mask: u64,
    /// Largest storable register value, `2^regwidth - 1`.
    pub(crate) max_reg_value: u32,
    /// OR-ed into the substream before counting trailing zeros so the
    /// resulting register value can never exceed `max_reg_value`.
    pub(crate) pw_max_mask: u64,

    /// `alpha * m^2`, the constant of the raw estimator.
    pub(crate) alpha_m_squared: f64,
    /// Estimator value below which the small range correction applies.
    pub(crate) small_estimator_cutoff: f64,
    /// Estimator value above which the large range correction applies.
    pub(crate) large_estimator_cutoff: f64,
    /// `2^L` where `L` is the large range correction boundary.
    pub(crate) two_to_l: f64,
}

impl DerivedSettings {
    /// Turns a raw hash into its `(register index, register value)`
    /// observation, or `None` for a substream of zero (the paper does not
    /// define p(0); register zero-initialization already represents it).
    pub(crate) fn register_observation(&self, value: u64) -> Option<(u32, u8)> {
        let substream = value >> self.log2m;
        if substream == 0 {
            return None;
        }

        // trailing_zeros is the 0-based index of the least significant set
        // bit; OR-ing pw_max_mask bounds it at max_reg_value - 1.
        let pw = 1 + (substream | self.pw_max_mask).trailing_zeros() as u8;
        Some(((value & self.index_mask) as u32, pw))
    }
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), Error> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidSettings {
            field,
            min: i64::from(min),
            max: i64::from(max),
            value: i64::from(value),
        })
    }
}

/// Cutoff between explicit and probabilistic storage: the byte size of the
/// dense representation divided into 8-byte entries, capped at the spec's
/// maximum. This matches the size calculation of the PostgreSQL
/// implementation.
fn calculate_explicit_threshold(log2m: u32, regwidth: u32) -> usize {
    let m = 1usize << log2m;
    let dense_bytes = (m * regwidth as usize).div_ceil(8);
    (dense_bytes / 8).min(MAX_EXPLICIT_THRESHOLD as usize)
}

/// Cutoff between sparse and dense storage: the largest power of two whose
/// packed sparse encoding still undercuts the dense byte size.
fn calculate_sparse_threshold(log2m: u32, regwidth: u32) -> usize {
    let m = 1usize << log2m;
    let short_word_length = log2m + regwidth;
    let largest_pow2 = ((m * regwidth as usize) as f64 / f64::from(short_word_length)).log2();
    1usize << largest_pow2 as u32
}

/// Mask preventing register overflow: with the mask OR-ed in, the trailing
/// zero count of any substream is at most `max_reg_value - 2`, so the final
/// 1-based register value is at most `max_reg_value`. For regwidths whose
/// maximum exceeds the 64-bit hash space the mask degenerates to zero.
fn pw_max_mask(regwidth: u32) -> u64 {
    let max_reg_value = (1u32 << regwidth) - 1;
    if max_reg_value - 1 >= 64 {
        0
    } else {
        !((1u64 << (max_reg_value - 1)) - 1)
    }
}

/// `alpha * m^2`, the bias correction constant of the raw estimator.
fn alpha_m_squared(log2m: u32) -> f64 {
    let m = (1u64 << log2m) as f64;
    match log2m {
        4 => 0.673 * m * m,
        5 => 0.697 * m * m,
        6 => 0.709 * m * m,
        _ => (0.7213 / (1.0 + 1.079 / m)) * m * m,
    }
}

/// `2^L` where `L` is the "large range correction boundary" for 64-bit
/// hashes: one less than the hash bits inspected per register, plus log2m.
/// Exceeds u64 range for wide configurations, hence f64.
fn two_to_l(log2m: u32, regwidth: u32) -> f64 {
    let max_reg_value = (1u32 << regwidth) - 1;

    // Only (max_reg_value - 1) substream bits are inspected because the
    // stored value is 1-based, so the hash space is one power of two
    // smaller.
    let pw_bits = max_reg_value - 1;
    f64::from(pw_bits + log2m).exp2()
}

/// Serializes the header byte holding the sparse flag and the explicit
/// threshold: bit 6 is `sparse_enabled`, bits 0..=5 encode the threshold as
/// 0 (disabled), 63 (auto), or `floor(log2(threshold)) + 1`. Rounds a
/// non-power-of-two threshold down to the nearest power of two, the same
/// destructive transformation the storage spec prescribes.
pub(crate) fn pack_cutoff_byte(settings: &DerivedSettings) -> u8 {
    let threshold = match settings.source.explicit_threshold {
        ExplicitThreshold::Auto => 63,
        ExplicitThreshold::Disabled => 0,
        ExplicitThreshold::Fixed(n) => (n.ilog2() + 1) as u8,
    };

    threshold | (u8::from(settings.source.sparse_enabled) << 6)
}

/// Deserializes the cutoff byte. Fails when the encoded exponent produces a
/// threshold beyond the allowed maximum.
pub(crate) fn unpack_cutoff_byte(byte: u8) -> Result<(bool, ExplicitThreshold), Error> {
    let sparse_enabled = (byte >> 6) & 1 == 1;

    let threshold = match byte & 0x3f {
        0 => ExplicitThreshold::Disabled,
        63 => ExplicitThreshold::Auto,
        exponent => {
            let threshold = 1u64 << (exponent - 1);
            if threshold > u64::from(MAX_EXPLICIT_THRESHOLD) {
                return Err(Error::InvalidSettings {
                    field: "explicit_threshold",
                    min: 1,
                    max: i64::from(MAX_EXPLICIT_THRESHOLD),
                    value: threshold as i64,
                });
            }
            ExplicitThreshold::Fixed(threshold as u32)
        }
    };

    Ok((sparse_enabled, threshold))
}

static SETTINGS_CACHE: Lazy<RwLock<HashMap<Settings, Arc<DerivedSettings>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static DEFAULT_SETTINGS: Lazy<RwLock<Option<Arc<DerivedSettings>>>> =
    Lazy::new(|| RwLock::new(None));

/// Installs the settings used by zero-value counters. Applications usually
/// deal with homogeneous counters, so installing defaults once at startup
/// and using [`Hll::default`](crate::Hll) is the preferred workflow.
///
/// Installing the same settings again succeeds idempotently; installing
/// different settings after the first install fails with
/// [`Error::DefaultsConflict`].
pub fn install_defaults(settings: Settings) -> Result<(), Error> {
    let derived = settings.derive()?;

    let mut slot = DEFAULT_SETTINGS.write();
    match slot.as_ref() {
        Some(existing) if existing.source != settings => Err(Error::DefaultsConflict),
        _ => {
            *slot = Some(derived);
            Ok(())
        }
    }
}

/// Returns the installed defaults, if any.
pub(crate) fn default_settings() -> Option<Arc<DerivedSettings>> {
    DEFAULT_SETTINGS.read().clone()
}

#[cfg(test)]
pub(crate) fn reset_defaults() {
    *DEFAULT_SETTINGS.write() = None;
}
