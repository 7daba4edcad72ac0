//! Dense storage: every register materialized in a packed bit vector.
//!
//! The vector is backed by `u64` words rather than bytes so the hot paths
//! (indicator, union) cross an array boundary as rarely as possible; the
//! serialization path pays a one-time repacking cost instead. Register `k`
//! starts at bit `k * regwidth`, counted MSB-first within each word, so a
//! register can straddle two consecutive words.

use crate::error::Error;
use crate::settings::DerivedSettings;
use crate::storage::StorageOps;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DenseStorage {
    words: Vec<u64>,
}

impl DenseStorage {
    /// Allocates a zeroed vector with room for all `2^log2m` registers.
    pub(crate) fn new(settings: &DerivedSettings) -> Self {
        let bytes = (settings.m * settings.regwidth as usize).div_ceil(8);
        Self {
            words: vec![0; bytes.div_ceil(8)],
        }
    }

    fn position(regnum: usize, regwidth: u32) -> (usize, usize) {
        let addr = regnum * regwidth as usize;
        (addr >> 6, addr & 0x3f)
    }

    /// Extracts a single register value. `regwidth` is passed in rather
    /// than read from settings so registers of a counter with different
    /// settings can be read during a non-strict union.
    pub(crate) fn get(&self, regnum: usize, regwidth: u32) -> u8 {
        let (idx, pos) = Self::position(regnum, regwidth);
        let regwidth = regwidth as usize;

        if pos + regwidth <= 64 {
            let shift = 64 - (pos + regwidth);
            let mask = ((1u64 << regwidth) - 1) << shift;
            return ((self.words[idx] & mask) >> shift) as u8;
        }

        // Boundary read: upper bits from this word, lower bits from the next.
        let n_upper = 64 - pos;
        let n_lower = regwidth - n_upper;
        let upper_mask = (1u64 << n_upper) - 1;

        let upper = (self.words[idx] & upper_mask) << n_lower;
        let lower = self.words[idx + 1] >> (64 - n_lower);
        (upper | lower) as u8
    }

    /// Assigns `value` to the register when it exceeds the current value.
    pub(crate) fn set_if_greater(&mut self, settings: &DerivedSettings, regnum: usize, value: u8) {
        let regwidth = settings.regwidth as usize;
        let (idx, pos) = Self::position(regnum, settings.regwidth);

        if pos + regwidth <= 64 {
            let shift = 64 - (pos + regwidth);
            let mask = ((1u64 << regwidth) - 1) << shift;
            let current = ((self.words[idx] & mask) >> shift) as u8;
            if value > current {
                // The value is masked down so an oversized value coming from
                // a width-mismatched union cannot spill into neighbors.
                self.words[idx] =
                    (self.words[idx] & !mask) | ((u64::from(value) << shift) & mask);
            }
            return;
        }

        // Boundary write.
        let n_upper = 64 - pos;
        let n_lower = regwidth - n_upper;
        let upper_mask = (1u64 << n_upper) - 1;
        let lower_mask = (1u64 << n_lower) - 1;

        let current = ((self.words[idx] & upper_mask) << n_lower)
            | (self.words[idx + 1] >> (64 - n_lower));
        if u64::from(value) > current {
            let lower_mask_shifted = lower_mask << (64 - n_lower);
            self.words[idx] =
                (self.words[idx] & !upper_mask) | ((u64::from(value) >> n_lower) & upper_mask);
            self.words[idx + 1] = (self.words[idx + 1] & !lower_mask_shifted)
                | ((u64::from(value) & lower_mask) << (64 - n_lower));
        }
    }

    /// Computes the indicator sum and zero-register count in one streaming
    /// pass, reassembling straddling registers as they are crossed.
    pub(crate) fn indicator(&self, settings: &DerivedSettings) -> (f64, usize) {
        let regwidth = settings.regwidth as usize;
        let top_mask = u64::from(settings.max_reg_value) << (64 - regwidth);

        let mut idx = 0;
        let mut pos = 0;
        let mut curr = self.words[0];
        let mut mask = top_mask;

        let mut sum = 0.0;
        let mut zeros = 0;

        for _ in 0..settings.m {
            let value;
            let available = 64 - pos;

            if available >= regwidth {
                value = (curr & mask) >> (64 - pos - regwidth);
                pos += regwidth;
                mask >>= regwidth;
            } else {
                let n_lower = regwidth - available;

                let mut upper = 0;
                if available > 0 {
                    upper = (curr & mask) << n_lower;
                }

                idx += 1;
                curr = self.words[idx];

                let lower_mask = ((1u64 << n_lower) - 1) << (64 - n_lower);
                let lower = (curr & lower_mask) >> (64 - n_lower);

                value = upper | lower;

                pos = n_lower;
                mask = top_mask >> pos;
            }

            sum += f64::exp2(-(value as f64));
            if value == 0 {
                zeros += 1;
            }
        }

        (sum, zeros)
    }

    /// Unions `other` into `self` in one streaming pass over both word
    /// vectors. Both counters must share `log2m` and `regwidth`, which is
    /// what makes the shift-free aligned comparison valid.
    ///
    /// A word is written back only when its computed value differs.
    pub(crate) fn union(&mut self, settings: &DerivedSettings, other: &DenseStorage) {
        let regwidth = settings.regwidth as usize;
        let top_mask = u64::from(settings.max_reg_value) << (64 - regwidth);

        let mut idx = 0;
        let mut pos = 0;
        let mut this_word = self.words[0];
        let mut other_word = other.words[0];
        let mut computed = this_word;
        let mut mask = top_mask;

        for _ in 0..settings.m {
            let available = 64 - pos;

            if available >= regwidth {
                let this_value = this_word & mask;
                let other_value = other_word & mask;

                // Identically positioned, so no shift is needed to compare
                // or to mix the winner back in.
                if other_value > this_value {
                    computed = (computed & !mask) | other_value;
                }

                pos += regwidth;
                mask >>= regwidth;
            } else {
                // The register straddles the word boundary. If the upper
                // bits differ, the larger side wins the whole register; only
                // on equal upper bits do the lower bits decide.
                let mut other_is_greater = false;
                let mut this_is_greater = false;

                if available > 0 {
                    let this_value = this_word & mask;
                    let other_value = other_word & mask;

                    if other_value > this_value {
                        computed = (computed & !mask) | other_value;
                        other_is_greater = true;
                    } else if other_value < this_value {
                        this_is_greater = true;
                    }
                }

                if computed != this_word {
                    self.words[idx] = computed;
                }

                idx += 1;
                this_word = self.words[idx];
                other_word = other.words[idx];
                let n_lower = regwidth - available;
                computed = this_word;

                if !this_is_greater {
                    let lower_mask = ((1u64 << n_lower) - 1) << (64 - n_lower);
                    let this_lower = this_word & lower_mask;
                    let other_lower = other_word & lower_mask;

                    if (other_is_greater && this_lower != other_lower) || other_lower > this_lower
                    {
                        computed = (computed & !lower_mask) | other_lower;
                    }
                }

                pos = n_lower;
                mask = top_mask >> pos;
            }
        }

        if computed != this_word {
            self.words[idx] = computed;
        }
    }

    /// Reads the exact dense payload back into words; the trailing partial
    /// word, if any, carries only its high-order bytes on the wire.
    pub(crate) fn from_bytes(settings: &DerivedSettings, bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != (settings.m * settings.regwidth as usize).div_ceil(8) {
            return Err(Error::InsufficientBytes);
        }

        let mut storage = Self::new(settings);

        let n_words = bytes.len() / 8;
        for i in 0..n_words {
            storage.words[i] = u64::from_be_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        }

        let remainder = bytes.len() % 8;
        if remainder > 0 {
            let mut last = [0u8; 8];
            last[..remainder].copy_from_slice(&bytes[bytes.len() - remainder..]);
            storage.words[n_words] = u64::from_be_bytes(last);
        }

        Ok(storage)
    }
}

impl StorageOps for DenseStorage {
    /// Dense is the terminal tier; there is nothing to promote to.
    fn over_capacity(&self, _settings: &DerivedSettings) -> bool {
        false
    }

    /// Computed from the settings rather than the word count because the
    /// final word may not be fully used.
    fn size_in_bytes(&self, settings: &DerivedSettings) -> usize {
        (settings.m * settings.regwidth as usize).div_ceil(8)
    }

    fn write_bytes(&self, settings: &DerivedSettings, buf: &mut [u8]) {
        let n = self.size_in_bytes(settings);
        let n_words = n / 8;
        for i in 0..n_words {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&self.words[i].to_be_bytes());
        }

        let remainder = n % 8;
        if remainder > 0 {
            let last = self.words[n_words].to_be_bytes();
            buf[n_words * 8..].copy_from_slice(&last[..remainder]);
        }
    }
}
