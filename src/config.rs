//! Tunables for the allocator.
//!
//! The defaults are compile-time constants. A [`Config`] bundles them so tests
//! (and embedders that know their workload) can build an allocator with a
//! different arena/mapping cutover or bin layout.

use crate::bins::MAX_BIN_COUNT;
use crate::blocklist::HEADER_SIZE;
use crate::error::MallocError;

/// Minimum alignment of every payload. All block sizes are multiples of this.
pub const BASE_ALIGNMENT: usize = 16;

/// Requests of at least this many bytes bypass the arena and get their own
/// mapping, which is returned to the OS as soon as it is released.
pub const LARGE_OBJECT_THRESHOLD: usize = 128 * 1024;

/// Size granularity of the small-object bins.
pub const SMALL_OBJECT_BIN_WIDTH: usize = 16;

/// Number of small-object bins. With the default width the bins cover 16..=256
/// bytes.
pub const BIN_COUNT: usize = 16;

/// A split only happens when the leftover tail can hold a header plus at least
/// this many payload bytes.
pub const MIN_SPLIT_PAYLOAD: usize = 16;

/// Allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum payload alignment; a power of two, at least [`HEADER_SIZE`].
    pub base_alignment: usize,
    /// Size at or above which allocations bypass the arena.
    pub large_object_threshold: usize,
    /// Size granularity for the O(1) bins.
    pub small_object_bin_width: usize,
    /// How many bins there are, at most [`MAX_BIN_COUNT`].
    pub bin_count: usize,
    /// Smallest payload worth splitting off into a new free block.
    pub min_split_payload: usize,
}

impl Config {
    pub const DEFAULT: Config = Config {
        base_alignment: BASE_ALIGNMENT,
        large_object_threshold: LARGE_OBJECT_THRESHOLD,
        small_object_bin_width: SMALL_OBJECT_BIN_WIDTH,
        bin_count: BIN_COUNT,
        min_split_payload: MIN_SPLIT_PAYLOAD,
    };

    /// Largest size that is served from the bins.
    pub const fn max_bin_size(&self) -> usize {
        self.small_object_bin_width * self.bin_count
    }

    /// Check that the values are consistent with each other.
    pub fn validate(&self) -> Result<(), MallocError> {
        let invalid = |reason| Err(MallocError::InvalidConfig { reason });

        if !self.base_alignment.is_power_of_two() {
            return invalid("base_alignment must be a power of two");
        }
        if self.base_alignment < HEADER_SIZE {
            return invalid("base_alignment must be at least the header size");
        }
        if self.small_object_bin_width == 0
            || self.small_object_bin_width % self.base_alignment != 0
        {
            return invalid("small_object_bin_width must be a multiple of base_alignment");
        }
        if self.bin_count == 0 || self.bin_count > MAX_BIN_COUNT {
            return invalid("bin_count must be between 1 and MAX_BIN_COUNT");
        }
        if self.min_split_payload == 0 || self.min_split_payload % self.base_alignment != 0 {
            return invalid("min_split_payload must be a non-zero multiple of base_alignment");
        }
        if self.large_object_threshold <= self.max_bin_size() {
            return invalid("large_object_threshold must exceed the largest bin size");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}

/// Round `value` up to a multiple of `align`, which must be a power of two.
///
/// Returns `None` on overflow.
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn default_is_valid() {
        assert!(Config::DEFAULT.validate().is_ok());
        assert_eq!(Config::default().max_bin_size(), 256);
    }

    #[test]
    fn rejects_inconsistent_values() {
        let bad_alignment = Config {
            base_alignment: 24,
            ..Config::DEFAULT
        };
        assert!(bad_alignment.validate().is_err());

        let tiny_alignment = Config {
            base_alignment: 8,
            ..Config::DEFAULT
        };
        assert!(tiny_alignment.validate().is_err());

        let odd_width = Config {
            small_object_bin_width: 40,
            ..Config::DEFAULT
        };
        assert!(odd_width.validate().is_err());

        let too_many_bins = Config {
            bin_count: MAX_BIN_COUNT + 1,
            large_object_threshold: 1 << 20,
            ..Config::DEFAULT
        };
        assert!(too_many_bins.validate().is_err());

        let low_threshold = Config {
            large_object_threshold: 128,
            ..Config::DEFAULT
        };
        assert!(low_threshold.validate().is_err());
    }

    #[test]
    fn rounding() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(17, 16), Some(32));
        assert_eq!(align_up(33, 32), Some(64));
        assert_eq!(align_up(usize::MAX - 3, 16), None);
    }
}
