//! Growth configuration for a [`Pool`](crate::Pool).

use crate::{
    error::{PoolError, Result},
    frame::FRAME_OVERHEAD,
};

/// Alignment of every pointer handed out by [`Pool::malloc`](crate::Pool::malloc).
///
/// Requested sizes are rounded up to a multiple of this value, so the cursor
/// of a frame always sits on a word boundary.
pub const MIN_ALIGN: usize = std::mem::align_of::<usize>();

/// Default number of usable bytes requested for each new block.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default factor applied to requests that do not fit in a default block.
pub const DEFAULT_GROWTH_MULTIPLIER: usize = 2;

/// Sizing policy for the blocks a pool requests from its backend.
///
/// A request smaller than `block_size` grows the frame by one `block_size`
/// block. Anything larger gets a block of `size * growth_multiplier` so the
/// frame has room left over for the small allocations that usually follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Usable bytes requested per block
    pub block_size: usize,
    /// Multiplier for oversized requests
    pub growth_multiplier: usize,
}

impl PoolConfig {
    /// Creates a configuration, rejecting values the pool cannot work with.
    pub fn new(block_size: usize, growth_multiplier: usize) -> Result<Self> {
        let config = PoolConfig {
            block_size,
            growth_multiplier,
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with a different block size.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Returns a copy with a different growth multiplier.
    pub fn with_growth_multiplier(mut self, factor: usize) -> Self {
        self.growth_multiplier = factor;
        self
    }

    /// Checks that a block can at least hold a frame marker and that the
    /// multiplier never shrinks a request.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < FRAME_OVERHEAD {
            return Err(PoolError::InvalidConfig {
                message: format!(
                    "block size {} is smaller than the {} byte frame overhead",
                    self.block_size, FRAME_OVERHEAD
                ),
            });
        }

        if self.growth_multiplier == 0 {
            return Err(PoolError::InvalidConfig {
                message: "growth multiplier must be at least 1".to_owned(),
            });
        }

        Ok(())
    }

    /// Usable bytes to request for a block that must fit `size` bytes.
    pub(crate) fn growth_request(&self, size: usize) -> Result<usize> {
        if size < self.block_size {
            Ok(self.block_size)
        } else {
            size.checked_mul(self.growth_multiplier)
                .ok_or(PoolError::CapacityOverflow { size })
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            growth_multiplier: DEFAULT_GROWTH_MULTIPLIER,
        }
    }
}

/// Rounds `bytes` up to the next multiple of [`MIN_ALIGN`].
#[inline]
pub(crate) fn round_to_word(bytes: usize) -> Result<usize> {
    bytes
        .checked_add(MIN_ALIGN - 1)
        .map(|padded| padded & !(MIN_ALIGN - 1))
        .ok_or(PoolError::CapacityOverflow { size: bytes })
}

#[cfg(test)]
mod test {
    use super::*;

    use rstest::rstest;

    #[test]
    pub fn default_config_test() {
        let config = PoolConfig::default();
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.growth_multiplier, 2);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(0, 2)]
    #[case(FRAME_OVERHEAD - 1, 2)]
    #[case(1024, 0)]
    pub fn rejects_invalid_config_test(#[case] block_size: usize, #[case] multiplier: usize) {
        let err = PoolConfig::new(block_size, multiplier).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig { .. }));
    }

    #[rstest]
    #[case(1, 64)]
    #[case(63, 64)]
    #[case(64, 128)]
    #[case(100, 200)]
    pub fn growth_request_test(#[case] size: usize, #[case] expected: usize) {
        let config = PoolConfig::new(64, 2).unwrap();
        assert_eq!(config.growth_request(size).unwrap(), expected);
    }

    #[test]
    pub fn growth_request_overflow_test() {
        let config = PoolConfig::default();
        assert_eq!(
            config.growth_request(usize::MAX),
            Err(PoolError::CapacityOverflow { size: usize::MAX })
        );
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, MIN_ALIGN)]
    #[case(MIN_ALIGN, MIN_ALIGN)]
    #[case(MIN_ALIGN + 1, 2 * MIN_ALIGN)]
    pub fn round_to_word_test(#[case] bytes: usize, #[case] expected: usize) {
        assert_eq!(round_to_word(bytes).unwrap(), expected);
    }

    #[test]
    pub fn round_to_word_overflow_test() {
        assert!(round_to_word(usize::MAX).is_err());
    }
}
