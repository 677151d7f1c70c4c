//! Sleep schedule for cycles with nothing to mix

use std::time::Duration;

/// Geometric backoff from `base`, doubling per consecutive miss, capped
/// at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderrunBackoff {
    base: Duration,
    max: Duration,
}

impl UnderrunBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Sleep after `misses` consecutive idle cycles (0 = first miss)
    pub fn delay(&self, misses: u32) -> Duration {
        let factor = 1u32 << misses.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for UnderrunBackoff {
    fn default() -> Self {
        Self::new(
            crate::constants::BUFFER_RECOVERY,
            crate::constants::MAX_BUFFER_RECOVERY,
        )
    }
}
