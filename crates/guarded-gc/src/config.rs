//! Runtime configuration.

use std::fmt;
use std::time::Duration;

/// Default user bytes of a heap's first arena.
pub const DEFAULT_INITIAL_ARENA_BYTES: usize = 4 * 1024 * 1024;
/// Default floor for arenas appended without collecting.
pub const DEFAULT_MIN_EMERGENCY_ARENA_BYTES: usize = 1024 * 1024;
/// Default minimum size of one scratch page set.
pub const DEFAULT_SCRATCH_PAGESET_BYTES: usize = 1024 * 1024;
/// Default bounded wait of a parked thread before it re-checks its flags.
pub const DEFAULT_CHECKIN_WAIT: Duration = Duration::from_micros(10);
/// Default time a collection gives other threads to reach a safe point.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Tuning knobs for a [`Runtime`](crate::Runtime).
///
/// None of these affect correctness. A bad guess costs extra collections or
/// temporarily wasted memory.
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// User bytes of the first arena of a heap created without an explicit size.
    pub initial_arena_bytes: usize,
    /// Multiplier applied to the live-set estimate when sizing to-space.
    pub growth_factor: f64,
    /// Extra multiplier used once after a low-occupancy collection.
    pub expand_factor: f64,
    /// Post-collection occupancy (percent of the new arena) below which the
    /// heap is flagged to expand on its next growth.
    pub low_occupancy_percent: u8,
    /// Floor for arenas appended instead of collecting.
    pub min_emergency_arena_bytes: usize,
    /// Minimum size of one scratch allocator page set.
    pub scratch_pageset_bytes: usize,
    /// How long a parked thread waits before re-checking its flags.
    pub checkin_wait: Duration,
    /// How long a collection waits for other threads to park or suspend
    /// before it proceeds without them. Stacks of threads that never
    /// acknowledged the pause are not scanned.
    pub ack_timeout: Duration,
    /// Whether registered thread stacks are scanned for roots.
    pub scan_thread_stacks: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_arena_bytes: DEFAULT_INITIAL_ARENA_BYTES,
            growth_factor: 2.0,
            expand_factor: 2.0,
            low_occupancy_percent: 25,
            min_emergency_arena_bytes: DEFAULT_MIN_EMERGENCY_ARENA_BYTES,
            scratch_pageset_bytes: DEFAULT_SCRATCH_PAGESET_BYTES,
            checkin_wait: DEFAULT_CHECKIN_WAIT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            scan_thread_stacks: true,
        }
    }
}

impl GcConfig {
    /// Sets [`initial_arena_bytes`](Self::initial_arena_bytes).
    #[must_use]
    pub const fn with_initial_arena_bytes(mut self, bytes: usize) -> Self {
        self.initial_arena_bytes = bytes;
        self
    }

    /// Sets [`growth_factor`](Self::growth_factor).
    #[must_use]
    pub const fn with_growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Sets [`expand_factor`](Self::expand_factor).
    #[must_use]
    pub const fn with_expand_factor(mut self, factor: f64) -> Self {
        self.expand_factor = factor;
        self
    }

    /// Sets [`low_occupancy_percent`](Self::low_occupancy_percent).
    #[must_use]
    pub const fn with_low_occupancy_percent(mut self, percent: u8) -> Self {
        self.low_occupancy_percent = percent;
        self
    }

    /// Sets [`min_emergency_arena_bytes`](Self::min_emergency_arena_bytes).
    #[must_use]
    pub const fn with_min_emergency_arena_bytes(mut self, bytes: usize) -> Self {
        self.min_emergency_arena_bytes = bytes;
        self
    }

    /// Sets [`scratch_pageset_bytes`](Self::scratch_pageset_bytes).
    #[must_use]
    pub const fn with_scratch_pageset_bytes(mut self, bytes: usize) -> Self {
        self.scratch_pageset_bytes = bytes;
        self
    }

    /// Sets [`checkin_wait`](Self::checkin_wait).
    #[must_use]
    pub const fn with_checkin_wait(mut self, wait: Duration) -> Self {
        self.checkin_wait = wait;
        self
    }

    /// Sets [`ack_timeout`](Self::ack_timeout).
    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets [`scan_thread_stacks`](Self::scan_thread_stacks).
    #[must_use]
    pub const fn with_scan_thread_stacks(mut self, scan: bool) -> Self {
        self.scan_thread_stacks = scan;
        self
    }

    /// Checks that every field is in range.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_arena_bytes == 0 {
            return Err(ConfigError::ZeroSize("initial_arena_bytes"));
        }
        if self.min_emergency_arena_bytes == 0 {
            return Err(ConfigError::ZeroSize("min_emergency_arena_bytes"));
        }
        if self.scratch_pageset_bytes == 0 {
            return Err(ConfigError::ZeroSize("scratch_pageset_bytes"));
        }
        if !(self.growth_factor.is_finite() && self.growth_factor >= 1.0) {
            return Err(ConfigError::Factor("growth_factor", self.growth_factor));
        }
        if !(self.expand_factor.is_finite() && self.expand_factor >= 1.0) {
            return Err(ConfigError::Factor("expand_factor", self.expand_factor));
        }
        if self.low_occupancy_percent > 100 {
            return Err(ConfigError::Percent(self.low_occupancy_percent));
        }
        if self.checkin_wait.is_zero() {
            return Err(ConfigError::ZeroWait);
        }
        Ok(())
    }
}

/// A [`GcConfig`] field out of range.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A size field was zero.
    ZeroSize(&'static str),
    /// A multiplier was below 1.0 or not finite.
    Factor(&'static str, f64),
    /// The occupancy threshold exceeded 100.
    Percent(u8),
    /// The check-in wait was zero.
    ZeroWait,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize(field) => write!(f, "{field} must be greater than zero"),
            Self::Factor(field, value) => {
                write!(f, "{field} must be a finite value >= 1.0, got {value}")
            }
            Self::Percent(value) => write!(f, "low_occupancy_percent must be <= 100, got {value}"),
            Self::ZeroWait => f.write_str("checkin_wait must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
