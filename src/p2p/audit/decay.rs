//! Exponentially decayed values with second precision
//!
//! Instead of calling `exp` on every update, decay multipliers for elapsed
//! seconds are precomputed per mean-lifetime and memoized in a shared cache.
//! For elapsed times beyond the table, the last entry (a full table-length
//! worth of decay) is chained; far beyond that the value collapses to zero.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Number of precomputed per-second multipliers per mean-lifetime.
pub const DECAY_SLICE_LENGTH: usize = 32;

/// Elapsed seconds beyond which a value is treated as fully decayed.
const TRUNCATE_SECS: i64 = (DECAY_SLICE_LENGTH as i64) << 4;

type DecaySlice = Arc<[f64; DECAY_SLICE_LENGTH]>;

fn make_decay_slice(mean_lifetime: u32) -> DecaySlice {
    let decay_per_sec = (-1.0 / mean_lifetime as f64).exp();
    let mut slice = [0.0; DECAY_SLICE_LENGTH];
    for (i, entry) in slice.iter_mut().enumerate() {
        *entry = decay_per_sec.powi(i as i32 + 1);
    }
    Arc::new(slice)
}

/// Lazy, thread-safe memoization of decay tables keyed by mean-lifetime.
/// Owned by whoever needs decay scoring; a process-wide default preseeded
/// with the common lifetimes is available as [`default_decay_cache`].
#[derive(Debug, Default)]
pub struct DecayCache {
    slices: Mutex<HashMap<u32, DecaySlice>>,
}

impl DecayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache preseeded with the lifetimes the audit subsystem uses.
    pub fn with_common_lifetimes() -> Self {
        let cache = Self::new();
        {
            let mut slices = cache.slices.lock();
            for mlt in [15u32, 60, 900] {
                slices.insert(mlt, make_decay_slice(mlt));
            }
        }
        cache
    }

    fn slice(&self, mean_lifetime: u32) -> DecaySlice {
        let mut slices = self.slices.lock();
        slices
            .entry(mean_lifetime)
            .or_insert_with(|| make_decay_slice(mean_lifetime))
            .clone()
    }
}

static DEFAULT_DECAY_CACHE: Lazy<Arc<DecayCache>> =
    Lazy::new(|| Arc::new(DecayCache::with_common_lifetimes()));

/// Shared default cache instance.
pub fn default_decay_cache() -> Arc<DecayCache> {
    DEFAULT_DECAY_CACHE.clone()
}

/// An exponentially decayed accumulator.
///
/// Not internally synchronized; callers that share one across tasks must
/// lock around it (the peer auditor does).
#[derive(Debug)]
pub struct ExponentDecayValue {
    slice: DecaySlice,
    value: f64,
    last_time_sec: i64,
}

impl ExponentDecayValue {
    pub fn new(cache: &DecayCache, mean_lifetime: u32) -> Self {
        ExponentDecayValue {
            slice: cache.slice(mean_lifetime),
            value: 0.0,
            last_time_sec: 0,
        }
    }

    /// Decay to `time_sec` (unix seconds), then add `n`.
    pub fn add_value(&mut self, time_sec: i64, n: f64) {
        let mut passed = time_sec - self.last_time_sec;
        while passed > 0 {
            if passed > TRUNCATE_SECS {
                self.value = 0.0;
                break;
            } else if passed > DECAY_SLICE_LENGTH as i64 {
                self.value *= self.slice[DECAY_SLICE_LENGTH - 1];
                passed -= DECAY_SLICE_LENGTH as i64;
            } else {
                self.value *= self.slice[(passed - 1) as usize];
                break;
            }
        }
        self.last_time_sec = time_sec;
        self.value += n;
    }

    /// Project the value to `time_sec`, recording the projection so later
    /// reads at the same instant are idempotent. Full table lengths are
    /// applied through `powi` so projection over an arbitrary gap stays
    /// O(1); a fresh accumulator carries epoch zero as its last time.
    pub fn value(&mut self, time_sec: i64) -> f64 {
        let passed = time_sec - self.last_time_sec;
        if passed > 0 {
            let chunks = (passed - 1) / DECAY_SLICE_LENGTH as i64;
            let rem = (passed - chunks * DECAY_SLICE_LENGTH as i64) as usize;
            if chunks > 0 {
                let chunks = chunks.min(i32::MAX as i64) as i32;
                self.value *= self.slice[DECAY_SLICE_LENGTH - 1].powi(chunks);
            }
            self.value *= self.slice[rem - 1];
            self.last_time_sec = time_sec;
        }
        self.value
    }

    /// Current value without time correction. Diagnostic only.
    pub fn raw_value(&self) -> f64 {
        self.value
    }
}
