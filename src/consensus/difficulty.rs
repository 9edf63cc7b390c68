//! Compact-target encoding and difficulty retargeting.
//!
//! The header stores its 256-bit proof-of-work target in the 4-byte compact
//! (nBits) form: `target = coefficient * 256^(exponent - 3)`. Every
//! `adjustment_interval` blocks the target is rescaled by the ratio of actual
//! to expected elapsed time, clamped to a factor of four and capped at the
//! chain's pow-limit.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------
// Chain presets
// ----------------------------------------------------------------------

/// Mainnet: retarget every 2016 blocks (~2 weeks at 10-minute blocks).
pub const ADJUSTMENT_INTERVAL: u64 = 2016;
/// Mainnet target block time in seconds.
pub const TARGET_BLOCK_TIME: u64 = 600;
/// Mainnet pow-limit, difficulty 1.
pub const GENESIS_BITS: u32 = 0x1D00_FFFF;

/// Development preset: short interval so retargeting is observable locally.
pub const DEV_ADJUSTMENT_INTERVAL: u64 = 10;
/// Development target block time in seconds.
pub const DEV_TARGET_BLOCK_TIME: u64 = 5;
/// Development pow-limit: large target, blocks mine in milliseconds on a CPU.
pub const DEV_GENESIS_BITS: u32 = 0x1F0F_FFFF;

/// Per-period clamp: the target may move by at most this factor either way.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Difficulty and timing parameters for one chain instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyParams {
    pub adjustment_interval: u64,
    pub target_block_time: u64,
    /// Compact form of the easiest allowed target (pow-limit); also the
    /// genesis difficulty.
    pub genesis_bits: u32,
}

impl DifficultyParams {
    pub fn production() -> Self {
        DifficultyParams {
            adjustment_interval: ADJUSTMENT_INTERVAL,
            target_block_time: TARGET_BLOCK_TIME,
            genesis_bits: GENESIS_BITS,
        }
    }

    pub fn development() -> Self {
        DifficultyParams {
            adjustment_interval: DEV_ADJUSTMENT_INTERVAL,
            target_block_time: DEV_TARGET_BLOCK_TIME,
            genesis_bits: DEV_GENESIS_BITS,
        }
    }

    /// Expected wall-clock seconds for one adjustment interval.
    pub fn target_timespan(&self) -> u64 {
        self.adjustment_interval * self.target_block_time
    }
}

// ----------------------------------------------------------------------
// Compact (nBits) conversions
// ----------------------------------------------------------------------

/// Expand compact bits to the full 256-bit target.
///
/// `exponent` is the top byte, `coefficient` the low 23 bits. A set sign bit
/// (0x800000) encodes a negative target, which is treated as zero.
pub fn bits_to_target(bits: u32) -> BigUint {
    if bits & 0x0080_0000 != 0 {
        return BigUint::zero();
    }
    let exponent = (bits >> 24) & 0xFF;
    let coefficient = BigUint::from(bits & 0x007F_FFFF);

    if exponent <= 3 {
        coefficient >> (8 * (3 - exponent))
    } else {
        coefficient << (8 * (exponent - 3))
    }
}

/// Re-encode a target in its shortest compact form.
///
/// If the would-be coefficient has its high bit set the mantissa is shifted
/// down a byte and the exponent bumped, so the sign bit stays clear.
pub fn target_to_bits(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let bytes = target.to_bytes_be();
    let mut exponent = bytes.len() as u32;

    let mut coefficient: u32 = 0;
    for i in 0..3 {
        coefficient <<= 8;
        if i < bytes.len() {
            coefficient |= bytes[i] as u32;
        }
    }

    if coefficient & 0x0080_0000 != 0 {
        coefficient >>= 8;
        exponent += 1;
    }

    (exponent << 24) | (coefficient & 0x007F_FFFF)
}

/// Human-readable difficulty: the ratio of the mainnet difficulty-1 target
/// to `target`.
pub fn difficulty(target: &BigUint) -> f64 {
    if target.is_zero() {
        return f64::INFINITY;
    }
    let max_target = bits_to_target(GENESIS_BITS);
    let scale = BigUint::from(1u64 << 32);
    // Fixed-point division keeps precision for targets near the pow-limit.
    let ratio = (max_target * &scale) / target;
    ratio.to_f64().unwrap_or(f64::INFINITY) / (1u64 << 32) as f64
}

/// Expected work to find one block at this target: `2^256 / (target + 1)`.
/// Summed along a chain this is the fork-choice metric.
pub fn block_work(bits: u32) -> BigUint {
    let target = bits_to_target(bits);
    (BigUint::one() << 256u32) / (target + BigUint::one())
}

// ----------------------------------------------------------------------
// Retargeting
// ----------------------------------------------------------------------

/// Whether a block at `height` starts a new difficulty period.
/// The genesis block is never an adjustment point.
pub fn should_adjust(height: u64, interval: u64) -> bool {
    height > 0 && height % interval == 0
}

/// Compute the compact bits for the period starting after a window of
/// `timestamps` (oldest first) mined at `current_bits`.
///
/// The elapsed time is clamped to `[timespan/4, timespan*4]`, the target is
/// rescaled proportionally, capped at the pow-limit and floored at 1.
pub fn calculate_next_bits(
    timestamps: &[u32],
    current_bits: u32,
    params: &DifficultyParams,
) -> u32 {
    assert!(
        timestamps.len() >= 2,
        "retarget needs at least two timestamps, got {}",
        timestamps.len()
    );

    let first = timestamps[0] as i64;
    let last = timestamps[timestamps.len() - 1] as i64;
    let timespan = params.target_timespan();

    let mut elapsed = (last - first).max(0) as u64;
    let min_timespan = timespan / MAX_ADJUSTMENT_FACTOR;
    let max_timespan = timespan * MAX_ADJUSTMENT_FACTOR;
    elapsed = elapsed.clamp(min_timespan, max_timespan);

    let old_target = bits_to_target(current_bits);
    let mut new_target = (old_target * BigUint::from(elapsed)) / BigUint::from(timespan);

    let pow_limit = bits_to_target(params.genesis_bits);
    if new_target > pow_limit {
        new_target = pow_limit;
    }
    if new_target.is_zero() {
        new_target = BigUint::one();
    }

    target_to_bits(&new_target)
}
