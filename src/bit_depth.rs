//! Bit-depth configuration for operand requantization.
//!
//! Inputs are always 8-bit; an operand may be requantized to fewer bits
//! during packing, trading accuracy for kernel throughput. The requantizing
//! operation is `dst = (src * maxval + rounding_offset) / 255` where
//! `maxval = 2^bits - 1` and the intermediate values are 16-bit, so no
//! overflow occurs. The rounding offset in `[0..254]` is determined by the
//! [`RoundingMode`].

/// A specific bit depth to requantize an operand (LHS or RHS) to.
///
/// `bits == 8` means no requantization, since input data is already 8-bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitDepth {
    bits: u32,
}

impl BitDepth {
    pub const fn new(bits: u32) -> BitDepth {
        assert!(bits >= 1 && bits <= 8, "bad bit depth");
        BitDepth { bits }
    }

    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Largest representable value at this depth.
    pub const fn max_value(&self) -> u32 {
        (1 << self.bits) - 1
    }
}

/// How to round when requantizing an operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    /// No rounding, do nothing. Use with bit depth 8.
    Exact,
    /// rounding_offset = 127.
    Nearest,
    /// rounding_offset from an 8-bit Xorshift PRNG.
    ProbabilisticXorshift,
    /// rounding_offset from an 8-bit add/mod low-discrepancy sequence.
    ProbabilisticAddmod,
}

/// The accumulation depth at which packing switches from round-to-nearest to
/// probabilistic rounding.
///
/// Round-to-nearest gives better results for small accumulation depths while
/// some flavor of probabilistic rounding wins for larger ones. This value
/// was determined empirically at 7-bit/5-bit on an image-classification
/// workload and sits in the middle of a plateau of good values; it has not
/// been re-measured for other bit-depth combinations.
pub const ROUNDING_MODE_SIZE_THRESHOLD: usize = 384;

/// A heuristic for choosing a rounding mode from the accumulation depth.
#[derive(Copy, Clone, Debug)]
pub struct RoundingStrategy {
    pub for_small_sizes: RoundingMode,
    pub for_large_sizes: RoundingMode,
    pub size_threshold: usize,
}

impl RoundingStrategy {
    pub fn mode_for_depth(&self, depth: usize) -> RoundingMode {
        if depth < self.size_threshold {
            self.for_small_sizes
        } else {
            self.for_large_sizes
        }
    }
}

/// Bit depths and rounding strategy for both operands of one GEMM call.
#[derive(Copy, Clone, Debug)]
pub struct BitDepthParams {
    pub lhs: BitDepth,
    pub rhs: BitDepth,
    pub rounding: RoundingStrategy,
}

impl BitDepthParams {
    /// Full 8-bit operands on both sides; packing is an exact copy.
    pub const L8R8: BitDepthParams = BitDepthParams {
        lhs: BitDepth::new(8),
        rhs: BitDepth::new(8),
        rounding: RoundingStrategy {
            for_small_sizes: RoundingMode::Exact,
            for_large_sizes: RoundingMode::Exact,
            size_threshold: 0,
        },
    };

    /// 7-bit LHS and 5-bit RHS with the default rounding strategy.
    pub const L7R5: BitDepthParams = BitDepthParams {
        lhs: BitDepth::new(7),
        rhs: BitDepth::new(5),
        rounding: RoundingStrategy {
            for_small_sizes: RoundingMode::Nearest,
            for_large_sizes: RoundingMode::ProbabilisticAddmod,
            size_threshold: ROUNDING_MODE_SIZE_THRESHOLD,
        },
    };
}

/// Bit-depth selection for the legacy scalar entry points.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitDepthSetting {
    /// 8-bit operands on both sides.
    A8B8,
    /// 5-bit activations, 7-bit weights.
    A5B7,
}

impl BitDepthSetting {
    pub fn params(self) -> BitDepthParams {
        match self {
            BitDepthSetting::A8B8 => BitDepthParams::L8R8,
            BitDepthSetting::A5B7 => BitDepthParams::L7R5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BitDepth, BitDepthParams, RoundingMode, ROUNDING_MODE_SIZE_THRESHOLD};

    #[test]
    fn test_bit_depth_max_value() {
        assert_eq!(BitDepth::new(8).max_value(), 255);
        assert_eq!(BitDepth::new(7).max_value(), 127);
        assert_eq!(BitDepth::new(5).max_value(), 31);
        assert_eq!(BitDepth::new(1).max_value(), 1);
    }

    #[test]
    fn test_rounding_strategy_threshold() {
        let rounding = BitDepthParams::L7R5.rounding;
        assert_eq!(
            rounding.mode_for_depth(ROUNDING_MODE_SIZE_THRESHOLD - 1),
            RoundingMode::Nearest
        );
        assert_eq!(
            rounding.mode_for_depth(ROUNDING_MODE_SIZE_THRESHOLD),
            RoundingMode::ProbabilisticAddmod
        );

        let exact = BitDepthParams::L8R8.rounding;
        assert_eq!(exact.mode_for_depth(1), RoundingMode::Exact);
        assert_eq!(exact.mode_for_depth(10_000), RoundingMode::Exact);
    }
}
