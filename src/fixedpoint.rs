//! Scalar fixed-point arithmetic used by the tanh output stage.
//!
//! Values are `i32` raw representations of fixed-point numbers with a given
//! number of integer bits; a value with `n` integer bits has `31 - n`
//! fractional bits. Multiplication is always the "doubling high multiply"
//! (the most significant bits of the product), which is what distinguishes
//! fixed-point math here from the plain integer arithmetic used everywhere
//! else in the engine. The integer-bit counts are tracked explicitly at each
//! call site.

/// The same computation as the ARMv7 NEON VQRDMULH instruction: a saturating
/// doubling multiply returning the high 32 bits, with rounding.
pub(crate) fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge = if ab >= 0 {
        1i64 << 30
    } else {
        1 - (1i64 << 30)
    };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// Average of `a` and `b`, rounding away from zero.
pub(crate) fn rounding_half_sum(a: i32, b: i32) -> i32 {
    let sum = a as i64 + b as i64;
    let sign = if sum >= 0 { 1 } else { -1 };
    ((sum + sign) / 2) as i32
}

/// Multiply by `2^exponent` with saturation for positive exponents and
/// rounding for negative ones.
pub(crate) fn saturating_rounding_multiply_by_pot(x: i32, exponent: i32) -> i32 {
    if exponent == 0 {
        x
    } else if exponent > 0 {
        let limit = 1i32 << (31 - exponent);
        if x >= limit {
            i32::MAX
        } else if x <= -limit {
            i32::MIN
        } else {
            x << exponent
        }
    } else {
        let shift = -exponent;
        let mask = 1u32 << (shift - 1);
        let b = ((x.unsigned_abs() & mask) >> (shift - 1)) as i32;
        let nudge = if x >= 0 { b } else { -b };
        x / (1 << shift) + nudge
    }
}

// Q0.31 constants, each annotated with the real value it represents.
const CONSTANT_EXP_MINUS_1_OVER_8: i32 = 1895147668; // exp(-1/8)
const CONSTANT_1_OVER_3: i32 = 715827883; // 1/3
const CONSTANT_48_OVER_17: i32 = 1515870810; // 48/17, 2 integer bits
const CONSTANT_NEG_32_OVER_17: i32 = -1010580540; // -32/17, 2 integer bits

/// `exp(a)` for `a` in `[-1/4, 0)`, both in Q0.31, via a Taylor expansion
/// around -1/8.
fn exp_on_interval_between_negative_one_quarter_and_0_excl(a: i32) -> i32 {
    let srdhm = saturating_rounding_doubling_high_mul;
    // Change of variable x = a + 1/8; 1/8 in Q0.31 is 1 << 28.
    let x = a + (1 << 28);
    let x2 = srdhm(x, x);
    let x3 = srdhm(x2, x);
    let x4 = srdhm(x2, x2);
    let x4_over_4 = saturating_rounding_multiply_by_pot(x4, -2);
    let x4_over_24_plus_x3_over_6_plus_x2_over_2 =
        saturating_rounding_multiply_by_pot(srdhm(x4_over_4 + x3, CONSTANT_1_OVER_3) + x2, -1);
    CONSTANT_EXP_MINUS_1_OVER_8
        + srdhm(
            CONSTANT_EXP_MINUS_1_OVER_8,
            x + x4_over_24_plus_x3_over_6_plus_x2_over_2,
        )
}

/// `exp(a)` for `a <= 0` with `integer_bits` integer bits; the result is
/// Q0.31.
///
/// The input is reduced to `[-1/4, 0)` and the quotient handled by a barrel
/// shifter of precomputed `exp(-2^k)` multipliers.
pub(crate) fn exp_on_negative_values(a: i32, integer_bits: i32) -> i32 {
    debug_assert!(a <= 0);
    let srdhm = saturating_rounding_doubling_high_mul;
    let fractional_bits = 31 - integer_bits;
    let one_quarter = 1i32 << (fractional_bits - 2);
    let mask = one_quarter - 1;
    let a_mod_quarter_minus_one_quarter = (a & mask) - one_quarter;

    let mut result = exp_on_interval_between_negative_one_quarter_and_0_excl(
        saturating_rounding_multiply_by_pot(a_mod_quarter_minus_one_quarter, integer_bits),
    );

    let remainder = a_mod_quarter_minus_one_quarter.wrapping_sub(a);
    // exp(-2^k) in Q0.31 for k = -2..4.
    const EXP_MULTIPLIERS: [(i32, i32); 7] = [
        (-2, 1672461947),
        (-1, 1302514674),
        (0, 790015084),
        (1, 290630308),
        (2, 39332535),
        (3, 720401),
        (4, 242),
    ];
    for (exponent, multiplier) in EXP_MULTIPLIERS {
        if integer_bits > exponent {
            let bit = 1i32 << (fractional_bits + exponent);
            if remainder & bit != 0 {
                result = srdhm(result, multiplier);
            }
        }
    }

    if integer_bits > 5 {
        let clamp = -(1i32 << (fractional_bits + 5));
        if a < clamp {
            result = 0;
        }
    }
    if a == 0 {
        // exp(0) = 1, the largest representable Q0.31 value.
        result = i32::MAX;
    }
    result
}

/// `(1 - x) / (1 + x)` for `x` in `[0, 1)`, input and output Q0.31, via
/// three Newton-Raphson iterations on the reciprocal of `(1 + x) / 2`.
fn one_minus_x_over_one_plus_x_for_x_in_0_1(a: i32) -> i32 {
    let srdhm = saturating_rounding_doubling_high_mul;
    const F2_ONE: i32 = 1 << 29;

    let half_denominator = rounding_half_sum(a, i32::MAX);
    // x starts as the linear estimate 48/17 - 32/17 * half_denominator, in
    // Q2.29.
    let mut x = CONSTANT_48_OVER_17 + srdhm(half_denominator, CONSTANT_NEG_32_OVER_17);
    for _ in 0..3 {
        let half_denominator_times_x = srdhm(half_denominator, x);
        let one_minus_half_denominator_times_x = F2_ONE - half_denominator_times_x;
        // x * (...) is Q4.27; rescale back to Q2.29.
        x += saturating_rounding_multiply_by_pot(
            srdhm(x, one_minus_half_denominator_times_x),
            2,
        );
    }
    // (x - 1) rescaled from Q2.29 to Q0.31.
    saturating_rounding_multiply_by_pot(x - F2_ONE, 2)
}

/// `-tanh(a)` for `a <= 0` with `integer_bits` integer bits; result Q0.31.
fn neg_tanh_on_negative_values(a: i32, integer_bits: i32) -> i32 {
    // tanh(a) = (exp(2a) - 1) / (exp(2a) + 1); the doubling is an exact
    // reinterpretation with one more integer bit.
    one_minus_x_over_one_plus_x_for_x_in_0_1(exp_on_negative_values(a, integer_bits + 1))
}

/// `tanh(a)` for an input with `integer_bits` integer bits; result Q0.31.
pub(crate) fn tanh(a: i32, integer_bits: i32) -> i32 {
    if a == 0 {
        return 0;
    }
    let n = if a < 0 { a } else { -a };
    let t = neg_tanh_on_negative_values(n, integer_bits);
    if a < 0 {
        -t
    } else {
        t
    }
}

#[cfg(test)]
mod tests {
    use super::{
        exp_on_negative_values, rounding_half_sum, saturating_rounding_doubling_high_mul,
        saturating_rounding_multiply_by_pot, tanh,
    };

    fn q31_to_f64(x: i32) -> f64 {
        x as f64 / (1i64 << 31) as f64
    }

    fn f64_from_fixed(x: i32, integer_bits: i32) -> f64 {
        x as f64 / (1i64 << (31 - integer_bits)) as f64
    }

    fn fixed_from_f64(x: f64, integer_bits: i32) -> i32 {
        (x * (1i64 << (31 - integer_bits)) as f64).round() as i32
    }

    #[test]
    fn test_saturating_rounding_doubling_high_mul() {
        assert_eq!(saturating_rounding_doubling_high_mul(i32::MIN, i32::MIN), i32::MAX);
        assert_eq!(saturating_rounding_doubling_high_mul(0, 12345), 0);
        // 0.5 * 0.5 = 0.25 in Q0.31.
        let half = 1 << 30;
        assert_eq!(saturating_rounding_doubling_high_mul(half, half), 1 << 29);
        // Rounding: (1 * 1) doubled-high is 0 with a nudge below one half.
        assert_eq!(saturating_rounding_doubling_high_mul(1, 1), 0);
    }

    #[test]
    fn test_rounding_half_sum() {
        assert_eq!(rounding_half_sum(3, 4), 4);
        assert_eq!(rounding_half_sum(-3, -4), -4);
        assert_eq!(rounding_half_sum(i32::MAX, i32::MAX), i32::MAX);
    }

    #[test]
    fn test_saturating_rounding_multiply_by_pot() {
        assert_eq!(saturating_rounding_multiply_by_pot(1 << 20, 3), 1 << 23);
        assert_eq!(saturating_rounding_multiply_by_pot(i32::MAX, 1), i32::MAX);
        assert_eq!(saturating_rounding_multiply_by_pot(-(1 << 30), 2), i32::MIN);
        // Negative exponents round to nearest.
        assert_eq!(saturating_rounding_multiply_by_pot(5, -1), 3);
        assert_eq!(saturating_rounding_multiply_by_pot(4, -1), 2);
        assert_eq!(saturating_rounding_multiply_by_pot(-5, -1), -3);
    }

    #[test]
    fn test_exp_on_negative_values_accuracy() {
        const INTEGER_BITS: i32 = 5;
        for i in 0..200 {
            let real = -(i as f64) * 0.1;
            if real < -31.0 {
                break;
            }
            let fixed = fixed_from_f64(real, INTEGER_BITS);
            let result = q31_to_f64(exp_on_negative_values(fixed, INTEGER_BITS));
            let expected = libm::exp(f64_from_fixed(fixed, INTEGER_BITS));
            assert!(
                (result - expected).abs() < 3e-7,
                "exp({}) = {} vs {}",
                real,
                result,
                expected
            );
        }
    }

    #[test]
    fn test_tanh_accuracy() {
        const INTEGER_BITS: i32 = 3;
        for i in -70..=70 {
            let real = i as f64 * 0.1;
            let fixed = fixed_from_f64(real, INTEGER_BITS);
            let result = q31_to_f64(tanh(fixed, INTEGER_BITS));
            let expected = libm::tanh(f64_from_fixed(fixed, INTEGER_BITS));
            assert!(
                (result - expected).abs() < 2e-6,
                "tanh({}) = {} vs {}",
                real,
                result,
                expected
            );
        }
    }

    #[test]
    fn test_tanh_is_odd() {
        for &x in &[1 << 20, 1 << 25, 123456789] {
            assert_eq!(tanh(x, 3), -tanh(-x, 3));
        }
        assert_eq!(tanh(0, 3), 0);
    }
}
