//! Output pipeline stages.
//!
//! An output pipeline is an ordered sequence of stages that transforms a raw
//! 32-bit accumulator into the final destination value: rescaling, bias
//! addition, clamping, activation, saturating cast. Pipelines are tuples of
//! stage values; each stage declares its input and output types, so chaining
//! mismatched stages is a compile-time error. The empty tuple is the empty
//! pipeline, whose output is the raw `i32` accumulator.

use crate::fixedpoint::{saturating_rounding_doubling_high_mul, tanh};

/// Shape of a per-channel parameter vector: one entry per result row or per
/// result column.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VectorShape {
    Row,
    Col,
}

/// A bias to add to the result of a matrix multiplication.
#[derive(Copy, Clone, Debug)]
pub enum BiasVector<'a> {
    /// One entry per result column, broadcast down each column.
    Row(&'a [i32]),
    /// One entry per result row, broadcast along each row.
    Column(&'a [i32]),
}

/// One step of an output pipeline.
pub trait OutputStage {
    type Input;
    type Output;

    /// Transform one value. `row` and `col` are the destination coordinates,
    /// used by stages with per-channel parameters.
    fn eval(&self, input: Self::Input, row: usize, col: usize) -> Self::Output;
}

/// Quantizes down `i32` values to the `u8` scale:
/// `((input + result_offset) * result_mult_int + rounding) >> result_shift`
/// with `rounding = 1 << (result_shift - 1)` when the shift is at least 1.
///
/// The output is still `i32`; it is typically followed by
/// [`OutputStageSaturatingCastToUint8`].
#[derive(Copy, Clone, Debug)]
pub struct OutputStageQuantizeDownInt32ToUint8Scale {
    pub result_offset: i32,
    pub result_mult_int: i32,
    pub result_shift: i32,
}

impl OutputStage for OutputStageQuantizeDownInt32ToUint8Scale {
    type Input = i32;
    type Output = i32;

    fn eval(&self, input: i32, _row: usize, _col: usize) -> i32 {
        let rounding = if self.result_shift < 1 {
            0
        } else {
            1 << (self.result_shift - 1)
        };
        ((input + self.result_offset) * self.result_mult_int + rounding) >> self.result_shift
    }
}

/// Per-channel variant of [`OutputStageQuantizeDownInt32ToUint8Scale`]: the
/// offset and multiplier vary by result row or column.
#[derive(Copy, Clone, Debug)]
pub struct OutputStageQuantizeDownInt32ToUint8ScalePc<'a> {
    pub shape: VectorShape,
    pub result_offset: &'a [i32],
    pub result_mult_int: &'a [i32],
    pub result_shift: i32,
}

impl OutputStage for OutputStageQuantizeDownInt32ToUint8ScalePc<'_> {
    type Input = i32;
    type Output = i32;

    fn eval(&self, input: i32, row: usize, col: usize) -> i32 {
        let index = match self.shape {
            VectorShape::Row => col,
            VectorShape::Col => row,
        };
        let rounding = if self.result_shift < 1 {
            0
        } else {
            1 << (self.result_shift - 1)
        };
        ((input + self.result_offset[index]) * self.result_mult_int[index] + rounding)
            >> self.result_shift
    }
}

/// Clamps `i32` values to `[0, 255]` and casts to `u8`.
#[derive(Copy, Clone, Debug, Default)]
pub struct OutputStageSaturatingCastToUint8;

impl OutputStage for OutputStageSaturatingCastToUint8 {
    type Input = i32;
    type Output = u8;

    fn eval(&self, input: i32, _row: usize, _col: usize) -> u8 {
        input.clamp(0, 255) as u8
    }
}

/// Adds a bias vector, broadcast across the other dimension.
#[derive(Copy, Clone, Debug)]
pub struct OutputStageBiasAddition<'a> {
    pub bias_vector: BiasVector<'a>,
}

impl OutputStage for OutputStageBiasAddition<'_> {
    type Input = i32;
    type Output = i32;

    fn eval(&self, input: i32, row: usize, col: usize) -> i32 {
        match self.bias_vector {
            BiasVector::Row(bias) => input + bias[col],
            BiasVector::Column(bias) => input + bias[row],
        }
    }
}

/// Clamps values between `min` and `max`. Usable as a rectified-linear
/// activation.
#[derive(Copy, Clone, Debug)]
pub struct OutputStageClamp {
    pub min: i32,
    pub max: i32,
}

impl OutputStage for OutputStageClamp {
    type Input = i32;
    type Output = i32;

    fn eval(&self, input: i32, _row: usize, _col: usize) -> i32 {
        input.clamp(self.min, self.max)
    }
}

/// Fixed-point hyperbolic tangent activation.
///
/// Interprets the input on an integer scale where `real_zero_as_int32`
/// represents 0.0 and `real_amplitude_as_int32` represents 1.0, and outputs
/// `zero + amplitude * tanh((input - zero) / amplitude)` on the same scale,
/// using only integer arithmetic per element.
#[derive(Copy, Clone, Debug)]
pub struct OutputStageTanh {
    real_zero_as_int32: i32,
    input_cutoff_min: i32,
    input_cutoff_max: i32,
    output_min: i32,
    output_max: i32,
    inverse_amplitude_normalized: i32,
    inverse_amplitude_neg_exponent: i32,
    amplitude_normalized: i32,
    amplitude_exponent: i32,
}

impl OutputStageTanh {
    /// Build a tanh stage. The normalized amplitude representations are
    /// precomputed here, once per pipeline, so the per-element path is pure
    /// integer math.
    pub fn new(real_zero_as_int32: i32, real_amplitude_as_int32: i32) -> OutputStageTanh {
        assert!(real_amplitude_as_int32 > 0 && real_amplitude_as_int32 <= 1 << 28);

        // Beyond 8 amplitudes from the center, tanh saturates to +-1 at
        // 32-bit precision.
        let input_cutoff_min = real_zero_as_int32 - 8 * real_amplitude_as_int32;
        let input_cutoff_max = real_zero_as_int32 + 8 * real_amplitude_as_int32;
        let output_min = real_zero_as_int32 - real_amplitude_as_int32;
        let output_max = real_zero_as_int32 + real_amplitude_as_int32;

        let mut inverse_amplitude_normalized_double = 1.0 / real_amplitude_as_int32 as f64;
        let mut inverse_amplitude_neg_exponent = 0;
        while inverse_amplitude_normalized_double < 0.5 {
            inverse_amplitude_normalized_double *= 2.0;
            inverse_amplitude_neg_exponent += 1;
        }
        let inverse_amplitude_normalized = to_q31(inverse_amplitude_normalized_double);

        let mut amplitude_normalized_double = real_amplitude_as_int32 as f64;
        let mut amplitude_exponent = 0;
        while amplitude_normalized_double >= 1.0 {
            amplitude_normalized_double *= 0.5;
            amplitude_exponent += 1;
        }
        let amplitude_normalized = to_q31(amplitude_normalized_double);

        OutputStageTanh {
            real_zero_as_int32,
            input_cutoff_min,
            input_cutoff_max,
            output_min,
            output_max,
            inverse_amplitude_normalized,
            inverse_amplitude_neg_exponent,
            amplitude_normalized,
            amplitude_exponent,
        }
    }
}

/// Round a real value in `[-1, 1)` to its Q0.31 representation.
fn to_q31(x: f64) -> i32 {
    let scaled = (x * (1i64 << 31) as f64).round();
    scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

impl OutputStage for OutputStageTanh {
    type Input = i32;
    type Output = i32;

    fn eval(&self, input: i32, _row: usize, _col: usize) -> i32 {
        if input <= self.input_cutoff_min {
            return self.output_min;
        }
        if input >= self.input_cutoff_max {
            return self.output_max;
        }

        // Normalize the input onto a 3-integer-bit fixed-point scale where
        // one amplitude is 1.0.
        let input_centered = input - self.real_zero_as_int32;
        let mut fixedpoint_input =
            saturating_rounding_doubling_high_mul(input_centered, self.inverse_amplitude_normalized);
        fixedpoint_input *= 1 << (28 - self.inverse_amplitude_neg_exponent);

        let fixedpoint_output =
            saturating_rounding_doubling_high_mul(tanh(fixedpoint_input, 3), self.amplitude_normalized);

        // Scale back from Q0.31 to the integer output scale. The quotient
        // form truncates toward zero for negative values, unlike a shift.
        self.real_zero_as_int32 + fixedpoint_output / (1 << (31 - self.amplitude_exponent))
    }
}

/// A full output pipeline: an ordered chain of stages fixed for the
/// duration of one GEMM call. The first stage must accept the unpacker's
/// `i32` accumulators; the last stage's output is what lands in the
/// destination matrix.
pub trait OutputPipeline<InputType>: Sync {
    type Output;

    fn eval(&self, input: InputType, row: usize, col: usize) -> Self::Output;
}

impl<I> OutputPipeline<I> for () {
    type Output = I;

    fn eval(&self, input: I, _row: usize, _col: usize) -> I {
        input
    }
}

impl<I, S0> OutputPipeline<I> for (S0,)
where
    S0: OutputStage<Input = I> + Sync,
{
    type Output = S0::Output;

    fn eval(&self, input: I, row: usize, col: usize) -> Self::Output {
        self.0.eval(input, row, col)
    }
}

impl<I, S0, S1> OutputPipeline<I> for (S0, S1)
where
    S0: OutputStage<Input = I> + Sync,
    S1: OutputStage<Input = S0::Output> + Sync,
{
    type Output = S1::Output;

    fn eval(&self, input: I, row: usize, col: usize) -> Self::Output {
        let value = self.0.eval(input, row, col);
        self.1.eval(value, row, col)
    }
}

impl<I, S0, S1, S2> OutputPipeline<I> for (S0, S1, S2)
where
    S0: OutputStage<Input = I> + Sync,
    S1: OutputStage<Input = S0::Output> + Sync,
    S2: OutputStage<Input = S1::Output> + Sync,
{
    type Output = S2::Output;

    fn eval(&self, input: I, row: usize, col: usize) -> Self::Output {
        let value = self.0.eval(input, row, col);
        let value = self.1.eval(value, row, col);
        self.2.eval(value, row, col)
    }
}

impl<I, S0, S1, S2, S3> OutputPipeline<I> for (S0, S1, S2, S3)
where
    S0: OutputStage<Input = I> + Sync,
    S1: OutputStage<Input = S0::Output> + Sync,
    S2: OutputStage<Input = S1::Output> + Sync,
    S3: OutputStage<Input = S2::Output> + Sync,
{
    type Output = S3::Output;

    fn eval(&self, input: I, row: usize, col: usize) -> Self::Output {
        let value = self.0.eval(input, row, col);
        let value = self.1.eval(value, row, col);
        let value = self.2.eval(value, row, col);
        self.3.eval(value, row, col)
    }
}

impl<I, S0, S1, S2, S3, S4> OutputPipeline<I> for (S0, S1, S2, S3, S4)
where
    S0: OutputStage<Input = I> + Sync,
    S1: OutputStage<Input = S0::Output> + Sync,
    S2: OutputStage<Input = S1::Output> + Sync,
    S3: OutputStage<Input = S2::Output> + Sync,
    S4: OutputStage<Input = S3::Output> + Sync,
{
    type Output = S4::Output;

    fn eval(&self, input: I, row: usize, col: usize) -> Self::Output {
        let value = self.0.eval(input, row, col);
        let value = self.1.eval(value, row, col);
        let value = self.2.eval(value, row, col);
        let value = self.3.eval(value, row, col);
        self.4.eval(value, row, col)
    }
}

/// The standard two-stage pipeline: quantize down with a scalar
/// offset/multiplier/shift, then saturating-cast to `u8`.
pub fn make_standard_output_pipeline(
    result_offset: i32,
    result_mult_int: i32,
    result_shift: i32,
) -> (
    OutputStageQuantizeDownInt32ToUint8Scale,
    OutputStageSaturatingCastToUint8,
) {
    (
        OutputStageQuantizeDownInt32ToUint8Scale {
            result_offset,
            result_mult_int,
            result_shift,
        },
        OutputStageSaturatingCastToUint8,
    )
}
