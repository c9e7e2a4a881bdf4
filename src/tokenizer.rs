// SPDX-License-Identifier: MIT OR Apache-2.0

//! Patch tokenizer: scaling and patching of raw context series.
//!
//! A context series is left-padded with NaN to a multiple of the patch
//! size, scaled by its mean absolute value (NaN-aware), and reshaped into
//! non-overlapping patches.  Missing observations stay NaN in the tokens;
//! a parallel validity mask marks them for the model.  The scale is
//! returned as [`TokenizerState`] so predictions can be mapped back to the
//! original magnitude.

use candle_core::Tensor;

use crate::error::{ForecastError, Result};

// ---------------------------------------------------------------------------
// TokenizerState
// ---------------------------------------------------------------------------

/// Per-series scaling state captured during tokenization.
#[derive(Debug, Clone)]
pub struct TokenizerState {
    /// Mean absolute scale: `[batch, 1]`, strictly positive.
    pub scale: Tensor,
}

// ---------------------------------------------------------------------------
// PatchTokenizer
// ---------------------------------------------------------------------------

/// Splits context series into fixed-size patches with NaN-aware scaling.
#[derive(Debug, Clone, Copy)]
pub struct PatchTokenizer {
    /// Number of observations per patch.
    patch_size: usize,
}

impl PatchTokenizer {
    /// Create a tokenizer for the given patch size.
    #[must_use]
    pub fn new(patch_size: usize) -> Self {
        Self { patch_size }
    }

    /// Number of observations per patch.
    #[must_use]
    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Tokenize a batch of context series.
    ///
    /// The series is left-padded with NaN to a whole number of patches,
    /// so the most recent observations always sit at the end of the last
    /// patch.  Scaling divides by the mean absolute value of the observed
    /// entries; a series with no usable magnitude (all-NaN, or all zeros)
    /// falls back to a scale of one.
    ///
    /// # Shapes
    /// - `context`: `[batch, len]`, NaN marks missing observations
    /// - returns: `(tokens, mask, state)` with `tokens` and `mask` at
    ///   `[batch, num_patches, patch_size]`; `mask` is `1.0` where the
    ///   observation is present
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Rollout`] on an empty context and
    /// [`ForecastError::Model`] on tensor operation failures.
    pub fn context_input_transform(
        &self,
        context: &Tensor,
    ) -> Result<(Tensor, Tensor, TokenizerState)> {
        let (batch, len) = context.dims2()?;
        if len == 0 {
            return Err(ForecastError::Rollout(
                "context series is empty".to_string(),
            ));
        }

        let pad = (self.patch_size - len % self.patch_size) % self.patch_size;
        let padded = if pad > 0 {
            let nan = Tensor::full(f32::NAN, (batch, pad), context.device())?
                .to_dtype(context.dtype())?;
            Tensor::cat(&[&nan, context], 1)?
        } else {
            context.clone()
        };
        let padded_len = len + pad;

        // NaN is the only value that differs from itself.
        let observed = padded.eq(&padded)?;
        let mask = observed.to_dtype(padded.dtype())?;
        let zeros = padded.zeros_like()?;
        let filled = observed.where_cond(&padded, &zeros)?;

        let count = mask.sum_keepdim(1)?.maximum(1.0_f64)?;
        let scale = (filled.abs()?.sum_keepdim(1)? / count)?;
        // Degenerate series (all-NaN or all-zero) keep their values as-is.
        let usable = scale.gt(0.0_f64)?;
        let scale = usable.where_cond(&scale, &scale.ones_like()?)?;

        let num_patches = padded_len / self.patch_size;
        let tokens = padded
            .broadcast_div(&scale)?
            .reshape((batch, num_patches, self.patch_size))?;
        let mask = mask.reshape((batch, num_patches, self.patch_size))?;

        Ok((tokens, mask, TokenizerState { scale }))
    }

    /// Map scaled quantile predictions back to the original magnitude.
    ///
    /// # Shapes
    /// - `predictions`: `[batch, num_quantiles, num_patches, patch_size]`
    /// - returns: same shape, multiplied by the per-series scale
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`] on tensor operation failures.
    pub fn output_transform(
        &self,
        predictions: &Tensor,
        state: &TokenizerState,
    ) -> Result<Tensor> {
        let batch = predictions.dim(0)?;
        let scale = state.scale.reshape((batch, 1, 1, 1))?;
        Ok(predictions.broadcast_mul(&scale)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};

    #[test]
    fn pads_to_whole_patches_on_the_left() {
        let device = Device::Cpu;
        let tok = PatchTokenizer::new(4);
        let context = Tensor::new(&[[1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0]], &device).unwrap();

        let (tokens, mask, _) = tok.context_input_transform(&context).unwrap();
        assert_eq!(tokens.dims(), &[1, 2, 4]);

        // Two pad slots at the front are missing, the rest observed.
        let m: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(m, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);

        let t: Vec<f32> = tokens.flatten_all().unwrap().to_vec1().unwrap();
        assert!(t[0].is_nan());
        assert!(t[1].is_nan());
        assert!(t[2..].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn scale_is_mean_absolute_of_observed() {
        let device = Device::Cpu;
        let tok = PatchTokenizer::new(2);
        // Observed values: -2, 4 -> mean |.| = 3; NaN excluded from both sums.
        let context = Tensor::new(&[[f32::NAN, -2.0_f32, 4.0, f32::NAN]], &device).unwrap();

        let (tokens, _, state) = tok.context_input_transform(&context).unwrap();
        let s: Vec<f32> = state.scale.flatten_all().unwrap().to_vec1().unwrap();
        assert!((s[0] - 3.0).abs() < 1e-6);

        let t: Vec<f32> = tokens.flatten_all().unwrap().to_vec1().unwrap();
        assert!((t[1] - (-2.0 / 3.0)).abs() < 1e-6);
        assert!((t[2] - (4.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn degenerate_series_scale_falls_back_to_one() {
        let device = Device::Cpu;
        let tok = PatchTokenizer::new(2);

        let all_nan = Tensor::full(f32::NAN, (1, 4), &device).unwrap();
        let (_, _, state) = tok.context_input_transform(&all_nan).unwrap();
        let s: Vec<f32> = state.scale.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(s, vec![1.0]);

        let all_zero = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let (_, _, state) = tok.context_input_transform(&all_zero).unwrap();
        let s: Vec<f32> = state.scale.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(s, vec![1.0]);
    }

    #[test]
    fn output_transform_undoes_scaling() {
        let device = Device::Cpu;
        let tok = PatchTokenizer::new(2);
        let context = Tensor::new(&[[2.0_f32, 4.0], [10.0, 30.0]], &device).unwrap();
        let (_, _, state) = tok.context_input_transform(&context).unwrap();

        let preds = Tensor::ones((2, 3, 1, 2), DType::F32, &device).unwrap();
        let out = tok.output_transform(&preds, &state).unwrap();
        let v: Vec<f32> = out.i((1, 0, 0, ..)).unwrap().to_vec1().unwrap();
        // Second series scale is (10+30)/2 = 20.
        assert!((v[0] - 20.0).abs() < 1e-5);
    }

    #[test]
    fn empty_context_is_rejected() {
        let device = Device::Cpu;
        let tok = PatchTokenizer::new(4);
        let context = Tensor::zeros((1, 0), DType::F32, &device).unwrap();
        assert!(tok.context_input_transform(&context).is_err());
    }
}
