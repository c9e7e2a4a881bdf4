// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization layers for the block stack.
//!
//! The stack uses RMS normalization before each sublayer and optionally on
//! its output, plus a manual per-head `GroupNorm` applied to the cell
//! outputs.  Both are implemented from scratch because the group-norm
//! parameters live alongside the cell weights and the RMS norm needs an
//! optional bias controlled by configuration.

use candle_core::{D, Tensor};
use candle_nn::VarBuilder;

use crate::error::Result;

// ---------------------------------------------------------------------------
// RmsNorm
// ---------------------------------------------------------------------------

/// RMS normalization with learned weight and optional bias.
///
/// `x * weight / sqrt(mean(x^2) + eps) (+ bias)`
pub struct RmsNorm {
    /// Learned scale parameter.
    weight: Tensor,
    /// Learned bias parameter, present when `use_bias` is configured.
    bias: Option<Tensor>,
    /// Epsilon for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Load an `RmsNorm` from weights.
    ///
    /// # Shapes
    /// - `weight`: `[size]`
    /// - `bias`: `[size]` (only when `use_bias`)
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// if weights cannot be loaded.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(size: usize, eps: f64, use_bias: bool, vb: VarBuilder<'_>) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        let bias = if use_bias {
            Some(vb.get(size, "bias")?)
        } else {
            None
        };
        Ok(Self { weight, bias, eps })
    }

    /// Apply RMS normalization.
    ///
    /// # Shapes
    /// - `x`: `[..., size]` -- input tensor (any leading dimensions)
    /// - returns: `[..., size]` -- same shape as input
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// on tensor operation failure.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let ms = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x.broadcast_div(&(ms + self.eps)?.sqrt()?)?;
        let out = x_normed.broadcast_mul(&self.weight)?;
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(bias)?),
            None => Ok(out),
        }
    }
}

// ---------------------------------------------------------------------------
// GroupNorm (manual)
// ---------------------------------------------------------------------------

/// Normalize each head's channel slice to zero mean and unit variance.
///
/// The cell and memory layers stack their per-head outputs into a flat
/// channel axis; this treats every `head_dim`-wide slice as one group and
/// standardizes it independently before the channel-wise affine.  The
/// group-norm parameters live next to the cell weights, so this stays a
/// free function instead of a loaded layer.
///
/// # Shapes
/// - `x`: `[rows, channels]` with `channels = num_groups * group width`
/// - `weight`: `[channels]`
/// - `bias`: `[channels]`, present when `use_bias` is configured
/// - returns: `[rows, channels]`
///
/// # Errors
///
/// Returns [`ForecastError::Model`](crate::error::ForecastError::Model) on
/// tensor operation failure.
pub fn group_norm(
    x: &Tensor,
    num_groups: usize,
    weight: &Tensor,
    bias: Option<&Tensor>,
    eps: f64,
) -> Result<Tensor> {
    let (rows, channels) = x.dims2()?;
    let width = channels / num_groups;

    // Standardize per group, then flatten the groups back out.
    let grouped = x.reshape((rows, num_groups, width))?;
    let centered = grouped.broadcast_sub(&grouped.mean_keepdim(2)?)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    let normed = centered
        .broadcast_div(&(var + eps)?.sqrt()?)?
        .reshape((rows, channels))?;

    let out = normed.broadcast_mul(&weight.unsqueeze(0)?)?;
    match bias {
        Some(bias) => Ok(out.broadcast_add(&bias.unsqueeze(0)?)?),
        None => Ok(out),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
