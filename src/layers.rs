// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feed-forward sublayers shared by the block variants and the patch
//! embeddings.
//!
//! - [`FeedForward`]: gated (SwiGLU) MLP used inside each block,
//!   `down(silu(gate(x)) * up(x))`.
//! - [`ResidualBlock`]: two-layer MLP with a linear residual path, used as
//!   the input and output patch embedding.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::StackConfig;
use crate::error::Result;

// ---------------------------------------------------------------------------
// FeedForward
// ---------------------------------------------------------------------------

/// Gated feed-forward sublayer: `down(silu(gate(x)) * up(x))`.
pub struct FeedForward {
    /// Gate projection: `[embedding_dim, ffn_dim]`.
    gate_proj: Linear,
    /// Up projection: `[embedding_dim, ffn_dim]`.
    up_proj: Linear,
    /// Down projection: `[ffn_dim, embedding_dim]`.
    down_proj: Linear,
}

impl FeedForward {
    /// Load feed-forward weights from a [`VarBuilder`].
    ///
    /// Weight names: `gate_proj`, `up_proj`, `down_proj`.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &StackConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let embed = config.embedding_dim;
        let ffn = config.ffn_dim();
        let bias = config.use_bias;

        Ok(Self {
            gate_proj: load_linear(embed, ffn, bias, vb.pp("gate_proj"))?,
            up_proj: load_linear(embed, ffn, bias, vb.pp("up_proj"))?,
            down_proj: load_linear(ffn, embed, bias, vb.pp("down_proj"))?,
        })
    }

    /// Run the feed-forward sublayer.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embedding_dim]`
    /// - returns: `[batch, seq, embedding_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// on tensor operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

// ---------------------------------------------------------------------------
// ResidualBlock
// ---------------------------------------------------------------------------

/// Two-layer MLP with a linear residual path.
///
/// `output(relu(hidden(x))) + residual(x)` -- used to embed raw patches
/// into the stack dimension and to project hidden states to quantile
/// predictions.
pub struct ResidualBlock {
    /// First projection: `[in_dim, h_dim]`.
    hidden: Linear,
    /// Second projection: `[h_dim, out_dim]`.
    output: Linear,
    /// Residual projection: `[in_dim, out_dim]`.
    residual: Linear,
}

impl ResidualBlock {
    /// Load residual block weights from a [`VarBuilder`].
    ///
    /// Weight names: `hidden`, `output`, `residual` (all with bias).
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(in_dim: usize, h_dim: usize, out_dim: usize, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            hidden: candle_nn::linear(in_dim, h_dim, vb.pp("hidden"))?,
            output: candle_nn::linear(h_dim, out_dim, vb.pp("output"))?,
            residual: candle_nn::linear(in_dim, out_dim, vb.pp("residual"))?,
        })
    }

    /// Run the residual block.
    ///
    /// # Shapes
    /// - `x`: `[..., in_dim]`
    /// - returns: `[..., out_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// on tensor operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.hidden.forward(x)?.relu()?;
        Ok((self.output.forward(&h)? + self.residual.forward(x)?)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load a linear layer with or without bias.
#[allow(clippy::needless_pass_by_value)] // VarBuilder convention
pub(crate) fn load_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder<'_>,
) -> Result<Linear> {
    if bias {
        Ok(candle_nn::linear(in_dim, out_dim, vb)?)
    } else {
        Ok(candle_nn::linear_no_bias(in_dim, out_dim, vb)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn residual_block_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = ResidualBlock::load(8, 16, 4, vb).unwrap();

        let x = Tensor::zeros((2, 3, 8), DType::F32, &device).unwrap();
        let out = block.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
    }

    #[test]
    fn feed_forward_shape() {
        let device = Device::Cpu;
        let config = StackConfig {
            num_blocks: 1,
            embedding_dim: 16,
            num_heads: 2,
            norm_eps: 1e-6,
            use_bias: false,
            ffn_proj_factor: 2.0,
            recurrent_at: vec![],
            all_recurrent: true,
            add_out_norm: true,
        };
        let vb = VarBuilder::zeros(DType::F32, &device);
        let ffn = FeedForward::load(&config, vb).unwrap();

        let x = Tensor::zeros((1, 4, 16), DType::F32, &device).unwrap();
        let out = ffn.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 4, 16]);
    }
}
