// SPDX-License-Identifier: MIT OR Apache-2.0

//! mLSTM matrix-memory layer.
//!
//! The memory block variant keeps a per-head matrix state instead of the
//! sLSTM's scalar accumulators:
//!
//! ```text
//! m_t = max(f~ + m, i~)                    (stabilizer, per head)
//! i_t = exp(i~ - m_t)    f_t = exp(f~ + m - m_t)
//! C_t = f_t * C + i_t * (k_t (x) v_t)
//! n_t = f_t * n + i_t * k_t
//! h_t = (q_t @ C_t) / max(|n_t . q_t|, 1)
//! ```
//!
//! followed by an output gate, per-head `GroupNorm` and an output
//! projection.  From the stack's perspective only the
//! `(x, state) -> (x, state)` contract matters; the state layout here is
//! internal to this module.

use candle_core::{D, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::StackConfig;
use crate::error::Result;
use crate::norm;

// ---------------------------------------------------------------------------
// MemoryState
// ---------------------------------------------------------------------------

/// Recurrent state of one matrix-memory layer.
#[derive(Debug, Clone)]
pub struct MemoryState {
    /// Matrix memory: `[batch, num_heads, head_dim, head_dim]`.
    pub c: Tensor,
    /// Normalizer: `[batch, num_heads, head_dim]`.
    pub n: Tensor,
    /// Stabilizer: `[batch, num_heads, 1]`.
    pub m: Tensor,
}

// ---------------------------------------------------------------------------
// MatrixMemory
// ---------------------------------------------------------------------------

/// One mLSTM matrix-memory layer.
pub struct MatrixMemory {
    /// Query projection: `[embedding_dim, num_heads * head_dim]`.
    q_proj: Linear,
    /// Key projection.
    k_proj: Linear,
    /// Value projection.
    v_proj: Linear,
    /// Scalar input gate per head: `[embedding_dim, num_heads]` (with bias).
    igate: Linear,
    /// Scalar forget gate per head: `[embedding_dim, num_heads]` (with bias).
    fgate: Linear,
    /// Output gate: `[embedding_dim, num_heads * head_dim]`.
    ogate: Linear,
    /// Output projection: `[num_heads * head_dim, embedding_dim]`.
    out_proj: Linear,

    /// `GroupNorm` scale: `[num_heads * head_dim]`.
    gn_weight: Tensor,
    /// `GroupNorm` bias, present when `use_bias` is configured.
    gn_bias: Option<Tensor>,

    /// Number of heads.
    num_heads: usize,
    /// Per-head dimension.
    head_dim: usize,
    /// Epsilon for the `GroupNorm`.
    norm_eps: f64,
}

impl MatrixMemory {
    /// Load a matrix-memory layer from weights.
    ///
    /// Weight names: `q_proj`, `k_proj`, `v_proj`, `ogate`, `out_proj`
    /// (no bias), `igate`, `fgate` (with bias), `gn.weight` (+ `gn.bias`).
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(config: &StackConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let embed = config.embedding_dim;
        let nh = config.num_heads;
        let hd = config.head_dim();

        let gn_bias = if config.use_bias {
            Some(vb.get(nh * hd, "gn.bias")?)
        } else {
            None
        };

        Ok(Self {
            q_proj: candle_nn::linear_no_bias(embed, nh * hd, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_no_bias(embed, nh * hd, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_no_bias(embed, nh * hd, vb.pp("v_proj"))?,
            igate: candle_nn::linear(embed, nh, vb.pp("igate"))?,
            fgate: candle_nn::linear(embed, nh, vb.pp("fgate"))?,
            ogate: candle_nn::linear_no_bias(embed, nh * hd, vb.pp("ogate"))?,
            out_proj: candle_nn::linear_no_bias(nh * hd, embed, vb.pp("out_proj"))?,
            gn_weight: vb.get(nh * hd, "gn.weight")?,
            gn_bias,
            num_heads: nh,
            head_dim: hd,
            norm_eps: config.norm_eps,
        })
    }

    /// Run the layer over a token sequence.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embedding_dim]`
    /// - returns: `(y, state)` with `y` at `[batch, seq, embedding_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`](crate::error::ForecastError::Model)
    /// on tensor operation failures.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn forward(&self, x: &Tensor, state: Option<&MemoryState>) -> Result<(Tensor, MemoryState)> {
        let (batch, seq_len, _embed) = x.dims3()?;
        let nh = self.num_heads;
        let hd = self.head_dim;

        let q = self.q_proj.forward(x)?.reshape((batch, seq_len, nh, hd))?;
        let k = self.k_proj.forward(x)?.reshape((batch, seq_len, nh, hd))?;
        let k = (k / (hd as f64).sqrt())?;
        let v = self.v_proj.forward(x)?.reshape((batch, seq_len, nh, hd))?;
        let ig = self.igate.forward(x)?; // [batch, seq, nh]
        let fg = self.fgate.forward(x)?;
        let og = candle_nn::ops::sigmoid(&self.ogate.forward(x)?)?
            .reshape((batch, seq_len, nh, hd))?;

        let (mut c, mut n, mut m) = match state {
            Some(s) => (s.c.clone(), s.n.clone(), s.m.clone()),
            None => (
                Tensor::zeros((batch, nh, hd, hd), x.dtype(), x.device())?,
                Tensor::zeros((batch, nh, hd), x.dtype(), x.device())?,
                Tensor::zeros((batch, nh, 1), x.dtype(), x.device())?,
            ),
        };

        let mut outputs: Vec<Tensor> = Vec::with_capacity(seq_len);

        // EXPLICIT: the recurrence is stateful; .map() would hide the updates
        for ti in 0..seq_len {
            let q_t = q.i((.., ti, .., ..))?; // [batch, nh, hd]
            let k_t = k.i((.., ti, .., ..))?;
            let v_t = v.i((.., ti, .., ..))?;
            let i_pre = ig.i((.., ti, ..))?.unsqueeze(D::Minus1)?; // [batch, nh, 1]
            let f_pre = fg.i((.., ti, ..))?.unsqueeze(D::Minus1)?;

            let m_new = (&f_pre + &m)?.maximum(&i_pre)?;
            let i_act = (&i_pre - &m_new)?.exp()?;
            let f_act = ((&f_pre + &m)? - &m_new)?.exp()?;
            m = m_new;

            // C = f * C + i * (k (x) v)
            let k_col = k_t.unsqueeze(D::Minus1)?.contiguous()?; // [batch, nh, hd, 1]
            let v_row = v_t.unsqueeze(2)?.contiguous()?; // [batch, nh, 1, hd]
            let kv = k_col.matmul(&v_row)?; // [batch, nh, hd, hd]
            let f_mat = f_act.unsqueeze(D::Minus1)?; // [batch, nh, 1, 1]
            let i_mat = i_act.unsqueeze(D::Minus1)?;
            c = (c.broadcast_mul(&f_mat)? + kv.broadcast_mul(&i_mat)?)?;

            // n = f * n + i * k
            n = (n.broadcast_mul(&f_act)? + k_t.broadcast_mul(&i_act)?)?;

            // h = (q @ C) / max(|n . q|, 1)
            let q_row = q_t.unsqueeze(2)?.contiguous()?; // [batch, nh, 1, hd]
            let h_num = q_row.matmul(&c)?.squeeze(2)?; // [batch, nh, hd]
            let denom = (&n * &q_t)?
                .sum_keepdim(D::Minus1)?
                .abs()?
                .maximum(1.0_f64)?; // [batch, nh, 1]
            let h_t = h_num.broadcast_div(&denom)?;

            outputs.push((og.i((.., ti, .., ..))? * h_t)?);
        }

        // Per-head GroupNorm, then project back to the embedding dimension.
        let y = Tensor::stack(&outputs, 1)?; // [batch, seq, nh, hd]
        let y = y.reshape((batch * seq_len, nh * hd))?;
        let y = norm::group_norm(
            &y,
            self.num_heads,
            &self.gn_weight,
            self.gn_bias.as_ref(),
            self.norm_eps,
        )?;
        let y = y.reshape((batch, seq_len, nh * hd))?;
        let y = self.out_proj.forward(&y)?;

        Ok((y, MemoryState { c, n, m }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
