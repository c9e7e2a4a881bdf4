// SPDX-License-Identifier: MIT OR Apache-2.0

//! sLSTM recurrent cell with exponential gating.
//!
//! The cell keeps four scalar state tensors per head and updates them one
//! timestep at a time:
//!
//! ```text
//! m_t = max(f~ + m, i~)                    (stabilizer)
//! i_t = exp(i~ - m_t)    f_t = exp(f~ + m - m_t)
//! c_t = f_t * c + i_t * tanh(z~)
//! n_t = f_t * n + i_t
//! h_t = sigmoid(o~) * c_t / n_t
//! ```
//!
//! where the gate preactivations `i~, f~, z~, o~` are the sum of a
//! per-gate input projection, a per-head recurrent kernel applied to
//! `h_{t-1}`, and a per-gate bias.
//!
//! The same update exists in two implementations selected by
//! [`KernelBackend`], fixed at construction.  They are numerically
//! equivalent but consume different physical layouts of the recurrent
//! kernel and bias tensors (see [`checkpoint`](crate::checkpoint) for the
//! conversion between them).  The accelerated path additionally requires a
//! CUDA device; invoking it elsewhere fails at the forward pass.
//!
//! The convolution sublayer is configured with kernel width zero and is
//! disabled; its sub-state is carried as a present-but-empty tensor list
//! at the block level.

use candle_core::{D, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::backend::KernelBackend;
use crate::config::StackConfig;
use crate::error::{ForecastError, Result};
use crate::norm;

/// Number of gates in the cell update (input, forget, cell, output).
pub const NUM_GATES: usize = 4;

// ---------------------------------------------------------------------------
// CellState
// ---------------------------------------------------------------------------

/// Recurrent state of one sLSTM cell.
///
/// All tensors are `[batch, num_heads, head_dim]`.  A fresh state is
/// all-zero; callers thread the returned state back in to continue a
/// sequence across forward calls.
#[derive(Debug, Clone)]
pub struct CellState {
    /// Hidden output of the last timestep (input to the next recurrence).
    pub h: Tensor,
    /// Cell content accumulator.
    pub c: Tensor,
    /// Normalizer accumulator.
    pub n: Tensor,
    /// Stabilizer (running max of log-gate magnitudes).
    pub m: Tensor,
}

// ---------------------------------------------------------------------------
// SlstmCell
// ---------------------------------------------------------------------------

/// One sLSTM cell: per-gate input projections, a block-diagonal per-head
/// recurrent kernel, per-gate biases and a per-head `GroupNorm` on the
/// stacked hidden outputs.
pub struct SlstmCell {
    /// Input-gate input projection: `[embedding_dim, num_heads * head_dim]`.
    igate: Linear,
    /// Forget-gate input projection.
    fgate: Linear,
    /// Cell-gate input projection.
    zgate: Linear,
    /// Output-gate input projection.
    ogate: Linear,

    /// Recurrent kernel: `[num_heads, NUM_GATES * head_dim, head_dim]`.
    ///
    /// Row ordering within a head depends on the backend: gate-major for
    /// the portable kernel, `(head_dim, gate)`-interleaved for the fused
    /// kernel.
    recurrent_kernel: Tensor,
    /// Gate biases: `[num_heads * NUM_GATES * head_dim]`, flattened from
    /// `(gates, heads, head_dim)` (portable) or `(heads, gates, head_dim)`
    /// (accelerated).
    bias: Tensor,

    /// `GroupNorm` scale: `[num_heads * head_dim]`.
    gn_weight: Tensor,
    /// `GroupNorm` bias, present when `use_bias` is configured.
    gn_bias: Option<Tensor>,

    /// Which kernel implementation this cell runs.
    backend: KernelBackend,
    /// Number of heads.
    num_heads: usize,
    /// Per-head dimension.
    head_dim: usize,
    /// Epsilon for the `GroupNorm`.
    norm_eps: f64,
}

impl SlstmCell {
    /// Load an sLSTM cell from weights.
    ///
    /// Weight names: `igate`, `fgate`, `zgate`, `ogate` (input projections,
    /// no bias), `recurrent_kernel`, `bias`, `gn.weight` (+ `gn.bias`).
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(config: &StackConfig, backend: KernelBackend, vb: VarBuilder<'_>) -> Result<Self> {
        let embed = config.embedding_dim;
        let nh = config.num_heads;
        let hd = config.head_dim();

        let igate = candle_nn::linear_no_bias(embed, nh * hd, vb.pp("igate"))?;
        let fgate = candle_nn::linear_no_bias(embed, nh * hd, vb.pp("fgate"))?;
        let zgate = candle_nn::linear_no_bias(embed, nh * hd, vb.pp("zgate"))?;
        let ogate = candle_nn::linear_no_bias(embed, nh * hd, vb.pp("ogate"))?;

        let recurrent_kernel = vb.get((nh, NUM_GATES * hd, hd), "recurrent_kernel")?;
        let bias = vb.get(nh * NUM_GATES * hd, "bias")?;

        let gn_weight = vb.get(nh * hd, "gn.weight")?;
        let gn_bias = if config.use_bias {
            Some(vb.get(nh * hd, "gn.bias")?)
        } else {
            None
        };

        Ok(Self {
            igate,
            fgate,
            zgate,
            ogate,
            recurrent_kernel,
            bias,
            gn_weight,
            gn_bias,
            backend,
            num_heads: nh,
            head_dim: hd,
            norm_eps: config.norm_eps,
        })
    }

    /// Extract the per-gate recurrent matrices in math order.
    ///
    /// Both backends yield matrices `R_g` such that the recurrent
    /// contribution is `R_g @ h_{t-1}`; only the physical layout they are
    /// read from differs.
    ///
    /// # Shapes
    /// - returns: `NUM_GATES` tensors of `[1, num_heads, head_dim, head_dim]`
    fn gate_matrices(&self) -> Result<Vec<Tensor>> {
        let nh = self.num_heads;
        let hd = self.head_dim;
        let mut mats = Vec::with_capacity(NUM_GATES);
        match self.backend {
            KernelBackend::Portable => {
                // Gate-major rows: (heads, gates, head_dim, head_dim).
                let rk = self.recurrent_kernel.reshape((nh, NUM_GATES, hd, hd))?;
                for g in 0..NUM_GATES {
                    mats.push(rk.i((.., g, .., ..))?.contiguous()?.unsqueeze(0)?);
                }
            }
            KernelBackend::Accelerated => {
                // Interleaved rows: (heads, head_dim, gates, head_dim); the
                // gate matrix is stored transposed relative to math order.
                let rk = self.recurrent_kernel.reshape((nh, hd, NUM_GATES, hd))?;
                for g in 0..NUM_GATES {
                    mats.push(
                        rk.i((.., .., g, ..))?
                            .transpose(1, 2)?
                            .contiguous()?
                            .unsqueeze(0)?,
                    );
                }
            }
        }
        Ok(mats)
    }

    /// Extract the per-gate biases in math order.
    ///
    /// # Shapes
    /// - returns: `NUM_GATES` tensors of `[num_heads, head_dim]`
    fn gate_biases(&self) -> Result<Vec<Tensor>> {
        let nh = self.num_heads;
        let hd = self.head_dim;
        let mut biases = Vec::with_capacity(NUM_GATES);
        match self.backend {
            KernelBackend::Portable => {
                let b = self.bias.reshape((NUM_GATES, nh, hd))?;
                for g in 0..NUM_GATES {
                    biases.push(b.i(g)?.contiguous()?);
                }
            }
            KernelBackend::Accelerated => {
                let b = self.bias.reshape((nh, NUM_GATES, hd))?;
                for g in 0..NUM_GATES {
                    biases.push(b.i((.., g, ..))?.contiguous()?);
                }
            }
        }
        Ok(biases)
    }

    /// Run the cell over a token sequence.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embedding_dim]`
    /// - returns: `(y, state)` with `y` at `[batch, seq, embedding_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Backend`] when the accelerated kernel is
    /// invoked on a non-CUDA device, [`ForecastError::Model`] on tensor
    /// operation failures.
    pub fn forward(&self, x: &Tensor, state: Option<&CellState>) -> Result<(Tensor, CellState)> {
        if !self.backend.supports_device(x.device()) {
            return Err(ForecastError::Backend(format!(
                "accelerated sLSTM kernel requires a CUDA device, got {:?}",
                x.device().location()
            )));
        }

        let (batch, seq_len, _embed) = x.dims3()?;
        let nh = self.num_heads;
        let hd = self.head_dim;

        // Per-gate input preactivations for the whole sequence.
        let ix = self.igate.forward(x)?.reshape((batch, seq_len, nh, hd))?;
        let fx = self.fgate.forward(x)?.reshape((batch, seq_len, nh, hd))?;
        let zx = self.zgate.forward(x)?.reshape((batch, seq_len, nh, hd))?;
        let ox = self.ogate.forward(x)?.reshape((batch, seq_len, nh, hd))?;

        let mats = self.gate_matrices()?;
        let biases = self.gate_biases()?;

        let (mut h, mut c, mut n, mut m) = match state {
            Some(s) => (s.h.clone(), s.c.clone(), s.n.clone(), s.m.clone()),
            None => {
                let zeros = || Tensor::zeros((batch, nh, hd), x.dtype(), x.device());
                (zeros()?, zeros()?, zeros()?, zeros()?)
            }
        };

        let mut outputs: Vec<Tensor> = Vec::with_capacity(seq_len);

        // EXPLICIT: the recurrence is stateful; .map() would hide the updates
        for ti in 0..seq_len {
            let h_col = h.unsqueeze(D::Minus1)?; // [batch, nh, hd, 1]
            let recur = |g: usize| -> Result<Tensor> {
                Ok(mats[g].broadcast_matmul(&h_col)?.squeeze(D::Minus1)?)
            };

            let pre_i = ((ix.i((.., ti, .., ..))? + recur(0)?)?).broadcast_add(&biases[0])?;
            let pre_f = ((fx.i((.., ti, .., ..))? + recur(1)?)?).broadcast_add(&biases[1])?;
            let pre_z = ((zx.i((.., ti, .., ..))? + recur(2)?)?).broadcast_add(&biases[2])?;
            let pre_o = ((ox.i((.., ti, .., ..))? + recur(3)?)?).broadcast_add(&biases[3])?;

            let m_new = (&pre_f + &m)?.maximum(&pre_i)?;
            let i_act = (&pre_i - &m_new)?.exp()?;
            let f_act = ((&pre_f + &m)? - &m_new)?.exp()?;

            c = ((&f_act * &c)? + (&i_act * &pre_z.tanh()?)?)?;
            n = ((&f_act * &n)? + &i_act)?;
            m = m_new;
            h = (candle_nn::ops::sigmoid(&pre_o)? * (&c / &n)?)?;

            outputs.push(h.clone());
        }

        // Per-head GroupNorm over the stacked hidden outputs.
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

        Ok((y, CellState { h, c, n, m }))
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

    const NH: usize = 2;
    const HD: usize = 4;
    const EMBED: usize = NH * HD;

    fn test_config() -> StackConfig {
        StackConfig {
            num_blocks: 1,
            embedding_dim: EMBED,
            num_heads: NH,
            norm_eps: 1e-6,
            use_bias: false,
            ffn_proj_factor: 2.0,
            recurrent_at: vec![],
            all_recurrent: true,
            add_out_norm: true,
        }
    }

    fn random_cell(device: &Device, backend: KernelBackend) -> SlstmCell {
        let linear = |seed: f64| {
            let w = Tensor::randn(0.0_f32, 0.1, (NH * HD, EMBED), device)
                .unwrap()
                .affine(1.0, seed * 0.01)
                .unwrap();
            Linear::new(w, None)
        };
        SlstmCell {
            igate: linear(1.0),
            fgate: linear(2.0),
            zgate: linear(3.0),
            ogate: linear(4.0),
            recurrent_kernel: Tensor::randn(0.0_f32, 0.1, (NH, NUM_GATES * HD, HD), device)
                .unwrap(),
            bias: Tensor::randn(0.0_f32, 0.1, NH * NUM_GATES * HD, device).unwrap(),
            gn_weight: Tensor::ones(NH * HD, DType::F32, device).unwrap(),
            gn_bias: None,
            backend,
            num_heads: NH,
            head_dim: HD,
            norm_eps: 1e-6,
        }
    }

    #[test]
    fn accelerated_fails_on_cpu() {
        let device = Device::Cpu;
        let cell = random_cell(&device, KernelBackend::Accelerated);
        let x = Tensor::zeros((1, 3, EMBED), DType::F32, &device).unwrap();
        let err = cell.forward(&x, None);
        assert!(matches!(err, Err(ForecastError::Backend(_))));
    }

    #[test]
    fn state_map_is_threaded_across_calls() {
        // Two chunked calls must reproduce one full-sequence call exactly.
        let device = Device::Cpu;
        let cell = random_cell(&device, KernelBackend::Portable);
        let x = Tensor::randn(0.0_f32, 1.0, (2, 6, EMBED), &device).unwrap();

        let (y_full, s_full) = cell.forward(&x, None).unwrap();

        let x_a = x.narrow(1, 0, 3).unwrap();
        let x_b = x.narrow(1, 3, 3).unwrap();
        let (_, s_a) = cell.forward(&x_a, None).unwrap();
        let (y_b, s_b) = cell.forward(&x_b, Some(&s_a)).unwrap();

        let full_tail: Vec<f32> = y_full
            .narrow(1, 3, 3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let chunked_tail: Vec<f32> = y_b.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in full_tail.iter().zip(&chunked_tail) {
            assert!((a - b).abs() < 1e-5, "chunked output diverged: {a} vs {b}");
        }

        let c_full: Vec<f32> = s_full.c.flatten_all().unwrap().to_vec1().unwrap();
        let c_chunked: Vec<f32> = s_b.c.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in c_full.iter().zip(&c_chunked) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn layout_paths_agree() {
        // A fused-layout cell and a portable cell loaded with the converted
        // weights must read identical gate matrices and biases.
        let device = Device::Cpu;
        let fused = random_cell(&device, KernelBackend::Accelerated);
        let mut portable = random_cell(&device, KernelBackend::Portable);
        portable.recurrent_kernel =
            crate::checkpoint::fused_to_portable_kernel(&fused.recurrent_kernel, NH, HD).unwrap();
        portable.bias = crate::checkpoint::fused_to_portable_bias(&fused.bias, NH, HD).unwrap();

        let mats_p = portable.gate_matrices().unwrap();
        let mats_a = fused.gate_matrices().unwrap();
        for (p, a) in mats_p.iter().zip(&mats_a) {
            let pv: Vec<f32> = p.flatten_all().unwrap().to_vec1().unwrap();
            let av: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(pv, av);
        }

        let b_p = portable.gate_biases().unwrap();
        let b_a = fused.gate_biases().unwrap();
        for (p, a) in b_p.iter().zip(&b_a) {
            let pv: Vec<f32> = p.flatten_all().unwrap().to_vec1().unwrap();
            let av: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(pv, av);
        }
    }

    #[test]
    fn load_from_zeros_produces_finite_output() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let cell = SlstmCell::load(&test_config(), KernelBackend::Portable, vb).unwrap();
        let x = Tensor::zeros((1, 4, EMBED), DType::F32, &device).unwrap();
        let (y, state) = cell.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[1, 4, EMBED]);
        assert_eq!(state.h.dims(), &[1, NH, HD]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));
    }
}
