// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint weight-layout conversion.
//!
//! Checkpoints store sLSTM recurrent kernels and gate biases in the fused
//! layout the accelerated CUDA kernel consumes.  The portable kernel
//! consumes a gate-major layout instead, so loading a checkpoint on
//! [`KernelBackend::Portable`] rewrites those two tensor families in
//! place.  All conversions are pure permutations: bit-exact, and inverses
//! of each other.
//!
//! Per head, with `NG = 4` gates and head dimension `hd`:
//!
//! - fused kernel rows interleave as `(hd, NG)`, portable rows are
//!   gate-major `(NG, hd)`, and the per-gate matrix is transposed between
//!   the two;
//! - the fused bias flattens `(heads, NG, hd)`, the portable bias
//!   flattens `(NG, heads, hd)`.
//!
//! Only tensors whose names end in [`KERNEL_SUFFIX`] or [`BIAS_SUFFIX`]
//! are touched; everything else passes through untouched.

use std::collections::HashMap;

use candle_core::Tensor;
use tracing::warn;

use crate::backend::KernelBackend;
use crate::cell::NUM_GATES;
use crate::config::StackConfig;
use crate::error::{ForecastError, Result};

/// Name suffix of the layout-dependent recurrent kernel tensors.
pub const KERNEL_SUFFIX: &str = ".cell.recurrent_kernel";
/// Name suffix of the layout-dependent gate bias tensors.
pub const BIAS_SUFFIX: &str = ".cell.bias";

// ---------------------------------------------------------------------------
// Kernel permutations
// ---------------------------------------------------------------------------

/// Rewrite a fused-layout recurrent kernel into the portable layout.
///
/// # Shapes
/// - input: any shape with `num_heads * NUM_GATES * head_dim * head_dim`
///   elements, rows interleaved as `(head_dim, gates)`
/// - returns: `[num_heads, NUM_GATES * head_dim, head_dim]`, gate-major
///
/// # Errors
///
/// Returns [`ForecastError::Checkpoint`] when the element count does not
/// match the configured head geometry.
pub fn fused_to_portable_kernel(kernel: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    check_kernel_size(kernel, num_heads, head_dim)?;
    Ok(kernel
        .reshape((num_heads, head_dim, NUM_GATES, head_dim))?
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((num_heads, NUM_GATES * head_dim, head_dim))?)
}

/// Rewrite a portable-layout recurrent kernel back into the fused layout.
///
/// Exact inverse of [`fused_to_portable_kernel`].
///
/// # Errors
///
/// Returns [`ForecastError::Checkpoint`] when the element count does not
/// match the configured head geometry.
pub fn portable_to_fused_kernel(kernel: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    check_kernel_size(kernel, num_heads, head_dim)?;
    Ok(kernel
        .reshape((num_heads, NUM_GATES, head_dim, head_dim))?
        .permute((0, 3, 1, 2))?
        .contiguous()?
        .reshape((num_heads, NUM_GATES * head_dim, head_dim))?)
}

/// Rewrite a fused-layout gate bias into the portable layout.
///
/// # Shapes
/// - input: `num_heads * NUM_GATES * head_dim` elements, flattened from
///   `(heads, gates, head_dim)`
/// - returns: `[num_heads * NUM_GATES * head_dim]`, flattened from
///   `(gates, heads, head_dim)`
///
/// # Errors
///
/// Returns [`ForecastError::Checkpoint`] when the element count does not
/// match the configured head geometry.
pub fn fused_to_portable_bias(bias: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    check_bias_size(bias, num_heads, head_dim)?;
    Ok(bias
        .reshape((num_heads, NUM_GATES, head_dim))?
        .permute((1, 0, 2))?
        .contiguous()?
        .flatten_all()?)
}

/// Rewrite a portable-layout gate bias back into the fused layout.
///
/// Exact inverse of [`fused_to_portable_bias`].
///
/// # Errors
///
/// Returns [`ForecastError::Checkpoint`] when the element count does not
/// match the configured head geometry.
pub fn portable_to_fused_bias(bias: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    check_bias_size(bias, num_heads, head_dim)?;
    Ok(bias
        .reshape((NUM_GATES, num_heads, head_dim))?
        .permute((1, 0, 2))?
        .contiguous()?
        .flatten_all()?)
}

fn check_kernel_size(kernel: &Tensor, num_heads: usize, head_dim: usize) -> Result<()> {
    let expected = num_heads * NUM_GATES * head_dim * head_dim;
    if kernel.elem_count() != expected {
        return Err(ForecastError::Checkpoint(format!(
            "recurrent kernel has {} elements, expected {expected} \
             ({num_heads} heads x {NUM_GATES} gates x {head_dim}^2)",
            kernel.elem_count()
        )));
    }
    Ok(())
}

fn check_bias_size(bias: &Tensor, num_heads: usize, head_dim: usize) -> Result<()> {
    let expected = num_heads * NUM_GATES * head_dim;
    if bias.elem_count() != expected {
        return Err(ForecastError::Checkpoint(format!(
            "gate bias has {} elements, expected {expected} \
             ({num_heads} heads x {NUM_GATES} gates x {head_dim})",
            bias.elem_count()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkpoint conversion
// ---------------------------------------------------------------------------

/// Convert a loaded checkpoint to the layout the selected backend consumes.
///
/// Checkpoints ship in the fused layout, so [`KernelBackend::Accelerated`]
/// returns the map unchanged.  For [`KernelBackend::Portable`] every
/// tensor named `*.cell.recurrent_kernel` or `*.cell.bias` is rewritten;
/// all other tensors are passed through bit-identical.
///
/// # Errors
///
/// Returns [`ForecastError::Checkpoint`] when a layout-dependent tensor
/// does not match the head geometry in `config`.
pub fn convert_checkpoint(
    tensors: HashMap<String, Tensor>,
    backend: KernelBackend,
    config: &StackConfig,
) -> Result<HashMap<String, Tensor>> {
    if backend == KernelBackend::Accelerated {
        return Ok(tensors);
    }

    warn!("accelerated sLSTM kernels unavailable, rewriting weights for the portable kernel");

    let nh = config.num_heads;
    let hd = config.head_dim();
    let mut converted = HashMap::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let tensor = if name.ends_with(KERNEL_SUFFIX) {
            fused_to_portable_kernel(&tensor, nh, hd)?
        } else if name.ends_with(BIAS_SUFFIX) {
            fused_to_portable_bias(&tensor, nh, hd)?
        } else {
            tensor
        };
        converted.insert(name, tensor);
    }
    Ok(converted)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    const NH: usize = 2;
    const HD: usize = 3;

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn kernel_round_trip_is_bit_exact() {
        let device = Device::Cpu;
        let fused =
            Tensor::randn(0.0_f32, 1.0, (NH, NUM_GATES * HD, HD), &device).unwrap();
        let portable = fused_to_portable_kernel(&fused, NH, HD).unwrap();
        let back = portable_to_fused_kernel(&portable, NH, HD).unwrap();
        assert_eq!(to_vec(&fused), to_vec(&back));
        // A permutation, not a copy: the layouts differ.
        assert_ne!(to_vec(&fused), to_vec(&portable));
    }

    #[test]
    fn bias_round_trip_is_bit_exact() {
        let device = Device::Cpu;
        let fused = Tensor::randn(0.0_f32, 1.0, NH * NUM_GATES * HD, &device).unwrap();
        let portable = fused_to_portable_bias(&fused, NH, HD).unwrap();
        let back = portable_to_fused_bias(&portable, NH, HD).unwrap();
        assert_eq!(to_vec(&fused), to_vec(&back));
        assert_ne!(to_vec(&fused), to_vec(&portable));
    }

    #[test]
    fn bias_permutation_reorders_gate_blocks() {
        // Fused: heads-major (h, g, d); portable: gate-major (g, h, d).
        let device = Device::Cpu;
        let vals: Vec<f32> = (0..(NH * NUM_GATES * HD) as u32).map(|v| v as f32).collect();
        let fused = Tensor::from_vec(vals, NH * NUM_GATES * HD, &device).unwrap();
        let portable = to_vec(&fused_to_portable_bias(&fused, NH, HD).unwrap());

        // Portable position (g, h, d) reads fused position (h, g, d).
        for g in 0..NUM_GATES {
            for h in 0..NH {
                for d in 0..HD {
                    let expected = ((h * NUM_GATES + g) * HD + d) as f32;
                    assert_eq!(portable[(g * NH + h) * HD + d], expected);
                }
            }
        }
    }

    #[test]
    fn wrong_size_is_rejected() {
        let device = Device::Cpu;
        let t = Tensor::zeros(7, candle_core::DType::F32, &device).unwrap();
        assert!(fused_to_portable_kernel(&t, NH, HD).is_err());
        assert!(fused_to_portable_bias(&t, NH, HD).is_err());
    }

    #[test]
    fn conversion_is_selective() {
        let device = Device::Cpu;
        let config = StackConfig {
            num_blocks: 1,
            embedding_dim: NH * HD,
            num_heads: NH,
            norm_eps: 1e-6,
            use_bias: false,
            ffn_proj_factor: 2.0,
            recurrent_at: vec![0],
            all_recurrent: false,
            add_out_norm: true,
        };

        let kernel =
            Tensor::randn(0.0_f32, 1.0, (NH, NUM_GATES * HD, HD), &device).unwrap();
        let other = Tensor::randn(0.0_f32, 1.0, (4, 4), &device).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("blocks.0.cell.recurrent_kernel".to_string(), kernel.clone());
        tensors.insert("blocks.0.ffn.gate_proj.weight".to_string(), other.clone());

        // Accelerated backend consumes the checkpoint layout as-is.
        let out = convert_checkpoint(tensors.clone(), KernelBackend::Accelerated, &config).unwrap();
        assert_eq!(to_vec(&out["blocks.0.cell.recurrent_kernel"]), to_vec(&kernel));

        // Portable rewrites the kernel but leaves other tensors untouched.
        let out = convert_checkpoint(tensors, KernelBackend::Portable, &config).unwrap();
        assert_eq!(
            to_vec(&out["blocks.0.cell.recurrent_kernel"]),
            to_vec(&fused_to_portable_kernel(&kernel, NH, HD).unwrap())
        );
        assert_eq!(to_vec(&out["blocks.0.ffn.gate_proj.weight"]), to_vec(&other));
    }
}
