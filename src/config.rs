// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model configuration and JSON parsing.
//!
//! [`ModelConfig`] describes the forecaster surface (patch sizes, quantile
//! levels, embedding widths) and nests a [`StackConfig`] describing the
//! mixed block stack.  Both are parsed from a JSON value via
//! [`ModelConfig::from_json`] and validated at construction; every
//! inconsistency is fatal before any weight is touched.
//!
//! # Usage
//!
//! ```
//! use patchcast::config::{BlockKind, ModelConfig};
//!
//! let config_str = r#"{
//!     "input_patch_size": 32, "output_patch_size": 32,
//!     "quantiles": [0.1, 0.5, 0.9], "input_ff_dim": 64,
//!     "block": {"num_blocks": 2, "embedding_dim": 32, "num_heads": 4,
//!               "recurrent_at": [0], "all_recurrent": false}}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = ModelConfig::from_json(&json).unwrap();
//! assert_eq!(config.block.head_dim(), 8);
//! assert_eq!(
//!     config.block.block_kinds(),
//!     vec![BlockKind::Recurrent, BlockKind::Memory],
//! );
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{ForecastError, Result};

// ---------------------------------------------------------------------------
// BlockKind
// ---------------------------------------------------------------------------

/// The two block variants the stack composes.
///
/// A closed sum: every position in the stack is exactly one of these,
/// resolved once from configuration at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// sLSTM block: stateful recurrent cell with exponential gating.
    Recurrent,
    /// mLSTM block: matrix-memory cell with scalar gates.
    Memory,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recurrent => write!(f, "recurrent (sLSTM)"),
            Self::Memory => write!(f, "memory (mLSTM)"),
        }
    }
}

// ---------------------------------------------------------------------------
// StackConfig
// ---------------------------------------------------------------------------

/// Configuration for the mixed block stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Number of blocks in the stack.
    pub num_blocks: usize,
    /// Hidden dimension (`d_model`).
    pub embedding_dim: usize,
    /// Number of heads; `embedding_dim` must be divisible by this.
    pub num_heads: usize,
    /// Epsilon for RMS normalization layers.
    pub norm_eps: f64,
    /// Whether normalization layers carry a learned bias.
    pub use_bias: bool,
    /// Feed-forward width as a multiple of `embedding_dim`, rounded up to 64.
    pub ffn_proj_factor: f64,
    /// Positions of recurrent (sLSTM) blocks; ignored when `all_recurrent`.
    pub recurrent_at: Vec<usize>,
    /// When true every position is a recurrent block.
    pub all_recurrent: bool,
    /// Whether to apply RMS normalization to the stack output.
    pub add_out_norm: bool,
}

impl StackConfig {
    /// Per-head dimension: `embedding_dim / num_heads`.
    #[must_use]
    pub const fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads
    }

    /// Feed-forward hidden dimension, rounded up to a multiple of 64.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::as_conversions
    )]
    pub fn ffn_dim(&self) -> usize {
        let raw = (self.embedding_dim as f64 * self.ffn_proj_factor).ceil() as usize;
        raw.div_ceil(64) * 64
    }

    /// Resolve the block type assignment for all positions.
    ///
    /// Position `i` is [`BlockKind::Recurrent`] when `all_recurrent` is set
    /// or `i` appears in `recurrent_at`, otherwise [`BlockKind::Memory`].
    /// The returned vector always has length `num_blocks`.
    #[must_use]
    pub fn block_kinds(&self) -> Vec<BlockKind> {
        (0..self.num_blocks)
            .map(|i| {
                if self.all_recurrent || self.recurrent_at.contains(&i) {
                    BlockKind::Recurrent
                } else {
                    BlockKind::Memory
                }
            })
            .collect()
    }

    /// Validate stack-level invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Config`] when `num_blocks` is zero,
    /// `embedding_dim` does not divide into `num_heads`, `norm_eps` is not
    /// positive, or a `recurrent_at` position is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.num_blocks == 0 {
            return Err(ForecastError::Config("num_blocks must be >= 1".into()));
        }
        if self.num_heads == 0 || self.embedding_dim % self.num_heads != 0 {
            return Err(ForecastError::Config(format!(
                "embedding_dim {} must be divisible by num_heads {}",
                self.embedding_dim, self.num_heads
            )));
        }
        if self.norm_eps <= 0.0 {
            return Err(ForecastError::Config("norm_eps must be positive".into()));
        }
        if let Some(pos) = self.recurrent_at.iter().find(|&&p| p >= self.num_blocks) {
            return Err(ForecastError::Config(format!(
                "recurrent_at position {pos} out of range for {} blocks",
                self.num_blocks
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

/// Top-level forecaster configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Number of observations per input patch (token).
    pub input_patch_size: usize,
    /// Number of forecasted values per output token; must equal
    /// `input_patch_size`.
    pub output_patch_size: usize,
    /// Predicted quantile levels; non-empty, each strictly inside `(0, 1)`.
    pub quantiles: Vec<f64>,
    /// Hidden width of the input/output patch embeddings.
    pub input_ff_dim: usize,
    /// Block stack configuration.
    pub block: StackConfig,
}

impl ModelConfig {
    /// Parse a [`ModelConfig`] from a JSON value and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Config`] when required fields are missing or
    /// a construction-time invariant is violated.
    pub fn from_json(config: &Value) -> Result<Self> {
        let block = config
            .get("block")
            .ok_or_else(|| ForecastError::Config("missing 'block' section".into()))?;

        let parsed = Self {
            input_patch_size: get_usize(config, "input_patch_size")?,
            output_patch_size: get_usize(config, "output_patch_size")?,
            quantiles: get_f64_list(config, "quantiles")?,
            input_ff_dim: get_usize(config, "input_ff_dim")?,
            block: StackConfig {
                num_blocks: get_usize(block, "num_blocks")?,
                embedding_dim: get_usize(block, "embedding_dim")?,
                num_heads: get_usize(block, "num_heads")?,
                norm_eps: get_f64_or(block, "norm_eps", 1e-6),
                use_bias: get_bool_or(block, "use_bias", false),
                ffn_proj_factor: get_f64_or(block, "ffn_proj_factor", 8.0 / 3.0),
                recurrent_at: get_usize_list_or(block, "recurrent_at"),
                all_recurrent: get_bool_or(block, "all_recurrent", true),
                add_out_norm: get_bool_or(block, "add_out_norm", true),
            },
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate forecaster-level and stack-level invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Config`] on input/output patch size mismatch,
    /// empty or out-of-range quantile levels, a zero embedding width, or any
    /// [`StackConfig::validate`] failure.
    pub fn validate(&self) -> Result<()> {
        if self.input_patch_size != self.output_patch_size {
            return Err(ForecastError::Config(format!(
                "input_patch_size {} != output_patch_size {}",
                self.input_patch_size, self.output_patch_size
            )));
        }
        if self.input_patch_size == 0 {
            return Err(ForecastError::Config("patch size must be >= 1".into()));
        }
        if self.quantiles.is_empty() {
            return Err(ForecastError::Config(
                "quantile list must not be empty".into(),
            ));
        }
        if let Some(q) = self.quantiles.iter().find(|q| !(0.0 < **q && **q < 1.0)) {
            return Err(ForecastError::Config(format!(
                "quantile level {q} outside (0, 1)"
            )));
        }
        if self.input_ff_dim == 0 {
            return Err(ForecastError::Config("input_ff_dim must be >= 1".into()));
        }
        self.block.validate()
    }

    /// Number of predicted quantile levels (output channel count).
    #[must_use]
    pub const fn num_quantiles(&self) -> usize {
        self.quantiles.len()
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ForecastError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| ForecastError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Extract a required list of `f64` values.
fn get_f64_list(config: &Value, key: &str) -> Result<Vec<f64>> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_f64).collect())
        .ok_or_else(|| ForecastError::Config(format!("missing or invalid field '{key}'")))
}

/// Extract a list of `usize` values, returning an empty list if absent.
fn get_usize_list_or(config: &Value, key: &str) -> Vec<usize> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .filter_map(|v| usize::try_from(v).ok())
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config_json() -> Value {
        serde_json::json!({
            "input_patch_size": 32,
            "output_patch_size": 32,
            "quantiles": [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9],
            "input_ff_dim": 256,
            "block": {
                "num_blocks": 4,
                "embedding_dim": 128,
                "num_heads": 4,
                "norm_eps": 1e-6,
                "use_bias": false,
                "recurrent_at": [0, 2],
                "all_recurrent": false,
                "add_out_norm": true
            }
        })
    }

    #[test]
    fn parse_basic() {
        let config = ModelConfig::from_json(&config_json()).unwrap();
        assert_eq!(config.input_patch_size, 32);
        assert_eq!(config.num_quantiles(), 9);
        assert_eq!(config.block.num_blocks, 4);
        assert_eq!(config.block.head_dim(), 32);
        assert!(!config.block.use_bias);
    }

    #[test]
    fn block_kinds_from_positions() {
        let config = ModelConfig::from_json(&config_json()).unwrap();
        assert_eq!(
            config.block.block_kinds(),
            vec![
                BlockKind::Recurrent,
                BlockKind::Memory,
                BlockKind::Recurrent,
                BlockKind::Memory,
            ]
        );
    }

    #[test]
    fn all_recurrent_overrides_positions() {
        let mut json = config_json();
        json["block"]["all_recurrent"] = serde_json::json!(true);
        let config = ModelConfig::from_json(&json).unwrap();
        assert!(config
            .block
            .block_kinds()
            .iter()
            .all(|k| *k == BlockKind::Recurrent));
    }

    #[test]
    fn every_position_assigned_once() {
        let config = ModelConfig::from_json(&config_json()).unwrap();
        assert_eq!(config.block.block_kinds().len(), config.block.num_blocks);
    }

    #[test]
    fn patch_size_mismatch_is_fatal() {
        let mut json = config_json();
        json["output_patch_size"] = serde_json::json!(16);
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn empty_quantiles_is_fatal() {
        let mut json = config_json();
        json["quantiles"] = serde_json::json!([]);
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn out_of_range_block_position_is_fatal() {
        let mut json = config_json();
        json["block"]["recurrent_at"] = serde_json::json!([7]);
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn indivisible_heads_is_fatal() {
        let mut json = config_json();
        json["block"]["num_heads"] = serde_json::json!(3);
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn ffn_dim_rounds_to_64() {
        let config = ModelConfig::from_json(&config_json()).unwrap();
        // 128 * 8/3 = 341.33 -> 384
        assert_eq!(config.block.ffn_dim(), 384);
    }
}
