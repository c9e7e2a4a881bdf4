// SPDX-License-Identifier: MIT OR Apache-2.0

//! The forecaster: patch embeddings around the mixed block stack, plus the
//! autoregressive rollout loop.
//!
//! A forward pass embeds `(values, mask)` patch pairs, runs the stack and
//! projects hidden states to per-patch quantile predictions.  Forecasts
//! beyond one patch are produced by appending NaN future tokens: the mask
//! channel tells the model which positions to predict, and the rollout
//! loop feeds its own horizon back in as NaN placeholders until the
//! requested length is covered.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{D, DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;

use crate::backend::KernelBackend;
use crate::checkpoint;
use crate::config::ModelConfig;
use crate::error::{ForecastError, Result};
use crate::layers::ResidualBlock;
use crate::stack::MixedBlockStack;
use crate::tokenizer::PatchTokenizer;

// ---------------------------------------------------------------------------
// ForecastModel
// ---------------------------------------------------------------------------

/// Quantile forecaster over a mixed sLSTM/mLSTM block stack.
pub struct ForecastModel {
    /// Validated configuration.
    config: ModelConfig,
    /// Context scaling and patching.
    tokenizer: PatchTokenizer,
    /// Patch embedding: `[2 * patch] -> [embedding_dim]`.
    input_embedding: ResidualBlock,
    /// The block stack.
    stack: MixedBlockStack,
    /// Prediction head: `[embedding_dim] -> [num_quantiles * patch]`.
    output_embedding: ResidualBlock,
    /// Context length the weights were trained with; shorter contexts are
    /// left-padded up to this length before the first rollout.
    train_ctx_len: usize,
    /// Device all inputs are expected on.
    device: Device,
}

impl ForecastModel {
    /// Load a model from a safetensors checkpoint.
    ///
    /// The checkpoint is converted to the layout `backend` consumes before
    /// any weight is bound; see [`checkpoint::convert_checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Config`] on an invalid configuration,
    /// [`ForecastError::Checkpoint`] on a malformed checkpoint and
    /// [`ForecastError::Model`] on weight binding failures.
    pub fn load<P: AsRef<Path>>(
        config: ModelConfig,
        path: P,
        backend: KernelBackend,
        device: &Device,
        train_ctx_len: usize,
    ) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Self::from_tensors(config, tensors, backend, device, train_ctx_len)
    }

    /// Build a model from an already-loaded tensor map.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ForecastModel::load`].
    pub fn from_tensors(
        config: ModelConfig,
        tensors: HashMap<String, Tensor>,
        backend: KernelBackend,
        device: &Device,
        train_ctx_len: usize,
    ) -> Result<Self> {
        config.validate()?;
        crate::backend::check_device(backend, device);

        let tensors = checkpoint::convert_checkpoint(tensors, backend, &config.block)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);

        let patch = config.input_patch_size;
        let embed = config.block.embedding_dim;
        let nq = config.num_quantiles();

        Ok(Self {
            tokenizer: PatchTokenizer::new(patch),
            input_embedding: ResidualBlock::load(
                2 * patch,
                config.input_ff_dim,
                embed,
                vb.pp("input_embedding"),
            )?,
            stack: MixedBlockStack::load(&config.block, backend, vb.pp("stack"))?,
            output_embedding: ResidualBlock::load(
                embed,
                config.input_ff_dim,
                nq * patch,
                vb.pp("output_embedding"),
            )?,
            config,
            train_ctx_len,
            device: device.clone(),
        })
    }

    /// The validated configuration this model was built with.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The device the weights were loaded onto.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run the model on tokenized input.
    ///
    /// `rollouts` is the number of trailing prediction tokens: `1` predicts
    /// one patch past the context, larger values append `rollouts - 1` NaN
    /// future tokens so a single pass covers several patches ahead.  When
    /// `mask` is `None` it is derived from token finiteness.
    ///
    /// # Shapes
    /// - `tokens`: `[batch, num_patches, patch_size]`, NaN marks missing
    /// - `mask`: `[batch, num_patches, patch_size]`, `1.0` where observed
    /// - returns: `[batch, num_quantiles, num_patches + rollouts - 1,
    ///   patch_size]` of scaled quantile predictions
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Rollout`] when `rollouts` is zero,
    /// [`ForecastError::Backend`] when the accelerated kernel is invoked
    /// off-CUDA, [`ForecastError::Model`] otherwise.
    pub fn forward_tokenized(
        &self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        rollouts: usize,
    ) -> Result<Tensor> {
        if rollouts == 0 {
            return Err(ForecastError::Rollout(
                "rollout count must be >= 1".to_string(),
            ));
        }

        let (batch, _num_patches, patch) = tokens.dims3()?;
        let mut tokens = tokens.clone();
        let mut mask = match mask {
            Some(m) => m.clone(),
            None => tokens.eq(&tokens)?.to_dtype(tokens.dtype())?,
        };
        if rollouts > 1 {
            let nan = Tensor::full(f32::NAN, (batch, rollouts - 1, patch), tokens.device())?
                .to_dtype(tokens.dtype())?;
            tokens = Tensor::cat(&[&tokens, &nan], 1)?;
            let pad_mask =
                Tensor::zeros((batch, rollouts - 1, patch), mask.dtype(), tokens.device())?;
            mask = Tensor::cat(&[&mask, &pad_mask], 1)?;
        }
        let num_tokens = tokens.dim(1)?;

        // The model never sees NaN: missing values enter as zero with a
        // cleared mask bit.
        let observed = tokens.eq(&tokens)?;
        let filled = observed.where_cond(&tokens, &tokens.zeros_like()?)?;
        let input = Tensor::cat(&[&filled, &mask], 2)?; // [batch, tokens, 2 * patch]

        let hidden = self.input_embedding.forward(&input)?;
        let (hidden, _state) = self.stack.forward(&hidden, None)?;
        let out = self.output_embedding.forward(&hidden)?;

        // [batch, tokens, nq * patch] -> [batch, nq, tokens, patch]
        Ok(out
            .reshape((batch, num_tokens, self.config.num_quantiles(), patch))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Forecast quantiles for a batch of context series.
    ///
    /// Produces `prediction_length` values ahead (default: one patch) by
    /// iterating the model: each pass predicts up to `max_rollout_steps`
    /// patches (default 1), the covered horizon is appended to the context
    /// as NaN placeholders, and the context window is re-trimmed before
    /// the next pass.  `max_context` caps the observations fed per pass
    /// and defaults to the trained context length; contexts shorter than
    /// the training length are left-padded with NaN.
    ///
    /// # Shapes
    /// - `context`: `[batch, len]`, NaN marks missing observations
    /// - returns: `[batch, num_quantiles, prediction_length]` on the
    ///   original scale
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Rollout`] on an empty context, a zero
    /// prediction length, or zero rollout steps; propagates model errors
    /// otherwise.
    pub fn forecast_quantiles(
        &self,
        context: &Tensor,
        prediction_length: Option<usize>,
        max_context: Option<usize>,
        max_rollout_steps: Option<usize>,
    ) -> Result<Tensor> {
        let patch = self.config.input_patch_size;
        let prediction_length = prediction_length.unwrap_or(patch);
        if prediction_length == 0 {
            return Err(ForecastError::Rollout(
                "prediction length must be >= 1".to_string(),
            ));
        }
        let max_rollout_steps = max_rollout_steps.unwrap_or(1);
        if max_rollout_steps == 0 {
            return Err(ForecastError::Rollout(
                "max rollout steps must be >= 1".to_string(),
            ));
        }
        // The trained context length is the default window cap: with no
        // explicit cap only the last `train_ctx_len` observations are fed
        // per pass.
        let max_context = max_context.unwrap_or(self.train_ctx_len);
        let min_context = self.train_ctx_len.max(max_context);

        let mut context = context.clone();
        let mut remaining = prediction_length.div_ceil(patch);
        let mut parts: Vec<Tensor> = Vec::new();

        while remaining > 0 {
            let steps = remaining.min(max_rollout_steps);
            let window = pad_and_truncate(&context, Some(max_context), min_context)?;

            let (tokens, mask, state) = self.tokenizer.context_input_transform(&window)?;
            let quantiles = self.forward_tokenized(&tokens, Some(&mask), steps)?;

            let num_tokens = quantiles.dim(2)?;
            let tail = quantiles.narrow(2, num_tokens - steps, steps)?;
            let tail = self.tokenizer.output_transform(&tail, &state)?;
            parts.push(tail.flatten_from(2)?); // [batch, nq, steps * patch]

            // The model predicts NaN-marked positions, so the horizon just
            // covered extends the context as placeholders.
            let batch = context.dim(0)?;
            let nan = Tensor::full(f32::NAN, (batch, steps * patch), context.device())?
                .to_dtype(context.dtype())?;
            context = Tensor::cat(&[&context, &nan], 1)?;
            remaining -= steps;
        }

        let forecast = Tensor::cat(&parts, D::Minus1)?;
        Ok(forecast.narrow(D::Minus1, 0, prediction_length)?)
    }

    /// Forecast the median series for a batch of contexts.
    ///
    /// Selects the quantile level closest to `0.5` from the configured
    /// levels.
    ///
    /// # Shapes
    /// - `context`: `[batch, len]`
    /// - returns: `[batch, prediction_length]`
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ForecastModel::forecast_quantiles`].
    pub fn forecast(
        &self,
        context: &Tensor,
        prediction_length: Option<usize>,
        max_context: Option<usize>,
        max_rollout_steps: Option<usize>,
    ) -> Result<Tensor> {
        let quantiles =
            self.forecast_quantiles(context, prediction_length, max_context, max_rollout_steps)?;

        let median_idx = self
            .config
            .quantiles
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let da = (*a - 0.5).abs();
                let db = (*b - 0.5).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .ok_or_else(|| ForecastError::Config("quantile list must not be empty".to_string()))?;

        Ok(quantiles.i((.., median_idx, ..))?)
    }
}

// ---------------------------------------------------------------------------
// Context windowing
// ---------------------------------------------------------------------------

/// Trim a context to the last `max_context` observations, then left-pad
/// with NaN up to `min_len`.
///
/// # Shapes
/// - `context`: `[batch, len]`
/// - returns: `[batch, max(min(len, max_context), min_len)]`
pub(crate) fn pad_and_truncate(
    context: &Tensor,
    max_context: Option<usize>,
    min_len: usize,
) -> Result<Tensor> {
    let (batch, len) = context.dims2()?;

    let context = match max_context {
        Some(cap) if len > cap => context.narrow(1, len - cap, cap)?,
        _ => context.clone(),
    };
    let len = context.dim(1)?;

    if len >= min_len {
        return Ok(context);
    }
    let nan = Tensor::full(f32::NAN, (batch, min_len - len), context.device())?
        .to_dtype(context.dtype())?;
    Ok(Tensor::cat(&[&nan, &context], 1)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
