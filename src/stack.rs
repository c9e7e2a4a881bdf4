// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mixed block stack: an ordered sequence of sLSTM and mLSTM blocks with
//! per-block recurrent state threaded through sequential invocation.
//!
//! # Architecture
//!
//! ```text
//! Input -> for each block (kind fixed by configuration):
//!     -> RmsNorm -> cell (sLSTM or mLSTM) -> residual add
//!     -> RmsNorm -> FeedForward -> residual add
//! -> optional output RmsNorm
//! ```
//!
//! Block kinds are resolved once from [`StackConfig::block_kinds`] at
//! construction and never change at runtime.  The state is an index-keyed
//! map owned by the caller; the stack retains no references after
//! returning.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::backend::KernelBackend;
use crate::cell::{CellState, SlstmCell};
use crate::config::{BlockKind, StackConfig};
use crate::error::{ForecastError, Result};
use crate::layers::FeedForward;
use crate::memory::{MatrixMemory, MemoryState};
use crate::norm::RmsNorm;

// ---------------------------------------------------------------------------
// Block state
// ---------------------------------------------------------------------------

/// State of one recurrent (sLSTM) block.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    /// Convolution sub-state.  The convolution sublayer is disabled
    /// (kernel width zero), so this list is present but empty; it is still
    /// distinct from an absent [`BlockState`].
    pub conv: Vec<Tensor>,
    /// Cell sub-state.
    pub cell: CellState,
}

/// Per-block state, tagged by block kind.
///
/// The two variants differ in arity and meaning, so they are kept as a
/// tagged union rather than a uniform tensor tuple.
#[derive(Debug, Clone)]
pub enum BlockState {
    /// State of an sLSTM block: `(conv sub-state, cell sub-state)`.
    Recurrent(RecurrentState),
    /// State of an mLSTM block.
    Memory(MemoryState),
}

/// Per-block state for the whole stack, indexed by block position.
///
/// Entries are `None` until the block has run once.  After any
/// [`MixedBlockStack::forward`] call the map covers exactly
/// `0..num_blocks` with all entries present.
pub type StackState = Vec<Option<BlockState>>;

// ---------------------------------------------------------------------------
// Block variants
// ---------------------------------------------------------------------------

/// Recurrent (sLSTM) block: `norm -> cell -> residual -> norm -> ffn -> residual`.
pub struct RecurrentBlock {
    /// Normalization before the cell.
    norm_cell: RmsNorm,
    /// The sLSTM cell.
    cell: SlstmCell,
    /// Normalization before the feed-forward sublayer.
    norm_ffn: RmsNorm,
    /// Feed-forward sublayer.
    ffn: FeedForward,
}

impl RecurrentBlock {
    /// Load a recurrent block from weights.
    ///
    /// Weight prefix layout: `norm_cell`, `cell`, `norm_ffn`, `ffn`.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(config: &StackConfig, backend: KernelBackend, vb: VarBuilder<'_>) -> Result<Self> {
        let embed = config.embedding_dim;
        let eps = config.norm_eps;
        let bias = config.use_bias;
        Ok(Self {
            norm_cell: RmsNorm::load(embed, eps, bias, vb.pp("norm_cell"))?,
            cell: SlstmCell::load(config, backend, vb.pp("cell"))?,
            norm_ffn: RmsNorm::load(embed, eps, bias, vb.pp("norm_ffn"))?,
            ffn: FeedForward::load(config, vb.pp("ffn"))?,
        })
    }

    /// Forward pass with residual connections around both sublayers.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embedding_dim]`
    /// - returns: `(x', state')` with `x'` the same shape as `x`
    ///
    /// # Errors
    ///
    /// Propagates cell and tensor operation errors.
    pub fn forward(
        &self,
        x: &Tensor,
        state: Option<&RecurrentState>,
    ) -> Result<(Tensor, RecurrentState)> {
        let (y, cell_state) = self
            .cell
            .forward(&self.norm_cell.forward(x)?, state.map(|s| &s.cell))?;
        let x = (x + y)?;

        let y = self.ffn.forward(&self.norm_ffn.forward(&x)?)?;
        let x = (x + y)?;

        Ok((
            x,
            RecurrentState {
                conv: Vec::new(),
                cell: cell_state,
            },
        ))
    }
}

/// Memory (mLSTM) block: same residual shape around a matrix-memory layer.
pub struct MemoryBlock {
    /// Normalization before the memory layer.
    norm_cell: RmsNorm,
    /// The matrix-memory layer.
    mem: MatrixMemory,
    /// Normalization before the feed-forward sublayer.
    norm_ffn: RmsNorm,
    /// Feed-forward sublayer.
    ffn: FeedForward,
}

impl MemoryBlock {
    /// Load a memory block from weights.
    ///
    /// Weight prefix layout: `norm_cell`, `mem`, `norm_ffn`, `ffn`.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(config: &StackConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let embed = config.embedding_dim;
        let eps = config.norm_eps;
        let bias = config.use_bias;
        Ok(Self {
            norm_cell: RmsNorm::load(embed, eps, bias, vb.pp("norm_cell"))?,
            mem: MatrixMemory::load(config, vb.pp("mem"))?,
            norm_ffn: RmsNorm::load(embed, eps, bias, vb.pp("norm_ffn"))?,
            ffn: FeedForward::load(config, vb.pp("ffn"))?,
        })
    }

    /// Forward pass with residual connections around both sublayers.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embedding_dim]`
    /// - returns: `(x', state')` with `x'` the same shape as `x`
    ///
    /// # Errors
    ///
    /// Propagates tensor operation errors.
    pub fn forward(
        &self,
        x: &Tensor,
        state: Option<&MemoryState>,
    ) -> Result<(Tensor, MemoryState)> {
        let (y, mem_state) = self.mem.forward(&self.norm_cell.forward(x)?, state)?;
        let x = (x + y)?;

        let y = self.ffn.forward(&self.norm_ffn.forward(&x)?)?;
        let x = (x + y)?;

        Ok((x, mem_state))
    }
}

/// A block variant: a closed sum over the two block kinds.
enum Block {
    /// sLSTM block.
    Recurrent(RecurrentBlock),
    /// mLSTM block.
    Memory(MemoryBlock),
}

// ---------------------------------------------------------------------------
// MixedBlockStack
// ---------------------------------------------------------------------------

/// Ordered sequence of block variants with threaded per-block state.
pub struct MixedBlockStack {
    /// The blocks, in invocation order.
    blocks: Vec<Block>,
    /// Optional output normalization.
    out_norm: Option<RmsNorm>,
}

impl MixedBlockStack {
    /// Load the stack from weights.
    ///
    /// Weight prefix layout: `blocks.{i}.*` per block, plus `out_norm`
    /// when configured.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Config`] on an invalid configuration and
    /// [`ForecastError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(config: &StackConfig, backend: KernelBackend, vb: VarBuilder<'_>) -> Result<Self> {
        config.validate()?;

        let kinds = config.block_kinds();
        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(kinds.len());
        for (i, kind) in kinds.iter().enumerate() {
            let vb_block = vb_blocks.pp(i);
            blocks.push(match kind {
                BlockKind::Recurrent => {
                    Block::Recurrent(RecurrentBlock::load(config, backend, vb_block)?)
                }
                BlockKind::Memory => Block::Memory(MemoryBlock::load(config, vb_block)?),
            });
        }

        let out_norm = if config.add_out_norm {
            Some(RmsNorm::load(
                config.embedding_dim,
                config.norm_eps,
                config.use_bias,
                vb.pp("out_norm"),
            )?)
        } else {
            None
        };

        Ok(Self { blocks, out_norm })
    }

    /// Number of blocks in the stack.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Run all blocks in index order, threading per-block state.
    ///
    /// When `state` is `None` a fresh all-`None` state map is created.
    /// Every completed block invocation **overwrites** its entry in the
    /// map, including on continuation calls where a previous state was
    /// already present; callers that want cross-window continuation feed
    /// the returned map back in.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embedding_dim]`
    /// - returns: `(x', state')` with `x'` the same shape as `x` and
    ///   `state'` covering all block indices with present entries
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::Config`] when a supplied state map has the
    /// wrong length or a variant mismatching its block kind; propagates
    /// block errors otherwise.  State entries are only replaced after a
    /// fully-completed block invocation, so an error leaves no partially
    /// written entry behind.
    pub fn forward(
        &self,
        x: &Tensor,
        state: Option<StackState>,
    ) -> Result<(Tensor, StackState)> {
        let mut state = state.unwrap_or_else(|| vec![None; self.blocks.len()]);
        if state.len() != self.blocks.len() {
            return Err(ForecastError::Config(format!(
                "state map has {} entries for {} blocks",
                state.len(),
                self.blocks.len()
            )));
        }

        let mut x = x.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            let new_state = match block {
                Block::Recurrent(b) => {
                    let prev = match &state[i] {
                        Some(BlockState::Recurrent(s)) => Some(s),
                        None => None,
                        Some(BlockState::Memory(_)) => {
                            return Err(ForecastError::Config(format!(
                                "block {i} is recurrent but its state entry is a memory state"
                            )));
                        }
                    };
                    let (x_new, s_new) = b.forward(&x, prev)?;
                    x = x_new;
                    BlockState::Recurrent(s_new)
                }
                Block::Memory(b) => {
                    let prev = match &state[i] {
                        Some(BlockState::Memory(s)) => Some(s),
                        None => None,
                        Some(BlockState::Recurrent(_)) => {
                            return Err(ForecastError::Config(format!(
                                "block {i} is a memory block but its state entry is recurrent"
                            )));
                        }
                    };
                    let (x_new, s_new) = b.forward(&x, prev)?;
                    x = x_new;
                    BlockState::Memory(s_new)
                }
            };
            state[i] = Some(new_state);
        }

        if let Some(norm) = &self.out_norm {
            x = norm.forward(&x)?;
        }

        Ok((x, state))
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

    fn test_config() -> StackConfig {
        StackConfig {
            num_blocks: 3,
            embedding_dim: 8,
            num_heads: 2,
            norm_eps: 1e-6,
            use_bias: false,
            ffn_proj_factor: 2.0,
            recurrent_at: vec![0, 2],
            all_recurrent: false,
            add_out_norm: true,
        }
    }

    fn zeros_stack(config: &StackConfig) -> MixedBlockStack {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        MixedBlockStack::load(config, KernelBackend::Portable, vb).unwrap()
    }

    #[test]
    fn state_map_complete_after_first_forward() {
        let config = test_config();
        let stack = zeros_stack(&config);
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();

        let (y, state) = stack.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[1, 4, 8]);
        assert_eq!(state.len(), config.num_blocks);
        assert!(state.iter().all(Option::is_some));
    }

    #[test]
    fn state_variants_match_block_kinds() {
        let config = test_config();
        let stack = zeros_stack(&config);
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();

        let (_, state) = stack.forward(&x, None).unwrap();
        for (entry, kind) in state.iter().zip(config.block_kinds()) {
            match (entry, kind) {
                (Some(BlockState::Recurrent(s)), BlockKind::Recurrent) => {
                    // Conv sublayer disabled: present-but-empty sub-state.
                    assert!(s.conv.is_empty());
                }
                (Some(BlockState::Memory(_)), BlockKind::Memory) => {}
                other => panic!("state variant mismatch: {other:?}"),
            }
        }
    }

    #[test]
    fn continuation_overwrites_state() {
        let config = test_config();
        let stack = zeros_stack(&config);
        let x = Tensor::randn(0.0_f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();

        let (_, s1) = stack.forward(&x, None).unwrap();
        let m1: Vec<f32> = match s1[0].as_ref().unwrap() {
            BlockState::Recurrent(s) => s.cell.n.flatten_all().unwrap().to_vec1().unwrap(),
            BlockState::Memory(_) => panic!("block 0 should be recurrent"),
        };
        let (_, s2) = stack.forward(&x, Some(s1)).unwrap();
        let m2: Vec<f32> = match s2[0].as_ref().unwrap() {
            BlockState::Recurrent(s) => s.cell.n.flatten_all().unwrap().to_vec1().unwrap(),
            BlockState::Memory(_) => panic!("block 0 should be recurrent"),
        };
        // The normalizer accumulates across calls, so the continuation call
        // must have stored a fresh state rather than keeping the old one.
        assert_ne!(m1, m2);
    }

    #[test]
    fn wrong_state_length_is_rejected() {
        let config = test_config();
        let stack = zeros_stack(&config);
        let x = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let bad: StackState = vec![None; 2];
        assert!(stack.forward(&x, Some(bad)).is_err());
    }
}
