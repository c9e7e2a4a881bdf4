// SPDX-License-Identifier: MIT OR Apache-2.0

//! # patchcast
//!
//! Zero-shot time-series forecasting in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! patchcast runs pre-trained mixed sLSTM/mLSTM forecasters: context
//! series are scaled and split into patches, pushed through a stack of
//! recurrent and matrix-memory blocks, and decoded into quantile
//! predictions.  Longer horizons are covered autoregressively by feeding
//! NaN future placeholders back into the context.
//!
//! Two numerically equivalent kernel implementations are supported; the
//! checkpoint layout is rewritten at load time to match the one selected
//! (see [`checkpoint`]).

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod cell;
pub mod checkpoint;
pub mod config;
pub mod error;
mod layers;
pub mod memory;
pub mod model;
mod norm;
pub mod stack;
pub mod tokenizer;

pub use backend::KernelBackend;
pub use config::{BlockKind, ModelConfig, StackConfig};
pub use error::{ForecastError, Result};
pub use model::ForecastModel;
pub use stack::{BlockState, MixedBlockStack, StackState};
