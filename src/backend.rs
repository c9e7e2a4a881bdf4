// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recurrent kernel backend selection.
//!
//! The sLSTM cell update exists in two numerically-equivalent
//! implementations that consume different physical weight layouts:
//!
//! - [`Portable`](KernelBackend::Portable) — reference implementation,
//!   runs on any device, consumes gate-major layouts.
//! - [`Accelerated`](KernelBackend::Accelerated) — fused-kernel path,
//!   requires a CUDA device, consumes the interleaved layouts the fused
//!   kernel was trained with.
//!
//! The backend is resolved **once** and passed down at construction; it is
//! never re-read during a forward pass.  [`KernelBackend::from_env`] is a
//! convenience constructor for the `PATCHCAST_NO_CUDA` toggle.

use std::fmt;

use candle_core::Device;

// ---------------------------------------------------------------------------
// KernelBackend
// ---------------------------------------------------------------------------

/// Environment variable that disables the accelerated sLSTM kernel.
pub const NO_CUDA_ENV: &str = "PATCHCAST_NO_CUDA";

/// Which sLSTM kernel implementation the recurrent blocks use.
///
/// Fixed for the lifetime of a model; checkpoints trained under the
/// accelerated kernel must go through the layout converter
/// (see [`checkpoint`](crate::checkpoint)) before being loaded onto the
/// portable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelBackend {
    /// Reference implementation, any device, gate-major weight layout.
    Portable,
    /// Fused kernel path, CUDA only, interleaved weight layout.
    Accelerated,
}

impl fmt::Display for KernelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Portable => write!(f, "portable"),
            Self::Accelerated => write!(f, "accelerated"),
        }
    }
}

impl KernelBackend {
    /// Resolve the backend from the `PATCHCAST_NO_CUDA` environment toggle.
    ///
    /// `"1"`, `"true"` or `"t"` (case-insensitive) select
    /// [`Portable`](Self::Portable); anything else, including an unset
    /// variable, selects [`Accelerated`](Self::Accelerated).
    ///
    /// Call this once and pass the result down; the variable is not
    /// consulted again after construction.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(NO_CUDA_ENV)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "t"))
            .unwrap_or(false);
        if disabled {
            Self::Portable
        } else {
            Self::Accelerated
        }
    }

    /// Whether this backend can run on `device`.
    #[must_use]
    pub fn supports_device(self, device: &Device) -> bool {
        match self {
            Self::Portable => true,
            Self::Accelerated => device.is_cuda(),
        }
    }
}

/// Warn when the selected backend cannot run on the target device.
///
/// The mismatch is non-fatal at load time: the failure is deferred to the
/// first forward pass, which returns
/// [`ForecastError::Backend`](crate::error::ForecastError::Backend).
pub fn check_device(backend: KernelBackend, device: &Device) {
    if !backend.supports_device(device) {
        tracing::warn!(
            "accelerated sLSTM kernel selected but the target device is not a CUDA device; \
             forward passes will fail until the model is moved to CUDA, or set {NO_CUDA_ENV}=1 \
             to use the portable kernel"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portable_supports_cpu() {
        assert!(KernelBackend::Portable.supports_device(&Device::Cpu));
    }

    #[test]
    fn accelerated_rejects_cpu() {
        assert!(!KernelBackend::Accelerated.supports_device(&Device::Cpu));
    }

    #[test]
    fn backend_display() {
        assert_eq!(KernelBackend::Portable.to_string(), "portable");
        assert_eq!(KernelBackend::Accelerated.to_string(), "accelerated");
    }
}
