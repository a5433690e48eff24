//! # df-stream
//!
//! Real-time speech enhancement with the DeepFilterNet pipeline: STFT, ERB and
//! spectral features, a three-graph neural model (encoder, ERB decoder, deep
//! filter decoder), mask application plus per-bin deep filtering, and ISTFT.
//!
//! The model runs behind [`InferenceBackend`], so the pipeline works with the
//! bundled [`SimulatedBackend`], with ONNX Runtime ([`OnnxBackend`], feature
//! `onnx`), or with anything else that can run a named graph on named tensors.
//!
//! ## Quick Start
//!
//! ```ignore
//! use df_stream::{DeepFilterProcessor, EnhancerConfig, SimulatedBackend};
//!
//! let config = EnhancerConfig::default();
//! let mut processor = DeepFilterProcessor::new(SimulatedBackend::from_config(&config), config)?;
//! processor.warmup()?;
//!
//! // 480 samples = 10ms at 48kHz
//! let outcome = processor.process_frame(&input, &mut output);
//! ```
//!
//! ## API Levels
//!
//! - [`DeepFilterProcessor`] - Frame API. You hand it `hop_size` frames and
//!   get one enhanced frame back per call, with a [`FrameOutcome`] saying
//!   whether it was enhanced, bypassed or silenced.
//!
//! - [`StreamEngine`] - Real-time wiring. Two non-blocking rings connect a
//!   capture callback ([`CaptureEndpoint`]) and a render callback
//!   ([`RenderEndpoint`]) to a dedicated processing thread.
//!
//! ## Failure Policy
//!
//! Nothing on the data path returns an error. Invalid samples are zeroed, a
//! frame carrying NaN/Inf becomes silence, and a frame whose inference fails
//! or times out is passed through unprocessed (bypass) at the same latency as
//! enhanced audio. All of it is counted in [`Diagnostics`].
//!
//! ## Logging
//!
//! This crate uses the `log` crate for debug/info/warn messages and never
//! installs a logger itself. Repeated data-path warnings are rate limited.
//!
//! ## Thread Safety
//!
//! Each processor instance is independent and `Send`. Ring endpoints are
//! single-producer/single-consumer and safe to use from audio callbacks.

pub mod backend;
pub mod config;
pub mod deep_filter;
pub mod diagnostics;
pub mod engine;
pub mod features;
pub mod orchestrator;
pub mod processor;
pub mod ring;
pub mod sanitize;
pub mod transform;

pub use backend::{BackendError, InferenceBackend, SimulatedBackend, Tensor, TensorMap, TimedBackend};
pub use config::{EnhancerConfig, FFT_SIZE, HOP_SIZE, NB_DF, NB_ERB, SAMPLE_RATE};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use engine::{CaptureEndpoint, EngineHandle, EngineSnapshot, RenderEndpoint, ResetHandle, StreamEngine};
pub use processor::{BypassReason, DeepFilterProcessor, FrameOutcome};

#[cfg(feature = "onnx")]
pub use backend::OnnxBackend;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DfError {
    #[cfg(feature = "onnx")]
    #[error("ONNX runtime error: {0}")]
    Onnx(#[from] ort::Error),
    #[error("Inference backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DfError>;

// Audio callbacks own the endpoints on their own threads, the processing
// context moves into its worker, and counters are read from anywhere.
const _: () = {
    fn movable<T: Send>() {}
    fn shareable<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn thread_bounds() {
        movable::<DeepFilterProcessor<TimedBackend>>();
        movable::<StreamEngine<SimulatedBackend>>();
        movable::<CaptureEndpoint>();
        movable::<RenderEndpoint>();
        shareable::<Diagnostics>();
        shareable::<ResetHandle>();
        shareable::<ring::RingMonitor>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(FFT_SIZE / 2 + 1, config::FREQ_SIZE);
        assert_eq!(FFT_SIZE, 2 * HOP_SIZE);
    }

    #[test]
    fn test_error_conversions() {
        let e: DfError = BackendError::Unavailable("x".into()).into();
        assert!(matches!(e, DfError::Backend(_)));
        assert!(e.to_string().contains("unavailable"));
    }
}
