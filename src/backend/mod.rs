//! Inference backend seam.
//!
//! The pipeline talks to its neural network only through [`InferenceBackend`]:
//! load a graph by name, run it with named input tensors, get named output
//! tensors back. Backend failures are reported distinctly from rejected
//! inputs so callers can tell a broken runtime from a bad frame.

mod simulated;
mod timed;

#[cfg(feature = "onnx")]
mod onnx;

pub use simulated::SimulatedBackend;
pub use timed::TimedBackend;

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;

use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Encoder graph name.
pub const ENCODER: &str = "enc";
/// ERB (mask) decoder graph name.
pub const ERB_DECODER: &str = "erb_dec";
/// Deep-filter (coefficient) decoder graph name.
pub const DF_DECODER: &str = "df_dec";

pub const GRAPHS: [&str; 3] = [ENCODER, ERB_DECODER, DF_DECODER];

/// Required tensor names of one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphContract {
    pub graph: &'static str,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
}

const ENC_STATELESS: GraphContract = GraphContract {
    graph: ENCODER,
    inputs: &["feat_erb", "feat_spec"],
    outputs: &["e0", "e1", "e2", "e3", "emb", "c0", "lsnr"],
};

const ENC_STATEFUL: GraphContract = GraphContract {
    graph: ENCODER,
    inputs: &["feat_erb", "feat_spec", "h0"],
    outputs: &["e0", "e1", "e2", "e3", "emb", "c0", "lsnr", "h1"],
};

const ERB_DEC: GraphContract = GraphContract {
    graph: ERB_DECODER,
    inputs: &["emb", "e3", "e2", "e1", "e0"],
    outputs: &["m"],
};

const DF_DEC: GraphContract = GraphContract {
    graph: DF_DECODER,
    inputs: &["emb", "c0"],
    outputs: &["coefs"],
};

/// Tensor contract of `graph`, or `None` for an unknown graph name.
///
/// Shapes, with `T` the encoder window (decoders answer with the same `T`):
///
/// | graph | inputs | outputs |
/// |---|---|---|
/// | `enc` | `feat_erb [1,1,T,NB_ERB]`, `feat_spec [1,2,T,NB_DF]`, `h0 [1,1,H]` (stateful) | `e0..e3`, `emb`, `c0`, `lsnr [1,T,1]`, `h1 [1,1,H]` (stateful) |
/// | `erb_dec` | `emb`, `e3`, `e2`, `e1`, `e0` | `m [1,1,T,NB_ERB]` |
/// | `df_dec` | `emb`, `c0` | `coefs [1,T,NB_DF,ORDER*2]` |
pub fn contract(graph: &str, stateful: bool) -> Option<GraphContract> {
    match graph {
        ENCODER if stateful => Some(ENC_STATEFUL),
        ENCODER => Some(ENC_STATELESS),
        ERB_DECODER => Some(ERB_DEC),
        DF_DECODER => Some(DF_DEC),
        _ => None,
    }
}

impl GraphContract {
    /// Fail closed unless every required output is present.
    pub fn check_outputs(&self, outputs: &TensorMap) -> Result<(), BackendError> {
        match self.outputs.iter().find(|name| !outputs.contains_key(**name)) {
            Some(name) => Err(BackendError::MissingOutput {
                graph: self.graph.to_string(),
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn check_inputs(&self, inputs: &TensorMap) -> Result<(), BackendError> {
        match self.inputs.iter().find(|name| !inputs.contains_key(**name)) {
            Some(name) => Err(BackendError::InvalidInput {
                graph: self.graph.to_string(),
                name: name.to_string(),
                reason: "missing".into(),
            }),
            None => Ok(()),
        }
    }
}

// ─────────────────────── Tensor ────────────────────────────

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, BackendError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(BackendError::Malformed {
                graph: String::new(),
                name: String::new(),
                reason: format!("shape {:?} needs {} values, got {}", shape, expected, data.len()),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![value; len] }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

pub type TensorMap = HashMap<String, Tensor>;

// ─────────────────────── BackendError ────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("inference backend unavailable: {0}")]
    Unavailable(String),
    #[error("unknown graph '{0}'")]
    UnknownGraph(String),
    #[error("graph '{graph}' failed: {message}")]
    Runtime { graph: String, message: String },
    #[error("graph '{graph}' exceeded its {timeout:?} deadline")]
    Timeout { graph: String, timeout: Duration },
    #[error("graph '{graph}' not started: backend still busy with an abandoned call")]
    Busy { graph: String },
    #[error("graph '{graph}' did not return required output '{name}'")]
    MissingOutput { graph: String, name: String },
    #[error("graph '{graph}' returned malformed '{name}': {reason}")]
    Malformed { graph: String, name: String, reason: String },
    #[error("graph '{graph}' rejected input '{name}': {reason}")]
    InvalidInput { graph: String, name: String, reason: String },
}

impl BackendError {
    /// The request was rejected, the backend itself is healthy.
    pub fn is_input_error(&self) -> bool {
        matches!(self, BackendError::InvalidInput { .. })
    }

    /// The deadline was missed, in this call or by an earlier one that still
    /// occupies the backend.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout { .. } | BackendError::Busy { .. })
    }

    pub(crate) fn malformed(graph: &str, name: &str, reason: impl Into<String>) -> Self {
        BackendError::Malformed {
            graph: graph.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

// ─────────────────────── InferenceBackend ────────────────────────────

pub trait InferenceBackend {
    /// Make `graph` ready to run. Unknown names fail with
    /// [`BackendError::UnknownGraph`].
    fn load_graph(&mut self, graph: &str) -> Result<(), BackendError>;

    fn run(&mut self, graph: &str, inputs: TensorMap) -> Result<TensorMap, BackendError>;

    /// Run `graph`, failing with [`BackendError::Timeout`] when the call takes
    /// longer than `timeout`.
    ///
    /// The provided method only detects overruns after the fact; backends
    /// that can abandon a call in flight override it (see [`TimedBackend`]).
    fn run_with_deadline(
        &mut self,
        graph: &str,
        inputs: TensorMap,
        timeout: Duration,
    ) -> Result<TensorMap, BackendError> {
        let start = Instant::now();
        let outputs = self.run(graph, inputs)?;
        if start.elapsed() > timeout {
            return Err(BackendError::Timeout { graph: graph.to_string(), timeout });
        }
        Ok(outputs)
    }
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn load_graph(&mut self, graph: &str) -> Result<(), BackendError> {
        (**self).load_graph(graph)
    }

    fn run(&mut self, graph: &str, inputs: TensorMap) -> Result<TensorMap, BackendError> {
        (**self).run(graph, inputs)
    }

    fn run_with_deadline(
        &mut self,
        graph: &str,
        inputs: TensorMap,
        timeout: Duration,
    ) -> Result<TensorMap, BackendError> {
        (**self).run_with_deadline(graph, inputs, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_checked() {
        assert!(Tensor::new(vec![1, 2, 3], vec![0.0; 6]).is_ok());
        let err = Tensor::new(vec![1, 2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
        assert_eq!(Tensor::zeros(vec![1, 1, 4]).len(), 4);
    }

    #[test]
    fn test_contract_check_outputs_fails_closed() {
        let c = contract(ENCODER, true).unwrap();
        let mut outputs: TensorMap = c
            .outputs
            .iter()
            .map(|n| (n.to_string(), Tensor::zeros(vec![1])))
            .collect();
        assert!(c.check_outputs(&outputs).is_ok());
        outputs.remove("c0");
        assert_eq!(
            c.check_outputs(&outputs),
            Err(BackendError::MissingOutput { graph: "enc".into(), name: "c0".into() })
        );
        assert!(contract("nope", false).is_none());
        assert!(!contract(ENCODER, false).unwrap().inputs.contains(&"h0"));
    }

    #[test]
    fn test_error_classes() {
        let input = BackendError::InvalidInput { graph: "enc".into(), name: "h0".into(), reason: "x".into() };
        assert!(input.is_input_error());
        let timeout = BackendError::Timeout { graph: "enc".into(), timeout: Duration::from_millis(5) };
        assert!(timeout.is_timeout() && !timeout.is_input_error());
        assert!(BackendError::Busy { graph: "enc".into() }.is_timeout());
        assert!(!BackendError::Unavailable("gone".into()).is_input_error());
    }
}
