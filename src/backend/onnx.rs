//! ONNX Runtime backend for exported DeepFilterNet models.
//!
//! Expects `enc.onnx`, `erb_dec.onnx` and `df_dec.onnx` in the model
//! directory (the layout of the official DeepFilterNet ONNX export).

use super::{BackendError, InferenceBackend, Tensor, TensorMap, GRAPHS};
use crate::{DfError, EnhancerConfig, Result};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputValue};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// Global ORT initialization result, computed once per process.
static ORT_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

#[cfg(target_os = "windows")]
const ORT_DYLIB: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_DYLIB: &str = "libonnxruntime.dylib";
#[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
const ORT_DYLIB: &str = "libonnxruntime.so";

/// Where to load ONNX Runtime from, in order: `ORT_DYLIB_PATH`, the runtime
/// fetched by the build script, then the platform's library search path.
fn ort_library_path() -> PathBuf {
    if let Some(path) = std::env::var_os("ORT_DYLIB_PATH") {
        return PathBuf::from(path);
    }
    if let Some(dir) = option_env!("DF_STREAM_ORT_LIB_DIR") {
        let bundled = Path::new(dir).join(ORT_DYLIB);
        if bundled.exists() {
            return bundled;
        }
        log::debug!("{} missing, falling back to the system library path", bundled.display());
    }
    PathBuf::from(ORT_DYLIB)
}

fn init_ort() -> Result<()> {
    let status = ORT_INIT.get_or_init(|| {
        let path = ort_library_path().to_string_lossy().into_owned();
        log::debug!("loading ONNX Runtime from {}", path);
        match ort::init_from(path.clone()) {
            Ok(builder) => {
                let _ = builder.with_name("df-stream").commit();
                Ok(())
            }
            Err(e) => Err(format!("Failed to load ONNX Runtime from '{}': {}", path, e)),
        }
    });
    status.clone().map_err(DfError::Config)
}

struct Graph {
    session: Session,
    outputs: Vec<String>,
}

pub struct OnnxBackend {
    graphs: HashMap<String, Graph>,
}

impl OnnxBackend {
    /// Open all three graphs of `model_dir`.
    ///
    /// `intra_threads` controls ONNX Runtime's intra-op parallelism; use 1-2
    /// for real-time audio to minimize latency jitter.
    pub fn open(model_dir: &Path, config: &EnhancerConfig, intra_threads: Option<usize>) -> Result<Self> {
        init_ort()?;

        let build_session = |path: std::path::PathBuf| -> Result<Session> {
            let mut builder = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?;

            if let Some(threads) = intra_threads {
                builder = builder.with_intra_threads(threads)?;
            }

            #[cfg(feature = "coreml")]
            {
                use ort::execution_providers::CoreMLExecutionProvider;
                builder = builder.with_execution_providers([CoreMLExecutionProvider::default().build()])?;
                log::info!("CoreML execution provider registered");
            }

            #[cfg(feature = "cuda")]
            {
                use ort::execution_providers::CUDAExecutionProvider;
                builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
                log::info!("CUDA execution provider registered");
            }

            Ok(builder.commit_from_file(path)?)
        };

        let mut graphs = HashMap::new();
        for name in GRAPHS {
            let path = model_dir.join(format!("{}.onnx", name));
            if !path.exists() {
                return Err(DfError::Config(format!("{} not found", path.display())));
            }
            let session = build_session(path)?;
            let outputs = session.outputs().iter().map(|o| o.name().to_string()).collect();
            log::debug!("loaded graph '{}'", name);
            graphs.insert(name.to_string(), Graph { session, outputs });
        }

        let has_h0 = graphs
            .get(super::ENCODER)
            .is_some_and(|g| g.session.inputs().iter().any(|i| i.name() == "h0"));
        if config.stateful != has_h0 {
            return Err(DfError::Config(format!(
                "configuration expects a {} encoder but enc.onnx {} an h0 input",
                if config.stateful { "stateful" } else { "stateless" },
                if has_h0 { "has" } else { "has no" },
            )));
        }
        Ok(Self { graphs })
    }
}

impl InferenceBackend for OnnxBackend {
    fn load_graph(&mut self, graph: &str) -> std::result::Result<(), BackendError> {
        if self.graphs.contains_key(graph) {
            Ok(())
        } else {
            Err(BackendError::UnknownGraph(graph.to_string()))
        }
    }

    fn run(&mut self, graph: &str, inputs: TensorMap) -> std::result::Result<TensorMap, BackendError> {
        let runtime = |e: ort::Error| BackendError::Runtime {
            graph: graph.to_string(),
            message: e.to_string(),
        };
        let g = self
            .graphs
            .get_mut(graph)
            .ok_or_else(|| BackendError::UnknownGraph(graph.to_string()))?;

        let mut values: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let shape = tensor.shape().to_vec();
            let value = ort::value::Tensor::from_array((shape, tensor.into_data()))
                .map_err(|e| BackendError::InvalidInput {
                    graph: graph.to_string(),
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            values.push((Cow::Owned(name), value.into_dyn().into()));
        }

        let outputs = g.session.run(values).map_err(runtime)?;
        let mut result = TensorMap::with_capacity(g.outputs.len());
        for name in &g.outputs {
            let (shape, data) = outputs[name.as_str()].try_extract_tensor::<f32>().map_err(runtime)?;
            let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            let tensor = Tensor::new(shape, data.to_vec())
                .map_err(|_| BackendError::malformed(graph, name, "shape does not match data"))?;
            result.insert(name.clone(), tensor);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_path_resolution() {
        std::env::remove_var("ORT_DYLIB_PATH");
        let default = ort_library_path();
        assert!(default.ends_with(ORT_DYLIB), "{}", default.display());
        if let Some(dir) = option_env!("DF_STREAM_ORT_LIB_DIR") {
            let bundled = Path::new(dir).join(ORT_DYLIB);
            if bundled.exists() {
                assert_eq!(default, bundled);
            }
        }

        std::env::set_var("ORT_DYLIB_PATH", "/opt/ort/custom.so");
        assert_eq!(ort_library_path(), PathBuf::from("/opt/ort/custom.so"));
        std::env::remove_var("ORT_DYLIB_PATH");
    }
}
