use super::{BackendError, InferenceBackend, Tensor, TensorMap, DF_DEC, ERB_DEC, GRAPHS};
use super::{DF_DECODER, ENCODER, ERB_DECODER};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// Channel count of the simulated encoder intermediates.
const SIM_CHANNELS: usize = 4;

/// Deterministic stand-in for the three DeepFilterNet graphs.
///
/// Honors the full tensor contract (names and shapes) so the whole pipeline
/// can run without model weights. Inputs may span any number of time steps
/// `T` and every output carries the same `T`. The mask is a constant gain,
/// the deep filter coefficients are the identity (`1 + 0i` on the tap
/// `lookahead` steps back from the newest), and `h1` is a deterministic
/// function of `h0` and the features.
///
/// Faults can be injected per graph and per call index (0-based, counted per
/// graph): failures, latency, and dropped outputs.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    nb_erb: usize,
    nb_df: usize,
    df_order: usize,
    lookahead: usize,
    hidden_dim: Option<usize>,
    mask_gain: f32,
    lsnr: f32,
    loaded: HashSet<String>,
    calls: HashMap<String, u64>,
    failures: HashSet<(String, u64)>,
    delays: HashMap<(String, u64), Duration>,
    omitted: HashSet<(String, String)>,
    last_inputs: HashMap<String, TensorMap>,
}

impl SimulatedBackend {
    /// `hidden_dim = Some(h)` selects the stateful encoder contract.
    pub fn new(nb_erb: usize, nb_df: usize, df_order: usize, hidden_dim: Option<usize>) -> Self {
        Self {
            nb_erb,
            nb_df,
            df_order,
            lookahead: 0,
            hidden_dim,
            mask_gain: 1.0,
            lsnr: 10.0,
            loaded: HashSet::new(),
            calls: HashMap::new(),
            failures: HashSet::new(),
            delays: HashMap::new(),
            omitted: HashSet::new(),
            last_inputs: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &crate::EnhancerConfig) -> Self {
        let hidden = cfg.stateful.then_some(cfg.enc_hidden_dim);
        Self::new(cfg.nb_erb, cfg.nb_df, cfg.df_order, hidden).with_lookahead(cfg.lookahead())
    }

    /// Place the identity tap `lookahead` steps back from the newest.
    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead.min(self.df_order.saturating_sub(1));
        self
    }

    pub fn with_mask_gain(mut self, gain: f32) -> Self {
        self.mask_gain = gain;
        self
    }

    pub fn with_lsnr(mut self, lsnr: f32) -> Self {
        self.lsnr = lsnr;
        self
    }

    /// Make the `call`-th run of `graph` fail with a runtime error.
    pub fn fail_on_call(mut self, graph: &str, call: u64) -> Self {
        self.failures.insert((graph.to_string(), call));
        self
    }

    /// Make the `call`-th run of `graph` sleep for `delay` before answering.
    pub fn delay_on_call(mut self, graph: &str, call: u64, delay: Duration) -> Self {
        self.delays.insert((graph.to_string(), call), delay);
        self
    }

    /// Leave `output` out of every response of `graph`.
    pub fn omit_output(mut self, graph: &str, output: &str) -> Self {
        self.omitted.insert((graph.to_string(), output.to_string()));
        self
    }

    /// Runs of `graph` so far, failed ones included.
    pub fn calls(&self, graph: &str) -> u64 {
        self.calls.get(graph).copied().unwrap_or(0)
    }

    /// Input `name` of the most recent run of `graph`.
    pub fn last_input(&self, graph: &str, name: &str) -> Option<&Tensor> {
        self.last_inputs.get(graph)?.get(name)
    }

    /// Finite input `name` holding `steps × step` values; returns `steps`.
    fn input<'a>(
        graph: &str,
        inputs: &'a TensorMap,
        name: &str,
        step: usize,
    ) -> Result<(&'a Tensor, usize), BackendError> {
        let invalid = |reason: String| BackendError::InvalidInput {
            graph: graph.to_string(),
            name: name.to_string(),
            reason,
        };
        let t = inputs.get(name).ok_or_else(|| invalid("missing".into()))?;
        if t.is_empty() || t.len() % step != 0 {
            return Err(invalid(format!("expected a multiple of {} values, got {}", step, t.len())));
        }
        if !t.is_finite() {
            return Err(invalid("non-finite values".into()));
        }
        Ok((t, t.len() / step))
    }

    fn encode(&self, inputs: &TensorMap) -> Result<TensorMap, BackendError> {
        let (erb, steps) = Self::input(ENCODER, inputs, "feat_erb", self.nb_erb)?;
        let (spec, spec_steps) = Self::input(ENCODER, inputs, "feat_spec", 2 * self.nb_df)?;
        if spec_steps != steps {
            return Err(BackendError::InvalidInput {
                graph: ENCODER.to_string(),
                name: "feat_spec".into(),
                reason: format!("{} time steps, feat_erb has {}", spec_steps, steps),
            });
        }
        let level = mean_abs(erb.data());
        let spec_level = mean_abs(spec.data());

        let mut out = TensorMap::new();
        let widths = [self.nb_erb, self.nb_erb.div_ceil(2), self.nb_erb.div_ceil(4), self.nb_erb.div_ceil(4)];
        for (i, w) in widths.into_iter().enumerate() {
            let value = level / (i + 1) as f32;
            out.insert(format!("e{}", i), Tensor::filled(vec![1, SIM_CHANNELS, steps, w], value));
        }
        out.insert("c0".into(), Tensor::filled(vec![1, SIM_CHANNELS, steps, self.nb_df], spec_level));
        out.insert("lsnr".into(), Tensor::filled(vec![1, steps, 1], self.lsnr));

        match self.hidden_dim {
            Some(h) => {
                let (h0, _) = Self::input(ENCODER, inputs, "h0", h)?;
                if h0.len() != h {
                    return Err(BackendError::InvalidInput {
                        graph: ENCODER.to_string(),
                        name: "h0".into(),
                        reason: format!("expected {} values, got {}", h, h0.len()),
                    });
                }
                let h1: Vec<f32> = h0
                    .data()
                    .iter()
                    .map(|&x| (0.5 * x + 0.1 * level).tanh())
                    .collect();
                out.insert("emb".into(), Tensor::new(vec![1, steps, h], h1.repeat(steps))?);
                out.insert("h1".into(), Tensor::new(vec![1, 1, h], h1)?);
            }
            None => {
                out.insert("emb".into(), Tensor::filled(vec![1, steps, SIM_CHANNELS], level));
            }
        }
        Ok(out)
    }

    /// Time steps of a decoder call, read from the `[1, T, ..]` embedding.
    fn decoder_steps(graph: &str, inputs: &TensorMap) -> Result<usize, BackendError> {
        inputs
            .get("emb")
            .and_then(|t| t.shape().get(1).copied())
            .filter(|&steps| steps > 0)
            .ok_or_else(|| BackendError::InvalidInput {
                graph: graph.to_string(),
                name: "emb".into(),
                reason: "expected shape [1, T, ..]".into(),
            })
    }

    fn decode_erb(&self, inputs: &TensorMap) -> Result<TensorMap, BackendError> {
        ERB_DEC.check_inputs(inputs)?;
        let steps = Self::decoder_steps(ERB_DECODER, inputs)?;
        let mut out = TensorMap::new();
        out.insert("m".into(), Tensor::filled(vec![1, 1, steps, self.nb_erb], self.mask_gain));
        Ok(out)
    }

    fn decode_df(&self, inputs: &TensorMap) -> Result<TensorMap, BackendError> {
        DF_DEC.check_inputs(inputs)?;
        let steps = Self::decoder_steps(DF_DECODER, inputs)?;
        let order = self.df_order;
        let tap = order.saturating_sub(1 + self.lookahead);
        let mut coefs = vec![0.0f32; steps * self.nb_df * order * 2];
        for bin in coefs.chunks_exact_mut(order * 2) {
            bin[tap * 2] = 1.0;
        }
        let mut out = TensorMap::new();
        out.insert("coefs".into(), Tensor::new(vec![1, steps, self.nb_df, order * 2], coefs)?);
        Ok(out)
    }
}

fn mean_abs(x: &[f32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|v| v.abs()).sum::<f32>() / x.len() as f32
}

impl InferenceBackend for SimulatedBackend {
    fn load_graph(&mut self, graph: &str) -> Result<(), BackendError> {
        if !GRAPHS.contains(&graph) {
            return Err(BackendError::UnknownGraph(graph.to_string()));
        }
        self.loaded.insert(graph.to_string());
        Ok(())
    }

    fn run(&mut self, graph: &str, inputs: TensorMap) -> Result<TensorMap, BackendError> {
        if !self.loaded.contains(graph) {
            return Err(if GRAPHS.contains(&graph) {
                BackendError::Unavailable(format!("graph '{}' not loaded", graph))
            } else {
                BackendError::UnknownGraph(graph.to_string())
            });
        }
        self.last_inputs.insert(graph.to_string(), inputs.clone());
        let counter = self.calls.entry(graph.to_string()).or_insert(0);
        let call = *counter;
        *counter += 1;

        let key = (graph.to_string(), call);
        if let Some(delay) = self.delays.get(&key) {
            std::thread::sleep(*delay);
        }
        if self.failures.contains(&key) {
            return Err(BackendError::Runtime {
                graph: graph.to_string(),
                message: format!("injected failure on call {}", call),
            });
        }

        let mut out = match graph {
            ENCODER => self.encode(&inputs)?,
            ERB_DECODER => self.decode_erb(&inputs)?,
            _ => self.decode_df(&inputs)?,
        };
        out.retain(|name, _| !self.omitted.contains(&(graph.to_string(), name.clone())));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{contract, DF_DECODER};

    fn enc_inputs(erb: f32, h: Option<usize>) -> TensorMap {
        let mut m = TensorMap::new();
        m.insert("feat_erb".into(), Tensor::filled(vec![1, 1, 1, 32], erb));
        m.insert("feat_spec".into(), Tensor::filled(vec![1, 2, 1, 96], 0.1));
        if let Some(h) = h {
            m.insert("h0".into(), Tensor::zeros(vec![1, 1, h]));
        }
        m
    }

    fn loaded(b: SimulatedBackend) -> SimulatedBackend {
        let mut b = b;
        for g in GRAPHS {
            b.load_graph(g).unwrap();
        }
        b
    }

    #[test]
    fn test_encoder_honors_contract() {
        let mut b = loaded(SimulatedBackend::new(32, 96, 5, Some(16)));
        let out = b.run(ENCODER, enc_inputs(0.5, Some(16))).unwrap();
        contract(ENCODER, true).unwrap().check_outputs(&out).unwrap();
        assert_eq!(out["h1"].shape(), &[1, 1, 16]);
        assert_eq!(out["lsnr"].data(), &[10.0]);
    }

    #[test]
    fn test_deterministic() {
        let mut a = loaded(SimulatedBackend::new(32, 96, 5, Some(8)));
        let mut b = loaded(SimulatedBackend::new(32, 96, 5, Some(8)));
        let x = a.run(ENCODER, enc_inputs(0.3, Some(8))).unwrap();
        let y = b.run(ENCODER, enc_inputs(0.3, Some(8))).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_identity_coefficients() {
        let mut b = loaded(SimulatedBackend::new(32, 4, 3, None));
        let mut inputs = TensorMap::new();
        inputs.insert("emb".into(), Tensor::zeros(vec![1, 1, 4]));
        inputs.insert("c0".into(), Tensor::zeros(vec![1, 4, 1, 4]));
        let out = b.run(DF_DECODER, inputs).unwrap();
        let coefs = out["coefs"].data();
        assert_eq!(&coefs[..6], &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_multi_step_window_and_lookahead_tap() {
        let mut b = loaded(SimulatedBackend::new(32, 4, 3, None).with_lookahead(1));
        let mut inputs = TensorMap::new();
        inputs.insert("feat_erb".into(), Tensor::filled(vec![1, 1, 3, 32], 0.2));
        inputs.insert("feat_spec".into(), Tensor::filled(vec![1, 2, 3, 4], 0.1));
        let enc = b.run(ENCODER, inputs).unwrap();
        assert_eq!(enc["lsnr"].shape(), &[1, 3, 1]);
        assert_eq!(enc["e0"].shape(), &[1, SIM_CHANNELS, 3, 32]);
        assert_eq!(b.last_input(ENCODER, "feat_erb").map(|t| t.shape()), Some(&[1, 1, 3, 32][..]));

        let mut dec = TensorMap::new();
        dec.insert("emb".into(), enc["emb"].clone());
        dec.insert("c0".into(), enc["c0"].clone());
        let out = b.run(DF_DECODER, dec).unwrap();
        assert_eq!(out["coefs"].shape(), &[1, 3, 4, 6]);
        assert_eq!(&out["coefs"].data()[..6], &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);

        let mut ragged = TensorMap::new();
        ragged.insert("feat_erb".into(), Tensor::filled(vec![1, 1, 3, 32], 0.2));
        ragged.insert("feat_spec".into(), Tensor::filled(vec![1, 2, 2, 4], 0.1));
        assert!(b.run(ENCODER, ragged).unwrap_err().is_input_error());
    }

    #[test]
    fn test_injected_faults() {
        let mut b = loaded(
            SimulatedBackend::new(32, 96, 5, None)
                .fail_on_call(ENCODER, 1)
                .omit_output(ENCODER, "lsnr"),
        );
        let out = b.run(ENCODER, enc_inputs(0.1, None)).unwrap();
        assert!(!out.contains_key("lsnr"));
        assert!(matches!(b.run(ENCODER, enc_inputs(0.1, None)), Err(BackendError::Runtime { .. })));
        assert!(b.run(ENCODER, enc_inputs(0.1, None)).is_ok());
        assert_eq!(b.calls(ENCODER), 3);
    }

    #[test]
    fn test_input_errors_are_reported_as_such() {
        let mut b = loaded(SimulatedBackend::new(32, 96, 5, Some(8)));
        let err = b.run(ENCODER, enc_inputs(0.1, None)).unwrap_err();
        assert!(err.is_input_error(), "{}", err);
        let err = b.run(ENCODER, enc_inputs(f32::NAN, Some(8))).unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_graph_loading() {
        let mut b = SimulatedBackend::new(32, 96, 5, None);
        assert!(matches!(b.run(ENCODER, TensorMap::new()), Err(BackendError::Unavailable(_))));
        assert_eq!(b.load_graph("bogus"), Err(BackendError::UnknownGraph("bogus".into())));
    }
}
