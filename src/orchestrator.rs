//! Three-stage inference: encoder, then the ERB (mask) and deep-filter
//! (coefficient) decoder heads.
//!
//! [`ModelState`] carries the recurrent tensors and the encoder's input
//! context across frames. A frame that fails at any stage leaves it exactly
//! as it was; the new state is committed only once all three graphs have
//! answered.

use crate::backend::{contract, BackendError, GraphContract, InferenceBackend, Tensor, TensorMap};
use crate::backend::{DF_DECODER, ENCODER, ERB_DECODER};
use crate::features::ErbFilterbank;
use crate::EnhancerConfig;
use num_complex::Complex32;
use std::fmt;
use std::time::{Duration, Instant};

/// Per-frame state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Encoding,
    ErbDecoding,
    DfDecoding,
    Ready,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Encoding => "encoding",
            Stage::ErbDecoding => "erb decoding",
            Stage::DfDecoding => "df decoding",
            Stage::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// A frame whose inference did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceFailure {
    pub stage: Stage,
    pub error: BackendError,
}

impl fmt::Display for InferenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for InferenceFailure {}

/// Encoder intermediates (`e0..e3`, `emb`, `c0`) and its speech SNR estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutput {
    tensors: TensorMap,
    lsnr: f32,
}

impl EncoderOutput {
    pub fn lsnr(&self) -> f32 {
        self.lsnr
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}

/// Feature frames that precede the current one in the encoder window,
/// oldest first. ERB rows are `nb_erb` long, spectral rows planar
/// `[re × nb_df, im × nb_df]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureContext {
    erb: Vec<f32>,
    spec: Vec<f32>,
    frames: usize,
}

impl FeatureContext {
    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// State carried from one frame to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelState {
    hidden: Option<Tensor>,
    last: Option<EncoderOutput>,
    context: FeatureContext,
    steps: u64,
}

impl ModelState {
    /// Encoder hidden state fed back as `h0`. `None` before the first frame
    /// and for stateless encoders.
    pub fn hidden(&self) -> Option<&Tensor> {
        self.hidden.as_ref()
    }

    pub fn last_output(&self) -> Option<&EncoderOutput> {
        self.last.as_ref()
    }

    pub fn context(&self) -> &FeatureContext {
        &self.context
    }

    /// Successful frames since the last reset.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

// ─────────────────────── SpectralMask ────────────────────────────

/// Per-bin real gain in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralMask {
    gains: Vec<f32>,
    repaired: usize,
}

impl SpectralMask {
    pub fn unity(freq_size: usize) -> Self {
        Self { gains: vec![1.0; freq_size], repaired: 0 }
    }

    pub fn zeros(freq_size: usize) -> Self {
        Self { gains: vec![0.0; freq_size], repaired: 0 }
    }

    /// Expand per-band gains onto linear bins. NaN gains become 1 and the rest
    /// are clamped into `[0, 1]`; both count as repaired.
    pub fn from_bands(filterbank: &ErbFilterbank, bands: &[f32]) -> Self {
        let mut repaired = 0;
        let clean: Vec<f32> = bands
            .iter()
            .map(|&g| {
                if g.is_nan() {
                    repaired += 1;
                    1.0
                } else if !(0.0..=1.0).contains(&g) {
                    repaired += 1;
                    g.clamp(0.0, 1.0)
                } else {
                    g
                }
            })
            .collect();
        let mut gains = vec![0.0; filterbank.freq_size()];
        filterbank.expand(&clean, &mut gains);
        Self { gains, repaired }
    }

    pub fn gain(&self, bin: usize) -> f32 {
        self.gains[bin]
    }

    pub fn gains(&self) -> &[f32] {
        &self.gains
    }

    pub fn len(&self) -> usize {
        self.gains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gains.is_empty()
    }

    /// Band gains that had to be repaired.
    pub fn repaired(&self) -> usize {
        self.repaired
    }
}

// ─────────────────────── FilterCoefficients ────────────────────────────

/// Complex deep-filter taps laid out `[bin][tap]`, tap 0 being the oldest
/// time step.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCoefficients {
    nb_df: usize,
    order: usize,
    taps: Vec<Complex32>,
}

impl FilterCoefficients {
    /// Pass-through filter: `1 + 0i` on the tap aligned with the target row
    /// (`order - 1 - lookahead`), all others zero.
    pub fn identity(nb_df: usize, order: usize, lookahead: usize) -> Self {
        let mut taps = vec![Complex32::new(0.0, 0.0); nb_df * order];
        let at = order.saturating_sub(1 + lookahead);
        for bin in taps.chunks_exact_mut(order) {
            bin[at] = Complex32::new(1.0, 0.0);
        }
        Self { nb_df, order, taps }
    }

    /// Interleaved `[bin][tap][re, im]` values as produced by the decoder.
    pub fn from_interleaved(nb_df: usize, order: usize, data: &[f32]) -> Option<Self> {
        let needed = nb_df.checked_mul(order)?.checked_mul(2)?;
        if data.len() < needed {
            return None;
        }
        let taps = data[..needed]
            .chunks_exact(2)
            .map(|c| Complex32::new(c[0], c[1]))
            .collect();
        Some(Self { nb_df, order, taps })
    }

    pub fn nb_df(&self) -> usize {
        self.nb_df
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Tap `tap` of `bin`, `None` when out of bounds.
    pub fn tap(&self, bin: usize, tap: usize) -> Option<Complex32> {
        if tap >= self.order {
            return None;
        }
        let idx = bin.checked_mul(self.order)?.checked_add(tap)?;
        self.taps.get(idx).copied()
    }
}

/// Everything the synthesizer needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInference {
    pub lsnr: f32,
    pub mask: SpectralMask,
    pub coefs: FilterCoefficients,
}

// ─────────────────────── InferenceOrchestrator ────────────────────────────

struct GraphRunner<B> {
    backend: B,
    enc: GraphContract,
    erb_dec: GraphContract,
    df_dec: GraphContract,
    nb_erb: usize,
    nb_df: usize,
    df_order: usize,
    window: usize,
    hidden_dim: Option<usize>,
    filterbank: ErbFilterbank,
}

impl<B: InferenceBackend> GraphRunner<B> {
    fn call(
        &mut self,
        contract: GraphContract,
        inputs: TensorMap,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<TensorMap, BackendError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BackendError::Timeout { graph: contract.graph.to_string(), timeout });
        }
        let outputs = self.backend.run_with_deadline(contract.graph, inputs, remaining)?;
        contract.check_outputs(&outputs)?;
        Ok(outputs)
    }

    fn encode(
        &mut self,
        erb: &[f32],
        spec: &[f32],
        prior: &ModelState,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(EncoderOutput, ModelState), BackendError> {
        assert_eq!(erb.len(), self.nb_erb, "ERB feature length");
        assert_eq!(spec.len(), 2 * self.nb_df, "spectral feature length");

        let (nb_erb, nb_df, window) = (self.nb_erb, self.nb_df, self.window);
        let ctx = &prior.context;
        let kept = ctx.frames.min(window - 1);
        let pad = window - 1 - kept;
        let mut erb_rows = ctx.erb[(ctx.frames - kept) * nb_erb..].to_vec();
        erb_rows.extend_from_slice(erb);
        let mut spec_rows = ctx.spec[(ctx.frames - kept) * 2 * nb_df..].to_vec();
        spec_rows.extend_from_slice(spec);

        // [1, 1, T, nb_erb] and [1, 2, T, nb_df], zero-padded on the left
        let mut feat_erb = vec![0.0f32; window * nb_erb];
        feat_erb[pad * nb_erb..].copy_from_slice(&erb_rows);
        let mut feat_spec = vec![0.0f32; 2 * window * nb_df];
        for (i, row) in spec_rows.chunks_exact(2 * nb_df).enumerate() {
            let re = (pad + i) * nb_df;
            let im = (window + pad + i) * nb_df;
            feat_spec[re..re + nb_df].copy_from_slice(&row[..nb_df]);
            feat_spec[im..im + nb_df].copy_from_slice(&row[nb_df..]);
        }

        let mut inputs = TensorMap::new();
        inputs.insert("feat_erb".into(), Tensor::new(vec![1, 1, window, nb_erb], feat_erb)?);
        inputs.insert("feat_spec".into(), Tensor::new(vec![1, 2, window, nb_df], feat_spec)?);
        if let Some(h) = self.hidden_dim {
            let h0 = prior
                .hidden
                .clone()
                .unwrap_or_else(|| Tensor::zeros(vec![1, 1, h]));
            inputs.insert("h0".into(), h0);
        }

        let mut outputs = self.call(self.enc, inputs, deadline, timeout)?;

        let lsnr = outputs
            .get("lsnr")
            .and_then(|t| t.data().last().copied())
            .filter(|v| v.is_finite())
            .ok_or_else(|| BackendError::malformed(ENCODER, "lsnr", "empty or non-finite"))?;

        let hidden = match self.hidden_dim {
            Some(h) => {
                let h1 = outputs
                    .remove("h1")
                    .ok_or_else(|| BackendError::malformed(ENCODER, "h1", "missing"))?;
                if h1.len() != h || !h1.is_finite() {
                    return Err(BackendError::malformed(
                        ENCODER,
                        "h1",
                        format!("expected {} finite values, got {}", h, h1.len()),
                    ));
                }
                Some(h1)
            }
            None => None,
        };

        let carried = (kept + 1).min(window - 1);
        let context = FeatureContext {
            erb: erb_rows[(kept + 1 - carried) * nb_erb..].to_vec(),
            spec: spec_rows[(kept + 1 - carried) * 2 * nb_df..].to_vec(),
            frames: carried,
        };
        let output = EncoderOutput { tensors: outputs, lsnr };
        let state = ModelState {
            hidden,
            last: Some(output.clone()),
            context,
            steps: prior.steps + 1,
        };
        Ok((output, state))
    }

    fn forward(&self, contract: GraphContract, enc: &EncoderOutput) -> Result<TensorMap, BackendError> {
        contract
            .inputs
            .iter()
            .map(|&name| {
                enc.tensor(name)
                    .cloned()
                    .map(|t| (name.to_string(), t))
                    .ok_or_else(|| BackendError::InvalidInput {
                        graph: contract.graph.to_string(),
                        name: name.to_string(),
                        reason: "encoder output missing".into(),
                    })
            })
            .collect()
    }

    fn decode_mask(
        &mut self,
        enc: &EncoderOutput,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<SpectralMask, BackendError> {
        let inputs = self.forward(self.erb_dec, enc)?;
        let outputs = self.call(self.erb_dec, inputs, deadline, timeout)?;
        let m = &outputs["m"];
        let bands = last_step(m.data(), self.nb_erb).ok_or_else(|| {
            BackendError::malformed(
                ERB_DECODER,
                "m",
                format!("expected a multiple of {} bands, got {}", self.nb_erb, m.len()),
            )
        })?;
        Ok(SpectralMask::from_bands(&self.filterbank, bands))
    }

    fn decode_coefficients(
        &mut self,
        enc: &EncoderOutput,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<FilterCoefficients, BackendError> {
        let inputs = self.forward(self.df_dec, enc)?;
        let outputs = self.call(self.df_dec, inputs, deadline, timeout)?;
        let coefs = &outputs["coefs"];
        let step = self.nb_df * self.df_order * 2;
        last_step(coefs.data(), step)
            .and_then(|data| FilterCoefficients::from_interleaved(self.nb_df, self.df_order, data))
            .ok_or_else(|| {
                BackendError::malformed(
                    DF_DECODER,
                    "coefs",
                    format!("expected a multiple of {} values, got {}", step, coefs.len()),
                )
            })
    }
}

/// Final time step of a `[.., T, step]` output, `None` unless `data` holds a
/// whole number of steps.
fn last_step(data: &[f32], step: usize) -> Option<&[f32]> {
    if step == 0 || data.is_empty() || data.len() % step != 0 {
        return None;
    }
    Some(&data[data.len() - step..])
}

/// Drives the encoder and both decoder heads and owns the [`ModelState`].
pub struct InferenceOrchestrator<B> {
    graphs: GraphRunner<B>,
    state: ModelState,
    stage: Stage,
}

impl<B: InferenceBackend> InferenceOrchestrator<B> {
    /// Load the three graphs on `backend`.
    pub fn new(mut backend: B, config: &EnhancerConfig, filterbank: ErbFilterbank) -> Result<Self, BackendError> {
        let stateful = config.stateful;
        let lookup = |g: &str| contract(g, stateful).ok_or_else(|| BackendError::UnknownGraph(g.to_string()));
        let (enc, erb_dec, df_dec) = (lookup(ENCODER)?, lookup(ERB_DECODER)?, lookup(DF_DECODER)?);
        for c in [enc, erb_dec, df_dec] {
            backend.load_graph(c.graph)?;
        }
        let window = config.enc_window().max(1);
        log::debug!(
            "inference graphs loaded ({} encoder, {} frame window)",
            if stateful { "stateful" } else { "stateless" },
            window
        );
        Ok(Self {
            graphs: GraphRunner {
                backend,
                enc,
                erb_dec,
                df_dec,
                nb_erb: config.nb_erb,
                nb_df: config.nb_df,
                df_order: config.df_order,
                window,
                hidden_dim: stateful.then_some(config.enc_hidden_dim),
                filterbank,
            },
            state: ModelState::default(),
            stage: Stage::Idle,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.graphs.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.graphs.backend
    }

    /// Run the encoder against `prior` without touching the carried state.
    pub fn encode(
        &mut self,
        erb: &[f32],
        spec: &[f32],
        prior: &ModelState,
        timeout: Duration,
    ) -> Result<(EncoderOutput, ModelState), BackendError> {
        self.graphs.encode(erb, spec, prior, Instant::now() + timeout, timeout)
    }

    pub fn decode_mask(&mut self, enc: &EncoderOutput, timeout: Duration) -> Result<SpectralMask, BackendError> {
        self.graphs.decode_mask(enc, Instant::now() + timeout, timeout)
    }

    pub fn decode_coefficients(
        &mut self,
        enc: &EncoderOutput,
        timeout: Duration,
    ) -> Result<FilterCoefficients, BackendError> {
        self.graphs.decode_coefficients(enc, Instant::now() + timeout, timeout)
    }

    /// Run all three stages for one frame within `timeout` overall and commit
    /// the new state on success.
    pub fn infer_frame(
        &mut self,
        erb: &[f32],
        spec: &[f32],
        timeout: Duration,
    ) -> Result<FrameInference, InferenceFailure> {
        let deadline = Instant::now() + timeout;
        let result = self.run_stages(erb, spec, deadline, timeout);
        match result {
            Ok((inference, next)) => {
                self.state = next;
                self.stage = Stage::Idle;
                Ok(inference)
            }
            Err(error) => {
                let stage = self.stage;
                self.stage = Stage::Idle;
                Err(InferenceFailure { stage, error })
            }
        }
    }

    fn run_stages(
        &mut self,
        erb: &[f32],
        spec: &[f32],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(FrameInference, ModelState), BackendError> {
        self.stage = Stage::Encoding;
        let (enc, next) = self.graphs.encode(erb, spec, &self.state, deadline, timeout)?;
        self.stage = Stage::ErbDecoding;
        let mask = self.graphs.decode_mask(&enc, deadline, timeout)?;
        self.stage = Stage::DfDecoding;
        let coefs = self.graphs.decode_coefficients(&enc, deadline, timeout)?;
        self.stage = Stage::Ready;
        Ok((FrameInference { lsnr: enc.lsnr, mask, coefs }, next))
    }

    /// Drop all carried state.
    pub fn reset(&mut self) {
        self.state = ModelState::default();
        self.stage = Stage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::config::{FREQ_SIZE, NB_DF, NB_ERB, SAMPLE_RATE};

    fn filterbank() -> ErbFilterbank {
        ErbFilterbank::new(SAMPLE_RATE, FREQ_SIZE, NB_ERB, 2)
    }

    fn orchestrator(sim: SimulatedBackend) -> InferenceOrchestrator<SimulatedBackend> {
        let mut cfg = EnhancerConfig::default();
        cfg.enc_hidden_dim = 16;
        InferenceOrchestrator::new(sim, &cfg, filterbank()).unwrap()
    }

    fn sim() -> SimulatedBackend {
        SimulatedBackend::new(NB_ERB, NB_DF, 5, Some(16))
    }

    fn features(level: f32) -> (Vec<f32>, Vec<f32>) {
        (vec![level; NB_ERB], vec![level * 0.5; 2 * NB_DF])
    }

    const T: Duration = Duration::from_secs(5);

    #[test]
    fn test_encode_is_idempotent() {
        let mut orch = orchestrator(sim());
        let (erb, spec) = features(0.4);
        let prior = orch.state().clone();
        let first = orch.encode(&erb, &spec, &prior, T).unwrap();
        let second = orch.encode(&erb, &spec, &prior, T).unwrap();
        assert_eq!(first, second);
        // encode() never commits
        assert_eq!(orch.state(), &prior);
    }

    #[test]
    fn test_full_frame_commits_state() {
        let mut orch = orchestrator(sim().with_mask_gain(0.25));
        let (erb, spec) = features(0.4);
        let inf = orch.infer_frame(&erb, &spec, T).unwrap();
        assert_eq!(orch.stage(), Stage::Idle);
        assert_eq!(orch.state().steps(), 1);
        assert_eq!(inf.mask.len(), FREQ_SIZE);
        assert!(inf.mask.gains().iter().all(|&g| g == 0.25));
        assert_eq!(inf.coefs.tap(0, 4), Some(Complex32::new(1.0, 0.0)));
        assert_eq!(inf.coefs.tap(0, 5), None);
        assert_eq!(orch.state().hidden().map(|h| h.len()), Some(16));

        // h1 feeds back as h0
        let h1 = orch.state().hidden().cloned();
        orch.infer_frame(&erb, &spec, T).unwrap();
        assert_ne!(orch.state().hidden().cloned(), h1);
    }

    #[test]
    fn test_failed_stage_leaves_state_untouched() {
        let mut orch = orchestrator(sim().fail_on_call(DF_DECODER, 1));
        let (erb, spec) = features(0.2);
        orch.infer_frame(&erb, &spec, T).unwrap();
        let committed = orch.state().clone();

        let failure = orch.infer_frame(&erb, &spec, T).unwrap_err();
        assert_eq!(failure.stage, Stage::DfDecoding);
        assert!(!failure.error.is_input_error());
        assert_eq!(orch.state(), &committed);
        assert_eq!(orch.stage(), Stage::Idle);

        orch.infer_frame(&erb, &spec, T).unwrap();
        assert_eq!(orch.state().steps(), 2);
    }

    #[test]
    fn test_missing_output_fails_closed() {
        let mut orch = orchestrator(sim().omit_output(ENCODER, "e2"));
        let (erb, spec) = features(0.2);
        let failure = orch.infer_frame(&erb, &spec, T).unwrap_err();
        assert_eq!(failure.stage, Stage::Encoding);
        assert_eq!(
            failure.error,
            BackendError::MissingOutput { graph: "enc".into(), name: "e2".into() }
        );
        assert_eq!(orch.state().steps(), 0);
    }

    #[test]
    fn test_timeout_reported() {
        let slow = sim().delay_on_call(ERB_DECODER, 0, Duration::from_millis(30));
        let mut orch = orchestrator(slow);
        let (erb, spec) = features(0.2);
        let failure = orch.infer_frame(&erb, &spec, Duration::from_millis(10)).unwrap_err();
        assert!(failure.error.is_timeout(), "{}", failure);
        assert_eq!(failure.stage, Stage::ErbDecoding);
    }

    #[test]
    fn test_stateless_encoder_sees_frame_window() {
        let cfg = EnhancerConfig { stateful: false, ..EnhancerConfig::default() };
        assert_eq!(cfg.enc_window(), 3);
        let sim = SimulatedBackend::from_config(&cfg);
        let mut orch = InferenceOrchestrator::new(sim, &cfg, filterbank()).unwrap();

        let frame = |level: f32| {
            let spec: Vec<f32> = [vec![level; NB_DF], vec![-level; NB_DF]].concat();
            (vec![level; NB_ERB], spec)
        };
        let rows = |orch: &InferenceOrchestrator<SimulatedBackend>| {
            let t = orch.backend().last_input(ENCODER, "feat_erb").unwrap();
            assert_eq!(t.shape(), &[1, 1, 3, NB_ERB]);
            (0..3).map(|i| t.data()[i * NB_ERB]).collect::<Vec<_>>()
        };

        let (erb, spec) = frame(1.0);
        orch.infer_frame(&erb, &spec, T).unwrap();
        assert_eq!(rows(&orch), vec![0.0, 0.0, 1.0]);
        assert_eq!(orch.state().context().frames(), 1);

        for level in [2.0, 3.0, 4.0] {
            let (erb, spec) = frame(level);
            orch.infer_frame(&erb, &spec, T).unwrap();
        }
        assert_eq!(rows(&orch), vec![2.0, 3.0, 4.0]);
        assert_eq!(orch.state().context().frames(), 2);

        let spec = orch.backend().last_input(ENCODER, "feat_spec").unwrap();
        assert_eq!(spec.shape(), &[1, 2, 3, NB_DF]);
        assert_eq!(spec.data()[NB_DF], 3.0);
        assert_eq!(spec.data()[(3 + 1) * NB_DF], -3.0);
    }

    #[test]
    fn test_decoders_take_last_time_step() {
        assert_eq!(last_step(&[1.0, 2.0, 3.0, 4.0], 2), Some(&[3.0, 4.0][..]));
        assert_eq!(last_step(&[1.0, 2.0, 3.0], 2), None);
        assert_eq!(last_step(&[], 2), None);
    }

    #[test]
    fn test_mask_repair() {
        let fb = ErbFilterbank::from_widths(&[1, 2, 1]);
        let mask = SpectralMask::from_bands(&fb, &[f32::NAN, 2.0, 0.5]);
        assert_eq!(mask.gains(), &[1.0, 1.0, 1.0, 0.5]);
        assert_eq!(mask.repaired(), 2);
    }

    #[test]
    fn test_reset() {
        let mut orch = orchestrator(sim());
        let (erb, spec) = features(0.2);
        orch.infer_frame(&erb, &spec, T).unwrap();
        orch.reset();
        assert_eq!(orch.state(), &ModelState::default());
    }
}
