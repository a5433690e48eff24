//! Per-frame enhancement pipeline.
//!
//! sanitize → STFT → ERB/spectral features → encoder + decoders → mask and
//! deep filter → ISTFT. One [`DeepFilterProcessor::process_frame`] call
//! consumes one hop of input and produces one hop of output.

use crate::backend::InferenceBackend;
use crate::deep_filter::DeepFilterSynthesizer;
use crate::diagnostics::{log_gate, Diagnostics};
use crate::features::{ErbExtractor, ErbFilterbank, SpectralExtractor};
use crate::orchestrator::{
    FrameInference, InferenceFailure, InferenceOrchestrator, ModelState, SpectralMask, Stage,
};
use crate::sanitize::FrameSanitizer;
use crate::transform::{StftAnalyzer, StftSynthesizer};
use crate::{DfError, EnhancerConfig, Result};
use num_complex::Complex32;
use std::sync::Arc;
use std::time::Duration;

const WARMUP_FRAMES: usize = 3;

/// Why a frame was passed through unprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Timeout(Stage),
    BackendFailure(Stage),
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Enhanced,
    /// Output is the sanitized input, delayed like enhanced output.
    Bypassed(BypassReason),
    /// Input carried NaN/Inf and was replaced by silence. Earlier input
    /// still in flight is rendered unmodified.
    Silenced,
}

/// Low-level frame API.
///
/// You manage `hop_size`-sample frames yourself (480 = 10ms at 48kHz). Each
/// processor instance is independent and `Send`; create separate instances for
/// parallel streams.
pub struct DeepFilterProcessor<B> {
    config: EnhancerConfig,
    timeout: Duration,
    sanitizer: FrameSanitizer,
    analyzer: StftAnalyzer,
    synthesizer: StftSynthesizer,
    erb: ErbExtractor,
    spec: SpectralExtractor,
    orchestrator: InferenceOrchestrator<B>,
    deep_filter: DeepFilterSynthesizer,
    diagnostics: Arc<Diagnostics>,
    last_lsnr: Option<f32>,
    last_failure: Option<InferenceFailure>,

    // Pre-allocated working buffers
    work_frame: Vec<f32>,
    work_spec: Vec<Complex32>,
    work_out_spec: Vec<Complex32>,
    work_erb_feat: Vec<f32>,
    work_spec_feat: Vec<f32>,
    unity_mask: SpectralMask,
    zero_mask: SpectralMask,
}

impl<B: InferenceBackend> DeepFilterProcessor<B> {
    pub fn new(backend: B, config: EnhancerConfig) -> Result<Self> {
        config.validate()?;
        let freq_size = config.freq_size();
        let (fft, hop) = (config.fft_size, config.hop_size);

        let filterbank = ErbFilterbank::new(config.sample_rate, freq_size, config.nb_erb, config.min_nb_erb_freqs);
        let orchestrator = InferenceOrchestrator::new(backend, &config, filterbank.clone())?;
        let analyzer = StftAnalyzer::new(fft, hop, config.window);
        let synthesizer = StftSynthesizer::new(fft, hop, config.window);
        debug_assert_eq!(analyzer.freq_size(), freq_size);

        log::debug!(
            "processor: fft {} hop {} ({} bins), {} ERB bands, {} DF bins x {} taps, lookahead {}",
            fft,
            hop,
            freq_size,
            config.nb_erb,
            config.nb_df,
            config.df_order,
            config.lookahead()
        );

        Ok(Self {
            timeout: config.inference_timeout(),
            sanitizer: FrameSanitizer::new(config.sample_limit),
            analyzer,
            synthesizer,
            erb: ErbExtractor::new(filterbank, config.erb_scaling, config.norm_alpha),
            spec: SpectralExtractor::new(config.nb_df, config.norm_alpha),
            orchestrator,
            deep_filter: DeepFilterSynthesizer::new(
                freq_size,
                config.nb_df,
                config.df_order,
                config.lookahead(),
                config.max_gain,
                config.outside_band,
            ),
            diagnostics: Arc::new(Diagnostics::new()),
            last_lsnr: None,
            last_failure: None,
            work_frame: vec![0.0; hop],
            work_spec: vec![Complex32::new(0.0, 0.0); freq_size],
            work_out_spec: vec![Complex32::new(0.0, 0.0); freq_size],
            work_erb_feat: vec![0.0; config.nb_erb],
            work_spec_feat: vec![0.0; 2 * config.nb_df],
            unity_mask: SpectralMask::unity(freq_size),
            zero_mask: SpectralMask::zeros(freq_size),
            config,
        })
    }

    pub fn config(&self) -> &EnhancerConfig {
        &self.config
    }

    pub fn hop_size(&self) -> usize {
        self.config.hop_size
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn model_state(&self) -> &ModelState {
        self.orchestrator.state()
    }

    pub fn orchestrator(&self) -> &InferenceOrchestrator<B> {
        &self.orchestrator
    }

    /// Encoder SNR estimate of the last enhanced frame.
    pub fn last_lsnr(&self) -> Option<f32> {
        self.last_lsnr
    }

    pub fn last_failure(&self) -> Option<&InferenceFailure> {
        self.last_failure.as_ref()
    }

    /// Algorithmic latency in samples.
    pub fn latency_samples(&self) -> usize {
        self.config.latency_samples()
    }

    pub fn latency_ms(&self) -> f32 {
        self.latency_samples() as f32 / self.config.sample_rate as f32 * 1000.0
    }

    /// Bring every stateful stage back to its initial state together.
    pub fn reset(&mut self) {
        self.reset_state();
        let n = self.diagnostics.add_resets(1);
        log::info!("processor reset (#{})", n);
    }

    fn reset_state(&mut self) {
        self.analyzer.reset();
        self.synthesizer.reset();
        self.erb.reset();
        self.spec.reset();
        self.deep_filter.reset();
        self.orchestrator.reset();
        self.last_lsnr = None;
        self.last_failure = None;
    }

    /// Perform warm-up inference to avoid cold-start latency.
    ///
    /// GPU/NPU execution providers often have significant first-inference
    /// latency. The processor state is reset afterwards. Fails if the backend
    /// could not process the warm-up frames.
    pub fn warmup(&mut self) -> Result<()> {
        let silence = vec![0.0f32; self.hop_size()];
        let mut out = vec![0.0f32; self.hop_size()];
        let mut failure = None;
        for _ in 0..WARMUP_FRAMES {
            if let FrameOutcome::Bypassed(_) = self.process_frame(&silence, &mut out) {
                failure = self.last_failure.clone();
            }
        }
        self.reset_state();
        match failure {
            Some(f) => Err(DfError::Backend(f.error)),
            None => Ok(()),
        }
    }

    /// Process a single frame of `hop_size` samples.
    ///
    /// Never fails: data-path problems turn into a [`FrameOutcome`] and
    /// diagnostic counters. Panics if either slice is not `hop_size` long.
    pub fn process_frame(&mut self, input: &[f32], output: &mut [f32]) -> FrameOutcome {
        let hop = self.hop_size();
        assert_eq!(input.len(), hop, "input frame length");
        assert_eq!(output.len(), hop, "output frame length");
        self.diagnostics.add_processed(1);

        // 1. Validate samples
        self.work_frame.copy_from_slice(input);
        let report = self.sanitizer.sanitize(&mut self.work_frame);
        if !report.is_clean() {
            let n = self.diagnostics.add_sanitized(1);
            self.diagnostics.add_invalid_samples(report.total() as u64);
            if log_gate(n) {
                log::warn!(
                    "sanitized input frame: {} non-finite, {} out of range, {} subnormal ({} frames so far)",
                    report.non_finite,
                    report.out_of_range,
                    report.subnormal,
                    n
                );
            }
        }
        if report.is_dropout() {
            self.pass_silence(output);
            return FrameOutcome::Silenced;
        }

        // 2. STFT
        self.analyzer.push_frame(&self.work_frame, &mut self.work_spec);

        // 3. Features
        let erb_step = self.erb.extract(&self.work_spec, &mut self.work_erb_feat);
        let spec_step = self.spec.extract(&self.work_spec, &mut self.work_spec_feat);
        let invalid = [erb_step, spec_step].iter().filter(|s| !s.is_valid()).count();
        if invalid > 0 {
            self.diagnostics.add_invalid_features(invalid as u64);
        }

        // 4. Inference
        match self
            .orchestrator
            .infer_frame(&self.work_erb_feat, &self.work_spec_feat, self.timeout)
        {
            Ok(inference) => {
                self.enhance(&inference, output);
                self.diagnostics.add_enhanced(1);
                FrameOutcome::Enhanced
            }
            Err(failure) => {
                let reason = self.record_failure(failure);
                self.deep_filter.passthrough(&self.work_spec, &mut self.work_out_spec);
                self.synthesizer.synthesize(&self.work_out_spec, output);
                FrameOutcome::Bypassed(reason)
            }
        }
    }

    /// Mask, deep filter and ISTFT, gated by the encoder's SNR estimate.
    fn enhance(&mut self, inference: &FrameInference, output: &mut [f32]) {
        let lsnr = inference.lsnr;
        self.last_lsnr = Some(lsnr);

        let zero_mask = lsnr < self.config.min_db_thresh;
        let apply_mask = lsnr <= self.config.max_db_erb_thresh;
        let apply_df = lsnr <= self.config.max_db_df_thresh && !zero_mask;

        let mask = if zero_mask {
            &self.zero_mask
        } else if apply_mask {
            &inference.mask
        } else {
            &self.unity_mask
        };
        if inference.mask.repaired() > 0 {
            let n = self.diagnostics.add_invalid_model_values(inference.mask.repaired() as u64);
            if log_gate(n) {
                log::warn!("repaired {} mask gains ({} so far)", inference.mask.repaired(), n);
            }
        }

        let coefs = apply_df.then_some(&inference.coefs);
        let skipped = self
            .deep_filter
            .process(&self.work_spec, mask, coefs, &mut self.work_out_spec);
        if skipped > 0 {
            let n = self.diagnostics.add_df_cells_skipped(skipped as u64);
            if log_gate(n) {
                log::warn!("skipped {} deep-filter cells ({} so far)", skipped, n);
            }
        }

        self.synthesizer.synthesize(&self.work_out_spec, output);
    }

    /// Run a dropout frame through the transforms as silence without
    /// touching model or normalization state.
    fn pass_silence(&mut self, output: &mut [f32]) {
        self.work_frame.fill(0.0);
        self.analyzer.push_frame(&self.work_frame, &mut self.work_spec);
        self.deep_filter.passthrough(&self.work_spec, &mut self.work_out_spec);
        self.synthesizer.synthesize(&self.work_out_spec, output);
    }

    fn record_failure(&mut self, failure: InferenceFailure) -> BypassReason {
        let reason = if failure.error.is_timeout() {
            self.diagnostics.add_inference_timeouts(1);
            BypassReason::Timeout(failure.stage)
        } else {
            self.diagnostics.add_inference_failures(1);
            BypassReason::BackendFailure(failure.stage)
        };
        let n = self.diagnostics.add_bypassed(1);
        if log_gate(n) {
            log::warn!("bypassing frame: {} ({} bypassed so far)", failure, n);
        }
        self.last_failure = Some(failure);
        reason
    }
}
