//! Streaming STFT/ISTFT with overlap-add reconstruction.
//!
//! All memory is pre-allocated at construction time: [`StftAnalyzer::push_frame`]
//! and [`StftSynthesizer::synthesize`] perform zero heap allocations, so both are
//! safe to call once per hop on the processing thread.
//!
//! Forward scaling follows `libDF` (`2·hop / N²`), which keeps feature levels
//! compatible with DeepFilterNet-trained models. With a power-complementary
//! window the analysis → synthesis chain reconstructs the input delayed by
//! `fft_size - hop_size` samples.

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Analysis/synthesis window shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// `sin(π/2 · sin²(π·(n+½)/N))`, as used by DeepFilterNet.
    Vorbis,
    /// Square root of a periodic Hann window.
    SqrtHann,
}

impl WindowKind {
    pub fn coefficients(self, size: usize) -> Vec<f32> {
        match self {
            WindowKind::Vorbis => vorbis_window(size),
            WindowKind::SqrtHann => sqrt_hann_window(size),
        }
    }
}

/// Smallest length `>= n` whose only prime factors are 2, 3 and 5.
pub fn efficient_fft_len(n: usize) -> usize {
    let mut m = n.max(1);
    loop {
        let mut r = m;
        for p in [2, 3, 5] {
            while r % p == 0 {
                r /= p;
            }
        }
        if r == 1 {
            return m;
        }
        m += 1;
    }
}

/// Worst-case deviation of the overlapped squared window from its ideal
/// constant `fft_size / (2 · hop_size)`, relative to that constant.
///
/// Zero means the analysis/synthesis pair reconstructs perfectly.
pub fn cola_error(kind: WindowKind, fft_size: usize, hop_size: usize) -> f32 {
    if hop_size == 0 || fft_size == 0 || hop_size > fft_size {
        return f32::INFINITY;
    }
    let w = kind.coefficients(fft_size);
    let ideal = fft_size as f32 / (2 * hop_size) as f32;
    let mut worst = 0.0f32;
    for n in 0..hop_size {
        let sum: f32 = (n..fft_size).step_by(hop_size).map(|i| w[i] * w[i]).sum();
        worst = worst.max((sum - ideal).abs() / ideal);
    }
    worst
}

// ─────────────────────── StftAnalyzer ────────────────────────────

/// Windowed forward transform of one `fft_size` window into `freq_size` bins.
pub struct StftAnalyzer {
    fft_size: usize,
    hop_size: usize,
    /// Sliding window over the most recent `fft_size` samples.
    frame: Vec<f32>,
    /// Windowed FFT input, zero-padded up to the transform length.
    fft_buf: Vec<f32>,
    fft_scratch: Vec<Complex32>,
    window: Vec<f32>,
    wnorm: f32,
    fft_forward: Arc<dyn RealToComplex<f32>>,
}

impl StftAnalyzer {
    pub fn new(fft_size: usize, hop_size: usize, kind: WindowKind) -> Self {
        assert!(hop_size > 0 && hop_size <= fft_size, "invalid STFT geometry");
        let transform_len = efficient_fft_len(fft_size);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(transform_len);
        let fft_scratch = fft_forward.make_scratch_vec();
        let fft_buf = fft_forward.make_input_vec();

        Self {
            fft_size,
            hop_size,
            frame: vec![0.0; fft_size],
            fft_buf,
            fft_scratch,
            window: kind.coefficients(fft_size),
            wnorm: (2 * hop_size) as f32 / (fft_size * fft_size) as f32,
            fft_forward,
        }
    }

    /// Number of output bins.
    pub fn freq_size(&self) -> usize {
        self.fft_buf.len() / 2 + 1
    }

    /// Transform a full `fft_size` window. Deterministic in `window` alone.
    pub fn analyze(&mut self, window: &[f32], output: &mut [Complex32]) {
        assert_eq!(window.len(), self.fft_size, "analysis window length");
        assert_eq!(output.len(), self.freq_size(), "spectrum length");

        let (head, pad) = self.fft_buf.split_at_mut(self.fft_size);
        for ((buf, &x), &w) in head.iter_mut().zip(window).zip(&self.window) {
            *buf = x * w;
        }
        pad.fill(0.0);

        if self
            .fft_forward
            .process_with_scratch(&mut self.fft_buf, output, &mut self.fft_scratch)
            .is_err()
        {
            output.fill(Complex32::new(0.0, 0.0));
            return;
        }

        for x in output.iter_mut() {
            *x *= self.wnorm;
        }
    }

    /// Slide the window by one hop of new samples and transform it.
    pub fn push_frame(&mut self, input: &[f32], output: &mut [Complex32]) {
        assert_eq!(input.len(), self.hop_size, "frame length");
        let keep = self.fft_size - self.hop_size;
        self.frame.copy_within(self.hop_size.., 0);
        self.frame[keep..].copy_from_slice(input);

        // Borrow juggling: analyze() needs &mut self and the window at once.
        let frame = std::mem::take(&mut self.frame);
        self.analyze(&frame, output);
        self.frame = frame;
    }

    pub fn reset(&mut self) {
        self.frame.fill(0.0);
    }
}

// ─────────────────────── StftSynthesizer ───────────────────────────

/// Inverse transform with an overlap-add accumulator of `fft_size - hop_size`.
pub struct StftSynthesizer {
    fft_size: usize,
    hop_size: usize,
    ola: Vec<f32>,
    spec_buf: Vec<Complex32>,
    ifft_buf: Vec<f32>,
    ifft_scratch: Vec<Complex32>,
    window: Vec<f32>,
    iscale: f32,
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
}

impl StftSynthesizer {
    pub fn new(fft_size: usize, hop_size: usize, kind: WindowKind) -> Self {
        assert!(hop_size > 0 && hop_size <= fft_size, "invalid STFT geometry");
        let transform_len = efficient_fft_len(fft_size);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft_inverse = planner.plan_fft_inverse(transform_len);

        Self {
            fft_size,
            hop_size,
            ola: vec![0.0; fft_size - hop_size],
            spec_buf: fft_inverse.make_input_vec(),
            ifft_buf: fft_inverse.make_output_vec(),
            ifft_scratch: fft_inverse.make_scratch_vec(),
            window: kind.coefficients(fft_size),
            iscale: fft_size as f32 / transform_len as f32,
            fft_inverse,
        }
    }

    pub fn freq_size(&self) -> usize {
        self.spec_buf.len()
    }

    /// Inverse-transform `spectrum` and emit exactly `hop_size` samples.
    pub fn synthesize(&mut self, spectrum: &[Complex32], output: &mut [f32]) {
        assert_eq!(spectrum.len(), self.freq_size(), "spectrum length");
        assert_eq!(output.len(), self.hop_size, "frame length");

        self.spec_buf.copy_from_slice(spectrum);
        // A real signal has purely real DC and Nyquist bins.
        let last = self.spec_buf.len() - 1;
        self.spec_buf[0].im = 0.0;
        self.spec_buf[last].im = 0.0;

        if self
            .fft_inverse
            .process_with_scratch(&mut self.spec_buf, &mut self.ifft_buf, &mut self.ifft_scratch)
            .is_err()
        {
            self.ifft_buf.fill(0.0);
        }

        let frame = &mut self.ifft_buf[..self.fft_size];
        for (x, &w) in frame.iter_mut().zip(&self.window) {
            *x *= w * self.iscale;
        }

        for (i, out) in output.iter_mut().enumerate() {
            *out = frame[i] + self.ola.get(i).copied().unwrap_or(0.0);
        }

        // Shift the accumulator by one hop and add the new tail.
        let overlap = self.ola.len();
        for j in 0..overlap {
            let carried = self.ola.get(self.hop_size + j).copied().unwrap_or(0.0);
            self.ola[j] = frame[self.hop_size + j] + carried;
        }
    }

    pub fn reset(&mut self) {
        self.ola.fill(0.0);
    }
}

// ─────────────────────── Helper functions ───────────────────────

/// Compute the Vorbis window: sin(π/2 · sin²(π·n/N))
fn vorbis_window(size: usize) -> Vec<f32> {
    let pi = std::f64::consts::PI;
    let half = size / 2;
    (0..size)
        .map(|i| {
            let sin_val = (0.5 * pi * (i as f64 + 0.5) / half as f64).sin();
            (0.5 * pi * sin_val * sin_val).sin() as f32
        })
        .collect()
}

fn sqrt_hann_window(size: usize) -> Vec<f32> {
    let pi = std::f64::consts::PI;
    (0..size)
        .map(|i| {
            let hann = 0.5 * (1.0 - (2.0 * pi * i as f64 / size as f64).cos());
            hann.sqrt() as f32
        })
        .collect()
}

// ─────────────────────────── Tests ──────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FFT_SIZE, FREQ_SIZE, HOP_SIZE};

    fn sine_frames(frames: usize, hop: usize) -> Vec<f32> {
        (0..frames * hop)
            .map(|i| {
                let t = i as f32 / 48000.0;
                0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 3100.0 * t).sin()
            })
            .collect()
    }

    fn roundtrip_rms(kind: WindowKind, fft: usize, hop: usize) -> f32 {
        let mut stft = StftAnalyzer::new(fft, hop, kind);
        let mut istft = StftSynthesizer::new(fft, hop, kind);
        let frames = 40;
        let input = sine_frames(frames, hop);
        let mut output = Vec::with_capacity(input.len());
        let mut spec = vec![Complex32::new(0.0, 0.0); stft.freq_size()];
        let mut out = vec![0.0f32; hop];
        for chunk in input.chunks(hop) {
            stft.push_frame(chunk, &mut spec);
            istft.synthesize(&spec, &mut out);
            output.extend_from_slice(&out);
        }

        let delay = fft - hop;
        let start = delay + fft;
        let mut err = 0.0f64;
        let mut n = 0usize;
        for i in start..output.len() {
            let d = (output[i] - input[i - delay]) as f64;
            err += d * d;
            n += 1;
        }
        (err / n as f64).sqrt() as f32
    }

    #[test]
    fn test_vorbis_window_symmetry() {
        let w = vorbis_window(FFT_SIZE);
        assert_eq!(w.len(), FFT_SIZE);
        for i in 0..FFT_SIZE / 2 {
            let diff = (w[i] - w[FFT_SIZE - 1 - i]).abs();
            assert!(diff < 1e-6, "Window not symmetric at {}: {} vs {}", i, w[i], w[FFT_SIZE - 1 - i]);
        }
    }

    #[test]
    fn test_windows_are_power_complementary() {
        assert!(cola_error(WindowKind::Vorbis, FFT_SIZE, HOP_SIZE) < 1e-5);
        assert!(cola_error(WindowKind::SqrtHann, FFT_SIZE, HOP_SIZE) < 1e-5);
        assert!(cola_error(WindowKind::SqrtHann, 512, 128) < 1e-5);
        assert!(cola_error(WindowKind::Vorbis, 960, 960) > 0.1);
    }

    #[test]
    fn test_efficient_len() {
        assert_eq!(efficient_fft_len(960), 960);
        assert_eq!(efficient_fft_len(1024), 1024);
        assert_eq!(efficient_fft_len(1001), 1024);
        assert_eq!(efficient_fft_len(7), 8);
    }

    #[test]
    fn test_bin_count() {
        let stft = StftAnalyzer::new(FFT_SIZE, HOP_SIZE, WindowKind::Vorbis);
        assert_eq!(stft.freq_size(), FREQ_SIZE);
        let padded = StftAnalyzer::new(1001, 143, WindowKind::Vorbis);
        assert_eq!(padded.freq_size(), 1024 / 2 + 1);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let mut a = StftAnalyzer::new(FFT_SIZE, HOP_SIZE, WindowKind::Vorbis);
        let window = sine_frames(2, HOP_SIZE);
        let mut s1 = vec![Complex32::new(0.0, 0.0); FREQ_SIZE];
        let mut s2 = vec![Complex32::new(1.0, 1.0); FREQ_SIZE];
        a.analyze(&window, &mut s1);
        a.push_frame(&window[..HOP_SIZE], &mut s2);
        a.analyze(&window, &mut s2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_stft_istft_roundtrip() {
        let rms = roundtrip_rms(WindowKind::Vorbis, FFT_SIZE, HOP_SIZE);
        assert!(rms < 1e-3, "Vorbis roundtrip RMS error too large: {}", rms);
    }

    #[test]
    fn test_sqrt_hann_roundtrip_with_padding_and_small_hop() {
        let rms = roundtrip_rms(WindowKind::SqrtHann, 512, 128);
        assert!(rms < 1e-3, "sqrt-Hann 75% overlap RMS error too large: {}", rms);
        let rms = roundtrip_rms(WindowKind::SqrtHann, 1078, 539);
        assert!(rms < 1e-3, "padded transform RMS error too large: {}", rms);
    }

    #[test]
    fn test_reset_clears_overlap() {
        let mut stft = StftAnalyzer::new(FFT_SIZE, HOP_SIZE, WindowKind::Vorbis);
        let mut istft = StftSynthesizer::new(FFT_SIZE, HOP_SIZE, WindowKind::Vorbis);
        let loud = vec![0.9f32; HOP_SIZE];
        let mut spec = vec![Complex32::new(0.0, 0.0); FREQ_SIZE];
        let mut out = vec![0.0f32; HOP_SIZE];
        stft.push_frame(&loud, &mut spec);
        istft.synthesize(&spec, &mut out);
        stft.reset();
        istft.reset();
        stft.push_frame(&vec![0.0; HOP_SIZE], &mut spec);
        istft.synthesize(&spec, &mut out);
        assert!(out.iter().all(|&x| x.abs() < 1e-7));
    }
}
