//! Perceptual (ERB) and spectral-bin feature extraction.
//!
//! Both extractors are pure projections of one spectrum time step plus a
//! running normalization state that they own. A time step whose magnitudes
//! are non-finite, negative or subnormal is rejected as a whole: the output is
//! zero-filled and the normalization state is left untouched.

use crate::diagnostics::log_gate;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How ERB band energies are turned into features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErbScaling {
    /// `sqrt(Σ w·|X|²)` followed by running unit normalization.
    UnitSqrt,
    /// libDF features: `10·log10(Σ w·|X|²)`, running mean removal, `/40`.
    MeanDb,
}

/// Why a time step was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    NonFinite,
    Negative,
    Subnormal,
    /// Band energy overflowed `f32`.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStep {
    Valid,
    Zeroed(Anomaly),
}

impl FeatureStep {
    pub fn is_valid(self) -> bool {
        self == FeatureStep::Valid
    }
}

fn classify(x: f32) -> Option<Anomaly> {
    if !x.is_finite() {
        Some(Anomaly::NonFinite)
    } else if x < 0.0 {
        Some(Anomaly::Negative)
    } else if x.is_subnormal() {
        Some(Anomaly::Subnormal)
    } else {
        None
    }
}

fn flush_subnormal(values: &mut [f32]) {
    for v in values.iter_mut().filter(|v| v.is_subnormal()) {
        *v = 0.0;
    }
}

fn freq2erb(freq_hz: f32) -> f32 {
    9.265 * (freq_hz / (24.7 * 9.265)).ln_1p()
}

fn erb2freq(n_erb: f32) -> f32 {
    24.7 * 9.265 * ((n_erb / 9.265).exp() - 1.0)
}

/// Number of linear bins per ERB band, summing to `freq_size`.
///
/// Same construction as libDF's `erb_fb`: bands equally spaced on the ERB
/// scale, each at least `min_nb_freqs` wide.
pub fn erb_band_widths(
    sample_rate: usize,
    freq_size: usize,
    nb_bands: usize,
    min_nb_freqs: usize,
) -> Vec<usize> {
    assert!(nb_bands > 0 && nb_bands <= freq_size, "ERB band count out of range");
    let fft_size = (freq_size - 1) * 2;
    let nyq_freq = sample_rate as f32 / 2.0;
    let freq_width = sample_rate as f32 / fft_size as f32;
    let erb_low = freq2erb(0.0);
    let erb_high = freq2erb(nyq_freq);
    let step = (erb_high - erb_low) / nb_bands as f32;
    let min_nb_freqs = min_nb_freqs.max(1) as isize;

    let mut widths = vec![0usize; nb_bands];
    let mut prev_freq = 0isize;
    let mut freq_over = 0isize;
    for (i, width) in widths.iter_mut().enumerate() {
        let f = erb2freq(erb_low + (i + 1) as f32 * step);
        let fb = (f / freq_width).round() as isize;
        let mut nb_freqs = fb - prev_freq - freq_over;
        if nb_freqs < min_nb_freqs {
            freq_over = min_nb_freqs - nb_freqs;
            nb_freqs = min_nb_freqs;
        } else {
            freq_over = 0;
        }
        *width = nb_freqs as usize;
        prev_freq = fb;
    }

    // The last band also covers the Nyquist bin; trim any excess from the top.
    let total: usize = widths.iter().sum();
    if total < freq_size {
        widths[nb_bands - 1] += freq_size - total;
    } else {
        let mut excess = total - freq_size;
        for width in widths.iter_mut().rev() {
            if excess == 0 {
                break;
            }
            let take = excess.min(width.saturating_sub(1));
            *width -= take;
            excess -= take;
        }
    }
    widths
}

// ─────────────────────── ErbFilterbank ────────────────────────────

/// Immutable `bands × bins` weight matrix.
///
/// Every band averages its contiguous run of linear bins, so each row holds
/// `1/width` over the band and zero elsewhere.
#[derive(Debug, Clone)]
pub struct ErbFilterbank {
    freq_size: usize,
    ranges: Vec<Range<usize>>,
    weights: Vec<f32>,
}

impl ErbFilterbank {
    pub fn new(sample_rate: usize, freq_size: usize, nb_bands: usize, min_nb_freqs: usize) -> Self {
        Self::from_widths(&erb_band_widths(sample_rate, freq_size, nb_bands, min_nb_freqs))
    }

    pub fn from_widths(widths: &[usize]) -> Self {
        let freq_size: usize = widths.iter().sum();
        let mut ranges = Vec::with_capacity(widths.len());
        let mut weights = vec![0.0f32; widths.len() * freq_size];
        let mut start = 0;
        for (band, &width) in widths.iter().enumerate() {
            let range = start..start + width;
            let w = 1.0 / width.max(1) as f32;
            for k in range.clone() {
                weights[band * freq_size + k] = w;
            }
            ranges.push(range);
            start += width;
        }
        Self { freq_size, ranges, weights }
    }

    pub fn nb_bands(&self) -> usize {
        self.ranges.len()
    }

    pub fn freq_size(&self) -> usize {
        self.freq_size
    }

    pub fn widths(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().map(|r| r.len())
    }

    pub fn weight(&self, band: usize, bin: usize) -> f32 {
        self.weights[band * self.freq_size + bin]
    }

    /// `out[b] = Σ_k W[b,k] · power[k]`.
    pub fn project(&self, power: &[f32], out: &mut [f32]) {
        debug_assert_eq!(power.len(), self.freq_size);
        debug_assert_eq!(out.len(), self.nb_bands());
        for ((band, range), o) in self.ranges.iter().enumerate().zip(out.iter_mut()) {
            let row = &self.weights[band * self.freq_size..(band + 1) * self.freq_size];
            *o = range.clone().map(|k| row[k] * power[k]).sum();
        }
    }

    /// Spread per-band values back onto the linear bins: `out[k] = bands[b(k)]`.
    pub fn expand(&self, bands: &[f32], out: &mut [f32]) {
        debug_assert_eq!(bands.len(), self.nb_bands());
        debug_assert_eq!(out.len(), self.freq_size);
        for (range, &g) in self.ranges.iter().zip(bands) {
            out[range.clone()].fill(g);
        }
    }
}

fn linspace(n: usize, first: f32, last: f32) -> impl Iterator<Item = f32> {
    let step = if n > 1 { (last - first) / (n - 1) as f32 } else { 0.0 };
    (0..n).map(move |i| first + i as f32 * step)
}

// Initial EMA states, as in DFState::init_norm_states.
const MEAN_NORM_INIT: (f32, f32) = (-60.0, -90.0);
const UNIT_NORM_INIT: (f32, f32) = (0.001, 0.0001);
const UNIT_STATE_FLOOR: f32 = 1e-12;

// ─────────────────────── ErbExtractor ────────────────────────────

/// Projects a spectrum onto the ERB filterbank and normalizes it.
pub struct ErbExtractor {
    filterbank: ErbFilterbank,
    scaling: ErbScaling,
    alpha: f32,
    state: Vec<f32>,
    power: Vec<f32>,
    bands: Vec<f32>,
    rejected: u64,
}

impl ErbExtractor {
    pub fn new(filterbank: ErbFilterbank, scaling: ErbScaling, alpha: f32) -> Self {
        let nb = filterbank.nb_bands();
        let freq_size = filterbank.freq_size();
        let mut extractor = Self {
            filterbank,
            scaling,
            alpha,
            state: vec![0.0; nb],
            power: vec![0.0; freq_size],
            bands: vec![0.0; nb],
            rejected: 0,
        };
        extractor.reset();
        extractor
    }

    pub fn filterbank(&self) -> &ErbFilterbank {
        &self.filterbank
    }

    pub fn nb_bands(&self) -> usize {
        self.filterbank.nb_bands()
    }

    /// Time steps rejected since construction.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn extract(&mut self, spectrum: &[Complex32], output: &mut [f32]) -> FeatureStep {
        assert_eq!(spectrum.len(), self.filterbank.freq_size(), "spectrum length");
        let mut anomaly = None;
        for (p, c) in self.power.iter_mut().zip(spectrum) {
            let a = if c.re.is_finite() && c.im.is_finite() {
                classify(c.norm())
            } else {
                Some(Anomaly::NonFinite)
            };
            if a.is_some() {
                anomaly = a;
                break;
            }
            *p = c.re * c.re + c.im * c.im;
        }
        if let Some(a) = anomaly {
            return self.reject(a, output);
        }
        self.extract_power(output)
    }

    /// Same as [`extract`](Self::extract) for an already computed magnitude spectrum.
    pub fn extract_from_magnitudes(&mut self, magnitudes: &[f32], output: &mut [f32]) -> FeatureStep {
        assert_eq!(magnitudes.len(), self.filterbank.freq_size(), "spectrum length");
        for (p, &m) in self.power.iter_mut().zip(magnitudes) {
            if let Some(a) = classify(m) {
                return self.reject(a, output);
            }
            *p = m * m;
        }
        self.extract_power(output)
    }

    fn extract_power(&mut self, output: &mut [f32]) -> FeatureStep {
        assert_eq!(output.len(), self.nb_bands(), "ERB feature length");
        // |X|² of a valid bin can still overflow, or land in the subnormal range.
        if self.power.iter().any(|p| !p.is_finite()) {
            return self.reject(Anomaly::Overflow, output);
        }
        flush_subnormal(&mut self.power);

        self.filterbank.project(&self.power, &mut self.bands);
        flush_subnormal(&mut self.bands);

        let alpha = self.alpha;
        match self.scaling {
            ErbScaling::UnitSqrt => {
                let it = self.bands.iter().zip(self.state.iter_mut()).zip(output.iter_mut());
                for ((&band, s), o) in it {
                    let mag = band.sqrt();
                    *s = mag * (1.0 - alpha) + *s * alpha;
                    *o = mag / s.max(UNIT_STATE_FLOOR).sqrt();
                }
            }
            ErbScaling::MeanDb => {
                let it = self.bands.iter().zip(self.state.iter_mut()).zip(output.iter_mut());
                for ((&band, s), o) in it {
                    let db = (band + 1e-10).log10() * 10.0;
                    *s = db * (1.0 - alpha) + *s * alpha;
                    *o = (db - *s) / 40.0;
                }
            }
        }
        FeatureStep::Valid
    }

    fn reject(&mut self, anomaly: Anomaly, output: &mut [f32]) -> FeatureStep {
        output.fill(0.0);
        self.rejected += 1;
        if log_gate(self.rejected) {
            log::warn!("ERB features zeroed: {:?} magnitude (total {})", anomaly, self.rejected);
        }
        FeatureStep::Zeroed(anomaly)
    }

    pub fn reset(&mut self) {
        let (first, last) = match self.scaling {
            ErbScaling::UnitSqrt => UNIT_NORM_INIT,
            ErbScaling::MeanDb => MEAN_NORM_INIT,
        };
        let n = self.state.len();
        for (s, v) in self.state.iter_mut().zip(linspace(n, first, last)) {
            *s = v;
        }
    }

    pub fn norm_state(&self) -> &[f32] {
        &self.state
    }
}

// ─────────────────────── SpectralExtractor ────────────────────────────

/// First `nb_df` complex bins, unit-normalized, laid out as planar
/// `[re × nb_df, im × nb_df]`.
pub struct SpectralExtractor {
    nb_df: usize,
    alpha: f32,
    state: Vec<f32>,
    rejected: u64,
}

impl SpectralExtractor {
    pub fn new(nb_df: usize, alpha: f32) -> Self {
        let mut extractor = Self { nb_df, alpha, state: vec![0.0; nb_df], rejected: 0 };
        extractor.reset();
        extractor
    }

    pub fn nb_df(&self) -> usize {
        self.nb_df
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn extract(&mut self, spectrum: &[Complex32], output: &mut [f32]) -> FeatureStep {
        assert!(spectrum.len() >= self.nb_df, "spectrum shorter than nb_df");
        assert_eq!(output.len(), 2 * self.nb_df, "spectral feature length");
        let bins = &spectrum[..self.nb_df];

        let bad = bins.iter().find_map(|c| {
            if !(c.re.is_finite() && c.im.is_finite()) {
                Some(Anomaly::NonFinite)
            } else {
                classify(c.norm())
            }
        });
        if let Some(a) = bad {
            output.fill(0.0);
            self.rejected += 1;
            if log_gate(self.rejected) {
                log::warn!("spectral features zeroed: {:?} bin (total {})", a, self.rejected);
            }
            return FeatureStep::Zeroed(a);
        }

        let alpha = self.alpha;
        let (re_out, im_out) = output.split_at_mut(self.nb_df);
        for (((x, s), re), im) in bins.iter().zip(self.state.iter_mut()).zip(re_out).zip(im_out) {
            let mag = x.norm();
            *s = mag * (1.0 - alpha) + *s * alpha;
            let scale = 1.0 / s.max(UNIT_STATE_FLOOR).sqrt();
            *re = x.re * scale;
            *im = x.im * scale;
        }
        FeatureStep::Valid
    }

    pub fn reset(&mut self) {
        let (first, last) = UNIT_NORM_INIT;
        for (s, v) in self.state.iter_mut().zip(linspace(self.nb_df, first, last)) {
            *s = v;
        }
    }

    pub fn norm_state(&self) -> &[f32] {
        &self.state
    }
}
