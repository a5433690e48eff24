//! Mask application and per-bin deep filtering.
//!
//! The synthesizer keeps a short history of unmasked spectra. Each step
//! enhances the *target* row, `lookahead` steps behind the newest one: the
//! ERB mask scales it, then the first `nb_df` bins are replaced by a complex
//! FIR filter over the `order` most recent rows of the noisy spectrum.

use crate::orchestrator::{FilterCoefficients, SpectralMask};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

/// Treatment of bins above the deep-filter band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutsideBand {
    /// Apply the ERB mask only.
    MaskOnly,
    /// Pass the original bins through.
    Unmodified,
}

pub struct DeepFilterSynthesizer {
    freq_size: usize,
    nb_df: usize,
    order: usize,
    lookahead: usize,
    max_gain: f32,
    outside: OutsideBand,
    /// `rows` full spectra; `head` is the oldest row and the next to overwrite.
    history: Vec<Complex32>,
    rows: usize,
    head: usize,
}

impl DeepFilterSynthesizer {
    pub fn new(
        freq_size: usize,
        nb_df: usize,
        order: usize,
        lookahead: usize,
        max_gain: f32,
        outside: OutsideBand,
    ) -> Self {
        assert!(nb_df <= freq_size, "deep-filter band wider than spectrum");
        assert!(order > 0, "deep filter needs at least one tap");
        assert!(lookahead < order, "lookahead must be shorter than the filter");
        let rows = order.max(lookahead + 1);
        Self {
            freq_size,
            nb_df,
            order,
            lookahead,
            max_gain,
            outside,
            history: vec![Complex32::new(0.0, 0.0); rows * freq_size],
            rows,
            head: 0,
        }
    }

    pub fn nb_df(&self) -> usize {
        self.nb_df
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Push `spectrum` and enhance the target row into `output`.
    ///
    /// With `coefs == None` only the mask is applied. Returns the number of
    /// cells skipped because their filter taps could not be addressed or
    /// produced a non-finite value; skipped cells keep the target bin.
    pub fn process(
        &mut self,
        spectrum: &[Complex32],
        mask: &SpectralMask,
        coefs: Option<&FilterCoefficients>,
        output: &mut [Complex32],
    ) -> usize {
        assert_eq!(output.len(), self.freq_size, "output length");
        assert_eq!(mask.len(), self.freq_size, "mask length");
        self.push_row(spectrum);

        let target = self.row(self.lookahead);
        for (k, (o, x)) in output.iter_mut().zip(target).enumerate() {
            *o = if k < self.nb_df || self.outside == OutsideBand::MaskOnly {
                *x * mask.gain(k)
            } else {
                *x
            };
        }

        let Some(coefs) = coefs else {
            return 0;
        };
        let mut skipped = 0;
        for k in 0..self.nb_df {
            match self.filter_bin(k, coefs) {
                Some(y) => output[k] = self.bound(y, target[k]),
                None => {
                    output[k] = target[k];
                    skipped += 1;
                }
            }
        }
        skipped
    }

    /// Push `spectrum` and copy the target row into `output` unmodified.
    pub fn passthrough(&mut self, spectrum: &[Complex32], output: &mut [Complex32]) {
        assert_eq!(output.len(), self.freq_size, "output length");
        self.push_row(spectrum);
        output.copy_from_slice(self.row(self.lookahead));
    }

    fn push_row(&mut self, row: &[Complex32]) {
        assert_eq!(row.len(), self.freq_size, "spectrum length");
        let start = self.head * self.freq_size;
        self.history[start..start + self.freq_size].copy_from_slice(row);
        self.head = (self.head + 1) % self.rows;
    }

    /// Row pushed `age` steps ago, 0 being the newest.
    fn row(&self, age: usize) -> &[Complex32] {
        let idx = (self.head + self.rows - 1 - age) % self.rows;
        &self.history[idx * self.freq_size..(idx + 1) * self.freq_size]
    }

    /// `Σ_tap coef[k][tap] · x[t - (order - 1 - tap)][k]` over the noisy
    /// history, or `None` if any tap is missing or the sum is not finite.
    fn filter_bin(&self, k: usize, coefs: &FilterCoefficients) -> Option<Complex32> {
        let mut acc = Complex32::new(0.0, 0.0);
        for tap in 0..self.order {
            let c = coefs.tap(k, tap)?;
            let x = self.row(self.order - 1 - tap).get(k)?;
            acc += c * *x;
        }
        (acc.re.is_finite() && acc.im.is_finite()).then_some(acc)
    }

    /// Limit `|y|` to `max_gain · |x|`, keeping the phase of `y`.
    fn bound(&self, y: Complex32, x: Complex32) -> Complex32 {
        let limit = self.max_gain * x.norm();
        let mag = y.norm();
        if mag > limit {
            if mag > 0.0 {
                y * (limit / mag)
            } else {
                Complex32::new(0.0, 0.0)
            }
        } else {
            y
        }
    }

    pub fn reset(&mut self) {
        self.history.fill(Complex32::new(0.0, 0.0));
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ErbFilterbank;

    fn c(re: f32, im: f32) -> Complex32 {
        Complex32::new(re, im)
    }

    fn mask(fb: &ErbFilterbank, gain: f32) -> SpectralMask {
        SpectralMask::from_bands(fb, &vec![gain; fb.nb_bands()])
    }

    #[test]
    fn test_identity_filter_passes_noisy_band() {
        let fb = ErbFilterbank::from_widths(&[2, 2, 2]);
        let mut df = DeepFilterSynthesizer::new(6, 3, 3, 0, 4.0, OutsideBand::MaskOnly);
        let coefs = FilterCoefficients::identity(3, 3, 0);
        let spec: Vec<Complex32> = (0..6).map(|i| c(i as f32 + 1.0, -1.0)).collect();
        let mut out = vec![c(0.0, 0.0); 6];
        for _ in 0..4 {
            assert_eq!(df.process(&spec, &mask(&fb, 0.5), Some(&coefs), &mut out), 0);
            for k in 0..6 {
                let expected = if k < 3 { spec[k] } else { spec[k] * 0.5 };
                assert!((out[k] - expected).norm() < 1e-6, "bin {}: {} vs {}", k, out[k], expected);
            }
        }
    }

    #[test]
    fn test_lookahead_enhances_delayed_row() {
        let fb = ErbFilterbank::from_widths(&[1]);
        let mut df = DeepFilterSynthesizer::new(1, 1, 3, 1, 100.0, OutsideBand::MaskOnly);
        let coefs = FilterCoefficients::identity(1, 3, 1);
        let half = mask(&fb, 0.5);
        let mut out = [c(0.0, 0.0)];
        let mut filtered = Vec::new();
        let mut masked = Vec::new();
        for x in 1..=4 {
            df.process(&[c(x as f32, 0.0)], &half, Some(&coefs), &mut out);
            filtered.push(out[0].re);
        }
        df.reset();
        for x in 1..=4 {
            df.process(&[c(x as f32, 0.0)], &half, None, &mut out);
            masked.push(out[0].re);
        }
        assert_eq!(filtered, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(masked, vec![0.0, 0.5, 1.0, 1.5]);

        df.reset();
        let mut passed = Vec::new();
        for x in 1..=3 {
            df.passthrough(&[c(x as f32, 0.0)], &mut out);
            passed.push(out[0].re);
        }
        assert_eq!(passed, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_fir_uses_history_oldest_first() {
        let fb = ErbFilterbank::from_widths(&[1]);
        let mut df = DeepFilterSynthesizer::new(1, 1, 2, 0, 100.0, OutsideBand::MaskOnly);
        // y[t] = 1·x[t-1] + 0.5·x[t]
        let coefs = FilterCoefficients::from_interleaved(1, 2, &[1.0, 0.0, 0.5, 0.0]).unwrap();
        let unity = mask(&fb, 1.0);
        let mut out = [c(0.0, 0.0)];
        df.process(&[c(2.0, 0.0)], &unity, Some(&coefs), &mut out);
        assert_eq!(out[0], c(1.0, 0.0));
        df.process(&[c(4.0, 0.0)], &unity, Some(&coefs), &mut out);
        assert_eq!(out[0], c(4.0, 0.0));
    }

    #[test]
    fn test_gain_is_bounded() {
        let fb = ErbFilterbank::from_widths(&[1]);
        let mut df = DeepFilterSynthesizer::new(1, 1, 1, 0, 2.0, OutsideBand::MaskOnly);
        let coefs = FilterCoefficients::from_interleaved(1, 1, &[0.0, 1000.0]).unwrap();
        let mut out = [c(0.0, 0.0)];
        df.process(&[c(1.0, 0.0)], &mask(&fb, 1.0), Some(&coefs), &mut out);
        assert!((out[0].norm() - 2.0).abs() < 1e-5, "{}", out[0]);
        // phase of the filter output is kept
        assert!(out[0].re.abs() < 1e-5 && out[0].im > 0.0);
    }

    #[test]
    fn test_bad_cells_are_skipped_with_unity_gain() {
        let fb = ErbFilterbank::from_widths(&[2]);
        let mut df = DeepFilterSynthesizer::new(2, 2, 1, 0, 4.0, OutsideBand::MaskOnly);
        let coefs = FilterCoefficients::from_interleaved(2, 1, &[f32::NAN, 0.0, 1.0, 0.0]).unwrap();
        let spec = [c(3.0, 1.0), c(1.0, 1.0)];
        let mut out = [c(0.0, 0.0); 2];
        assert_eq!(df.process(&spec, &mask(&fb, 0.5), Some(&coefs), &mut out), 1);
        assert_eq!(out[0], spec[0]);
        assert_eq!(out[1], spec[1]);

        // Coefficients covering fewer bins than the band: uncovered cells skip.
        let mut df = DeepFilterSynthesizer::new(2, 2, 1, 0, 4.0, OutsideBand::MaskOnly);
        let narrow = FilterCoefficients::identity(1, 1, 0);
        assert_eq!(df.process(&spec, &mask(&fb, 0.5), Some(&narrow), &mut out), 1);
        assert_eq!(out[1], spec[1]);
    }

    #[test]
    fn test_outside_band_modes() {
        let fb = ErbFilterbank::from_widths(&[1, 3]);
        let spec = [c(1.0, 0.0); 4];
        let mut out = [c(0.0, 0.0); 4];
        let m = mask(&fb, 0.25);

        let mut df = DeepFilterSynthesizer::new(4, 1, 2, 0, 4.0, OutsideBand::MaskOnly);
        df.process(&spec, &m, None, &mut out);
        assert!(out.iter().all(|o| *o == c(0.25, 0.0)));

        let mut df = DeepFilterSynthesizer::new(4, 1, 2, 0, 4.0, OutsideBand::Unmodified);
        df.process(&spec, &m, None, &mut out);
        assert_eq!(out[0], c(0.25, 0.0));
        assert!(out[1..].iter().all(|o| *o == c(1.0, 0.0)));
    }

    #[test]
    fn test_reset_clears_history() {
        let fb = ErbFilterbank::from_widths(&[1]);
        let mut df = DeepFilterSynthesizer::new(1, 1, 2, 0, 100.0, OutsideBand::MaskOnly);
        let coefs = FilterCoefficients::from_interleaved(1, 2, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let mut out = [c(0.0, 0.0)];
        df.process(&[c(5.0, 0.0)], &mask(&fb, 1.0), Some(&coefs), &mut out);
        df.reset();
        df.process(&[c(5.0, 0.0)], &mask(&fb, 1.0), Some(&coefs), &mut out);
        assert_eq!(out[0], c(0.0, 0.0));
    }
}
