//! Enhancer configuration.
//!
//! The core never loads configuration by itself: an external loader hands it an
//! [`EnhancerConfig`], either deserialized (any serde format) or built from a
//! DeepFilterNet model directory via [`EnhancerConfig::from_model_dir`].

use crate::deep_filter::OutsideBand;
use crate::features::ErbScaling;
use crate::ring::OverflowPolicy;
use crate::transform::{cola_error, efficient_fft_len, WindowKind};
use crate::{DfError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const SAMPLE_RATE: usize = 48000;
pub const FFT_SIZE: usize = 960;
pub const HOP_SIZE: usize = 480;
pub const FREQ_SIZE: usize = FFT_SIZE / 2 + 1;
pub const NB_ERB: usize = 32;
pub const NB_DF: usize = 96;
pub const DF_ORDER: usize = 5;
pub const DEFAULT_NORM_ALPHA: f32 = 0.99;
// Match DeepFilterNet CLI defaults (enhance_wav.rs)
pub const MIN_DB_THRESH: f32 = -15.0;
pub const MAX_DB_ERB_THRESH: f32 = 35.0;
pub const MAX_DB_DF_THRESH: f32 = 35.0;

/// All tunables consumed by the processing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    pub sample_rate: usize,
    pub fft_size: usize,
    pub hop_size: usize,
    pub nb_erb: usize,
    pub nb_df: usize,
    /// Deep-filter taps per bin.
    pub df_order: usize,
    /// Future frames the deep filter looks at past its target frame.
    pub df_lookahead: usize,
    /// Future frames seen by the encoder convolutions.
    pub conv_lookahead: usize,
    /// Temporal kernel of the encoder input convolution.
    pub enc_kernel_t: usize,
    pub min_nb_erb_freqs: usize,
    /// EMA factor shared by both feature normalizers.
    pub norm_alpha: f32,
    /// Upper bound on the linear gain the deep filter may apply to a bin.
    pub max_gain: f32,
    pub inference_timeout_ms: u64,
    pub min_db_thresh: f32,
    pub max_db_erb_thresh: f32,
    pub max_db_df_thresh: f32,
    pub erb_scaling: ErbScaling,
    pub window: WindowKind,
    pub outside_band: OutsideBand,
    /// Absolute sample value above which an input sample is rejected.
    pub sample_limit: f32,
    /// Capacity in samples of each I/O ring.
    pub ring_capacity: usize,
    pub capture_overflow: OverflowPolicy,
    pub render_overflow: OverflowPolicy,
    /// Encoder carries `h0 -> h1` recurrent state between frames.
    pub stateful: bool,
    pub enc_hidden_dim: usize,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            fft_size: FFT_SIZE,
            hop_size: HOP_SIZE,
            nb_erb: NB_ERB,
            nb_df: NB_DF,
            df_order: DF_ORDER,
            df_lookahead: 0,
            conv_lookahead: 0,
            enc_kernel_t: 1,
            min_nb_erb_freqs: 2,
            norm_alpha: DEFAULT_NORM_ALPHA,
            max_gain: 4.0,
            inference_timeout_ms: 20,
            min_db_thresh: MIN_DB_THRESH,
            max_db_erb_thresh: MAX_DB_ERB_THRESH,
            max_db_df_thresh: MAX_DB_DF_THRESH,
            erb_scaling: ErbScaling::UnitSqrt,
            window: WindowKind::Vorbis,
            outside_band: OutsideBand::MaskOnly,
            sample_limit: 1.0,
            ring_capacity: HOP_SIZE * 8,
            capture_overflow: OverflowPolicy::Overwrite,
            render_overflow: OverflowPolicy::Truncate,
            stateful: true,
            enc_hidden_dim: 256,
        }
    }
}

impl EnhancerConfig {
    /// Build a configuration from a DeepFilterNet model directory.
    ///
    /// Reads `config.ini` if present; every missing key keeps its default.
    /// Folders ending in `_h0` select the stateful encoder contract.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let folder_name = model_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let config_path = model_dir.join("config.ini");
        let content = if config_path.exists() {
            fs::read_to_string(&config_path)?
        } else {
            log::debug!("{} not found, using defaults", config_path.display());
            String::new()
        };

        let mut cfg = Self::from_ini_str(&content)?;
        cfg.stateful = folder_name.ends_with("_h0");
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse DeepFilterNet `config.ini` content on top of the defaults.
    ///
    /// A line that is neither a section, a comment nor `key = value`, or a
    /// known key whose value does not parse, is a [`DfError::Config`] naming
    /// the line.
    pub fn from_ini_str(content: &str) -> Result<Self> {
        let params = IniParams::read(content)?;
        let mut cfg = Self::default();

        let usize_keys: [(&str, &mut usize); 11] = [
            ("sr", &mut cfg.sample_rate),
            ("fft_size", &mut cfg.fft_size),
            ("hop_size", &mut cfg.hop_size),
            ("nb_erb", &mut cfg.nb_erb),
            ("nb_df", &mut cfg.nb_df),
            ("df_order", &mut cfg.df_order),
            ("df_lookahead", &mut cfg.df_lookahead),
            ("conv_lookahead", &mut cfg.conv_lookahead),
            ("min_nb_erb_freqs", &mut cfg.min_nb_erb_freqs),
            ("emb_hidden_dim", &mut cfg.enc_hidden_dim),
            // `conv_kernel_inp = 3,3` lists (time, freq)
            ("conv_kernel_inp", &mut cfg.enc_kernel_t),
        ];
        for (key, field) in usize_keys {
            if let Some(v) = params.get::<usize>(key)? {
                *field = v;
            }
        }
        if let Some(tau) = params.get::<f32>("norm_tau")? {
            cfg.norm_alpha = norm_alpha_from_tau(tau, cfg.hop_size, cfg.sample_rate);
        }
        Ok(cfg)
    }

    pub fn freq_size(&self) -> usize {
        efficient_fft_len(self.fft_size) / 2 + 1
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// Frames between the newest analysed frame and the frame being enhanced.
    pub fn lookahead(&self) -> usize {
        self.df_lookahead.max(self.conv_lookahead)
    }

    /// Feature frames fed to the encoder per call (`T` of its inputs).
    ///
    /// Stateless graphs rebuild their temporal context from the window alone,
    /// so they also see the look-ahead on both sides.
    pub fn enc_window(&self) -> usize {
        if self.stateful {
            self.enc_kernel_t
        } else {
            self.enc_kernel_t + 2 * self.lookahead().max(1)
        }
    }

    /// Algorithmic delay in samples: the overlap-add transform plus the
    /// look-ahead frames.
    pub fn latency_samples(&self) -> usize {
        self.fft_size - self.hop_size + self.lookahead() * self.hop_size
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(DfError::Config(msg));
        if self.sample_rate == 0 || self.fft_size == 0 || self.hop_size == 0 {
            return fail("sample_rate, fft_size and hop_size must be non-zero".into());
        }
        if self.hop_size > self.fft_size {
            return fail(format!("hop_size {} exceeds fft_size {}", self.hop_size, self.fft_size));
        }
        if self.fft_size % self.hop_size != 0 {
            return fail(format!(
                "fft_size {} must be a multiple of hop_size {}",
                self.fft_size, self.hop_size
            ));
        }
        let cola = cola_error(self.window, self.fft_size, self.hop_size);
        if cola > 1e-3 {
            return fail(format!(
                "{:?} window does not overlap-add to a constant at hop {} (deviation {:.4})",
                self.window, self.hop_size, cola
            ));
        }
        let freq_size = self.freq_size();
        if self.nb_erb == 0 || self.nb_erb > freq_size {
            return fail(format!("nb_erb {} out of range 1..={}", self.nb_erb, freq_size));
        }
        if self.nb_df == 0 || self.nb_df > freq_size {
            return fail(format!("nb_df {} out of range 1..={}", self.nb_df, freq_size));
        }
        if self.df_order == 0 {
            return fail("df_order must be at least 1".into());
        }
        if self.lookahead() >= self.df_order {
            return fail(format!(
                "lookahead {} must be smaller than df_order {}",
                self.lookahead(),
                self.df_order
            ));
        }
        if self.enc_kernel_t == 0 {
            return fail("enc_kernel_t must be at least 1".into());
        }
        if !(self.norm_alpha > 0.0 && self.norm_alpha < 1.0) {
            return fail(format!("norm_alpha {} must lie in (0, 1)", self.norm_alpha));
        }
        if !(self.max_gain >= 1.0) {
            return fail(format!("max_gain {} must be >= 1", self.max_gain));
        }
        if self.inference_timeout_ms == 0 {
            return fail("inference_timeout_ms must be non-zero".into());
        }
        if !(self.sample_limit > 0.0) {
            return fail(format!("sample_limit {} must be positive", self.sample_limit));
        }
        if self.ring_capacity < 2 * self.hop_size {
            return fail(format!(
                "ring_capacity {} must hold at least two frames of {}",
                self.ring_capacity, self.hop_size
            ));
        }
        if self.stateful && self.enc_hidden_dim == 0 {
            return fail("stateful encoder needs enc_hidden_dim > 0".into());
        }
        Ok(())
    }
}

/// Match python `get_norm_alpha` rounding behavior.
fn norm_alpha_from_tau(tau: f32, hop_size: usize, sample_rate: usize) -> f32 {
    let dt = hop_size as f32 / sample_rate as f32;
    let a = f32::exp(-dt / tau);
    let mut precision: u32 = 3;
    let mut rounded = 1.0f32;
    while rounded >= 1.0 && precision < 10 {
        let scale = 10f32.powi(precision as i32);
        rounded = (a * scale).round() / scale;
        precision += 1;
    }
    rounded
}

/// `key = value` pairs of a DeepFilterNet `config.ini`, sections flattened.
struct IniParams {
    /// key -> (1-based line, raw value)
    entries: HashMap<String, (usize, String)>,
}

impl IniParams {
    fn read(content: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('[') || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    entries.insert(key.trim().to_string(), (idx + 1, value.trim().to_string()));
                }
                _ => {
                    return Err(DfError::Config(format!(
                        "config.ini line {}: expected `key = value`, got '{}'",
                        idx + 1,
                        line
                    )))
                }
            }
        }
        Ok(Self { entries })
    }

    /// Value of `key`; list values (`3,3`) yield their first element.
    fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some((line, value)) = self.entries.get(key) else {
            return Ok(None);
        };
        let first = value.split(',').next().unwrap_or_default().trim();
        first.parse::<T>().map(Some).map_err(|_| {
            DfError::Config(format!("config.ini line {}: invalid value '{}' for {}", line, value, key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EnhancerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.freq_size(), FREQ_SIZE);
        assert_eq!(cfg.latency_samples(), 480);
    }

    #[test]
    fn test_ini_overrides() {
        let ini = "[df]\nsr = 48000\nnb_erb = 24\n# comment\nnorm_tau = 1\n[deepfilternet]\nemb_hidden_dim = 128\n";
        let cfg = EnhancerConfig::from_ini_str(ini).unwrap();
        assert_eq!(cfg.nb_erb, 24);
        assert_eq!(cfg.enc_hidden_dim, 128);
        assert_eq!(cfg.nb_df, NB_DF);
        // exp(-0.01) = 0.99005 -> rounded to 3 digits
        assert!((cfg.norm_alpha - 0.99).abs() < 1e-6, "alpha {}", cfg.norm_alpha);
    }

    #[test]
    fn test_dfn3_lookahead_geometry() {
        let ini = "[df]\ndf_lookahead = 2\n[deepfilternet]\nconv_lookahead = 2\nconv_kernel_inp = 3,3\n";
        let mut cfg = EnhancerConfig::from_ini_str(ini).unwrap();
        cfg.validate().unwrap();
        assert_eq!((cfg.lookahead(), cfg.enc_kernel_t), (2, 3));
        assert_eq!(cfg.latency_samples(), 480 + 2 * 480);
        assert_eq!(cfg.enc_window(), 3);
        cfg.stateful = false;
        assert_eq!(cfg.enc_window(), 3 + 4);

        cfg.df_lookahead = cfg.df_order;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_malformed_ini_reports_line() {
        let err = EnhancerConfig::from_ini_str("[df]\nsr = 48000\nnb_erb 32\n").unwrap_err();
        assert!(err.to_string().contains("line 3"), "{}", err);

        let err = EnhancerConfig::from_ini_str("[df]\n\nhop_size = ten\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 3") && msg.contains("hop_size"), "{}", msg);

        // Keys this crate does not read are not interpreted.
        assert!(EnhancerConfig::from_ini_str("model = deepfilternet3\n").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut cfg = EnhancerConfig::default();
        cfg.hop_size = 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = EnhancerConfig::default();
        cfg.nb_df = 10_000;
        assert!(cfg.validate().is_err());

        let mut cfg = EnhancerConfig::default();
        cfg.max_gain = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EnhancerConfig::default();
        cfg.ring_capacity = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_model_dir_uses_defaults() {
        let dir = std::env::temp_dir().join("df_stream_missing_model_h0");
        let cfg = EnhancerConfig::from_model_dir(&dir).unwrap();
        assert!(cfg.stateful);
        assert_eq!(cfg.fft_size, FFT_SIZE);
    }
}
