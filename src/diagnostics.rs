//! Observability counters.
//!
//! Counters are written by the processing context and may be read from any
//! thread. They never feed back into the data path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Log the first occurrence of a condition and then every 100th.
pub(crate) fn log_gate(count: u64) -> bool {
    count == 1 || count % 100 == 0
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    frames_processed: AtomicU64,
    frames_enhanced: AtomicU64,
    frames_bypassed: AtomicU64,
    frames_sanitized: AtomicU64,
    invalid_samples: AtomicU64,
    invalid_feature_steps: AtomicU64,
    invalid_model_values: AtomicU64,
    df_cells_skipped: AtomicU64,
    inference_failures: AtomicU64,
    inference_timeouts: AtomicU64,
    resets: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub frames_processed: u64,
    pub frames_enhanced: u64,
    pub frames_bypassed: u64,
    pub frames_sanitized: u64,
    pub invalid_samples: u64,
    pub invalid_feature_steps: u64,
    pub invalid_model_values: u64,
    pub df_cells_skipped: u64,
    pub inference_failures: u64,
    pub inference_timeouts: u64,
    pub resets: u64,
}

macro_rules! counters {
    ($($name:ident => $add:ident),* $(,)?) => {
        impl Diagnostics {
            $(
                pub(crate) fn $add(&self, n: u64) -> u64 {
                    self.$name.fetch_add(n, Ordering::Relaxed) + n
                }
            )*

            pub fn snapshot(&self) -> DiagnosticsSnapshot {
                DiagnosticsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    frames_processed => add_processed,
    frames_enhanced => add_enhanced,
    frames_bypassed => add_bypassed,
    frames_sanitized => add_sanitized,
    invalid_samples => add_invalid_samples,
    invalid_feature_steps => add_invalid_features,
    invalid_model_values => add_invalid_model_values,
    df_cells_skipped => add_df_cells_skipped,
    inference_failures => add_inference_failures,
    inference_timeouts => add_inference_timeouts,
    resets => add_resets,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let d = Diagnostics::new();
        assert_eq!(d.add_processed(1), 1);
        assert_eq!(d.add_processed(2), 3);
        d.add_df_cells_skipped(5);
        let s = d.snapshot();
        assert_eq!(s.frames_processed, 3);
        assert_eq!(s.df_cells_skipped, 5);
        assert_eq!(s.inference_timeouts, 0);
    }

    #[test]
    fn test_log_gate() {
        assert!(log_gate(1));
        assert!(!log_gate(2));
        assert!(log_gate(200));
    }
}
