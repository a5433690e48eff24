//! Input sample validation.
//!
//! Offending samples are replaced by silence in place. A frame that carried
//! any non-finite sample is reported as a dropout so the pipeline can silence
//! it entirely without touching model state.

/// What [`FrameSanitizer::sanitize`] found in one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub non_finite: usize,
    pub out_of_range: usize,
    pub subnormal: usize,
}

impl SanitizeReport {
    pub fn total(&self) -> usize {
        self.non_finite + self.out_of_range + self.subnormal
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    /// A NaN/Inf sample means the capture collaborator handed us garbage.
    pub fn is_dropout(&self) -> bool {
        self.non_finite > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSanitizer {
    limit: f32,
}

impl FrameSanitizer {
    pub fn new(limit: f32) -> Self {
        Self { limit }
    }

    pub fn sanitize(&self, frame: &mut [f32]) -> SanitizeReport {
        let mut report = SanitizeReport::default();
        for x in frame.iter_mut() {
            if !x.is_finite() {
                report.non_finite += 1;
                *x = 0.0;
            } else if x.abs() > self.limit {
                report.out_of_range += 1;
                *x = 0.0;
            } else if x.is_subnormal() {
                report.subnormal += 1;
                *x = 0.0;
            }
        }
        report
    }
}
