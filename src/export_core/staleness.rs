//! Frozen depth detection
//!
//! Providers hand back a cached book when the subscription silently dies. Exact
//! repeats of the ask vector are counted; once the run reaches the threshold the
//! snapshot is discarded instead of feeding frozen depth into urgency math.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Differs from the previous accepted vector (or there was none)
    Fresh,
    /// Identical to the previous vector, run still below the threshold
    Repeated(u32),
    /// Identical and the run has reached the threshold; degrade the source
    Stale(u32),
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale(_))
    }
}

pub struct StalenessDetector {
    threshold: u32,
    repeat_count: u32,
    last_ask: Option<Vec<f64>>,
}

impl StalenessDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            repeat_count: 0,
            last_ask: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(5)
    }

    /// Classify the ask vector against the accepted baseline without recording it
    pub fn peek(&self, ask: &[f64]) -> Freshness {
        match &self.last_ask {
            Some(prev) if prev.as_slice() == ask => {
                let run = self.repeat_count.saturating_add(1);
                if run >= self.threshold {
                    Freshness::Stale(run)
                } else {
                    Freshness::Repeated(run)
                }
            }
            _ => Freshness::Fresh,
        }
    }

    /// Accept the post-normalization ask vector and advance the repeat run
    pub fn observe(&mut self, ask: &[f64]) -> Freshness {
        let freshness = self.peek(ask);
        match freshness {
            Freshness::Fresh => {
                self.repeat_count = 0;
                self.last_ask = Some(ask.to_vec());
            }
            Freshness::Repeated(run) | Freshness::Stale(run) => self.repeat_count = run,
        }
        freshness
    }

    /// Capture failed: forget the baseline entirely
    pub fn reset(&mut self) {
        self.repeat_count = 0;
        self.last_ask = None;
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_snapshot_is_fresh() {
        let mut detector = StalenessDetector::with_defaults();
        assert_eq!(detector.observe(&[1.0, 2.0]), Freshness::Fresh);
        assert_eq!(detector.repeat_count(), 0);
    }

    #[test]
    fn test_degrades_after_threshold_repeats() {
        let mut detector = StalenessDetector::new(3);
        let frozen = [1.0, 2.0, 3.0];

        assert_eq!(detector.observe(&frozen), Freshness::Fresh);
        assert_eq!(detector.observe(&frozen), Freshness::Repeated(1));
        assert_eq!(detector.observe(&frozen), Freshness::Repeated(2));
        assert_eq!(detector.observe(&frozen), Freshness::Stale(3));
        // Stays degraded; the discard itself does not reset the run
        assert_eq!(detector.observe(&frozen), Freshness::Stale(4));
    }

    #[test]
    fn test_differing_vector_resets_run() {
        let mut detector = StalenessDetector::new(2);
        detector.observe(&[1.0]);
        detector.observe(&[1.0]);
        assert!(detector.observe(&[1.0]).is_stale());

        assert_eq!(detector.observe(&[1.5]), Freshness::Fresh);
        assert_eq!(detector.repeat_count(), 0);
        assert_eq!(detector.observe(&[1.5]), Freshness::Repeated(1));
    }

    #[test]
    fn test_capture_failure_clears_baseline() {
        let mut detector = StalenessDetector::new(2);
        detector.observe(&[4.0]);
        detector.observe(&[4.0]);

        detector.reset();
        assert_eq!(detector.repeat_count(), 0);
        assert_eq!(detector.observe(&[4.0]), Freshness::Fresh);
    }

    #[test]
    fn test_peek_leaves_run_untouched() {
        let mut detector = StalenessDetector::new(2);
        detector.observe(&[7.0]);

        for _ in 0..3 {
            assert_eq!(detector.peek(&[7.0]), Freshness::Repeated(1));
        }
        assert_eq!(detector.repeat_count(), 0);
        assert_eq!(detector.peek(&[8.0]), Freshness::Fresh);
        assert_eq!(detector.observe(&[7.0]), Freshness::Repeated(1));
    }

    #[test]
    fn test_stored_vector_is_a_copy() {
        let mut detector = StalenessDetector::new(5);
        let mut source = vec![1.0, 2.0];
        detector.observe(&source);

        // Source mutates in place; the detector must still see a change
        source[0] = 9.0;
        assert_eq!(detector.observe(&source), Freshness::Fresh);
    }
}
