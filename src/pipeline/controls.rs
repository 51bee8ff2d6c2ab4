use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const DEFAULT_THRESHOLD: f32 = 0.45;

/// User-facing knobs read by the loops on every iteration. Each field is an
/// independent scalar with last-write-wins semantics.
#[derive(Debug)]
pub struct Controls {
    threshold_bits: AtomicU32,
    paused: AtomicBool,
    filter_duplicates: AtomicBool,
}

impl Controls {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold_bits: AtomicU32::new(threshold.to_bits()),
            paused: AtomicBool::new(false),
            filter_duplicates: AtomicBool::new(true),
        }
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.threshold_bits
            .store(threshold.to_bits(), Ordering::Relaxed);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn filter_duplicates(&self) -> bool {
        self.filter_duplicates.load(Ordering::Relaxed)
    }

    pub fn set_filter_duplicates(&self, enabled: bool) {
        self.filter_duplicates.store(enabled, Ordering::Relaxed);
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_round_trips_through_bits() {
        let controls = Controls::default();
        assert_eq!(controls.threshold(), DEFAULT_THRESHOLD);
        controls.set_threshold(0.7);
        assert_eq!(controls.threshold(), 0.7);
    }

    #[test]
    fn flags_default_to_live_filtered() {
        let controls = Controls::default();
        assert!(!controls.paused());
        assert!(controls.filter_duplicates());
        controls.set_paused(true);
        controls.set_filter_duplicates(false);
        assert!(controls.paused());
        assert!(!controls.filter_duplicates());
    }
}
