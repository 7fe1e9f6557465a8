//! Bounded concurrency gate.

/// Counts in-flight requests against a fixed ceiling.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    active: usize,
    max_concurrent: usize,
    peak: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: 0,
            max_concurrent: max_concurrent.max(1),
            peak: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active < self.max_concurrent
    }

    /// Admit one request. Returns `false` without side effects when full.
    pub fn try_enter(&mut self) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.active += 1;
        self.peak = self.peak.max(self.active);
        true
    }

    pub fn leave(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Highest number of simultaneously admitted requests seen so far.
    pub fn peak(&self) -> usize {
        self.peak
    }
}
