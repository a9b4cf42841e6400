//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a turn ends).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, lock-free.
pub struct Metrics {
    executions: AtomicU64,
    faulted_executions: AtomicU64,
    external_calls: AtomicU64,
    validation_rejections: AtomicU64,
    turns_completed: AtomicU64,
    turns_cancelled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            faulted_executions: AtomicU64::new(0),
            external_calls: AtomicU64::new(0),
            validation_rejections: AtomicU64::new(0),
            turns_completed: AtomicU64::new(0),
            turns_cancelled: AtomicU64::new(0),
        }
    }

    /// Count one finished execution; `faulted` also bumps the fault counter.
    pub fn inc_executions(&self, faulted: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if faulted {
            self.faulted_executions.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "executions", faulted, "counter incremented");
    }

    pub fn inc_external_calls(&self) {
        self.external_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "external_calls", "counter incremented");
    }

    pub fn inc_validation_rejections(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validation_rejections", "counter incremented");
    }

    pub fn inc_turns_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "turns_completed", "counter incremented");
    }

    pub fn inc_turns_cancelled(&self) {
        self.turns_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "turns_cancelled", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            executions = self.executions(),
            faulted_executions = self.faulted_executions(),
            external_calls = self.external_calls(),
            validation_rejections = self.validation_rejections(),
            turns_completed = self.turns_completed(),
            turns_cancelled = self.turns_cancelled(),
        );
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn faulted_executions(&self) -> u64 {
        self.faulted_executions.load(Ordering::Relaxed)
    }

    pub fn external_calls(&self) -> u64 {
        self.external_calls.load(Ordering::Relaxed)
    }

    pub fn validation_rejections(&self) -> u64 {
        self.validation_rejections.load(Ordering::Relaxed)
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed.load(Ordering::Relaxed)
    }

    pub fn turns_cancelled(&self) -> u64 {
        self.turns_cancelled.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.faulted_executions.store(0, Ordering::Relaxed);
        self.external_calls.store(0, Ordering::Relaxed);
        self.validation_rejections.store(0, Ordering::Relaxed);
        self.turns_completed.store(0, Ordering::Relaxed);
        self.turns_cancelled.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_executions(false);
        m.inc_executions(true);
        assert_eq!(m.executions(), 2);
        assert_eq!(m.faulted_executions(), 1);

        m.inc_external_calls();
        m.inc_validation_rejections();
        m.inc_turns_completed();
        m.inc_turns_cancelled();
        assert_eq!(m.external_calls(), 1);
        assert_eq!(m.validation_rejections(), 1);
        assert_eq!(m.turns_completed(), 1);
        assert_eq!(m.turns_cancelled(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_executions(true);
        m.inc_external_calls();
        m.inc_turns_completed();
        m.reset();
        assert_eq!(m.executions(), 0);
        assert_eq!(m.faulted_executions(), 0);
        assert_eq!(m.external_calls(), 0);
        assert_eq!(m.turns_completed(), 0);
    }
}
