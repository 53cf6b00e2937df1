use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::StopPredicate;

/// Cooperative cancellation flag shared by every decode step of an in-flight
/// generation. Setting it never preempts anything; the decode loop observes
/// it at the next step boundary, so worst-case cancellation latency is one
/// decode step.
#[derive(Debug, Clone, Default)]
pub struct StoppingSignal {
    interrupted: Arc<AtomicBool>,
}

impl StoppingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl StopPredicate for StoppingSignal {
    fn should_stop(&self, _step: usize, batch_size: usize) -> Vec<bool> {
        vec![self.is_interrupted(); batch_size]
    }
}

#[cfg(test)]
mod tests {
    use super::StoppingSignal;
    use crate::engine::StopPredicate;

    #[test]
    fn starts_clear_and_reads_back_interrupts() {
        let signal = StoppingSignal::new();
        assert!(!signal.is_interrupted());
        signal.interrupt();
        assert!(signal.is_interrupted());
        signal.reset();
        assert!(!signal.is_interrupted());
    }

    #[test]
    fn interrupt_is_visible_through_clones() {
        let signal = StoppingSignal::new();
        let shared = signal.clone();
        signal.interrupt();
        assert!(shared.is_interrupted());
    }

    #[test]
    fn broadcasts_flag_across_the_batch() {
        let signal = StoppingSignal::new();
        assert_eq!(signal.should_stop(0, 3), vec![false, false, false]);
        signal.interrupt();
        assert_eq!(signal.should_stop(1, 3), vec![true, true, true]);
    }

    #[test]
    fn repeated_interrupts_are_idempotent() {
        let signal = StoppingSignal::new();
        signal.interrupt();
        signal.interrupt();
        assert!(signal.is_interrupted());
        signal.reset();
        assert!(!signal.is_interrupted());
    }
}
