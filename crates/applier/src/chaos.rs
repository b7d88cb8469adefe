use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Failure-injection hooks, consulted by every flush job at four
/// checkpoints. Two flavours exist: `throw_*` hooks abort the job with an
/// error (as a crashed worker would), `fail_*` hooks make it report
/// WRITE_FAILED without raising. Injected failures are indistinguishable
/// from real ones and exercise the same requeue path.
pub trait ChaosMonkey: Send + Sync {
    fn throw_after_task_submitted(&self) -> bool {
        false
    }
    fn fail_after_task_submitted(&self) -> bool {
        false
    }
    fn throw_for_task_in_progress(&self) -> bool {
        false
    }
    fn fail_for_task_in_progress(&self) -> bool {
        false
    }
    fn throw_before_flush(&self) -> bool {
        false
    }
    fn fail_during_flush(&self) -> bool {
        false
    }
}

/// Production default: no injected failures.
#[derive(Debug, Default)]
pub struct NoChaos;

impl ChaosMonkey for NoChaos {}

/// Fires each hook independently with the configured probability.
pub struct ProbabilisticChaos {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl ProbabilisticChaos {
    /// Production deployments run at 1%.
    pub const DEFAULT_PROBABILITY: f64 = 0.01;

    pub fn new(probability: f64) -> Self {
        Self {
            probability,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic across runs for a given seed; used by the chaos
    /// tolerance tests.
    pub fn seeded(probability: f64, seed: u64) -> Self {
        Self {
            probability,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn roll(&self) -> bool {
        let mut rng = self.rng.lock().expect("chaos rng lock poisoned");
        rng.gen::<f64>() < self.probability
    }
}

impl ChaosMonkey for ProbabilisticChaos {
    fn throw_after_task_submitted(&self) -> bool {
        self.roll()
    }
    fn fail_after_task_submitted(&self) -> bool {
        self.roll()
    }
    fn throw_for_task_in_progress(&self) -> bool {
        self.roll()
    }
    fn fail_for_task_in_progress(&self) -> bool {
        self.roll()
    }
    fn throw_before_flush(&self) -> bool {
        self.roll()
    }
    fn fail_during_flush(&self) -> bool {
        self.roll()
    }
}

/// Deterministic chaos for tests: fires a fixed number of exception-flavour
/// failures (at the before-flush checkpoint) and silent-flavour failures
/// (at the during-flush checkpoint), then goes quiet.
pub struct ScriptedChaos {
    throws_remaining: std::sync::atomic::AtomicUsize,
    silent_remaining: std::sync::atomic::AtomicUsize,
}

impl ScriptedChaos {
    pub fn new(throws: usize, silent_failures: usize) -> Self {
        Self {
            throws_remaining: std::sync::atomic::AtomicUsize::new(throws),
            silent_remaining: std::sync::atomic::AtomicUsize::new(silent_failures),
        }
    }

    fn consume(budget: &std::sync::atomic::AtomicUsize) -> bool {
        budget
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
    }
}

impl ChaosMonkey for ScriptedChaos {
    fn throw_before_flush(&self) -> bool {
        Self::consume(&self.throws_remaining)
    }

    fn fail_during_flush(&self) -> bool {
        Self::consume(&self.silent_remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_probability_never_fires() {
        let chaos = ProbabilisticChaos::seeded(0.0, 42);
        for _ in 0..1000 {
            assert!(!chaos.throw_before_flush());
            assert!(!chaos.fail_during_flush());
        }
    }

    #[test]
    fn certain_probability_always_fires() {
        let chaos = ProbabilisticChaos::seeded(1.0, 42);
        assert!(chaos.throw_after_task_submitted());
        assert!(chaos.fail_for_task_in_progress());
    }

    #[test]
    fn scripted_budgets_deplete() {
        let chaos = ScriptedChaos::new(1, 2);
        assert!(chaos.throw_before_flush());
        assert!(!chaos.throw_before_flush());
        assert!(chaos.fail_during_flush());
        assert!(chaos.fail_during_flush());
        assert!(!chaos.fail_during_flush());
    }

    #[test]
    fn seeded_sequences_are_reproducible() {
        let a = ProbabilisticChaos::seeded(0.5, 7);
        let b = ProbabilisticChaos::seeded(0.5, 7);
        let rolls_a: Vec<bool> = (0..64).map(|_| a.fail_during_flush()).collect();
        let rolls_b: Vec<bool> = (0..64).map(|_| b.fail_during_flush()).collect();
        assert_eq!(rolls_a, rolls_b);
    }
}
