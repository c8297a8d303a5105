//! When to stop running cranks.

use crate::crank::CrankOutcome;

/// Consulted after every crank of [`crate::Kernel::run`].
pub trait RunPolicy {
    /// Checked before the first crank.
    fn may_start(&self) -> bool {
        true
    }

    /// Return `false` to stop after this crank.
    fn crank_complete(&mut self, outcome: &CrankOutcome) -> bool;
}

/// Run until the run queue is empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct Forever;

impl RunPolicy for Forever {
    fn crank_complete(&mut self, _outcome: &CrankOutcome) -> bool {
        true
    }
}

/// Run at most `n` cranks.
#[derive(Clone, Copy, Debug)]
pub struct CrankBudget {
    remaining: u64,
}

impl CrankBudget {
    pub fn new(cranks: u64) -> Self {
        CrankBudget { remaining: cranks }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl RunPolicy for CrankBudget {
    fn may_start(&self) -> bool {
        self.remaining > 0
    }

    fn crank_complete(&mut self, _outcome: &CrankOutcome) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_counts_down() {
        let mut budget = CrankBudget::new(2);
        assert!(budget.crank_complete(&CrankOutcome::KernelOnly));
        assert!(!budget.crank_complete(&CrankOutcome::KernelOnly));
        assert_eq!(budget.remaining(), 0);
        assert!(!CrankBudget::new(0).may_start());
    }
}
