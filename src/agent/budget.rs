//! Turn and wall-clock budgets for one agent session

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Ceiling on how much work one session may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Model rounds (request + handling of the response)
    pub max_turns: usize,
    /// Total session wall time; unlimited when `None`
    pub max_duration: Option<Duration>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_duration: None,
        }
    }
}

impl Budget {
    pub fn turns(max_turns: usize) -> Self {
        Self {
            max_turns,
            ..Self::default()
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }
}

/// Which ceiling a session ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhaustion {
    Turns,
    WallClock,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::Turns => f.write_str("turn budget exhausted"),
            Exhaustion::WallClock => f.write_str("time budget exhausted"),
        }
    }
}

/// Consumes a [`Budget`] monotonically
#[derive(Debug)]
pub struct BudgetTracker {
    budget: Budget,
    used: usize,
    started: Instant,
}

impl BudgetTracker {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            used: 0,
            started: Instant::now(),
        }
    }

    /// Take one turn, or report which ceiling was hit
    ///
    /// The wall clock is checked first, so an expired session never starts
    /// another round.
    pub fn try_consume_turn(&mut self) -> Result<usize, Exhaustion> {
        if self.remaining_time() == Some(Duration::ZERO) {
            return Err(Exhaustion::WallClock);
        }
        if self.used >= self.budget.max_turns {
            return Err(Exhaustion::Turns);
        }
        self.used += 1;
        Ok(self.used)
    }

    pub fn turns_used(&self) -> usize {
        self.used
    }

    pub fn turns_remaining(&self) -> usize {
        self.budget.max_turns.saturating_sub(self.used)
    }

    /// Time left, `None` when the session has no time ceiling
    pub fn remaining_time(&self) -> Option<Duration> {
        self.budget
            .max_duration
            .map(|max| max.saturating_sub(self.started.elapsed()))
    }

    /// Instant the time ceiling runs out
    pub fn deadline(&self) -> Option<Instant> {
        self.budget.max_duration.map(|max| self.started + max)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_consumed_until_exhausted() {
        let mut tracker = BudgetTracker::new(Budget::turns(2));
        assert_eq!(tracker.try_consume_turn(), Ok(1));
        assert_eq!(tracker.try_consume_turn(), Ok(2));
        assert_eq!(tracker.try_consume_turn(), Err(Exhaustion::Turns));
        assert_eq!(tracker.turns_used(), 2);
        assert_eq!(tracker.turns_remaining(), 0);
    }

    #[test]
    fn test_zero_turn_budget() {
        let mut tracker = BudgetTracker::new(Budget::turns(0));
        assert_eq!(tracker.try_consume_turn(), Err(Exhaustion::Turns));
    }

    #[test]
    fn test_wall_clock_checked_first() {
        let mut tracker = BudgetTracker::new(Budget::turns(5).with_max_duration(Duration::ZERO));
        assert_eq!(tracker.try_consume_turn(), Err(Exhaustion::WallClock));
        assert_eq!(tracker.turns_used(), 0);
    }

    #[test]
    fn test_no_time_ceiling() {
        let tracker = BudgetTracker::new(Budget::default());
        assert_eq!(tracker.remaining_time(), None);
        assert_eq!(tracker.budget().max_turns, 10);
    }
}
