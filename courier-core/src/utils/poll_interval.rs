//! Adaptive publish interval.
//!
//! The publisher starts `Idle` and sleeps the slow interval. Any cycle that
//! moves at least one record switches it to `Active` (fast interval); it falls
//! back to `Idle` after `idle_cycles_before_slow` empty cycles in a row.

use crate::config::PollSettings;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollState {
    #[default]
    Idle,
    Active,
}

#[derive(Debug, Clone, Default)]
pub struct AdaptiveInterval {
    state: PollState,
    empty_streak: u32,
}

impl AdaptiveInterval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Feed the number of records a cycle processed; returns how long to
    /// sleep before the next cycle.
    pub fn observe(&mut self, processed: usize, settings: &PollSettings) -> Duration {
        if processed > 0 {
            self.state = PollState::Active;
            self.empty_streak = 0;
        } else if self.state == PollState::Active {
            self.empty_streak += 1;
            if self.empty_streak >= settings.idle_cycles_before_slow {
                self.state = PollState::Idle;
                self.empty_streak = 0;
            }
        }
        self.interval(settings)
    }

    pub fn interval(&self, settings: &PollSettings) -> Duration {
        match self.state {
            PollState::Idle => settings.slow_interval,
            PollState::Active => settings.fast_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PollSettings {
        PollSettings {
            fast_interval: Duration::from_secs(1),
            slow_interval: Duration::from_secs(30),
            idle_cycles_before_slow: 10,
        }
    }

    #[test]
    fn test_starts_idle_on_slow_interval() {
        let interval = AdaptiveInterval::new();
        assert_eq!(interval.state(), PollState::Idle);
        assert_eq!(interval.interval(&settings()), Duration::from_secs(30));
    }

    #[test]
    fn test_busy_cycle_switches_to_fast() {
        let mut interval = AdaptiveInterval::new();
        assert_eq!(interval.observe(3, &settings()), Duration::from_secs(1));
        assert_eq!(interval.state(), PollState::Active);
    }

    #[test]
    fn test_reverts_to_slow_after_ten_empty_cycles() {
        let settings = settings();
        let mut interval = AdaptiveInterval::new();
        interval.observe(1, &settings);

        for _ in 0..9 {
            assert_eq!(interval.observe(0, &settings), settings.fast_interval);
        }
        assert_eq!(interval.observe(0, &settings), settings.slow_interval);
        assert_eq!(interval.state(), PollState::Idle);
    }

    #[test]
    fn test_busy_cycle_resets_empty_streak() {
        let settings = settings();
        let mut interval = AdaptiveInterval::new();
        interval.observe(1, &settings);
        for _ in 0..9 {
            interval.observe(0, &settings);
        }
        interval.observe(2, &settings);
        for _ in 0..9 {
            assert_eq!(interval.observe(0, &settings), settings.fast_interval);
        }
    }

    #[test]
    fn test_empty_cycles_while_idle_stay_slow() {
        let settings = settings();
        let mut interval = AdaptiveInterval::new();
        for _ in 0..25 {
            assert_eq!(interval.observe(0, &settings), settings.slow_interval);
        }
    }
}
