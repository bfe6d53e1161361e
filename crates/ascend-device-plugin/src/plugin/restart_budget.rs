use std::time::Duration;
use std::time::Instant;

use error_stack::Report;

use super::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBudgetConfig {
    /// Crashes tolerated inside one window
    pub max_crashes: u32,
    /// A crash further than this from the previous one starts a new count
    pub window: Duration,
}

impl Default for RestartBudgetConfig {
    fn default() -> Self {
        Self {
            max_crashes: 5,
            window: Duration::from_secs(3600),
        }
    }
}

/// Counts server crashes that follow each other closely.
#[derive(Debug)]
pub struct RestartBudget {
    config: RestartBudgetConfig,
    crashes: u32,
    last_crash: Instant,
}

impl RestartBudget {
    /// `started_at` counts as the previous crash for the first one.
    pub fn new(config: RestartBudgetConfig, started_at: Instant) -> Self {
        Self {
            config,
            crashes: 0,
            last_crash: started_at,
        }
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    /// Record a crash at `now`.
    ///
    /// # Errors
    ///
    /// - [`PluginError::RestartBudgetExhausted`] once more than
    ///   `max_crashes` crashes occurred, each within `window` of the previous
    pub fn record_crash(&mut self, now: Instant) -> Result<(), Report<PluginError>> {
        if now.saturating_duration_since(self.last_crash) > self.config.window {
            self.crashes = 1;
        } else {
            self.crashes += 1;
        }
        self.last_crash = now;

        if self.crashes > self.config.max_crashes {
            return Err(Report::new(PluginError::RestartBudgetExhausted {
                crashes: self.crashes,
                window_secs: self.config.window.as_secs(),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn sixth_crash_within_window_is_fatal() {
        let start = Instant::now();
        let mut budget = RestartBudget::new(RestartBudgetConfig::default(), start);

        for i in 1..=5 {
            budget
                .record_crash(start + MINUTE * i)
                .expect("crash within budget");
        }
        assert_eq!(budget.crashes(), 5);

        let err = budget
            .record_crash(start + MINUTE * 6)
            .expect_err("sixth crash should exhaust the budget");
        assert!(matches!(
            err.current_context(),
            PluginError::RestartBudgetExhausted { crashes: 6, .. }
        ));
    }

    #[test]
    fn isolated_crash_resets_count() {
        let start = Instant::now();
        let mut budget = RestartBudget::new(RestartBudgetConfig::default(), start);

        for i in 1..=5 {
            budget.record_crash(start + MINUTE * i).expect("within budget");
        }

        let later = start + MINUTE * 5 + Duration::from_secs(2 * 3600);
        budget.record_crash(later).expect("isolated crash is tolerated");
        assert_eq!(budget.crashes(), 1);

        for i in 1..=4 {
            budget.record_crash(later + MINUTE * i).expect("within budget");
        }
        assert!(budget.record_crash(later + MINUTE * 5).is_err());
    }

    #[test]
    fn spaced_crashes_never_exhaust() {
        let config = RestartBudgetConfig {
            max_crashes: 1,
            window: MINUTE,
        };
        let start = Instant::now();
        let mut budget = RestartBudget::new(config, start);

        for i in 1..=10 {
            budget
                .record_crash(start + MINUTE * 2 * i)
                .expect("crashes are far apart");
        }
        assert_eq!(budget.crashes(), 1);
    }
}
