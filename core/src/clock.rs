//! Run clock: owns the calendar date a run is evaluated against.
//!
//! RULE: Nothing in the pipeline reads the system time directly.
//! Lookback cutoffs and daily file names derive from RunClock::today,
//! so a run can be replayed for any date.

use chrono::{Days, Local, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunClock {
    pub today: NaiveDate,
}

impl RunClock {
    /// Clock pinned to the host's local date.
    pub fn system() -> Self {
        Self {
            today: Local::now().date_naive(),
        }
    }

    /// Clock pinned to a given date (replays and tests).
    pub fn fixed(today: NaiveDate) -> Self {
        Self { today }
    }

    /// `today - days`, saturating at the earliest representable date.
    pub fn days_ago(&self, days: u32) -> NaiveDate {
        self.today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN)
    }
}
