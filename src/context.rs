//! Simulation context
//!
//! Carries the parsed settings and the single authoritative "now" every
//! component observes. Constructed once by the runner and advanced only by
//! the time driver loop, so time is monotonic for all observers.

use chrono::{DateTime, Utc};

use crate::config::Settings;

#[derive(Debug)]
pub struct Context {
    pub settings: Settings,
    now: DateTime<Utc>,
}

impl Context {
    pub fn new(settings: Settings) -> Self {
        let now = settings.start_time;
        Self { settings, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Advance "now". Time never runs backwards.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        debug_assert!(now >= self.now);
        self.now = now;
    }
}
