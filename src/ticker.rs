//! Time driver
//!
//! Lazily produces the strictly increasing sequence of instants that drives
//! the simulation. The sequence is calendar-stepped (every minute / every
//! day) and includes both endpoints.

use chrono::{DateTime, Duration, Utc};
use std::str::FromStr;

use crate::error::SimError;

/// Tick cadence of the simulation clock.
///
/// Tick-level replay is recognised by configuration but not producible here;
/// asking for it (or any other cadence) fails with `unsupported-frequency`
/// until an intra-tick ordering is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Minutely,
    Daily,
}

impl Frequency {
    pub fn step(self) -> Duration {
        match self {
            Frequency::Minutely => Duration::minutes(1),
            Frequency::Daily => Duration::days(1),
        }
    }
}

impl FromStr for Frequency {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Frequency::Minutely),
            "1d" => Ok(Frequency::Daily),
            other => Err(SimError::UnsupportedFrequency(other.to_string())),
        }
    }
}

/// Iterator over the simulation window at a fixed frequency
#[derive(Debug)]
pub struct FrequencyTicker {
    current: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    step: Duration,
}

impl FrequencyTicker {
    /// Build a driver for `[start, end]`. Fails with `setting-error` when
    /// the window is empty.
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        frequency: Frequency,
    ) -> Result<Self, SimError> {
        if start >= end {
            return Err(SimError::Setting(format!(
                "start time {start} must be before end time {end}"
            )));
        }
        Ok(Self {
            current: Some(start),
            end,
            step: frequency.step(),
        })
    }
}

impl Iterator for FrequencyTicker {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        if current > self.end {
            self.current = None;
            return None;
        }
        self.current = Some(current + self.step);
        Some(current)
    }
}
