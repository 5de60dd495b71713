//! Cron expressions for the scheduled jobs.
//!
//! Six-field syntax with seconds first (`sec min hour dom month dow`), as the
//! `cron` crate parses it. Times are UTC.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {source}")]
    Invalid {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("cron expression '{0}' has no upcoming run")]
    NoUpcomingRun(String),
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let schedule = cron::Schedule::from_str(expr).map_err(|source| ScheduleError::Invalid {
            expr: expr.to_string(),
            source,
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// Time to sleep from `now` until the next fire time.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Result<Duration, ScheduleError> {
        let next = self
            .next_after(now)
            .ok_or_else(|| ScheduleError::NoUpcomingRun(self.expr.clone()))?;
        Ok((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}
