pub mod cron_schedule;
pub mod poll_interval;
