// packages/engine/src/triggers/mod.rs
//! Non-HTTP triggers: cron schedules and the boot manifest

pub mod manifest;
pub mod scheduler;

pub use manifest::{Applied, Manifest};
pub use scheduler::{parse_cron, Fired, Schedule, Scheduler};
