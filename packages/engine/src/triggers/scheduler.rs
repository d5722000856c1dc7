// packages/engine/src/triggers/scheduler.rs
//! Cron-triggered invocations
//!
//! Expressions use five fields (minute precision) or six/seven fields with
//! seconds, evaluated in UTC. Each due schedule fires once per tick; ticks
//! missed while the engine was busy or down are not replayed.

use crate::codec::Value;
use crate::functions::FunctionRef;
use crate::service::Invoker;
use crate::tracking::{TriggerContext, TriggerKind};
use crate::utils::errors::{EngineError, Result, ValidationError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest the loop sleeps before re-reading the schedule table
const MAX_IDLE: Duration = Duration::from_secs(60);

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    /// `namespace/name` of the function to invoke
    pub function_name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Parse a 5-, 6- or 7-field cron expression
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 | 7 => expression.trim().to_string(),
        n => {
            return Err(EngineError::Validation(ValidationError::new(
                format!("cron expression '{}' has {} fields, expected 5 to 7", expression, n),
                None,
            )))
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        EngineError::Validation(ValidationError::new(
            format!("invalid cron expression '{}': {}", expression, e),
            None,
        ))
    })
}

struct Entry {
    schedule: Schedule,
    function_ref: FunctionRef,
    cron: cron::Schedule,
    next_fire: Option<DateTime<Utc>>,
}

impl Entry {
    fn advance(&mut self, after: DateTime<Utc>) {
        self.next_fire = self.cron.after(&after).next();
    }
}

/// What a tick fired
#[derive(Debug)]
pub struct Fired {
    pub schedule: String,
    pub result: Result<String>,
}

pub struct Scheduler {
    invoker: Arc<dyn Invoker>,
    entries: Mutex<BTreeMap<String, Entry>>,
    changed: Notify,
}

impl Scheduler {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            invoker,
            entries: Mutex::new(BTreeMap::new()),
            changed: Notify::new(),
        }
    }

    /// Add or replace a schedule; the first fire is the next match after now
    pub fn register(&self, schedule: Schedule) -> Result<()> {
        self.register_at(schedule, Utc::now())
    }

    pub fn register_at(&self, schedule: Schedule, now: DateTime<Utc>) -> Result<()> {
        let function_ref: FunctionRef = schedule
            .function_name
            .parse()
            .map_err(|e: String| EngineError::Validation(ValidationError::new(e, None)))?;
        let cron = parse_cron(&schedule.cron_expression)?;

        let mut entry = Entry {
            schedule,
            function_ref,
            cron,
            next_fire: None,
        };
        entry.advance(now);

        info!(
            schedule = %entry.schedule.name,
            function = %entry.function_ref,
            next_fire = ?entry.next_fire,
            "schedule registered"
        );
        self.entries.lock().insert(entry.schedule.name.clone(), entry);
        self.changed.notify_one();
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Schedule> {
        let entry = self
            .entries
            .lock()
            .remove(name)
            .ok_or_else(|| EngineError::NotFound(format!("schedule {}", name)))?;
        self.changed.notify_one();
        info!(schedule = name, "schedule removed");
        Ok(entry.schedule)
    }

    /// Schedules sorted by name
    pub fn list(&self) -> Vec<Schedule> {
        self.entries
            .lock()
            .values()
            .map(|e| e.schedule.clone())
            .collect()
    }

    pub fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().get(name).and_then(|e| e.next_fire)
    }

    /// Collect due schedules and move each past `now`
    fn take_due(&self, now: DateTime<Utc>) -> Vec<(String, FunctionRef, Value)> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            if !entry.schedule.enabled {
                continue;
            }
            if matches!(entry.next_fire, Some(at) if at <= now) {
                due.push((
                    entry.schedule.name.clone(),
                    entry.function_ref.clone(),
                    Value::from_json(entry.schedule.input_data.clone()),
                ));
                entry.advance(now);
            }
        }
        due
    }

    /// Fire everything due at `now` and wait for the invocations
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<Fired> {
        let due = self.take_due(now);
        self.fire(due).await
    }

    async fn fire(&self, due: Vec<(String, FunctionRef, Value)>) -> Vec<Fired> {
        join_all(due.into_iter().map(|(name, function_ref, input)| async move {
            let trigger = TriggerContext::new(TriggerKind::Schedule).with_source(name.clone());
            let result = self.invoker.invoke(&function_ref, input, trigger).await;
            match &result {
                Ok(execution_id) => {
                    debug!(schedule = %name, execution_id = %execution_id, "schedule fired")
                }
                Err(e) => warn!(schedule = %name, error = %e, "scheduled invocation failed"),
            }
            Fired {
                schedule: name,
                result,
            }
        }))
        .await
    }

    fn sleep_for(&self, now: DateTime<Utc>) -> Duration {
        self.entries
            .lock()
            .values()
            .filter(|e| e.schedule.enabled)
            .filter_map(|e| e.next_fire)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_IDLE)
            .min(MAX_IDLE)
    }

    /// Fire schedules until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("scheduler started");
        loop {
            let wait = self.sleep_for(Utc::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.changed.notified() => continue,
                _ = tokio::time::sleep(wait) => {
                    // Advance synchronously so the next wait is computed past this tick
                    let due = self.take_due(Utc::now());
                    if !due.is_empty() {
                        let scheduler = self.clone();
                        tokio::spawn(async move {
                            scheduler.fire(due).await;
                        });
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Value, TriggerContext)>>,
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke(
            &self,
            function_ref: &FunctionRef,
            input: Value,
            trigger: TriggerContext,
        ) -> Result<String> {
            let mut calls = self.calls.lock();
            calls.push((function_ref.to_string(), input, trigger));
            Ok(format!("exec-{}", calls.len()))
        }
    }

    fn schedule(name: &str, cron: &str) -> Schedule {
        Schedule {
            name: name.to_string(),
            function_name: "reports/daily".to_string(),
            cron_expression: cron.to_string(),
            input_data: serde_json::json!({"scope": name}),
            enabled: true,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_cron_field_counts() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("30 */5 * * * *").is_ok());
        assert!(parse_cron("* * *").is_err());
        assert!(parse_cron("99 * * * *").is_err());
    }

    #[test]
    fn test_five_fields_fire_on_the_minute() {
        let cron = parse_cron("*/15 * * * *").unwrap();
        assert_eq!(cron.after(&at(10, 7, 30)).next(), Some(at(10, 15, 0)));
    }

    #[tokio::test]
    async fn test_tick_fires_due_schedules_once() {
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = Scheduler::new(invoker.clone());
        scheduler.register_at(schedule("every-minute", "* * * * *"), at(9, 0, 10)).unwrap();
        scheduler.register_at(schedule("hourly", "0 * * * *"), at(9, 0, 10)).unwrap();

        assert!(scheduler.tick(at(9, 0, 30)).await.is_empty());

        let fired = scheduler.tick(at(9, 1, 0)).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].schedule, "every-minute");
        assert_eq!(fired[0].result.as_deref().ok(), Some("exec-1"));

        let calls = invoker.calls.lock();
        assert_eq!(calls[0].0, "reports/daily");
        assert_eq!(calls[0].2.kind, TriggerKind::Schedule);
        assert_eq!(calls[0].2.source.as_deref(), Some("every-minute"));
        assert_eq!(calls[0].1, Value::from_json(serde_json::json!({"scope": "every-minute"})));
    }

    #[tokio::test]
    async fn test_missed_ticks_not_replayed() {
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = Scheduler::new(invoker.clone());
        scheduler.register_at(schedule("every-minute", "* * * * *"), at(9, 0, 0)).unwrap();

        // Ten minutes late: one fire, next one in the future
        let fired = scheduler.tick(at(9, 10, 30)).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(scheduler.next_fire("every-minute"), Some(at(9, 11, 0)));
    }

    #[tokio::test]
    async fn test_disabled_and_removed_schedules() {
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = Scheduler::new(invoker.clone());
        scheduler
            .register_at(
                Schedule {
                    enabled: false,
                    ..schedule("off", "* * * * *")
                },
                at(9, 0, 0),
            )
            .unwrap();
        scheduler.register_at(schedule("on", "* * * * *"), at(9, 0, 0)).unwrap();

        scheduler.remove("on").unwrap();
        assert!(scheduler.tick(at(9, 5, 0)).await.is_empty());
        assert_eq!(scheduler.list().len(), 1);
        assert!(matches!(scheduler.remove("on"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_bad_function_name_rejected() {
        let scheduler = Scheduler::new(Arc::new(RecordingInvoker::default()));
        let bad = Schedule {
            function_name: "no-namespace".to_string(),
            ..schedule("bad", "* * * * *")
        };
        assert!(scheduler.register(bad).is_err());
        assert!(scheduler.list().is_empty());
    }
}
