//! Daily trigger that fans active tasks out across the Transfer Engine and
//! Linked Group Coordinator, bounded to 2 concurrent units.
//!
//! Rather than a semaphore-throttled continuous stream, the scheduler
//! processes tasks in explicit waves of `concurrency`, sleeping between
//! waves.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::TransferEngine;
use crate::linking::{self, ExecutionOrigin, MemberOutcome};
use crate::notify::NotificationSink;
use crate::repository::TaskRepository;
use crate::supervisor::ConnectionSupervisor;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub wave_sleep: Duration,
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            wave_sleep: Duration::from_secs(30),
            timezone: Tz::UTC,
        }
    }
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub active: bool,
    pub running: bool,
    pub hour: Option<String>,
    pub next_execution: Option<chrono::DateTime<Utc>>,
}

struct SchedulerState {
    enabled: bool,
    hour: Option<String>,
    running: bool,
}

/// Validates `HH:MM` against `^([01]\d|2[0-3]):([0-5]\d)$` without pulling
/// in a regex engine for one format.
fn valid_hour(hour: &str) -> bool {
    let Some((h, m)) = hour.split_once(':') else {
        return false;
    };
    if h.len() != 2 || m.len() != 2 {
        return false;
    }
    let (Ok(h), Ok(m)) = (h.parse::<u32>(), m.parse::<u32>()) else {
        return false;
    };
    h <= 23 && m <= 59
}

/// Drives daily automatic execution of every active task.
pub struct Scheduler {
    repo: Arc<dyn TaskRepository>,
    engine: Arc<TransferEngine>,
    supervisor: Arc<ConnectionSupervisor>,
    notifier: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        engine: Arc<TransferEngine>,
        supervisor: Arc<ConnectionSupervisor>,
        notifier: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            engine,
            supervisor,
            notifier,
            config,
            state: Mutex::new(SchedulerState {
                enabled: false,
                hour: None,
                running: false,
            }),
            timer: Mutex::new(None),
        })
    }

    /// Validate `hour`, stop any existing timer, and (if `enabled`) install
    /// a fresh one that fires `tick` once a day at that time.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool, hour: &str) -> Result<()> {
        if enabled && !valid_hour(hour) {
            return Err(anyhow!("invalid hour {hour:?}, expected HH:MM"));
        }

        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }

        {
            let mut state = self.state.lock().unwrap();
            state.enabled = enabled;
            state.hour = Some(hour.to_string());
        }

        if enabled {
            let scheduler = Arc::clone(self);
            let hour = hour.to_string();
            let handle = tokio::spawn(async move { scheduler.timer_loop(hour).await });
            *self.timer.lock().unwrap() = Some(handle);
        }

        Ok(())
    }

    async fn timer_loop(self: Arc<Self>, hour: String) {
        loop {
            let sleep_for = match next_fire_delay(&hour, self.config.timezone) {
                Some(d) => d,
                None => {
                    warn!(hour, "could not compute next fire time, stopping timer");
                    return;
                }
            };
            tokio::time::sleep(sleep_for).await;
            if let Err(e) = self.execute_automatic_transfers().await {
                warn!(error = %e, "scheduled tick failed");
                self.notifier.notify_critical(&e.to_string(), &hour, None).await;
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().unwrap();
        let next_execution = state
            .hour
            .as_ref()
            .filter(|_| state.enabled)
            .and_then(|hour| next_fire_delay(hour, self.config.timezone))
            .map(|delay| Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());

        SchedulerStatus {
            enabled: state.enabled,
            active: state.enabled && self.timer.lock().unwrap().is_some(),
            running: state.running,
            hour: state.hour.clone(),
            next_execution,
        }
    }

    /// Invoke the same routine the timer fires. Forbidden while a tick is
    /// already running.
    pub async fn trigger(&self) -> Result<()> {
        if self.state.lock().unwrap().running {
            return Err(anyhow!("scheduler tick already running"));
        }
        self.execute_automatic_transfers().await
    }

    async fn execute_automatic_transfers(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.enabled || state.running {
                return Ok(());
            }
            state.running = true;
        }

        let outcome = self.run_tick().await;

        self.state.lock().unwrap().running = false;
        outcome
    }

    async fn run_tick(&self) -> Result<()> {
        let active_tasks = self.repo.get_active_auto_or_both().await?;
        let units = build_runnable_units(&active_tasks);

        info!(units = units.len(), "scheduler tick: running units");

        let mut all_outcomes: Vec<MemberOutcome> = Vec::new();
        let waves: Vec<&[RunnableUnit]> = units.chunks(self.config.concurrency).collect();
        let wave_count = waves.len();

        for (i, wave) in waves.into_iter().enumerate() {
            let handles: Vec<_> = wave
                .iter()
                .cloned()
                .map(|unit| {
                    let repo = Arc::clone(&self.repo);
                    let engine = Arc::clone(&self.engine);
                    let supervisor = Arc::clone(&self.supervisor);
                    tokio::spawn(async move { run_unit(repo, engine, supervisor, unit).await })
                })
                .collect();

            for handle in handles {
                match handle.await {
                    Ok(Ok(mut outcomes)) => all_outcomes.append(&mut outcomes),
                    Ok(Err(e)) => warn!(error = %e, "runnable unit failed"),
                    Err(e) => warn!(error = %e, "runnable unit task panicked"),
                }
            }

            if i + 1 < wave_count {
                tokio::time::sleep(self.config.wave_sleep).await;
            }
        }

        let label = self
            .state
            .lock()
            .unwrap()
            .hour
            .clone()
            .unwrap_or_else(|| "batch".to_string());
        self.notifier.notify_results(&all_outcomes, &label, None).await;

        Ok(())
    }
}

#[derive(Debug, Clone)]
enum RunnableUnit {
    Individual(Uuid),
    Group(Uuid),
}

fn build_runnable_units(active_tasks: &[xfer_db::models::TaskDefinition]) -> Vec<RunnableUnit> {
    let mut seen_groups = std::collections::HashSet::new();
    let mut units = Vec::new();
    for task in active_tasks {
        match &task.linked_group {
            Some(group) => {
                if seen_groups.insert(group.clone()) {
                    units.push(RunnableUnit::Group(task.id));
                }
            }
            None => units.push(RunnableUnit::Individual(task.id)),
        }
    }
    units
}

async fn run_unit(
    repo: Arc<dyn TaskRepository>,
    engine: Arc<TransferEngine>,
    supervisor: Arc<ConnectionSupervisor>,
    unit: RunnableUnit,
) -> Result<Vec<MemberOutcome>> {
    match unit {
        RunnableUnit::Individual(task_id) => {
            let task = repo
                .get_task_by_id(task_id)
                .await?
                .ok_or_else(|| anyhow!("task {task_id} vanished before scheduling"))?;
            let result = engine.run(task_id).await?;
            Ok(vec![MemberOutcome {
                task_id,
                task_name: task.name,
                is_group_member: false,
                group_name: None,
                result,
            }])
        }
        RunnableUnit::Group(representative_id) => {
            let group_result =
                linking::execute_group(&repo, engine.as_ref(), &supervisor, representative_id, ExecutionOrigin::Auto)
                    .await?;
            Ok(group_result.member_outcomes)
        }
    }
}

/// Seconds until the next occurrence of `hour` (`HH:MM`) in `tz`, or `None`
/// if `hour` doesn't parse.
fn next_fire_delay(hour: &str, tz: Tz) -> Option<Duration> {
    let (h, m) = hour.split_once(':')?;
    let target = NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)?;

    let now = Utc::now().with_timezone(&tz);
    let mut candidate = tz.from_local_datetime(&now.date_naive().and_time(target)).single()?;
    if candidate <= now {
        candidate += chrono::Duration::days(1);
    }

    (candidate - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_hour_accepts_well_formed_times() {
        assert!(valid_hour("00:00"));
        assert!(valid_hour("23:59"));
        assert!(valid_hour("09:30"));
    }

    #[test]
    fn valid_hour_rejects_malformed_times() {
        assert!(!valid_hour("24:00"));
        assert!(!valid_hour("9:30"));
        assert!(!valid_hour("12-30"));
        assert!(!valid_hour(""));
    }

    #[test]
    fn build_runnable_units_dedupes_groups() {
        use xfer_db::models::{TaskDefinition, TransferType};

        let make = |id: Uuid, group: Option<&str>| TaskDefinition {
            id,
            name: "t".to_string(),
            active: true,
            query: "SELECT 1".to_string(),
            parameters: sqlx::types::Json(Vec::new()),
            validation_rules: sqlx::types::Json(Default::default()),
            clear_before_insert: false,
            post_update_query: None,
            post_update_mapping: sqlx::types::Json(Default::default()),
            transfer_type: TransferType::Up,
            linked_group: group.map(|g| g.to_string()),
            linked_tasks: sqlx::types::Json(Vec::new()),
            linked_execution_order: 0,
            last_group_execution_id: None,
            last_group_execution: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let tasks = vec![
            make(Uuid::new_v4(), Some("G")),
            make(Uuid::new_v4(), Some("G")),
            make(Uuid::new_v4(), None),
        ];

        let units = build_runnable_units(&tasks);
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn next_fire_delay_rejects_garbage() {
        assert!(next_fire_delay("not-a-time", Tz::UTC).is_none());
    }
}
