//! Scheduler service: fires cron schedules and runs retention maintenance.
//!
//! A single loop wakes at the earliest `next_fire_at` (capped by the tick
//! interval). Before firing it claims a per-schedule lock in the store, so
//! restarted or concurrent schedulers cannot double-fire a tick. Missed
//! occurrences are never back-filled.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{EventEnvelope, ExecutionEvent, Schedule, TriggeredBy};
use crate::domain::ports::{OutputStore, ProcessExecutionRepository, ScheduleRepository};
use crate::services::engine::ExecutionEngine;
use crate::services::event_bus::EventBus;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on sleep between scheduler passes, in milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum random jitter applied before a fire, in milliseconds.
    pub jitter_max_ms: u64,
    /// Terminal executions older than this are purged, with their outputs.
    pub retention_days: u32,
    /// How often the retention sweep runs, in seconds.
    pub maintenance_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            jitter_max_ms: 500,
            retention_days: 90,
            maintenance_interval_secs: 3_600,
        }
    }
}

/// Owns schedule firing and the retention sweep.
pub struct SchedulerService {
    schedules: Arc<dyn ScheduleRepository>,
    executions: Arc<dyn ProcessExecutionRepository>,
    outputs: Arc<dyn OutputStore>,
    engine: Arc<ExecutionEngine>,
    bus: Arc<EventBus>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
}

impl SchedulerService {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        executions: Arc<dyn ProcessExecutionRepository>,
        outputs: Arc<dyn OutputStore>,
        engine: Arc<ExecutionEngine>,
        bus: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            executions,
            outputs,
            engine,
            bus,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a new schedule after validating its cron and timezone.
    pub async fn create(
        &self,
        process_id: Uuid,
        process_name: &str,
        cron: &str,
        timezone: &str,
        owner_user: &str,
    ) -> EngineResult<Schedule> {
        Schedule::validate_spec(cron, timezone)?;
        let schedule = Schedule::new(process_id, process_name, cron, timezone, owner_user)?;
        self.schedules.upsert(&schedule).await?;
        info!(schedule_id = %schedule.id, process = %process_name, cron = %cron, "schedule created");
        Ok(schedule)
    }

    /// Enable or disable a schedule. Disabling removes it from consideration
    /// immediately; enabling computes the next fire from now.
    pub async fn set_enabled(&self, schedule_id: Uuid, enabled: bool) -> EngineResult<Schedule> {
        let mut schedule = self
            .schedules
            .get(schedule_id)
            .await?
            .ok_or(EngineError::NotFound { resource: "schedule", id: schedule_id.to_string() })?;
        schedule.set_enabled(enabled, Utc::now())?;
        self.schedules.upsert(&schedule).await?;
        Ok(schedule)
    }

    /// Fire a schedule immediately on behalf of an operator.
    pub async fn trigger_now(&self, schedule_id: Uuid, actor: &str) -> EngineResult<Uuid> {
        let schedule = self
            .schedules
            .get(schedule_id)
            .await?
            .ok_or(EngineError::NotFound { resource: "schedule", id: schedule_id.to_string() })?;
        self.fire(&schedule, actor).await
    }

    async fn fire(&self, schedule: &Schedule, actor: &str) -> EngineResult<Uuid> {
        let triggered_by = TriggeredBy {
            actor: actor.to_string(),
            ..TriggeredBy::schedule(schedule.id, &schedule.owner_user)
        };
        let execution_id = self
            .engine
            .clone()
            .start(
                &schedule.process_name,
                None,
                serde_json::json!({}),
                triggered_by,
                &schedule.owner_user,
            )
            .await?;
        self.bus.publish(EventEnvelope::new(
            execution_id,
            0,
            ExecutionEvent::ScheduleFired {
                schedule_id: schedule.id,
                process_name: schedule.process_name.clone(),
            },
        ));
        Ok(execution_id)
    }

    /// Start the scheduler loop and the retention sweep. Returns the loop's
    /// join handle; `stop` ends it gracefully after in-flight fires.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let service = self.clone();

        let maintenance = self;
        tokio::spawn(async move { maintenance.maintenance_loop().await });

        tokio::spawn(async move {
            info!("scheduler started");
            while service.running.load(Ordering::SeqCst) {
                let sleep_for = match service.pass().await {
                    Ok(until_next) => until_next,
                    Err(e) => {
                        error!(error = %e, "scheduler pass failed");
                        Duration::from_millis(service.config.tick_interval_ms)
                    }
                };
                tokio::time::sleep(sleep_for.min(Duration::from_millis(
                    service.config.tick_interval_ms,
                )))
                .await;
            }
            info!("scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scheduler pass: fire everything due (in `schedule_id` order for
    /// identical instants), return the wait until the next occurrence.
    async fn pass(&self) -> EngineResult<Duration> {
        let now = Utc::now();
        let mut due: Vec<Schedule> = Vec::new();
        let mut earliest_upcoming: Option<chrono::DateTime<Utc>> = None;

        for schedule in self.schedules.list_enabled().await? {
            if schedule.is_due(now) {
                due.push(schedule);
            } else if let Some(next) = schedule.next_fire_at {
                earliest_upcoming = Some(match earliest_upcoming {
                    Some(current) => current.min(next),
                    None => next,
                });
            }
        }

        due.sort_by_key(|s| (s.next_fire_at, s.id));
        for schedule in due {
            self.fire_locked(schedule).await;
        }

        let wait = earliest_upcoming
            .map(|next| (next - Utc::now()).to_std().unwrap_or_default())
            .unwrap_or(Duration::from_millis(self.config.tick_interval_ms));
        Ok(wait)
    }

    /// Fire one due schedule under its store lock.
    async fn fire_locked(&self, mut schedule: Schedule) {
        if self.config.jitter_max_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.config.jitter_max_ms);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let token = Uuid::new_v4().to_string();
        match self.schedules.try_lock(schedule.id, &token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(schedule_id = %schedule.id, "schedule locked elsewhere, skipping fire");
                return;
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "schedule lock failed");
                return;
            }
        }

        let now = Utc::now();
        match self.fire(&schedule, "scheduler").await {
            Ok(execution_id) => {
                info!(schedule_id = %schedule.id, execution_id = %execution_id, "schedule fired");
            }
            Err(e) => {
                // A full engine still advances the schedule: missed fires
                // are not replayed.
                warn!(schedule_id = %schedule.id, error = %e, "schedule fire rejected");
            }
        }

        if let Err(e) = schedule.mark_fired(now) {
            warn!(schedule_id = %schedule.id, error = %e, "failed to advance schedule");
        }
        if let Err(e) = self
            .schedules
            .unlock(schedule.id, &token, schedule.last_fired_at, schedule.next_fire_at)
            .await
        {
            warn!(schedule_id = %schedule.id, error = %e, "schedule unlock failed");
        }
    }

    /// Periodic retention sweep: purge terminal executions past the
    /// retention window together with their stored outputs.
    async fn maintenance_loop(&self) {
        let interval = Duration::from_secs(self.config.maintenance_interval_secs);
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.config.retention_days));
            match self.executions.purge_terminal_before(cutoff).await {
                Ok(purged) => {
                    if !purged.is_empty() {
                        info!(count = purged.len(), "purged executions past retention");
                    }
                    for execution_id in purged {
                        if let Err(e) = self.outputs.delete_for_execution(execution_id).await {
                            warn!(execution_id = %execution_id, error = %e, "output purge failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
        }
    }
}
