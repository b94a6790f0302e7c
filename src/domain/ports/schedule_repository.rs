//! Schedule repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::Schedule;

/// Repository interface for schedules.
///
/// Firing uses a compare-and-set lock: `try_lock` atomically claims the row
/// with a token, and `unlock` releases it while recording the fire state.
/// At most one fire per (schedule, tick) survives the race.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn upsert(&self, schedule: &Schedule) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<Schedule>>;

    async fn list(&self) -> EngineResult<Vec<Schedule>>;

    async fn list_enabled(&self) -> EngineResult<Vec<Schedule>>;

    async fn delete(&self, id: Uuid) -> EngineResult<()>;

    /// Claim the schedule for firing. Returns false if another holder owns
    /// the lock.
    async fn try_lock(&self, id: Uuid, token: &str) -> EngineResult<bool>;

    /// Release the lock held with `token`, persisting the fire bookkeeping.
    async fn unlock(
        &self,
        id: Uuid,
        token: &str,
        last_fired_at: Option<DateTime<Utc>>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()>;
}
