//! Cron schedules that trigger process executions.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};

/// A recurring trigger for a process, evaluated in its own timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub process_id: Uuid,
    pub process_name: String,
    /// Standard cron expression (minute granularity).
    pub cron: String,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    pub owner_user: String,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        process_id: Uuid,
        process_name: impl Into<String>,
        cron: impl Into<String>,
        timezone: impl Into<String>,
        owner_user: impl Into<String>,
    ) -> EngineResult<Self> {
        let mut schedule = Self {
            id: Uuid::new_v4(),
            process_id,
            process_name: process_name.into(),
            cron: cron.into(),
            timezone: timezone.into(),
            enabled: true,
            last_fired_at: None,
            next_fire_at: None,
            owner_user: owner_user.into(),
            created_at: Utc::now(),
        };
        schedule.next_fire_at = schedule.next_fire_after(Utc::now())?;
        Ok(schedule)
    }

    fn tz(&self) -> EngineResult<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            EngineError::Validation(format!("unknown timezone '{}'", self.timezone))
        })
    }

    /// Compute the first fire instant strictly after `from`, in this
    /// schedule's timezone.
    pub fn next_fire_after(&self, from: DateTime<Utc>) -> EngineResult<Option<DateTime<Utc>>> {
        let tz = self.tz()?;
        let expression = normalize_cron(&self.cron);
        let cron = cron::Schedule::from_str(&expression).map_err(|e| {
            EngineError::Validation(format!("invalid cron expression '{}': {}", self.cron, e))
        })?;
        let local = from.with_timezone(&tz);
        Ok(cron.after(&local).next().map(|t| t.with_timezone(&Utc)))
    }

    /// Whether the schedule is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|t| t <= now)
    }

    /// Record a successful fire and advance the next occurrence. Missed
    /// occurrences are never back-filled.
    pub fn mark_fired(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.last_fired_at = Some(now);
        self.next_fire_at = self.next_fire_after(now)?;
        Ok(())
    }

    /// Enable or disable. Re-enabling recomputes the next fire from the
    /// current instant, not from missed occurrences.
    pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) -> EngineResult<()> {
        self.enabled = enabled;
        if enabled {
            self.next_fire_at = self.next_fire_after(now)?;
        }
        Ok(())
    }

    /// Validate the cron expression and timezone without constructing.
    pub fn validate_spec(cron_expr: &str, timezone: &str) -> EngineResult<()> {
        timezone
            .parse::<Tz>()
            .map_err(|_| EngineError::Validation(format!("unknown timezone '{timezone}'")))?;
        cron::Schedule::from_str(&normalize_cron(cron_expr)).map_err(|e| {
            EngineError::Validation(format!("invalid cron expression '{cron_expr}': {e}"))
        })?;
        Ok(())
    }
}

/// Accept classic 5-field crontab expressions by pinning the seconds field
/// to zero; longer forms pass through untouched.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}
