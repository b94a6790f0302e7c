//! Timer handler: computes the wall-clock resume instant and suspends.
//! A resume instant in the past completes immediately.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;

use super::{DispatchOutcome, StepContext, StepHandler, SuspendReason};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{StepConfig, TimerWait};
use crate::services::expression::ExpressionEvaluator;

pub struct TimerHandler {
    evaluator: ExpressionEvaluator,
}

impl TimerHandler {
    pub fn new() -> Self {
        Self { evaluator: ExpressionEvaluator::new() }
    }

    /// Parse a rendered `wait_until` value: RFC 3339 first, then a naive
    /// `YYYY-MM-DD HH:MM[:SS]` interpreted in the configured timezone.
    fn parse_until(rendered: &str, timezone: &str) -> EngineResult<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(rendered) {
            return Ok(t.with_timezone(&Utc));
        }
        let tz: Tz = timezone
            .parse()
            .map_err(|_| EngineError::Validation(format!("unknown timezone '{timezone}'")))?;
        let naive = NaiveDateTime::parse_from_str(rendered, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(rendered, "%Y-%m-%d %H:%M"))
            .map_err(|_| {
                EngineError::Validation(format!("cannot parse wait_until instant '{rendered}'"))
            })?;
        naive
            .and_local_timezone(tz)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| {
                EngineError::Validation(format!("'{rendered}' is not a valid instant in {timezone}"))
            })
    }
}

impl Default for TimerHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for TimerHandler {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let step = ctx.step()?;
        let StepConfig::Timer { wait } = &step.config else {
            return Err(EngineError::Internal(format!(
                "timer handler invoked for {} step {}",
                step.kind().as_str(),
                step.id
            )));
        };

        let now = Utc::now();
        let resume_at = match wait {
            TimerWait::Duration { seconds } => now + Duration::seconds(*seconds as i64),
            TimerWait::Until { expression, timezone } => {
                let rendered = self.evaluator.render(expression, &ctx.expr_ctx)?;
                Self::parse_until(rendered.trim(), timezone)?
            }
        };

        if resume_at <= now {
            return Ok(DispatchOutcome::Completed {
                output: serde_json::json!({ "fired_at": now.to_rfc3339() }),
                cost: 0.0,
            });
        }
        Ok(DispatchOutcome::Suspended(SuspendReason::Timer { resume_at }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_until_rfc3339() {
        let t = TimerHandler::parse_until("2026-03-01T10:00:00Z", "UTC").unwrap();
        assert_eq!(t.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_until_naive_in_timezone() {
        let t = TimerHandler::parse_until("2026-03-01 10:00", "Europe/Berlin").unwrap();
        // 10:00 Berlin in March (CET) is 09:00 UTC.
        assert_eq!(t.to_rfc3339(), "2026-03-01T09:00:00+00:00");
    }

    #[test]
    fn test_parse_until_invalid() {
        assert!(TimerHandler::parse_until("soon", "UTC").is_err());
        assert!(TimerHandler::parse_until("2026-03-01 10:00", "Nowhere/Town").is_err());
    }
}
