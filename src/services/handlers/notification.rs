//! Notification handler: renders recipients and message, hands the result
//! to the notification sink.

use async_trait::async_trait;
use std::sync::Arc;

use super::{DispatchOutcome, StepContext, StepHandler};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{FailureInfo, StepConfig};
use crate::domain::ports::NotificationSink;
use crate::services::expression::ExpressionEvaluator;

pub struct NotificationHandler {
    sink: Arc<dyn NotificationSink>,
    evaluator: ExpressionEvaluator,
}

impl NotificationHandler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink, evaluator: ExpressionEvaluator::new() }
    }
}

#[async_trait]
impl StepHandler for NotificationHandler {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let step = ctx.step()?;
        let StepConfig::Notification { channels, message, recipients, .. } = &step.config else {
            return Err(EngineError::Internal(format!(
                "notification handler invoked for {} step {}",
                step.kind().as_str(),
                step.id
            )));
        };

        let rendered = self.evaluator.render(message, &ctx.expr_ctx)?;
        let mut resolved_recipients = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            resolved_recipients.push(self.evaluator.render(recipient, &ctx.expr_ctx)?);
        }

        match self.sink.deliver(channels, &resolved_recipients, &rendered).await {
            Ok(receipt) => Ok(DispatchOutcome::Completed {
                output: serde_json::json!({ "delivered_count": receipt.delivered_count }),
                cost: 0.0,
            }),
            Err(err) => Ok(DispatchOutcome::Failed(FailureInfo::from(&err))),
        }
    }
}
