//! Notification sink port.

use async_trait::async_trait;

use crate::domain::errors::EngineResult;

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub delivered_count: u32,
}

/// Delivery boundary for notification steps. Channel semantics (email,
/// Slack, webhooks) live behind this trait.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        channels: &[String],
        recipients: &[String],
        message: &str,
    ) -> EngineResult<DeliveryReceipt>;
}
