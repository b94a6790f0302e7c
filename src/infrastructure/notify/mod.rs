//! Notification sink adapters.
//!
//! Delivery internals (email, Slack) live outside the core; the default
//! adapter records deliveries in the structured log so operators can wire a
//! real transport without touching the engine.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::errors::EngineResult;
use crate::domain::ports::{DeliveryReceipt, NotificationSink};

/// Sink that logs deliveries through tracing.
#[derive(Debug, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn deliver(
        &self,
        channels: &[String],
        recipients: &[String],
        message: &str,
    ) -> EngineResult<DeliveryReceipt> {
        info!(
            channels = ?channels,
            recipients = ?recipients,
            message_len = message.len(),
            "notification delivered"
        );
        Ok(DeliveryReceipt { delivered_count: recipients.len().max(1) as u32 })
    }
}

/// Recording sink for tests.
#[derive(Debug, Default)]
pub struct MockNotificationSink {
    pub deliveries: Mutex<Vec<(Vec<String>, Vec<String>, String)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn deliver(
        &self,
        channels: &[String],
        recipients: &[String],
        message: &str,
    ) -> EngineResult<DeliveryReceipt> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::domain::errors::EngineError::Internal(
                "mock delivery failure".into(),
            ));
        }
        self.deliveries
            .lock()
            .await
            .push((channels.to_vec(), recipients.to_vec(), message.to_string()));
        Ok(DeliveryReceipt { delivered_count: recipients.len().max(1) as u32 })
    }
}
