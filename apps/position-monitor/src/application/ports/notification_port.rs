//! Notification Sink Port (Driven Port)
//!
//! Delivery of pre-formatted text to an external channel.

use async_trait::async_trait;

/// Port for delivering notification text.
///
/// Implementations split payloads that exceed the channel's message limit
/// and swallow transient delivery failures after logging them.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `text`. Never fails; undeliverable messages are dropped.
    async fn deliver(&self, text: &str);

    /// Sink name for logs and metrics.
    fn name(&self) -> &'static str;
}
