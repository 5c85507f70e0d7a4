//! Notification Dispatcher
//!
//! Bounded FIFO between notification producers and the sink. Producers call
//! [`NotificationDispatcher::enqueue`], which never blocks and never awaits;
//! a single consumer task delivers messages one at a time.
//!
//! When the queue is full the oldest undelivered message is dropped, so
//! delivery is best-effort.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::NotificationSink;
use crate::domain::notification::Notification;
use crate::infrastructure::metrics;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum queued messages.
    pub capacity: usize,
    /// Sleep between checks when the queue is empty.
    pub idle_interval: Duration,
    /// Upper bound on one delivery.
    pub delivery_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            idle_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of the shutdown drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages handed to the sink.
    pub delivered: usize,
    /// Messages discarded when the deadline passed.
    pub discarded: usize,
}

/// Bounded drop-oldest notification queue.
#[derive(Debug)]
pub struct NotificationDispatcher {
    config: DispatcherConfig,
    queue: Mutex<VecDeque<Notification>>,
    ready: Notify,
    dropped: AtomicU64,
}

impl NotificationDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: DispatcherConfig { capacity, ..config },
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a notification without blocking.
    ///
    /// Returns the message that was evicted to make room, if any.
    pub fn enqueue(&self, notification: Notification) -> Option<Notification> {
        let label = notification.label();
        let (evicted, depth) = {
            let mut queue = self.queue.lock();
            let evicted = if queue.len() >= self.config.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(notification);
            (evicted, queue.len())
        };

        metrics::record_notification_enqueued(label);
        metrics::set_notification_queue_depth(depth);

        if let Some(old) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_notification_dropped(old.label());
            tracing::warn!(
                dropped = old.label(),
                capacity = self.config.capacity,
                "Notification queue full, dropped oldest message"
            );
        }

        self.ready.notify_one();
        evicted
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Messages dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn pop(&self) -> Option<Notification> {
        let mut queue = self.queue.lock();
        let next = queue.pop_front();
        metrics::set_notification_queue_depth(queue.len());
        next
    }

    async fn deliver(&self, sink: &dyn NotificationSink, notification: &Notification) {
        let text = notification.render();
        if tokio::time::timeout(self.config.delivery_timeout, sink.deliver(&text))
            .await
            .is_ok()
        {
            metrics::record_notification_delivered(notification.label());
        } else {
            tracing::warn!(
                sink = sink.name(),
                kind = notification.label(),
                "Notification delivery timed out, dropping"
            );
        }
    }

    /// Consumer loop. Delivers until `cancel` fires; whatever is still
    /// queued is left for [`Self::drain`].
    pub async fn run(self: Arc<Self>, sink: Arc<dyn NotificationSink>, cancel: CancellationToken) {
        tracing::info!(sink = sink.name(), "Notification dispatcher started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(notification) = self.pop() {
                self.deliver(sink.as_ref(), &notification).await;
                continue;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.ready.notified() => {}
                () = tokio::time::sleep(self.config.idle_interval) => {}
            }
        }

        tracing::info!(pending = self.len(), "Notification dispatcher stopped");
    }

    /// Deliver queued messages until empty or `timeout` elapses, then
    /// discard the rest.
    pub async fn drain(&self, sink: &dyn NotificationSink, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;
        let mut report = DrainReport::default();

        while Instant::now() < deadline {
            let Some(notification) = self.pop() else {
                break;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, sink.deliver(&notification.render()))
                .await
                .is_err()
            {
                report.discarded += 1;
                break;
            }
            report.delivered += 1;
        }

        let leftover = {
            let mut queue = self.queue.lock();
            let count = queue.len();
            queue.clear();
            count
        };
        report.discarded += leftover;
        metrics::set_notification_queue_depth(0);

        tracing::info!(
            delivered = report.delivered,
            discarded = report.discarded,
            "Notification queue drained"
        );
        report
    }
}
