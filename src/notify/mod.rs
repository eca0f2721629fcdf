//! Notification enqueue interface.
//!
//! The core only produces notification events; templating and delivery
//! transport belong to a downstream collaborator. Events flow through an
//! explicit channel-backed queue with start/drain/stop lifecycle rather
//! than a process-wide singleton.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmed {
        booking_id: Uuid,
    },
    BookingCancelled {
        booking_id: Uuid,
        forfeited: i64,
        refunded: i64,
    },
    BookingExpired {
        booking_id: Uuid,
    },
    BookingReminder {
        booking_id: Uuid,
        start_at: DateTime<Utc>,
    },
    PaymentFailed {
        booking_id: Uuid,
        payment_id: Uuid,
    },
    WebhookDeadLettered {
        webhook_id: Uuid,
        provider: String,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Default sink: structured log lines for the delivery collaborator to tail.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(event = ?notification, "notification dispatched");
        Ok(())
    }
}

/// Cloneable producer handle held in `AppState`.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    /// Enqueue without blocking the caller; a full or closed queue is
    /// logged and dropped rather than failing the business operation.
    pub fn enqueue(&self, notification: Notification) {
        if let Err(err) = self.tx.try_send(notification) {
            tracing::warn!("notification queue unavailable, dropping event: {err}");
        }
    }
}

/// Consumer side; owns the worker task.
pub struct NotificationWorker {
    handle: JoinHandle<()>,
}

impl NotificationWorker {
    /// Waits for the queue to drain once all producer handles are dropped.
    pub async fn stop(self) {
        if let Err(err) = self.handle.await {
            tracing::error!("notification worker terminated abnormally: {err}");
        }
    }
}

pub fn start(
    sink: Arc<dyn NotificationSink>,
    capacity: usize,
) -> (NotificationQueue, NotificationWorker) {
    let (tx, mut rx) = mpsc::channel::<Notification>(capacity);
    let handle = tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(err) = sink.deliver(&notification).await {
                tracing::error!("notification delivery failed: {err}");
            }
        }
        tracing::debug!("notification queue drained");
    });
    (NotificationQueue { tx }, NotificationWorker { handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NotificationSink for Recording {
        async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
            let kind = serde_json::to_value(notification)?["kind"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            self.seen.lock().unwrap().push(kind);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_drains_on_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (queue, worker) = start(
            Arc::new(Recording { seen: seen.clone() }),
            16,
        );

        let booking_id = Uuid::new_v4();
        queue.enqueue(Notification::BookingConfirmed { booking_id });
        queue.enqueue(Notification::BookingExpired { booking_id });
        drop(queue);
        worker.stop().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["booking_confirmed", "booking_expired"]);
    }
}
