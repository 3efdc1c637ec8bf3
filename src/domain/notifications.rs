//! Timed notification loop backing `start-notification-stream`

use std::{sync::Arc, time::Duration};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mcp::{rpc::json_rpc_notification, transport::NotificationSender};

pub const LOGGING_NOTIFICATION_METHOD: &str = "notifications/message";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Sends `count` notifications (`0` = until cancelled), one per `interval`.
pub struct NotificationJob {
    interval: Duration,
    count: u32,
    sender: Arc<dyn NotificationSender>,
    cancellation: CancellationToken,
}

impl NotificationJob {
    pub fn new(
        interval_ms: u32,
        count: u32,
        sender: Arc<dyn NotificationSender>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            interval: Duration::from_millis(u64::from(interval_ms)),
            count,
            sender,
            cancellation,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.count == 0
    }

    /// Detaches the loop; the returned handle may be dropped.
    pub fn spawn(self) -> JoinHandle<JobReport> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> JobReport {
        let mut report = JobReport::default();
        let mut sequence: u64 = 1;

        while self.is_unbounded() || report.attempted < u64::from(self.count) {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    debug!(sent = report.attempted, "notification stream cancelled");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            report.attempted += 1;
            match self.sender.send(periodic_notification(sequence)).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(sequence, error = %err, "failed to send periodic notification");
                }
            }
            sequence += 1;
        }

        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "notification stream finished"
        );
        report
    }
}

pub fn periodic_notification(sequence: u64) -> Value {
    let sent_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    json_rpc_notification(
        LOGGING_NOTIFICATION_METHOD,
        json!({
            "level": "info",
            "data": format!("Periodic notification #{sequence} at {sent_at}"),
        }),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::errors::AppError;
    use crate::mcp::transport::NotificationSender;

    #[derive(Default)]
    pub struct RecordingSender {
        sent: Mutex<Vec<Value>>,
    }

    impl RecordingSender {
        pub fn sent(&self) -> Vec<Value> {
            self.sent.lock().expect("recording lock").clone()
        }

        /// The `data` text of every recorded notification, in send order.
        pub fn messages(&self) -> Vec<String> {
            self.sent()
                .iter()
                .filter_map(|value| value["params"]["data"].as_str().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(&self, notification: Value) -> Result<(), AppError> {
            self.sent.lock().expect("recording lock").push(notification);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FailingSender {
        calls: Mutex<u64>,
    }

    impl FailingSender {
        pub fn calls(&self) -> u64 {
            *self.calls.lock().expect("calls lock")
        }
    }

    #[async_trait]
    impl NotificationSender for FailingSender {
        async fn send(&self, _notification: Value) -> Result<(), AppError> {
            *self.calls.lock().expect("calls lock") += 1;
            Err(AppError::TransportClosed)
        }
    }
}
