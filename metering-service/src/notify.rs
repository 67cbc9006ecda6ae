use meter_client::domain::MeterKey;
use time::Date;

/// Operator-facing event raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The contract anniversary is `days_remaining` days away and the
    /// `threshold` notification has not been sent for this billing year.
    AnniversaryApproaching {
        meter: MeterKey,
        days_remaining: i64,
        threshold: i64,
        balance: Option<f64>,
    },
    /// A monthly window closed.
    MonthlySummary {
        meter: MeterKey,
        month_ending: Date,
        consumption: f64,
        unit: &'static str,
        cost: Option<f64>,
        balance: Option<f64>,
    },
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::AnniversaryApproaching {
                meter,
                days_remaining,
                threshold,
                balance,
            } => {
                tracing::info!(
                    meter = %meter,
                    days_remaining,
                    threshold,
                    balance = ?balance,
                    "billing year ends soon; enter the end reading on the anniversary"
                );
            }
            Notification::MonthlySummary {
                meter,
                month_ending,
                consumption,
                unit,
                cost,
                balance,
            } => {
                tracing::info!(
                    meter = %meter,
                    %month_ending,
                    consumption,
                    unit,
                    cost = ?cost,
                    balance = ?balance,
                    "monthly summary"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects notifications for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) {
            self.sent.lock().unwrap().push(notification);
        }
    }
}
