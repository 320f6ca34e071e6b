//! Outbound user notifications.
//!
//! Delivery is best effort everywhere: callers log a failed delivery and
//! carry on, so a notifier never decides the outcome of a billing or alert
//! decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BillingSucceeded {
        instance_id: String,
        container: String,
        amount: f64,
        next_billing: DateTime<Utc>,
    },
    InsufficientFunds {
        instance_id: String,
        amount: f64,
        balance: f64,
        grace_period_end: DateTime<Utc>,
    },
    PaymentFailed {
        instance_id: String,
        amount: f64,
        grace_period_end: DateTime<Utc>,
    },
    Suspended {
        instance_id: String,
        suspended_at: DateTime<Utc>,
    },
    ResourceAlert {
        instance_id: String,
        alerts: Vec<String>,
    },
}

impl Notification {
    pub fn instance_id(&self) -> &str {
        match self {
            Notification::BillingSucceeded { instance_id, .. }
            | Notification::InsufficientFunds { instance_id, .. }
            | Notification::PaymentFailed { instance_id, .. }
            | Notification::Suspended { instance_id, .. }
            | Notification::ResourceAlert { instance_id, .. } => instance_id,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Notification::BillingSucceeded { .. } => "VPS Billing Successful",
            Notification::InsufficientFunds { .. } => "VPS Payment Failed - Insufficient Funds",
            Notification::PaymentFailed { .. } => "VPS Payment Failed",
            Notification::Suspended { .. } => "VPS Suspended",
            Notification::ResourceAlert { .. } => "VPS Resource Alert",
        }
    }

    /// Plain-text body suitable for direct messages.
    pub fn body(&self) -> String {
        match self {
            Notification::BillingSucceeded {
                instance_id,
                container,
                amount,
                next_billing,
            } => format!(
                "Instance {instance_id} ({container}) was billed {amount:.2} credits. Next billing: {}",
                next_billing.format("%Y-%m-%d")
            ),
            Notification::InsufficientFunds {
                instance_id,
                amount,
                balance,
                grace_period_end,
            } => format!(
                "Could not bill {amount:.2} credits for {instance_id}: balance is {balance:.2}. \
                 Add {:.2} credits before {} to avoid suspension.",
                (amount - balance).max(0.0),
                grace_period_end.format("%Y-%m-%d %H:%M UTC")
            ),
            Notification::PaymentFailed {
                instance_id,
                amount,
                grace_period_end,
            } => format!(
                "Billing {amount:.2} credits for {instance_id} failed. \
                 It will be retried until {}.",
                grace_period_end.format("%Y-%m-%d %H:%M UTC")
            ),
            Notification::Suspended {
                instance_id,
                suspended_at,
            } => format!(
                "Instance {instance_id} was suspended at {} for non-payment. \
                 Contact support to reactivate it.",
                suspended_at.format("%Y-%m-%d %H:%M UTC")
            ),
            Notification::ResourceAlert {
                instance_id,
                alerts,
            } => format!("Instance {instance_id}:\n{}", alerts.join("\n")),
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("recipient {0} unreachable")]
    Unreachable(String),
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("notification channel full, dropped message for {0}")]
    Backlogged(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. The default when no front-end is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, notification: Notification) -> Result<(), NotifyError> {
        info!(
            user_id,
            instance_id = notification.instance_id(),
            title = notification.title(),
            body = %notification.body(),
            "Notification"
        );
        Ok(())
    }
}

pub type Delivery = (String, Notification);

/// Hands notifications to a front-end task over a bounded channel. A full
/// channel drops the message instead of waiting for the front-end.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelNotifier {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, user_id: &str, notification: Notification) -> Result<(), NotifyError> {
        self.tx
            .try_send((user_id.to_string(), notification))
            .map_err(|e| match e {
                TrySendError::Full(_) => NotifyError::Backlogged(user_id.to_string()),
                TrySendError::Closed(_) => NotifyError::ChannelClosed,
            })
    }
}

/// Keeps every delivery in memory. Can be told to reject deliveries.
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Delivery>>,
    unreachable: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Delivery> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn for_user(&self, user_id: &str) -> Vec<Notification> {
        self.delivered()
            .into_iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, n)| n)
            .collect()
    }

    pub fn clear(&self) {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, notification: Notification) -> Result<(), NotifyError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NotifyError::Unreachable(user_id.to_string()));
        }
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((user_id.to_string(), notification));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_never_waits_on_a_full_channel() {
        let (notifier, mut rx) = ChannelNotifier::channel(4);
        let alert = Notification::ResourceAlert {
            instance_id: "vps-1".into(),
            alerts: vec!["High CPU Usage: 95.0%".into()],
        };
        notifier.notify("alice", alert.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(("alice".to_string(), alert.clone())));

        notifier.notify("bob", alert.clone()).await.unwrap();
        notifier.notify("carol", alert.clone()).await.unwrap();
        notifier.notify("dave", alert.clone()).await.unwrap();
        notifier.notify("erin", alert.clone()).await.unwrap();
        assert!(matches!(
            notifier.notify("frank", alert.clone()).await,
            Err(NotifyError::Backlogged(user)) if user == "frank"
        ));
        assert_eq!(rx.recv().await.map(|(user, _)| user), Some("bob".to_string()));

        drop(rx);
        assert!(matches!(
            notifier.notify("alice", alert).await,
            Err(NotifyError::ChannelClosed)
        ));
    }

    #[test]
    fn test_insufficient_funds_body_states_shortfall() {
        let n = Notification::InsufficientFunds {
            instance_id: "vps-1".into(),
            amount: 95.0,
            balance: 40.0,
            grace_period_end: Utc::now(),
        };
        assert!(n.body().contains("Add 55.00 credits"));

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "insufficient_funds");
    }
}
