//! Best-effort low-balance notifications, delivered off the request path.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::UserSetting;

mod webhook;

pub use webhook::WebhookNotifier;

const VALUE_PLACEHOLDER: &str = "{{value}}";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook responded with status {0}")]
    Status(reqwest::StatusCode),
    #[error("notification channel unsupported: {0}")]
    Unsupported(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    QuotaExceed,
}

/// A message whose `content` carries `{{value}}` placeholders, filled from
/// `values` in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notify {
    #[serde(rename = "type")]
    pub kind: NotifyKind,
    pub title: String,
    pub content: String,
    pub values: Vec<String>,
}

impl Notify {
    pub fn quota_exceed(prompt: &str, remaining: &str, topup_link: &str) -> Self {
        Self {
            kind: NotifyKind::QuotaExceed,
            title: "Quota running low".to_string(),
            content: "{{value}}, remaining quota: {{value}}. Top up to avoid interruption: \
                      <a href='{{value}}'>{{value}}</a>"
                .to_string(),
            values: vec![
                prompt.to_string(),
                remaining.to_string(),
                topup_link.to_string(),
                topup_link.to_string(),
            ],
        }
    }

    /// Content with placeholders substituted. Surplus placeholders are kept
    /// verbatim; surplus values are ignored.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.content.len());
        let mut rest = self.content.as_str();
        let mut values = self.values.iter();
        while let Some(pos) = rest.find(VALUE_PLACEHOLDER) {
            out.push_str(&rest[..pos]);
            match values.next() {
                Some(value) => out.push_str(value),
                None => out.push_str(VALUE_PLACEHOLDER),
            }
            rest = &rest[pos + VALUE_PLACEHOLDER.len()..];
        }
        out.push_str(rest);
        out
    }
}

/// Who receives a notification and how they asked to be contacted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NotifyTarget {
    pub user_id: i64,
    pub email: Option<String>,
    pub setting: UserSetting,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: &NotifyTarget, message: &Notify) -> Result<(), NotifyError>;
}

/// Logs notifications instead of delivering them.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, target: &NotifyTarget, message: &Notify) -> Result<(), NotifyError> {
        tracing::info!(
            user_id = target.user_id,
            title = %message.title,
            content = %message.render(),
            "user notification"
        );
        Ok(())
    }
}

struct NotifyJob {
    target: NotifyTarget,
    message: Notify,
}

/// Bounded hand-off to a detached worker. Submission never blocks; when the
/// queue is full the notification is dropped.
#[derive(Clone, Debug)]
pub struct NotifyQueue {
    tx: mpsc::Sender<NotifyJob>,
}

impl std::fmt::Debug for NotifyJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyJob")
            .field("user_id", &self.target.user_id)
            .field("kind", &self.message.kind)
            .finish()
    }
}

impl NotifyQueue {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<NotifyJob>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = notifier.notify(&job.target, &job.message).await {
                    tracing::warn!(
                        user_id = job.target.user_id,
                        error = %err,
                        "failed to deliver notification"
                    );
                }
            }
        });
        Self { tx }
    }

    pub fn submit(&self, target: NotifyTarget, message: Notify) {
        let user_id = target.user_id;
        match self.tx.try_send(NotifyJob { target, message }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(user_id, "notification queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(user_id, "notification worker stopped, dropping notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, target: &NotifyTarget, message: &Notify) -> Result<(), NotifyError> {
            self.seen
                .lock()
                .await
                .push((target.user_id, message.render()));
            Ok(())
        }
    }

    #[test]
    fn renders_values_in_order() {
        let notify = Notify::quota_exceed("Your quota is low", "$0.001000", "https://x/topup");
        assert_eq!(
            notify.render(),
            "Your quota is low, remaining quota: $0.001000. Top up to avoid interruption: \
             <a href='https://x/topup'>https://x/topup</a>"
        );
    }

    #[test]
    fn missing_values_keep_placeholders() {
        let notify = Notify {
            kind: NotifyKind::QuotaExceed,
            title: String::new(),
            content: "{{value}} and {{value}}".into(),
            values: vec!["one".into()],
        };
        assert_eq!(notify.render(), "one and {{value}}");
    }

    #[tokio::test]
    async fn queue_delivers_in_background() {
        let recorder = Arc::new(Recorder::default());
        let queue = NotifyQueue::spawn(recorder.clone(), 4);
        queue.submit(
            NotifyTarget {
                user_id: 7,
                ..NotifyTarget::default()
            },
            Notify::quota_exceed("low", "1", "link"),
        );

        for _ in 0..50 {
            if !recorder.seen.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = recorder.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 7);
    }
}
