use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{Notifier, Notify, NotifyError, NotifyTarget};
use crate::store::{NotifyType, now_millis};

/// Posts notifications to the webhook configured in the user's settings.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, target: &NotifyTarget, message: &Notify) -> Result<(), NotifyError> {
        if target.setting.notify_type != NotifyType::Webhook {
            return Err(NotifyError::Unsupported(format!(
                "user {} prefers email notifications",
                target.user_id
            )));
        }
        let Some(url) = target
            .setting
            .webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
        else {
            return Err(NotifyError::Unsupported(format!(
                "user {} has no webhook url",
                target.user_id
            )));
        };

        let payload = json!({
            "type": message.kind,
            "title": message.title,
            "content": message.content,
            "values": message.values,
            "timestamp": now_millis() / 1000,
        });
        let mut request = self.client.post(url).timeout(self.timeout).json(&payload);
        if let Some(secret) = target.setting.webhook_secret.as_deref() {
            request = request.bearer_auth(secret);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        tracing::debug!(user_id = target.user_id, "webhook notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserSetting;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn posts_payload_with_secret() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("authorization", "Bearer s3cret")
                    .body_includes("\"quota_exceed\"");
                then.status(204);
            })
            .await;

        let notifier = WebhookNotifier::new(reqwest::Client::new(), Duration::from_secs(5));
        let target = NotifyTarget {
            user_id: 1,
            email: None,
            setting: UserSetting {
                notify_type: NotifyType::Webhook,
                webhook_url: Some(server.url("/hook")),
                webhook_secret: Some("s3cret".into()),
                ..UserSetting::default()
            },
        };
        notifier
            .notify(&target, &Notify::quota_exceed("low", "$1", "https://x"))
            .await
            .expect("delivered");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn email_preference_is_unsupported() {
        let notifier = WebhookNotifier::new(reqwest::Client::new(), Duration::from_secs(5));
        let err = notifier
            .notify(
                &NotifyTarget::default(),
                &Notify::quota_exceed("low", "$1", "https://x"),
            )
            .await
            .expect_err("email");
        assert!(matches!(err, NotifyError::Unsupported(_)));
    }
}
