use std::time::Duration;

use tracing::warn;

use crate::app::config::NotifySettings;
use crate::app::models::{BatchResult, Outcome};
use crate::app::workflow::batch::ResultSink;
use crate::app::workflow::mask::mask_identifier;

/// Pushes outcome summaries to an enterprise-chat webhook. Delivery is
/// strictly best-effort: a failed post is logged and forgotten, it never
/// feeds back into the batch.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    /// Returns None when no webhook is configured.
    pub fn from_settings(settings: &NotifySettings) -> Option<Self> {
        let url = settings.webhook_url.trim();
        if url.is_empty() {
            return None;
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;
        Some(Self {
            client,
            webhook_url: url.to_string(),
        })
    }

    fn post_text(&self, content: &str) {
        let payload = serde_json::json!({
            "msgtype": "text",
            "text": { "content": content }
        });
        match self.client.post(&self.webhook_url).json(&payload).send() {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "webhook rejected notification");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "failed to deliver webhook notification");
            }
        }
    }
}

impl ResultSink for WebhookNotifier {
    fn on_account_result(&self, identifier: &str, outcome: &Outcome) {
        self.post_text(&format_account_message(identifier, outcome));
    }

    fn on_batch_finished(&self, result: &BatchResult) {
        self.post_text(&format_batch_message(result));
    }
}

pub fn format_account_message(identifier: &str, outcome: &Outcome) -> String {
    let shown = mask_identifier(identifier, "notify")
        .unwrap_or_else(|_| "(未能脱敏的账户)".to_string());
    match outcome {
        Outcome::Success => format!("【自动申购】账户 {shown}：申购成功"),
        Outcome::Failure { reason, .. } => {
            format!("【自动申购】账户 {shown}：申购失败（{reason}）")
        }
    }
}

pub fn format_batch_message(result: &BatchResult) -> String {
    let mut message = format!(
        "【自动申购】本次共处理 {} 个账户，成功 {}，失败 {}",
        result.outcomes.len(),
        result.success_count(),
        result.failure_count()
    );
    if result.cancelled {
        message.push_str("（批次被取消）");
    }
    message
}
